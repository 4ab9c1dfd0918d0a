use garde::Validate;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// How the engine treats pages that already carry a text layer.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, EnumString, Display, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum OcrMode {
    #[default]
    Normal,
    SkipText,
    ForceOcr,
    RedoOcr,
}

/// Output document flavour.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, EnumString, Display, PartialEq, Eq)]
pub enum OutputType {
    #[serde(rename = "pdf")]
    #[strum(serialize = "pdf")]
    Pdf,
    #[default]
    #[serde(rename = "pdfa")]
    #[strum(serialize = "pdfa")]
    Pdfa,
    #[serde(rename = "pdfa-1")]
    #[strum(serialize = "pdfa-1")]
    Pdfa1,
    #[serde(rename = "pdfa-2")]
    #[strum(serialize = "pdfa-2")]
    Pdfa2,
    #[serde(rename = "pdfa-3")]
    #[strum(serialize = "pdfa-3")]
    Pdfa3,
}

impl OutputType {
    pub fn is_pdfa(self) -> bool {
        !matches!(self, OutputType::Pdf)
    }
}

/// Image compression applied during PDF/A conversion. `Auto` lets the
/// converter pick per image.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, EnumString, Display, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PdfaCompression {
    #[default]
    Auto,
    Jpeg,
    Lossless,
}

/// Colour conversion applied when rewriting the PDF.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, EnumString, Display, PartialEq, Eq)]
pub enum ColorConversionStrategy {
    #[serde(rename = "CMYK")]
    #[strum(serialize = "CMYK")]
    Cmyk,
    Gray,
    #[default]
    LeaveColorUnchanged,
    #[serde(rename = "RGB")]
    #[strum(serialize = "RGB")]
    Rgb,
    UseDeviceIndependentColor,
}

/// Fully resolved options for one engine invocation.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
pub struct OcrOptions {
    #[garde(length(min = 1, max = 8), custom(valid_language_codes))]
    pub languages: Vec<String>,

    #[garde(skip)]
    pub mode: OcrMode,

    #[garde(skip)]
    pub deskew: bool,

    #[garde(skip)]
    pub clean: bool,

    #[garde(skip)]
    pub clean_final: bool,

    #[garde(skip)]
    pub rotate_pages: bool,

    #[garde(skip)]
    pub output_type: OutputType,

    #[garde(range(min = 0, max = 3))]
    pub optimize: u8,

    #[garde(skip)]
    pub pdfa_image_compression: PdfaCompression,

    #[garde(skip)]
    pub color_conversion_strategy: ColorConversionStrategy,
}

fn valid_language_codes(value: &[String], _ctx: &()) -> garde::Result {
    for code in value {
        let well_formed = (2..=16).contains(&code.len())
            && code.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !well_formed {
            return Err(garde::Error::new(format!("invalid language code `{code}`")));
        }
    }
    Ok(())
}

impl Default for OcrOptions {
    fn default() -> Self {
        Self {
            languages: vec!["eng".to_string()],
            mode: OcrMode::default(),
            deskew: false,
            clean: false,
            clean_final: false,
            rotate_pages: false,
            output_type: OutputType::default(),
            optimize: 1,
            pdfa_image_compression: PdfaCompression::default(),
            color_conversion_strategy: ColorConversionStrategy::default(),
        }
    }
}

impl OcrOptions {
    /// Split a `+`-separated language list (`eng+deu`).
    pub fn parse_languages(raw: &str) -> Vec<String> {
        raw.split('+')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Command-line arguments for the engine, excluding the input and output paths.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![
            "-l".to_string(),
            self.languages.join("+"),
            "--output-type".to_string(),
            self.output_type.to_string(),
            "--optimize".to_string(),
            self.optimize.to_string(),
        ];

        match self.mode {
            OcrMode::Normal => {}
            OcrMode::SkipText => args.push("--skip-text".to_string()),
            OcrMode::ForceOcr => args.push("--force-ocr".to_string()),
            OcrMode::RedoOcr => args.push("--redo-ocr".to_string()),
        }

        for (enabled, flag) in [
            (self.deskew, "--deskew"),
            (self.clean, "--clean"),
            (self.clean_final, "--clean-final"),
            (self.rotate_pages, "--rotate-pages"),
        ] {
            if enabled {
                args.push(flag.to_string());
            }
        }

        if self.output_type.is_pdfa() && self.pdfa_image_compression != PdfaCompression::Auto {
            args.push("--pdfa-image-compression".to_string());
            args.push(self.pdfa_image_compression.to_string());
        }

        if self.color_conversion_strategy != ColorConversionStrategy::LeaveColorUnchanged {
            args.push("--color-conversion-strategy".to_string());
            args.push(self.color_conversion_strategy.to_string());
        }

        args
    }
}

const FORM_FIELDS: &[&str] = &[
    "language",
    "mode",
    "deskew",
    "clean",
    "clean_final",
    "rotate_pages",
    "output_type",
    "optimize",
    "pdfa_image_compression",
    "color_conversion_strategy",
];

/// Per-submission overrides layered on top of the configured defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct OcrOptionsPatch {
    /// `+`-separated, e.g. `eng+fra`.
    pub language: Option<String>,
    pub mode: Option<OcrMode>,
    pub deskew: Option<bool>,
    pub clean: Option<bool>,
    pub clean_final: Option<bool>,
    pub rotate_pages: Option<bool>,
    pub output_type: Option<OutputType>,
    pub optimize: Option<u8>,
    pub pdfa_image_compression: Option<PdfaCompression>,
    pub color_conversion_strategy: Option<ColorConversionStrategy>,
}

impl OcrOptionsPatch {
    /// Set one override from a textual form field.
    ///
    /// Returns `Ok(false)` when `name` is not an option field.
    pub fn set_field(&mut self, name: &str, value: &str) -> Result<bool, OptionsError> {
        if !FORM_FIELDS.contains(&name) {
            return Ok(false);
        }
        let value = value.trim();
        // Blank form controls mean "use the default".
        if value.is_empty() {
            return Ok(true);
        }
        match name {
            "language" => self.language = Some(value.to_string()),
            "mode" => self.mode = Some(parse_enum(name, value)?),
            "deskew" => self.deskew = Some(parse_flag(name, value)?),
            "clean" => self.clean = Some(parse_flag(name, value)?),
            "clean_final" => self.clean_final = Some(parse_flag(name, value)?),
            "rotate_pages" => self.rotate_pages = Some(parse_flag(name, value)?),
            "output_type" => self.output_type = Some(parse_enum(name, value)?),
            "optimize" => {
                let level = value.parse().map_err(|_| OptionsError::InvalidValue {
                    field: name.to_string(),
                    value: value.to_string(),
                })?;
                self.optimize = Some(level);
            }
            "pdfa_image_compression" => self.pdfa_image_compression = Some(parse_enum(name, value)?),
            "color_conversion_strategy" => {
                self.color_conversion_strategy = Some(parse_enum(name, value)?)
            }
            _ => return Ok(false),
        }
        Ok(true)
    }

    /// Merge a JSON override on top of this one; fields set in `other` win.
    pub fn merge(&mut self, other: OcrOptionsPatch) {
        macro_rules! take {
            ($($field:ident),*) => {
                $(if other.$field.is_some() { self.$field = other.$field; })*
            };
        }
        take!(
            language,
            mode,
            deskew,
            clean,
            clean_final,
            rotate_pages,
            output_type,
            optimize,
            pdfa_image_compression,
            color_conversion_strategy
        );
    }

    /// Apply the overrides to `base` and validate the result.
    pub fn apply(&self, base: &OcrOptions) -> Result<OcrOptions, OptionsError> {
        let mut options = base.clone();
        if let Some(language) = &self.language {
            options.languages = OcrOptions::parse_languages(language);
        }
        options.mode = self.mode.unwrap_or(options.mode);
        options.deskew = self.deskew.unwrap_or(options.deskew);
        options.clean = self.clean.unwrap_or(options.clean);
        options.clean_final = self.clean_final.unwrap_or(options.clean_final);
        options.rotate_pages = self.rotate_pages.unwrap_or(options.rotate_pages);
        options.output_type = self.output_type.unwrap_or(options.output_type);
        options.optimize = self.optimize.unwrap_or(options.optimize);
        options.pdfa_image_compression = self
            .pdfa_image_compression
            .unwrap_or(options.pdfa_image_compression);
        options.color_conversion_strategy = self
            .color_conversion_strategy
            .unwrap_or(options.color_conversion_strategy);

        options.validate().map_err(|report| OptionsError::Invalid(report.to_string()))?;
        Ok(options)
    }
}

fn parse_enum<T: std::str::FromStr>(field: &str, value: &str) -> Result<T, OptionsError> {
    value.parse().map_err(|_| OptionsError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
    })
}

fn parse_flag(field: &str, value: &str) -> Result<bool, OptionsError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(OptionsError::InvalidValue {
            field: field.to_string(),
            value: value.to_string(),
        }),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OptionsError {
    #[error("Invalid value `{value}` for option `{field}`")]
    InvalidValue { field: String, value: String },

    #[error("Invalid OCR options: {0}")]
    Invalid(String),

    #[error("Malformed options document: {0}")]
    Json(#[from] serde_json::Error),
}
