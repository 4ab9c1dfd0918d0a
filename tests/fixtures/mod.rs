//! Sample documents for dispatcher, watcher and webservice tests

/// Smallest PDF the upload endpoint will accept (it only checks the header).
pub const MINIMAL_PDF: &[u8] = b"%PDF-1.4\n1 0 obj\n<< /Type /Catalog /Pages 2 0 R >>\nendobj\n\
2 0 obj\n<< /Type /Pages /Kids [3 0 R] /Count 1 >>\nendobj\n\
3 0 obj\n<< /Type /Page /Parent 2 0 R /MediaBox [0 0 612 792] >>\nendobj\n\
trailer\n<< /Root 1 0 R >>\n%%EOF\n";

/// PNG signature and IHDR chunk header, enough for content sniffing.
pub const PNG_HEADER: &[u8] = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR\0\0\0\x01\0\0\0\x01\x08\x02\0\0\0";

/// Prefix the fake engine writes in front of the input bytes.
pub const OCR_MARKER: &[u8] = b"%PDF-1.7 ocr\n";

/// Something that is neither a PDF nor a supported image.
pub const PLAIN_TEXT: &[u8] = b"just some notes, not a document\n";
