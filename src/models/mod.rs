pub mod api;
pub mod job;
pub mod options;
pub mod result;
