use serde::{Deserialize, Serialize};

/// Body returned for every failed webservice request.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub classification: String,
    pub message: String,
}

/// Current load on the shared engine slots.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct DispatchStats {
    pub capacity: usize,
    pub queued: usize,
    pub in_flight: usize,
}
