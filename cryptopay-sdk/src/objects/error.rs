//! Error body returned by every non-2xx API response.

use serde::{Deserialize, Serialize};

/// `{"error": "...", "retryable": false}`
///
/// `retryable` tells a client whether offering "Retry" makes sense.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiErrorBody {
    pub error: String,
    #[serde(default)]
    pub retryable: bool,
}
