use serde::{Deserialize, Serialize};

/// Query string for `/ask` and `/ask-stream`.
#[derive(Debug, Deserialize)]
pub struct AskQuery {
    pub question: String,
    /// Only consulted by `/ask-stream`.
    #[serde(default)]
    pub conversation_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
}
