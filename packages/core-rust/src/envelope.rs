use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// The only shape ever returned to an RPC caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub response_code: u16,
    pub response_data: Value,
}

impl ResponseEnvelope {
    #[must_use]
    pub fn new(response_code: u16, response_data: Value) -> Self {
        Self {
            response_code,
            response_data,
        }
    }

    #[must_use]
    pub fn ok(response_data: Value) -> Self {
        Self::new(200, response_data)
    }

    /// Envelope carrying `{"message": <message>}`.
    #[must_use]
    pub fn message(response_code: u16, message: impl Into<String>) -> Self {
        Self::new(response_code, json!({ "message": message.into() }))
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.response_code)
    }
}
