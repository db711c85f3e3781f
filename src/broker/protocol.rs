//! Askpass wire protocol
//!
//! One JSON object per line, one request per connection. The field names are
//! load-bearing: external askpass programs (including the bundled
//! `lazytunnel-askpass` helper) speak exactly this shape.

use serde::{Deserialize, Serialize};

/// What a client wants the operator asked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptRequest {
    /// Prompt text, shown verbatim.
    pub prompt: String,
    /// Whether the typed input may be echoed.
    #[serde(default)]
    pub echo: bool,
}

/// The operator's answer. A cancelled prompt still gets a well-formed reply
/// so the client can tell "declined" from "broker broke".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptResponse {
    pub password: String,
    #[serde(default)]
    pub cancelled: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_echo_defaults_off() {
        let request: PromptRequest = serde_json::from_str(r#"{"prompt":"Password: "}"#).unwrap();
        assert_eq!(request.prompt, "Password: ");
        assert!(!request.echo);
    }

    #[test]
    fn test_cancelled_response_shape() {
        let response = PromptResponse { password: String::new(), cancelled: true };
        let json = serde_json::to_string(&response).unwrap();
        assert_eq!(json, r#"{"password":"","cancelled":true}"#);
    }
}
