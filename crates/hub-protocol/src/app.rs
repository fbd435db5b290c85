//! App identity carried in the handshake and the apps table.

use serde::{Deserialize, Serialize};

use crate::identifier::Identifier;

/// A connecting client.  One live session per app identifier at a time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct App {
    pub identifier: Identifier,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Free-form descriptive metadata (name, description, authors, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl App {
    pub fn new(identifier: Identifier) -> Self {
        Self {
            identifier,
            version: None,
            url: None,
            metadata: None,
        }
    }

    pub fn key(&self) -> String {
        self.identifier.key()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn optional_fields_are_omitted_and_defaulted() {
        let app = App::new(Identifier::from_key("test.a:x").unwrap());
        let json = serde_json::to_value(&app).unwrap();
        assert_eq!(json, serde_json::json!({"identifier": "test.a:x"}));
        let back: App = serde_json::from_value(json).unwrap();
        assert_eq!(back, app);
    }
}
