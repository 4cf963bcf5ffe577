//! Client key parsing.
//!
//! The bearer string itself is opaque; it carries an embedded base64url JSON
//! payload with a `dimension_id` used to scope the SDK-settings URL. An
//! unparseable payload is not an error: the SDK still operates, treating
//! `dimension_id` as absent and using `"default"` for URL composition.

use base64::Engine;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct ClientKeyPayload {
    dimension_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ClientKey {
    raw: String,
    dimension_id: Option<String>,
}

impl ClientKey {
    /// Parses `raw` once at construction. Never fails: an undecodable or
    /// non-JSON payload simply yields `dimension_id = None`.
    pub fn parse(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        let dimension_id = Self::decode_dimension_id(&raw);
        Self { raw, dimension_id }
    }

    fn decode_dimension_id(raw: &str) -> Option<String> {
        let payload_segment = raw.split('.').nth(1).unwrap_or(raw);
        let decoded = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(payload_segment)
            .ok()?;
        let payload: ClientKeyPayload = serde_json::from_slice(&decoded).ok()?;
        payload.dimension_id
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Dimension segment for the SDK-settings URL, or `"default"` when the
    /// payload is absent or unparseable.
    pub fn dimension_or_default(&self) -> &str {
        self.dimension_id.as_deref().unwrap_or("default")
    }
}

impl std::fmt::Display for ClientKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_payload(dimension_id: &str) -> String {
        let json = format!(r#"{{"dimension_id":"{dimension_id}"}}"#);
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(json)
    }

    #[test]
    fn parses_dimension_id_from_payload_segment() {
        let key = ClientKey::parse(format!("header.{}", encode_payload("dim_123")));
        assert_eq!(key.dimension_or_default(), "dim_123");
    }

    #[test]
    fn falls_back_to_default_on_garbage_payload() {
        let key = ClientKey::parse("not-a-real-key");
        assert_eq!(key.dimension_or_default(), "default");
    }

    #[test]
    fn falls_back_to_default_when_dimension_id_absent() {
        let payload = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode("{}");
        let key = ClientKey::parse(format!("header.{payload}"));
        assert_eq!(key.dimension_or_default(), "default");
    }

    #[test]
    fn as_str_returns_original_raw_key() {
        let key = ClientKey::parse("abc.def");
        assert_eq!(key.as_str(), "abc.def");
    }
}
