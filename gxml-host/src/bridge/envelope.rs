//! Envelope split of a decoded frame payload.
//!
//! Every frame carries a UTF-8 JSON line terminated by `\n`, then an
//! optional binary trailer. For render responses the line is metadata and
//! the trailer is geometry; for command responses the line is the whole
//! result and the trailer is empty. An `error` key in the line marks the
//! response as failed either way.

use bytes::Bytes;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnvelopeError {
    #[error("invalid response format: missing metadata separator")]
    MissingSeparator,
    #[error("malformed metadata: {0}")]
    MalformedMetadata(String),
}

/// One frame payload split into its parsed JSON line and binary trailer.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub meta: Value,
    pub data: Bytes,
}

impl Envelope {
    /// Split `payload` at the first newline and parse everything before it
    /// as JSON. The trailer keeps its backing buffer; no copy is made.
    pub fn parse(payload: Bytes) -> Result<Envelope, EnvelopeError> {
        let split = payload
            .iter()
            .position(|byte| *byte == b'\n')
            .ok_or(EnvelopeError::MissingSeparator)?;
        let meta = serde_json::from_slice(&payload[..split])
            .map_err(|e| EnvelopeError::MalformedMetadata(e.to_string()))?;
        let data = payload.slice(split + 1..);
        Ok(Envelope { meta, data })
    }

    /// The worker's error message, when the response carries a non-empty
    /// `error` field.
    pub fn error(&self) -> Option<&str> {
        self.meta
            .get("error")
            .and_then(Value::as_str)
            .filter(|message| !message.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_meta_from_trailer_at_first_newline() {
        let payload = Bytes::from_static(b"{\"timings\":{}}\n\x01\x02\n\x03");

        let envelope = Envelope::parse(payload).unwrap();
        assert_eq!(envelope.meta, serde_json::json!({"timings": {}}));
        assert_eq!(&envelope.data[..], b"\x01\x02\n\x03");
    }

    #[test]
    fn command_responses_have_an_empty_trailer() {
        let payload = Bytes::from_static(b"{\"backend\":\"c\"}\n");

        let envelope = Envelope::parse(payload).unwrap();
        assert_eq!(envelope.meta["backend"], "c");
        assert!(envelope.data.is_empty());
    }

    #[test]
    fn missing_newline_is_invalid_response_format() {
        let err = Envelope::parse(Bytes::from_static(b"{\"ok\":true}")).unwrap_err();

        assert_eq!(err, EnvelopeError::MissingSeparator);
        assert!(err.to_string().contains("invalid response format"));
    }

    #[test]
    fn unparseable_meta_line_is_reported() {
        let err = Envelope::parse(Bytes::from_static(b"not json\ntrailer")).unwrap_err();

        assert!(matches!(err, EnvelopeError::MalformedMetadata(_)));
        assert!(err.to_string().starts_with("malformed metadata"));
    }

    #[test]
    fn error_field_must_be_a_non_empty_string() {
        let failed = Envelope::parse(Bytes::from_static(b"{\"error\":\"backend died\"}\n")).unwrap();
        assert_eq!(failed.error(), Some("backend died"));

        let empty = Envelope::parse(Bytes::from_static(b"{\"error\":\"\"}\n")).unwrap();
        assert_eq!(empty.error(), None);

        let absent = Envelope::parse(Bytes::from_static(b"{\"timings\":{}}\n")).unwrap();
        assert_eq!(absent.error(), None);
    }

    #[test]
    fn trailer_shares_the_frame_buffer() {
        let payload = Bytes::from_static(b"{}\nGXML rest");

        let envelope = Envelope::parse(payload.clone()).unwrap();
        // slice() of the same Bytes, not a copy
        assert_eq!(envelope.data.as_ptr(), payload[3..].as_ptr());
    }
}
