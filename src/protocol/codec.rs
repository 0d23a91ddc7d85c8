use crate::protocol::{Request, Response};
use serde::Serialize;
use serde_json::Value;
use std::str::Utf8Error;

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("payload is not valid utf-8: {0}")]
    Utf8(#[from] Utf8Error),
    #[error("payload is not valid json: {0}")]
    Json(serde_json::Error),
    #[error("invalid envelope: {0}")]
    Envelope(serde_json::Error),
}

impl DecodeError {
    /// Protocol error code reported for this failure.
    pub fn code(&self) -> i64 {
        match self {
            DecodeError::Utf8(_) | DecodeError::Json(_) => super::PARSE_ERROR,
            DecodeError::Envelope(_) => super::INVALID_REQUEST,
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("encode envelope: {0}")]
pub struct EncodeError(#[from] serde_json::Error);

/// Serialize an envelope into a frame payload.
pub fn encode<T: Serialize>(envelope: &T) -> Result<Vec<u8>, EncodeError> {
    Ok(serde_json::to_vec(envelope)?)
}

fn parse(payload: &[u8]) -> Result<Value, DecodeError> {
    let text = std::str::from_utf8(payload)?;
    serde_json::from_str(text).map_err(DecodeError::Json)
}

/// Deserialize a frame payload into a request.
pub fn decode_request(payload: &[u8]) -> Result<Request, DecodeError> {
    serde_json::from_value(parse(payload)?).map_err(DecodeError::Envelope)
}

/// Deserialize a frame payload into a response.
pub fn decode_response(payload: &[u8]) -> Result<Response, DecodeError> {
    serde_json::from_value(parse(payload)?).map_err(DecodeError::Envelope)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::protocol::{Outcome, INTERNAL_ERROR, INVALID_REQUEST, PARSE_ERROR};
    use serde_json::json;

    #[test]
    fn test_request_round_trip() {
        let requests = [
            Request::new(
                "read_memory",
                json!({"address": "0x401000", "size": 16, "nested": {"a": [1, 2.5, null, true]}})
                    .as_object()
                    .unwrap()
                    .clone(),
                json!(7),
            ),
            Request::new("ping", Default::default(), json!("req-1")),
            Request::new("ping", Default::default(), Value::Null),
            Request {
                jsonrpc: Some("2.0".to_string()),
                method: "ping".to_string(),
                params: Default::default(),
                id: None,
            },
        ];

        for request in requests {
            let bytes = encode(&request).unwrap();
            assert_eq!(decode_request(&bytes).unwrap(), request);
        }
    }

    #[test]
    fn test_request_id_presence() {
        let notification = decode_request(br#"{"method":"ping"}"#).unwrap();
        assert!(notification.is_notification());
        assert!(notification.params.is_empty());

        let null_id = decode_request(br#"{"method":"ping","params":null,"id":null}"#).unwrap();
        assert_eq!(null_id.id, Some(Value::Null));
    }

    #[test]
    fn test_decode_garbage() {
        struct TestCase {
            payload: &'static [u8],
            code: i64,
        }

        let cases = [
            TestCase {
                payload: b"\xff\xfe\x00",
                code: PARSE_ERROR,
            },
            TestCase {
                payload: br#"{"method":"ping""#,
                code: PARSE_ERROR,
            },
            TestCase {
                payload: b"",
                code: PARSE_ERROR,
            },
            TestCase {
                payload: br#"{"params":{}}"#,
                code: INVALID_REQUEST,
            },
            TestCase {
                payload: br#"[1, 2, 3]"#,
                code: INVALID_REQUEST,
            },
        ];

        for tc in cases {
            let err = decode_request(tc.payload).unwrap_err();
            assert_eq!(err.code(), tc.code, "payload: {:?}", tc.payload);
        }
    }

    #[test]
    fn test_deep_nesting_fails_fast() {
        let payload = format!(
            r#"{{"method":"ping","params":{{"v":{}{}}}}}"#,
            "[".repeat(10_000),
            "]".repeat(10_000)
        );
        assert!(decode_request(payload.as_bytes()).is_err());
    }

    #[test]
    fn test_response_shape() {
        let ok = Response::result(Some(json!(1)), json!({"success": true}));
        let value: Value = serde_json::from_slice(&encode(&ok).unwrap()).unwrap();
        assert_eq!(value, json!({"result": {"success": true}, "id": 1}));

        let err = Response::error(None, INTERNAL_ERROR, "boom");
        let value: Value = serde_json::from_slice(&encode(&err).unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"error": {"code": INTERNAL_ERROR, "message": "boom"}, "id": null})
        );

        let decoded = decode_response(&encode(&err).unwrap()).unwrap();
        assert!(matches!(decoded.outcome, Outcome::Error(ref e) if e.code == INTERNAL_ERROR));
    }
}
