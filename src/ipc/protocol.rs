//! Wire types and newline-delimited JSON framing.
//!
//! Payloads are opaque bytes, carried as base64 strings. A request wraps them
//! as `{"data": "<base64>"}`; a response carries the base64 string directly.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

/// Largest accepted request frame, newline excluded.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// Request verb.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Action {
    Get,
    Put,
    Post,
    Delete,
    /// Any verb this server does not know; never routed.
    #[serde(other)]
    Unknown,
}

/// Response status, encoded on the wire as its number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum Status {
    Success = 0,
    BadRequest = 1,
    NotFound = 2,
    Internal = 3,
    Duplicate = 4,
}

impl From<Status> for u8 {
    fn from(status: Status) -> u8 {
        status as u8
    }
}

impl TryFrom<u8> for Status {
    type Error = String;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(Status::Success),
            1 => Ok(Status::BadRequest),
            2 => Ok(Status::NotFound),
            3 => Ok(Status::Internal),
            4 => Ok(Status::Duplicate),
            other => Err(format!("unknown status code {}", other)),
        }
    }
}

/// Optional byte string encoded as base64 (`null` when absent).
mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(b) => s.serialize_str(&STANDARD.encode(b)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        let encoded: Option<String> = Option::deserialize(d)?;
        encoded
            .map(|e| STANDARD.decode(e).map_err(serde::de::Error::custom))
            .transpose()
    }
}

/// Request payload block.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    #[serde(default, with = "base64_bytes")]
    pub data: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: String,
    pub action: Action,
    pub resource: String,
    #[serde(default)]
    pub payload: Option<Payload>,
}

impl Request {
    /// The raw payload bytes, empty when none were sent.
    pub fn body(&self) -> &[u8] {
        self.payload
            .as_ref()
            .and_then(|p| p.data.as_deref())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: String,
    pub status: Status,
    #[serde(default, with = "base64_bytes")]
    pub payload: Option<Vec<u8>>,
}

impl Response {
    /// A successful, empty response to `req`.
    pub fn for_request(req: &Request) -> Self {
        Self {
            id: req.id.clone(),
            status: Status::Success,
            payload: None,
        }
    }

    /// A failed response whose payload is the error message.
    pub fn failure(id: impl Into<String>, status: Status, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status,
            payload: Some(message.into().into_bytes()),
        }
    }

    pub fn fail(&mut self, status: Status, message: impl Into<String>) {
        self.status = status;
        self.payload = Some(message.into().into_bytes());
    }

    /// Mark the response successful with `data`, JSON-encoded, as payload.
    pub fn succeed<T: Serialize>(&mut self, data: &T) {
        match serde_json::to_vec(data) {
            Ok(payload) => {
                self.status = Status::Success;
                self.payload = Some(payload);
            }
            Err(e) => self.fail(Status::Internal, format!("failed to encode payload: {}", e)),
        }
    }
}

pub fn decode_request(frame: &[u8]) -> Result<Request, serde_json::Error> {
    serde_json::from_slice(frame)
}

/// Best-effort `id` of a frame that failed to decode as a [`Request`].
pub fn recover_id(frame: &[u8]) -> String {
    serde_json::from_slice::<Value>(frame)
        .ok()
        .and_then(|v| v.get("id").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_default()
}

pub fn encode_response(resp: &Response) -> Result<Vec<u8>, serde_json::Error> {
    let mut bytes = serde_json::to_vec(resp)?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// One unit read off a connection.
#[derive(Debug, PartialEq)]
pub enum Frame {
    Line(Vec<u8>),
    /// A line longer than [`MAX_FRAME_LEN`]; its bytes were discarded.
    Oversized,
    Eof,
}

/// Read the next newline-terminated frame.
///
/// An oversized line is consumed up to its newline so the next frame starts
/// clean. A final line without newline still counts as a frame.
pub async fn read_frame<R: AsyncBufRead + Unpin>(reader: &mut R) -> io::Result<Frame> {
    let mut line = Vec::new();
    let mut oversized = false;

    loop {
        let (used, done) = {
            let available = reader.fill_buf().await?;
            if available.is_empty() {
                return Ok(if oversized {
                    Frame::Oversized
                } else if line.is_empty() {
                    Frame::Eof
                } else {
                    Frame::Line(line)
                });
            }

            let (chunk, used, done) = match available.iter().position(|b| *b == b'\n') {
                Some(i) => (&available[..i], i + 1, true),
                None => (available, available.len(), false),
            };

            if !oversized {
                if line.len() + chunk.len() > MAX_FRAME_LEN {
                    oversized = true;
                    line = Vec::new();
                } else {
                    line.extend_from_slice(chunk);
                }
            }
            (used, done)
        };

        reader.consume(used);

        if done {
            return Ok(if oversized {
                Frame::Oversized
            } else {
                Frame::Line(line)
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::BufReader;

    #[test]
    fn test_request_decoding() {
        let frame = br#"{"id":"1","action":"GET","resource":"/server/all"}"#;
        let req = decode_request(frame).unwrap();
        assert_eq!(req.action, Action::Get);
        assert_eq!(req.resource, "/server/all");
        assert_eq!(req.payload, None);
        assert!(req.body().is_empty());

        // base64 of {"a":1}
        let frame =
            br#"{"id":"2","action":"PATCH","resource":"/","payload":{"data":"eyJhIjoxfQ=="}}"#;
        let req = decode_request(frame).unwrap();
        assert_eq!(req.action, Action::Unknown);
        assert_eq!(req.body(), br#"{"a":1}"#);

        let frame = br#"{"id":"3","action":"GET","resource":"/","payload":null}"#;
        assert!(decode_request(frame).unwrap().body().is_empty());

        assert!(decode_request(b"not json").is_err());
        assert!(decode_request(br#"{"action":"GET","resource":"/"}"#).is_err());
        let frame = br#"{"id":"4","action":"GET","resource":"/","payload":{"data":"%%%"}}"#;
        assert!(decode_request(frame).is_err());
    }

    #[test]
    fn test_client_frame_round_trip() {
        // Frame as produced by the desktop client's JSONEncoder
        let body = br#"{"host":"a.com","favorite":true}"#;
        let frame = json!({
            "id": "E621E1F8-C36C-495A-93FC-0C247A3E6E5F",
            "action": "PUT",
            "resource": "/server/favorite",
            "payload": {"data": "eyJob3N0IjoiYS5jb20iLCJmYXZvcml0ZSI6dHJ1ZX0="},
        });
        let req: Request = serde_json::from_value(frame.clone()).unwrap();
        assert_eq!(req.body(), body);
        assert_eq!(serde_json::to_value(&req).unwrap(), frame);

        let mut resp = Response::for_request(&req);
        resp.succeed(&json!({"ok": true}));
        let wire = serde_json::to_value(&resp).unwrap();
        assert_eq!(wire["id"], json!("E621E1F8-C36C-495A-93FC-0C247A3E6E5F"));
        assert_eq!(wire["payload"], json!("eyJvayI6dHJ1ZX0="));
    }

    #[test]
    fn test_status_is_numeric_on_the_wire() {
        let resp = Response::failure("7", Status::Duplicate, "Record already exists");
        let value = serde_json::to_value(&resp).unwrap();
        // base64 of the raw message bytes
        assert_eq!(
            value,
            json!({"id": "7", "status": 4, "payload": "UmVjb3JkIGFscmVhZHkgZXhpc3Rz"})
        );

        let back: Response = serde_json::from_value(value).unwrap();
        assert_eq!(back.status, Status::Duplicate);
        assert_eq!(back.payload.as_deref(), Some(&b"Record already exists"[..]));
        let unknown_status = json!({"id": "", "status": 9});
        assert!(serde_json::from_value::<Response>(unknown_status).is_err());
    }

    #[test]
    fn test_empty_response_payload_is_null() {
        let resp = Response::failure("x", Status::Success, "");
        assert_eq!(serde_json::to_value(&resp).unwrap()["payload"], json!(""));

        let req = decode_request(br#"{"id":"y","action":"GET","resource":"/"}"#).unwrap();
        let resp = Response::for_request(&req);
        assert_eq!(serde_json::to_value(&resp).unwrap()["payload"], Value::Null);
    }

    #[test]
    fn test_recover_id() {
        assert_eq!(recover_id(br#"{"id":"abc","action":42}"#), "abc");
        assert_eq!(recover_id(br#"{"id":5}"#), "");
        assert_eq!(recover_id(b"{broken"), "");
    }

    #[test]
    fn test_succeed_sets_payload() {
        let req = decode_request(br#"{"id":"x","action":"GET","resource":"/"}"#).unwrap();
        let mut resp = Response::for_request(&req);
        resp.succeed(&vec![1, 2, 3]);
        assert_eq!(resp.status, Status::Success);
        assert_eq!(resp.payload.as_deref(), Some(&b"[1,2,3]"[..]));
        assert_eq!(encode_response(&resp).unwrap().last(), Some(&b'\n'));
    }

    #[tokio::test]
    async fn test_read_frames() {
        let input: &[u8] = b"{\"a\":1}\n\n{\"b\":2}";
        let mut reader = BufReader::new(input);

        assert_eq!(
            read_frame(&mut reader).await.unwrap(),
            Frame::Line(b"{\"a\":1}".to_vec())
        );
        assert_eq!(read_frame(&mut reader).await.unwrap(), Frame::Line(Vec::new()));
        assert_eq!(
            read_frame(&mut reader).await.unwrap(),
            Frame::Line(b"{\"b\":2}".to_vec())
        );
        assert_eq!(read_frame(&mut reader).await.unwrap(), Frame::Eof);
    }

    #[tokio::test]
    async fn test_oversized_frame_is_skipped() {
        let mut input = vec![b'x'; MAX_FRAME_LEN + 10];
        input.push(b'\n');
        input.extend_from_slice(b"ok\n");
        // Small buffer so the long line spans many reads
        let mut reader = BufReader::with_capacity(1024, input.as_slice());

        assert_eq!(read_frame(&mut reader).await.unwrap(), Frame::Oversized);
        assert_eq!(
            read_frame(&mut reader).await.unwrap(),
            Frame::Line(b"ok".to_vec())
        );
        assert_eq!(read_frame(&mut reader).await.unwrap(), Frame::Eof);
    }
}
