//! Envelope and frame types.
//!
//! Envelopes are the JSON payloads published on broker channels. The channel
//! a payload travels on decides its shape, so envelopes carry no type tag.
//!
//! Relay frames are what a [`RelayClient`](crate::RelayClient) and the
//! [`RelayServer`](crate::RelayServer) exchange over TCP. Each frame is
//! prefixed with a 4-byte big-endian length header.

use crate::channel::Event;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Payload of `rp:message`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    /// Sender pid.
    pub pid: String,
    /// User-level event name.
    pub event: String,
    /// Arbitrary payload.
    #[serde(default)]
    pub data: Value,
}

/// Payload of `rp:call`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallEnvelope {
    /// `"<callerPid>:<correlationId>"`.
    pub id: String,
    /// Method name.
    pub name: String,
    /// Positional arguments.
    #[serde(default)]
    pub args: Vec<Value>,
}

impl CallEnvelope {
    /// Build an envelope, joining caller pid and correlation id.
    pub fn new(caller: &str, request_id: &str, name: &str, args: Vec<Value>) -> Self {
        Self {
            id: format!("{caller}:{request_id}"),
            name: name.to_string(),
            args,
        }
    }

    /// Split the id into the caller pid and the correlation id.
    ///
    /// The correlation id never contains `:`, so the split is taken at the
    /// last separator and pids containing `:` survive. An id without a
    /// separator, or with an empty correlation part, has no correlation id.
    pub fn caller(&self) -> (&str, Option<&str>) {
        match self.id.rsplit_once(':') {
            Some((pid, request_id)) if !request_id.is_empty() => (pid, Some(request_id)),
            Some((pid, _)) => (pid, None),
            None => (self.id.as_str(), None),
        }
    }
}

/// Payload of `rp:response`. Exactly one of `error` and `data` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseEnvelope {
    /// Correlation id of the call being answered.
    pub request_id: String,
    /// Remote execution error message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Handler result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ResponseEnvelope {
    /// Successful response.
    pub fn ok(request_id: &str, data: Value) -> Self {
        Self {
            request_id: request_id.to_string(),
            error: None,
            data: Some(data),
        }
    }

    /// Failed response.
    pub fn err(request_id: &str, error: String) -> Self {
        Self {
            request_id: request_id.to_string(),
            error: Some(error),
            data: None,
        }
    }
}

/// A decoded channel payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    /// Sender pid of a presence announcement.
    Connect(String),
    /// Sender pid of a presence reply.
    Info(String),
    /// Sender pid of a departure announcement.
    Disconnect(String),
    Message(MessageEnvelope),
    Call(CallEnvelope),
    Response(ResponseEnvelope),
}

impl Envelope {
    /// The channel family this envelope travels on.
    pub fn event(&self) -> Event {
        match self {
            Envelope::Connect(_) => Event::Connect,
            Envelope::Info(_) => Event::Info,
            Envelope::Disconnect(_) => Event::Disconnect,
            Envelope::Message(_) => Event::Message,
            Envelope::Call(_) => Event::Call,
            Envelope::Response(_) => Event::Response,
        }
    }

    /// Serialize the payload to JSON bytes.
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        match self {
            Envelope::Connect(pid) | Envelope::Info(pid) | Envelope::Disconnect(pid) => {
                serde_json::to_vec(pid)
            }
            Envelope::Message(m) => serde_json::to_vec(m),
            Envelope::Call(c) => serde_json::to_vec(c),
            Envelope::Response(r) => serde_json::to_vec(r),
        }
    }

    /// Parse a payload received on a channel of family `event`.
    pub fn decode(event: Event, payload: &[u8]) -> Result<Self, serde_json::Error> {
        Ok(match event {
            Event::Connect => Envelope::Connect(serde_json::from_slice(payload)?),
            Event::Info => Envelope::Info(serde_json::from_slice(payload)?),
            Event::Disconnect => Envelope::Disconnect(serde_json::from_slice(payload)?),
            Event::Message => Envelope::Message(serde_json::from_slice(payload)?),
            Event::Call => Envelope::Call(serde_json::from_slice(payload)?),
            Event::Response => Envelope::Response(serde_json::from_slice(payload)?),
        })
    }
}

/// Frames exchanged with the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RelayFrame {
    /// Client → relay: start receiving these channels.
    #[serde(rename = "subscribe")]
    Subscribe { channels: Vec<String> },
    /// Client → relay: stop receiving these channels.
    #[serde(rename = "unsubscribe")]
    Unsubscribe { channels: Vec<String> },
    /// Client → relay: deliver a payload to every subscriber of `channel`.
    #[serde(rename = "publish")]
    Publish { channel: String, payload: String },
    /// Relay → client: a payload published on a subscribed channel.
    #[serde(rename = "message")]
    Message { channel: String, payload: String },
}

impl RelayFrame {
    /// A publish frame with a base64-encoded payload.
    pub fn publish(channel: &str, payload: &[u8]) -> Self {
        RelayFrame::Publish {
            channel: channel.to_string(),
            payload: encode_payload(payload),
        }
    }

    /// A delivery frame with a base64-encoded payload.
    pub fn message(channel: &str, payload: &[u8]) -> Self {
        RelayFrame::Message {
            channel: channel.to_string(),
            payload: encode_payload(payload),
        }
    }
}

/// Base64-encode a payload for a relay frame.
pub fn encode_payload(payload: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(payload)
}

/// Decode a relay frame payload.
pub fn decode_payload(payload: &str) -> Result<Vec<u8>, base64::DecodeError> {
    base64::engine::general_purpose::STANDARD.decode(payload)
}

/// Encode a frame to bytes (4-byte big-endian length + JSON).
pub fn encode_frame(frame: &RelayFrame) -> Result<Vec<u8>, serde_json::Error> {
    let json = serde_json::to_vec(frame)?;
    let len = json.len() as u32;
    let mut bytes = Vec::with_capacity(4 + json.len());
    bytes.extend_from_slice(&len.to_be_bytes());
    bytes.extend_from_slice(&json);
    Ok(bytes)
}

/// Decode the length prefix from a 4-byte header.
pub fn decode_length(header: &[u8; 4]) -> u32 {
    u32::from_be_bytes(*header)
}

/// Parse a JSON body into a frame.
pub fn decode_frame(body: &[u8]) -> Result<RelayFrame, serde_json::Error> {
    serde_json::from_slice(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_presence_envelope_is_bare_string() {
        let bytes = Envelope::Connect("p1".to_string()).encode().unwrap();
        assert_eq!(bytes, br#""p1""#);
        let decoded = Envelope::decode(Event::Disconnect, &bytes).unwrap();
        assert_eq!(decoded, Envelope::Disconnect("p1".to_string()));
    }

    #[test]
    fn test_call_envelope_wire_shape() {
        let call = CallEnvelope::new("p1", "7-ab", "sum", vec![json!(20), json!(30)]);
        let value: Value = serde_json::from_slice(&Envelope::Call(call).encode().unwrap()).unwrap();
        assert_eq!(value, json!({"id": "p1:7-ab", "name": "sum", "args": [20, 30]}));
    }

    #[test]
    fn test_call_caller_split() {
        let call = CallEnvelope::new("host:42", "9-ff", "sum", vec![]);
        assert_eq!(call.caller(), ("host:42", Some("9-ff")));

        let no_id = CallEnvelope {
            id: "p1".to_string(),
            name: "inc".to_string(),
            args: vec![],
        };
        assert_eq!(no_id.caller(), ("p1", None));
    }

    #[test]
    fn test_response_omits_absent_fields() {
        let ok = Envelope::Response(ResponseEnvelope::ok("1", json!(51)));
        let value: Value = serde_json::from_slice(&ok.encode().unwrap()).unwrap();
        assert_eq!(value, json!({"requestId": "1", "data": 51}));

        let err = Envelope::Response(ResponseEnvelope::err("2", "boom".to_string()));
        let value: Value = serde_json::from_slice(&err.encode().unwrap()).unwrap();
        assert_eq!(value, json!({"requestId": "2", "error": "boom"}));
    }

    #[test]
    fn test_message_envelope_missing_data_is_null() {
        let decoded = Envelope::decode(Event::Message, br#"{"pid":"p2","event":"ping"}"#).unwrap();
        match decoded {
            Envelope::Message(m) => {
                assert_eq!(m.pid, "p2");
                assert_eq!(m.data, Value::Null);
            }
            other => panic!("Expected Message, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_rejects_wrong_shape() {
        assert!(Envelope::decode(Event::Call, br#""p1""#).is_err());
    }

    #[test]
    fn test_frame_encoding() {
        let frame = RelayFrame::publish("rp:call:p2", br#"{"x":1}"#);
        let bytes = encode_frame(&frame).unwrap();
        let len = decode_length(&[bytes[0], bytes[1], bytes[2], bytes[3]]);
        assert_eq!(len as usize, bytes.len() - 4);
        let decoded = decode_frame(&bytes[4..]).unwrap();
        match decoded {
            RelayFrame::Publish { channel, payload } => {
                assert_eq!(channel, "rp:call:p2");
                assert_eq!(decode_payload(&payload).unwrap(), br#"{"x":1}"#);
            }
            other => panic!("Expected Publish, got {other:?}"),
        }
    }

    #[test]
    fn test_frame_type_tag() {
        let json = serde_json::to_string(&RelayFrame::Subscribe {
            channels: vec!["rp:connect".to_string()],
        })
        .unwrap();
        assert!(json.contains(r#""type":"subscribe""#));
    }
}
