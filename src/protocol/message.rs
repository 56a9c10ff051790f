//! Typed requests and replies.
//!
//! Each request is a JSON object tagged with `type`; each reply carries the
//! matching `*_reply` type plus an optional `code`/`message` status pair.
//!
//! # Example
//!
//! ```
//! use shm_store_client::protocol::{decode_reply, Request, GetNameReply};
//! use shm_store_client::codec::JsonCodec;
//!
//! let req = JsonCodec::encode(&Request::GetName { name: "frame", wait: false }).unwrap();
//! assert!(std::str::from_utf8(&req).unwrap().contains("get_name_request"));
//!
//! let reply: GetNameReply =
//!     decode_reply(br#"{"type":"get_name_reply","object_id":7}"#).unwrap();
//! assert_eq!(reply.object_id.as_u64(), 7);
//! ```

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::payload::Payload;
use super::status::StatusCode;
use crate::codec::JsonCodec;
use crate::error::{Result, StoreError};
use crate::types::{InstanceId, ObjectId};

/// Store flavour announced at registration.
pub const STORE_TYPE: &str = "Normal";

/// Requests understood by the store.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum Request<'a> {
    #[serde(rename = "register_request")]
    Register {
        version: &'a str,
        store_type: &'a str,
    },

    #[serde(rename = "create_buffer_request")]
    CreateBuffer { size: usize },

    #[serde(rename = "get_buffers_request")]
    GetBuffers {
        #[serde(rename = "id")]
        ids: &'a [ObjectId],
        num: usize,
        #[serde(rename = "unsafe")]
        unsafe_mode: bool,
    },

    #[serde(rename = "put_name_request")]
    PutName { object_id: ObjectId, name: &'a str },

    #[serde(rename = "get_name_request")]
    GetName { name: &'a str, wait: bool },

    #[serde(rename = "drop_name_request")]
    DropName { name: &'a str },

    #[serde(rename = "exit_request")]
    Exit,
}

impl<'a> Request<'a> {
    /// Build a register request for the given client version.
    pub fn register(version: &'a str) -> Self {
        Request::Register {
            version,
            store_type: STORE_TYPE,
        }
    }

    /// Build a batched get-buffers request.
    pub fn get_buffers(ids: &'a [ObjectId], unsafe_mode: bool) -> Self {
        Request::GetBuffers {
            ids,
            num: ids.len(),
            unsafe_mode,
        }
    }

    /// Wire name of this request.
    pub fn kind(&self) -> &'static str {
        match self {
            Request::Register { .. } => "register_request",
            Request::CreateBuffer { .. } => "create_buffer_request",
            Request::GetBuffers { .. } => "get_buffers_request",
            Request::PutName { .. } => "put_name_request",
            Request::GetName { .. } => "get_name_request",
            Request::DropName { .. } => "drop_name_request",
            Request::Exit => "exit_request",
        }
    }
}

/// A reply body with a fixed wire `type`.
pub trait Reply: DeserializeOwned {
    /// Expected value of the `type` field.
    const TYPE: &'static str;
}

/// Registration handshake reply.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RegisterReply {
    #[serde(default)]
    pub ipc_socket: String,
    #[serde(default)]
    pub rpc_endpoint: String,
    pub instance_id: InstanceId,
    pub version: String,
}

impl Reply for RegisterReply {
    const TYPE: &'static str = "register_reply";
}

/// Reply to a buffer allocation.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CreateBufferReply {
    pub id: ObjectId,
    pub created: Payload,
}

impl Reply for CreateBufferReply {
    const TYPE: &'static str = "create_buffer_reply";
}

/// Reply to a batched buffer lookup.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GetBuffersReply {
    #[serde(default)]
    pub payloads: Vec<Payload>,
}

impl Reply for GetBuffersReply {
    const TYPE: &'static str = "get_buffers_reply";
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PutNameReply {}

impl Reply for PutNameReply {
    const TYPE: &'static str = "put_name_reply";
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GetNameReply {
    pub object_id: ObjectId,
}

impl Reply for GetNameReply {
    const TYPE: &'static str = "get_name_reply";
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DropNameReply {}

impl Reply for DropNameReply {
    const TYPE: &'static str = "drop_name_reply";
}

/// Decode a reply, inspecting its status before its shape.
///
/// - nonzero `code` → [`StoreError::Status`]
/// - wrong `type` → [`StoreError::ConnectionCorrupted`]: the reply belongs to
///   some other request, so the stream is out of step
/// - missing or ill-typed fields → [`StoreError::Protocol`]
pub fn decode_reply<R: Reply>(bytes: &[u8]) -> Result<R> {
    let value = JsonCodec::decode_value(bytes)?;
    check_status(&value)?;

    match value.get("type").and_then(Value::as_str) {
        Some(kind) if kind == R::TYPE => {}
        Some(kind) => {
            return Err(StoreError::ConnectionCorrupted(format!(
                "expected {}, got {}",
                R::TYPE,
                kind
            )))
        }
        None => {
            return Err(StoreError::Protocol(format!(
                "reply without type, expected {}",
                R::TYPE
            )))
        }
    }

    serde_json::from_value(value)
        .map_err(|e| StoreError::Protocol(format!("malformed {}: {}", R::TYPE, e)))
}

/// Turn a nonzero `code` field into an error.
fn check_status(value: &Value) -> Result<()> {
    let code = match value.get("code") {
        None | Some(Value::Null) => return Ok(()),
        Some(code) => code.as_i64().ok_or_else(|| {
            StoreError::Protocol(format!("status code is not an integer: {}", code))
        })?,
    };

    let code = StatusCode::from_code(code);
    if code.is_ok() {
        return Ok(());
    }

    let message = value
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or_default();
    Err(StoreError::status(code, message))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(req: &Request<'_>) -> Value {
        serde_json::from_slice(&JsonCodec::encode(req).unwrap()).unwrap()
    }

    #[test]
    fn test_register_request_shape() {
        let v = encode(&Request::register("0.1.0"));
        assert_eq!(v["type"], "register_request");
        assert_eq!(v["version"], "0.1.0");
        assert_eq!(v["store_type"], "Normal");
    }

    #[test]
    fn test_get_buffers_request_shape() {
        let ids = [ObjectId::new(1), ObjectId::new(2)];
        let v = encode(&Request::get_buffers(&ids, true));
        assert_eq!(v["type"], "get_buffers_request");
        assert_eq!(v["id"], serde_json::json!([1, 2]));
        assert_eq!(v["num"], 2);
        assert_eq!(v["unsafe"], true);
    }

    #[test]
    fn test_name_request_shapes() {
        let v = encode(&Request::PutName {
            object_id: ObjectId::new(5),
            name: "n",
        });
        assert_eq!(v["type"], "put_name_request");
        assert_eq!(v["object_id"], 5);
        assert_eq!(v["name"], "n");

        let v = encode(&Request::GetName {
            name: "n",
            wait: true,
        });
        assert_eq!(v["type"], "get_name_request");
        assert_eq!(v["wait"], true);

        let v = encode(&Request::DropName { name: "n" });
        assert_eq!(v["type"], "drop_name_request");
    }

    #[test]
    fn test_exit_request_shape() {
        let v = encode(&Request::Exit);
        assert_eq!(v, serde_json::json!({"type": "exit_request"}));
        assert_eq!(Request::Exit.kind(), "exit_request");
    }

    #[test]
    fn test_decode_register_reply() {
        let reply: RegisterReply = decode_reply(
            br#"{"type":"register_reply","ipc_socket":"/tmp/s.sock",
                 "rpc_endpoint":"host:9600","instance_id":3,"version":"0.1.2"}"#,
        )
        .unwrap();
        assert_eq!(reply.ipc_socket, "/tmp/s.sock");
        assert_eq!(reply.rpc_endpoint, "host:9600");
        assert_eq!(reply.instance_id, 3);
        assert_eq!(reply.version, "0.1.2");
    }

    #[test]
    fn test_decode_create_buffer_reply() {
        let reply: CreateBufferReply = decode_reply(
            br#"{"type":"create_buffer_reply","id":9,"created":{
                 "object_id":9,"store_fd":4,"data_offset":0,"data_size":16,"map_size":64}}"#,
        )
        .unwrap();
        assert_eq!(reply.id, ObjectId::new(9));
        assert_eq!(reply.created.data_size, 16);
    }

    #[test]
    fn test_status_code_becomes_error() {
        let err = decode_reply::<GetNameReply>(
            br#"{"type":"get_name_reply","code":12,"message":"name 'x' not found"}"#,
        )
        .unwrap_err();
        assert!(err.is_object_not_exists());
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn test_unknown_status_is_generic_failure() {
        let err =
            decode_reply::<DropNameReply>(br#"{"type":"drop_name_reply","code":99}"#).unwrap_err();
        assert_eq!(err.status_code(), Some(StatusCode::UnknownError));
    }

    #[test]
    fn test_zero_code_is_success() {
        let reply: PutNameReply =
            decode_reply(br#"{"type":"put_name_reply","code":0}"#).unwrap();
        assert_eq!(reply, PutNameReply {});
    }

    #[test]
    fn test_wrong_type_is_corruption() {
        let err = decode_reply::<PutNameReply>(br#"{"type":"get_name_reply","object_id":1}"#)
            .unwrap_err();
        assert!(matches!(err, StoreError::ConnectionCorrupted(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_missing_field_is_protocol_error() {
        let err = decode_reply::<GetNameReply>(br#"{"type":"get_name_reply"}"#).unwrap_err();
        assert!(matches!(err, StoreError::Protocol(_)));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_get_buffers_reply_defaults_to_empty() {
        let reply: GetBuffersReply = decode_reply(br#"{"type":"get_buffers_reply"}"#).unwrap();
        assert!(reply.payloads.is_empty());
    }
}
