//! Client and server messages.
//!
//! Control messages carry JSON payloads; result rows carry the binary row
//! encoding from [`crate::value`]. Client and server tags live in separate
//! number spaces.

use crate::error::{ErrorCode, ProtocolError};
use crate::frame::Frame;
use crate::statement::{Statement, StatementKind};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;

/// Message type tags sent by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ClientMessageType {
    CapabilitiesGet = 1,
    CapabilitiesSet = 2,
    ConnectionClose = 3,
    AuthStart = 4,
    AuthContinue = 5,
    SessionReset = 6,
    SessionClose = 7,
    SqlStmtExecute = 12,
    CrudFind = 17,
    CrudInsert = 18,
    CrudUpdate = 19,
    CrudDelete = 20,
}

impl TryFrom<u8> for ClientMessageType {
    type Error = ProtocolError;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        let msg_type = match tag {
            1 => ClientMessageType::CapabilitiesGet,
            2 => ClientMessageType::CapabilitiesSet,
            3 => ClientMessageType::ConnectionClose,
            4 => ClientMessageType::AuthStart,
            5 => ClientMessageType::AuthContinue,
            6 => ClientMessageType::SessionReset,
            7 => ClientMessageType::SessionClose,
            12 => ClientMessageType::SqlStmtExecute,
            17 => ClientMessageType::CrudFind,
            18 => ClientMessageType::CrudInsert,
            19 => ClientMessageType::CrudUpdate,
            20 => ClientMessageType::CrudDelete,
            other => return Err(ProtocolError::UnknownMessageType(other)),
        };
        Ok(msg_type)
    }
}

/// Message type tags sent by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ServerMessageType {
    Ok = 0,
    Error = 1,
    Capabilities = 2,
    AuthContinue = 3,
    AuthOk = 4,
    Notice = 11,
    ColumnMetaData = 12,
    Row = 13,
    FetchDone = 14,
    FetchDoneMoreResultsets = 16,
    StmtExecuteOk = 17,
    FetchDoneMoreOutParams = 18,
}

impl TryFrom<u8> for ServerMessageType {
    type Error = ProtocolError;

    fn try_from(tag: u8) -> Result<Self, ProtocolError> {
        let msg_type = match tag {
            0 => ServerMessageType::Ok,
            1 => ServerMessageType::Error,
            2 => ServerMessageType::Capabilities,
            3 => ServerMessageType::AuthContinue,
            4 => ServerMessageType::AuthOk,
            11 => ServerMessageType::Notice,
            12 => ServerMessageType::ColumnMetaData,
            13 => ServerMessageType::Row,
            14 => ServerMessageType::FetchDone,
            16 => ServerMessageType::FetchDoneMoreResultsets,
            17 => ServerMessageType::StmtExecuteOk,
            18 => ServerMessageType::FetchDoneMoreOutParams,
            other => return Err(ProtocolError::UnknownMessageType(other)),
        };
        Ok(msg_type)
    }
}

/// Capability set exchanged during negotiation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Capabilities {
    /// Server supports (or client requests) an in-place TLS upgrade.
    #[serde(default)]
    pub tls: bool,

    /// Authentication mechanisms the server accepts.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub auth_mechanisms: Vec<String>,

    /// Maximum physical frame payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_block_size: Option<usize>,

    /// Additional capabilities (for forward compatibility).
    #[serde(flatten)]
    pub extra: HashMap<String, JsonValue>,
}

impl Capabilities {
    /// Capability set a client sends to request TLS.
    pub fn request_tls() -> Self {
        Self {
            tls: true,
            ..Self::default()
        }
    }

    pub fn supports_mechanism(&self, name: &str) -> bool {
        self.auth_mechanisms.is_empty()
            || self
                .auth_mechanisms
                .iter()
                .any(|m| m.eq_ignore_ascii_case(name))
    }
}

/// First message of the authentication handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthStart {
    pub mech_name: String,
    #[serde(default, with = "hex_bytes", skip_serializing_if = "Vec::is_empty")]
    pub auth_data: Vec<u8>,
}

/// Challenge (server) or response (client) during authentication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthContinue {
    #[serde(with = "hex_bytes")]
    pub auth_data: Vec<u8>,
}

/// Error reported by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerError {
    pub code: ErrorCode,
    #[serde(default = "default_sql_state")]
    pub sql_state: String,
    pub message: String,
    /// Fatal errors end the session on the server side.
    #[serde(default)]
    pub fatal: bool,
}

fn default_sql_state() -> String {
    "HY000".to_string()
}

impl ServerError {
    pub fn new(code: impl Into<ErrorCode>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            sql_state: default_sql_state(),
            message: message.into(),
            fatal: false,
        }
    }
}

/// Notice kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeKind {
    Warning,
    SessionVariableChanged,
    SessionStateChanged,
}

/// Out-of-band notice attached to a statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notice {
    pub kind: NoticeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<u16>,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<JsonValue>,
}

/// Column metadata preceding result rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMeta {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: crate::value::ColumnType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
}

impl ColumnMeta {
    pub fn new(name: impl Into<String>, column_type: crate::value::ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            original_name: None,
            table: None,
            schema: None,
        }
    }
}

/// Statement completion.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteOk {
    #[serde(default)]
    pub rows_affected: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_insert_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub generated_ids: Vec<String>,
}

/// A message sent by the client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    CapabilitiesGet,
    CapabilitiesSet(Capabilities),
    ConnectionClose,
    AuthStart(AuthStart),
    AuthContinue(AuthContinue),
    SessionReset,
    SessionClose,
    Execute(Box<Statement>),
}

impl ClientMessage {
    pub fn msg_type(&self) -> ClientMessageType {
        match self {
            ClientMessage::CapabilitiesGet => ClientMessageType::CapabilitiesGet,
            ClientMessage::CapabilitiesSet(_) => ClientMessageType::CapabilitiesSet,
            ClientMessage::ConnectionClose => ClientMessageType::ConnectionClose,
            ClientMessage::AuthStart(_) => ClientMessageType::AuthStart,
            ClientMessage::AuthContinue(_) => ClientMessageType::AuthContinue,
            ClientMessage::SessionReset => ClientMessageType::SessionReset,
            ClientMessage::SessionClose => ClientMessageType::SessionClose,
            ClientMessage::Execute(stmt) => stmt.kind.message_type(),
        }
    }

    /// Serializes the message into a frame.
    pub fn to_frame(&self) -> Result<Frame, ProtocolError> {
        let tag = self.msg_type() as u8;
        match self {
            ClientMessage::CapabilitiesGet
            | ClientMessage::ConnectionClose
            | ClientMessage::SessionReset
            | ClientMessage::SessionClose => Ok(Frame::new(tag, Bytes::new())),
            ClientMessage::CapabilitiesSet(caps) => Frame::from_json(tag, caps),
            ClientMessage::AuthStart(start) => Frame::from_json(tag, start),
            ClientMessage::AuthContinue(cont) => Frame::from_json(tag, cont),
            ClientMessage::Execute(stmt) => Frame::from_json(tag, stmt.as_ref()),
        }
    }

    /// Parses a frame sent by a client.
    pub fn from_frame(frame: &Frame) -> Result<Self, ProtocolError> {
        let msg_type = ClientMessageType::try_from(frame.msg_type)?;
        let msg = match msg_type {
            ClientMessageType::CapabilitiesGet => ClientMessage::CapabilitiesGet,
            ClientMessageType::CapabilitiesSet => {
                ClientMessage::CapabilitiesSet(json_payload(&frame.payload)?)
            }
            ClientMessageType::ConnectionClose => ClientMessage::ConnectionClose,
            ClientMessageType::AuthStart => ClientMessage::AuthStart(json_payload(&frame.payload)?),
            ClientMessageType::AuthContinue => {
                ClientMessage::AuthContinue(json_payload(&frame.payload)?)
            }
            ClientMessageType::SessionReset => ClientMessage::SessionReset,
            ClientMessageType::SessionClose => ClientMessage::SessionClose,
            other => {
                let stmt: Statement = json_payload(&frame.payload)?;
                if StatementKind::from_message_type(other) != Some(stmt.kind) {
                    return Err(ProtocolError::UnexpectedMessage(format!(
                        "{:?} frame carries a {:?} statement",
                        other, stmt.kind
                    )));
                }
                ClientMessage::Execute(Box::new(stmt))
            }
        };
        Ok(msg)
    }
}

/// A message sent by the server.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    Ok(Option<String>),
    Error(ServerError),
    Capabilities(Capabilities),
    AuthContinue(AuthContinue),
    AuthOk,
    Notice(Notice),
    ColumnMetaData(ColumnMeta),
    /// Raw row payload, decoded lazily against the column metadata.
    Row(Bytes),
    FetchDone,
    FetchDoneMoreResultsets,
    FetchDoneMoreOutParams,
    StmtExecuteOk(ExecuteOk),
}

#[derive(Serialize, Deserialize)]
struct OkBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    msg: Option<String>,
}

impl ServerMessage {
    pub fn msg_type(&self) -> ServerMessageType {
        match self {
            ServerMessage::Ok(_) => ServerMessageType::Ok,
            ServerMessage::Error(_) => ServerMessageType::Error,
            ServerMessage::Capabilities(_) => ServerMessageType::Capabilities,
            ServerMessage::AuthContinue(_) => ServerMessageType::AuthContinue,
            ServerMessage::AuthOk => ServerMessageType::AuthOk,
            ServerMessage::Notice(_) => ServerMessageType::Notice,
            ServerMessage::ColumnMetaData(_) => ServerMessageType::ColumnMetaData,
            ServerMessage::Row(_) => ServerMessageType::Row,
            ServerMessage::FetchDone => ServerMessageType::FetchDone,
            ServerMessage::FetchDoneMoreResultsets => ServerMessageType::FetchDoneMoreResultsets,
            ServerMessage::FetchDoneMoreOutParams => ServerMessageType::FetchDoneMoreOutParams,
            ServerMessage::StmtExecuteOk(_) => ServerMessageType::StmtExecuteOk,
        }
    }

    /// Serializes the message into a frame.
    pub fn to_frame(&self) -> Result<Frame, ProtocolError> {
        let tag = self.msg_type() as u8;
        match self {
            ServerMessage::Ok(msg) => Frame::from_json(tag, &OkBody { msg: msg.clone() }),
            ServerMessage::Error(err) => Frame::from_json(tag, err),
            ServerMessage::Capabilities(caps) => Frame::from_json(tag, caps),
            ServerMessage::AuthContinue(cont) => Frame::from_json(tag, cont),
            ServerMessage::Notice(notice) => Frame::from_json(tag, notice),
            ServerMessage::ColumnMetaData(meta) => Frame::from_json(tag, meta),
            ServerMessage::StmtExecuteOk(ok) => Frame::from_json(tag, ok),
            ServerMessage::Row(payload) => Ok(Frame::new(tag, payload.clone())),
            ServerMessage::AuthOk
            | ServerMessage::FetchDone
            | ServerMessage::FetchDoneMoreResultsets
            | ServerMessage::FetchDoneMoreOutParams => Ok(Frame::new(tag, Bytes::new())),
        }
    }

    /// Parses a frame sent by a server.
    pub fn from_frame(frame: Frame) -> Result<Self, ProtocolError> {
        let msg_type = ServerMessageType::try_from(frame.msg_type)?;
        let msg = match msg_type {
            ServerMessageType::Ok => {
                let body: OkBody = if frame.payload.is_empty() {
                    OkBody { msg: None }
                } else {
                    json_payload(&frame.payload)?
                };
                ServerMessage::Ok(body.msg)
            }
            ServerMessageType::Error => ServerMessage::Error(json_payload(&frame.payload)?),
            ServerMessageType::Capabilities => {
                ServerMessage::Capabilities(json_payload(&frame.payload)?)
            }
            ServerMessageType::AuthContinue => {
                ServerMessage::AuthContinue(json_payload(&frame.payload)?)
            }
            ServerMessageType::AuthOk => ServerMessage::AuthOk,
            ServerMessageType::Notice => ServerMessage::Notice(json_payload(&frame.payload)?),
            ServerMessageType::ColumnMetaData => {
                ServerMessage::ColumnMetaData(json_payload(&frame.payload)?)
            }
            ServerMessageType::Row => ServerMessage::Row(frame.payload),
            ServerMessageType::FetchDone => ServerMessage::FetchDone,
            ServerMessageType::FetchDoneMoreResultsets => ServerMessage::FetchDoneMoreResultsets,
            ServerMessageType::FetchDoneMoreOutParams => ServerMessage::FetchDoneMoreOutParams,
            ServerMessageType::StmtExecuteOk => {
                let ok = if frame.payload.is_empty() {
                    ExecuteOk::default()
                } else {
                    json_payload(&frame.payload)?
                };
                ServerMessage::StmtExecuteOk(ok)
            }
        };
        Ok(msg)
    }
}

fn json_payload<T: DeserializeOwned>(payload: &[u8]) -> Result<T, ProtocolError> {
    let text = std::str::from_utf8(payload).map_err(|_| ProtocolError::InvalidUtf8)?;
    Ok(serde_json::from_str(text)?)
}

/// Serde helper encoding byte vectors as lowercase hex strings.
mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::statement::{Collection, DataModel};
    use crate::value::ColumnType;

    #[test]
    fn test_client_message_tags() {
        let stmt = Statement::find(Collection::new("t"), DataModel::Table);
        let frame = ClientMessage::Execute(Box::new(stmt)).to_frame().unwrap();
        assert_eq!(frame.msg_type, ClientMessageType::CrudFind as u8);

        let frame = ClientMessage::SessionClose.to_frame().unwrap();
        assert_eq!(frame.msg_type, 7);
        assert!(frame.payload.is_empty());
    }

    #[test]
    fn test_auth_data_is_hex() {
        let start = AuthStart {
            mech_name: "baseline".into(),
            auth_data: vec![0xde, 0xad],
        };
        let frame = ClientMessage::AuthStart(start.clone()).to_frame().unwrap();
        let text = std::str::from_utf8(&frame.payload).unwrap();
        assert!(text.contains("\"dead\""));

        match ClientMessage::from_frame(&frame).unwrap() {
            ClientMessage::AuthStart(parsed) => assert_eq!(parsed, start),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_statement_frame_kind_mismatch() {
        let stmt = Statement::delete(Collection::new("t"), DataModel::Table);
        let mut frame = ClientMessage::Execute(Box::new(stmt)).to_frame().unwrap();
        frame.msg_type = ClientMessageType::CrudFind as u8;
        assert!(matches!(
            ClientMessage::from_frame(&frame),
            Err(ProtocolError::UnexpectedMessage(_))
        ));
    }

    #[test]
    fn test_server_error_defaults() {
        let frame = Frame::new(
            ServerMessageType::Error as u8,
            &br#"{"code":1213,"message":"Deadlock found"}"#[..],
        );
        match ServerMessage::from_frame(frame).unwrap() {
            ServerMessage::Error(err) => {
                assert_eq!(err.code, ErrorCode::DEADLOCK);
                assert_eq!(err.sql_state, "HY000");
                assert!(!err.fatal);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_empty_payload_server_messages() {
        let ok = ServerMessage::from_frame(Frame::new(0, Bytes::new())).unwrap();
        assert_eq!(ok, ServerMessage::Ok(None));

        let done = ServerMessage::from_frame(Frame::new(17, Bytes::new())).unwrap();
        assert_eq!(done, ServerMessage::StmtExecuteOk(ExecuteOk::default()));
    }

    #[test]
    fn test_unknown_server_tag() {
        let result = ServerMessage::from_frame(Frame::new(0x42, Bytes::new()));
        assert!(matches!(result, Err(ProtocolError::UnknownMessageType(0x42))));
    }

    #[test]
    fn test_capabilities_extra_fields() {
        let json = r#"{"tls":true,"auth_mechanisms":["baseline","plain"],"compression":"zstd"}"#;
        let caps: Capabilities = serde_json::from_str(json).unwrap();
        assert!(caps.tls);
        assert!(caps.supports_mechanism("PLAIN"));
        assert!(!caps.supports_mechanism("fido"));
        assert_eq!(caps.extra["compression"], "zstd");

        assert!(Capabilities::default().supports_mechanism("anything"));
    }

    #[test]
    fn test_column_meta_type_field() {
        let meta = ColumnMeta::new("id", ColumnType::Sint);
        let json = serde_json::to_string(&meta).unwrap();
        assert_eq!(json, r#"{"name":"id","type":"sint"}"#);
    }
}
