//! Lazy, forward-only result streams.
//!
//! A [`ResultStream`] borrows its session mutably, so no other statement
//! can run while it is alive. Dropping it undrained leaves the session
//! with a pending result that is dumped before the next statement.

use crate::error::ClientError;
use crate::interceptor::ResultSet;
use crate::session::Session;
use crate::transport::Transport;
use bytes::Bytes;
use dbwire_protocol::value::split_row;
use dbwire_protocol::{ColumnMeta, ExecuteOk, Notice, ServerMessage, ServerMessageType, Value};
use serde_json::{Map, Value as JsonValue};
use std::collections::VecDeque;
use std::sync::Arc;

/// One decoded row.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Arc<[ColumnMeta]>,
    values: Vec<Value>,
}

impl Row {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn columns(&self) -> &[ColumnMeta] {
        &self.columns
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    /// Looks a value up by column name (case-insensitive).
    pub fn get_by_name(&self, name: &str) -> Option<&Value> {
        let index = self
            .columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))?;
        self.values.get(index)
    }

    pub fn get_i64(&self, name: &str) -> Option<i64> {
        self.get_by_name(name).and_then(Value::as_i64)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get_by_name(name).and_then(Value::as_str)
    }

    /// Renders the row as a JSON object keyed by column name.
    pub fn to_json(&self) -> JsonValue {
        let mut object = Map::with_capacity(self.values.len());
        for (column, value) in self.columns.iter().zip(&self.values) {
            object.insert(column.name.clone(), value_to_json(value));
        }
        JsonValue::Object(object)
    }
}

fn value_to_json(value: &Value) -> JsonValue {
    match value {
        Value::Null => JsonValue::Null,
        Value::Bool(b) => JsonValue::Bool(*b),
        Value::Sint(v) => JsonValue::from(*v),
        Value::Uint(v) => JsonValue::from(*v),
        Value::Double(v) => JsonValue::from(*v),
        Value::Float(v) => JsonValue::from(*v as f64),
        Value::String(s) => JsonValue::String(s.clone()),
        Value::Bytes(b) => JsonValue::String(hex::encode(b)),
        Value::Json(v) => v.clone(),
    }
}

/// What `Session::execute` hands to a new stream.
pub(crate) enum Prepared {
    Wire(ResultHeader),
    Intercepted(ResultSet),
}

/// Notices and column metadata preceding the rows of a result set, plus
/// the first message after them.
pub(crate) struct ResultHeader {
    columns: Vec<ColumnMeta>,
    warnings: Vec<Notice>,
    lookahead: Option<ServerMessage>,
}

/// Reads a result-set header.
pub(crate) async fn read_header(transport: &mut Transport) -> Result<ResultHeader, ClientError> {
    let mut columns = Vec::new();
    let mut warnings = Vec::new();
    loop {
        match transport.read_message().await? {
            ServerMessage::Notice(notice) => warnings.push(notice),
            ServerMessage::ColumnMetaData(column) => columns.push(column),
            ServerMessage::Error(err) => return Err(ClientError::from_server(err)),
            msg @ (ServerMessage::Row(_)
            | ServerMessage::FetchDone
            | ServerMessage::FetchDoneMoreResultsets
            | ServerMessage::FetchDoneMoreOutParams
            | ServerMessage::StmtExecuteOk(_)) => {
                return Ok(ResultHeader {
                    columns,
                    warnings,
                    lookahead: Some(msg),
                })
            }
            other => return Err(unexpected(&other, "in result header")),
        }
    }
}

/// Skips frames until the statement completes, without decoding rows.
///
/// A trailing server error is logged and swallowed.
pub(crate) async fn discard_until_complete(
    transport: &mut Transport,
) -> Result<Option<ExecuteOk>, ClientError> {
    let mut skipped = 0usize;
    loop {
        let frame = transport.read_frame().await?;
        if frame.msg_type == ServerMessageType::Row as u8 {
            skipped += 1;
            continue;
        }
        match ServerMessage::from_frame(frame)? {
            ServerMessage::StmtExecuteOk(ok) => {
                tracing::debug!(skipped, "Discarded remaining result frames");
                return Ok(Some(ok));
            }
            ServerMessage::Error(err) => {
                tracing::warn!(code = %err.code, message = %err.message, "Discarded result ended with a server error");
                return Ok(None);
            }
            _ => {}
        }
    }
}

pub(crate) fn unexpected(msg: &ServerMessage, context: &str) -> ClientError {
    ClientError::Decode {
        message: format!("unexpected {:?} {}", msg.msg_type(), context),
        session_fatal: true,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamState {
    /// Rows of the current set may follow.
    Reading,
    /// The current set ended and another follows.
    SetDone,
    Complete,
    /// A decode error; only `dump` is allowed.
    Poisoned,
}

/// Forward-only cursor over a statement's result sets.
pub struct ResultStream<'s> {
    session: &'s mut Session,
    columns: Arc<[ColumnMeta]>,
    state: StreamState,
    lookahead: Option<ServerMessage>,
    buffered: VecDeque<Row>,
    warnings: Vec<Notice>,
    outcome: ExecuteOk,
}

impl<'s> ResultStream<'s> {
    pub(crate) fn new(session: &'s mut Session, prepared: Prepared) -> Self {
        match prepared {
            Prepared::Wire(header) => Self {
                session,
                columns: header.columns.into(),
                state: StreamState::Reading,
                lookahead: header.lookahead,
                buffered: VecDeque::new(),
                warnings: header.warnings,
                outcome: ExecuteOk::default(),
            },
            Prepared::Intercepted(set) => {
                let columns: Arc<[ColumnMeta]> = set.columns.into();
                let buffered = set
                    .rows
                    .into_iter()
                    .map(|values| Row {
                        columns: columns.clone(),
                        values,
                    })
                    .collect();
                Self {
                    session,
                    columns,
                    state: StreamState::Complete,
                    lookahead: None,
                    buffered,
                    warnings: Vec::new(),
                    outcome: ExecuteOk {
                        rows_affected: set.rows_affected,
                        ..ExecuteOk::default()
                    },
                }
            }
        }
    }

    /// Column metadata of the current result set.
    pub fn columns(&self) -> &[ColumnMeta] {
        &self.columns
    }

    /// Returns the next row of the current result set.
    pub async fn next(&mut self) -> Result<Option<Row>, ClientError> {
        if let Some(row) = self.buffered.pop_front() {
            return Ok(Some(row));
        }
        self.advance(true).await
    }

    /// Reads every remaining row of the current set into memory.
    ///
    /// Returns the number of buffered rows.
    pub async fn buffer_all(&mut self) -> Result<usize, ClientError> {
        let mut rows = Vec::new();
        while let Some(row) = self.advance(true).await? {
            rows.push(row);
        }
        self.buffered.extend(rows);
        Ok(self.buffered.len())
    }

    /// Drains the current set and returns its rows.
    pub async fn fetch_all(&mut self) -> Result<Vec<Row>, ClientError> {
        self.buffer_all().await?;
        Ok(self.buffered.drain(..).collect())
    }

    /// Moves to the next result set. Returns `false` when none is left.
    pub async fn next_result(&mut self) -> Result<bool, ClientError> {
        self.buffered.clear();
        while self.state == StreamState::Reading {
            self.advance(false).await?;
        }

        match self.state {
            StreamState::Poisoned => Err(ClientError::StreamPoisoned),
            StreamState::Complete => Ok(false),
            StreamState::Reading => Ok(true),
            StreamState::SetDone => {
                let header = match self.session.transport_mut() {
                    Ok(transport) => read_header(transport).await,
                    Err(err) => Err(err),
                };
                match header {
                    Ok(header) => {
                        self.columns = header.columns.into();
                        self.warnings.extend(header.warnings);
                        self.lookahead = header.lookahead;
                        self.state = StreamState::Reading;
                        Ok(true)
                    }
                    Err(err) => Err(self.fail(err)),
                }
            }
        }
    }

    /// Discards everything left in the stream without decoding it.
    ///
    /// A no-op once the stream is complete. Allowed on a poisoned stream.
    pub async fn dump(&mut self) -> Result<(), ClientError> {
        self.buffered.clear();
        if self.state == StreamState::Complete || !self.session.is_open() {
            return Ok(());
        }

        match self.lookahead.take() {
            Some(ServerMessage::StmtExecuteOk(ok)) => {
                self.complete(ok);
                return Ok(());
            }
            Some(ServerMessage::Error(err)) => {
                tracing::warn!(code = %err.code, message = %err.message, "Discarded result ended with a server error");
                self.complete(ExecuteOk::default());
                return Ok(());
            }
            _ => {}
        }

        let discarded = match self.session.transport_mut() {
            Ok(transport) => discard_until_complete(transport).await,
            Err(err) => Err(err),
        };
        match discarded {
            Ok(ok) => {
                self.complete(ok.unwrap_or_default());
                Ok(())
            }
            Err(err) => Err(self.fail(err)),
        }
    }

    pub fn rows_affected(&self) -> u64 {
        self.outcome.rows_affected
    }

    pub fn last_insert_id(&self) -> Option<u64> {
        self.outcome.last_insert_id
    }

    pub fn generated_ids(&self) -> &[String] {
        &self.outcome.generated_ids
    }

    /// Notices received so far.
    pub fn warnings(&self) -> &[Notice] {
        &self.warnings
    }

    pub fn is_complete(&self) -> bool {
        self.state == StreamState::Complete && self.buffered.is_empty()
    }

    pub fn is_poisoned(&self) -> bool {
        self.state == StreamState::Poisoned
    }

    /// Reads until a row (returned when `decode` is set) or the end of
    /// the current set.
    async fn advance(&mut self, decode: bool) -> Result<Option<Row>, ClientError> {
        loop {
            match self.state {
                StreamState::Poisoned => return Err(ClientError::StreamPoisoned),
                StreamState::SetDone | StreamState::Complete => return Ok(None),
                StreamState::Reading => {}
            }

            let msg = match self.next_message().await {
                Ok(msg) => msg,
                Err(err) => return Err(self.fail(err)),
            };

            match msg {
                ServerMessage::Row(payload) => {
                    if !decode {
                        continue;
                    }
                    return match self.decode_row(&payload) {
                        Ok(row) => Ok(Some(row)),
                        Err(err) => Err(self.fail(err)),
                    };
                }
                ServerMessage::Notice(notice) => self.warnings.push(notice),
                ServerMessage::FetchDone => {
                    self.finish_statement().await?;
                    return Ok(None);
                }
                ServerMessage::FetchDoneMoreResultsets | ServerMessage::FetchDoneMoreOutParams => {
                    self.state = StreamState::SetDone;
                    return Ok(None);
                }
                ServerMessage::StmtExecuteOk(ok) => {
                    self.complete(ok);
                    return Ok(None);
                }
                ServerMessage::Error(err) => {
                    self.complete(ExecuteOk::default());
                    return Err(self.fail(ClientError::from_server(err)));
                }
                other => return Err(self.fail(unexpected(&other, "in result set"))),
            }
        }
    }

    /// Reads past the final `FetchDone` up to the statement's completion.
    async fn finish_statement(&mut self) -> Result<(), ClientError> {
        loop {
            let msg = match self.next_message().await {
                Ok(msg) => msg,
                Err(err) => return Err(self.fail(err)),
            };
            match msg {
                ServerMessage::Notice(notice) => self.warnings.push(notice),
                ServerMessage::StmtExecuteOk(ok) => {
                    self.complete(ok);
                    return Ok(());
                }
                ServerMessage::Error(err) => {
                    self.complete(ExecuteOk::default());
                    return Err(self.fail(ClientError::from_server(err)));
                }
                other => return Err(self.fail(unexpected(&other, "after fetch done"))),
            }
        }
    }

    async fn next_message(&mut self) -> Result<ServerMessage, ClientError> {
        if let Some(msg) = self.lookahead.take() {
            return Ok(msg);
        }
        self.session.transport_mut()?.read_message().await
    }

    fn decode_row(&self, payload: &Bytes) -> Result<Row, ClientError> {
        let fields = split_row(payload, self.columns.len()).map_err(|e| ClientError::Decode {
            message: e.to_string(),
            session_fatal: true,
        })?;

        let values = fields
            .iter()
            .zip(self.columns.iter())
            .enumerate()
            .map(|(index, (field, column))| Value::decode(index, column.column_type, field.as_deref()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| ClientError::Decode {
                message: e.to_string(),
                session_fatal: false,
            })?;

        Ok(Row {
            columns: self.columns.clone(),
            values,
        })
    }

    fn complete(&mut self, outcome: ExecuteOk) {
        self.outcome = outcome;
        self.state = StreamState::Complete;
        self.lookahead = None;
        self.session.finish_result();
    }

    /// Poisons the stream unless it already completed, then lets the
    /// session close itself and transform the error.
    fn fail(&mut self, err: ClientError) -> ClientError {
        if self.state != StreamState::Complete {
            self.state = StreamState::Poisoned;
        }
        self.session.fail(err)
    }
}

impl std::fmt::Debug for ResultStream<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultStream")
            .field("session", &self.session.id())
            .field("columns", &self.columns.len())
            .field("state", &self.state)
            .field("buffered", &self.buffered.len())
            .finish()
    }
}
