//! Commands and their response accumulation.
//!
//! A command is one request/response exchange. Each one ends with exactly
//! one `ReadyForQuery`, which is how responses are matched to commands on
//! a pipelined connection.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::sync::oneshot;

use super::copy::CopyOutcome;
use super::error::{PgError, PgResult};
use super::protocol::*;
use super::types::{Oid, PgValue};

/// Column descriptions shared by every row of a result.
pub type SharedColumns = Arc<Vec<FieldDescription>>;

/// Result of one statement.
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    pub columns: SharedColumns,
    pub rows: Vec<Vec<PgValue>>,
    /// Command tag (e.g., "SELECT 5" or "INSERT 0 1")
    pub command_tag: String,
}

impl QueryResult {
    /// Rows affected, parsed from the command tag.
    pub fn rows_affected(&self) -> u64 {
        parse_rows_affected(&self.command_tag)
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Value at `row` in the column called `name`.
    pub fn get(&self, row: usize, name: &str) -> Option<&PgValue> {
        let col = self.column_index(name)?;
        self.rows.get(row)?.get(col)
    }
}

pub(crate) fn parse_rows_affected(tag: &str) -> u64 {
    // "INSERT 0 5", "UPDATE 3", "COPY 100", ...
    let parts: Vec<&str> = tag.split_whitespace().collect();
    match parts.as_slice() {
        ["INSERT", _, n]
        | ["UPDATE", n]
        | ["DELETE", n]
        | ["SELECT", n]
        | ["MERGE", n]
        | ["COPY", n]
        | ["MOVE", n]
        | ["FETCH", n] => n.parse().unwrap_or(0),
        _ => 0,
    }
}

/// Wire payload of a command.
#[derive(Debug)]
pub(crate) enum Request {
    /// Simple query protocol; may hold several statements
    Simple(String),
    /// Extended protocol with the unnamed statement and portal
    Extended { sql: String, params: Vec<PgValue> },
    /// `COPY ... FROM STDIN`, sent as a simple query
    CopyIn(String),
    /// Graceful shutdown; no response is expected
    Terminate,
}

impl Request {
    pub fn encode_to(&self, buf: &mut BytesMut) {
        match self {
            Request::Simple(sql) | Request::CopyIn(sql) => {
                QueryMessage { query: sql }.encode_to(buf);
            }
            Request::Extended { sql, params } => {
                ParseMessage {
                    name: "",
                    query: sql,
                    param_types: params.iter().map(PgValue::type_oid).collect(),
                }
                .encode_to(buf);
                BindMessage {
                    portal: "",
                    statement: "",
                    params,
                    result_format: Format::Binary,
                }
                .encode_to(buf);
                DescribeMessage {
                    kind: b'P',
                    name: "",
                }
                .encode_to(buf);
                ExecuteMessage {
                    portal: "",
                    max_rows: 0,
                }
                .encode_to(buf);
                // Per-command Sync: an error never poisons the next command
                SyncMessage.encode_to(buf);
            }
            Request::Terminate => TerminateMessage.encode_to(buf),
        }
    }

    /// Barriers run alone: nothing is in flight when they are written and
    /// nothing follows them until they finish.
    pub fn is_barrier(&self) -> bool {
        matches!(self, Request::CopyIn(_) | Request::Terminate)
    }

    pub fn sql(&self) -> &str {
        match self {
            Request::Simple(sql) | Request::CopyIn(sql) | Request::Extended { sql, .. } => sql,
            Request::Terminate => "<terminate>",
        }
    }
}

/// Handed to `copy_from` once the server accepted the copy.
pub(crate) struct CopyStart {
    pub done: oneshot::Receiver<PgResult<CopyOutcome>>,
}

/// Where a command's result goes.
pub(crate) enum Reply {
    Simple(oneshot::Sender<PgResult<Vec<QueryResult>>>),
    Query(oneshot::Sender<PgResult<QueryResult>>),
    CopyStart(oneshot::Sender<PgResult<CopyStart>>),
    /// BEGIN issued by the transaction overlay
    Begin { tx: u64 },
    /// COMMIT or ROLLBACK issued by the transaction overlay
    TxEnd {
        tx: u64,
        /// `COMMIT` rather than `ROLLBACK`
        commit: bool,
        reply: Option<oneshot::Sender<PgResult<()>>>,
        /// Error to report instead of the server's answer
        override_error: Option<PgError>,
    },
    /// Internal command nobody waits for
    Discard,
}

impl Reply {
    pub fn fail(self, err: PgError) {
        // A dropped receiver means the caller lost interest
        match self {
            Reply::Simple(tx) => {
                let _ = tx.send(Err(err));
            }
            Reply::Query(tx) => {
                let _ = tx.send(Err(err));
            }
            Reply::CopyStart(tx) => {
                let _ = tx.send(Err(err));
            }
            Reply::TxEnd {
                reply: Some(tx), ..
            } => {
                let _ = tx.send(Err(err));
            }
            Reply::Begin { .. } | Reply::TxEnd { reply: None, .. } | Reply::Discard => {}
        }
    }
}

/// A command waiting in a connection queue.
pub(crate) struct Command {
    pub request: Request,
    pub reply: Reply,
    /// Transaction the caller issued this command through
    pub tx: Option<u64>,
}

impl Command {
    pub fn new(request: Request, reply: Reply) -> Self {
        Self {
            request,
            reply,
            tx: None,
        }
    }

    pub fn in_tx(mut self, tx: Option<u64>) -> Self {
        self.tx = tx;
        self
    }
}

/// What a response message meant for the command it belongs to.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Step {
    Continue,
    /// The server entered copy-in mode
    CopyIn(Format),
    /// `ReadyForQuery`: the command is finished
    Done,
}

/// Accumulates the messages of one command.
#[derive(Debug, Default)]
pub(crate) struct Response {
    results: Vec<QueryResult>,
    current: Option<QueryResult>,
    error: Option<PgError>,
}

impl Response {
    pub fn feed(&mut self, msg: BackendMessage) -> Step {
        match msg {
            BackendMessage::RowDescription { fields } => {
                self.current = Some(QueryResult {
                    columns: Arc::new(fields),
                    ..QueryResult::default()
                });
            }
            BackendMessage::DataRow { values } => {
                if self.error.is_none() {
                    let current = self.current.get_or_insert_with(QueryResult::default);
                    match decode_row(&values, &current.columns) {
                        Ok(row) => current.rows.push(row),
                        Err(e) => self.error = Some(e),
                    }
                }
            }
            BackendMessage::CommandComplete { tag } => {
                let mut result = self.current.take().unwrap_or_default();
                result.command_tag = tag;
                self.results.push(result);
            }
            BackendMessage::EmptyQueryResponse => {
                self.results.push(QueryResult::default());
            }
            BackendMessage::ErrorResponse { fields } => {
                // Keep the first error; later ones are consequences of it
                if self.error.is_none() {
                    self.error = Some(error_from_fields(&fields));
                }
            }
            BackendMessage::CopyInResponse { format, .. } => return Step::CopyIn(format),
            BackendMessage::ReadyForQuery { .. } => return Step::Done,
            BackendMessage::ParseComplete
            | BackendMessage::BindComplete
            | BackendMessage::CloseComplete
            | BackendMessage::NoData
            | BackendMessage::PortalSuspended
            | BackendMessage::ParameterDescription { .. } => {}
            other => {
                if self.error.is_none() {
                    self.error = Some(PgError::Protocol(format!(
                        "Unexpected message in command response: {:?}",
                        other
                    )));
                }
            }
        }
        Step::Continue
    }

    pub fn finish(self) -> PgResult<Vec<QueryResult>> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.results),
        }
    }

    /// Deliver the accumulated result to a caller-facing reply.
    ///
    /// Overlay replies are handled by the connection task and are not
    /// accepted here.
    pub fn deliver(self, reply: Reply) {
        match reply {
            Reply::Simple(tx) => {
                let _ = tx.send(self.finish());
            }
            Reply::Query(tx) => {
                let result = self
                    .finish()
                    .map(|results| results.into_iter().next().unwrap_or_default());
                let _ = tx.send(result);
            }
            Reply::CopyStart(tx) => {
                // Finished without ever entering copy mode
                let err = match self.finish() {
                    Err(err) => err,
                    Ok(_) => PgError::Protocol("COPY finished without copy-in mode".to_string()),
                };
                let _ = tx.send(Err(err));
            }
            Reply::Begin { .. } | Reply::TxEnd { .. } | Reply::Discard => {}
        }
    }
}

fn decode_row(values: &[Option<Bytes>], columns: &[FieldDescription]) -> PgResult<Vec<PgValue>> {
    values
        .iter()
        .enumerate()
        .map(|(i, value)| {
            let Some(data) = value else {
                return Ok(PgValue::Null);
            };
            match columns.get(i) {
                Some(field) if field.format == Format::Binary => {
                    PgValue::decode_binary(field.type_oid, data)
                }
                Some(field) => PgValue::decode_text(field.type_oid, data),
                None => PgValue::decode_text(Oid::TEXT, data),
            }
        })
        .collect()
}
