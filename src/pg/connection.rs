//! PostgreSQL connection.
//!
//! Each connection is a task that owns the socket and every piece of
//! mutable connection state: the pending queue, the in-flight queue, the
//! open transaction and the registered handlers. [`PgConnection`] is a
//! cloneable handle that talks to that task over a channel, so all state
//! changes happen on one task and in inbox order.
//!
//! Commands are written as soon as fewer than `pipelining_limit` commands
//! are awaiting a response; the rest wait in the pending queue. Responses
//! carry no request id and are matched to the oldest in-flight command.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::RwLock;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::command::{Command, CopyStart, QueryResult, Reply, Request, Response, Step};
use super::config::PgConfig;
use super::copy::{self, CopyFormat, CopyOptions, CopyOutcome, CopyWriter};
use super::error::{PgError, PgResult};
use super::events::{CloseHandler, ExceptionHandler, Handlers, Notification, NotificationHandler};
use super::protocol::*;
use super::startup::{self, Session};
use super::transaction::{Transaction, TxOverlay};
use super::types::PgValue;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

// ============================================================================
// Handle
// ============================================================================

/// Counters reported by [`PgConnection::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    /// Commands queued but not yet written
    pub pending: usize,
    /// Commands written and awaiting `ReadyForQuery`
    pub in_flight: usize,
    /// Highest `in_flight` value seen so far
    pub peak_in_flight: usize,
    /// Commands completed, successfully or not
    pub completed: u64,
}

/// State readable from any handle without a round trip to the task.
struct Shared {
    id: u64,
    process_id: i32,
    secret_key: i32,
    pipelining_limit: usize,
    closed: AtomicBool,
    /// Set by `begin()` and cleared when the transaction ends
    tx_open: AtomicBool,
    next_tx: AtomicU64,
    parameters: RwLock<HashMap<String, String>>,
}

/// Handle to a PostgreSQL connection. Clones share the same connection.
///
/// Commands are queued when a method is called, not when the returned
/// future is first polled, so issuing several calls before awaiting any of
/// them pipelines them in call order.
#[derive(Clone)]
pub struct PgConnection {
    inbox: mpsc::UnboundedSender<Message>,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for PgConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgConnection")
            .field("id", &self.shared.id)
            .field("backend_pid", &self.shared.process_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl PgConnection {
    /// Connect to a PostgreSQL server.
    pub async fn connect(url: &str) -> PgResult<Self> {
        let config = PgConfig::from_url(url)?;
        Self::connect_with_config(config).await
    }

    /// Connect with explicit configuration.
    pub async fn connect_with_config(config: PgConfig) -> PgResult<Self> {
        config.validate()?;
        let session = startup::establish(&config).await?;
        Ok(Self::spawn(session, config.pipelining_limit))
    }

    fn spawn(session: Session, pipelining_limit: usize) -> Self {
        let Session {
            stream,
            read_buf,
            parameters,
            process_id,
            secret_key,
        } = session;

        let shared = Arc::new(Shared {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            process_id,
            secret_key,
            pipelining_limit: pipelining_limit.max(1),
            closed: AtomicBool::new(false),
            tx_open: AtomicBool::new(false),
            next_tx: AtomicU64::new(1),
            parameters: RwLock::new(parameters),
        });

        let (read_half, write_half) = stream.into_split();
        // Unbounded: the reader must never wait on the task while the task
        // waits on a socket write the server is not draining
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let reader = tokio::spawn(read_loop(read_half, read_buf, inbound_tx));

        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let task = ConnectionTask {
            shared: Arc::clone(&shared),
            writer: write_half,
            inbox: inbox_rx,
            inbox_open: true,
            inbound: inbound_rx,
            reader,
            pending: VecDeque::new(),
            in_flight: VecDeque::new(),
            tx: TxOverlay::default(),
            handlers: Handlers::default(),
            closing: false,
            terminated: false,
            close_waiters: Vec::new(),
            peak_in_flight: 0,
            completed: 0,
        };
        tokio::spawn(task.run());

        Self {
            inbox: inbox_tx,
            shared,
        }
    }

    /// Process-unique id of this connection.
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Get backend process ID.
    pub fn backend_pid(&self) -> i32 {
        self.shared.process_id
    }

    /// Backend secret key, needed to send a cancel request.
    pub fn backend_secret_key(&self) -> i32 {
        self.shared.secret_key
    }

    /// Get a server parameter (e.g. `server_version`).
    pub fn parameter(&self, name: &str) -> Option<String> {
        self.shared.parameters.read().get(name).cloned()
    }

    pub fn pipelining_limit(&self) -> usize {
        self.shared.pipelining_limit
    }

    /// Whether a transaction begun on this connection has not ended yet.
    pub fn in_transaction(&self) -> bool {
        self.shared.tx_open.load(Ordering::Acquire)
    }

    /// Whether the connection is closed or closing.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire) || self.inbox.is_closed()
    }

    /// Execute a simple query (text protocol). May contain several statements.
    pub fn simple_query(
        &self,
        sql: &str,
    ) -> impl Future<Output = PgResult<Vec<QueryResult>>> + Send + 'static {
        self.simple_query_in(sql, None)
    }

    /// Execute one statement with the extended protocol (binary format).
    pub fn query(
        &self,
        sql: &str,
        params: &[PgValue],
    ) -> impl Future<Output = PgResult<QueryResult>> + Send + 'static {
        self.query_in(sql, params, None)
    }

    /// Execute a statement and return the number of rows affected.
    pub async fn execute(&self, sql: &str, params: &[PgValue]) -> PgResult<u64> {
        Ok(self.query(sql, params).await?.rows_affected())
    }

    pub(crate) fn simple_query_in(
        &self,
        sql: &str,
        tx: Option<u64>,
    ) -> impl Future<Output = PgResult<Vec<QueryResult>>> + Send + 'static {
        let (reply, rx) = oneshot::channel();
        let cmd = Command::new(Request::Simple(sql.to_string()), Reply::Simple(reply)).in_tx(tx);
        let submitted = self.submit(cmd);
        async move {
            submitted?;
            recv(rx).await
        }
    }

    pub(crate) fn query_in(
        &self,
        sql: &str,
        params: &[PgValue],
        tx: Option<u64>,
    ) -> impl Future<Output = PgResult<QueryResult>> + Send + 'static {
        let (reply, rx) = oneshot::channel();
        let request = Request::Extended {
            sql: sql.to_string(),
            params: params.to_vec(),
        };
        let submitted = self.submit(Command::new(request, Reply::Query(reply)).in_tx(tx));
        async move {
            submitted?;
            recv(rx).await
        }
    }

    /// Begin a transaction.
    ///
    /// Fails immediately with [`PgError::State`] if a transaction is already
    /// open on this connection.
    pub fn begin(&self) -> PgResult<Transaction> {
        self.begin_with(false)
    }

    /// Begin a transaction, optionally closing the connection once it ends.
    pub fn begin_with(&self, close_on_end: bool) -> PgResult<Transaction> {
        if self.is_closed() {
            return Err(PgError::ConnectionClosed);
        }
        if self
            .shared
            .tx_open
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(PgError::State(
                "a transaction is already open on this connection".to_string(),
            ));
        }

        let id = self.shared.next_tx.fetch_add(1, Ordering::Relaxed);
        if self
            .inbox
            .send(Message::Begin { id, close_on_end })
            .is_err()
        {
            self.shared.tx_open.store(false, Ordering::Release);
            return Err(PgError::ConnectionClosed);
        }
        Ok(Transaction::new(self.clone(), id))
    }

    pub(crate) async fn end_transaction(&self, id: u64, commit: bool) -> PgResult<()> {
        let (reply, rx) = oneshot::channel();
        self.inbox
            .send(Message::EndTx {
                id,
                commit,
                reply: Some(reply),
            })
            .map_err(|_| PgError::ConnectionClosed)?;
        recv(rx).await
    }

    pub(crate) fn abandon_transaction(&self, id: u64) {
        let _ = self.inbox.send(Message::EndTx {
            id,
            commit: false,
            reply: None,
        });
    }

    pub async fn listen(&self, channel: &str) -> PgResult<()> {
        let sql = format!("LISTEN {}", copy::quote_ident(channel));
        self.simple_query(&sql).await.map(drop)
    }

    pub async fn unlisten(&self, channel: &str) -> PgResult<()> {
        let sql = format!("UNLISTEN {}", copy::quote_ident(channel));
        self.simple_query(&sql).await.map(drop)
    }

    pub async fn notify(&self, channel: &str, payload: &str) -> PgResult<()> {
        self.query(
            "SELECT pg_notify($1, $2)",
            &[PgValue::from(channel), PgValue::from(payload)],
        )
        .await
        .map(drop)
    }

    /// Replace the handler for `NOTIFY` messages.
    pub fn notification_handler<F>(&self, handler: F)
    where
        F: FnMut(Notification) + Send + 'static,
    {
        let _ = self
            .inbox
            .send(Message::Handler(HandlerUpdate::Notification(Box::new(handler))));
    }

    /// Replace the handler for server errors that no command was waiting for.
    ///
    /// Without one, such errors go to the process-wide sink.
    pub fn exception_handler<F>(&self, handler: F)
    where
        F: FnMut(PgError) + Send + 'static,
    {
        let _ = self
            .inbox
            .send(Message::Handler(HandlerUpdate::Exception(Box::new(handler))));
    }

    /// Replace the handler run once when the connection closes.
    ///
    /// Runs immediately if the connection is already gone.
    pub fn close_handler<F>(&self, handler: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.register_close(HandlerUpdate::Close(Box::new(handler)));
    }

    pub(crate) fn add_close_hook<F>(&self, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.register_close(HandlerUpdate::CloseHook(Box::new(hook)));
    }

    fn register_close(&self, update: HandlerUpdate) {
        if let Err(mpsc::error::SendError(Message::Handler(update))) =
            self.inbox.send(Message::Handler(update))
        {
            update.fire_close();
        }
    }

    /// Start `COPY table (columns) FROM STDIN`.
    ///
    /// Resolves once the server is in copy-in mode; a rejected `COPY`
    /// resolves with the server's error and no writer.
    pub async fn copy_from(
        &self,
        table: &str,
        columns: &[&str],
        options: CopyOptions,
    ) -> PgResult<CopyWriter> {
        let sql = copy::copy_sql(table, columns, &options);
        let (reply, rx) = oneshot::channel();
        self.submit(Command::new(Request::CopyIn(sql), Reply::CopyStart(reply)))?;
        let CopyStart { done } = recv(rx).await?;
        Ok(CopyWriter::new(self.clone(), options.format, done))
    }

    pub(crate) async fn copy_data(&self, data: Bytes) -> PgResult<()> {
        let (ack, rx) = oneshot::channel();
        self.inbox
            .send(Message::CopyData { data, ack })
            .map_err(|_| PgError::ConnectionClosed)?;
        recv(rx).await
    }

    pub(crate) fn copy_done(&self) {
        let _ = self.inbox.send(Message::CopyDone);
    }

    pub(crate) fn copy_fail(&self, reason: &str) {
        let _ = self.inbox.send(Message::CopyFail(reason.to_string()));
    }

    pub async fn stats(&self) -> PgResult<ConnectionStats> {
        let (reply, rx) = oneshot::channel();
        self.inbox
            .send(Message::Stats(reply))
            .map_err(|_| PgError::ConnectionClosed)?;
        rx.await.map_err(|_| PgError::ConnectionClosed)
    }

    /// Close the connection.
    ///
    /// Commands already queued finish first; an open transaction is rolled
    /// back. Calling this again, or on a lost connection, is a no-op.
    pub async fn close(&self) -> PgResult<()> {
        let (reply, rx) = oneshot::channel();
        if self.inbox.send(Message::Close(reply)).is_err() {
            return Ok(());
        }
        rx.await.unwrap_or(Ok(()))
    }

    fn submit(&self, cmd: Command) -> PgResult<()> {
        self.inbox
            .send(Message::Command(cmd))
            .map_err(|_| PgError::ConnectionClosed)
    }
}

async fn recv<T>(rx: oneshot::Receiver<PgResult<T>>) -> PgResult<T> {
    rx.await
        .map_err(|_| PgError::ConnectionLost("connection task ended".to_string()))?
}

// ============================================================================
// Connection task
// ============================================================================

pub(crate) enum Message {
    Command(Command),
    Begin {
        id: u64,
        close_on_end: bool,
    },
    EndTx {
        id: u64,
        commit: bool,
        reply: Option<oneshot::Sender<PgResult<()>>>,
    },
    CopyData {
        data: Bytes,
        ack: oneshot::Sender<PgResult<()>>,
    },
    CopyDone,
    CopyFail(String),
    Handler(HandlerUpdate),
    Stats(oneshot::Sender<ConnectionStats>),
    Close(oneshot::Sender<PgResult<()>>),
}

pub(crate) enum HandlerUpdate {
    Notification(NotificationHandler),
    Exception(ExceptionHandler),
    Close(CloseHandler),
    CloseHook(CloseHandler),
}

impl HandlerUpdate {
    /// Run a close handler that arrived after the connection was gone.
    fn fire_close(self) {
        match self {
            HandlerUpdate::Close(handler) | HandlerUpdate::CloseHook(handler) => {
                let mut handlers = Handlers::default();
                handlers.add_close_hook(handler);
                handlers.closed();
            }
            HandlerUpdate::Notification(_) | HandlerUpdate::Exception(_) => {}
        }
    }
}

enum Inbound {
    Message(BackendMessage),
    Lost(PgError),
}

/// A command written to the socket and awaiting `ReadyForQuery`.
struct InFlight {
    reply: Reply,
    response: Response,
    barrier: bool,
    copy: Option<CopyProgress>,
}

/// A copy-in that the server accepted.
struct CopyProgress {
    done: oneshot::Sender<PgResult<CopyOutcome>>,
    bytes: u64,
    /// False once CopyDone or CopyFail was written
    streaming: bool,
}

enum Exit {
    Terminated,
    Lost(PgError),
}

struct ConnectionTask {
    shared: Arc<Shared>,
    writer: OwnedWriteHalf,
    inbox: mpsc::UnboundedReceiver<Message>,
    inbox_open: bool,
    inbound: mpsc::UnboundedReceiver<Inbound>,
    reader: JoinHandle<()>,
    pending: VecDeque<Command>,
    in_flight: VecDeque<InFlight>,
    tx: TxOverlay,
    handlers: Handlers,
    closing: bool,
    /// Terminate has been written
    terminated: bool,
    close_waiters: Vec<oneshot::Sender<PgResult<()>>>,
    peak_in_flight: usize,
    completed: u64,
}

impl ConnectionTask {
    async fn run(mut self) {
        let exit = loop {
            let step = tokio::select! {
                biased;
                inbound = self.inbound.recv() => match inbound {
                    Some(Inbound::Message(msg)) => self.on_backend(msg).await,
                    Some(Inbound::Lost(err)) => Err(err),
                    None => Err(PgError::ConnectionLost("reader stopped".to_string())),
                },
                msg = self.inbox.recv(), if self.inbox_open => match msg {
                    Some(msg) => self.on_message(msg).await,
                    None => {
                        // Every handle is gone
                        self.inbox_open = false;
                        self.begin_close();
                        Ok(())
                    }
                },
            };

            if let Err(err) = step {
                break Exit::Lost(err);
            }
            if let Err(err) = self.dispatch().await {
                break Exit::Lost(err);
            }
            if self.terminated {
                break Exit::Terminated;
            }
        };

        self.teardown(exit).await;
    }

    async fn on_message(&mut self, msg: Message) -> PgResult<()> {
        match msg {
            Message::Command(cmd) => self.enqueue(cmd),
            Message::Begin { id, close_on_end } => {
                if self.closing {
                    self.shared.tx_open.store(false, Ordering::Release);
                } else if self.tx.is_open() {
                    log::warn!("connection {}: transaction {} overlaps an open one", self.shared.id, id);
                } else {
                    log::trace!("connection {}: begin transaction {}", self.shared.id, id);
                    let cmd = self.tx.begin(id, close_on_end);
                    self.pending.push_back(cmd);
                }
            }
            Message::EndTx { id, commit, reply } => match self.tx.end(id, commit, reply) {
                Ok(cmd) => self.pending.push_back(cmd),
                Err((Some(reply), err)) => {
                    let _ = reply.send(Err(err));
                }
                Err((None, _)) => {}
            },
            Message::CopyData { data, ack } => {
                if !self.copy_streaming() {
                    let _ = ack.send(Err(PgError::State("no copy in progress".to_string())));
                    return Ok(());
                }
                let len = data.len() as u64;
                if let Err(err) = self.write(&CopyDataMessage { data: &data }.encode()).await {
                    let _ = ack.send(Err(err.clone()));
                    return Err(err);
                }
                if let Some(copy) = self.active_copy() {
                    copy.bytes += len;
                }
                let _ = ack.send(Ok(()));
            }
            Message::CopyDone => {
                if self.copy_streaming() {
                    self.write(&CopyDoneMessage.encode()).await?;
                    self.stop_copy();
                }
            }
            Message::CopyFail(reason) => {
                if self.copy_streaming() {
                    self.write(&CopyFailMessage { reason: &reason }.encode())
                        .await?;
                    self.stop_copy();
                }
            }
            Message::Handler(update) => match update {
                HandlerUpdate::Notification(h) => self.handlers.set_notification(h),
                HandlerUpdate::Exception(h) => self.handlers.set_exception(h),
                HandlerUpdate::Close(h) => self.handlers.set_close(h),
                HandlerUpdate::CloseHook(h) => self.handlers.add_close_hook(h),
            },
            Message::Stats(reply) => {
                let _ = reply.send(ConnectionStats {
                    pending: self.pending.len(),
                    in_flight: self.in_flight.len(),
                    peak_in_flight: self.peak_in_flight,
                    completed: self.completed,
                });
            }
            Message::Close(reply) => {
                self.close_waiters.push(reply);
                self.begin_close();
            }
        }
        Ok(())
    }

    fn enqueue(&mut self, cmd: Command) {
        if self.closing {
            cmd.reply.fail(PgError::ConnectionClosed);
            return;
        }
        if let Err(err) = self.tx.route(&cmd) {
            cmd.reply.fail(err);
            return;
        }
        self.pending.push_back(cmd);
    }

    /// Queue the rollback of an open transaction, then Terminate.
    fn begin_close(&mut self) {
        if self.closing {
            return;
        }
        log::debug!("connection {}: closing", self.shared.id);
        self.closing = true;
        self.shared.closed.store(true, Ordering::Release);
        if let Some(rollback) = self.tx.rollback_for_close() {
            self.pending.push_back(rollback);
        }
        self.pending
            .push_back(Command::new(Request::Terminate, Reply::Discard));
    }

    /// Move pending commands to the socket while the pipelining limit and
    /// barriers allow.
    async fn dispatch(&mut self) -> PgResult<()> {
        let mut buf = BytesMut::new();
        let limit = self.shared.pipelining_limit;

        while let Some(next) = self.pending.front_mut() {
            let blocked = self.in_flight.front().map_or(false, |f| f.barrier)
                || (next.request.is_barrier() && !self.in_flight.is_empty())
                || self.in_flight.len() >= limit
                || !self.tx.settle_end(next);
            if blocked {
                break;
            }
            let Some(cmd) = self.pending.pop_front() else {
                break;
            };

            cmd.request.encode_to(&mut buf);
            if matches!(cmd.request, Request::Terminate) {
                self.terminated = true;
                break;
            }
            log::trace!(
                "connection {}: send {}",
                self.shared.id,
                cmd.request.sql()
            );
            self.in_flight.push_back(InFlight {
                barrier: cmd.request.is_barrier(),
                reply: cmd.reply,
                response: Response::default(),
                copy: None,
            });
            self.peak_in_flight = self.peak_in_flight.max(self.in_flight.len());
        }

        if !buf.is_empty() {
            self.write(&buf).await?;
        }
        Ok(())
    }

    async fn on_backend(&mut self, msg: BackendMessage) -> PgResult<()> {
        match msg {
            BackendMessage::NotificationResponse {
                process_id,
                channel,
                payload,
            } => {
                self.handlers.notify(Notification {
                    process_id,
                    channel,
                    payload,
                });
            }
            BackendMessage::NoticeResponse { fields } => {
                log::info!(
                    "connection {}: {}: {}",
                    self.shared.id,
                    fields.get(&b'S').map(String::as_str).unwrap_or("NOTICE"),
                    fields.get(&b'M').map(String::as_str).unwrap_or_default()
                );
            }
            BackendMessage::ParameterStatus { name, value } => {
                self.shared.parameters.write().insert(name, value);
            }
            BackendMessage::ErrorResponse { fields } if self.in_flight.is_empty() => {
                let err = error_from_fields(&fields);
                log::warn!("connection {}: unsolicited error: {}", self.shared.id, err);
                self.handlers.exception(err);
            }
            msg => {
                let Some(front) = self.in_flight.front_mut() else {
                    log::warn!(
                        "connection {}: ignoring {:?} with no command in flight",
                        self.shared.id,
                        msg
                    );
                    return Ok(());
                };
                match front.response.feed(msg) {
                    Step::Continue => {}
                    Step::CopyIn(format) => self.start_copy(format).await?,
                    Step::Done => {
                        if let Some(done) = self.in_flight.pop_front() {
                            self.complete(done);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// The server entered copy-in mode for the oldest in-flight command.
    async fn start_copy(&mut self, format: Format) -> PgResult<()> {
        let Some(front) = self.in_flight.front_mut() else {
            return Ok(());
        };
        if !matches!(front.reply, Reply::CopyStart(_)) {
            // Plain queries cannot feed a copy; make the server fail it
            log::warn!(
                "connection {}: COPY FROM STDIN outside copy_from(); aborting",
                self.shared.id
            );
            let reason = "COPY FROM STDIN must be started with copy_from()";
            return self.write(&CopyFailMessage { reason }.encode()).await;
        }
        let Reply::CopyStart(start) = std::mem::replace(&mut front.reply, Reply::Discard) else {
            return Ok(());
        };

        let format = match format {
            Format::Binary => CopyFormat::Binary,
            Format::Text => CopyFormat::Text,
        };
        // The header goes out before the caller can hold a writer
        let mut bytes = 0;
        if let Some(header) = format.header() {
            bytes = header.len() as u64;
            self.write(&CopyDataMessage { data: &header }.encode())
                .await?;
        }

        let (done_tx, done_rx) = oneshot::channel();
        let caller_gone = start.send(Ok(CopyStart { done: done_rx })).is_err();
        if let Some(front) = self.in_flight.front_mut() {
            front.copy = Some(CopyProgress {
                done: done_tx,
                bytes,
                streaming: true,
            });
        }
        if caller_gone {
            let reason = "copy_from() caller went away";
            self.write(&CopyFailMessage { reason }.encode()).await?;
            self.stop_copy();
        }
        Ok(())
    }

    fn active_copy(&mut self) -> Option<&mut CopyProgress> {
        self.in_flight.front_mut()?.copy.as_mut()
    }

    fn copy_streaming(&self) -> bool {
        self.in_flight
            .front()
            .and_then(|f| f.copy.as_ref())
            .map_or(false, |c| c.streaming)
    }

    fn stop_copy(&mut self) {
        if let Some(copy) = self.active_copy() {
            copy.streaming = false;
        }
    }

    /// Deliver the result of a finished command.
    fn complete(&mut self, done: InFlight) {
        self.completed += 1;
        let InFlight {
            reply,
            response,
            copy,
            ..
        } = done;

        if let Some(copy) = copy {
            let outcome = response.finish().map(|results| CopyOutcome {
                rows: results.last().map_or(0, QueryResult::rows_affected),
                bytes: copy.bytes,
            });
            let _ = copy.done.send(outcome);
            return;
        }

        match reply {
            Reply::Begin { tx } => self.tx.on_begin(tx, response.finish().map(drop)),
            Reply::TxEnd {
                tx,
                commit,
                reply,
                override_error,
            } => {
                let result = match (override_error, response.finish()) {
                    (Some(err), _) | (None, Err(err)) => Err(err),
                    // The server answers COMMIT of an aborted transaction with ROLLBACK
                    (None, Ok(results))
                        if commit
                            && results
                                .last()
                                .map_or(false, |r| r.command_tag == "ROLLBACK") =>
                    {
                        Err(PgError::State("transaction was rolled back".to_string()))
                    }
                    (None, Ok(_)) => Ok(()),
                };
                // Bookkeeping first so the caller can begin again right away
                self.end_transaction(tx);
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
            reply => response.deliver(reply),
        }
    }

    /// Runs exactly once per transaction, whichever way it ended.
    fn end_transaction(&mut self, id: u64) {
        let Some(state) = self.tx.detach(id) else {
            return;
        };
        log::trace!(
            "connection {}: transaction {} ended ({:?})",
            self.shared.id,
            id,
            state.phase
        );
        self.shared.tx_open.store(false, Ordering::Release);
        if state.close_on_end {
            self.begin_close();
        }
    }

    async fn write(&mut self, buf: &[u8]) -> PgResult<()> {
        self.writer
            .write_all(buf)
            .await
            .map_err(|e| PgError::ConnectionLost(e.to_string()))
    }

    async fn teardown(mut self, exit: Exit) {
        self.closing = true;
        self.shared.closed.store(true, Ordering::Release);
        self.reader.abort();

        let err = match exit {
            Exit::Terminated => {
                log::debug!("connection {}: closed", self.shared.id);
                let _ = self.writer.shutdown().await;
                PgError::ConnectionClosed
            }
            Exit::Lost(err) => {
                log::warn!("connection {}: lost: {}", self.shared.id, err);
                let _ = self.writer.shutdown().await;
                match err {
                    PgError::ConnectionLost(_) => err,
                    other => PgError::ConnectionLost(other.to_string()),
                }
            }
        };

        // Oldest first
        for flight in self.in_flight.drain(..) {
            if let Some(copy) = flight.copy {
                let _ = copy.done.send(Err(err.clone()));
            }
            flight.reply.fail(err.clone());
        }
        for cmd in self.pending.drain(..) {
            cmd.reply.fail(err.clone());
        }

        // No network rollback on a dead socket: local bookkeeping only
        if let Some(state) = self.tx.detach_any() {
            log::debug!(
                "connection {}: transaction {} abandoned by close",
                self.shared.id,
                state.id
            );
        }
        self.shared.tx_open.store(false, Ordering::Release);

        // Late messages: fail commands, honor close registrations
        self.inbox.close();
        while let Ok(msg) = self.inbox.try_recv() {
            match msg {
                Message::Command(cmd) => cmd.reply.fail(PgError::ConnectionClosed),
                Message::EndTx {
                    reply: Some(reply), ..
                } => {
                    let _ = reply.send(Err(PgError::ConnectionClosed));
                }
                Message::CopyData { ack, .. } => {
                    let _ = ack.send(Err(PgError::ConnectionClosed));
                }
                Message::Handler(update @ (HandlerUpdate::Close(_) | HandlerUpdate::CloseHook(_))) => {
                    self.handle_late_close(update);
                }
                Message::Close(reply) => self.close_waiters.push(reply),
                _ => {}
            }
        }

        // The socket is shut down: close hooks may free its slot
        self.handlers.closed();
        for waiter in self.close_waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }
    }

    fn handle_late_close(&mut self, update: HandlerUpdate) {
        match update {
            HandlerUpdate::Close(h) => self.handlers.set_close(h),
            HandlerUpdate::CloseHook(h) => self.handlers.add_close_hook(h),
            HandlerUpdate::Notification(_) | HandlerUpdate::Exception(_) => {}
        }
    }
}

async fn read_loop(
    mut read: OwnedReadHalf,
    mut buf: BytesMut,
    inbound: mpsc::UnboundedSender<Inbound>,
) {
    loop {
        loop {
            match decode_frame(&mut buf) {
                Ok(Some(msg)) => {
                    if inbound.send(Inbound::Message(msg)).is_err() {
                        return;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    let _ = inbound.send(Inbound::Lost(err));
                    return;
                }
            }
        }

        buf.reserve(8192);
        match read.read_buf(&mut buf).await {
            Ok(0) => {
                let _ = inbound.send(Inbound::Lost(PgError::ConnectionLost(
                    "server closed the connection".to_string(),
                )));
                return;
            }
            Ok(_) => {}
            Err(e) => {
                let _ = inbound.send(Inbound::Lost(PgError::ConnectionLost(e.to_string())));
                return;
            }
        }
    }
}
