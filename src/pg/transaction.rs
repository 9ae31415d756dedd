//! Transactions.
//!
//! The connection task keeps the transaction as tagged state
//! ([`TxOverlay`]). While a transaction is open every command on the
//! connection runs inside it, so `BEGIN`, the caller's statements and
//! `COMMIT` reach the wire in submission order with nothing interleaved.

use std::future::Future;

use tokio::sync::oneshot;

use super::command::{Command, QueryResult, Reply, Request};
use super::connection::PgConnection;
use super::error::{PgError, PgResult};
use super::types::PgValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TxPhase {
    Open,
    Committing,
    RollingBack,
}

#[derive(Debug)]
pub(crate) struct TxState {
    pub id: u64,
    pub phase: TxPhase,
    pub close_on_end: bool,
    /// The server answered `BEGIN`
    begin_acked: bool,
    /// Set when the server rejected `BEGIN`
    begin_error: Option<PgError>,
}

/// Transaction state owned by the connection task.
#[derive(Debug, Default)]
pub(crate) struct TxOverlay {
    active: Option<TxState>,
}

impl TxOverlay {
    pub fn is_open(&self) -> bool {
        self.active.is_some()
    }

    /// Open transaction `id` and return the `BEGIN` command to queue.
    pub fn begin(&mut self, id: u64, close_on_end: bool) -> Command {
        self.active = Some(TxState {
            id,
            phase: TxPhase::Open,
            close_on_end,
            begin_acked: false,
            begin_error: None,
        });
        Command::new(Request::Simple("BEGIN".to_string()), Reply::Begin { tx: id })
    }

    /// Check that a command issued through transaction `cmd.tx` may still run.
    pub fn route(&self, cmd: &Command) -> PgResult<()> {
        let Some(id) = cmd.tx else {
            return Ok(());
        };
        match &self.active {
            Some(state) if state.id == id && state.phase == TxPhase::Open => Ok(()),
            _ => Err(PgError::State("transaction is closed".to_string())),
        }
    }

    pub fn on_begin(&mut self, id: u64, result: PgResult<()>) {
        let Some(state) = self.active.as_mut().filter(|s| s.id == id) else {
            return;
        };
        state.begin_acked = true;
        if let Err(err) = result {
            log::warn!("BEGIN failed for transaction {}: {}", id, err);
            state.begin_error = Some(err);
        }
    }

    /// Start committing or rolling back transaction `id`.
    ///
    /// Returns the end command to queue, or hands the reply back with an
    /// error when the transaction is not open. The command is only final
    /// once [`settle_end`](Self::settle_end) accepts it.
    pub fn end(
        &mut self,
        id: u64,
        commit: bool,
        reply: Option<oneshot::Sender<PgResult<()>>>,
    ) -> Result<Command, (Option<oneshot::Sender<PgResult<()>>>, PgError)> {
        let state = match self.active.as_mut() {
            Some(state) if state.id == id && state.phase == TxPhase::Open => state,
            Some(state) if state.id == id => {
                return Err((reply, PgError::State("transaction is already ending".to_string())))
            }
            _ => return Err((reply, PgError::State("transaction is closed".to_string()))),
        };

        state.phase = if commit {
            TxPhase::Committing
        } else {
            TxPhase::RollingBack
        };
        let sql = if commit { "COMMIT" } else { "ROLLBACK" };
        Ok(Command::new(
            Request::Simple(sql.to_string()),
            Reply::TxEnd {
                tx: id,
                commit,
                reply,
                override_error: None,
            },
        ))
    }

    /// Called before `cmd` goes to the wire. Returns false while a `COMMIT`
    /// must wait for the server's answer to its `BEGIN`.
    ///
    /// A transaction whose BEGIN failed can only be rolled back: the
    /// `COMMIT` is rewritten to `ROLLBACK` and will report the BEGIN error.
    pub fn settle_end(&mut self, cmd: &mut Command) -> bool {
        let Reply::TxEnd {
            tx,
            commit,
            override_error,
            ..
        } = &mut cmd.reply
        else {
            return true;
        };
        let Some(state) = self.active.as_mut().filter(|s| s.id == *tx) else {
            return true;
        };
        if !*commit {
            return true;
        }
        if !state.begin_acked {
            return false;
        }
        if let Some(err) = state.begin_error.take() {
            *commit = false;
            *override_error = Some(err);
            state.phase = TxPhase::RollingBack;
            cmd.request = Request::Simple("ROLLBACK".to_string());
        }
        true
    }

    /// Roll back an open transaction because the connection is closing.
    pub fn rollback_for_close(&mut self) -> Option<Command> {
        let id = self
            .active
            .as_ref()
            .filter(|s| s.phase == TxPhase::Open)?
            .id;
        self.end(id, false, None).ok()
    }

    /// Detach the transaction. Returns its final state if `id` matched.
    pub fn detach(&mut self, id: u64) -> Option<TxState> {
        if self.active.as_ref().map_or(false, |s| s.id == id) {
            self.active.take()
        } else {
            None
        }
    }

    /// Detach whatever transaction is active (connection teardown).
    pub fn detach_any(&mut self) -> Option<TxState> {
        self.active.take()
    }
}

/// An open transaction on one connection.
///
/// Commands issued through the transaction, or directly on the connection,
/// run inside it until [`commit`](Self::commit) or
/// [`rollback`](Self::rollback). Dropping an un-ended transaction schedules
/// a `ROLLBACK`.
pub struct Transaction {
    conn: PgConnection,
    id: u64,
    ended: bool,
}

impl Transaction {
    pub(crate) fn new(conn: PgConnection, id: u64) -> Self {
        Self {
            conn,
            id,
            ended: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn connection(&self) -> &PgConnection {
        &self.conn
    }

    pub fn query(
        &self,
        sql: &str,
        params: &[PgValue],
    ) -> impl Future<Output = PgResult<QueryResult>> + Send + 'static {
        self.conn.query_in(sql, params, Some(self.id))
    }

    pub fn simple_query(
        &self,
        sql: &str,
    ) -> impl Future<Output = PgResult<Vec<QueryResult>>> + Send + 'static {
        self.conn.simple_query_in(sql, Some(self.id))
    }

    pub async fn execute(&self, sql: &str, params: &[PgValue]) -> PgResult<u64> {
        Ok(self.query(sql, params).await?.rows_affected())
    }

    pub async fn commit(mut self) -> PgResult<()> {
        self.ended = true;
        self.conn.end_transaction(self.id, true).await
    }

    pub async fn rollback(mut self) -> PgResult<()> {
        self.ended = true;
        self.conn.end_transaction(self.id, false).await
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.ended {
            log::debug!("transaction {} dropped without commit; rolling back", self.id);
            self.conn.abandon_transaction(self.id);
        }
    }
}
