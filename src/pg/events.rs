//! Out-of-band events: notifications, unsolicited errors and close signals.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;

use super::error::PgError;

/// An asynchronous `NOTIFY` delivered by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Backend process that raised the notification
    pub process_id: i32,
    pub channel: String,
    pub payload: String,
}

impl Notification {
    /// Deserialize a JSON payload.
    pub fn payload_json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_str(&self.payload)
    }
}

pub type NotificationHandler = Box<dyn FnMut(Notification) + Send + 'static>;
pub type ExceptionHandler = Box<dyn FnMut(PgError) + Send + 'static>;
pub type CloseHandler = Box<dyn FnOnce() + Send + 'static>;

type ExceptionSink = Arc<dyn Fn(&PgError) + Send + Sync + 'static>;

static EXCEPTION_SINK: Lazy<RwLock<ExceptionSink>> =
    Lazy::new(|| RwLock::new(Arc::new(default_sink)));

fn default_sink(err: &PgError) {
    log::error!("unhandled connection error: {}", err);
}

/// Replace the process-wide sink for errors that no connection handler claimed.
///
/// The default sink logs at `error` level and continues.
pub fn set_exception_sink<F>(sink: F)
where
    F: Fn(&PgError) + Send + Sync + 'static,
{
    *EXCEPTION_SINK.write() = Arc::new(sink);
}

/// Restore the logging sink.
pub fn reset_exception_sink() {
    *EXCEPTION_SINK.write() = Arc::new(default_sink);
}

pub(crate) fn report_unhandled(err: &PgError) {
    let sink = EXCEPTION_SINK.read().clone();
    sink(err);
}

/// Handlers registered on one connection. Lives inside the connection task.
#[derive(Default)]
pub(crate) struct Handlers {
    notification: Option<NotificationHandler>,
    exception: Option<ExceptionHandler>,
    close: Option<CloseHandler>,
    /// Internal close observers (the pool). Not replaceable by callers.
    close_hooks: Vec<CloseHandler>,
}

impl Handlers {
    pub fn set_notification(&mut self, handler: NotificationHandler) {
        self.notification = Some(handler);
    }

    pub fn set_exception(&mut self, handler: ExceptionHandler) {
        self.exception = Some(handler);
    }

    pub fn set_close(&mut self, handler: CloseHandler) {
        self.close = Some(handler);
    }

    pub fn add_close_hook(&mut self, hook: CloseHandler) {
        self.close_hooks.push(hook);
    }

    pub fn notify(&mut self, notification: Notification) {
        match self.notification.as_mut() {
            Some(handler) => guarded("notification", || handler(notification)),
            None => log::debug!(
                "dropping notification on channel {} (no handler)",
                notification.channel
            ),
        }
    }

    pub fn exception(&mut self, err: PgError) {
        match self.exception.as_mut() {
            Some(handler) => guarded("exception", || handler(err)),
            None => report_unhandled(&err),
        }
    }

    /// Fire the close handler and hooks. Later calls do nothing.
    pub fn closed(&mut self) {
        if let Some(handler) = self.close.take() {
            guarded("close", handler);
        }
        for hook in self.close_hooks.drain(..) {
            guarded("close hook", hook);
        }
    }
}

fn guarded(kind: &str, f: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        log::error!("{} handler panicked", kind);
    }
}
