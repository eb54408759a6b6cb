//! Asynchronous report sink shared by the core and every plugin.
//!
//! Reporting must be callable from any stage thread without blocking on
//! I/O, so messages are queued on an unbounded channel and drained by a
//! dedicated logger thread that forwards them to `tracing`. Stage-scoped
//! handles add the plugin name (and optionally the chain position) and
//! apply a per-stage severity ceiling that the control channel can move
//! at runtime.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{debug, error, info, trace, warn};

/// Message severity, most severe first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Severity {
    Error = 0,
    Warning = 1,
    Info = 2,
    Verbose = 3,
    Debug = 4,
}

impl Severity {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => Severity::Error,
            1 => Severity::Warning,
            2 => Severity::Info,
            3 => Severity::Verbose,
            _ => Severity::Debug,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "error" => Some(Severity::Error),
            "warning" | "warn" => Some(Severity::Warning),
            "info" => Some(Severity::Info),
            "verbose" => Some(Severity::Verbose),
            "debug" => Some(Severity::Debug),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Severity::Error => "error",
            Severity::Warning => "warning",
            Severity::Info => "info",
            Severity::Verbose => "verbose",
            Severity::Debug => "debug",
        }
    }
}

enum LogMsg {
    Record { severity: Severity, message: String },
    /// Drains everything queued before it, then stops the thread.
    Shutdown,
}

/// Cloneable sending half of the report queue.
#[derive(Clone)]
pub struct AsyncReport {
    tx: flume::Sender<LogMsg>,
    worst: Arc<AtomicU8>,
}

impl AsyncReport {
    /// Starts the drain thread and returns the sink plus its join handle.
    /// The thread exits on [`AsyncReport::shutdown`] or once every sender
    /// clone has been dropped.
    pub fn spawn() -> (Self, thread::JoinHandle<()>) {
        let (tx, rx) = flume::unbounded::<LogMsg>();
        let handle = thread::Builder::new()
            .name("log-drain".into())
            .spawn(move || {
                while let Ok(msg) = rx.recv() {
                    match msg {
                        LogMsg::Record { severity, message } => match severity {
                            Severity::Error => error!("{message}"),
                            Severity::Warning => warn!("{message}"),
                            Severity::Info => info!("{message}"),
                            Severity::Verbose => debug!("{message}"),
                            Severity::Debug => trace!("{message}"),
                        },
                        LogMsg::Shutdown => break,
                    }
                }
            })
            .expect("cannot spawn log drain thread");
        (
            Self {
                tx,
                worst: Arc::new(AtomicU8::new(u8::MAX)),
            },
            handle,
        )
    }

    /// Queues a message. Never blocks.
    pub fn report(&self, severity: Severity, message: String) {
        self.worst.fetch_min(severity as u8, Ordering::Relaxed);
        let _ = self.tx.send(LogMsg::Record { severity, message });
    }

    /// Asks the drain thread to flush pending messages and exit.
    pub fn shutdown(&self) {
        let _ = self.tx.send(LogMsg::Shutdown);
    }

    /// The most severe message reported so far, if any.
    pub fn worst(&self) -> Option<Severity> {
        match self.worst.load(Ordering::Relaxed) {
            u8::MAX => None,
            v => Some(Severity::from_u8(v)),
        }
    }
}

/// A stage-scoped view of the report sink.
#[derive(Clone)]
pub struct StageReport {
    index: usize,
    name: Arc<str>,
    show_index: bool,
    ceiling: Arc<AtomicU8>,
    inner: AsyncReport,
}

impl StageReport {
    pub fn new(inner: AsyncReport, index: usize, name: &str, show_index: bool) -> Self {
        Self {
            index,
            name: Arc::from(name),
            show_index,
            ceiling: Arc::new(AtomicU8::new(Severity::Info as u8)),
            inner,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Reports a message unless it falls under the stage's ceiling.
    pub fn report(&self, severity: Severity, message: impl AsRef<str>) {
        if severity as u8 > self.ceiling.load(Ordering::Relaxed) {
            return;
        }
        let message = message.as_ref();
        let text = if self.show_index {
            format!("{}: {}: {}", self.index, self.name, message)
        } else {
            format!("{}: {}", self.name, message)
        };
        self.inner.report(severity, text);
    }

    pub fn error(&self, message: impl AsRef<str>) {
        self.report(Severity::Error, message);
    }

    pub fn warning(&self, message: impl AsRef<str>) {
        self.report(Severity::Warning, message);
    }

    pub fn info(&self, message: impl AsRef<str>) {
        self.report(Severity::Info, message);
    }

    pub fn verbose(&self, message: impl AsRef<str>) {
        self.report(Severity::Verbose, message);
    }

    /// Moves the per-stage severity ceiling (control channel `setlog`).
    pub fn set_ceiling(&self, severity: Severity) {
        self.ceiling.store(severity as u8, Ordering::Relaxed);
    }

    pub fn ceiling(&self) -> Severity {
        Severity::from_u8(self.ceiling.load(Ordering::Relaxed))
    }
}
