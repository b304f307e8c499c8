// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 MuVeraAI Corporation

//! Append-only JSON-lines audit file.
//!
//! [`JsonLinesAuditSink`] writes one [`AuditEvent`] per line to a file opened
//! in append mode.  The governor records events while holding its state lock,
//! so [`AuditSink::record`] must not block: it only pushes the event onto an
//! unbounded channel.  A dedicated writer task drains the channel in order,
//! which keeps the file order identical to the decision order.
//!
//! ## Layout
//!
//! ```text
//! {"timestamp":"2026-06-01T10:00:00.000Z","decision":"granted","actorId":"agent-1",...}
//! {"timestamp":"2026-06-01T10:00:00.412Z","decision":"released","actorId":"agent-1",...}
//! ```
//!
//! ## Caveats
//!
//! * Existing lines are never rewritten or truncated.
//! * A write failure is logged and the event is dropped; the governor keeps
//!   deciding.  Call [`JsonLinesAuditSink::flush`] to learn whether everything
//!   queued so far reached the file.

use std::io;
use std::path::{Path, PathBuf};

use model_governor_core::audit::{AuditEvent, AuditSink};
use thiserror::Error;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Failures surfaced by [`JsonLinesAuditSink`].
#[derive(Debug, Error)]
pub enum AuditFileError {
    #[error("failed to open audit file \"{path}\": {source}")]
    Open {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("audit writer failed: {0}")]
    Write(#[from] io::Error),

    #[error("audit writer task has stopped")]
    WriterClosed,
}

enum WriterCommand {
    Event(AuditEvent),
    Flush(oneshot::Sender<Result<(), io::Error>>),
}

/// [`AuditSink`] that appends JSON lines to a file from a background task.
///
/// # Examples
///
/// ```rust,no_run
/// use model_governor_std::audit_file::JsonLinesAuditSink;
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let (sink, writer) = JsonLinesAuditSink::open("/var/log/model-governor/audit.jsonl").await?;
/// // ... hand `sink` to the governor ...
/// sink.flush().await?;
/// drop(sink);
/// writer.await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct JsonLinesAuditSink {
    path: PathBuf,
    tx: mpsc::UnboundedSender<WriterCommand>,
}

impl std::fmt::Debug for WriterCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WriterCommand::Event(event) => f.debug_tuple("Event").field(&event.decision).finish(),
            WriterCommand::Flush(_) => f.write_str("Flush"),
        }
    }
}

impl JsonLinesAuditSink {
    /// Open (or create) `path` for appending and spawn the writer task.
    ///
    /// The task ends once every clone of the sink has been dropped and the
    /// queue is drained.
    ///
    /// # Errors
    ///
    /// Returns [`AuditFileError::Open`] if the file or its parent directory
    /// cannot be created.
    pub async fn open(path: impl AsRef<Path>) -> Result<(Self, JoinHandle<()>), AuditFileError> {
        let path = path.as_ref().to_path_buf();
        let open_error = |source| AuditFileError::Open {
            path: path.display().to_string(),
            source,
        };

        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(open_error)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(open_error)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(run_writer(BufWriter::new(file), rx, path.clone()));
        debug!(path = %path.display(), "audit file opened");
        Ok((Self { path, tx }, writer))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Wait until every event queued before this call is written and synced.
    pub async fn flush(&self) -> Result<(), AuditFileError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(WriterCommand::Flush(done_tx))
            .map_err(|_| AuditFileError::WriterClosed)?;
        done_rx.await.map_err(|_| AuditFileError::WriterClosed)??;
        Ok(())
    }
}

impl AuditSink for JsonLinesAuditSink {
    fn record(&self, event: AuditEvent) {
        if self.tx.send(WriterCommand::Event(event)).is_err() {
            warn!(path = %self.path.display(), "audit writer stopped; event dropped");
        }
    }
}

async fn run_writer(
    mut file: BufWriter<tokio::fs::File>,
    mut rx: mpsc::UnboundedReceiver<WriterCommand>,
    path: PathBuf,
) {
    while let Some(command) = rx.recv().await {
        match command {
            WriterCommand::Event(event) => {
                if let Err(error) = append_line(&mut file, &event).await {
                    error!(path = %path.display(), %error, "failed to append audit event");
                }
            }
            WriterCommand::Flush(done) => {
                let result = sync(&mut file).await;
                // The caller may have given up waiting.
                let _ = done.send(result);
            }
        }
    }

    if let Err(error) = sync(&mut file).await {
        error!(path = %path.display(), %error, "failed to flush audit file on shutdown");
    }
    debug!(path = %path.display(), "audit writer stopped");
}

async fn append_line(file: &mut BufWriter<tokio::fs::File>, event: &AuditEvent) -> io::Result<()> {
    let mut line = serde_json::to_vec(event).map_err(io::Error::other)?;
    line.push(b'\n');
    file.write_all(&line).await
}

async fn sync(file: &mut BufWriter<tokio::fs::File>) -> io::Result<()> {
    file.flush().await?;
    file.get_ref().sync_data().await
}
