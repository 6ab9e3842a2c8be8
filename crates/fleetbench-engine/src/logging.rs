//! Per-run log sink.
//!
//! Each run builds its own [`Dispatch`] writing to the console and to
//! `{run_dir}/benchmark.log`. The run future and every group worker execute
//! under that dispatch, so there is no process-wide "current log file".
//! Every formatted line goes through the secret [`Redactor`] first.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::Dispatch;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter};

use fleetbench_core::Redactor;

use crate::EngineError;

/// Log sink bound to one run directory.
#[derive(Clone)]
pub struct RunLog {
    dispatch: Dispatch,
    path: PathBuf,
}

impl RunLog {
    /// Open (append) `path` and build a dispatch writing to it, and to
    /// stdout when `console` is set.
    pub fn open(path: &Path, redactor: Redactor, console: bool) -> Result<Self, EngineError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|source| EngineError::RunLog {
                path: path.to_path_buf(),
                source,
            })?;
        let redactor = Arc::new(redactor);

        let console_layer = console.then(|| {
            fmt::layer()
                .with_target(true)
                .with_writer(RedactingMakeWriter::new(io::stdout, redactor.clone()))
        });
        let file_layer = fmt::layer()
            .with_ansi(false)
            .with_target(true)
            .with_writer(RedactingMakeWriter::new(Arc::new(file), redactor));

        let subscriber = tracing_subscriber::registry()
            .with(default_filter())
            .with(console_layer)
            .with(file_layer);

        Ok(Self {
            dispatch: Dispatch::new(subscriber),
            path: path.to_path_buf(),
        })
    }

    pub fn dispatch(&self) -> &Dispatch {
        &self.dispatch
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl std::fmt::Debug for RunLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunLog").field("path", &self.path).finish()
    }
}

/// Console-only dispatch for messages outside any run (startup, teardown).
pub fn console_dispatch(redactor: Redactor) -> Dispatch {
    let subscriber = tracing_subscriber::registry().with(default_filter()).with(
        fmt::layer()
            .with_target(true)
            .with_writer(RedactingMakeWriter::new(io::stdout, Arc::new(redactor))),
    );
    Dispatch::new(subscriber)
}

/// `RUST_LOG` if set, else `info`.
fn default_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// [`MakeWriter`] that masks secrets before bytes reach `inner`.
#[derive(Clone)]
pub struct RedactingMakeWriter<M> {
    inner: M,
    redactor: Arc<Redactor>,
}

impl<M> RedactingMakeWriter<M> {
    pub fn new(inner: M, redactor: Arc<Redactor>) -> Self {
        Self { inner, redactor }
    }
}

impl<'a, M> MakeWriter<'a> for RedactingMakeWriter<M>
where
    M: MakeWriter<'a>,
{
    type Writer = RedactingWriter<'a, M::Writer>;

    fn make_writer(&'a self) -> Self::Writer {
        RedactingWriter {
            inner: self.inner.make_writer(),
            redactor: self.redactor.as_ref(),
        }
    }
}

/// Writer produced by [`RedactingMakeWriter`].
///
/// The fmt layer writes one complete event per `write`, so a secret is never
/// split across calls.
pub struct RedactingWriter<'a, W> {
    inner: W,
    redactor: &'a Redactor,
}

impl<W: Write> Write for RedactingWriter<'_, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match std::str::from_utf8(buf) {
            Ok(text) => self
                .inner
                .write_all(self.redactor.redact(text).as_bytes())?,
            Err(_) => self.inner.write_all(buf)?,
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use tracing::{info, info_span};

    #[test]
    fn test_file_sink_is_redacted() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("benchmark.log");
        let log = RunLog::open(&path, Redactor::from_values(["hf_supersecret"]), false).unwrap();

        tracing::dispatcher::with_default(log.dispatch(), || {
            let span = info_span!("group", group = "h100x1-qwen3-8b");
            let _enter = span.enter();
            info!(token = "hf_supersecret", "docker run -e HF_TOKEN=hf_supersecret");
        });

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("HF_TOKEN=***"));
        assert!(!content.contains("hf_supersecret"));
        assert!(content.contains("h100x1-qwen3-8b"));
    }

    #[test]
    fn test_runs_do_not_share_sinks() {
        let dir = tempdir().unwrap();
        let first = RunLog::open(&dir.path().join("a.log"), Redactor::default(), false).unwrap();
        let second = RunLog::open(&dir.path().join("b.log"), Redactor::default(), false).unwrap();

        tracing::dispatcher::with_default(first.dispatch(), || info!("first run"));
        tracing::dispatcher::with_default(second.dispatch(), || info!("second run"));

        let a = std::fs::read_to_string(first.path()).unwrap();
        let b = std::fs::read_to_string(second.path()).unwrap();
        assert!(a.contains("first run") && !a.contains("second run"));
        assert!(b.contains("second run") && !b.contains("first run"));
    }

    #[test]
    fn test_writer_passes_through_clean_text() {
        let redactor = Redactor::from_values(["abcdefghij"]);
        let mut out = Vec::new();
        {
            let mut writer = RedactingWriter {
                inner: &mut out,
                redactor: &redactor,
            };
            writer.write_all(b"plain line\nkey=abcdefghij\n").unwrap();
        }
        assert_eq!(String::from_utf8(out).unwrap(), "plain line\nkey=***\n");
    }
}
