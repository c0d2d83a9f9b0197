use anyhow::Context as _;
use std::io::{IsTerminal, Write};
use std::sync::Arc;
use std::sync::Mutex;
use tracing_subscriber::prelude::*;

// Diagnostics (not the heartbeat record log) go through `tracing`. The library only emits
// events; binaries call init_logging() once to print them to stderr and, optionally, to a
// file. The filter comes from RUST_LOG and defaults to "info".

static SINK: std::sync::OnceLock<Arc<DiagnosticSink>> = std::sync::OnceLock::new();

struct DiagnosticSink {
    stderr: Mutex<termcolor::StandardStream>,
    file: Option<Mutex<std::io::BufWriter<std::fs::File>>>,
}

impl DiagnosticSink {
    fn open(path: Option<&std::path::Path>) -> anyhow::Result<Self> {
        let color = if std::io::stderr().is_terminal() {
            termcolor::ColorChoice::Auto
        } else {
            termcolor::ColorChoice::Never
        };
        let file = match path {
            Some(path) => {
                let f = std::fs::OpenOptions::new()
                    .append(true)
                    .create(true)
                    .open(path)
                    .with_context(|| format!("Unable to open diagnostic log {}", path.display()))?;
                Some(Mutex::new(std::io::BufWriter::new(f)))
            }
            None => None,
        };
        Ok(DiagnosticSink {
            stderr: Mutex::new(termcolor::StandardStream::stderr(color)),
            file,
        })
    }
}

impl<'a> std::io::Write for &'a DiagnosticSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.stderr
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .write_all(buf)?;
        if let Some(f) = self.file.as_ref() {
            f.lock().unwrap_or_else(|e| e.into_inner()).write_all(buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.stderr.lock().unwrap_or_else(|e| e.into_inner()).flush()?;
        if let Some(f) = self.file.as_ref() {
            f.lock().unwrap_or_else(|e| e.into_inner()).flush()?;
        }
        Ok(())
    }
}

struct SinkWriter(Arc<DiagnosticSink>);

impl<'a> tracing_subscriber::fmt::writer::MakeWriter<'a> for SinkWriter {
    type Writer = &'a DiagnosticSink;

    #[inline]
    fn make_writer(&'a self) -> Self::Writer {
        &self.0
    }
}

/// Install the global subscriber. Only the first call has any effect.
pub fn init_logging(path: Option<&std::path::Path>) -> anyhow::Result<()> {
    if SINK.get().is_some() {
        return Ok(());
    }
    let sink = Arc::new(DiagnosticSink::open(path)?);
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let layer = tracing_subscriber::fmt::layer()
        .with_writer(SinkWriter(sink.clone()))
        .with_ansi(std::io::stderr().is_terminal())
        .with_filter(filter);
    tracing_subscriber::registry()
        .with(layer)
        .try_init()
        .context("A tracing subscriber is already installed")?;
    let _ = SINK.set(sink);
    Ok(())
}

/// Flush buffered diagnostics to stderr and the log file.
pub fn flush_logging() -> anyhow::Result<()> {
    if let Some(sink) = SINK.get() {
        return sink.as_ref().flush().context("Error flushing");
    }
    Ok(())
}
