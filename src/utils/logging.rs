use parking_lot::Mutex;
use std::fs::File;
use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

enum RunLogSink {
    Buffered(Vec<u8>),
    File(File),
}

/// Writer behind the WARN file layer.
///
/// Events are held in memory until [`RunLog::open`] is called, so a run that
/// never starts processing leaves the previous log on the target alone.
#[derive(Clone)]
pub struct RunLog {
    sink: Arc<Mutex<RunLogSink>>,
}

impl Default for RunLog {
    fn default() -> Self {
        Self {
            sink: Arc::new(Mutex::new(RunLogSink::Buffered(Vec::new()))),
        }
    }
}

impl RunLog {
    /// Create (or truncate) `path` and flush anything logged so far into it.
    pub fn open(&self, path: &Path) -> io::Result<()> {
        let mut file = File::create(path)?;
        let mut sink = self.sink.lock();
        if let RunLogSink::Buffered(held) = &*sink {
            file.write_all(held)?;
        }
        *sink = RunLogSink::File(file);
        Ok(())
    }
}

impl Write for RunLog {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut *self.sink.lock() {
            RunLogSink::Buffered(held) => {
                held.extend_from_slice(buf);
                Ok(buf.len())
            }
            RunLogSink::File(file) => file.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut *self.sink.lock() {
            RunLogSink::Buffered(_) => Ok(()),
            RunLogSink::File(file) => file.flush(),
        }
    }
}

impl<'a> MakeWriter<'a> for RunLog {
    type Writer = RunLog;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Initialize tracing.
///
/// `RUST_LOG` drives the stderr layer (default `info`, or `debug` when
/// `verbose`). When `run_log` is given, WARN and above also go there without
/// colors.
pub fn init_tracing(verbose: bool, json: bool, run_log: Option<RunLog>) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let stderr_layer = if json {
        fmt::layer().json().with_writer(io::stderr).boxed()
    } else {
        fmt::layer().with_writer(io::stderr).boxed()
    };

    let file_layer = run_log.map(|writer| {
        fmt::layer()
            .with_ansi(false)
            .with_target(false)
            .with_writer(writer)
            .with_filter(LevelFilter::WARN)
    });

    // A second init (tests, embedding) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(stderr_layer.with_filter(filter))
        .with(file_layer)
        .try_init();
}
