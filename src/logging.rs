//! Non-blocking log sink
//!
//! Formatted lines go through a bounded channel to a dedicated `log-writer`
//! thread. A full channel drops the line and counts it; the calling thread
//! never waits on I/O.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::EnvFilter;

use crate::core::config::LoggingConfig;
use crate::core::{Error, Result};

enum LogMsg {
    Line(Vec<u8>),
    Flush(flume::Sender<()>),
    Shutdown,
}

/// `MakeWriter` handed to the fmt subscriber.
#[derive(Clone)]
pub struct ChannelWriter {
    tx: flume::Sender<LogMsg>,
    dropped: Arc<AtomicU64>,
}

impl Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.tx.try_send(LogMsg::Line(buf.to_vec())).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for ChannelWriter {
    type Writer = ChannelWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Process-scoped logging state. Dropping it drains pending lines and
/// stops the writer thread.
pub struct LogGuard {
    tx: flume::Sender<LogMsg>,
    dropped: Arc<AtomicU64>,
    writer: Option<JoinHandle<()>>,
}

impl LogGuard {
    /// Block until every line queued before this call has been written.
    pub fn flush(&self) {
        let (ack_tx, ack_rx) = flume::bounded(1);
        if self.tx.send(LogMsg::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.recv();
        }
    }

    /// Lines lost to a full channel so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for LogGuard {
    fn drop(&mut self) {
        let _ = self.tx.send(LogMsg::Shutdown);
        if let Some(writer) = self.writer.take() {
            let _ = writer.join();
        }
    }
}

struct LocalTime;

impl FormatTime for LocalTime {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.6f"))
    }
}

/// Install the global subscriber. `RUST_LOG` overrides `config.level`.
pub fn init(config: &LoggingConfig) -> Result<LogGuard> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| Error::Config(format!("invalid log filter '{}': {}", config.level, e)))?;

    let sink: Box<dyn Write + Send> = match &config.file {
        Some(path) => Box::new(OpenOptions::new().create(true).append(true).open(path)?),
        None => Box::new(io::stdout()),
    };
    let (writer, guard) = spawn(sink, config.buffer)?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(LocalTime)
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_ansi(config.file.is_none())
        .with_writer(writer)
        .try_init()
        .map_err(|e| Error::Config(format!("logger already installed: {}", e)))?;
    Ok(guard)
}

/// Start the writer thread over `sink` with room for `buffer` pending lines.
pub fn spawn(sink: Box<dyn Write + Send>, buffer: usize) -> Result<(ChannelWriter, LogGuard)> {
    let (tx, rx) = flume::bounded(buffer);
    let dropped = Arc::new(AtomicU64::new(0));
    let handle = thread::Builder::new().name("log-writer".into()).spawn(move || write_loop(rx, sink))?;

    let writer = ChannelWriter { tx: tx.clone(), dropped: Arc::clone(&dropped) };
    Ok((writer, LogGuard { tx, dropped, writer: Some(handle) }))
}

fn write_loop(rx: flume::Receiver<LogMsg>, mut sink: Box<dyn Write + Send>) {
    while let Ok(msg) = rx.recv() {
        match msg {
            LogMsg::Line(line) => {
                if let Err(e) = sink.write_all(&line) {
                    eprintln!("log-writer: {}", e);
                }
            }
            LogMsg::Flush(ack) => {
                let _ = sink.flush();
                let _ = ack.send(());
            }
            LogMsg::Shutdown => break,
        }
    }
    let _ = sink.flush();
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_lines_reach_sink_in_order() {
        let buf = SharedBuf::default();
        let (writer, guard) = spawn(Box::new(buf.clone()), 64).unwrap();

        let mut w = writer.make_writer();
        for i in 0..10 {
            writeln!(w, "line {}", i).unwrap();
        }
        guard.flush();

        let text = String::from_utf8(buf.0.lock().clone()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 10);
        assert_eq!(lines[0], "line 0");
        assert_eq!(lines[9], "line 9");
        assert_eq!(guard.dropped(), 0);
    }

    #[test]
    fn test_full_channel_drops_without_blocking() {
        let (tx, _rx) = flume::bounded(2);
        let dropped = Arc::new(AtomicU64::new(0));
        let mut writer = ChannelWriter { tx, dropped: Arc::clone(&dropped) };

        for _ in 0..5 {
            writer.write_all(b"x\n").unwrap();
        }
        assert_eq!(dropped.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn test_drop_guard_drains() {
        let buf = SharedBuf::default();
        let (writer, guard) = spawn(Box::new(buf.clone()), 1024).unwrap();
        let mut w = writer.make_writer();
        for _ in 0..100 {
            w.write_all(b"y\n").unwrap();
        }
        drop(guard);
        assert_eq!(buf.0.lock().len(), 200);
    }
}
