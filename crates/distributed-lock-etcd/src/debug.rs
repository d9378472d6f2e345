//! Per-instance debug trail of the lock protocol.

use std::fmt;
use std::io::Write;

use parking_lot::Mutex;
use tracing::debug;

/// Sink receiving one line per protocol step.
pub type DebugSink = Box<dyn Write + Send>;

/// Emits protocol steps as `tracing` events and, when a sink is configured,
/// as `"{holder} {message}"` lines.
///
/// Write failures are ignored; logging never changes the protocol outcome.
#[derive(Default)]
pub(crate) struct DebugLog {
    sink: Mutex<Option<DebugSink>>,
}

impl DebugLog {
    pub(crate) fn new(sink: Option<DebugSink>) -> Self {
        Self {
            sink: Mutex::new(sink),
        }
    }

    pub(crate) fn set_sink(&self, sink: Option<DebugSink>) {
        *self.sink.lock() = sink;
    }

    pub(crate) fn log(&self, holder: &str, key: &str, message: fmt::Arguments<'_>) {
        debug!(holder, lock.key = key, "{message}");

        if let Some(sink) = self.sink.lock().as_mut() {
            let _ = writeln!(sink, "{holder} {message}");
        }
    }
}

impl fmt::Debug for DebugLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DebugLog")
            .field("sink", &self.sink.lock().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    /// Writer appending into a shared buffer.
    #[derive(Clone, Default)]
    struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_lines_are_prefixed_with_holder() {
        let buffer = SharedBuffer::default();
        let log = DebugLog::new(Some(Box::new(buffer.clone())));
        log.log("host-1-x", "/mylock", format_args!("Create node {} OK", "/mylock"));
        log.log("host-1-x", "/mylock", format_args!("Watching {} ...", "/mylock"));

        let written = String::from_utf8(buffer.0.lock().clone()).unwrap();
        assert_eq!(
            written,
            "host-1-x Create node /mylock OK\nhost-1-x Watching /mylock ...\n"
        );
    }

    #[test]
    fn test_without_sink_nothing_is_written() {
        let buffer = SharedBuffer::default();
        let log = DebugLog::default();
        log.log("holder", "/mylock", format_args!("ignored"));

        log.set_sink(Some(Box::new(buffer.clone())));
        log.log("holder", "/mylock", format_args!("kept"));
        log.set_sink(None);
        log.log("holder", "/mylock", format_args!("dropped"));

        assert_eq!(buffer.0.lock().as_slice(), b"holder kept\n");
    }
}
