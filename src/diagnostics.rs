//! Diagnostic log owned by the audio engine
//!
//! Lifecycle events and periodic state go to a truncated text file and are
//! mirrored to the `log` facade, which the host routes to the console. Writes
//! are best-effort: a failing sink is dropped and the mirror keeps working.

use log::Level;
use parking_lot::Mutex;
use std::fs::File;
use std::io::{self, LineWriter, Write};
use std::path::Path;
use std::time::Instant;

const MIRROR_TARGET: &str = "loopviz::diagnostics";

/// Append-only diagnostic log
pub struct DiagnosticLog {
    sink: Mutex<Option<Box<dyn Write + Send>>>,
    opened: Instant,
}

impl DiagnosticLog {
    /// Create (truncating) the log file at `path`
    pub fn create(path: &Path) -> io::Result<Self> {
        let file = File::create(path)?;
        Ok(Self::from_writer(LineWriter::new(file)))
    }

    /// Open the file at `path` if given, falling back to console only
    pub fn create_or_console(path: Option<&Path>) -> Self {
        match path {
            Some(path) => Self::create(path).unwrap_or_else(|e| {
                log::warn!(
                    "Cannot open diagnostic log {}: {}; logging to console only",
                    path.display(),
                    e
                );
                Self::console()
            }),
            None => Self::console(),
        }
    }

    /// Log that only mirrors to the `log` facade
    pub fn console() -> Self {
        Self {
            sink: Mutex::new(None),
            opened: Instant::now(),
        }
    }

    /// Log writing to an arbitrary sink
    pub fn from_writer<W: Write + Send + 'static>(writer: W) -> Self {
        Self {
            sink: Mutex::new(Some(Box::new(writer))),
            opened: Instant::now(),
        }
    }

    pub fn info(&self, message: &str) {
        self.record(Level::Info, message);
    }

    pub fn warn(&self, message: &str) {
        self.record(Level::Warn, message);
    }

    pub fn error(&self, message: &str) {
        self.record(Level::Error, message);
    }

    /// Whether a file or writer sink is still attached
    pub fn is_open(&self) -> bool {
        self.sink.lock().is_some()
    }

    /// Flush and release the sink; later entries only reach the mirror
    pub fn close(&self) {
        if let Some(mut sink) = self.sink.lock().take() {
            if let Err(e) = sink.flush() {
                log::warn!("Failed to flush diagnostic log: {}", e);
            }
        }
    }

    fn record(&self, level: Level, message: &str) {
        log::log!(target: MIRROR_TARGET, level, "{}", message);

        let elapsed = self.opened.elapsed().as_millis();
        let mut guard = self.sink.lock();
        if let Some(sink) = guard.as_mut() {
            let written = writeln!(sink, "[{:08}ms] {:<5} {}", elapsed, level, message)
                .and_then(|_| sink.flush());
            if let Err(e) = written {
                log::warn!("Diagnostic log write failed, disabling file output: {}", e);
                *guard = None;
            }
        }
    }
}

impl Drop for DiagnosticLog {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Arc;

    /// In-memory sink shared between a log and the test
    #[derive(Clone, Default)]
    pub(crate) struct SharedBuffer(pub Arc<Mutex<Vec<u8>>>);

    impl SharedBuffer {
        pub(crate) fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock()).into_owned()
        }
    }

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct BrokenSink;

    impl Write for BrokenSink {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::Other, "disk full"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn temp_log_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("loopviz-{}-{}.txt", name, std::process::id()))
    }

    #[test]
    fn entries_are_timestamped_lines() {
        let buffer = SharedBuffer::default();
        let log = DiagnosticLog::from_writer(buffer.clone());

        log.info("engine starting");
        log.error("capture failed");

        let contents = buffer.contents();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        for line in &lines {
            assert!(line.starts_with('['));
            assert_eq!(&line[9..12], "ms]");
            assert!(line[1..9].chars().all(|c| c.is_ascii_digit()));
        }
        assert!(lines[0].ends_with("INFO  engine starting"));
        assert!(lines[1].ends_with("ERROR capture failed"));
    }

    #[test]
    fn close_detaches_sink() {
        let buffer = SharedBuffer::default();
        let log = DiagnosticLog::from_writer(buffer.clone());
        log.info("before");

        log.close();
        log.close();
        log.warn("after");

        assert!(!log.is_open());
        let contents = buffer.contents();
        assert!(contents.contains("before"));
        assert!(!contents.contains("after"));
    }

    #[test]
    fn failing_sink_is_dropped() {
        let log = DiagnosticLog::from_writer(BrokenSink);
        log.info("first");

        assert!(!log.is_open());
        log.info("second");
    }

    #[test]
    fn create_truncates_existing_file() {
        let path = temp_log_path("truncate");
        std::fs::write(&path, "stale contents\n").unwrap();

        let log = DiagnosticLog::create(&path).unwrap();
        log.info("fresh run");
        log.close();

        let contents = std::fs::read_to_string(&path).unwrap();
        let _ = std::fs::remove_file(&path);
        assert!(!contents.contains("stale"));
        assert!(contents.contains("fresh run"));
    }

    #[test]
    fn unwritable_path_falls_back_to_console() {
        let path = std::env::temp_dir()
            .join("loopviz-missing-dir")
            .join("nested")
            .join("log.txt");

        let log = DiagnosticLog::create_or_console(Some(&path));

        assert!(!log.is_open());
        log.info("still works");
    }

    #[test]
    fn console_log_has_no_sink() {
        assert!(!DiagnosticLog::console().is_open());
        assert!(!DiagnosticLog::create_or_console(None).is_open());
    }
}
