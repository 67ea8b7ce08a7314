//! Platform log sink
//!
//! Everything the bridge and the engines log ends up in one [`LogSink`]:
//! logcat on Android, stderr elsewhere. Two paths lead there:
//!
//! ```text
//!  tracing::info!(..) ──▶ fmt subscriber ──▶ SinkMakeWriter ──┐
//!                                                            ├──▶ LogSink::write(level, tag, msg)
//!  engine ──▶ Logger.info / .error (io::Write) ──────────────┘
//! ```
//!
//! Bridge records use the configured tag (`WireGuard/GoBackend`); engine
//! records append the interface name (`WireGuard/GoBackend/wg0`).

use std::fmt;
use std::io;
use std::sync::Arc;
use tracing::{Level, Metadata};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::config::BridgeConfig;

/// Log priority, numbered like Android's `android_LogPriority`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(i32)]
pub enum LogLevel {
    Debug = 3,
    Info = 4,
    Warn = 5,
    Error = 6,
}

impl LogLevel {
    /// One-letter logcat label
    pub fn letter(self) -> char {
        match self {
            LogLevel::Debug => 'D',
            LogLevel::Info => 'I',
            LogLevel::Warn => 'W',
            LogLevel::Error => 'E',
        }
    }
}

impl From<&Level> for LogLevel {
    fn from(level: &Level) -> Self {
        if *level == Level::ERROR {
            LogLevel::Error
        } else if *level == Level::WARN {
            LogLevel::Warn
        } else if *level == Level::INFO {
            LogLevel::Info
        } else {
            LogLevel::Debug
        }
    }
}

/// Destination for finished log records.
pub trait LogSink: Send + Sync {
    fn write(&self, level: LogLevel, tag: &str, message: &str);
}

/// Android `liblog` sink.
#[cfg(target_os = "android")]
#[derive(Debug, Default, Clone, Copy)]
pub struct AndroidLogSink;

#[cfg(target_os = "android")]
impl LogSink for AndroidLogSink {
    fn write(&self, level: LogLevel, tag: &str, message: &str) {
        let (Some(tag), Some(text)) = (c_string(tag), c_string(message)) else {
            return;
        };
        // SAFETY: both strings are NUL-terminated and outlive the call.
        unsafe {
            android_log_sys::__android_log_write(
                level as std::ffi::c_int,
                tag.as_ptr(),
                text.as_ptr(),
            );
        }
    }
}

#[cfg(target_os = "android")]
fn c_string(s: &str) -> Option<std::ffi::CString> {
    std::ffi::CString::new(s.replace('\0', "")).ok()
}

/// Writes `L/tag: message` lines to stderr, logcat style.
#[derive(Debug, Default, Clone, Copy)]
pub struct StderrLogSink;

impl LogSink for StderrLogSink {
    fn write(&self, level: LogLevel, tag: &str, message: &str) {
        eprintln!("{}/{}: {}", level.letter(), tag, message);
    }
}

/// The sink for the current platform.
pub fn platform_sink() -> Arc<dyn LogSink> {
    #[cfg(target_os = "android")]
    {
        Arc::new(AndroidLogSink)
    }
    #[cfg(not(target_os = "android"))]
    {
        Arc::new(StderrLogSink)
    }
}

/// One severity of a [`Logger`] as an `io::Write`.
///
/// Every `write` call becomes one record; a trailing newline is dropped.
#[derive(Clone)]
pub struct LogWriter {
    sink: Arc<dyn LogSink>,
    tag: Arc<str>,
    level: LogLevel,
}

impl io::Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let text = String::from_utf8_lossy(buf);
        let text = text.strip_suffix('\n').unwrap_or(&text);
        let text = text.strip_suffix('\r').unwrap_or(text);
        self.sink.write(self.level, &self.tag, text);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Per-tunnel logger handed to the engine.
#[derive(Clone)]
pub struct Logger {
    sink: Arc<dyn LogSink>,
    tag: Arc<str>,
}

impl Logger {
    /// Logger tagged `<prefix>/<interface>`
    pub fn new(sink: Arc<dyn LogSink>, prefix: &str, interface: &str) -> Self {
        Self {
            sink,
            tag: Arc::from(format!("{prefix}/{interface}")),
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn writer(&self, level: LogLevel) -> LogWriter {
        LogWriter {
            sink: Arc::clone(&self.sink),
            tag: Arc::clone(&self.tag),
            level,
        }
    }

    pub fn debug(&self, message: impl fmt::Display) {
        self.sink.write(LogLevel::Debug, &self.tag, &message.to_string());
    }

    pub fn info(&self, message: impl fmt::Display) {
        self.sink.write(LogLevel::Info, &self.tag, &message.to_string());
    }

    pub fn error(&self, message: impl fmt::Display) {
        self.sink.write(LogLevel::Error, &self.tag, &message.to_string());
    }
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger").field("tag", &self.tag).finish()
    }
}

/// Routes formatted `tracing` events into a [`LogSink`].
pub struct SinkMakeWriter {
    sink: Arc<dyn LogSink>,
    tag: Arc<str>,
}

impl SinkMakeWriter {
    pub fn new(sink: Arc<dyn LogSink>, tag: &str) -> Self {
        Self {
            sink,
            tag: Arc::from(tag),
        }
    }

    fn writer(&self, level: LogLevel) -> LogWriter {
        LogWriter {
            sink: Arc::clone(&self.sink),
            tag: Arc::clone(&self.tag),
            level,
        }
    }
}

impl<'a> MakeWriter<'a> for SinkMakeWriter {
    type Writer = LogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.writer(LogLevel::Info)
    }

    fn make_writer_for(&'a self, meta: &Metadata<'_>) -> Self::Writer {
        self.writer(LogLevel::from(meta.level()))
    }
}

/// Install the process-wide subscriber.
///
/// `RUST_LOG` wins over the configured level. Returns false if a global
/// subscriber was already set.
pub fn init(config: &BridgeConfig, sink: Arc<dyn LogSink>) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(SinkMakeWriter::new(sink, &config.log_tag))
        .with_ansi(false)
        .without_time()
        .with_target(false)
        .with_level(false)
        .compact()
        .try_init()
        .is_ok()
}
