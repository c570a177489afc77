//! Diagnostic log priorities and the host log sink
//!
//! Messages are tagged with a syslog-style [`LogPriority`], plus one level
//! below `Debug` (`Trace`) used for the per-instruction interpreter trace.
//! A [`Context`] may be given a host callback that receives these messages;
//! independent of that, every call site also emits a matching `tracing`
//! event, so the crate is observable through the ordinary Rust logging
//! ecosystem even with no host callback installed.
//!
//! [`Context`]: crate::context::Context

use std::fmt;
use std::str::FromStr;

use strum::{Display, EnumString};

/// Severity of a diagnostic message, ordered from most to least urgent.
///
/// Parses (case-insensitively) from the syslog names the design's §6
/// environment configuration recognises, or from a small integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, EnumString, Display, Default)]
#[strum(serialize_all = "lowercase")]
pub enum LogPriority {
    Emerg,
    Alert,
    Crit,
    Err,
    #[default]
    Warning,
    Notice,
    Info,
    Debug,
    /// One level below `Debug`: per-instruction interpreter tracing.
    Trace,
}

impl LogPriority {
    /// Parse a numeric syslog-style level (`0` = `Emerg` .. `7` = `Debug`),
    /// falling back to name parsing (`"emerg"`, `"warning"`, `"trace"`, ...).
    ///
    /// Returns `None` for anything recognised as neither.
    pub fn parse(text: &str) -> Option<Self> {
        if let Ok(n) = text.trim().parse::<u8>() {
            return Self::from_level(n);
        }
        Self::from_str(&text.trim().to_ascii_lowercase()).ok()
    }

    /// Map a numeric level to a priority. `8` is accepted as `Trace`, one
    /// past the syslog range, matching this crate's extra level.
    pub const fn from_level(n: u8) -> Option<Self> {
        Some(match n {
            0 => Self::Emerg,
            1 => Self::Alert,
            2 => Self::Crit,
            3 => Self::Err,
            4 => Self::Warning,
            5 => Self::Notice,
            6 => Self::Info,
            7 => Self::Debug,
            8 => Self::Trace,
            _ => return None,
        })
    }

    /// The matching `tracing` level, used to mirror host log messages into
    /// the ambient `tracing` subscriber.
    pub const fn tracing_level(self) -> tracing::Level {
        match self {
            Self::Emerg | Self::Alert | Self::Crit | Self::Err => tracing::Level::ERROR,
            Self::Warning => tracing::Level::WARN,
            Self::Notice | Self::Info => tracing::Level::INFO,
            Self::Debug => tracing::Level::DEBUG,
            Self::Trace => tracing::Level::TRACE,
        }
    }
}

/// A single diagnostic message, as delivered to a host log callback.
///
/// Borrows its formatted text rather than the format arguments directly —
/// hosts that want to keep the message past the callback's lifetime must
/// copy it.
pub struct LogRecord<'a> {
    pub priority: LogPriority,
    pub file: &'a str,
    pub line: u32,
    pub function: &'a str,
    pub message: &'a str,
}

impl fmt::Display for LogRecord<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} {}: [{}] {}",
            self.file, self.line, self.function, self.priority, self.message
        )
    }
}

/// Host callback invoked for every diagnostic message at or above the
/// `Context`'s configured priority.
pub type LogSink = Box<dyn Fn(LogRecord<'_>)>;

/// Emit to both the host sink (if any, and if it's at or above `min`) and
/// `tracing`. Used by every diagnostic call site in the crate so hosts never
/// have to choose between the callback interface and the ecosystem one.
pub(crate) fn emit(
    sink: Option<&LogSink>,
    min: LogPriority,
    priority: LogPriority,
    file: &str,
    line: u32,
    function: &str,
    message: fmt::Arguments<'_>,
) {
    let text = message.to_string();
    match priority.tracing_level() {
        tracing::Level::ERROR => tracing::error!(%file, line, function, "{text}"),
        tracing::Level::WARN => tracing::warn!(%file, line, function, "{text}"),
        tracing::Level::INFO => tracing::info!(%file, line, function, "{text}"),
        tracing::Level::DEBUG => tracing::debug!(%file, line, function, "{text}"),
        tracing::Level::TRACE => tracing::trace!(%file, line, function, "{text}"),
    }
    if priority > min {
        return;
    }
    if let Some(sink) = sink {
        sink(LogRecord {
            priority,
            file,
            line,
            function,
            message: &text,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_names_and_numbers() {
        assert_eq!(LogPriority::parse("warning"), Some(LogPriority::Warning));
        assert_eq!(LogPriority::parse("WARNING"), Some(LogPriority::Warning));
        assert_eq!(LogPriority::parse("4"), Some(LogPriority::Warning));
        assert_eq!(LogPriority::parse("trace"), Some(LogPriority::Trace));
        assert_eq!(LogPriority::parse("nonsense"), None);
    }

    #[test]
    fn ordered_most_to_least_urgent() {
        assert!(LogPriority::Emerg < LogPriority::Debug);
        assert!(LogPriority::Debug < LogPriority::Trace);
    }
}
