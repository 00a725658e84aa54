//! # Error Types
//!
//! The closed set of error kinds shared by every Karabo crate.
//!
//! Each kind carries a short wire tag ([`ErrorKind::as_str`]) and a
//! human-readable detail. `Validation` additionally carries the per-key
//! violation list produced by the [`Validator`](crate::validator::Validator).

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Result alias used throughout the Karabo crates.
pub type Result<T> = std::result::Result<T, KaraboError>;

/// Errors raised by the Karabo runtime.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum KaraboError {
    /// A path, instance, slot or class does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A value exists but has a type that cannot be losslessly converted.
    #[error("Type mismatch: {0}")]
    TypeMismatch(String),

    /// An explicit conversion (`get_as`) would lose bits or range.
    #[error("Cast failed: {0}")]
    Cast(String),

    /// Malformed input data (XML, binary, text representation).
    #[error("Parse error: {0}")]
    Parse(String),

    /// File-system or socket failure.
    #[error("I/O error: {0}")]
    Io(String),

    /// A configuration violated its schema.
    #[error("Validation failed: {}", format_violations(.0))]
    Validation(Vec<Violation>),

    /// Operation not allowed in the current state (or lock holder).
    #[error("Disallowed in current state: {0}")]
    DisallowedState(String),

    /// A request did not receive its reply in time.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// A peer violated the wire protocol.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A producer could not enqueue data for a slow consumer.
    #[error("Backpressure: {0}")]
    Backpressure(String),

    /// Plugin discovery or device class loading failed.
    #[error("Plugin error: {0}")]
    Plugin(String),

    /// Broker connection or delivery failure.
    #[error("Broker error: {0}")]
    Broker(String),

    /// The operation was canceled before completion.
    #[error("Canceled: {0}")]
    Canceled(String),

    /// Unrecoverable failure; the instance terminates.
    #[error("Fatal: {0}")]
    Fatal(String),
}

impl KaraboError {
    /// The kind of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::TypeMismatch(_) => ErrorKind::TypeMismatch,
            Self::Cast(_) => ErrorKind::Cast,
            Self::Parse(_) => ErrorKind::Parse,
            Self::Io(_) => ErrorKind::Io,
            Self::Validation(_) => ErrorKind::Validation,
            Self::DisallowedState(_) => ErrorKind::DisallowedState,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Protocol(_) => ErrorKind::Protocol,
            Self::Backpressure(_) => ErrorKind::Backpressure,
            Self::Plugin(_) => ErrorKind::Plugin,
            Self::Broker(_) => ErrorKind::Broker,
            Self::Canceled(_) => ErrorKind::Canceled,
            Self::Fatal(_) => ErrorKind::Fatal,
        }
    }

    /// Human-readable detail without the kind prefix.
    #[must_use]
    pub fn detail(&self) -> String {
        match self {
            Self::Validation(violations) => format_violations(violations),
            Self::NotFound(d)
            | Self::TypeMismatch(d)
            | Self::Cast(d)
            | Self::Parse(d)
            | Self::Io(d)
            | Self::DisallowedState(d)
            | Self::Timeout(d)
            | Self::Protocol(d)
            | Self::Backpressure(d)
            | Self::Plugin(d)
            | Self::Broker(d)
            | Self::Canceled(d)
            | Self::Fatal(d) => d.clone(),
        }
    }

    /// Rebuild an error from its wire representation.
    ///
    /// `Validation` errors need their violations; use
    /// [`KaraboError::Validation`] directly when they are known.
    #[must_use]
    pub fn from_kind(kind: ErrorKind, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        match kind {
            ErrorKind::NotFound => Self::NotFound(detail),
            ErrorKind::TypeMismatch => Self::TypeMismatch(detail),
            ErrorKind::Cast => Self::Cast(detail),
            ErrorKind::Parse => Self::Parse(detail),
            ErrorKind::Io => Self::Io(detail),
            ErrorKind::Validation => Self::Validation(vec![Violation::new(
                "",
                ViolationKind::TypeMismatch,
                detail,
            )]),
            ErrorKind::DisallowedState => Self::DisallowedState(detail),
            ErrorKind::Timeout => Self::Timeout(detail),
            ErrorKind::Protocol => Self::Protocol(detail),
            ErrorKind::Backpressure => Self::Backpressure(detail),
            ErrorKind::Plugin => Self::Plugin(detail),
            ErrorKind::Broker => Self::Broker(detail),
            ErrorKind::Canceled => Self::Canceled(detail),
            ErrorKind::Fatal => Self::Fatal(detail),
        }
    }

    /// Violations carried by a `Validation` error (empty otherwise).
    #[must_use]
    pub fn violations(&self) -> &[Violation] {
        match self {
            Self::Validation(v) => v,
            _ => &[],
        }
    }
}

impl From<std::io::Error> for KaraboError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

/// Short tag identifying an error kind on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    TypeMismatch,
    Cast,
    Parse,
    Io,
    Validation,
    DisallowedState,
    Timeout,
    Protocol,
    Backpressure,
    Plugin,
    Broker,
    Canceled,
    Fatal,
}

impl ErrorKind {
    /// Wire tag of this kind.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "NotFound",
            Self::TypeMismatch => "TypeMismatch",
            Self::Cast => "Cast",
            Self::Parse => "Parse",
            Self::Io => "Io",
            Self::Validation => "Validation",
            Self::DisallowedState => "DisallowedState",
            Self::Timeout => "Timeout",
            Self::Protocol => "Protocol",
            Self::Backpressure => "Backpressure",
            Self::Plugin => "Plugin",
            Self::Broker => "Broker",
            Self::Canceled => "Canceled",
            Self::Fatal => "Fatal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorKind {
    type Err = KaraboError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "NotFound" => Self::NotFound,
            "TypeMismatch" => Self::TypeMismatch,
            "Cast" => Self::Cast,
            "Parse" => Self::Parse,
            "Io" => Self::Io,
            "Validation" => Self::Validation,
            "DisallowedState" => Self::DisallowedState,
            "Timeout" => Self::Timeout,
            "Protocol" => Self::Protocol,
            "Backpressure" => Self::Backpressure,
            "Plugin" => Self::Plugin,
            "Broker" => Self::Broker,
            "Canceled" => Self::Canceled,
            "Fatal" => Self::Fatal,
            other => return Err(KaraboError::Parse(format!("unknown error kind '{other}'"))),
        })
    }
}

/// Kind of a single schema violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViolationKind {
    MissingMandatory,
    UnknownKey,
    TypeMismatch,
    OutOfRange,
    NotInOptions,
    DisallowedState,
    InitOnlyAfterInit,
    ReadOnly,
}

impl ViolationKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MissingMandatory => "MissingMandatory",
            Self::UnknownKey => "UnknownKey",
            Self::TypeMismatch => "TypeMismatch",
            Self::OutOfRange => "OutOfRange",
            Self::NotInOptions => "NotInOptions",
            Self::DisallowedState => "DisallowedState",
            Self::InitOnlyAfterInit => "InitOnlyAfterInit",
            Self::ReadOnly => "ReadOnly",
        }
    }
}

impl FromStr for ViolationKind {
    type Err = KaraboError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "MissingMandatory" => Self::MissingMandatory,
            "UnknownKey" => Self::UnknownKey,
            "TypeMismatch" => Self::TypeMismatch,
            "OutOfRange" => Self::OutOfRange,
            "NotInOptions" => Self::NotInOptions,
            "DisallowedState" => Self::DisallowedState,
            "InitOnlyAfterInit" => Self::InitOnlyAfterInit,
            "ReadOnly" => Self::ReadOnly,
            other => {
                return Err(KaraboError::Parse(format!(
                    "unknown violation kind '{other}'"
                )))
            }
        })
    }
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One rejected key of a configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// Full path of the offending key.
    pub path: String,
    /// What went wrong.
    pub kind: ViolationKind,
    /// Human-readable explanation.
    pub message: String,
}

impl Violation {
    #[must_use]
    pub fn new(path: impl Into<String>, kind: ViolationKind, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} '{}': {}", self.kind, self.path, self.message)
    }
}

fn format_violations(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_round_trip() {
        let err = KaraboError::Timeout("no reply".into());
        let rebuilt = KaraboError::from_kind(err.kind(), err.detail());
        assert_eq!(rebuilt, err);
        assert_eq!("Timeout".parse::<ErrorKind>().unwrap(), ErrorKind::Timeout);
    }

    #[test]
    fn test_validation_display_lists_violations() {
        let err = KaraboError::Validation(vec![
            Violation::new("a", ViolationKind::MissingMandatory, "missing"),
            Violation::new("b.c", ViolationKind::OutOfRange, "too big"),
        ]);
        let text = err.to_string();
        assert!(text.contains("MissingMandatory 'a'"));
        assert!(text.contains("OutOfRange 'b.c'"));
        assert_eq!(err.violations().len(), 2);
    }

    #[test]
    fn test_unknown_kind_is_parse_error() {
        assert!(matches!(
            "Nope".parse::<ErrorKind>(),
            Err(KaraboError::Parse(_))
        ));
    }
}
