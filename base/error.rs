// This file is part of Guardian, an edge surveillance supervisor.
// Derived from Moonfire NVR (Copyright (C) 2018 The Moonfire NVR Authors);
// see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

use std::fmt;

/// Error kind: a coarse classification a caller can match on without
/// downcasting, matching the taxonomy of §7 of the specification.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[non_exhaustive]
pub enum ErrorKind {
    Cancelled,
    Unknown,
    InvalidArgument,
    ConfigInvalid,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Internal,
    Unavailable,
    DataLoss,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::Unknown => "Unknown",
            ErrorKind::InvalidArgument => "Invalid argument",
            ErrorKind::ConfigInvalid => "Configuration invalid",
            ErrorKind::DeadlineExceeded => "Deadline exceeded",
            ErrorKind::NotFound => "Not found",
            ErrorKind::AlreadyExists => "Already exists",
            ErrorKind::PermissionDenied => "Permission denied",
            ErrorKind::FailedPrecondition => "Failed precondition",
            ErrorKind::Aborted => "Aborted",
            ErrorKind::OutOfRange => "Out of range",
            ErrorKind::Internal => "Internal",
            ErrorKind::Unavailable => "Unavailable",
            ErrorKind::DataLoss => "Data loss",
        };
        f.write_str(s)
    }
}

/// A chained error: a kind, a message, and an optional source error.
///
/// There's no `failure`/`anyhow` dependency here; `Error` is cheap enough to
/// hand-roll and `chain()` gives call sites the same "print every cause"
/// behavior those crates provide.
pub struct Error {
    kind: ErrorKind,
    msg: Option<String>,
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl Error {
    pub fn new(kind: ErrorKind, msg: impl Into<String>) -> Self {
        Error {
            kind,
            msg: Some(msg.into()),
            source: None,
        }
    }

    pub fn wrap<E>(kind: ErrorKind, msg: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Error {
            kind,
            msg: Some(msg.into()),
            source: Some(Box::new(source)),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns a displayable value that prints this error followed by every
    /// `caused by:` in its source chain, one per line.
    pub fn chain(&self) -> Chain<'_> {
        Chain(self)
    }
}

pub struct Chain<'a>(&'a Error);

impl fmt::Display for Chain<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)?;
        let mut cur: Option<&(dyn std::error::Error + 'static)> =
            self.0.source.as_deref().map(|e| e as _);
        while let Some(e) = cur {
            write!(f, "\ncaused by: {e}")?;
            cur = e.source();
        }
        Ok(())
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.chain())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.msg {
            None => fmt::Display::fmt(&self.kind, f),
            Some(m) => write!(f, "{}: {}", self.kind, m),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_deref().map(|e| e as _)
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Error {
        Error {
            kind,
            msg: None,
            source: None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Error {
        let kind = match e.kind() {
            std::io::ErrorKind::NotFound => ErrorKind::NotFound,
            std::io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied,
            std::io::ErrorKind::AlreadyExists => ErrorKind::AlreadyExists,
            _ => ErrorKind::Unknown,
        };
        Error::wrap(kind, "io error", e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Error {
        Error::wrap(ErrorKind::ConfigInvalid, "json error", e)
    }
}

/// Extension methods for `Result`.
pub trait ResultExt<T> {
    /// Annotates an error with the given kind and a context message,
    /// preserving the original as the cause.
    fn err_kind(self, k: ErrorKind, msg: impl Into<String>) -> Result<T, Error>;
}

impl<T, E> ResultExt<T> for Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn err_kind(self, k: ErrorKind, msg: impl Into<String>) -> Result<T, Error> {
        self.map_err(|e| Error::wrap(k, msg, e))
    }
}

/// Like `anyhow::bail!`, but the first argument specifies a type as an `ErrorKind`.
///
/// ```
/// use guardian_base::bail_t;
/// let e = || -> Result<(), guardian_base::Error> {
///     bail_t!(PermissionDenied, "unknown user: {}", "slamb");
/// }().unwrap_err();
/// assert_eq!(e.kind(), guardian_base::ErrorKind::PermissionDenied);
/// assert_eq!(e.to_string(), "Permission denied: unknown user: slamb");
/// ```
#[macro_export]
macro_rules! bail_t {
    ($t:ident, $e:expr) => {
        return Err($crate::Error::new($crate::ErrorKind::$t, $e));
    };
    ($t:ident, $fmt:expr, $($arg:tt)+) => {
        return Err($crate::Error::new($crate::ErrorKind::$t, format!($fmt, $($arg)+)));
    };
}

/// Like `anyhow::anyhow!`, but the first argument specifies a type as an `ErrorKind`.
///
/// ```
/// use guardian_base::format_err_t;
/// let e = format_err_t!(PermissionDenied, "unknown user: {}", "slamb");
/// assert_eq!(e.kind(), guardian_base::ErrorKind::PermissionDenied);
/// assert_eq!(e.to_string(), "Permission denied: unknown user: slamb");
/// ```
#[macro_export]
macro_rules! format_err_t {
    ($t:ident, $e:expr) => {
        $crate::Error::new($crate::ErrorKind::$t, $e)
    };
    ($t:ident, $fmt:expr, $($arg:tt)+) => {
        $crate::Error::new($crate::ErrorKind::$t, format!($fmt, $($arg)+))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_prints_causes() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "file gone");
        let e = Error::wrap(ErrorKind::NotFound, "opening snapshot", io);
        let rendered = e.chain().to_string();
        assert!(rendered.starts_with("Not found: opening snapshot"));
        assert!(rendered.contains("caused by: file gone"));
    }

    #[test]
    fn err_kind_wraps() {
        let r: Result<(), std::io::Error> =
            Err(std::io::Error::new(std::io::ErrorKind::Other, "boom"));
        let e = r.err_kind(ErrorKind::Internal, "doing a thing").unwrap_err();
        assert_eq!(e.kind(), ErrorKind::Internal);
    }
}
