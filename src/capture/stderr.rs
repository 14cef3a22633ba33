// This file is part of Guardian, an edge surveillance supervisor.
// Derived from Moonfire NVR (Copyright (C) 2021 The Moonfire NVR Authors);
// see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Stderr line classification (§4.1). Priority-ordered pattern matching;
//! the first class to match a lifecycle wins and subsequent matches of the
//! same class within that lifecycle are ignored by the caller.

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FailureClass {
    FfmpegMissing,
    RtspAuthFailure,
    RtspNotFound,
    RtspTimeout,
    RtspConnectionFailure,
    CorruptedFrame,
    StreamError,
    FfmpegError,
    FfmpegExit,
    ForceKill,
    StartTimeout,
    WatchdogTimeout,
    StreamIdle,
}

impl FailureClass {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureClass::FfmpegMissing => "ffmpeg-missing",
            FailureClass::RtspAuthFailure => "rtsp-auth-failure",
            FailureClass::RtspNotFound => "rtsp-not-found",
            FailureClass::RtspTimeout => "rtsp-timeout",
            FailureClass::RtspConnectionFailure => "rtsp-connection-failure",
            FailureClass::CorruptedFrame => "corrupted-frame",
            FailureClass::StreamError => "stream-error",
            FailureClass::FfmpegError => "ffmpeg-error",
            FailureClass::FfmpegExit => "ffmpeg-exit",
            FailureClass::ForceKill => "force-kill",
            FailureClass::StartTimeout => "start-timeout",
            FailureClass::WatchdogTimeout => "watchdog-timeout",
            FailureClass::StreamIdle => "stream-idle",
        }
    }

    /// Whether a classified failure of this class advances the RTSP
    /// transport fallback sequence (§4.1: only timeouts and connection
    /// failures do; auth and not-found do not, since changing transport
    /// wouldn't fix either).
    pub fn advances_transport(self) -> bool {
        matches!(
            self,
            FailureClass::RtspTimeout | FailureClass::RtspConnectionFailure
        )
    }
}

/// Priority-ordered matchers; the first one whose needle appears in `line`
/// (case-sensitive, matching the source patterns verbatim) wins.
const PATTERNS: &[(FailureClass, &[&str])] = &[
    (
        FailureClass::RtspAuthFailure,
        &["401", "403 Forbidden"],
    ),
    (
        FailureClass::RtspNotFound,
        &["404", "454 Session Not Found"],
    ),
    (
        FailureClass::RtspTimeout,
        &["DESCRIBE failed: timed out", "Read timeout", "Connection timed out"],
    ),
    (
        FailureClass::RtspConnectionFailure,
        &["Connection refused", "connection refused", "Network is unreachable", "network is unreachable"],
    ),
];

/// Classifies a single stderr line. Returns `None` if no pattern matches;
/// callers fold over all lines from one lifecycle and keep the first `Some`.
pub fn classify_line(line: &str) -> Option<FailureClass> {
    for (class, needles) in PATTERNS {
        if needles.iter().any(|n| line.contains(n)) {
            return Some(*class);
        }
    }
    None
}

/// Classifies a spawn-time I/O error, e.g. `ffmpeg` not being on `PATH`.
pub fn classify_spawn_error(e: &std::io::Error) -> FailureClass {
    if e.kind() == std::io::ErrorKind::NotFound {
        FailureClass::FfmpegMissing
    } else {
        FailureClass::FfmpegError
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_auth_before_timeout_by_priority() {
        // A line that (implausibly) contains both markers should match the
        // higher-priority class.
        let line = "401 Unauthorized then Read timeout";
        assert_eq!(classify_line(line), Some(FailureClass::RtspAuthFailure));
    }

    #[test]
    fn classifies_known_patterns() {
        assert_eq!(
            classify_line("rtsp error: 454 Session Not Found"),
            Some(FailureClass::RtspNotFound)
        );
        assert_eq!(
            classify_line("Connection refused by peer"),
            Some(FailureClass::RtspConnectionFailure)
        );
        assert_eq!(classify_line("harmless ffmpeg banner line"), None);
    }

    #[test]
    fn only_timeout_and_connection_failure_advance_transport() {
        assert!(FailureClass::RtspTimeout.advances_transport());
        assert!(FailureClass::RtspConnectionFailure.advances_transport());
        assert!(!FailureClass::RtspAuthFailure.advances_transport());
        assert!(!FailureClass::RtspNotFound.advances_transport());
    }
}
