// This file is part of Guardian, an edge surveillance supervisor.
// Derived from Moonfire NVR (Copyright (C) 2021 The Moonfire NVR Authors);
// see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Channel identifiers, shared between the capture supervisor, the
//! suppression bus, the store's filters, and config validation.

use std::fmt;

/// A case-insensitive, prefix-normalized channel identifier, e.g.
/// `video:lobby` or `audio:porch`.
#[derive(Clone, Debug, Eq, Hash, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct ChannelId(String);

const RECOGNIZED_PREFIXES: &[&str] = &["video", "audio"];

impl ChannelId {
    /// Normalizes a raw channel string.
    ///
    /// Trims whitespace; if the string matches `prefix:rest`, lowercases the
    /// prefix when it's one of the recognized kinds, otherwise keeps the
    /// literal prefix as given. A string with no `:` gets `default_prefix`
    /// prepended.
    pub fn normalize(raw: &str, default_prefix: &str) -> ChannelId {
        let trimmed = raw.trim();
        match trimmed.split_once(':') {
            Some((prefix, rest)) if is_ident_prefix(prefix) => {
                let lower = prefix.to_ascii_lowercase();
                if RECOGNIZED_PREFIXES.contains(&lower.as_str()) {
                    ChannelId(format!("{lower}:{rest}"))
                } else {
                    ChannelId(format!("{prefix}:{rest}"))
                }
            }
            _ => ChannelId(format!("{default_prefix}:{trimmed}")),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The prefix before the first `:`, e.g. `video` in `video:lobby`.
    pub fn kind(&self) -> &str {
        self.0.split(':').next().unwrap_or(&self.0)
    }
}

/// Matches the `^[A-Za-z0-9_-]+$` prefix shape from the channel grammar.
fn is_ident_prefix(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ChannelId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_known_prefix_case() {
        let id = ChannelId::normalize("VIDEO:Lobby", "video");
        assert_eq!(id.as_str(), "video:Lobby");
    }

    #[test]
    fn keeps_unrecognized_prefix_literal() {
        let id = ChannelId::normalize("Custom:Thing", "video");
        assert_eq!(id.as_str(), "Custom:Thing");
    }

    #[test]
    fn applies_default_prefix_when_absent() {
        let id = ChannelId::normalize("  lobby  ", "video");
        assert_eq!(id.as_str(), "video:lobby");
    }

    #[test]
    fn normalize_is_idempotent() {
        let once = ChannelId::normalize("VIDEO:Lobby", "video");
        let twice = ChannelId::normalize(once.as_str(), "video");
        assert_eq!(once, twice);
    }

    #[test]
    fn equality_is_on_normalized_form() {
        let a = ChannelId::normalize("VIDEO:lobby", "video");
        let b = ChannelId::normalize("video:lobby", "video");
        assert_eq!(a, b);
    }
}
