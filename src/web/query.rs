// This file is part of Guardian, an edge surveillance supervisor.
// Derived from Moonfire NVR (Copyright (C) 2021 The Moonfire NVR Authors);
// see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! A small query-string grammar, parsed with `nom` rather than pulling in a
//! dedicated URL crate for one micro-format: `key=value&key=value`,
//! percent-decoded, with repeated keys collected in order.

use nom::bytes::complete::{is_not, tag};
use nom::combinator::opt;
use nom::multi::separated_list0;
use nom::sequence::preceded;
use nom::IResult;
use std::collections::BTreeMap;

/// Parses one `key` or `key=value` pair (value absent means `""`).
fn pair(input: &str) -> IResult<&str, (&str, &str)> {
    let (input, key) = is_not("=&")(input)?;
    let (input, value) = opt(preceded(tag("="), is_not("&")))(input)?;
    Ok((input, (key, value.unwrap_or(""))))
}

/// Parses the full `a=b&c=d` grammar, tolerating a trailing empty segment
/// from a stray `&`.
fn pairs(input: &str) -> IResult<&str, Vec<(&str, &str)>> {
    separated_list0(tag("&"), pair)(input)
}

fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' if i + 2 < bytes.len() => {
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
                if let Some(byte) = hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                    out.push(byte);
                    i += 3;
                } else {
                    out.push(bytes[i]);
                    i += 1;
                }
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Parses a raw query string (without the leading `?`) into an ordered
/// multimap, applying percent-decoding to both keys and values.
pub struct Query(Vec<(String, String)>);

impl Query {
    pub fn parse(raw: &str) -> Query {
        let filtered: String = raw.split('&').filter(|p| !p.is_empty()).collect::<Vec<_>>().join("&");
        let parsed = pairs(&filtered).map(|(_, p)| p).unwrap_or_default();
        Query(
            parsed
                .into_iter()
                .map(|(k, v)| (percent_decode(k), percent_decode(v)))
                .collect(),
        )
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    /// All values for a repeated key, e.g. `?channel=a&channel=b`.
    pub fn get_all(&self, key: &str) -> Vec<&str> {
        self.0.iter().filter(|(k, _)| k == key).map(|(_, v)| v.as_str()).collect()
    }

    /// Splits a CSV-valued param, trimming each entry and dropping empties.
    pub fn get_csv(&self, key: &str) -> Vec<String> {
        self.get(key)
            .map(|v| v.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect())
            .unwrap_or_default()
    }

    pub fn flag(&self, key: &str) -> bool {
        matches!(self.get(key), Some("1") | Some("true"))
    }

    pub fn as_map(&self) -> BTreeMap<String, String> {
        self.0.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_pairs() {
        let q = Query::parse("source=video&limit=10");
        assert_eq!(q.get("source"), Some("video"));
        assert_eq!(q.get("limit"), Some("10"));
    }

    #[test]
    fn collects_repeated_keys_in_order() {
        let q = Query::parse("channel=a&channel=b&channel=c");
        assert_eq!(q.get_all("channel"), vec!["a", "b", "c"]);
    }

    #[test]
    fn percent_decodes_values() {
        let q = Query::parse("search=hello%20world%26more");
        assert_eq!(q.get("search"), Some("hello world&more"));
    }

    #[test]
    fn csv_trims_and_drops_empty() {
        let q = Query::parse("channels=%20a%20,b,,c");
        assert_eq!(q.get_csv("channels"), vec!["a", "b", "c"]);
    }

    #[test]
    fn flag_recognizes_truthy_values() {
        assert!(Query::parse("faces=1").flag("faces"));
        assert!(!Query::parse("faces=0").flag("faces"));
        assert!(!Query::parse("").flag("faces"));
    }
}
