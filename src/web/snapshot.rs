// This file is part of Guardian, an edge surveillance supervisor.
// Derived from Moonfire NVR (Copyright (C) 2021 The Moonfire NVR Authors);
// see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Snapshot/face-snapshot/diff file serving: allow-list canonicalization
//! (§4.6 blocks traversal strings such as `../etc/passwd`), `ETag`/
//! `If-Modified-Since` conditional responses, and PNG diffing via the
//! `image` crate.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

pub enum Resolved {
    Ok(PathBuf),
    Forbidden,
    NotFound,
}

/// Resolves `raw_path` (as stored in an event's `meta.snapshot`) against the
/// configured allow-list, rejecting anything that canonicalizes outside
/// every allowed root.
pub fn resolve(raw_path: &str, allow_list: &[PathBuf]) -> Resolved {
    let candidate = Path::new(raw_path);
    let canonical = match candidate.canonicalize() {
        Ok(p) => p,
        Err(_) => return Resolved::NotFound,
    };
    for root in allow_list {
        let Ok(root_canonical) = root.canonicalize() else { continue };
        if canonical.starts_with(&root_canonical) {
            return Resolved::Ok(canonical);
        }
    }
    Resolved::Forbidden
}

pub struct FileMeta {
    pub etag: String,
    pub last_modified_http: String,
    pub modified: SystemTime,
}

pub fn file_meta(path: &Path) -> std::io::Result<FileMeta> {
    let meta = std::fs::metadata(path)?;
    let modified = meta.modified()?;
    let secs = modified
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let etag = format!("\"{:x}-{:x}\"", meta.len(), secs);
    Ok(FileMeta {
        etag,
        last_modified_http: http_date(modified),
        modified,
    })
}

/// Minimal RFC 7231 HTTP-date formatter (`Sun, 06 Nov 1994 08:49:37 GMT`),
/// avoiding a `chrono` dependency the teacher's stack doesn't carry.
pub fn http_date(t: SystemTime) -> String {
    let ts = t
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64;
    let zoned = jiff::Timestamp::from_second(ts)
        .unwrap_or(jiff::Timestamp::UNIX_EPOCH)
        .to_zoned(jiff::tz::TimeZone::UTC);
    zoned.strftime("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// `true` if `if_modified_since` (an HTTP-date the client sent) is not
/// older than the file's actual modification time, meaning `304` applies.
pub fn not_modified_since(if_modified_since: &str, modified: SystemTime) -> bool {
    // Comparison at one-second granularity, matching HTTP-date precision.
    let file_http_date = http_date(modified);
    if_modified_since == file_http_date
}

#[derive(Debug)]
pub enum DiffError {
    Io(std::io::Error),
    Decode(String),
    DimensionMismatch,
}

/// Decodes two PNGs and produces an absolute-difference PNG, or
/// `DimensionMismatch` if their dimensions differ (§4.6: `409 Conflict`).
pub fn diff_png(baseline: &Path, current: &Path) -> Result<Vec<u8>, DiffError> {
    let a = image::open(baseline).map_err(|e| DiffError::Decode(e.to_string()))?.to_rgba8();
    let b = image::open(current).map_err(|e| DiffError::Decode(e.to_string()))?.to_rgba8();
    if a.dimensions() != b.dimensions() {
        return Err(DiffError::DimensionMismatch);
    }
    let (w, h) = a.dimensions();
    let mut out = image::RgbaImage::new(w, h);
    for (x, y, pixel) in out.enumerate_pixels_mut() {
        let pa = a.get_pixel(x, y);
        let pb = b.get_pixel(x, y);
        let diff = [
            pa[0].abs_diff(pb[0]),
            pa[1].abs_diff(pb[1]),
            pa[2].abs_diff(pb[2]),
            255,
        ];
        *pixel = image::Rgba(diff);
    }
    let mut buf = std::io::Cursor::new(Vec::new());
    image::DynamicImage::ImageRgba8(out)
        .write_to(&mut buf, image::ImageFormat::Png)
        .map_err(|e| DiffError::Decode(e.to_string()))?;
    Ok(buf.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_rejects_path_outside_allow_list() {
        let tmp = tempfile::tempdir().unwrap();
        let allowed = tmp.path().join("allowed");
        std::fs::create_dir_all(&allowed).unwrap();
        let outside = tmp.path().join("outside.png");
        std::fs::write(&outside, b"x").unwrap();
        let resolved = resolve(outside.to_str().unwrap(), &[allowed]);
        assert!(matches!(resolved, Resolved::Forbidden));
    }

    #[test]
    fn resolve_accepts_path_inside_allow_list() {
        let tmp = tempfile::tempdir().unwrap();
        let allowed = tmp.path().join("allowed");
        std::fs::create_dir_all(&allowed).unwrap();
        let inside = allowed.join("snap.png");
        std::fs::write(&inside, b"x").unwrap();
        let resolved = resolve(inside.to_str().unwrap(), &[allowed]);
        assert!(matches!(resolved, Resolved::Ok(_)));
    }

    #[test]
    fn resolve_reports_not_found_for_missing_file() {
        let tmp = tempfile::tempdir().unwrap();
        let missing = tmp.path().join("nope.png");
        let resolved = resolve(missing.to_str().unwrap(), &[tmp.path().to_path_buf()]);
        assert!(matches!(resolved, Resolved::NotFound));
    }
}
