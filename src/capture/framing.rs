// This file is part of Guardian, an edge surveillance supervisor.
// Derived from Moonfire NVR (Copyright (C) 2021 The Moonfire NVR Authors);
// see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Frame delimiting over the decoder subprocess's stdout (§4.1). The PNG
//! image2pipe stream concatenates whole PNG files back-to-back; a frame
//! boundary is any occurrence of the 8-byte PNG magic after the first.

use memchr::memmem;

pub const PNG_MAGIC: [u8; 8] = [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];

/// Accumulates subprocess stdout bytes and yields complete frames.
///
/// Bounded by `max_buffer_bytes`: if that many bytes accumulate without a
/// second marker appearing, the caller should treat it as a `corrupted-frame`
/// failure and reset the framer.
pub struct Framer {
    buf: Vec<u8>,
    max_buffer_bytes: usize,
}

#[derive(Debug, Eq, PartialEq)]
pub enum FeedError {
    BufferOverflow,
}

impl Framer {
    pub fn new(max_buffer_bytes: usize) -> Self {
        Framer {
            buf: Vec::new(),
            max_buffer_bytes,
        }
    }

    /// Feeds newly read bytes in, returning every complete frame now
    /// available (in order), retaining any trailing partial frame.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<Vec<u8>>, FeedError> {
        self.buf.extend_from_slice(chunk);
        if self.buf.len() > self.max_buffer_bytes {
            return Err(FeedError::BufferOverflow);
        }

        let mut frames = Vec::new();
        loop {
            let markers: Vec<usize> = memmem::find_iter(&self.buf, &PNG_MAGIC).collect();
            if markers.len() < 2 {
                break;
            }
            let frame = self.buf[markers[0]..markers[1]].to_vec();
            frames.push(frame);
            self.buf.drain(0..markers[1]);
        }
        Ok(frames)
    }

    pub fn reset(&mut self) {
        self.buf.clear();
    }

    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn png_with_tag(tag: u8) -> Vec<u8> {
        let mut v = PNG_MAGIC.to_vec();
        v.extend_from_slice(&[tag, tag, tag]);
        v
    }

    #[test]
    fn emits_frame_once_second_marker_seen() {
        let mut f = Framer::new(1_000_000);
        let mut chunk = png_with_tag(1);
        chunk.extend_from_slice(&png_with_tag(2));
        let frames = f.feed(&chunk).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0], png_with_tag(1));
        // second frame is retained until a third marker arrives.
        assert_eq!(f.buffered_len(), png_with_tag(2).len());
    }

    #[test]
    fn splits_frames_delivered_across_multiple_feeds() {
        let mut f = Framer::new(1_000_000);
        assert!(f.feed(&png_with_tag(1)).unwrap().is_empty());
        let frames = f.feed(&png_with_tag(2)).unwrap();
        assert_eq!(frames, vec![png_with_tag(1)]);
    }

    #[test]
    fn overflow_reports_error() {
        let mut f = Framer::new(4);
        let err = f.feed(&png_with_tag(1)).unwrap_err();
        assert_eq!(err, FeedError::BufferOverflow);
    }
}
