//! Viewer-side change detection for frame listings.
//!
//! Readers are stateless: each viewer keeps its own cursor and compares it
//! with the `version` of every listing it fetches. The content fingerprint is
//! a fallback for sources that carry no version.

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::frame_store::FrameListing;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Seen {
    Version(u64),
    Fingerprint(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeCursor {
    last: Option<Seen>,
}

impl ChangeCursor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` when `listing` differs from the last observation.
    /// The first observation always counts as a change.
    pub fn observe(&mut self, listing: &FrameListing) -> bool {
        self.advance(Seen::Version(listing.version))
    }

    /// Fallback: compares a SHA-256 fingerprint of the serialized snapshot.
    pub fn observe_snapshot<T: Serialize>(&mut self, snapshot: &T) -> bool {
        self.advance(Seen::Fingerprint(fingerprint(snapshot)))
    }

    pub fn last_version(&self) -> Option<u64> {
        match self.last {
            Some(Seen::Version(version)) => Some(version),
            _ => None,
        }
    }

    fn advance(&mut self, seen: Seen) -> bool {
        if self.last.as_ref() == Some(&seen) {
            return false;
        }
        self.last = Some(seen);
        true
    }
}

/// Hex SHA-256 of the JSON encoding of `value`.
pub fn fingerprint<T: Serialize>(value: &T) -> String {
    // Serializing plain data into a Vec does not fail; an error still yields
    // a stable digest of the empty input.
    let encoded = serde_json::to_vec(value).unwrap_or_default();
    format!("{:x}", Sha256::digest(&encoded))
}
