//! Core domain model for the xkcd archive mirror.

use std::fmt;
use std::ops::RangeInclusive;

use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "xkm-core";

/// Reserved search term that lists every stored entry.
pub const SEARCH_ALL: &str = "-";

/// One archived comic. `num` is assigned by the remote archive and never reused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub num: u32,
    pub title: String,
    pub image: String,
    pub alt: String,
    pub transcript: String,
}

/// Remote head versus local head for a single synchronization run.
///
/// `highest_local` is `None` for an empty store, which is distinct from any
/// stored number (1 is a valid entry).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCursor {
    pub latest_remote: u32,
    pub highest_local: Option<u32>,
}

impl SyncCursor {
    pub fn new(latest_remote: u32, highest_local: Option<u32>) -> Self {
        Self {
            latest_remote,
            highest_local,
        }
    }

    /// Entry numbers published remotely but not yet stored locally.
    ///
    /// `(highest_local, latest_remote]` for a non-empty store, `[1, latest_remote]`
    /// otherwise. Empty when the store has caught up (or is ahead).
    pub fn missing(&self) -> RangeInclusive<u32> {
        let start = match self.highest_local {
            None => 1,
            Some(highest) => match highest.checked_add(1) {
                Some(next) => next,
                None => return empty_range(),
            },
        };
        start..=self.latest_remote
    }

    pub fn missing_count(&self) -> usize {
        let range = self.missing();
        if range.is_empty() {
            0
        } else {
            (range.end() - range.start()) as usize + 1
        }
    }

    pub fn is_up_to_date(&self) -> bool {
        self.missing().is_empty()
    }
}

#[allow(clippy::reversed_empty_ranges)]
fn empty_range() -> RangeInclusive<u32> {
    1..=0
}

/// Parsed form of a user-supplied search term.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchTerm {
    All,
    /// Case-sensitive literal substring, matched against title, image, alt and transcript.
    Contains(String),
}

impl SearchTerm {
    pub fn parse(raw: &str) -> Self {
        if raw == SEARCH_ALL {
            Self::All
        } else {
            Self::Contains(raw.to_string())
        }
    }
}

impl fmt::Display for SearchTerm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.write_str(SEARCH_ALL),
            Self::Contains(term) => f.write_str(term),
        }
    }
}
