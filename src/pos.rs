//! # Pos
//!
//! Strand-aware positions in the concatenated input space Q and the graph
//! sequence space S. A position is an offset plus an orientation, packed
//! into a single word so that equality and ordering distinguish strand.
use std::fmt;

use serde::{Deserialize, Serialize};

/// An (offset, orientation) pair packed as `offset << 1 | is_rev`.
/// Offsets are 0-based. Stepping a reverse position forward moves it to
/// lower offsets. Offset arithmetic wraps; a wrapped offset is far outside
/// any live coordinate space and never matches a real position.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Pos(u64);

impl Pos {
    pub fn new(offset: u64, is_rev: bool) -> Self {
        Pos(offset << 1 | u64::from(is_rev))
    }

    pub fn offset(self) -> u64 {
        self.0 >> 1
    }

    pub fn is_rev(self) -> bool {
        self.0 & 1 != 0
    }

    /// Advance one base along the orientation.
    pub fn incr(self) -> Self {
        if self.is_rev() {
            Pos(self.0.wrapping_sub(2))
        } else {
            Pos(self.0.wrapping_add(2))
        }
    }

    /// Retreat one base against the orientation.
    pub fn decr(self) -> Self {
        if self.is_rev() {
            Pos(self.0.wrapping_add(2))
        } else {
            Pos(self.0.wrapping_sub(2))
        }
    }

    pub fn incr_by(self, k: u64) -> Self {
        if self.is_rev() {
            Pos(self.0.wrapping_sub(k << 1))
        } else {
            Pos(self.0.wrapping_add(k << 1))
        }
    }

    pub fn decr_by(self, k: u64) -> Self {
        if self.is_rev() {
            Pos(self.0.wrapping_add(k << 1))
        } else {
            Pos(self.0.wrapping_sub(k << 1))
        }
    }
}

impl fmt::Display for Pos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.offset(), if self.is_rev() { '-' } else { '+' })
    }
}

impl fmt::Debug for Pos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
