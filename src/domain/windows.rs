//! Window planning for chunked collection scans.
//!
//! A plan slices `[0, total)` into fixed-size, offset-ordered windows. The
//! last window is shortened so the windows cover every row exactly once.

use serde::{Deserialize, Serialize};

/// One offset-bounded slice of a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    /// 0-based window index
    pub index: usize,
    pub offset: u64,
    pub limit: u64,
}

impl Window {
    /// Exclusive upper row bound.
    pub const fn end(&self) -> u64 {
        self.offset + self.limit
    }

    /// Rows covered by this window and every window before it.
    pub const fn rows_checked(&self) -> u64 {
        self.end()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowPlan {
    total: u64,
    window_size: u64,
}

impl WindowPlan {
    /// A window size of zero is treated as one.
    pub const fn new(total: u64, window_size: u64) -> Self {
        Self {
            total,
            window_size: if window_size == 0 { 1 } else { window_size },
        }
    }

    pub const fn total(&self) -> u64 {
        self.total
    }

    /// `ceil(total / window_size)`; zero rows means zero windows. Saturates
    /// where the count does not fit a `usize`.
    pub fn window_count(&self) -> usize {
        usize::try_from(self.total.div_ceil(self.window_size)).unwrap_or(usize::MAX)
    }

    pub fn window(&self, index: usize) -> Option<Window> {
        let offset = (index as u64).checked_mul(self.window_size)?;
        if offset >= self.total {
            return None;
        }
        Some(Window {
            index,
            offset,
            limit: self.window_size.min(self.total - offset),
        })
    }

    pub fn windows(&self) -> impl Iterator<Item = Window> + '_ {
        (0..self.window_count()).filter_map(|index| self.window(index))
    }
}
