// Copyright (c) 2025 Dimitris Kafetzis
//
// Licensed under the MIT License.
// See LICENSE file in the project root for full license information.
//
// SPDX-License-Identifier: MIT

//! Reference counts for mapping entries.

use std::fmt;

/// How many active regions hold a mapping.
///
/// The count saturates: it never goes below zero, and a count above half of
/// [`RefCount::INFINITE`] is treated as infinite and is never changed by
/// increments or decrements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
pub struct RefCount(i64);

impl RefCount {
    pub const ZERO: Self = Self(0);
    pub const ONE: Self = Self(1);
    /// Sentinel for entries that are never evicted.
    pub const INFINITE: Self = Self(i64::MAX >> 1);

    pub fn new(count: i64) -> Self {
        Self(count.max(0))
    }

    pub fn get(self) -> i64 {
        self.0
    }

    pub fn is_infinite(self) -> bool {
        self.0 > Self::INFINITE.0 >> 1
    }

    /// True if releasing one more reference drops the entry.
    pub fn is_last(self) -> bool {
        !self.is_infinite() && self.0 <= 1
    }

    pub fn increment(&mut self) {
        if !self.is_infinite() {
            self.0 = self.0.saturating_add(1);
        }
    }

    /// Decrements (never below zero) and returns the new count.
    pub fn decrement(&mut self) -> i64 {
        if !self.is_infinite() && self.0 > 0 {
            self.0 -= 1;
        }
        self.0
    }
}

impl Default for RefCount {
    fn default() -> Self {
        Self::ONE
    }
}

impl fmt::Display for RefCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_infinite() {
            f.write_str("inf")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_increment_decrement() {
        let mut rc = RefCount::ONE;
        rc.increment();
        assert_eq!(rc.get(), 2);
        assert!(!rc.is_last());
        assert_eq!(rc.decrement(), 1);
        assert!(rc.is_last());
        assert_eq!(rc.decrement(), 0);
        assert_eq!(rc.decrement(), 0);
    }

    #[test]
    fn test_infinite_is_sticky() {
        let mut rc = RefCount::INFINITE;
        rc.increment();
        assert_eq!(rc, RefCount::INFINITE);
        rc.decrement();
        assert_eq!(rc, RefCount::INFINITE);
        assert!(rc.is_infinite());
        assert!(!rc.is_last());
        assert_eq!(rc.to_string(), "inf");
    }

    #[test]
    fn test_new_clamps_negative() {
        assert_eq!(RefCount::new(-4), RefCount::ZERO);
        assert_eq!(RefCount::new(3).to_string(), "3");
    }

    proptest! {
        #[test]
        fn prop_balanced_updates_restore_count(start in 1i64..1000, n in 0usize..200) {
            let mut rc = RefCount::new(start);
            for _ in 0..n {
                rc.increment();
            }
            for _ in 0..n {
                rc.decrement();
            }
            prop_assert_eq!(rc.get(), start);
        }
    }
}
