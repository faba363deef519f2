/* Copyright (c) [2023] [Syswonder Community]
 *   [Ruxos] is licensed under Mulan PSL v2.
 *   You can use this software according to the terms and conditions of the Mulan PSL v2.
 *   You may obtain a copy of Mulan PSL v2 at:
 *               http://license.coscl.org.cn/MulanPSL2
 *   THIS SOFTWARE IS PROVIDED ON AN "AS IS" BASIS, WITHOUT WARRANTIES OF ANY KIND, EITHER EXPRESS OR IMPLIED, INCLUDING BUT NOT LIMITED TO NON-INFRINGEMENT, MERCHANTABILITY OR FIT FOR A PARTICULAR PURPOSE.
 *   See the Mulan PSL v2 for more details.
 */

//! Edge-triggered accounting of active registrations for one index.

/// The number of outstanding registrations for one index.
///
/// The interesting transitions are the edges: rising from zero means the
/// underlying hardware source must be enabled, falling back to zero means it
/// can be disabled again. [`inc`] and [`dec`] report exactly those edges so
/// the caller fires its hooks once per transition and never in between.
///
/// The count is not synchronized by itself. It is protected by the event
/// source's primary lock.
///
/// [`inc`]: ActiveCount::inc
/// [`dec`]: ActiveCount::dec
#[derive(Debug, Default)]
pub struct ActiveCount(usize);

impl ActiveCount {
    /// Creates a new count of zero.
    pub const fn new() -> Self {
        Self(0)
    }

    /// Adds one registration.
    ///
    /// Returns `true` exactly when the count rises from zero, i.e. the
    /// underlying source must now be enabled.
    pub fn inc(&mut self) -> bool {
        self.0 += 1;
        self.0 == 1
    }

    /// Removes `refs` registrations at once.
    ///
    /// Returns `true` exactly when the count reaches zero, i.e. the
    /// underlying source can be disabled. A batched decrement that crosses
    /// zero still reports the edge once.
    ///
    /// Callers must never remove more registrations than were added.
    pub fn dec(&mut self, refs: usize) -> bool {
        self.0 -= refs;
        self.0 == 0
    }

    /// Returns the current number of outstanding registrations.
    pub const fn get(&self) -> usize {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::ActiveCount;

    #[test]
    fn rising_edge_fires_once() {
        let mut count = ActiveCount::new();
        assert!(count.inc());
        assert!(!count.inc());
        assert!(!count.inc());
        assert_eq!(count.get(), 3);
    }

    #[test]
    fn falling_edge_fires_once() {
        let mut count = ActiveCount::new();
        count.inc();
        count.inc();
        assert!(!count.dec(1));
        assert!(count.dec(1));
        assert_eq!(count.get(), 0);
    }

    #[test]
    fn batched_decrement_reports_edge_once() {
        let mut count = ActiveCount::new();
        for _ in 0..5 {
            count.inc();
        }
        assert!(!count.dec(2));
        assert!(count.dec(3));
    }

    #[test]
    fn reenable_after_idle() {
        let mut count = ActiveCount::new();
        assert!(count.inc());
        assert!(count.dec(1));
        assert!(count.inc());
    }
}
