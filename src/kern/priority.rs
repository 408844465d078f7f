//! Thread Priority
//!
//! Based on Mach4 kern/sched.h priority definitions (CMU 1988)
//!
//! Priorities range from 0 (highest) to `levels - 1` (lowest), where
//! `levels` is the configured number of run-queue levels
//! ([`crate::config::SCHED_PRIORITY_MAX`] by default).
//!
//! ## Priority Aging
//!
//! A thread that yields productively or completes a synchronous message
//! exchange is rewarded: its value drops by one and it runs sooner. A thread
//! that burns a whole timeslice, or yields with nothing done, is punished:
//! its value rises by one. The value never leaves `[0, levels)`.

/// A thread priority value; numerically lower runs first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct Priority(usize);

impl Priority {
    /// Highest priority
    pub const HIGHEST: Self = Self(0);

    /// Create a priority clamped to `[0, levels)`
    pub const fn new(value: usize, levels: usize) -> Self {
        let max = if levels == 0 { 0 } else { levels - 1 };
        Self(if value > max { max } else { value })
    }

    /// Lowest priority for `levels` levels
    pub const fn lowest(levels: usize) -> Self {
        Self::new(usize::MAX, levels)
    }

    /// Run-queue index
    pub const fn value(self) -> usize {
        self.0
    }

    /// One step toward the head of the line
    pub const fn reward(self) -> Self {
        Self(self.0.saturating_sub(1))
    }

    /// One step toward the back, bounded by `levels`
    pub const fn punish(self, levels: usize) -> Self {
        Self::new(self.0 + 1, levels)
    }

    /// Does `self` run before `other`
    pub const fn is_higher_than(self, other: Self) -> bool {
        self.0 < other.0
    }
}

impl core::fmt::Display for Priority {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "pri{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamped() {
        assert_eq!(Priority::new(40, 32).value(), 31);
        assert_eq!(Priority::new(5, 32).value(), 5);
        assert_eq!(Priority::lowest(8).value(), 7);
        assert_eq!(Priority::new(3, 0).value(), 0);
    }

    #[test]
    fn test_reward_punish_bounded() {
        let top = Priority::HIGHEST;
        assert_eq!(top.reward(), top);
        assert_eq!(top.punish(4).value(), 1);

        let bottom = Priority::lowest(4);
        assert_eq!(bottom.punish(4), bottom);
        assert_eq!(bottom.reward().value(), 2);
        assert!(top.is_higher_than(bottom));
        assert!(!bottom.is_higher_than(bottom));
    }
}
