//! Re-entrancy guards for periodic work

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Holds an `AtomicBool` set for as long as the guard lives
///
/// Acquisition fails instead of waiting, so an overlapping timer tick is
/// skipped rather than queued.
#[derive(Debug)]
pub(crate) struct FlagGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> FlagGuard<'a> {
    pub(crate) fn try_acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Counts live holders of a pass; the work is running while the count is
/// above zero
#[derive(Debug)]
pub(crate) struct PassGuard<'a> {
    count: &'a AtomicUsize,
}

impl<'a> PassGuard<'a> {
    /// Enter only when no other pass is live
    pub(crate) fn try_acquire(count: &'a AtomicUsize) -> Option<Self> {
        count
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { count })
    }

    /// Enter alongside any live passes
    pub(crate) fn join(count: &'a AtomicUsize) -> Self {
        count.fetch_add(1, Ordering::AcqRel);
        Self { count }
    }
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.count.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_fails_until_release() {
        let flag = AtomicBool::new(false);
        let guard = FlagGuard::try_acquire(&flag).unwrap();
        assert!(FlagGuard::try_acquire(&flag).is_none());
        drop(guard);
        assert!(!flag.load(Ordering::Acquire));
        assert!(FlagGuard::try_acquire(&flag).is_some());
    }

    #[test]
    fn joined_pass_keeps_count_after_first_release() {
        let count = AtomicUsize::new(0);
        let first = PassGuard::try_acquire(&count).unwrap();
        assert!(PassGuard::try_acquire(&count).is_none());

        let forced = PassGuard::join(&count);
        drop(first);
        assert_eq!(count.load(Ordering::Acquire), 1);

        drop(forced);
        assert_eq!(count.load(Ordering::Acquire), 0);
        assert!(PassGuard::try_acquire(&count).is_some());
    }
}
