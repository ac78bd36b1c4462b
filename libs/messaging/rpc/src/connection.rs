use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Live-resource accounting for a transport endpoint
///
/// Transports hand out a [`ResourceGuard`] per open connection or sender; the
/// guard decrements the live count when dropped, so leaks show up as a
/// non-zero [`ResourceTracker::active`] after all work is done.
#[derive(Debug, Clone)]
pub struct ResourceTracker {
    /// What is being counted ("connection", "sender", ...)
    pub kind: String,
    active: Arc<AtomicUsize>,
    opened: Arc<AtomicU64>,
}

impl ResourceTracker {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            active: Arc::new(AtomicUsize::new(0)),
            opened: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Record an open resource
    pub fn acquire(&self) -> ResourceGuard {
        self.active.fetch_add(1, Ordering::SeqCst);
        self.opened.fetch_add(1, Ordering::Relaxed);
        ResourceGuard {
            tracker: self.clone(),
        }
    }

    /// Resources currently open
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Resources opened over the tracker's lifetime
    pub fn total_opened(&self) -> u64 {
        self.opened.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> ResourceStats {
        ResourceStats {
            kind: self.kind.clone(),
            active: self.active(),
            total_opened: self.total_opened(),
        }
    }
}

/// RAII guard that releases its slot when dropped
#[derive(Debug)]
pub struct ResourceGuard {
    tracker: ResourceTracker,
}

impl ResourceGuard {
    pub fn kind(&self) -> &str {
        &self.tracker.kind
    }
}

impl Drop for ResourceGuard {
    fn drop(&mut self) {
        self.tracker.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Snapshot of a tracker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceStats {
    pub kind: String,
    pub active: usize,
    pub total_opened: u64,
}

impl ResourceStats {
    /// Everything that was opened has been released
    pub fn is_balanced(&self) -> bool {
        self.active == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_release_on_drop() {
        let tracker = ResourceTracker::new("sender");

        {
            let _guard = tracker.acquire();
            assert_eq!(tracker.active(), 1);
        } // Guard drops here

        assert_eq!(tracker.active(), 0);
        assert_eq!(tracker.total_opened(), 1);
        assert!(tracker.stats().is_balanced());
    }

    #[test]
    fn test_clones_share_counts() {
        let tracker = ResourceTracker::new("connection");
        let clone = tracker.clone();

        let guard1 = tracker.acquire();
        let _guard2 = clone.acquire();
        assert_eq!(tracker.active(), 2);
        assert_eq!(guard1.kind(), "connection");

        drop(guard1);
        let stats = clone.stats();
        assert_eq!(stats.active, 1);
        assert_eq!(stats.total_opened, 2);
        assert!(!stats.is_balanced());
    }
}
