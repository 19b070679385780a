use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Counters updated by the stages, readable from any thread.
#[derive(Debug, Default)]
pub struct SchedulerStats {
    pub frames_ticked: AtomicU64,
    pub frames_submitted: AtomicU64,
    pub begin_frame_failures: AtomicU64,
    /// Ticks whose pose came from the previous frame or the identity fallback.
    pub pose_fallbacks: AtomicU64,
    pub session_inits: AtomicU64,
    pub session_init_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct StatsSnapshot {
    pub frames_ticked: u64,
    pub frames_submitted: u64,
    pub begin_frame_failures: u64,
    pub pose_fallbacks: u64,
    pub session_inits: u64,
    pub session_init_failures: u64,
}

impl SchedulerStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames_ticked: self.frames_ticked.load(Ordering::Relaxed),
            frames_submitted: self.frames_submitted.load(Ordering::Relaxed),
            begin_frame_failures: self.begin_frame_failures.load(Ordering::Relaxed),
            pose_fallbacks: self.pose_fallbacks.load(Ordering::Relaxed),
            session_inits: self.session_inits.load(Ordering::Relaxed),
            session_init_failures: self.session_init_failures.load(Ordering::Relaxed),
        }
    }
}

pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let stats = SchedulerStats::default();
        bump(&stats.frames_ticked);
        bump(&stats.frames_ticked);
        bump(&stats.pose_fallbacks);
        let snap = stats.snapshot();
        assert_eq!(snap.frames_ticked, 2);
        assert_eq!(snap.pose_fallbacks, 1);
        assert_eq!(snap.frames_submitted, 0);
    }
}
