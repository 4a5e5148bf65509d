use serde::{Deserialize, Serialize};

/// Task and cron job counts by state, for status views.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCounts {
    pub pending: usize,
    pub running: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub canceled: usize,
    pub cron_jobs_enabled: usize,
    pub cron_jobs_disabled: usize,
}

impl TaskCounts {
    pub fn active(&self) -> usize {
        self.pending + self.running
    }
}
