use crate::handlers::common::now_millis;
use crate::types::{JobProgress, JobStatus, ProgressMap, RenditionStatus};
use std::collections::HashMap;

/// Round a percentage to two decimals for display.
pub fn round_percentage(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Folds independently updating fractions into one percentage.
///
/// Each sub-task (a resolution, an upload chunk) owns one slot. The aggregate is
/// `sum(slots) * 100 / expected`, so slots that never reported count as zero.
/// Later updates to a slot replace earlier ones, whatever their order.
#[derive(Clone, Debug, Default)]
pub struct ProgressTracker {
    expected: usize,
    slots: HashMap<usize, f64>,
}

impl ProgressTracker {
    pub fn new(expected: usize) -> Self {
        Self {
            expected,
            slots: HashMap::with_capacity(expected),
        }
    }

    /// Returns false when `index` is outside the expected range and the update is dropped.
    pub fn record(&mut self, index: usize, fraction: f64) -> bool {
        if index >= self.expected {
            return false;
        }
        let fraction = if fraction.is_nan() {
            0.0
        } else {
            fraction.clamp(0.0, 1.0)
        };
        self.slots.insert(index, fraction);
        true
    }

    /// Completion in [0, 1].
    pub fn fraction(&self) -> f64 {
        if self.expected == 0 {
            return 0.0;
        }
        let total: f64 = self.slots.values().sum();
        (total / self.expected as f64).clamp(0.0, 1.0)
    }

    /// Completion in [0, 100].
    pub fn aggregate(&self) -> f64 {
        if self.expected == 0 {
            return 0.0;
        }
        let total: f64 = self.slots.values().sum();
        (total * 100.0 / self.expected as f64).clamp(0.0, 100.0)
    }

    pub fn percentage(&self) -> f64 {
        round_percentage(self.aggregate())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Transcode,
    Upload,
}

/// Writes one job's progress into the shared progress map.
#[derive(Clone)]
pub struct ProgressReporter {
    map: ProgressMap,
    job_id: String,
}

impl ProgressReporter {
    pub fn new(map: ProgressMap, job_id: impl Into<String>) -> Self {
        Self {
            map,
            job_id: job_id.into(),
        }
    }

    /// A reporter backed by its own private map.
    #[cfg(test)]
    pub fn detached(job_id: impl Into<String>) -> Self {
        Self::new(
            std::sync::Arc::new(tokio::sync::RwLock::new(HashMap::new())),
            job_id,
        )
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    async fn update(&self, apply: impl FnOnce(&mut JobProgress)) {
        let mut map = self.map.write().await;
        let entry = map
            .entry(self.job_id.clone())
            .or_insert_with(|| JobProgress::new(self.job_id.clone(), None, now_millis()));
        apply(entry);
    }

    pub async fn start(&self) {
        self.update(|p| {
            p.status = JobStatus::Processing;
            p.stage = "Transcoding".to_string();
            p.transcode_percentage = 0.0;
            p.upload_percentage = 0.0;
            p.renditions.clear();
            p.error = None;
        })
        .await;
    }

    pub async fn report(&self, phase: Phase, percentage: f64) {
        self.update(|p| match phase {
            Phase::Transcode => p.transcode_percentage = percentage,
            Phase::Upload => p.upload_percentage = percentage,
        })
        .await;
    }

    pub async fn stage(&self, stage: &str) {
        self.update(|p| p.stage = stage.to_string()).await;
    }

    /// Record the outcome of one rendition. Entries stay ordered by their
    /// position in the submitted list, whatever order uploads finish in.
    pub async fn rendition_finished(&self, status: RenditionStatus) {
        self.update(|p| {
            p.renditions.retain(|r| r.index != status.index);
            let at = p.renditions.partition_point(|r| r.index < status.index);
            p.renditions.insert(at, status);
        })
        .await;
    }

    pub async fn finish(&self, status: JobStatus, error: Option<String>) {
        self.update(|p| {
            p.status = status;
            p.stage = match status {
                JobStatus::Completed => "Completed".to_string(),
                JobStatus::Failed => "Failed".to_string(),
                _ => p.stage.clone(),
            };
            p.error = error;
        })
        .await;
    }

    #[cfg(test)]
    pub async fn snapshot(&self) -> Option<JobProgress> {
        self.map.read().await.get(&self.job_id).cloned()
    }
}
