//! Durable record of attempts and their evidence.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::platform::PlatformId;
use crate::state_machine::{Attempt, Evidence};

#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[async_trait]
pub trait OutcomeRecorder: Send + Sync {
    async fn record_attempt(&self, attempt: &Attempt) -> Result<(), RecorderError>;

    /// Attempts on `platform` started within the last `window`, oldest first.
    async fn query_recent_outcomes(
        &self,
        platform: PlatformId,
        window: Duration,
    ) -> Result<Vec<Attempt>, RecorderError>;

    async fn store_evidence(
        &self,
        attempt_id: &str,
        label: &str,
        bytes: &[u8],
    ) -> Result<Evidence, RecorderError>;
}

fn within(attempt: &Attempt, platform: PlatformId, window: Duration) -> bool {
    let cutoff = chrono::Duration::from_std(window)
        .ok()
        .and_then(|w| Utc::now().checked_sub_signed(w));
    attempt.platform == platform && cutoff.is_none_or(|c| attempt.started_at >= c)
}

/// Keep only the characters that are safe in a file name.
fn file_stem(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

/// Append-only JSON lines log, one attempt per line, with evidence files
/// written next to it.
pub struct JsonlRecorder {
    log_path: PathBuf,
    evidence_dir: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl JsonlRecorder {
    pub fn new(log_path: impl Into<PathBuf>, evidence_dir: impl Into<PathBuf>) -> Self {
        Self {
            log_path: log_path.into(),
            evidence_dir: evidence_dir.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// Every attempt in the log. Lines that fail to parse are skipped.
    pub async fn read_all(&self) -> Result<Vec<Attempt>, RecorderError> {
        let content = match tokio::fs::read_to_string(&self.log_path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut out = Vec::new();
        for (n, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Attempt>(line) {
                Ok(a) => out.push(a),
                Err(e) => warn!(line = n + 1, error = %e, "skipping malformed outcome record"),
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl OutcomeRecorder for JsonlRecorder {
    async fn record_attempt(&self, attempt: &Attempt) -> Result<(), RecorderError> {
        let mut line = serde_json::to_string(attempt)?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.log_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        debug!(attempt = %attempt.id, job_id = %attempt.job_id, "attempt recorded");
        Ok(())
    }

    async fn query_recent_outcomes(
        &self,
        platform: PlatformId,
        window: Duration,
    ) -> Result<Vec<Attempt>, RecorderError> {
        let mut out: Vec<Attempt> = self
            .read_all()
            .await?
            .into_iter()
            .filter(|a| within(a, platform, window))
            .collect();
        out.sort_by_key(|a| a.started_at);
        Ok(out)
    }

    async fn store_evidence(
        &self,
        attempt_id: &str,
        label: &str,
        bytes: &[u8],
    ) -> Result<Evidence, RecorderError> {
        tokio::fs::create_dir_all(&self.evidence_dir).await?;
        let path = self
            .evidence_dir
            .join(format!("{}-{}.png", file_stem(attempt_id), file_stem(label)));
        tokio::fs::write(&path, bytes).await?;
        Ok(Evidence {
            label: label.to_string(),
            location: path.display().to_string(),
            captured_at: Utc::now(),
        })
    }
}

/// In-memory recorder for tests and dry runs.
#[derive(Default)]
pub struct MemoryRecorder {
    attempts: Mutex<Vec<Attempt>>,
    evidence: Mutex<Vec<(String, Evidence, usize)>>,
}

impl MemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attempts(&self) -> Vec<Attempt> {
        self.attempts.lock().clone()
    }

    pub fn attempts_for(&self, job_id: &str) -> Vec<Attempt> {
        self.attempts
            .lock()
            .iter()
            .filter(|a| a.job_id == job_id)
            .cloned()
            .collect()
    }

    pub fn evidence_count(&self) -> usize {
        self.evidence.lock().len()
    }
}

#[async_trait]
impl OutcomeRecorder for MemoryRecorder {
    async fn record_attempt(&self, attempt: &Attempt) -> Result<(), RecorderError> {
        self.attempts.lock().push(attempt.clone());
        Ok(())
    }

    async fn query_recent_outcomes(
        &self,
        platform: PlatformId,
        window: Duration,
    ) -> Result<Vec<Attempt>, RecorderError> {
        Ok(self
            .attempts
            .lock()
            .iter()
            .filter(|a| within(a, platform, window))
            .cloned()
            .collect())
    }

    async fn store_evidence(
        &self,
        attempt_id: &str,
        label: &str,
        bytes: &[u8],
    ) -> Result<Evidence, RecorderError> {
        let evidence = Evidence {
            label: label.to_string(),
            location: format!("memory://{attempt_id}/{label}"),
            captured_at: Utc::now(),
        };
        self.evidence
            .lock()
            .push((attempt_id.to_string(), evidence.clone(), bytes.len()));
        Ok(evidence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::Outcome;

    fn attempt(platform: PlatformId, outcome: Outcome) -> Attempt {
        let mut a = Attempt::begin("job-1", platform, 1, "s-1");
        a.finish(outcome, "done", None);
        a
    }

    #[tokio::test]
    async fn jsonl_round_trip_and_filter() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = JsonlRecorder::new(dir.path().join("log/outcomes.jsonl"), dir.path().join("ev"));

        recorder.record_attempt(&attempt(PlatformId::Lever, Outcome::Skipped)).await.unwrap();
        recorder.record_attempt(&attempt(PlatformId::Lever, Outcome::Failed)).await.unwrap();
        recorder.record_attempt(&attempt(PlatformId::Workday, Outcome::Failed)).await.unwrap();

        let lever = recorder
            .query_recent_outcomes(PlatformId::Lever, Duration::from_secs(3600))
            .await
            .unwrap();
        assert_eq!(lever.len(), 2);
        assert_eq!(lever[0].outcome, Some(Outcome::Skipped));
        assert_eq!(recorder.read_all().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn old_attempts_fall_outside_the_window() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = JsonlRecorder::new(dir.path().join("outcomes.jsonl"), dir.path().join("ev"));
        let mut old = attempt(PlatformId::Lever, Outcome::Failed);
        old.started_at = Utc::now() - chrono::Duration::hours(3);
        recorder.record_attempt(&old).await.unwrap();
        recorder.record_attempt(&attempt(PlatformId::Lever, Outcome::Failed)).await.unwrap();

        let recent = recorder
            .query_recent_outcomes(PlatformId::Lever, Duration::from_secs(3600))
            .await
            .unwrap();
        assert_eq!(recent.len(), 1);
    }

    #[tokio::test]
    async fn malformed_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("outcomes.jsonl");
        let recorder = JsonlRecorder::new(&path, dir.path().join("ev"));
        recorder.record_attempt(&attempt(PlatformId::Ashby, Outcome::Skipped)).await.unwrap();
        let mut content = std::fs::read_to_string(&path).unwrap();
        content.push_str("{not json}\n");
        std::fs::write(&path, content).unwrap();

        assert_eq!(recorder.read_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn missing_log_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = JsonlRecorder::new(dir.path().join("none.jsonl"), dir.path().join("ev"));
        assert!(recorder.read_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn evidence_is_written_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = JsonlRecorder::new(dir.path().join("o.jsonl"), dir.path().join("ev"));
        let ev = recorder
            .store_evidence("a/1", "pending review", b"png")
            .await
            .unwrap();
        assert_eq!(ev.label, "pending review");
        assert!(ev.location.ends_with("a_1-pending_review.png"));
        assert_eq!(std::fs::read(&ev.location).unwrap(), b"png");
    }

    #[tokio::test]
    async fn memory_recorder_filters_by_platform() {
        let recorder = MemoryRecorder::new();
        recorder.record_attempt(&attempt(PlatformId::Lever, Outcome::Failed)).await.unwrap();
        recorder.record_attempt(&attempt(PlatformId::Indeed, Outcome::Failed)).await.unwrap();
        let out = recorder
            .query_recent_outcomes(PlatformId::Indeed, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(recorder.attempts_for("job-1").len(), 2);
        recorder.store_evidence("x", "final", b"1").await.unwrap();
        assert_eq!(recorder.evidence_count(), 1);
    }
}
