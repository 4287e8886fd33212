//! Evidence and report sinks
//!
//! Screenshots, screen recordings and report rendering live outside the
//! engine. The tracker only calls these traits at fixed points of a run.
//! Evidence sink errors are logged and never change a run's outcome.

use crate::error::Result;
use crate::lock::LockSnapshot;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// What an evidence sink is told about the moment it is called
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EvidenceContext {
    pub batch_uid: String,
    pub case_name: String,
    pub lock_name: String,
    pub step: Option<String>,
}

/// Result of a finished screen recording
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordingMeta {
    pub path: PathBuf,
    pub framerate: f64,
    pub lost_frames: u64,
}

/// Captures evidence while a case runs
#[async_trait]
pub trait EvidenceSink: Send + Sync {
    /// Called after each executed step body returns successfully
    async fn capture_on_step(&self, ctx: &EvidenceContext) -> anyhow::Result<()>;

    /// Start a recording for the whole run; returns where it will be saved
    async fn start_recording(&self, ctx: &EvidenceContext) -> anyhow::Result<PathBuf>;

    async fn stop_recording(&self, ctx: &EvidenceContext) -> anyhow::Result<RecordingMeta>;
}

/// Sink that captures nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEvidenceSink;

#[async_trait]
impl EvidenceSink for NoopEvidenceSink {
    async fn capture_on_step(&self, _ctx: &EvidenceContext) -> anyhow::Result<()> {
        Ok(())
    }

    async fn start_recording(&self, _ctx: &EvidenceContext) -> anyhow::Result<PathBuf> {
        Ok(PathBuf::new())
    }

    async fn stop_recording(&self, _ctx: &EvidenceContext) -> anyhow::Result<RecordingMeta> {
        Ok(RecordingMeta {
            path: PathBuf::new(),
            framerate: 0.0,
            lost_frames: 0,
        })
    }
}

/// Renders a single finished run
pub trait ReportSink: Send + Sync {
    fn render_run(&self, snapshot: &LockSnapshot) -> anyhow::Result<PathBuf>;
}

#[derive(Debug, Serialize)]
struct RunSummaryRow<'a> {
    case: &'a str,
    lock: &'a str,
    status: &'a str,
    declared_steps: usize,
    runned_steps: String,
    paused_steps: String,
    failure_step: &'a str,
    failure_message: &'a str,
}

/// Writes one `<lock name>.csv` summary per run
#[derive(Debug, Clone)]
pub struct CsvReportSink {
    output_dir: PathBuf,
}

impl CsvReportSink {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    fn write(&self, snapshot: &LockSnapshot) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.output_dir)?;
        let path = self.output_dir.join(format!("{}.csv", snapshot.name));

        let row = RunSummaryRow {
            case: &snapshot.case_name,
            lock: &snapshot.name,
            status: snapshot.status.map_or("", |s| s.as_str()),
            declared_steps: snapshot.declared_steps.len(),
            runned_steps: snapshot.runned_steps.join(";"),
            paused_steps: snapshot
                .paused_steps
                .iter()
                .map(String::as_str)
                .collect::<Vec<_>>()
                .join(";"),
            failure_step: snapshot.failure_step.as_deref().unwrap_or(""),
            failure_message: snapshot.failure_message.as_deref().unwrap_or(""),
        };

        let mut writer = csv::Writer::from_path(&path)?;
        writer.serialize(&row)?;
        writer.flush()?;

        debug!(lock = %snapshot.name, "Run report written to {}", path.display());
        Ok(path)
    }
}

impl ReportSink for CsvReportSink {
    fn render_run(&self, snapshot: &LockSnapshot) -> anyhow::Result<PathBuf> {
        Ok(self.write(snapshot)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::LockStatus;
    use std::collections::{BTreeMap, BTreeSet};
    use tempfile::TempDir;

    fn snapshot() -> LockSnapshot {
        LockSnapshot {
            name: "2026-10-16_09-00-00_Checkout".into(),
            uid: "2026-10-16_09-00-00".into(),
            case_name: "Checkout".into(),
            status: Some(LockStatus::Failed),
            declared_steps: vec!["step_01_open".into(), "step_02_pay".into()],
            runned_steps: vec!["step_01_open".into(), "step_02_pay".into()],
            runned_steps_info: BTreeMap::new(),
            paused_steps: BTreeSet::new(),
            failure_step: Some("step_02_pay".into()),
            failure_message: Some("card declined".into()),
            target_datetime: None,
            attributes: BTreeMap::new(),
        }
    }

    #[test]
    fn test_csv_report_contents() {
        let temp_dir = TempDir::new().unwrap();
        let sink = CsvReportSink::new(temp_dir.path().join("reports"));

        let path = sink.render_run(&snapshot()).unwrap();
        assert_eq!(
            path,
            temp_dir
                .path()
                .join("reports/2026-10-16_09-00-00_Checkout.csv")
        );

        let content = std::fs::read_to_string(path).unwrap();
        let mut lines = content.lines();
        assert_eq!(
            lines.next(),
            Some("case,lock,status,declared_steps,runned_steps,paused_steps,failure_step,failure_message")
        );
        assert_eq!(
            lines.next(),
            Some("Checkout,2026-10-16_09-00-00_Checkout,failed,2,step_01_open;step_02_pay,,step_02_pay,card declined")
        );
    }

    #[tokio::test]
    async fn test_noop_sink_succeeds() {
        let ctx = EvidenceContext {
            batch_uid: "b".into(),
            case_name: "Checkout".into(),
            lock_name: "b_Checkout".into(),
            step: None,
        };
        let sink = NoopEvidenceSink;
        sink.capture_on_step(&ctx).await.unwrap();
        let path = sink.start_recording(&ctx).await.unwrap();
        assert_eq!(path, PathBuf::new());
        assert_eq!(sink.stop_recording(&ctx).await.unwrap().lost_frames, 0);
    }
}
