//! Terminal progress and colored output for a campaign.
//!
//! [`CampaignProgress`] turns [`CampaignEvent`]s into an `indicatif` bar and
//! one colored line per finished job, and prints the final summary.

use std::time::Duration;

use console::Style;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use tokio::sync::mpsc;

use crate::breaker::{BreakerConfig, BreakerState, CircuitBreakerRegistry};
use crate::orchestrator::{
    CampaignEvent, CampaignState, CampaignSummary, JobResult, PlatformStats,
};
use crate::platform::PlatformId;
use crate::recorder::{OutcomeRecorder, RecorderError};
use crate::state_machine::Outcome;

pub struct CampaignProgress {
    pb: ProgressBar,
    green: Style,
    red: Style,
    yellow: Style,
    dim: Style,
}

impl Default for CampaignProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl CampaignProgress {
    pub fn new() -> Self {
        Self::with_target(ProgressDrawTarget::stderr())
    }

    pub fn with_target(target: ProgressDrawTarget) -> Self {
        let pb = ProgressBar::with_draw_target(Some(0), target);
        pb.set_style(
            ProgressStyle::with_template("{spinner:.cyan} [{bar:30.cyan/blue}] {pos}/{len} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=> "),
        );
        pb.enable_steady_tick(Duration::from_millis(100));

        Self {
            pb,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
            dim: Style::new().dim(),
        }
    }

    pub fn handle(&self, event: &CampaignEvent) {
        match event {
            CampaignEvent::Queued { total } => {
                self.pb.set_length(*total as u64);
                self.pb.set_message(format!("{total} jobs queued"));
            }
            CampaignEvent::Dispatched { label, platform, .. } => {
                self.pb.set_message(format!("{platform}: {label}"));
            }
            CampaignEvent::Deferred { job_id, reason } => {
                self.pb.println(format!(
                    "  {} {job_id} deferred: {reason}",
                    self.yellow.apply_to("↻")
                ));
            }
            CampaignEvent::Finished(result) => {
                self.pb.inc(1);
                self.pb.println(self.result_line(result));
            }
        }
    }

    /// Drain events until the runner drops its sender.
    pub async fn follow(self, mut rx: mpsc::UnboundedReceiver<CampaignEvent>) {
        while let Some(event) = rx.recv().await {
            self.handle(&event);
        }
        self.pb.finish_and_clear();
    }

    fn result_line(&self, result: &JobResult) -> String {
        let (style, mark) = match result.outcome {
            Outcome::Submitted => (&self.green, "✓"),
            Outcome::PendingReview => (&self.yellow, "?"),
            Outcome::Skipped => (&self.dim, "-"),
            Outcome::Failed | Outcome::Aborted => (&self.red, "✗"),
        };
        let mut line = format!(
            "  {} [{}] {}: {}",
            style.apply_to(mark),
            result.platform,
            result.label,
            result.reason
        );
        if let Some(id) = &result.confirmation_id {
            line.push_str(&format!(" (confirmation {id})"));
        }
        line
    }
}

/// Totals per outcome and per platform.
pub fn print_summary(summary: &CampaignSummary) {
    let green = Style::new().green().bold();
    let red = Style::new().red().bold();
    let yellow = Style::new().yellow();
    let dim = Style::new().dim();
    let header = match summary.state {
        CampaignState::Aborted => &red,
        _ => &green,
    };
    println!();
    println!(
        "{}",
        header.apply_to(format!("─── Campaign {} ───", summary.state))
    );
    println!(
        "  submitted {}  pending review {}  skipped {}  failed {}  aborted {}",
        green.apply_to(summary.count(Outcome::Submitted)),
        yellow.apply_to(summary.count(Outcome::PendingReview)),
        summary.count(Outcome::Skipped),
        red.apply_to(summary.count(Outcome::Failed)),
        summary.count(Outcome::Aborted),
    );
    println!(
        "  dispatched {}  not dispatched {}  circuit rejections {}  rate limited {}  pool backpressure {}",
        summary.dispatched,
        summary.undispatched,
        summary.circuit_rejections,
        summary.rate_limited,
        summary.pool_backpressure,
    );
    for (platform, stats) in &summary.per_platform {
        println!(
            "  {}",
            dim.apply_to(format!(
                "{platform:<12} ✓{} ?{} -{} ✗{}",
                stats.submitted, stats.pending_review, stats.skipped, stats.failed
            ))
        );
    }
}

/// One line per platform for `autoapply status`.
pub fn print_status(rows: &[StatusRow]) {
    let bold = Style::new().bold();
    println!(
        "{}",
        bold.apply_to(format!(
            "{:<12} {:>9} {:>7} {:>7} {:>6}  circuit",
            "platform", "submitted", "review", "skipped", "failed"
        ))
    );
    for row in rows {
        let circuit = match row.circuit {
            BreakerState::Closed => Style::new().green().apply_to(row.circuit),
            BreakerState::HalfOpen => Style::new().yellow().apply_to(row.circuit),
            BreakerState::Open => Style::new().red().bold().apply_to(row.circuit),
        };
        println!(
            "{:<12} {:>9} {:>7} {:>7} {:>6}  {circuit}",
            row.platform.to_string(),
            row.stats.submitted,
            row.stats.pending_review,
            row.stats.skipped,
            row.stats.failed,
        );
    }
}

/// Recorded outcomes of one platform and the breaker state they imply.
#[derive(Debug, Clone)]
pub struct StatusRow {
    pub platform: PlatformId,
    pub stats: PlatformStats,
    pub circuit: BreakerState,
}

/// Tally recent outcomes per platform and replay them through a fresh
/// breaker to show the circuit state the next campaign would start with.
pub async fn collect_status(
    recorder: &dyn OutcomeRecorder,
    breaker: BreakerConfig,
    platforms: &[PlatformId],
    window: Duration,
) -> Result<Vec<StatusRow>, RecorderError> {
    let breakers = CircuitBreakerRegistry::new(breaker);
    let mut rows = Vec::with_capacity(platforms.len());
    for &platform in platforms {
        let history = recorder.query_recent_outcomes(platform, window).await?;
        if history.is_empty() {
            continue;
        }
        let mut stats = PlatformStats::default();
        for outcome in history.iter().filter_map(|a| a.outcome) {
            stats.tally(outcome);
        }
        breakers.seed_from_history(platform, &history);
        rows.push(StatusRow {
            platform,
            stats,
            circuit: breakers.state(platform),
        });
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorClass;
    use crate::recorder::MemoryRecorder;
    use crate::state_machine::Attempt;

    fn result(outcome: Outcome, confirmation: Option<&str>) -> JobResult {
        JobResult {
            job_id: "j1".into(),
            label: "Engineer @ Acme".into(),
            platform: PlatformId::Greenhouse,
            outcome,
            reason: "confirmed".into(),
            attempts: 1,
            confirmation_id: confirmation.map(String::from),
        }
    }

    #[test]
    fn result_line_mentions_platform_and_confirmation() {
        let ui = CampaignProgress::with_target(ProgressDrawTarget::hidden());
        let line = ui.result_line(&result(Outcome::Submitted, Some("ABC-123")));
        assert!(line.contains("[greenhouse]"));
        assert!(line.contains("Engineer @ Acme"));
        assert!(line.contains("confirmation ABC-123"));

        let line = ui.result_line(&result(Outcome::Failed, None));
        assert!(!line.contains("confirmation"));
    }

    #[tokio::test]
    async fn follow_counts_finished_jobs() {
        let (tx, rx) = mpsc::unbounded_channel();
        let ui = CampaignProgress::with_target(ProgressDrawTarget::hidden());
        let pb = ui.pb.clone();
        tx.send(CampaignEvent::Queued { total: 2 }).unwrap();
        tx.send(CampaignEvent::Finished(result(Outcome::Submitted, None)))
            .unwrap();
        tx.send(CampaignEvent::Deferred {
            job_id: "j2".into(),
            reason: "circuit open".into(),
        })
        .unwrap();
        tx.send(CampaignEvent::Finished(result(Outcome::Skipped, None)))
            .unwrap();
        drop(tx);
        ui.follow(rx).await;
        assert_eq!(pb.position(), 2);
        assert_eq!(pb.length(), Some(2));
    }

    #[tokio::test]
    async fn status_reports_open_circuit_from_history() {
        let recorder = MemoryRecorder::new();
        for _ in 0..5 {
            let mut a = Attempt::begin("j", PlatformId::Lever, 1, "s");
            a.error = Some(ErrorClass::Structural);
            a.finish(Outcome::Failed, "no form", None);
            recorder.record_attempt(&a).await.unwrap();
        }
        let mut ok = Attempt::begin("k", PlatformId::Greenhouse, 1, "s");
        ok.finish(Outcome::PendingReview, "held", None);
        recorder.record_attempt(&ok).await.unwrap();

        let rows = collect_status(
            &recorder,
            BreakerConfig::default(),
            &PlatformId::ALL,
            Duration::from_secs(3600),
        )
        .await
        .unwrap();
        assert_eq!(rows.len(), 2);
        let gh = &rows[0];
        assert_eq!(gh.platform, PlatformId::Greenhouse);
        assert_eq!(gh.stats.pending_review, 1);
        assert_eq!(gh.circuit, BreakerState::Closed);
        let lever = &rows[1];
        assert_eq!(lever.stats.failed, 5);
        assert_eq!(lever.circuit, BreakerState::Open);
    }
}
