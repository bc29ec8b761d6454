//! Scenario replay against a live engine.

use crate::scenario::Scenario;
use anyhow::Result;
use avoid_core::{
    AvoidanceRules, DeconflictionEngine, Diagnostic, LayerAdvisory, LayerSink, Millis, SharedFeed,
    TickReport, TickStatus,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::time::{interval, sleep_until, Duration, Instant, MissedTickBehavior};

/// One output record per tick.
#[derive(Debug, Clone, Serialize)]
pub struct ReplayLine {
    pub generated_at: DateTime<Utc>,
    #[serde(flatten)]
    pub report: TickReport,
}

impl ReplayLine {
    pub fn new(report: &TickReport) -> Self {
        Self {
            generated_at: Utc::now(),
            report: report.clone(),
        }
    }

    /// Single-line human summary.
    pub fn describe(&self) -> String {
        let r = &self.report;
        let mut line = format!(
            "{} t={}ms {:?} zones={}",
            self.generated_at.format("%H:%M:%S%.3f"),
            r.now,
            r.status,
            r.zones_on_own_timeline
        );
        match &r.advisory {
            Some(a) => line.push_str(&format!(
                " layer={} alt={:.1}m {} {} participants={:?}",
                a.layer,
                a.altitude_m,
                a.interval,
                if a.active { "active" } else { "ahead" },
                a.participants
            )),
            None => line.push_str(" clear"),
        }
        for diagnostic in &r.diagnostics {
            match diagnostic.as_error() {
                Some(err) => line.push_str(&format!("\n    ! {err}")),
                None => line.push_str(&format!("\n    ! {diagnostic:?}")),
            }
        }
        line
    }
}

/// Sink that logs every change of commanded layer.
#[derive(Debug, Default)]
pub struct LayerLog {
    current: Option<usize>,
    pub changes: usize,
}

impl LayerSink for LayerLog {
    fn apply(&mut self, advisory: Option<&LayerAdvisory>) {
        let next = advisory.map(|a| a.layer);
        if next == self.current {
            return;
        }
        match advisory {
            Some(a) => tracing::info!(
                layer = a.layer,
                altitude_m = a.altitude_m,
                interval = %a.interval,
                active = a.active,
                "layer advisory changed"
            ),
            None => tracing::info!("no conflicts ahead, layer released"),
        }
        self.current = next;
        self.changes += 1;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReplaySummary {
    pub ticks: usize,
    pub recomputed: usize,
    pub skipped: usize,
    pub degraded: usize,
    pub diagnostics: usize,
    pub layer_changes: usize,
}

impl ReplaySummary {
    fn record(&mut self, report: &TickReport) {
        self.ticks += 1;
        match report.status {
            TickStatus::Skipped => self.skipped += 1,
            TickStatus::Recomputed => self.recomputed += 1,
            TickStatus::Degraded => self.degraded += 1,
        }
        self.diagnostics += report
            .diagnostics
            .iter()
            .filter(|d| !matches!(d, Diagnostic::NoOwnState))
            .count();
    }
}

/// Replay on a simulated clock: every frame due by a tick is published
/// just before that tick runs.
pub fn replay_inline<F>(scenario: &Scenario, rules: AvoidanceRules, mut on_tick: F) -> Result<ReplaySummary>
where
    F: FnMut(&TickReport) -> Result<()>,
{
    let mut engine = DeconflictionEngine::with_linear_predictor(scenario.own_id, rules)?;
    let feed = SharedFeed::new();
    let mut sink = LayerLog::default();
    let mut summary = ReplaySummary::default();

    let mut frames = scenario.frames.iter().peekable();
    let end = scenario.end_ms() + scenario.tick_ms;
    let mut now = scenario.frames.first().map_or(0, |f| f.at_ms);

    while now <= end {
        while let Some(frame) = frames.next_if(|f| f.at_ms <= now) {
            frame.publish(&feed, frame.at_ms);
        }
        let report = engine.tick_into(now, &feed, &mut sink);
        summary.record(&report);
        on_tick(&report)?;
        now += scenario.tick_ms;
    }

    summary.layer_changes = sink.changes;
    tracing::info!(scenario = scenario.label(), ?summary, "replay finished");
    Ok(summary)
}

fn elapsed_ms(origin: Instant) -> Millis {
    Millis::try_from(origin.elapsed().as_millis()).unwrap_or(Millis::MAX)
}

/// Replay against the tokio clock: frames are ingested by a separate task
/// at their recorded offsets while the engine ticks on a fixed interval.
pub async fn replay_realtime<F>(scenario: &Scenario, rules: AvoidanceRules, mut on_tick: F) -> Result<ReplaySummary>
where
    F: FnMut(&TickReport) -> Result<()>,
{
    let mut engine = DeconflictionEngine::with_linear_predictor(scenario.own_id, rules)?;
    let feed = Arc::new(SharedFeed::new());
    let mut sink = LayerLog::default();
    let mut summary = ReplaySummary::default();
    let origin = Instant::now();

    let ingest = {
        let feed = feed.clone();
        let frames = scenario.frames.clone();
        tokio::spawn(async move {
            for frame in frames {
                sleep_until(origin + Duration::from_millis(frame.at_ms)).await;
                frame.publish(&feed, elapsed_ms(origin));
                tracing::debug!(at_ms = frame.at_ms, traffic = frame.traffic.len(), "frame ingested");
            }
        })
    };

    let mut ticker = interval(Duration::from_millis(scenario.tick_ms));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let end = scenario.end_ms() + scenario.tick_ms;

    loop {
        ticker.tick().await;
        let now = elapsed_ms(origin);
        let report = engine.tick_into(now, &*feed, &mut sink);
        summary.record(&report);
        on_tick(&report)?;
        if now >= end {
            break;
        }
    }

    ingest.await?;
    summary.layer_changes = sink.changes;
    tracing::info!(scenario = scenario.label(), ?summary, "realtime replay finished");
    Ok(summary)
}
