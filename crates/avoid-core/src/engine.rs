//! Deconfliction engine.
//!
//! One [`DeconflictionEngine::tick`] per control-loop cycle:
//!
//! 1. refresh the own record if the self-report changed,
//! 2. refresh traffic records if the ingest marker changed,
//! 3. early-out when neither changed (prior zones stand),
//! 4. predict own-vs-traffic candidates and flatten the own timeline,
//! 5. propagate through vehicles sharing a zone with the own vehicle,
//!    breadth-first with a visited set and a depth cap,
//! 6. expose the layer for the zone active now or next.
//!
//! The tick never fails. Every problem becomes a [`Diagnostic`] in the
//! returned [`TickReport`] and the engine keeps its last usable state.

use crate::error::{DeconflictError, Result};
use crate::feed::SurveillanceFeed;
use crate::interval::Interval;
use crate::models::{Millis, VehicleId};
use crate::predictor::{LinearPredictor, TrajectoryPredictor};
use crate::rules::{AvoidanceRules, ChangeMarker};
use crate::vehicle::VehicleRecord;
use crate::zone::{ConflictZone, FlattenOutcome, ZoneGraph};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

type PairKey = (VehicleId, VehicleId);

fn pair_key(a: VehicleId, b: VehicleId) -> PairKey {
    (a.min(b), a.max(b))
}

/// Positive-length parts of `window` left after removing every cut.
fn uncovered(window: Interval, cuts: &[Interval]) -> Vec<Interval> {
    cuts.iter()
        .fold(vec![window], |pieces, cut| {
            pieces.iter().flat_map(|piece| piece.difference(cut)).collect()
        })
        .into_iter()
        .filter(|piece| piece.length() > 0)
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TickStatus {
    /// No new data; the previous zones stand
    Skipped,
    Recomputed,
    /// Recomputed, but a cap cut the work short
    Degraded,
}

/// Something the tick could not do cleanly.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Diagnostic {
    NoOwnState,
    StaleData {
        vehicle: VehicleId,
        age_ms: Millis,
    },
    PredictionFailed {
        a: VehicleId,
        b: VehicleId,
        reason: String,
    },
    /// A zone on the own timeline includes vehicles whose conflicts were
    /// carried over from an earlier tick. Other vehicles may compute a
    /// different participant set for it.
    UncertainParticipants {
        interval: Interval,
        participants: Vec<VehicleId>,
        carried: Vec<VehicleId>,
    },
    RecursionCapReached {
        vehicle: VehicleId,
        depth: usize,
    },
    MergePassCapReached {
        vehicle: VehicleId,
    },
}

impl Diagnostic {
    /// The library error this diagnostic stands for, if any.
    pub fn as_error(&self) -> Option<DeconflictError> {
        match self {
            Diagnostic::NoOwnState => Some(DeconflictError::NoOwnState),
            Diagnostic::StaleData { vehicle, age_ms } => Some(DeconflictError::StaleData {
                vehicle: *vehicle,
                age_ms: *age_ms,
            }),
            Diagnostic::PredictionFailed { a, b, reason } => Some(DeconflictError::Prediction {
                a: *a,
                b: *b,
                reason: reason.clone(),
            }),
            _ => None,
        }
    }
}

/// Layer the own vehicle should hold for one zone.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LayerAdvisory {
    pub interval: Interval,
    pub layer: usize,
    pub participants: Vec<VehicleId>,
    pub altitude_m: f64,
    /// The zone contains `now`; otherwise it is the next one ahead
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TickReport {
    pub now: Millis,
    pub status: TickStatus,
    pub advisory: Option<LayerAdvisory>,
    pub diagnostics: Vec<Diagnostic>,
    pub zones_on_own_timeline: usize,
}

/// Consumer of commanded layers (autopilot bridge, logger, ...).
pub trait LayerSink {
    fn apply(&mut self, advisory: Option<&LayerAdvisory>);
}

/// Per-tick scratch state.
#[derive(Default)]
struct TickContext {
    /// Windows already predicted per pair this tick
    covered: HashMap<PairKey, Vec<Interval>>,
    failed: HashSet<PairKey>,
    stale: HashSet<VehicleId>,
    carried: BTreeSet<VehicleId>,
    flattened: FlattenOutcome,
    diagnostics: Vec<Diagnostic>,
    degraded: bool,
}

pub struct DeconflictionEngine<P = LinearPredictor> {
    own_id: VehicleId,
    rules: AvoidanceRules,
    predictor: P,
    graph: ZoneGraph,
    last_own_marker: Option<u64>,
    /// Traffic marker plus the feed's removal count
    last_ingest_marker: Option<(u64, u64)>,
    /// Last successfully predicted windows per pair
    pair_cache: HashMap<PairKey, Vec<Interval>>,
    /// Vehicles whose windows were carried over in the last recompute
    carried: BTreeSet<VehicleId>,
}

impl DeconflictionEngine<LinearPredictor> {
    /// Engine with the constant-velocity predictor built from `rules`.
    pub fn with_linear_predictor(own_id: VehicleId, rules: AvoidanceRules) -> Result<Self> {
        let predictor = LinearPredictor::from_rules(&rules);
        Self::new(own_id, rules, predictor)
    }
}

impl<P: TrajectoryPredictor> DeconflictionEngine<P> {
    pub fn new(own_id: VehicleId, rules: AvoidanceRules, predictor: P) -> Result<Self> {
        rules.validate()?;
        Ok(Self {
            own_id,
            graph: ZoneGraph::new(rules.min_zone_duration_ms),
            rules,
            predictor,
            last_own_marker: None,
            last_ingest_marker: None,
            pair_cache: HashMap::new(),
            carried: BTreeSet::new(),
        })
    }

    pub fn own_id(&self) -> VehicleId {
        self.own_id
    }

    pub fn rules(&self) -> &AvoidanceRules {
        &self.rules
    }

    pub fn graph(&self) -> &ZoneGraph {
        &self.graph
    }

    /// The own vehicle's record, once a self-report has been seen.
    pub fn own_record(&self) -> Result<&VehicleRecord> {
        self.graph
            .vehicle(self.own_id)
            .ok_or(DeconflictError::NoOwnState)
    }

    /// Vehicles whose conflicts were carried over in the last recompute.
    pub fn carried_over(&self) -> &BTreeSet<VehicleId> {
        &self.carried
    }

    /// The own vehicle's zones in chronological order.
    pub fn own_timeline(&self) -> Vec<&ConflictZone> {
        self.graph
            .timeline(self.own_id)
            .into_iter()
            .map(|(_, zone)| zone)
            .collect()
    }

    /// Layer for the zone active at `now`, or the next one ahead.
    pub fn advisory(&self, now: Millis) -> Option<LayerAdvisory> {
        let (_, zone) = self.graph.zone_at_or_after(self.own_id, now)?;
        let layer = zone.deconflicted_height(self.own_id)?;
        Some(LayerAdvisory {
            interval: zone.interval,
            layer,
            participants: zone.participants.iter().copied().collect(),
            altitude_m: self.rules.layer_altitude_m(layer),
            active: zone.interval.contains(now),
        })
    }

    /// Run one tick and hand the resulting advisory to `sink`.
    pub fn tick_into(
        &mut self,
        now: Millis,
        feed: &dyn SurveillanceFeed,
        sink: &mut dyn LayerSink,
    ) -> TickReport {
        let report = self.tick(now, feed);
        sink.apply(report.advisory.as_ref());
        report
    }

    pub fn tick(&mut self, now: Millis, feed: &dyn SurveillanceFeed) -> TickReport {
        let mut ctx = TickContext::default();

        let own_changed = self.refresh_own(now, feed);
        if self.graph.vehicle(self.own_id).is_none() {
            ctx.diagnostics.push(Diagnostic::NoOwnState);
            return self.finish(now, TickStatus::Skipped, ctx);
        }

        let traffic_changed = self.refresh_traffic(feed);
        if !own_changed && !traffic_changed {
            return self.finish(now, TickStatus::Skipped, ctx);
        }

        self.recompute(now, &mut ctx);

        let status = if ctx.degraded {
            TickStatus::Degraded
        } else {
            TickStatus::Recomputed
        };
        self.finish(now, status, ctx)
    }

    /// Compare a participant set another vehicle computed for `interval`
    /// against the local timeline.
    ///
    /// Disagreement is reported, not resolved: the two vehicles may be
    /// flying different layer assignments for the same window.
    pub fn reconcile_peer_view(
        &self,
        interval: Interval,
        peer: &BTreeSet<VehicleId>,
    ) -> Result<()> {
        let min = self.graph.min_zone_duration();
        let overlapping: Vec<&ConflictZone> = self
            .own_timeline()
            .into_iter()
            .filter(|zone| zone.interval.overlap_length(&interval) >= min)
            .collect();

        let mismatch = if peer.contains(&self.own_id) {
            if overlapping.is_empty() {
                Some(Vec::new())
            } else {
                overlapping
                    .iter()
                    .find(|zone| &zone.participants != peer)
                    .map(|zone| zone.participants.iter().copied().collect())
            }
        } else {
            overlapping
                .iter()
                .find(|zone| zone.participants.iter().any(|v| peer.contains(v)))
                .map(|zone| zone.participants.iter().copied().collect())
        };

        match mismatch {
            None => Ok(()),
            Some(local) => {
                let peer: Vec<VehicleId> = peer.iter().copied().collect();
                tracing::warn!(
                    interval = %interval,
                    ?local,
                    ?peer,
                    "participant set disagrees with peer"
                );
                Err(DeconflictError::InconsistentParticipants {
                    interval,
                    local,
                    peer,
                })
            }
        }
    }

    // ==== Tick stages ====

    fn refresh_own(&mut self, now: Millis, feed: &dyn SurveillanceFeed) -> bool {
        let Some(own) = feed.last_self_report() else {
            return false;
        };
        let marker = match self.rules.change_marker {
            ChangeMarker::Generation => own.generation,
            ChangeMarker::Timestamp => own.report.timestamp,
        };
        if self.last_own_marker == Some(marker) {
            return false;
        }
        self.last_own_marker = Some(marker);

        let mut report = own.report;
        report.id = self.own_id;
        self.graph.upsert_vehicle(&report, now);
        true
    }

    fn refresh_traffic(&mut self, feed: &dyn SurveillanceFeed) -> bool {
        let ingest = feed.last_ingest_marker();
        let marker = match self.rules.change_marker {
            ChangeMarker::Generation => (ingest.generation, ingest.removals),
            ChangeMarker::Timestamp => (ingest.timestamp, ingest.removals),
        };
        if self.last_ingest_marker == Some(marker) {
            return false;
        }
        self.last_ingest_marker = Some(marker);

        let tracked = feed.tracked_vehicles();
        let mut live = BTreeSet::new();
        for entry in tracked.iter().filter(|e| e.report.id != self.own_id) {
            live.insert(entry.report.id);
            self.graph.upsert_vehicle(&entry.report, entry.received_at);
        }

        let gone: Vec<VehicleId> = self
            .graph
            .vehicle_ids()
            .filter(|id| *id != self.own_id && !live.contains(id))
            .collect();
        for id in gone {
            tracing::debug!(vehicle = id, "traffic no longer reported, dropping record");
            self.graph.remove_vehicle(id);
        }
        let own = self.own_id;
        self.pair_cache
            .retain(|(a, b), _| (*a == own || live.contains(a)) && (*b == own || live.contains(b)));
        true
    }

    fn recompute(&mut self, now: Millis, ctx: &mut TickContext) {
        self.graph.clear_zones();

        let horizon = Interval {
            start: now,
            end: now.saturating_add(self.rules.lookahead_ms),
        };
        let own = self.own_id;

        let others: Vec<VehicleId> = self.graph.vehicle_ids().filter(|v| *v != own).collect();
        for other in others {
            self.predict_pair(own, other, now, &[horizon], ctx);
        }
        self.settle(ctx);

        // Conflicts outside the own vehicle's zones cannot change its layer.
        let search: Vec<Interval> = self
            .graph
            .timeline(own)
            .into_iter()
            .map(|(_, zone)| zone.interval)
            .collect();
        self.propagate(now, &search, ctx);

        for (_, zone) in self.graph.timeline(own) {
            let carried: Vec<VehicleId> = zone
                .participants
                .iter()
                .copied()
                .filter(|v| ctx.carried.contains(v))
                .collect();
            if !carried.is_empty() {
                ctx.diagnostics.push(Diagnostic::UncertainParticipants {
                    interval: zone.interval,
                    participants: zone.participants.iter().copied().collect(),
                    carried,
                });
            }
        }
        self.carried = ctx.carried.clone();
    }

    /// Breadth-first expansion from the own vehicle's zone partners.
    ///
    /// Every expanded vehicle is predicted against all others over the
    /// own vehicle's zone windows, since a later merge may pull it into
    /// own zones it was not part of when it was queued.
    fn propagate(&mut self, now: Millis, search: &[Interval], ctx: &mut TickContext) {
        if search.is_empty() {
            return;
        }
        let own = self.own_id;
        let cap = self.rules.recursion_cap;
        let mut visited: HashSet<VehicleId> = HashSet::from([own]);
        let mut queued: HashSet<VehicleId> = HashSet::new();
        let mut queue: VecDeque<(VehicleId, usize)> = VecDeque::new();

        self.enqueue_partners(own, 1, &visited, &mut queued, &mut queue, ctx);

        while let Some((vehicle, depth)) = queue.pop_front() {
            if !visited.insert(vehicle) {
                continue;
            }

            let counterparts: Vec<VehicleId> = self
                .graph
                .vehicle_ids()
                .filter(|v| *v != vehicle)
                .collect();
            for other in counterparts {
                self.predict_pair(vehicle, other, now, search, ctx);
            }
            self.settle(ctx);

            if depth < cap {
                self.enqueue_partners(vehicle, depth + 1, &visited, &mut queued, &mut queue, ctx);
            } else {
                self.note_truncated(vehicle, depth + 1, &visited, &queued, ctx);
            }
        }
    }

    /// Vehicles sharing a zone of `vehicle` that also holds the own vehicle.
    fn partners_with_own(&self, vehicle: VehicleId) -> BTreeSet<VehicleId> {
        let own = self.own_id;
        self.graph
            .timeline(vehicle)
            .into_iter()
            .filter(|(_, zone)| zone.participants.contains(&own))
            .flat_map(|(_, zone)| zone.participants.iter().copied())
            .collect()
    }

    fn enqueue_partners(
        &self,
        vehicle: VehicleId,
        depth: usize,
        visited: &HashSet<VehicleId>,
        queued: &mut HashSet<VehicleId>,
        queue: &mut VecDeque<(VehicleId, usize)>,
        ctx: &mut TickContext,
    ) {
        if depth > self.rules.recursion_cap {
            self.note_truncated(vehicle, depth, visited, queued, ctx);
            return;
        }
        for partner in self.partners_with_own(vehicle) {
            if !visited.contains(&partner) && queued.insert(partner) {
                queue.push_back((partner, depth));
            }
        }
    }

    /// Record that partners of `vehicle` were left unexpanded by the cap.
    fn note_truncated(
        &self,
        vehicle: VehicleId,
        depth: usize,
        visited: &HashSet<VehicleId>,
        queued: &HashSet<VehicleId>,
        ctx: &mut TickContext,
    ) {
        let missed = self
            .partners_with_own(vehicle)
            .iter()
            .any(|v| !visited.contains(v) && !queued.contains(v));
        if missed {
            tracing::warn!(vehicle, depth, "recursion cap reached, propagation truncated");
            ctx.degraded = true;
            ctx.diagnostics
                .push(Diagnostic::RecursionCapReached { vehicle, depth });
        }
    }

    /// Predict one pair over the parts of `windows` not yet covered this
    /// tick and insert the candidate zones.
    ///
    /// Stale or failing pairs fall back to the windows cached from their
    /// last successful prediction.
    fn predict_pair(
        &mut self,
        a: VehicleId,
        b: VehicleId,
        now: Millis,
        windows: &[Interval],
        ctx: &mut TickContext,
    ) {
        let key = pair_key(a, b);
        let covered = ctx.covered.entry(key).or_default();
        let pending: Vec<Interval> = windows
            .iter()
            .flat_map(|w| uncovered(*w, covered.as_slice()))
            .collect();
        if pending.is_empty() {
            return;
        }
        covered.extend(pending.iter().copied());

        let (Some(ra), Some(rb)) = (self.graph.vehicle(a), self.graph.vehicle(b)) else {
            return;
        };

        let stale = [ra, rb].into_iter().find_map(|record| {
            let age = now.saturating_sub(record.last_update);
            (record.id != self.own_id && age > self.rules.stale_after_ms).then_some((record.id, age))
        });
        let (ra, rb) = (ra.as_report(), rb.as_report());

        let found = if let Some((vehicle, age_ms)) = stale {
            if ctx.stale.insert(vehicle) {
                tracing::warn!(vehicle, age_ms, "stale traffic, keeping last known conflicts");
                ctx.diagnostics
                    .push(Diagnostic::StaleData { vehicle, age_ms });
            }
            ctx.carried.insert(vehicle);
            self.cached_windows(key, &pending)
        } else if ctx.failed.contains(&key) {
            self.cached_windows(key, &pending)
        } else {
            let predicted: Result<Vec<Vec<Interval>>> = pending
                .iter()
                .map(|w| self.predictor.predict(&ra, &rb, now, *w))
                .collect();
            match predicted {
                Ok(found) => {
                    let found: Vec<Interval> = found.into_iter().flatten().collect();
                    self.remember(key, now, &pending, &found);
                    found
                }
                Err(err) => {
                    tracing::warn!(a, b, error = %err, "prediction failed, keeping last known conflicts");
                    ctx.failed.insert(key);
                    ctx.diagnostics.push(Diagnostic::PredictionFailed {
                        a,
                        b,
                        reason: err.to_string(),
                    });
                    for v in [a, b] {
                        if v != self.own_id {
                            ctx.carried.insert(v);
                        }
                    }
                    self.cached_windows(key, &pending)
                }
            }
        };

        for window in found {
            match self.graph.insert_zone(window, [a, b]) {
                Ok(Some(_)) => {}
                Ok(None) => tracing::trace!(a, b, window = %window, "candidate below minimum duration"),
                Err(err) => tracing::warn!(a, b, error = %err, "could not insert candidate zone"),
            }
        }
    }

    fn cached_windows(&self, key: PairKey, windows: &[Interval]) -> Vec<Interval> {
        let Some(cached) = self.pair_cache.get(&key) else {
            return Vec::new();
        };
        cached
            .iter()
            .flat_map(|c| windows.iter().filter_map(move |w| c.clamp_to(w)))
            .collect()
    }

    /// Replace what the cache knows about `searched` with `found`.
    /// Windows outside `searched` keep their last known value.
    fn remember(&mut self, key: PairKey, now: Millis, searched: &[Interval], found: &[Interval]) {
        let mut windows: Vec<Interval> = self
            .pair_cache
            .remove(&key)
            .unwrap_or_default()
            .into_iter()
            .filter(|c| c.end >= now)
            .flat_map(|c| uncovered(c, searched))
            .collect();
        windows.extend_from_slice(found);
        if windows.is_empty() {
            return;
        }
        windows.sort_by_key(|w| (w.start, w.end));
        self.pair_cache.insert(key, windows);
    }

    /// Flatten every timeline that still holds overlapping zones.
    fn settle(&mut self, ctx: &mut TickContext) {
        let unsettled: Vec<VehicleId> = self
            .graph
            .vehicle_ids()
            .filter(|v| !self.graph.is_disjoint(*v))
            .collect();
        for vehicle in unsettled {
            self.flatten(vehicle, ctx);
        }
    }

    fn flatten(&mut self, vehicle: VehicleId, ctx: &mut TickContext) {
        let outcome = self.graph.flatten(vehicle, self.rules.merge_pass_cap);
        if outcome.capped {
            tracing::warn!(vehicle, passes = outcome.passes(), "merge pass cap reached");
            ctx.degraded = true;
            ctx.diagnostics
                .push(Diagnostic::MergePassCapReached { vehicle });
        }
        ctx.flattened.absorb(outcome);
    }

    fn finish(&self, now: Millis, status: TickStatus, ctx: TickContext) -> TickReport {
        let advisory = self.advisory(now);
        let zones_on_own_timeline = self
            .graph
            .vehicle(self.own_id)
            .map_or(0, |record| record.zones().len());

        if status != TickStatus::Skipped {
            tracing::debug!(
                now,
                ?status,
                zones = zones_on_own_timeline,
                layer = advisory.as_ref().map(|a| a.layer),
                merges = ctx.flattened.merges,
                clips = ctx.flattened.clips,
                diagnostics = ctx.diagnostics.len(),
                "deconfliction tick"
            );
        }

        TickReport {
            now,
            status,
            advisory,
            diagnostics: ctx.diagnostics,
            zones_on_own_timeline,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::SharedFeed;
    use crate::models::{Location, Vector3, VehicleReport};
    use std::cell::RefCell;

    /// Predictor returning scripted windows per pair.
    #[derive(Default)]
    struct Scripted {
        windows: HashMap<PairKey, Vec<Interval>>,
        failing: HashSet<PairKey>,
        calls: RefCell<Vec<PairKey>>,
    }

    impl Scripted {
        fn with(mut self, a: VehicleId, b: VehicleId, start: Millis, end: Millis) -> Self {
            self.windows
                .entry(pair_key(a, b))
                .or_default()
                .push(Interval::new(start, end).unwrap());
            self
        }
    }

    impl TrajectoryPredictor for Scripted {
        fn predict(
            &self,
            a: &VehicleReport,
            b: &VehicleReport,
            _now: Millis,
            window: Interval,
        ) -> Result<Vec<Interval>> {
            let key = pair_key(a.id, b.id);
            self.calls.borrow_mut().push(key);
            if self.failing.contains(&key) {
                return Err(DeconflictError::Prediction {
                    a: a.id,
                    b: b.id,
                    reason: "scripted failure".into(),
                });
            }
            Ok(self
                .windows
                .get(&key)
                .map(|ws| ws.iter().filter_map(|w| w.clamp_to(&window)).collect())
                .unwrap_or_default())
        }
    }

    fn report(id: VehicleId) -> VehicleReport {
        VehicleReport::new(id, 0, Location::new(33.0, -117.0, 50.0), Vector3::default())
    }

    fn feed_with(own: VehicleId, traffic: &[VehicleId], received_at: Millis) -> SharedFeed {
        let feed = SharedFeed::new();
        feed.publish_own(report(own));
        for &id in traffic {
            feed.publish_traffic(report(id), received_at);
        }
        feed
    }

    fn layout(engine: &DeconflictionEngine<Scripted>) -> Vec<(Millis, Millis, Vec<VehicleId>)> {
        engine
            .own_timeline()
            .into_iter()
            .map(|z| (z.interval.start, z.interval.end, z.participants.iter().copied().collect()))
            .collect()
    }

    #[test]
    fn test_no_own_state_skips() {
        let mut engine = DeconflictionEngine::new(0, AvoidanceRules::default(), Scripted::default()).unwrap();
        let feed = SharedFeed::new();
        let report = engine.tick(0, &feed);
        assert_eq!(report.status, TickStatus::Skipped);
        assert_eq!(report.diagnostics, vec![Diagnostic::NoOwnState]);
        assert!(matches!(engine.own_record(), Err(DeconflictError::NoOwnState)));
        assert!(matches!(report.diagnostics[0].as_error(), Some(DeconflictError::NoOwnState)));
    }

    #[test]
    fn test_two_candidates_merge_on_own_timeline() {
        let predictor = Scripted::default().with(0, 1, 1000, 4000).with(0, 2, 3000, 6000);
        let mut engine = DeconflictionEngine::new(0, AvoidanceRules::default(), predictor).unwrap();
        let feed = feed_with(0, &[1, 2], 0);

        let report = engine.tick(0, &feed);
        assert_eq!(report.status, TickStatus::Recomputed);
        assert_eq!(
            layout(&engine),
            vec![
                (1000, 3000, vec![0, 1]),
                (3000, 4000, vec![0, 1, 2]),
                (4000, 6000, vec![0, 2]),
            ]
        );
        engine.graph().audit().unwrap();

        let advisory = report.advisory.unwrap();
        assert_eq!(advisory.interval, Interval::new(1000, 3000).unwrap());
        assert_eq!(advisory.layer, 0);
        assert!(!advisory.active);
    }

    #[test]
    fn test_unchanged_feed_is_skipped() {
        let predictor = Scripted::default().with(0, 1, 1000, 4000);
        let mut engine = DeconflictionEngine::new(0, AvoidanceRules::default(), predictor).unwrap();
        let feed = feed_with(0, &[1], 0);

        assert_eq!(engine.tick(0, &feed).status, TickStatus::Recomputed);
        let calls = engine.predictor.calls.borrow().len();

        let again = engine.tick(100, &feed);
        assert_eq!(again.status, TickStatus::Skipped);
        assert_eq!(engine.predictor.calls.borrow().len(), calls);
        assert_eq!(again.zones_on_own_timeline, 1);
    }

    #[test]
    fn test_propagation_pulls_in_indirect_conflicts() {
        // Own (5) conflicts with 1; 1 conflicts with 2, whom own never meets.
        let predictor = Scripted::default().with(5, 1, 1000, 5000).with(1, 2, 2000, 3000);
        let mut engine = DeconflictionEngine::new(5, AvoidanceRules::default(), predictor).unwrap();
        let feed = feed_with(5, &[1, 2], 0);

        engine.tick(0, &feed);
        assert_eq!(
            layout(&engine),
            vec![
                (1000, 2000, vec![1, 5]),
                (2000, 3000, vec![1, 2, 5]),
                (3000, 5000, vec![1, 5]),
            ]
        );
        engine.graph().audit().unwrap();

        let advisory = engine.advisory(2500).unwrap();
        assert!(advisory.active);
        assert_eq!(advisory.layer, 2);
    }

    #[test]
    fn test_partner_conflict_inside_another_own_zone() {
        // 1 and 2 meet inside own's zone with 2, not the one with 1.
        let predictor = Scripted::default()
            .with(0, 1, 1000, 5000)
            .with(0, 2, 8000, 12000)
            .with(1, 2, 9000, 10000);
        let mut engine = DeconflictionEngine::new(0, AvoidanceRules::default(), predictor).unwrap();
        let feed = feed_with(0, &[1, 2], 0);

        assert_eq!(engine.tick(0, &feed).status, TickStatus::Recomputed);
        assert_eq!(
            layout(&engine),
            vec![
                (1000, 5000, vec![0, 1]),
                (8000, 9000, vec![0, 2]),
                (9000, 10000, vec![0, 1, 2]),
                (10000, 12000, vec![0, 2]),
            ]
        );
        assert_eq!(engine.advisory(9500).unwrap().participants, vec![0, 1, 2]);
        engine.graph().audit().unwrap();
    }

    #[test]
    fn test_cached_windows_survive_partial_searches() {
        let predictor = Scripted::default()
            .with(0, 1, 1000, 4000)
            .with(1, 2, 2000, 3000)
            .with(1, 2, 6000, 7000);
        let mut engine = DeconflictionEngine::new(0, AvoidanceRules::default(), predictor).unwrap();
        let feed = feed_with(0, &[1, 2], 0);
        engine.tick(0, &feed);

        // Own meets 1 later; only the second 1-2 window gets searched.
        engine
            .predictor
            .windows
            .insert(pair_key(0, 1), vec![Interval::new(5000, 8000).unwrap()]);
        feed.publish_own(report(0));
        engine.tick(0, &feed);
        assert_eq!(
            layout(&engine),
            vec![
                (5000, 6000, vec![0, 1]),
                (6000, 7000, vec![0, 1, 2]),
                (7000, 8000, vec![0, 1]),
            ]
        );

        // With 1-2 failing, both windows come back from the cache.
        engine
            .predictor
            .windows
            .insert(pair_key(0, 1), vec![Interval::new(1000, 8000).unwrap()]);
        engine.predictor.failing.insert(pair_key(1, 2));
        feed.publish_own(report(0));
        let report = engine.tick(0, &feed);

        assert!(report
            .diagnostics
            .iter()
            .any(|d| matches!(d, Diagnostic::PredictionFailed { a: 1, b: 2, .. })));
        assert_eq!(
            layout(&engine),
            vec![
                (1000, 2000, vec![0, 1]),
                (2000, 3000, vec![0, 1, 2]),
                (3000, 6000, vec![0, 1]),
                (6000, 7000, vec![0, 1, 2]),
                (7000, 8000, vec![0, 1]),
            ]
        );
        assert!(engine.carried_over().contains(&2));
        engine.graph().audit().unwrap();
    }

    #[test]
    fn test_recursion_cap_degrades() {
        let predictor = Scripted::default()
            .with(0, 1, 1000, 5000)
            .with(1, 2, 1000, 5000)
            .with(2, 3, 1000, 5000);
        let rules = AvoidanceRules {
            recursion_cap: 1,
            ..AvoidanceRules::default()
        };
        let mut engine = DeconflictionEngine::new(0, rules, predictor).unwrap();
        let feed = feed_with(0, &[1, 2, 3], 0);

        let report = engine.tick(0, &feed);
        assert_eq!(report.status, TickStatus::Degraded);
        assert!(report
            .diagnostics
            .iter()
            .any(|d| matches!(d, Diagnostic::RecursionCapReached { .. })));
        engine.graph().audit().unwrap();
    }

    #[test]
    fn test_stale_vehicle_keeps_last_known_zone() {
        let predictor = Scripted::default().with(0, 1, 1000, 4000);
        let rules = AvoidanceRules {
            stale_after_ms: 1000,
            ..AvoidanceRules::default()
        };
        let mut engine = DeconflictionEngine::new(0, rules, predictor).unwrap();
        let feed = feed_with(0, &[1], 0);
        engine.tick(0, &feed);

        // Vehicle 1 stops reporting; the script no longer predicts a conflict.
        engine.predictor.windows.clear();
        feed.publish_own(report(0));
        let report = engine.tick(2000, &feed);

        assert!(report
            .diagnostics
            .iter()
            .any(|d| matches!(d, Diagnostic::StaleData { vehicle: 1, .. })));
        assert!(report
            .diagnostics
            .iter()
            .any(|d| matches!(d, Diagnostic::UncertainParticipants { .. })));
        assert_eq!(layout(&engine), vec![(2000, 4000, vec![0, 1])]);
        assert!(engine.carried_over().contains(&1));
    }

    #[test]
    fn test_prediction_failure_isolated_to_pair() {
        let mut predictor = Scripted::default().with(0, 1, 1000, 4000).with(0, 2, 6000, 8000);
        predictor.failing.insert(pair_key(0, 1));
        let mut engine = DeconflictionEngine::new(0, AvoidanceRules::default(), predictor).unwrap();
        let feed = feed_with(0, &[1, 2], 0);

        let report = engine.tick(0, &feed);
        assert_eq!(report.status, TickStatus::Recomputed);
        assert!(report
            .diagnostics
            .iter()
            .any(|d| matches!(d, Diagnostic::PredictionFailed { a: 0, b: 1, .. })));
        assert_eq!(layout(&engine), vec![(6000, 8000, vec![0, 2])]);
    }

    #[test]
    fn test_dropped_traffic_is_removed() {
        let predictor = Scripted::default().with(0, 1, 1000, 4000);
        let mut engine = DeconflictionEngine::new(0, AvoidanceRules::default(), predictor).unwrap();
        let feed = feed_with(0, &[1], 0);
        engine.tick(0, &feed);
        assert_eq!(engine.own_timeline().len(), 1);

        feed.remove_vehicle(1);
        engine.tick(100, &feed);
        assert!(engine.graph().vehicle(1).is_none());
        assert!(engine.own_timeline().is_empty());
    }

    #[test]
    fn test_timestamp_change_marker() {
        let predictor = Scripted::default().with(0, 1, 1000, 4000);
        let rules = AvoidanceRules {
            change_marker: ChangeMarker::Timestamp,
            ..AvoidanceRules::default()
        };
        let mut engine = DeconflictionEngine::new(0, rules, predictor).unwrap();
        let feed = feed_with(0, &[1], 0);
        assert_eq!(engine.tick(0, &feed).status, TickStatus::Recomputed);

        // Republishing the same timestamps is not new data in this mode.
        feed.publish_own(report(0));
        feed.publish_traffic(report(1), 50);
        assert_eq!(engine.tick(100, &feed).status, TickStatus::Skipped);
    }

    #[test]
    fn test_timestamp_marker_sees_removals() {
        let predictor = Scripted::default().with(0, 1, 1000, 4000);
        let rules = AvoidanceRules {
            change_marker: ChangeMarker::Timestamp,
            ..AvoidanceRules::default()
        };
        let mut engine = DeconflictionEngine::new(0, rules, predictor).unwrap();
        let feed = feed_with(0, &[1], 0);
        engine.tick(0, &feed);
        assert_eq!(engine.own_timeline().len(), 1);

        // Removal leaves every feed timestamp as it was.
        feed.remove_vehicle(1);
        let report = engine.tick(100, &feed);
        assert_eq!(report.status, TickStatus::Recomputed);
        assert!(engine.own_timeline().is_empty());
        assert!(engine.graph().vehicle(1).is_none());
    }

    #[test]
    fn test_reconcile_peer_view() {
        let predictor = Scripted::default().with(0, 1, 1000, 4000);
        let mut engine = DeconflictionEngine::new(0, AvoidanceRules::default(), predictor).unwrap();
        let feed = feed_with(0, &[1, 2], 0);
        engine.tick(0, &feed);

        let window = Interval::new(1000, 4000).unwrap();
        engine
            .reconcile_peer_view(window, &[0, 1].into_iter().collect())
            .unwrap();

        let err = engine
            .reconcile_peer_view(window, &[0, 1, 2].into_iter().collect())
            .unwrap_err();
        assert!(matches!(err, DeconflictError::InconsistentParticipants { .. }));

        // A peer cluster that does not involve us or our partners is fine.
        engine
            .reconcile_peer_view(window, &[7, 8].into_iter().collect())
            .unwrap();
    }

    #[test]
    fn test_tick_into_feeds_sink() {
        struct Recorder(Vec<Option<usize>>);
        impl LayerSink for Recorder {
            fn apply(&mut self, advisory: Option<&LayerAdvisory>) {
                self.0.push(advisory.map(|a| a.layer));
            }
        }

        let predictor = Scripted::default().with(3, 1, 0, 4000);
        let mut engine = DeconflictionEngine::new(3, AvoidanceRules::default(), predictor).unwrap();
        let feed = feed_with(3, &[1], 0);
        let mut sink = Recorder(Vec::new());

        engine.tick_into(0, &feed, &mut sink);
        assert_eq!(sink.0, vec![Some(1)]);
    }
}
