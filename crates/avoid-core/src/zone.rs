//! Conflict zones and the interval-merge engine.
//!
//! Zones live in an arena owned by [`ZoneGraph`] and are addressed by
//! [`ZoneId`]. Each [`VehicleRecord`] holds an ordered list of handles into
//! that arena, and each zone holds the set of vehicles in it. Every
//! operation here keeps both directions in step: a vehicle lists a zone if
//! and only if the zone lists the vehicle.

use crate::error::{DeconflictError, Result};
use crate::interval::Interval;
use crate::models::{Millis, VehicleId, VehicleReport};
use crate::vehicle::VehicleRecord;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

/// Stable handle to a zone in the arena.
///
/// Handles are never reused until [`ZoneGraph::clear_zones`] resets the
/// arena, so a handle to a destroyed zone resolves to `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ZoneId(usize);

impl ZoneId {
    #[cfg(test)]
    pub(crate) fn from_raw(raw: usize) -> Self {
        Self(raw)
    }
}

/// A time window during which a set of vehicles is predicted to be in
/// unsafe proximity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConflictZone {
    pub interval: Interval,
    /// Ordered by id, which is also the layer ranking.
    pub participants: BTreeSet<VehicleId>,
}

impl ConflictZone {
    pub fn new(interval: Interval, participants: BTreeSet<VehicleId>) -> Self {
        Self {
            interval,
            participants,
        }
    }

    /// Layer index for `vehicle`: its rank among the participant ids.
    ///
    /// Every vehicle that computes the same participant set gets the same
    /// answer, and no two participants share a layer.
    pub fn deconflicted_height(&self, vehicle: VehicleId) -> Option<usize> {
        self.participants.iter().position(|&v| v == vehicle)
    }

    /// Layer for every participant, lowest id first.
    pub fn layer_assignments(&self) -> Vec<(VehicleId, usize)> {
        self.participants
            .iter()
            .enumerate()
            .map(|(layer, &vehicle)| (vehicle, layer))
            .collect()
    }
}

/// Counters from one flatten pass over a timeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlattenOutcome {
    pub merges: usize,
    pub clips: usize,
    /// The pass cap stopped the flatten before the timeline was disjoint.
    pub capped: bool,
}

impl FlattenOutcome {
    pub fn passes(&self) -> usize {
        self.merges + self.clips
    }

    pub fn absorb(&mut self, other: FlattenOutcome) {
        self.merges += other.merges;
        self.clips += other.clips;
        self.capped |= other.capped;
    }
}

/// One output region of a merge, in chronological order.
struct Piece {
    reuse: Option<ZoneId>,
    interval: Interval,
    participants: BTreeSet<VehicleId>,
}

/// Arena of conflict zones plus the vehicle records that reference them.
#[derive(Debug, Clone)]
pub struct ZoneGraph {
    min_zone_duration: Millis,
    vehicles: BTreeMap<VehicleId, VehicleRecord>,
    zones: Vec<Option<ConflictZone>>,
}

impl ZoneGraph {
    pub fn new(min_zone_duration: Millis) -> Self {
        Self {
            min_zone_duration,
            vehicles: BTreeMap::new(),
            zones: Vec::new(),
        }
    }

    pub fn min_zone_duration(&self) -> Millis {
        self.min_zone_duration
    }

    // ==== Vehicles ====

    /// Insert or refresh a vehicle record from a report.
    pub fn upsert_vehicle(&mut self, report: &VehicleReport, now: Millis) -> &mut VehicleRecord {
        self.vehicles
            .entry(report.id)
            .and_modify(|record| record.update(report, now))
            .or_insert_with(|| VehicleRecord::from_report(report, now))
    }

    /// Stop tracking a vehicle, detaching it from every zone it was in.
    ///
    /// Zones left with fewer than two participants no longer describe a
    /// conflict and are destroyed.
    pub fn remove_vehicle(&mut self, id: VehicleId) -> Option<VehicleRecord> {
        let record = self.vehicles.remove(&id)?;
        for &zone_id in &record.zones {
            let remaining = match self.zones.get_mut(zone_id.0).and_then(Option::as_mut) {
                Some(zone) => {
                    zone.participants.remove(&id);
                    zone.participants.len()
                }
                None => continue,
            };
            if remaining < 2 {
                self.destroy(zone_id);
            }
        }
        Some(record)
    }

    pub fn vehicle(&self, id: VehicleId) -> Option<&VehicleRecord> {
        self.vehicles.get(&id)
    }

    pub fn vehicle_ids(&self) -> impl Iterator<Item = VehicleId> + '_ {
        self.vehicles.keys().copied()
    }

    pub fn vehicles(&self) -> impl Iterator<Item = &VehicleRecord> {
        self.vehicles.values()
    }

    // ==== Zones ====

    pub fn zone(&self, id: ZoneId) -> Option<&ConflictZone> {
        self.zones.get(id.0).and_then(Option::as_ref)
    }

    /// Number of live zones.
    pub fn zone_count(&self) -> usize {
        self.zones.iter().filter(|z| z.is_some()).count()
    }

    /// A vehicle's zones in chronological order.
    pub fn timeline(&self, vehicle: VehicleId) -> Vec<(ZoneId, &ConflictZone)> {
        let Some(record) = self.vehicles.get(&vehicle) else {
            return Vec::new();
        };
        record
            .zones
            .iter()
            .filter_map(|&id| self.zone(id).map(|zone| (id, zone)))
            .collect()
    }

    /// The zone active at `now`, or else the next one to start.
    pub fn zone_at_or_after(&self, vehicle: VehicleId, now: Millis) -> Option<(ZoneId, &ConflictZone)> {
        self.timeline(vehicle)
            .into_iter()
            .find(|(_, zone)| zone.interval.end > now)
    }

    /// Drop every zone and empty every timeline. Vehicle state is kept.
    pub fn clear_zones(&mut self) {
        self.zones.clear();
        for record in self.vehicles.values_mut() {
            record.zones.clear();
        }
    }

    /// Create a zone and add it to each participant's timeline.
    ///
    /// Returns `Ok(None)` when the interval is shorter than the minimum zone
    /// duration or fewer than two distinct vehicles are named; such
    /// candidates are noise and never enter any timeline. The new zone may
    /// overlap existing ones until [`ZoneGraph::flatten`] runs.
    pub fn insert_zone<I>(&mut self, interval: Interval, participants: I) -> Result<Option<ZoneId>>
    where
        I: IntoIterator<Item = VehicleId>,
    {
        let participants: BTreeSet<VehicleId> = participants.into_iter().collect();
        if let Some(&unknown) = participants.iter().find(|v| !self.vehicles.contains_key(v)) {
            return Err(DeconflictError::UnknownVehicle(unknown));
        }
        if interval.length() < self.min_zone_duration || participants.len() < 2 {
            return Ok(None);
        }

        let id = self.allocate(ConflictZone::new(interval, participants));
        self.attach(id);
        Ok(Some(id))
    }

    /// Merge two zones that overlap in time.
    ///
    /// Returns `false` without touching anything when `a == b`, either
    /// handle is dead, or the overlap is shorter than the minimum zone
    /// duration. Otherwise the overlap becomes a zone holding the union of
    /// both participant sets, the earlier-starting zone keeps its leading
    /// remainder, the trailing remainder keeps the participants of whichever
    /// zone it came from, and every affected timeline is rewritten in
    /// order. Remainders shorter than the minimum duration are destroyed.
    /// Neighbouring pieces with identical participants are coalesced, so a
    /// zone already subsumed by the other is simply absorbed.
    pub fn merge(&mut self, a: ZoneId, b: ZoneId) -> bool {
        if a == b {
            return false;
        }
        let (Some(za), Some(zb)) = (self.zone(a), self.zone(b)) else {
            return false;
        };
        let Some(overlap) = za.interval.intersect(&zb.interval) else {
            return false;
        };
        if overlap.length() < self.min_zone_duration {
            return false;
        }

        let (l, r) = if Self::starts_later(zb, b, za, a) { (a, b) } else { (b, a) };
        let (Some(left), Some(right)) = (self.take(l), self.take(r)) else {
            return false;
        };

        let union: BTreeSet<VehicleId> = left
            .participants
            .union(&right.participants)
            .copied()
            .collect();

        let head = Piece {
            reuse: Some(l),
            interval: Interval {
                start: left.interval.start,
                end: overlap.start,
            },
            participants: left.participants.clone(),
        };
        let middle = Piece {
            reuse: None,
            interval: overlap,
            participants: union.clone(),
        };
        let tail = if right.interval.end <= left.interval.end {
            // Right sits inside left: it is absorbed, left's tail survives.
            Piece {
                reuse: None,
                interval: Interval {
                    start: overlap.end,
                    end: left.interval.end,
                },
                participants: left.participants.clone(),
            }
        } else {
            Piece {
                reuse: Some(r),
                interval: Interval {
                    start: overlap.end,
                    end: right.interval.end,
                },
                participants: right.participants.clone(),
            }
        };

        let pieces = coalesce([head, middle, tail]);

        for vehicle in &union {
            if let Some(record) = self.vehicles.get_mut(vehicle) {
                record.zones.retain(|z| *z != l && *z != r);
            }
        }

        let mut kept = 0usize;
        for piece in pieces {
            if piece.interval.length() < self.min_zone_duration {
                continue;
            }
            let zone = ConflictZone::new(piece.interval, piece.participants);
            let id = match piece.reuse {
                Some(id) => {
                    self.zones[id.0] = Some(zone);
                    id
                }
                None => self.allocate(zone),
            };
            self.attach(id);
            kept += 1;
        }

        tracing::trace!(
            left = l.0,
            right = r.0,
            overlap = %overlap,
            participants = union.len(),
            kept,
            "merged conflict zones"
        );
        true
    }

    /// Merge or clip until no two zones on `vehicle`'s timeline overlap by a
    /// positive duration, or until `pass_cap` passes have run.
    ///
    /// Flattening one timeline never introduces an overlap into another:
    /// every piece a merge hands a participant lies inside a zone that
    /// participant already held.
    pub fn flatten(&mut self, vehicle: VehicleId, pass_cap: usize) -> FlattenOutcome {
        let mut outcome = FlattenOutcome::default();
        while let Some((earlier, later)) = self.first_overlap(vehicle) {
            if outcome.passes() >= pass_cap {
                outcome.capped = true;
                break;
            }
            if self.merge(earlier, later) {
                outcome.merges += 1;
            } else {
                self.clip(earlier, later);
                outcome.clips += 1;
            }
        }
        outcome
    }

    /// True when the timeline is sorted and no two zones overlap.
    pub fn is_disjoint(&self, vehicle: VehicleId) -> bool {
        let timeline = self.timeline(vehicle);
        timeline
            .windows(2)
            .all(|pair| pair[0].1.interval.end <= pair[1].1.interval.start)
    }

    /// Check the bidirectional zone/vehicle invariant and timeline order.
    ///
    /// Returns a description of every violation found.
    pub fn audit(&self) -> std::result::Result<(), Vec<String>> {
        let mut problems = Vec::new();

        for (index, slot) in self.zones.iter().enumerate() {
            let Some(zone) = slot else { continue };
            let id = ZoneId(index);
            if zone.participants.is_empty() {
                problems.push(format!("zone {index} has no participants"));
            }
            if zone.interval.length() < self.min_zone_duration {
                problems.push(format!("zone {index} {} is shorter than the minimum", zone.interval));
            }
            for vehicle in &zone.participants {
                match self.vehicles.get(vehicle) {
                    Some(record) if record.zones.contains(&id) => {}
                    Some(_) => problems.push(format!("vehicle {vehicle} does not list zone {index}")),
                    None => problems.push(format!("zone {index} names unknown vehicle {vehicle}")),
                }
            }
        }

        for record in self.vehicles.values() {
            let mut previous: Option<&ConflictZone> = None;
            for &id in &record.zones {
                let Some(zone) = self.zone(id) else {
                    problems.push(format!("vehicle {} lists dead zone {}", record.id, id.0));
                    continue;
                };
                if !zone.participants.contains(&record.id) {
                    problems.push(format!("zone {} does not list vehicle {}", id.0, record.id));
                }
                if let Some(prev) = previous {
                    if prev.interval.end > zone.interval.start {
                        problems.push(format!(
                            "vehicle {} has overlapping zones {} and {}",
                            record.id, prev.interval, zone.interval
                        ));
                    }
                }
                previous = Some(zone);
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(problems)
        }
    }

    // ==== Internals ====

    /// Whether zone `x` is the right-hand zone of a merge against `y`.
    ///
    /// Later start wins; on equal starts the earlier end (then the higher
    /// handle) is treated as the right-hand zone, so equal-start merges take
    /// the containment path.
    fn starts_later(x: &ConflictZone, x_id: ZoneId, y: &ConflictZone, y_id: ZoneId) -> bool {
        (x.interval.start, std::cmp::Reverse(x.interval.end), x_id)
            > (y.interval.start, std::cmp::Reverse(y.interval.end), y_id)
    }

    fn allocate(&mut self, zone: ConflictZone) -> ZoneId {
        self.zones.push(Some(zone));
        ZoneId(self.zones.len() - 1)
    }

    fn take(&mut self, id: ZoneId) -> Option<ConflictZone> {
        self.zones.get_mut(id.0).and_then(Option::take)
    }

    /// Add `id` to each participant's timeline at its sorted position.
    fn attach(&mut self, id: ZoneId) {
        let Some(zone) = self.zones.get(id.0).and_then(Option::as_ref) else {
            return;
        };
        let key = sort_key(zone, id);
        for vehicle in &zone.participants {
            let Some(record) = self.vehicles.get_mut(vehicle) else {
                continue;
            };
            let zones = &self.zones;
            let pos = record.zones.partition_point(|&other| {
                zones
                    .get(other.0)
                    .and_then(Option::as_ref)
                    .map_or(true, |z| sort_key(z, other) < key)
            });
            record.zones.insert(pos, id);
        }
    }

    /// Remove a zone from every participant's timeline and free it.
    fn destroy(&mut self, id: ZoneId) {
        let Some(zone) = self.take(id) else { return };
        for vehicle in &zone.participants {
            if let Some(record) = self.vehicles.get_mut(vehicle) {
                record.forget(id);
            }
        }
    }

    /// First pair of zones on the timeline overlapping by a positive span.
    fn first_overlap(&self, vehicle: VehicleId) -> Option<(ZoneId, ZoneId)> {
        let record = self.vehicles.get(&vehicle)?;
        let mut reach: Option<(ZoneId, Millis)> = None;
        for &id in &record.zones {
            let zone = self.zone(id)?;
            if let Some((prev, end)) = reach {
                if zone.interval.start < end {
                    return Some((prev, id));
                }
            }
            if reach.map_or(true, |(_, end)| zone.interval.end > end) {
                reach = Some((id, zone.interval.end));
            }
        }
        None
    }

    /// Resolve an overlap too short to merge by starting the later zone
    /// where the earlier one ends.
    fn clip(&mut self, a: ZoneId, b: ZoneId) {
        let (Some(za), Some(zb)) = (self.zone(a), self.zone(b)) else {
            return;
        };
        let (earlier, later) = if Self::starts_later(zb, b, za, a) { (za, b) } else { (zb, a) };
        let new_start = earlier.interval.end;

        let Some(mut zone) = self.take(later) else { return };
        for vehicle in &zone.participants {
            if let Some(record) = self.vehicles.get_mut(vehicle) {
                record.forget(later);
            }
        }

        match Interval::new(new_start, zone.interval.end) {
            Some(clipped) if clipped.length() >= self.min_zone_duration => {
                zone.interval = clipped;
                self.zones[later.0] = Some(zone);
                self.attach(later);
            }
            _ => {
                tracing::trace!(zone = later.0, "clipped zone fell below minimum duration");
            }
        }
    }
}

fn sort_key(zone: &ConflictZone, id: ZoneId) -> (Millis, Millis, ZoneId) {
    (zone.interval.start, zone.interval.end, id)
}

/// Join neighbouring pieces whose participant sets are equal.
fn coalesce(pieces: [Piece; 3]) -> Vec<Piece> {
    let mut out: Vec<Piece> = Vec::with_capacity(3);
    for piece in pieces {
        match out.last_mut() {
            Some(last) if last.participants == piece.participants => {
                last.interval.end = piece.interval.end;
                if last.reuse.is_none() {
                    last.reuse = piece.reuse;
                }
            }
            _ => out.push(piece),
        }
    }
    out
}
