//! Randomized checks of the zone graph invariants.

use avoid_core::{Interval, Millis, VehicleId, VehicleReport, ZoneGraph};
use avoid_core::{Location, Vector3};
use proptest::prelude::*;

const MIN: Millis = 250;
const VEHICLES: VehicleId = 6;

fn graph() -> ZoneGraph {
    let mut graph = ZoneGraph::new(MIN);
    for id in 0..VEHICLES {
        let report = VehicleReport::new(id, 0, Location::new(33.0, -117.0, 50.0), Vector3::default());
        graph.upsert_vehicle(&report, 0);
    }
    graph
}

fn candidate() -> impl Strategy<Value = (Millis, Millis, VehicleId, VehicleId)> {
    (0u64..20_000, 0u64..8_000, 0..VEHICLES, 0..VEHICLES)
}

proptest! {
    #[test]
    fn flatten_restores_invariants(candidates in prop::collection::vec(candidate(), 1..16)) {
        let mut graph = graph();
        for (start, len, a, b) in candidates {
            let interval = Interval::new(start, start + len).unwrap();
            graph.insert_zone(interval, [a, b]).unwrap();
        }

        for id in 0..VEHICLES {
            let outcome = graph.flatten(id, 10_000);
            prop_assert!(!outcome.capped);
            prop_assert!(graph.is_disjoint(id));
        }

        // Flattening later vehicles must not disturb earlier ones.
        for id in 0..VEHICLES {
            prop_assert!(graph.is_disjoint(id));
            for (_, zone) in graph.timeline(id) {
                prop_assert!(zone.interval.length() >= MIN);
                prop_assert!(zone.participants.len() >= 2);
            }
        }
        prop_assert_eq!(graph.audit(), Ok(()));
    }

    #[test]
    fn layers_are_distinct_within_a_zone(candidates in prop::collection::vec(candidate(), 1..12)) {
        let mut graph = graph();
        for (start, len, a, b) in candidates {
            let interval = Interval::new(start, start + len).unwrap();
            graph.insert_zone(interval, [a, b]).unwrap();
        }
        for id in 0..VEHICLES {
            graph.flatten(id, 10_000);
        }

        for id in 0..VEHICLES {
            for (_, zone) in graph.timeline(id) {
                let mut layers: Vec<usize> = zone
                    .participants
                    .iter()
                    .filter_map(|v| zone.deconflicted_height(*v))
                    .collect();
                layers.sort_unstable();
                let expected: Vec<usize> = (0..zone.participants.len()).collect();
                prop_assert_eq!(layers, expected);
            }
        }
    }

    #[test]
    fn intersect_is_commutative_and_bounded(
        s1 in 0u64..10_000, l1 in 0u64..5_000,
        s2 in 0u64..10_000, l2 in 0u64..5_000,
    ) {
        let a = Interval::new(s1, s1 + l1).unwrap();
        let b = Interval::new(s2, s2 + l2).unwrap();
        prop_assert_eq!(a.intersect(&b), b.intersect(&a));
        prop_assert!(a.overlap_length(&b) <= a.length().min(b.length()));
        if let Some(overlap) = a.intersect(&b) {
            prop_assert!(a.contains_interval(&overlap));
            prop_assert!(b.contains_interval(&overlap));
        }
    }
}
