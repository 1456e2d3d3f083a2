// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Property-based tests for damping arithmetic and for pipelines under
//! arbitrary update sequences.
//!
//! The pipeline properties lean on the recording sink, which panics on any
//! update inconsistent with what it already holds (an add for a prefix it
//! has, a replace or delete for one it lacks).

#[cfg(test)]
mod proptest {
    use crate::cache::CacheTable;
    use crate::config::{BranchConfig, DampingConfig, FilterSpec};
    use crate::damping::{Damping, FREQUENCY};
    use crate::filter::FilterTable;
    use crate::pipeline::Pipeline;
    use crate::plumbing::output_branch;
    use crate::table::RouteTable;
    use crate::test::{attrs, net, peer, RecordingSink};
    use crate::types::{PeerId, PeerType, Prefix};
    use proptest::prelude::*;
    use std::collections::{BTreeMap, BTreeSet};
    use std::net::IpAddr;
    use std::time::Duration;

    fn discard() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    // Valid damping parameters. Cutoff stays below twice reuse, which is
    // always under the ceiling since max hold down is at least one half
    // life.
    fn damping_config_strategy() -> impl Strategy<Value = DampingConfig> {
        (1u32..=30, 1u32..=4, 100u32..1000, 0.0f64..1.0).prop_map(
            |(half_life, mult, reuse, frac)| {
                let span = f64::from(reuse - 2);
                DampingConfig {
                    enabled: true,
                    half_life,
                    max_hold_down: half_life * mult,
                    reuse,
                    cutoff: reuse + 1 + (frac * span) as u32,
                }
            },
        )
    }

    #[derive(Debug, Clone)]
    enum Op {
        /// Announce prefix `i` with next hop `nh`, optionally with our own
        /// AS in the path.
        Add { i: u8, nh: u8, looped: bool },
        Delete { i: u8 },
        Busy(bool),
        /// Take the peer's session down, or bring a new one up.
        PeerDown,
        PeerUp,
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u8..6, 0u8..3, any::<bool>())
                .prop_map(|(i, nh, looped)| Op::Add { i, nh, looped }),
            (0u8..6).prop_map(|i| Op::Delete { i }),
            any::<bool>().prop_map(Op::Busy),
            Just(Op::PeerDown),
            Just(Op::PeerUp),
        ]
    }

    #[derive(Debug, Clone)]
    enum DumpOp {
        Add { peer: u8, i: u8, nh: u8 },
        Delete { peer: u8, i: u8 },
        PeerDown { peer: u8 },
        PeerUp { peer: u8 },
        Step,
    }

    fn dump_op_strategy() -> impl Strategy<Value = DumpOp> {
        prop_oneof![
            (1u8..=2, 0u8..12, 0u8..3)
                .prop_map(|(peer, i, nh)| DumpOp::Add { peer, i, nh }),
            (1u8..=2, 0u8..12).prop_map(|(peer, i)| DumpOp::Delete { peer, i }),
            (1u8..=2).prop_map(|peer| DumpOp::PeerDown { peer }),
            (1u8..=2).prop_map(|peer| DumpOp::PeerUp { peer }),
            Just(DumpOp::Step),
            Just(DumpOp::Step),
        ]
    }

    fn nexthop(nh: u8) -> String {
        format!("192.0.2.{}", 10 + nh)
    }

    fn filtered_pipeline() -> (Pipeline, RecordingSink) {
        let mut filter = FilterTable::new("filter", discard());
        filter
            .reconfigure(&[
                FilterSpec::SimpleAsLoop { asn: 65000 },
                FilterSpec::LocalPrefInsertion { local_pref: 100 },
            ])
            .expect("filters");
        let tables: Vec<Box<dyn RouteTable>> = vec![
            Box::new(filter),
            Box::new(CacheTable::new("cache", discard())),
        ];
        let mut p = Pipeline::new("prop", discard());
        for table in tables {
            p.plumb(table);
        }
        let sink = RecordingSink::default();
        p.attach(Box::new(sink.clone())).expect("attach");
        p.peering_came_up(peer(1, PeerType::Ebgp)).expect("up");
        (p, sink)
    }

    proptest! {
        /// Property: a flap never takes the merit past the ceiling
        #[test]
        fn prop_merit_is_capped(
            config in damping_config_strategy(),
            flaps in prop::collection::vec(0u64..200, 1..40)
        ) {
            let damping = Damping::new(&config).expect("valid config");
            let (mut tick, mut merit) = (0u64, 0u32);
            for gap in flaps {
                let now = tick + gap;
                merit = damping.compute_merit(tick, now, merit);
                tick = now;
                prop_assert!(
                    merit <= damping.ceiling(),
                    "merit {merit} above ceiling {}", damping.ceiling()
                );
            }
        }

        /// Property: merit only ever decays as time passes
        #[test]
        fn prop_decay_is_monotonic(
            config in damping_config_strategy(),
            merit in 0u32..20000,
            a in 0u64..2000,
            b in 0u64..2000
        ) {
            let damping = Damping::new(&config).expect("valid config");
            let (early, late) = (a.min(b), a.max(b));
            let m1 = damping.decayed_merit(0, early, merit);
            let m2 = damping.decayed_merit(0, late, merit);
            prop_assert!(m2 <= m1, "{merit} decayed to {m1} then {m2}");
            prop_assert!(m1 <= merit);
        }

        /// Property: release delays stay within one tick and the maximum
        /// hold down
        #[test]
        fn prop_reuse_time_is_bounded(
            config in damping_config_strategy(),
            merit in 0u32..100000
        ) {
            let damping = Damping::new(&config).expect("valid config");
            let delay = damping.reuse_time(merit);
            let max = Duration::from_secs(u64::from(config.max_hold_down) * 60);
            prop_assert!(delay >= FREQUENCY);
            prop_assert!(delay <= max.max(FREQUENCY));
        }

        /// Property: whatever the sequence of updates, output pauses and
        /// session restarts, the sink ends up with exactly the accepted
        /// routes of the current session
        #[test]
        fn prop_sink_tracks_accepted_routes(
            ops in prop::collection::vec(op_strategy(), 0..60)
        ) {
            let (mut p, sink) = filtered_pipeline();
            let mut model: BTreeMap<Prefix, (IpAddr, bool)> = BTreeMap::new();
            let mut up = true;

            for op in ops {
                match op {
                    Op::Add { .. } | Op::Delete { .. } if !up => {}
                    Op::Add { i, nh, looped } => {
                        let nexthop = nexthop(nh);
                        let mut pa = attrs(&nexthop);
                        if looped {
                            pa = pa.with_as_path(&[65001, 65000]);
                        }
                        p.add_route(PeerId(1), net(1, i), pa).expect("add");
                        model.insert(
                            net(1, i),
                            (nexthop.parse().expect("nexthop"), looped),
                        );
                    }
                    Op::Delete { i } => {
                        p.delete_route(PeerId(1), net(1, i)).expect("delete");
                        model.remove(&net(1, i));
                    }
                    Op::Busy(busy) => {
                        p.output_state(busy);
                        p.run_until_idle();
                    }
                    Op::PeerDown if up => {
                        p.peering_went_down(PeerId(1)).expect("down");
                        model.clear();
                        up = false;
                    }
                    Op::PeerUp if !up => {
                        p.peering_came_up(peer(1, PeerType::Ebgp))
                            .expect("up");
                        up = true;
                    }
                    Op::PeerDown | Op::PeerUp => {}
                }
            }
            p.output_state(false);
            p.run_until_idle();
            prop_assert_eq!(p.queued(), 0);

            let expected: BTreeMap<Prefix, IpAddr> = model
                .into_iter()
                .filter(|(_, (_, looped))| !looped)
                .map(|(n, (nh, _))| (n, nh))
                .collect();
            prop_assert_eq!(sink.table(), expected.clone());
            for n in expected.keys() {
                let route = sink.route(*n).expect("route");
                prop_assert_eq!(route.attributes().local_pref, Some(100));
            }
        }

        /// Property: a dump interleaved with live changes and peer churn
        /// leaves the receiving peer with exactly what the source holds
        #[test]
        fn prop_dump_converges(
            initial in prop::collection::vec((1u8..=2, 0u8..12), 0..20),
            ops in prop::collection::vec(dump_op_strategy(), 0..60)
        ) {
            let mut p = output_branch(&BranchConfig::new("prop"), discard())
                .expect("output branch");
            p.peering_came_up(peer(1, PeerType::Ebgp)).expect("up");
            p.peering_came_up(peer(2, PeerType::Ebgp)).expect("up");
            // Routes by announcing peer and index.
            let mut model: BTreeMap<(u8, u8), IpAddr> = BTreeMap::new();
            let mut up: BTreeSet<u8> = BTreeSet::from([1, 2]);
            for (id, i) in initial {
                let nexthop = nexthop(0);
                p.add_route(PeerId(id.into()), net(id, i), attrs(&nexthop))
                    .expect("add");
                model.insert((id, i), nexthop.parse().expect("nexthop"));
            }

            let sink = RecordingSink::default();
            p.attach_with_dump(PeerId(9), Box::new(sink.clone()))
                .expect("attach");
            for op in ops {
                match op {
                    DumpOp::Add { peer, .. } | DumpOp::Delete { peer, .. }
                        if !up.contains(&peer) => {}
                    DumpOp::Add { peer, i, nh } => {
                        let nexthop = nexthop(nh);
                        p.add_route(
                            PeerId(peer.into()),
                            net(peer, i),
                            attrs(&nexthop),
                        )
                        .expect("add");
                        model.insert(
                            (peer, i),
                            nexthop.parse().expect("nexthop"),
                        );
                    }
                    DumpOp::Delete { peer, i } => {
                        p.delete_route(PeerId(peer.into()), net(peer, i))
                            .expect("delete");
                        model.remove(&(peer, i));
                    }
                    DumpOp::PeerDown { peer: id } => {
                        if up.remove(&id) {
                            p.peering_went_down(PeerId(id.into()))
                                .expect("down");
                            model.retain(|(owner, _), _| *owner != id);
                        }
                    }
                    DumpOp::PeerUp { peer: id } => {
                        if up.insert(id) {
                            p.peering_came_up(peer(id.into(), PeerType::Ebgp))
                                .expect("up");
                        }
                    }
                    DumpOp::Step => {
                        p.get_next_message();
                    }
                }
            }
            p.run_until_idle();
            prop_assert!(p.dump_stage().is_none());
            let expected: BTreeMap<Prefix, IpAddr> = model
                .into_iter()
                .map(|((owner, i), nh)| (net(owner, i), nh))
                .collect();
            prop_assert_eq!(sink.table(), expected);
        }
    }
}
