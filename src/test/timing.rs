use crate::exec::plan_fragment;
use crate::instantiation::Instantiation;
use crate::simulation::{
    ChannelTiming, ChannelView, DEFAULT_SYNC_PERIOD_NS, Simulation, SimulatorKind, SwitchNet,
    TimeUnit, WireNet,
};
use crate::system::System;
use crate::system::InterfaceFamily;

fn view(family: InterfaceFamily, sync: bool, period: u64, latency: u64) -> ChannelView {
    ChannelView {
        family,
        synchronized: sync,
        sync_period: period,
        latency,
    }
}

#[test]
fn reconcile_takes_any_sync_and_min_period() {
    let t = ChannelTiming::reconcile(
        "nic",
        &[
            view(InterfaceFamily::Pcie, false, 400, 500),
            view(InterfaceFamily::Eth, true, 300, 1000),
        ],
    )
    .unwrap();
    assert!(t.sync);
    assert_eq!(t.sync_flag(), "1");
    assert_eq!(t.sync_period, 300);
    assert_eq!(t.latency(InterfaceFamily::Pcie), 500);
    assert_eq!(t.latency(InterfaceFamily::Eth), 1000);
    assert_eq!(t.latency(InterfaceFamily::Mem), DEFAULT_SYNC_PERIOD_NS);
}

#[test]
fn reconcile_rejects_period_above_latency() {
    let err = ChannelTiming::reconcile("nic", &[view(InterfaceFamily::Eth, true, 600, 500)])
        .unwrap_err();
    assert_eq!(err.kind(), "InconsistentTiming");
}

#[test]
fn reconcile_rejects_disagreeing_latencies_in_one_family() {
    let err = ChannelTiming::reconcile(
        "switch",
        &[
            view(InterfaceFamily::Eth, false, 100, 500),
            view(InterfaceFamily::Eth, false, 100, 700),
        ],
    )
    .unwrap_err();
    assert_eq!(err.kind(), "InconsistentTiming");
}

#[test]
fn enable_synchronization_checks_every_channel() {
    let mut pair = super::netperf_pair();
    let sim = &mut pair.instantiation.simulation;

    let err = sim
        .enable_synchronization(Some(1), TimeUnit::Us)
        .unwrap_err();
    assert_eq!(err.kind(), "InconsistentTiming");
    assert!(sim.sim_channels().all(|c| !c.synchronized));

    sim.enable_synchronization(Some(250), TimeUnit::Ns).unwrap();
    assert_eq!(sim.sim_channels().count(), 4);
    assert!(sim.sim_channels().all(|c| c.synchronized && c.sync_period == 250));
    sim.validate().unwrap();
}

#[test]
fn synchronization_before_binding_applies_to_later_channels() {
    let mut sys = System::new();
    let s1 = sys.add_switch("s1").unwrap();
    let s2 = sys.add_switch("s2").unwrap();
    let w = sys.add_wire("w").unwrap();
    let c1 = sys.connect_eth(s1, w, 500).unwrap();
    sys.connect_eth(s2, w, 500).unwrap();
    let mut sim = Simulation::new("wire", sys);

    let err = sim.enable_synchronization(Some(1), TimeUnit::Us).unwrap_err();
    assert_eq!(err.kind(), "InconsistentTiming");
    sim.enable_synchronization(Some(250), TimeUnit::Ns).unwrap();
    assert_eq!(sim.sim_channels().count(), 0);

    sim.add_simulator_for("s1", SimulatorKind::Switch(SwitchNet::default()), &[s1])
        .unwrap();
    sim.add_simulator_for("s2", SimulatorKind::Switch(SwitchNet::default()), &[s2])
        .unwrap();
    sim.add_simulator_for("w", SimulatorKind::Wire(WireNet::default()), &[w])
        .unwrap();

    let mut inst = Instantiation::new(sim.clone(), super::env());
    inst.ensure_fragments();
    let frag = super::frag_named(&inst, "main");
    let (_, launches) = plan_fragment(&mut inst, frag).unwrap();
    let wire = launches.iter().find(|l| l.key == "net.w").unwrap();
    assert_eq!(wire.argv[3], "1");
    assert_eq!(wire.argv[4], "250");
    let switch = launches.iter().find(|l| l.key == "net.s1").unwrap();
    assert!(!switch.argv.iter().any(|a| a == "-u"));

    let ch = sim.retrieve_or_create_channel(c1).unwrap();
    assert!(ch.synchronized);
    assert_eq!(ch.sync_period, 250);
}

#[test]
fn time_units_convert_to_ns() {
    assert_eq!(TimeUnit::Ns.to_ns(7), 7);
    assert_eq!(TimeUnit::Us.to_ns(2), 2_000);
    assert_eq!(TimeUnit::Ms.to_ns(3), 3_000_000);
    assert_eq!(TimeUnit::S.to_ns(1), 1_000_000_000);
}
