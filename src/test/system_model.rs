use crate::error::OrchError;
use crate::simulation::{NicModel, NicSim, QemuHost, Simulation, SimulatorKind, SwitchNet};
use crate::system::{
    HostConfig, InterfaceKind, MemDeviceConfig, MemRoute, NicConfig, System,
};

#[test]
fn nic_has_fixed_interfaces() {
    let mut sys = System::new();
    let nic = sys.add_nic("nic0", NicConfig::default()).unwrap();
    assert_eq!(sys.component(nic).unwrap().interfaces.len(), 2);

    let err = sys.new_if(nic, InterfaceKind::PcieDevice).unwrap_err();
    assert!(matches!(err, OrchError::InvalidGraph(_)), "{err}");
    let err = sys.new_if(nic, InterfaceKind::MemHost).unwrap_err();
    assert!(matches!(err, OrchError::InvalidGraph(_)), "{err}");
}

#[test]
fn channel_kinds_must_be_compatible() {
    let mut sys = System::new();
    let host = sys.add_host("h", HostConfig::default()).unwrap();
    let nic = sys.add_nic("nic", NicConfig::default()).unwrap();
    let host_eth = sys.new_if(host, InterfaceKind::EthPort).unwrap();
    let nic_pci = sys.component(nic).unwrap().interfaces[0];

    let err = sys.link(host_eth, nic_pci, 100).unwrap_err();
    assert_eq!(err.kind(), "InvalidGraph");
    assert!(sys.channels().next().is_none());
}

#[test]
fn interface_joins_at_most_one_channel() {
    let mut sys = System::new();
    let h = sys.add_host("h", HostConfig::default()).unwrap();
    let nic = sys.add_nic("nic", NicConfig::default()).unwrap();
    sys.connect_pcie(h, nic, 500).unwrap();
    let err = sys.connect_pcie(h, nic, 500).unwrap_err();
    assert_eq!(err.kind(), "InvalidGraph");
}

#[test]
fn switch_and_wire_port_counts_are_validated() {
    let mut sys = System::new();
    let a = sys.add_nic("a", NicConfig::default()).unwrap();
    let sw = sys.add_switch("sw").unwrap();
    sys.connect_eth(a, sw, 500).unwrap();
    assert_eq!(sys.validate().unwrap_err().kind(), "InvalidGraph");

    let b = sys.add_nic("b", NicConfig::default()).unwrap();
    sys.connect_eth(b, sw, 500).unwrap();
    sys.validate().unwrap();

    let wire = sys.add_wire("w").unwrap();
    let c = sys.add_nic("c", NicConfig::default()).unwrap();
    sys.connect_eth(c, wire, 500).unwrap();
    assert!(sys.validate().is_err());
}

#[test]
fn overlapping_mem_routes_are_rejected() {
    let mut sys = System::new();
    let ic = sys.add_mem_interconnect("ic").unwrap();
    let mut downstream = Vec::new();
    for i in 0..2 {
        let dev = sys
            .add_mem_device(
                format!("m{i}"),
                MemDeviceConfig {
                    size: 4096,
                    addr: 0,
                    as_id: 0,
                },
            )
            .unwrap();
        let ch = sys.connect_mem(ic, dev, 100).unwrap();
        downstream.push(sys.channel(ch).unwrap().a);
    }
    let route = |lo: u64, hi: u64, d| MemRoute {
        as_id: 0,
        vaddr_lo: lo,
        vaddr_hi: hi,
        paddr: 0,
        downstream: d,
    };
    sys.add_mem_route(ic, route(0, 4096, downstream[0])).unwrap();
    sys.validate().unwrap();
    sys.add_mem_route(ic, route(2048, 8192, downstream[1])).unwrap();
    assert!(sys.validate().is_err());
}

#[test]
fn json_round_trip_keeps_ids_and_counter() {
    let pair = super::netperf_pair();
    let sys = &pair.instantiation.simulation.system;
    let raw = sys.to_json().unwrap();
    let mut back = System::from_json(&raw).unwrap();
    assert_eq!(&back, sys);

    let max = back
        .components()
        .map(|c| c.id.0)
        .chain(back.interfaces().map(|i| i.id.0))
        .chain(back.channels().map(|c| c.id.0))
        .max()
        .unwrap();
    assert!(back.alloc_id() > max);
}

#[test]
fn duplicate_ids_in_json_are_rejected() {
    let mut sys = System::new();
    sys.add_switch("sw").unwrap();
    let raw = sys.to_json().unwrap();
    let v: serde_json::Value = serde_json::from_str(&raw).unwrap();
    let comp = v["components"][0].clone();
    let mut dup = v.clone();
    dup["components"] = serde_json::Value::Array(vec![comp.clone(), comp]);
    let err = System::from_json(&dup.to_string()).unwrap_err();
    assert_eq!(err.kind(), "Json");
}

#[test]
fn component_binds_to_one_simulator() {
    let mut sys = System::new();
    let h = sys.add_host("h", HostConfig::default()).unwrap();
    let nic = sys.add_nic("nic", NicConfig::default()).unwrap();
    sys.connect_pcie(h, nic, 500).unwrap();

    let mut sim = Simulation::new("s", sys);
    let host = sim.add_simulator("h", SimulatorKind::Qemu(QemuHost::default()));
    sim.adopt(host, h).unwrap();
    let err = sim.adopt(host, h).unwrap_err();
    assert_eq!(err.kind(), "DuplicateBinding");

    let other = sim.add_simulator("h2", SimulatorKind::Qemu(QemuHost::default()));
    assert_eq!(sim.adopt(other, h).unwrap_err().kind(), "DuplicateBinding");

    let sw = sim.add_simulator("sw", SimulatorKind::Switch(SwitchNet::default()));
    assert_eq!(sim.adopt(sw, nic).unwrap_err().kind(), "InvalidGraph");
}

#[test]
fn unbound_component_fails_validation() {
    let mut sys = System::new();
    let h = sys.add_host("h", HostConfig::default()).unwrap();
    let nic = sys.add_nic("nic", NicConfig::default()).unwrap();
    sys.connect_pcie(h, nic, 500).unwrap();
    let mut sim = Simulation::new("s", sys);
    sim.add_simulator_for("h", SimulatorKind::Qemu(QemuHost::default()), &[h])
        .unwrap();
    assert_eq!(sim.validate().unwrap_err().kind(), "InvalidGraph");

    sim.add_simulator_for("nic", SimulatorKind::Nic(NicSim::new(NicModel::I40e)), &[nic])
        .unwrap();
    sim.validate().unwrap();
}
