mod command_lines;
mod executor;
mod system_model;
mod timing;

use crate::instantiation::{Environment, Instantiation, ProxyType};
use crate::topo::pair::{Pair, PairApp, PairOpts, build_pair};

pub(crate) fn env() -> Environment {
    Environment::new("/repo", "/work")
}

pub(crate) fn netperf_pair() -> Pair {
    build_pair("netperf", &PairOpts::default(), env()).expect("build netperf pair")
}

pub(crate) fn split_ping_pair() -> Pair {
    let opts = PairOpts {
        app: PairApp::Ping,
        split: Some(ProxyType::Tcp),
        ..PairOpts::default()
    };
    build_pair("ping", &opts, env()).expect("build split ping pair")
}

pub(crate) fn frag_named(inst: &Instantiation, name: &str) -> crate::system::FragmentId {
    inst.fragments()
        .find(|f| f.name == name)
        .map(|f| f.id)
        .expect("fragment exists")
}
