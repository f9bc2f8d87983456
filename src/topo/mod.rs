//! 参考拓扑构建：主机对（netperf / ping / iperf）与内存池

pub mod memory;
pub mod pair;
