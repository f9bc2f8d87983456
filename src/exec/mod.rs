//! 执行层：子进程执行器、配置包生成与分片执行器

mod command;
mod config_tar;
mod group;
mod sim_exec;

pub use command::{ExitInfo, Executor, LiveLine, ProcessHandle, Signal};
pub use config_tar::build_config_tar;
pub use group::FragmentGroup;
pub use sim_exec::{NodeLaunch, SimState, SimulationExecutor, plan_fragment, run_fragment};
