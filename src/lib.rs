pub mod error;
pub mod exec;
pub mod instantiation;
pub mod output;
pub mod runtime;
pub mod simulation;
pub mod system;
pub mod topo;
pub mod util;

#[cfg(test)]
mod test;
