mod collective;
mod data_parallel;
mod eager;
mod jit;
mod registry;
mod strategy;

pub use collective::{Collective, Reduce};
pub use data_parallel::DataParallel;
pub use eager::Eager;
pub use jit::Jit;
pub use registry::{get_strategy, StrategyRef, StrategySpec};
pub use strategy::{ExecutionStrategy, Strategy, StrategyKey};
