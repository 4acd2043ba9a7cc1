use crate::strategy::{ExecutionStrategy, StrategyKey};

/// Runs steps as plain calls on the host.
#[derive(Debug, Clone, Copy, Default)]
pub struct Eager;

impl<S> ExecutionStrategy<S> for Eager {
    fn key(&self) -> StrategyKey {
        StrategyKey::Eager
    }
}
