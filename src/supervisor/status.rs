//! Live engine status snapshot.

use serde::Serialize;

use crate::engine::StatusEvent;

/// Snapshot of the engine's observed state.
///
/// Owned and mutated exclusively by the supervisor loop; everyone else
/// receives copies through the status watch channel, so readers can never
/// observe a torn update.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct EngineStatus {
    /// Whether the engine process is alive. Forced false on exit.
    pub running: bool,
    /// Sum of all observed trade profits, in SOL.
    pub cumulative_balance: f64,
    /// Number of strategy activations observed this session.
    pub active_strategies: u32,
    /// Whether the core engine reported readiness.
    pub core_engine_active: bool,
    /// Number of transformer deployments observed this session.
    pub deployed_transformers: u32,
}

impl EngineStatus {
    /// Apply one classified status event to the snapshot.
    ///
    /// Returns true if any field changed, so the caller knows whether to
    /// publish a new snapshot.
    pub fn apply(&mut self, event: &StatusEvent) -> bool {
        match event {
            StatusEvent::EngineReady => {
                let changed = !self.core_engine_active;
                self.core_engine_active = true;
                changed
            }
            StatusEvent::TradeExecuted { profit } => {
                self.cumulative_balance += profit;
                true
            }
            StatusEvent::TransformerDeployed => {
                self.deployed_transformers = self.deployed_transformers.saturating_add(1);
                true
            }
            StatusEvent::StrategyActivated => {
                self.active_strategies = self.active_strategies.saturating_add(1);
                true
            }
            // Reply bookkeeping happens in the runner, which also knows the
            // correlator side; raw log lines change nothing.
            StatusEvent::Reply { .. } | StatusEvent::Unrecognized { .. } => false,
        }
    }

    /// Record that the engine process has exited.
    pub fn mark_exited(&mut self) {
        self.running = false;
        self.core_engine_active = false;
    }
}
