//! Supervisor orchestration: state machine, correlation, and the runner.

mod correlator;
mod runner;
mod state;
mod status;

pub use correlator::*;
pub use runner::*;
pub use state::*;
pub use status::*;
