//! Engine process management: build, spawn, decode, and classify.

mod build;
mod classifier;
mod decoder;
mod process;

pub use build::*;
pub use classifier::*;
pub use decoder::*;
pub use process::*;
