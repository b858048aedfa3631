//! Nexus Supervisor - process supervision for the Nexus trader engine.

pub mod config;
pub mod engine;
pub mod supervisor;
