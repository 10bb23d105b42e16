//! Domain layer - Port definitions for the migration engine
//!
//! Defines the traits (ports) that the cluster, terminal and test adapters
//! implement, keeping the step engine free of transport concerns.

pub mod ports;

pub use ports::*;
