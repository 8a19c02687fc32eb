//! CodeFleet — scheduling core for a fleet of autonomous coding workers.

pub mod config;
pub mod error;
pub mod fleet;
pub mod ops;
pub mod store;
pub mod worker;
