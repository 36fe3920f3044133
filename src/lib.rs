//! VCF Relay: hand uploads to an out-of-band agent and reconcile its results.

pub mod channels;
pub mod config;
pub mod engine;
pub mod error;
pub mod routes;
pub mod store;
pub mod worker;
