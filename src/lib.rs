//! Library crate for portsweep: a batched, paced, resumable TCP connect scanner.
pub mod config;
pub mod error;
pub mod governor;
pub mod ports;
pub mod probe;
pub mod record;
pub mod scanner;
pub mod store;
pub mod targets;
pub mod types;
