//! Service bus worker: hosts the kernel behind a transport.
//!
//! The library exposes configuration loading, tracing bootstrap, the
//! transport contract with an in-process implementation, the kernel builder
//! and the worker loop. The binary in `main.rs` wires them together.

pub mod config;
pub mod context;
pub mod error;
pub mod kernel;
pub mod telemetry;
pub mod transport;
pub mod worker;
