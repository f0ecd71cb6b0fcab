//! Crossbar - Per-Core Asynchronous RPC Server
//!
//! A reusable transport that accepts client connections, decodes framed
//! requests, dispatches them to registered service methods under a strict
//! per-core memory budget, and writes framed replies back in arrival
//! order. Run one [`server::Server`] per core for a shared-nothing
//! deployment.

pub mod config;
pub mod protocol;
pub mod server;
