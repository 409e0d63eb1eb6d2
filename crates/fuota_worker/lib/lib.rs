//! FUOTA fragmentation-session storage and lease-based pending-work selection.
//!
//! `fuota_store` is the library core. `backoff` holds caller-side retry helpers. The remaining
//! modules back the `fuota_worker` operational CLI.

pub mod backoff;
pub mod build_info;
pub mod cli;
pub mod commands;
pub mod config;
pub mod db;
pub mod fuota_store;
pub mod logging;
