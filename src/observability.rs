//! Tracing setup for hosts and tests.
//!
//! The runtime logs every command and state transition as structured
//! `tracing` events with the resource URL as a field. Filter with `RUST_LOG`
//! as usual:
//!
//! ```bash
//! # State transitions only
//! RUST_LOG=info cargo run
//!
//! # Every command the runtime processes
//! RUST_LOG=remote_resource=debug cargo test
//! ```

/// Initializes a compact `tracing` subscriber driven by `RUST_LOG`.
///
/// Call once at startup; hosts with their own subscriber should skip this.
pub fn setup_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();
}
