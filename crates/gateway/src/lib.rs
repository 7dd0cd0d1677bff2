//! The gateway crate wires the session orchestrator to the outside world:
//! ingress, the IPC control plane, the two background supervisors, and the
//! CLI surface. `main.rs` is a thin binary over this library so integration
//! tests can construct an `Orchestrator` without going through `clap`.

pub mod cli;
pub mod health;
pub mod idle_reaper;
pub mod ingress;
pub mod intercepts;
pub mod interfaces;
pub mod ipc;
pub mod orchestrator;
pub mod vision;
