//! Process Sandbox
//!
//! Executes validated invocations as isolated child processes:
//!
//! - explicit argument vector, never a shell
//! - cleared environment plus an explicit allow-list (host secrets never
//!   reach a child)
//! - hard wall-clock deadline, enforced by the gateway's own task so a
//!   caller disconnect cannot orphan the child
//! - bounded output capture per stream; hitting the cap discards further
//!   bytes without killing the process
//! - a global ceiling on live children; beyond it requests fail fast
//!
//! Network confinement and CPU/memory ceilings are the host sandbox
//! contract (container, cgroup, or egress policy around this process);
//! this module enforces everything expressible at the child-process level
//! and records what the policy granted.

pub mod collector;
pub mod executor;

pub use collector::{collect_capped, CollectedOutput};
pub use executor::{ExecutionResult, ProcessSandbox};
