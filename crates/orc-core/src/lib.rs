//! Core library for orc — foundational types shared by the task execution
//! engine.
//!
//! This crate provides:
//! - Task, plan, and phase state types with their lifecycle invariants
//! - Task id / branch / worktree naming rules
//! - The layered configuration resolver with provenance tracking
//! - Execution mode detection (solo / p2p / team)
//! - The worktree PID guard and advisory lockers
//! - Logging initialisation

pub mod config;
pub mod id;
pub mod locker;
pub mod logging;
pub mod mode;
pub mod pid_guard;
pub mod plan;
pub mod types;
