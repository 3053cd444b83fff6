//! Configuration-matrix engine and per-target executor pipeline for
//! unikernel test suites.
//!
//! Pipeline: Host Probe (C1) -> Matrix Engine (C2) -> Workspace Layout
//! (C3) -> Script Materializer (C4) -> Session Orchestrator (C6) driving
//! a pool of Case Executors (C5).

pub mod config;
pub mod error;
pub mod executor;
pub mod materializer;
pub mod matrix;
pub mod orchestrator;
pub mod probe;
pub mod selection;
pub mod workspace;
