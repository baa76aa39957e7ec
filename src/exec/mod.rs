// src/exec/mod.rs

//! Execution supervision: process spawn, pause gates, memory sampling and
//! signal-driven lifecycle control.

pub mod gate;
pub mod process_tree;
pub mod supervisor;

pub use gate::{GateMap, GateWaiter};
pub use supervisor::Supervisor;
