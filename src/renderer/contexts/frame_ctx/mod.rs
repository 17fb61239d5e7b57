//! Responsibilities:
//! - Manage per-image command buffers
//! - Manage synchronization between frames in flight
//! - Sequence the frame protocol and structural rebuilds

pub mod commands;
pub mod orchestrator;
pub mod sync;

pub const MAX_FRAMES_IN_FLIGHT: usize = 2;
