//! Responsibilities:
//! - Pipeline layouts binding descriptor sets and push constants
//! - Shader programs grouping the stages of one pipeline
//! - Raster pipelines and their draw calls
//! - Compute pipelines and their dispatches

pub mod compute_pipeline;
pub mod pipeline_layout;
pub mod raster_pipeline;
pub mod shader_program;
