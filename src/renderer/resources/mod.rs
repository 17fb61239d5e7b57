//! GPU resources owned by the renderer or a scene: buffers and their pools, images, shader bytecode

pub mod buffer;
pub mod buffer_pool;
pub mod image;
pub mod shader;
pub mod staged_buffer;
