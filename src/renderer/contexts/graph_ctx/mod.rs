//! Responsibilities:
//! - Declare render pass attachments and subpasses
//! - Create framebuffers per swapchain image or over offscreen images
//! - Bracket recorded draw calls with begin and end

pub mod render_pass;
