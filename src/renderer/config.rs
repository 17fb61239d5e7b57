use std::ffi::CStr;
use std::path::PathBuf;
use std::time::Duration;
use ash::vk;

/// Contains configuration options for the renderer like the presentation preferences,
/// frame timeouts, shader location and device extensions
#[derive(Clone, Debug)]
pub struct RenderConfig {
    pub application_name: String,

    // Tried in order, the first one supported by the surface wins
    pub preferred_present_modes: Vec<vk::PresentModeKHR>,
    pub preferred_surface_formats: Vec<vk::SurfaceFormatKHR>,

    // Bound on image acquisition and frame fence waits
    pub frame_timeout: Duration,

    pub shader_dir: PathBuf,
    pub enable_validation: bool,

    pub required_device_extensions: Vec<&'static CStr>,
    pub optional_device_extensions: Vec<&'static CStr>,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            application_name: "gbuffer".into(),
            preferred_present_modes: vec![
                vk::PresentModeKHR::MAILBOX,
                vk::PresentModeKHR::FIFO,
                vk::PresentModeKHR::IMMEDIATE,
            ],
            preferred_surface_formats: vec![
                vk::SurfaceFormatKHR {
                    format: vk::Format::R32G32B32A32_SFLOAT,
                    color_space: vk::ColorSpaceKHR::HDR10_HLG_EXT,
                },
                vk::SurfaceFormatKHR {
                    format: vk::Format::B8G8R8A8_UNORM,
                    color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
                },
            ],
            frame_timeout: Duration::from_secs(30),
            shader_dir: PathBuf::from("shaders-built"),
            enable_validation: cfg!(debug_assertions),
            required_device_extensions: Vec::new(),
            optional_device_extensions: Vec::new(),
        }
    }
}

impl RenderConfig {
    /// Required device extensions, always including the swapchain
    pub fn required_extensions(&self) -> Vec<&'static CStr> {
        let mut exts = vec![ash::khr::swapchain::NAME];

        #[cfg(target_os = "macos")]
        exts.push(ash::khr::portability_subset::NAME);

        for ext in &self.required_device_extensions {
            if !exts.contains(ext) {
                exts.push(ext);
            }
        }
        exts
    }

    pub fn frame_timeout_ns(&self) -> u64 {
        u64::try_from(self.frame_timeout.as_nanos()).unwrap_or(u64::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn swapchain_is_always_required() {
        let config = RenderConfig {
            required_device_extensions: vec![ash::khr::swapchain::NAME, ash::khr::maintenance3::NAME],
            ..Default::default()
        };
        let exts = config.required_extensions();
        assert_eq!(exts.iter().filter(|e| **e == ash::khr::swapchain::NAME).count(), 1);
        assert!(exts.contains(&ash::khr::maintenance3::NAME));
    }

    #[test]
    fn default_timeout_is_thirty_seconds() {
        let config = RenderConfig::default();
        assert_eq!(config.frame_timeout_ns(), 30_000_000_000);
        assert_eq!(config.preferred_present_modes[0], vk::PresentModeKHR::MAILBOX);
    }
}
