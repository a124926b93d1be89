//! Renderer configuration.
//!
//! Defaults live in code. Every field can be overridden through a `VOXRT_*`
//! environment variable; malformed values are rejected instead of ignored.

use std::path::PathBuf;

use crate::error::{RenderError, Result};

/// Upper bound on frames recorded ahead of the GPU.
pub const MAX_FRAMES_IN_FLIGHT: usize = 3;

/// Directory the build script compiled the SPIR-V binaries into.
pub const DEFAULT_SHADER_DIR: &str = env!("VOXRT_SPIRV_DIR");

pub const ENV_WIDTH: &str = "VOXRT_WIDTH";
pub const ENV_HEIGHT: &str = "VOXRT_HEIGHT";
pub const ENV_FRAMES_IN_FLIGHT: &str = "VOXRT_FRAMES_IN_FLIGHT";
pub const ENV_VSYNC: &str = "VOXRT_VSYNC";
pub const ENV_VALIDATION: &str = "VOXRT_VALIDATION";
pub const ENV_SHADER_DIR: &str = "VOXRT_SHADER_DIR";

/// Renderer settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RendererConfig {
    /// Initial window width in pixels
    pub width: u32,
    /// Initial window height in pixels
    pub height: u32,
    /// Frame slots cycled by the presentation loop (1..=MAX_FRAMES_IN_FLIGHT)
    pub frames_in_flight: usize,
    /// FIFO presentation when set, mailbox/immediate otherwise
    pub vsync: bool,
    /// Enable the Khronos validation layer when it is installed
    pub validation: bool,
    /// Directory holding raygen.spv, miss.spv, closest_hit.spv and intersection.spv
    pub shader_dir: PathBuf,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            frames_in_flight: 2,
            vsync: true,
            validation: cfg!(debug_assertions),
            shader_dir: PathBuf::from(DEFAULT_SHADER_DIR),
        }
    }
}

impl RendererConfig {
    /// Load the configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(value) = lookup(ENV_WIDTH) {
            config.width = parse_dimension(ENV_WIDTH, &value)?;
        }
        if let Some(value) = lookup(ENV_HEIGHT) {
            config.height = parse_dimension(ENV_HEIGHT, &value)?;
        }
        if let Some(value) = lookup(ENV_FRAMES_IN_FLIGHT) {
            config.frames_in_flight = parse_frames_in_flight(&value)?;
        }
        if let Some(value) = lookup(ENV_VSYNC) {
            config.vsync = parse_bool(ENV_VSYNC, &value)?;
        }
        if let Some(value) = lookup(ENV_VALIDATION) {
            config.validation = parse_bool(ENV_VALIDATION, &value)?;
        }
        if let Some(value) = lookup(ENV_SHADER_DIR) {
            if value.trim().is_empty() {
                return Err(RenderError::Config(format!("{} must not be empty", ENV_SHADER_DIR)));
            }
            config.shader_dir = PathBuf::from(value);
        }

        Ok(config)
    }
}

fn parse_dimension(key: &str, value: &str) -> Result<u32> {
    match value.trim().parse::<u32>() {
        Ok(v) if v > 0 => Ok(v),
        _ => Err(RenderError::Config(format!(
            "{} must be a positive integer, got {:?}",
            key, value
        ))),
    }
}

fn parse_frames_in_flight(value: &str) -> Result<usize> {
    match value.trim().parse::<usize>() {
        Ok(v) if (1..=MAX_FRAMES_IN_FLIGHT).contains(&v) => Ok(v),
        _ => Err(RenderError::Config(format!(
            "{} must be between 1 and {}, got {:?}",
            ENV_FRAMES_IN_FLIGHT, MAX_FRAMES_IN_FLIGHT, value
        ))),
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(RenderError::Config(format!(
            "{} must be a boolean, got {:?}",
            key, value
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    // ============================================================
    // RendererConfig::default
    // ============================================================

    #[test]
    fn test_default_config() {
        let config = RendererConfig::default();
        assert_eq!(config.width, 1280);
        assert_eq!(config.height, 720);
        assert_eq!(config.frames_in_flight, 2);
        assert!(config.vsync);
        assert_eq!(config.shader_dir, PathBuf::from(DEFAULT_SHADER_DIR));
    }

    #[test]
    fn test_empty_lookup_yields_default() {
        let config = RendererConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config, RendererConfig::default());
    }

    // ============================================================
    // Overrides
    // ============================================================

    #[test]
    fn test_overrides_apply() {
        let config = RendererConfig::from_lookup(lookup_from(&[
            (ENV_WIDTH, "1920"),
            (ENV_HEIGHT, " 1080 "),
            (ENV_FRAMES_IN_FLIGHT, "1"),
            (ENV_VSYNC, "off"),
            (ENV_VALIDATION, "TRUE"),
            (ENV_SHADER_DIR, "/opt/voxrt/spirv"),
        ]))
        .unwrap();

        assert_eq!(config.width, 1920);
        assert_eq!(config.height, 1080);
        assert_eq!(config.frames_in_flight, 1);
        assert!(!config.vsync);
        assert!(config.validation);
        assert_eq!(config.shader_dir, PathBuf::from("/opt/voxrt/spirv"));
    }

    #[test]
    fn test_frames_in_flight_upper_bound_accepted() {
        let config = RendererConfig::from_lookup(lookup_from(&[(ENV_FRAMES_IN_FLIGHT, "3")])).unwrap();
        assert_eq!(config.frames_in_flight, MAX_FRAMES_IN_FLIGHT);
    }

    // ============================================================
    // Rejections
    // ============================================================

    #[test]
    fn test_zero_frames_in_flight_rejected() {
        let err = RendererConfig::from_lookup(lookup_from(&[(ENV_FRAMES_IN_FLIGHT, "0")])).unwrap_err();
        assert!(matches!(err, RenderError::Config(_)));
    }

    #[test]
    fn test_too_many_frames_in_flight_rejected() {
        let err = RendererConfig::from_lookup(lookup_from(&[(ENV_FRAMES_IN_FLIGHT, "4")])).unwrap_err();
        assert!(err.to_string().contains(ENV_FRAMES_IN_FLIGHT));
    }

    #[test]
    fn test_zero_width_rejected() {
        let err = RendererConfig::from_lookup(lookup_from(&[(ENV_WIDTH, "0")])).unwrap_err();
        assert!(err.to_string().contains(ENV_WIDTH));
    }

    #[test]
    fn test_non_numeric_height_rejected() {
        assert!(RendererConfig::from_lookup(lookup_from(&[(ENV_HEIGHT, "tall")])).is_err());
    }

    #[test]
    fn test_bad_bool_rejected() {
        let err = RendererConfig::from_lookup(lookup_from(&[(ENV_VSYNC, "maybe")])).unwrap_err();
        assert!(err.to_string().contains(ENV_VSYNC));
    }

    #[test]
    fn test_empty_shader_dir_rejected() {
        assert!(RendererConfig::from_lookup(lookup_from(&[(ENV_SHADER_DIR, "  ")])).is_err());
    }
}
