//! Vegetation settings. Loaded from `vegetation.ron` at startup.

use procgen::ScatterConfig;
use renderer::{AtlasConfig, InstancingLimits};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid RON: {0}")]
    Parse(#[from] ron::error::SpannedError),
    #[error("invalid setting: {0}")]
    Invalid(String),
}

/// Streaming, batching and placement settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VegetationConfig {
    /// Instances one draw-call slot can hold.
    #[serde(default = "default_max_instances_per_draw_call")]
    pub max_instances_per_draw_call: u32,
    /// Concurrent slots per geometry variant.
    #[serde(default = "default_max_draw_calls_per_geometry")]
    pub max_draw_calls_per_geometry: u32,
    /// Texel width of the position/orientation textures.
    #[serde(default = "default_attribute_texture_width")]
    pub attribute_texture_width: u32,
    /// Edge length of the material atlas in pixels.
    #[serde(default = "default_atlas_size")]
    pub atlas_size: u32,
    /// Chunk edge length in world units.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: f32,
    /// Chunks kept around the viewer in each direction.
    #[serde(default = "default_view_range")]
    pub view_range: u32,
    #[serde(default = "default_lod_count")]
    pub lod_count: u32,
    /// Ticks skipped between fetch polls (0 = poll every tick).
    #[serde(default)]
    pub frame_skip: u32,
    #[serde(default)]
    pub seed: u64,
    /// Candidate instances per square unit at LOD 0.
    #[serde(default = "default_density")]
    pub density: f32,
    /// Create a collider per instance.
    #[serde(default = "default_true")]
    pub collide: bool,
}

fn default_max_instances_per_draw_call() -> u32 {
    128
}
fn default_max_draw_calls_per_geometry() -> u32 {
    64
}
fn default_attribute_texture_width() -> u32 {
    1024
}
fn default_atlas_size() -> u32 {
    2048
}
fn default_chunk_size() -> f32 {
    16.0
}
fn default_view_range() -> u32 {
    3
}
fn default_lod_count() -> u32 {
    3
}
fn default_density() -> f32 {
    0.5
}
fn default_true() -> bool {
    true
}

impl Default for VegetationConfig {
    fn default() -> Self {
        Self {
            max_instances_per_draw_call: default_max_instances_per_draw_call(),
            max_draw_calls_per_geometry: default_max_draw_calls_per_geometry(),
            attribute_texture_width: default_attribute_texture_width(),
            atlas_size: default_atlas_size(),
            chunk_size: default_chunk_size(),
            view_range: default_view_range(),
            lod_count: default_lod_count(),
            frame_skip: 0,
            seed: 0,
            density: default_density(),
            collide: default_true(),
        }
    }
}

impl VegetationConfig {
    /// Load config from `vegetation.ron`. If the file is missing or invalid, returns default config.
    pub fn load() -> Self {
        let path = config_path();
        if !path.exists() {
            log::info!("No config at {:?}, using defaults", path);
            return Self::default();
        }
        match Self::load_from(&path) {
            Ok(c) => c,
            Err(e) => {
                log::warn!("Invalid config at {:?}: {}, using defaults", path, e);
                Self::default()
            }
        }
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_ron_str(&data)
    }

    /// Parse and validate.
    pub fn from_ron_str(data: &str) -> Result<Self, ConfigError> {
        let config: Self = ron::from_str(data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_owned()));
        if self.max_instances_per_draw_call == 0 {
            return invalid("max_instances_per_draw_call must be positive");
        }
        if self.max_draw_calls_per_geometry == 0 {
            return invalid("max_draw_calls_per_geometry must be positive");
        }
        if self.attribute_texture_width == 0 {
            return invalid("attribute_texture_width must be positive");
        }
        if self.atlas_size == 0 {
            return invalid("atlas_size must be positive");
        }
        if self.chunk_size.is_nan() || self.chunk_size <= 0.0 {
            return invalid("chunk_size must be positive");
        }
        if self.lod_count == 0 {
            return invalid("lod_count must be positive");
        }
        if self.density < 0.0 {
            return invalid("density must not be negative");
        }
        Ok(())
    }

    pub fn limits(&self) -> InstancingLimits {
        InstancingLimits {
            max_instances_per_draw_call: self.max_instances_per_draw_call,
            max_draw_calls_per_geometry: self.max_draw_calls_per_geometry,
            texture_width: self.attribute_texture_width,
        }
    }

    pub fn atlas_config(&self) -> AtlasConfig {
        AtlasConfig {
            size: self.atlas_size,
            ..Default::default()
        }
    }

    pub fn scatter_config(&self) -> ScatterConfig {
        ScatterConfig {
            seed: self.seed,
            chunk_size: self.chunk_size,
            density: self.density,
            ..Default::default()
        }
    }
}

fn config_path() -> PathBuf {
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")).join("vegetation.ron")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_take_defaults() {
        let config = VegetationConfig::from_ron_str("(seed: 7, view_range: 1)").unwrap();
        assert_eq!(config.seed, 7);
        assert_eq!(config.view_range, 1);
        assert_eq!(config.max_instances_per_draw_call, 128);
        assert_eq!(config.max_draw_calls_per_geometry, 64);
        assert_eq!(config.chunk_size, 16.0);
        assert!(config.collide);
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let err = VegetationConfig::from_ron_str("(max_instances_per_draw_call: 0)").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
        let err = VegetationConfig::from_ron_str("(chunk_size: -4.0)").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn malformed_ron_is_a_parse_error() {
        assert!(matches!(
            VegetationConfig::from_ron_str("(seed: \"x\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn round_trips_through_ron() {
        let config = VegetationConfig {
            frame_skip: 2,
            collide: false,
            ..Default::default()
        };
        let text = ron::ser::to_string_pretty(&config, ron::ser::PrettyConfig::default()).unwrap();
        assert_eq!(VegetationConfig::from_ron_str(&text).unwrap(), config);
    }

    #[test]
    fn derived_settings_follow_config() {
        let config = VegetationConfig::default();
        assert_eq!(config.limits(), InstancingLimits::default());
        assert_eq!(config.atlas_config().size, 2048);
        assert_eq!(config.scatter_config().chunk_size, 16.0);
    }
}
