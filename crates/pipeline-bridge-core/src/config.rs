//! Bridge configuration

use crate::error::{BridgeError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Where pipeline modules live and how much the bridge will accept from them
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BridgeConfig {
    /// Base location of general pipelines (`runPipeline`)
    pub pipelines_url: String,

    /// Base location of image IO modules
    #[serde(rename = "imageIOUrl")]
    pub image_io_url: String,

    /// Base location of mesh IO modules
    #[serde(rename = "meshIOUrl")]
    pub mesh_io_url: String,

    /// Largest module binary the fetcher will accept
    pub max_module_bytes: u64,

    /// Capture limit for each of a module's stdout and stderr
    pub stdio_capacity: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            pipelines_url: "pipelines".to_string(),
            image_io_url: "pipelines/image-io".to_string(),
            mesh_io_url: "pipelines/mesh-io".to_string(),
            max_module_bytes: 256 * 1024 * 1024,
            stdio_capacity: 16 * 1024 * 1024,
        }
    }
}

impl BridgeConfig {
    /// Load configuration from a YAML file; missing keys keep their defaults
    pub fn from_yaml(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            BridgeError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&contents)
    }

    pub fn from_yaml_str(contents: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(contents)
            .map_err(|e| BridgeError::Config(format!("Failed to parse YAML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by `PIPELINE_BRIDGE_*` environment variables
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(url) = std::env::var("PIPELINE_BRIDGE_PIPELINES_URL") {
            self.pipelines_url = url;
        }
        if let Ok(url) = std::env::var("PIPELINE_BRIDGE_IMAGE_IO_URL") {
            self.image_io_url = url;
        }
        if let Ok(url) = std::env::var("PIPELINE_BRIDGE_MESH_IO_URL") {
            self.mesh_io_url = url;
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        for (key, value) in [
            ("pipelinesUrl", &self.pipelines_url),
            ("imageIOUrl", &self.image_io_url),
            ("meshIOUrl", &self.mesh_io_url),
        ] {
            if value.trim().is_empty() {
                return Err(BridgeError::Config(format!("{key} must not be empty")));
            }
        }
        if self.max_module_bytes == 0 {
            return Err(BridgeError::Config(
                "maxModuleBytes must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Per-request override of the module locations
///
/// Size limits belong to the bridge's fetcher and runtime, which are built
/// once; a request naming them is rejected rather than silently ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RequestConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipelines_url: Option<String>,

    #[serde(default, rename = "imageIOUrl", skip_serializing_if = "Option::is_none")]
    pub image_io_url: Option<String>,

    #[serde(default, rename = "meshIOUrl", skip_serializing_if = "Option::is_none")]
    pub mesh_io_url: Option<String>,
}

impl RequestConfig {
    /// The bridge configuration with this request's locations applied
    pub fn apply(&self, base: &BridgeConfig) -> Result<BridgeConfig> {
        let mut config = base.clone();
        if let Some(url) = &self.pipelines_url {
            config.pipelines_url = url.clone();
        }
        if let Some(url) = &self.image_io_url {
            config.image_io_url = url.clone();
        }
        if let Some(url) = &self.mesh_io_url {
            config.mesh_io_url = url.clone();
        }
        config.validate()?;
        Ok(config)
    }
}
