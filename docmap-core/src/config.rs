//! Mapper configuration.
//!
//! Configuration is plain data: build it with [`MapperConfig::builder`], or deserialize
//! it from JSON with [`MapperConfig::from_json_str`].
//!
//! ```ignore
//! let config = MapperConfig::builder()
//!     .validate_models(true)
//!     .validator_options(ValidatorOptions { stop_at_first_error: true, ..Default::default() })
//!     .build();
//! ```

use serde::{Deserialize, Serialize};

use crate::{error::DocumentStoreResult, validate::ValidatorOptions};

/// Behaviour switches for a [`DocumentMapper`](crate::mapper::DocumentMapper).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MapperConfig {
    /// Run the validator before every create and update.
    pub validate_models: bool,
    /// Options forwarded to the validator.
    pub validator_options: ValidatorOptions,
}

impl MapperConfig {
    pub fn builder() -> MapperConfigBuilder {
        MapperConfigBuilder::new()
    }

    /// Parses a configuration from JSON. Missing fields take their default values.
    pub fn from_json_str(json: &str) -> DocumentStoreResult<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

#[derive(Debug, Clone, Default)]
pub struct MapperConfigBuilder {
    config: MapperConfig,
}

impl MapperConfigBuilder {
    pub fn new() -> Self {
        MapperConfigBuilder::default()
    }

    pub fn validate_models(mut self, validate_models: bool) -> Self {
        self.config.validate_models = validate_models;
        self
    }

    pub fn validator_options(mut self, validator_options: ValidatorOptions) -> Self {
        self.config.validator_options = validator_options;
        self
    }

    pub fn build(self) -> MapperConfig {
        self.config
    }
}
