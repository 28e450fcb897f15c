//! Client-supplied run configuration.

use serde::{Deserialize, Serialize};

/// How step records are encoded for the client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataMode {
    /// Step records forwarded as JSON text messages.
    #[default]
    Steps,
    /// Step records turned into binary pixel-change batches.
    PixelData,
}

impl DataMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Steps => "steps",
            Self::PixelData => "pixel_data",
        }
    }
}

impl std::fmt::Display for DataMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameters of one simulation run.
///
/// Every field is optional on the wire; missing fields take the defaults below.
/// Unknown fields are ignored, but a field of the wrong type fails to parse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Grid width in cells (default 32).
    pub grid_width: u32,
    /// Grid height in cells (default 32).
    pub grid_height: u32,
    /// Food items kept on the grid (default 15).
    pub food_count: u32,
    /// Number of snakes (default 7).
    pub nr_of_snakes: u32,
    pub data_mode: DataMode,
    /// Client-paced delivery via `GET <n>` credit requests.
    pub data_on_demand: bool,
    /// Per-step decision budget for the engine, in milliseconds (default 1000).
    pub calc_timeout: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            grid_width: 32,
            grid_height: 32,
            food_count: 15,
            nr_of_snakes: 7,
            data_mode: DataMode::Steps,
            data_on_demand: false,
            calc_timeout: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid run config: {0}")]
    Malformed(String),
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },
}

impl RunConfig {
    /// Parse and validate a handshake payload.
    pub fn from_json(payload: &[u8]) -> Result<Self, ConfigError> {
        let value: serde_json::Value =
            serde_json::from_slice(payload).map_err(|e| ConfigError::Malformed(e.to_string()))?;
        if !value.is_object() {
            return Err(ConfigError::Malformed(
                "run config must be a JSON object".to_string(),
            ));
        }
        let config: Self =
            serde_json::from_value(value).map_err(|e| ConfigError::Malformed(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.grid_width == 0 {
            return Err(ConfigError::Zero {
                field: "grid_width",
            });
        }
        if self.grid_height == 0 {
            return Err(ConfigError::Zero {
                field: "grid_height",
            });
        }
        if self.nr_of_snakes == 0 {
            return Err(ConfigError::Zero {
                field: "nr_of_snakes",
            });
        }
        Ok(())
    }

    pub fn with_data_on_demand(mut self, on_demand: bool) -> Self {
        self.data_on_demand = on_demand;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_takes_defaults() {
        let config = RunConfig::from_json(b"{}").unwrap();
        assert_eq!(config, RunConfig::default());
        assert_eq!(config.grid_width, 32);
        assert_eq!(config.food_count, 15);
        assert_eq!(config.nr_of_snakes, 7);
        assert_eq!(config.data_mode, DataMode::Steps);
        assert!(!config.data_on_demand);
        assert_eq!(config.calc_timeout, 1000);
    }

    #[test]
    fn explicit_fields_override_defaults() {
        let config = RunConfig::from_json(
            br#"{"grid_width":5,"grid_height":5,"food_count":3,"nr_of_snakes":2,"data_mode":"pixel_data","data_on_demand":true}"#,
        )
        .unwrap();
        assert_eq!(config.grid_width, 5);
        assert_eq!(config.grid_height, 5);
        assert_eq!(config.food_count, 3);
        assert_eq!(config.nr_of_snakes, 2);
        assert_eq!(config.data_mode, DataMode::PixelData);
        assert!(config.data_on_demand);
        assert_eq!(config.calc_timeout, 1000);
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let config = RunConfig::from_json(br#"{"grid_width":10,"theme":"dark"}"#).unwrap();
        assert_eq!(config.grid_width, 10);
    }

    #[test]
    fn type_mismatch_is_rejected() {
        let err = RunConfig::from_json(br#"{"grid_width":"wide"}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Malformed(_)));

        let err = RunConfig::from_json(br#"{"data_on_demand":1}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Malformed(_)));
    }

    #[test]
    fn unknown_data_mode_is_rejected() {
        let err = RunConfig::from_json(br#"{"data_mode":"video"}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Malformed(_)));
    }

    #[test]
    fn non_object_payload_is_rejected() {
        let payloads: [&[u8]; 6] = [b"[5,5,3,2]", b"[1,2]", b"7", b"null", b"\"{}\"", b"not json"];
        for payload in payloads {
            let err = RunConfig::from_json(payload).unwrap_err();
            assert!(matches!(err, ConfigError::Malformed(_)), "{payload:?}");
        }
    }

    #[test]
    fn zero_dimensions_fail_validation() {
        let err = RunConfig::from_json(br#"{"grid_height":0}"#).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Zero {
                field: "grid_height"
            }
        );
        let err = RunConfig::from_json(br#"{"nr_of_snakes":0}"#).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Zero {
                field: "nr_of_snakes"
            }
        );
    }
}
