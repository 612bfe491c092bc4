// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! YAML configuration loader.
//!
//! # Example YAML
//!
//! ```yaml
//! message_size_max: 4194304
//! class_graph_depth_max: 50
//! default_encoding: "1.1"
//! default_format: sliced
//! retry_intervals_ms: [0, 100, 500]
//! acm:
//!   timeout_secs: 30
//!   close: on_idle
//!   heartbeat: on_idle
//! close_timeout_ms: 2000
//! invocation_timeout_ms: 5000
//! endpoint_selection: ordered
//! locator_cache_timeout_secs: 120
//! warn:
//!   connections: true
//! trace:
//!   protocol: 1
//!   retry: 1
//! ```
//!
//! Keys not listed above are ignored, with a warning unless
//! `warn.unknown_properties` is false.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use super::{
    AcmClose, AcmConfig, AcmHeartbeat, Config, ConfigError, EndpointSelection, TraceLevels,
};
use crate::protocol::EncodingVersion;
use crate::stream::FormatType;

/// YAML configuration loader.
pub struct YamlLoader;

/// Root YAML document structure.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct YamlConfig {
    pub message_size_max: Option<usize>,
    pub class_graph_depth_max: Option<usize>,
    /// `"1.0"` or `"1.1"`
    pub default_encoding: Option<String>,
    /// `compact` or `sliced`
    pub default_format: Option<String>,
    pub slice_values: Option<bool>,
    pub retry_intervals_ms: Option<Vec<u64>>,
    pub acm: Option<YamlAcm>,
    pub close_timeout_ms: Option<u64>,
    pub invocation_timeout_ms: Option<u64>,
    pub batch_auto_flush_size: Option<usize>,
    pub prefer_secure: Option<bool>,
    /// `random` or `ordered`
    pub endpoint_selection: Option<String>,
    /// Negative values disable expiry.
    pub locator_cache_timeout_secs: Option<i64>,
    pub cache_connection: Option<bool>,
    pub warn: Option<YamlWarn>,
    pub trace: Option<YamlTrace>,

    #[serde(flatten)]
    pub unknown: BTreeMap<String, serde_yaml::Value>,
}

/// Active connection management in YAML.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct YamlAcm {
    pub timeout_secs: Option<u64>,
    /// `off`, `on_idle`, `on_invocation`, `on_invocation_and_idle`, `on_idle_forceful`
    pub close: Option<String>,
    /// `off`, `on_dispatch`, `on_idle`, `always`
    pub heartbeat: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct YamlWarn {
    pub connections: Option<bool>,
    pub datagrams: Option<bool>,
    pub unknown_properties: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct YamlTrace {
    pub network: Option<u8>,
    pub protocol: Option<u8>,
    pub retry: Option<u8>,
    pub slicing: Option<u8>,
}

impl YamlLoader {
    /// Load a YAML file into a [`Config`], starting from the defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        Self::from_str(&content)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(yaml_content: &str) -> Result<Config, ConfigError> {
        let doc = Self::parse_yaml(yaml_content)?;
        Self::apply(&doc, Config::default())
    }

    pub fn parse_yaml(yaml_content: &str) -> Result<YamlConfig, ConfigError> {
        if yaml_content.trim().is_empty() {
            return Ok(YamlConfig::default());
        }
        serde_yaml::from_str(yaml_content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Overlay the values present in `doc` on `config`.
    pub fn apply(doc: &YamlConfig, mut config: Config) -> Result<Config, ConfigError> {
        if let Some(v) = doc.message_size_max {
            config.message_size_max = v;
        }
        if let Some(v) = doc.class_graph_depth_max {
            if v == 0 {
                return Err(ConfigError::InvalidValue {
                    key: "class_graph_depth_max",
                    value: v.to_string(),
                });
            }
            config.class_graph_depth_max = v;
        }
        if let Some(v) = &doc.default_encoding {
            let encoding: EncodingVersion = v.parse().map_err(|_| ConfigError::InvalidValue {
                key: "default_encoding",
                value: v.clone(),
            })?;
            crate::protocol::check_supported_encoding(encoding).map_err(|_| {
                ConfigError::InvalidValue {
                    key: "default_encoding",
                    value: v.clone(),
                }
            })?;
            config.default_encoding = encoding;
        }
        if let Some(v) = &doc.default_format {
            config.default_format = match v.to_ascii_lowercase().as_str() {
                "compact" => FormatType::Compact,
                "sliced" => FormatType::Sliced,
                _ => {
                    return Err(ConfigError::InvalidValue {
                        key: "default_format",
                        value: v.clone(),
                    })
                }
            };
        }
        if let Some(v) = doc.slice_values {
            config.slice_values = v;
        }
        if let Some(v) = &doc.retry_intervals_ms {
            config.retry_intervals = v.iter().map(|ms| Duration::from_millis(*ms)).collect();
        }
        if let Some(acm) = &doc.acm {
            config.acm = Self::acm_to_config(acm, config.acm)?;
        }
        if let Some(v) = doc.close_timeout_ms {
            config.close_timeout = Duration::from_millis(v);
        }
        if let Some(v) = doc.invocation_timeout_ms {
            config.invocation_timeout = (v > 0).then(|| Duration::from_millis(v));
        }
        if let Some(v) = doc.batch_auto_flush_size {
            config.batch_auto_flush_size = v;
        }
        if let Some(v) = doc.prefer_secure {
            config.prefer_secure = v;
        }
        if let Some(v) = &doc.endpoint_selection {
            config.endpoint_selection = match v.to_ascii_lowercase().as_str() {
                "random" => EndpointSelection::Random,
                "ordered" => EndpointSelection::Ordered,
                _ => {
                    return Err(ConfigError::InvalidValue {
                        key: "endpoint_selection",
                        value: v.clone(),
                    })
                }
            };
        }
        if let Some(v) = doc.locator_cache_timeout_secs {
            config.locator_cache_timeout = u64::try_from(v).ok().map(Duration::from_secs);
        }
        if let Some(v) = doc.cache_connection {
            config.cache_connection = v;
        }
        if let Some(warn) = &doc.warn {
            if let Some(v) = warn.connections {
                config.warn_connections = v;
            }
            if let Some(v) = warn.datagrams {
                config.warn_datagrams = v;
            }
            if let Some(v) = warn.unknown_properties {
                config.warn_unknown_properties = v;
            }
        }
        if let Some(trace) = &doc.trace {
            config.trace = TraceLevels {
                network: trace.network.unwrap_or(config.trace.network),
                protocol: trace.protocol.unwrap_or(config.trace.protocol),
                retry: trace.retry.unwrap_or(config.trace.retry),
                slicing: trace.slicing.unwrap_or(config.trace.slicing),
            };
        }

        if config.warn_unknown_properties {
            for key in doc.unknown.keys() {
                log::warn!("[Config] unknown property `{}` ignored", key);
            }
        }
        Ok(config)
    }

    fn acm_to_config(acm: &YamlAcm, mut out: AcmConfig) -> Result<AcmConfig, ConfigError> {
        if let Some(v) = acm.timeout_secs {
            out.timeout = Duration::from_secs(v);
        }
        if let Some(v) = &acm.close {
            out.close = match v.to_ascii_lowercase().as_str() {
                "off" => AcmClose::Off,
                "on_idle" => AcmClose::OnIdle,
                "on_invocation" => AcmClose::OnInvocation,
                "on_invocation_and_idle" => AcmClose::OnInvocationAndIdle,
                "on_idle_forceful" => AcmClose::OnIdleForceful,
                _ => {
                    return Err(ConfigError::InvalidValue {
                        key: "acm.close",
                        value: v.clone(),
                    })
                }
            };
        }
        if let Some(v) = &acm.heartbeat {
            out.heartbeat = match v.to_ascii_lowercase().as_str() {
                "off" => AcmHeartbeat::Off,
                "on_dispatch" => AcmHeartbeat::OnDispatch,
                "on_idle" => AcmHeartbeat::OnIdle,
                "always" => AcmHeartbeat::Always,
                _ => {
                    return Err(ConfigError::InvalidValue {
                        key: "acm.heartbeat",
                        value: v.clone(),
                    })
                }
            };
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ENCODING_1_0;
    use std::io::Write;

    #[test]
    fn test_parse_full_document() {
        let yaml = r#"
message_size_max: 4096
class_graph_depth_max: 10
default_encoding: "1.0"
default_format: sliced
retry_intervals_ms: [0, 100, 500]
acm:
  timeout_secs: 4
  close: on_idle
  heartbeat: always
close_timeout_ms: 250
invocation_timeout_ms: 1000
endpoint_selection: ordered
locator_cache_timeout_secs: -1
warn:
  connections: true
trace:
  protocol: 2
"#;
        let config = YamlLoader::from_str(yaml).unwrap();
        assert_eq!(config.message_size_max, 4096);
        assert_eq!(config.class_graph_depth_max, 10);
        assert_eq!(config.default_encoding, ENCODING_1_0);
        assert_eq!(config.default_format, FormatType::Sliced);
        assert_eq!(
            config.retry_intervals,
            vec![
                Duration::ZERO,
                Duration::from_millis(100),
                Duration::from_millis(500)
            ]
        );
        assert_eq!(
            config.acm,
            AcmConfig::new(Duration::from_secs(4), AcmClose::OnIdle, AcmHeartbeat::Always)
        );
        assert_eq!(config.close_timeout, Duration::from_millis(250));
        assert_eq!(config.invocation_timeout, Some(Duration::from_secs(1)));
        assert_eq!(config.endpoint_selection, EndpointSelection::Ordered);
        assert_eq!(config.locator_cache_timeout, None);
        assert!(config.warn_connections);
        assert_eq!(config.trace.protocol, 2);
        assert_eq!(config.trace.retry, 0);
    }

    #[test]
    fn test_empty_document_yields_defaults() {
        assert_eq!(YamlLoader::from_str("").unwrap(), Config::default());
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(matches!(
            YamlLoader::from_str("default_format: fancy"),
            Err(ConfigError::InvalidValue { key: "default_format", .. })
        ));
        assert!(matches!(
            YamlLoader::from_str("default_encoding: \"2.0\""),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            YamlLoader::from_str("acm: { close: sometimes }"),
            Err(ConfigError::InvalidValue { key: "acm.close", .. })
        ));
        assert!(matches!(
            YamlLoader::from_str("message_size_max: [1, 2"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_unknown_keys_are_ignored() {
        let config = YamlLoader::from_str("frobnicate: 3\nslice_values: false").unwrap();
        assert!(!config.slice_values);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "cache_connection: false").unwrap();
        let config = YamlLoader::load_from_file(file.path()).unwrap();
        assert!(!config.cache_connection);

        assert!(matches!(
            YamlLoader::load_from_file("/nonexistent/rpcwire.yaml"),
            Err(ConfigError::Io(_))
        ));
    }
}
