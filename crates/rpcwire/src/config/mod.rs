// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Runtime configuration.
//!
//! [`Config`] gathers every tunable of the wire layer: codec limits,
//! retry intervals, active connection management, timeouts, endpoint
//! selection and trace levels. Build it with [`Config::default`] and the
//! `with_*` methods, or load it from YAML (feature `config-loaders`).
//!
//! # Example
//!
//! ```ignore
//! use rpcwire::config::*;
//! use std::time::Duration;
//!
//! let config = Config::default()
//!     .with_retry_intervals(vec![Duration::ZERO, Duration::from_millis(100)])
//!     .with_acm(AcmConfig::new(Duration::from_secs(30), AcmClose::OnIdle, AcmHeartbeat::OnIdle));
//! ```

#[cfg(feature = "config-loaders")]
pub mod yaml;

use std::fmt;
use std::time::Duration;

use crate::protocol::{EncodingVersion, CURRENT_ENCODING};
use crate::stream::FormatType;

/// Default maximum message size (1 MiB).
pub const DEFAULT_MESSAGE_SIZE_MAX: usize = 1024 * 1024;

/// Default maximum nesting of class instances.
pub const DEFAULT_CLASS_GRAPH_DEPTH_MAX: usize = 100;

/// Default batch size triggering an automatic flush (1 MiB).
pub const DEFAULT_BATCH_AUTO_FLUSH_SIZE: usize = 1024 * 1024;

/// Default close timeout.
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default ACM timeout.
pub const DEFAULT_ACM_TIMEOUT: Duration = Duration::from_secs(60);

// ============================================================================
// Active Connection Management
// ============================================================================

/// When an idle or unused connection gets closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AcmClose {
    /// Never close.
    Off,
    /// Close gracefully when idle for a full timeout.
    OnIdle,
    /// Close gracefully when no invocation is pending and idle.
    OnInvocation,
    /// `OnInvocation` or `OnIdle`, whichever triggers first.
    OnInvocationAndIdle,
    /// Close forcefully when idle, even with invocations pending.
    OnIdleForceful,
}

/// When heartbeats are sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AcmHeartbeat {
    Off,
    /// While requests are being dispatched.
    OnDispatch,
    /// When the connection is idle.
    OnIdle,
    /// Regularly, regardless of activity.
    Always,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcmConfig {
    /// Idle timeout. Zero disables ACM.
    pub timeout: Duration,
    pub close: AcmClose,
    pub heartbeat: AcmHeartbeat,
}

impl AcmConfig {
    pub fn new(timeout: Duration, close: AcmClose, heartbeat: AcmHeartbeat) -> Self {
        Self {
            timeout,
            close,
            heartbeat,
        }
    }

    /// Client connections.
    pub fn client_default() -> Self {
        Self::new(
            DEFAULT_ACM_TIMEOUT,
            AcmClose::OnInvocationAndIdle,
            AcmHeartbeat::OnDispatch,
        )
    }

    /// Incoming connections.
    pub fn server_default() -> Self {
        Self::new(
            DEFAULT_ACM_TIMEOUT,
            AcmClose::OnInvocation,
            AcmHeartbeat::OnDispatch,
        )
    }

    pub fn disabled() -> Self {
        Self::new(Duration::ZERO, AcmClose::Off, AcmHeartbeat::Off)
    }

    pub fn is_enabled(&self) -> bool {
        !self.timeout.is_zero()
    }
}

impl Default for AcmConfig {
    fn default() -> Self {
        Self::client_default()
    }
}

// ============================================================================
// Endpoint Selection & Tracing
// ============================================================================

/// Order in which endpoints are tried.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum EndpointSelection {
    #[default]
    Random,
    Ordered,
}

/// Verbosity of the diagnostic categories (0 = off).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TraceLevels {
    /// Connection establishment and closure; 2 adds byte counts.
    pub network: u8,
    /// Every sent and received message.
    pub protocol: u8,
    /// Retry decisions.
    pub retry: u8,
    /// Unknown slices skipped.
    pub slicing: u8,
}

// ============================================================================
// Config
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Largest accepted message, header included. 0 means unlimited.
    pub message_size_max: usize,
    pub class_graph_depth_max: usize,
    pub default_encoding: EncodingVersion,
    /// Format used when a stream asks for [`FormatType::Default`].
    pub default_format: FormatType,
    /// Preserve instances of unknown types when sliced data allows it.
    pub slice_values: bool,
    /// Delay before each retry; the length bounds the number of retries.
    pub retry_intervals: Vec<Duration>,
    pub acm: AcmConfig,
    pub close_timeout: Duration,
    pub invocation_timeout: Option<Duration>,
    /// Accumulated batch size triggering an automatic flush. 0 disables.
    pub batch_auto_flush_size: usize,
    pub prefer_secure: bool,
    pub endpoint_selection: EndpointSelection,
    /// Lifetime of locator cache entries. `None` never expires, zero
    /// disables caching.
    pub locator_cache_timeout: Option<Duration>,
    pub cache_connection: bool,
    pub warn_connections: bool,
    pub warn_datagrams: bool,
    pub warn_unknown_properties: bool,
    pub trace: TraceLevels,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            message_size_max: DEFAULT_MESSAGE_SIZE_MAX,
            class_graph_depth_max: DEFAULT_CLASS_GRAPH_DEPTH_MAX,
            default_encoding: CURRENT_ENCODING,
            default_format: FormatType::Compact,
            slice_values: true,
            retry_intervals: vec![Duration::ZERO],
            acm: AcmConfig::client_default(),
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
            invocation_timeout: None,
            batch_auto_flush_size: DEFAULT_BATCH_AUTO_FLUSH_SIZE,
            prefer_secure: false,
            endpoint_selection: EndpointSelection::Random,
            locator_cache_timeout: None,
            cache_connection: true,
            warn_connections: false,
            warn_datagrams: false,
            warn_unknown_properties: true,
            trace: TraceLevels::default(),
        }
    }
}

impl Config {
    pub fn with_message_size_max(mut self, max: usize) -> Self {
        self.message_size_max = max;
        self
    }

    pub fn with_class_graph_depth_max(mut self, depth: usize) -> Self {
        self.class_graph_depth_max = depth;
        self
    }

    pub fn with_default_encoding(mut self, encoding: EncodingVersion) -> Self {
        self.default_encoding = encoding;
        self
    }

    pub fn with_default_format(mut self, format: FormatType) -> Self {
        self.default_format = format;
        self
    }

    pub fn with_slice_values(mut self, slice_values: bool) -> Self {
        self.slice_values = slice_values;
        self
    }

    pub fn with_retry_intervals(mut self, intervals: Vec<Duration>) -> Self {
        self.retry_intervals = intervals;
        self
    }

    pub fn with_acm(mut self, acm: AcmConfig) -> Self {
        self.acm = acm;
        self
    }

    pub fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    pub fn with_invocation_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.invocation_timeout = timeout;
        self
    }

    pub fn with_batch_auto_flush_size(mut self, size: usize) -> Self {
        self.batch_auto_flush_size = size;
        self
    }

    pub fn with_prefer_secure(mut self, prefer_secure: bool) -> Self {
        self.prefer_secure = prefer_secure;
        self
    }

    pub fn with_endpoint_selection(mut self, selection: EndpointSelection) -> Self {
        self.endpoint_selection = selection;
        self
    }

    pub fn with_locator_cache_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.locator_cache_timeout = timeout;
        self
    }

    pub fn with_cache_connection(mut self, cache: bool) -> Self {
        self.cache_connection = cache;
        self
    }

    pub fn with_warn_connections(mut self, warn: bool) -> Self {
        self.warn_connections = warn;
        self
    }

    pub fn with_warn_datagrams(mut self, warn: bool) -> Self {
        self.warn_datagrams = warn;
        self
    }

    pub fn with_trace(mut self, trace: TraceLevels) -> Self {
        self.trace = trace;
        self
    }

    /// True when `size` exceeds the configured message limit.
    pub fn exceeds_message_size(&self, size: usize) -> bool {
        self.message_size_max != 0 && size > self.message_size_max
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Configuration loading or validation failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    Io(String),
    Parse(String),
    InvalidValue { key: &'static str, value: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "failed to read configuration: {}", e),
            ConfigError::Parse(e) => write!(f, "failed to parse configuration: {}", e),
            ConfigError::InvalidValue { key, value } => {
                write!(f, "invalid value `{}` for `{}`", value, key)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.message_size_max, 1024 * 1024);
        assert_eq!(config.class_graph_depth_max, 100);
        assert_eq!(config.default_encoding, CURRENT_ENCODING);
        assert_eq!(config.default_format, FormatType::Compact);
        assert_eq!(config.retry_intervals, vec![Duration::ZERO]);
        assert_eq!(config.acm, AcmConfig::client_default());
        assert_eq!(config.close_timeout, Duration::from_secs(10));
        assert!(config.cache_connection);
    }

    #[test]
    fn test_builders() {
        let config = Config::default()
            .with_message_size_max(0)
            .with_default_format(FormatType::Sliced)
            .with_acm(AcmConfig::disabled())
            .with_invocation_timeout(Some(Duration::from_millis(250)));
        assert!(!config.exceeds_message_size(usize::MAX));
        assert_eq!(config.default_format, FormatType::Sliced);
        assert!(!config.acm.is_enabled());
        assert_eq!(config.invocation_timeout, Some(Duration::from_millis(250)));
    }

    #[test]
    fn test_message_size_limit() {
        let config = Config::default().with_message_size_max(100);
        assert!(!config.exceeds_message_size(100));
        assert!(config.exceeds_message_size(101));
    }

    #[test]
    fn test_acm_presets() {
        assert_eq!(AcmConfig::server_default().close, AcmClose::OnInvocation);
        assert_eq!(
            AcmConfig::client_default().close,
            AcmClose::OnInvocationAndIdle
        );
        assert!(AcmConfig::client_default().is_enabled());
    }
}
