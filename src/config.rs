// SPDX-License-Identifier: MIT OR Apache-2.0

//! Engine configuration and JSON parsing.
//!
//! [`EngineConfig`] controls what a session captures during a pass and what
//! it returns to clients. Every key is optional.
//!
//! # Usage
//!
//! ```
//! use candle_patch::{EngineConfig, ExportPolicy, NamesFilter};
//!
//! let config_str = r#"{"namesFilter": {"suffix": "pattern"}, "export": "all"}"#;
//! let json: serde_json::Value = serde_json::from_str(config_str).unwrap();
//! let config = EngineConfig::from_json(&json).unwrap();
//! assert_eq!(config.names_filter, NamesFilter::Suffix("pattern".into()));
//! assert_eq!(config.export, ExportPolicy::All);
//! ```

use std::fmt;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{MIError, Result};
use crate::hooks::{HookPoint, NamesFilter};

// ---------------------------------------------------------------------------
// ExportPolicy
// ---------------------------------------------------------------------------

/// Which captured values a run returns to the client.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportPolicy {
    /// Every captured value.
    All,
    /// The standard set (see [`HookPoint::is_standard_export`]).
    #[default]
    Standard,
    /// Nothing; only logits and losses are returned.
    None,
}

impl ExportPolicy {
    /// Whether a captured value at `hook` is returned.
    #[must_use]
    pub const fn includes(self, hook: &HookPoint) -> bool {
        match self {
            Self::All => true,
            Self::Standard => hook.is_standard_export(),
            Self::None => false,
        }
    }
}

impl fmt::Display for ExportPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => write!(f, "all"),
            Self::Standard => write!(f, "standard"),
            Self::None => write!(f, "none"),
        }
    }
}

// ---------------------------------------------------------------------------
// EngineConfig
// ---------------------------------------------------------------------------

/// Session engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// Hook points captured into the live cache each pass.
    pub names_filter: NamesFilter,
    /// Captured values returned to the client.
    pub export: ExportPolicy,
    /// Request backward caching hooks from the backend.
    pub include_backward: bool,
}

impl EngineConfig {
    /// Parse a configuration from a JSON object. Missing keys take their
    /// defaults; unknown keys are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`MIError::Config`] if `config` is not an object, a key has
    /// the wrong form, or the result fails [`validate`](Self::validate).
    pub fn from_json(config: &Value) -> Result<Self> {
        if !config.is_object() {
            return Err(MIError::Config("engine config must be a JSON object".into()));
        }
        let parsed = Self {
            names_filter: get_or_default(config, "namesFilter")?,
            export: get_or_default(config, "export")?,
            include_backward: get_bool_or(config, "includeBackward", false),
        };
        parsed.validate()?;
        Ok(parsed)
    }

    /// Load a configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns [`MIError::Config`] if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let config_str = std::fs::read_to_string(path)
            .map_err(|e| MIError::Config(format!("read {}: {e}", path.display())))?;
        let json: Value = serde_json::from_str(&config_str)
            .map_err(|e| MIError::Config(format!("parse {}: {e}", path.display())))?;
        Self::from_json(&json)
    }

    /// Check that the filter can select anything at all.
    ///
    /// # Errors
    ///
    /// Returns [`MIError::Config`] for an empty name list or an empty
    /// prefix/suffix.
    pub fn validate(&self) -> Result<()> {
        match &self.names_filter {
            NamesFilter::Names(names) if names.is_empty() => Err(MIError::Config(
                "namesFilter.names is empty; use \"all\" or list at least one hook point".into(),
            )),
            NamesFilter::Suffix(s) | NamesFilter::Prefix(s) if s.is_empty() => Err(
                MIError::Config("namesFilter prefix/suffix must not be empty".into()),
            ),
            _ => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Deserialize `key` if present, else take the type's default.
fn get_or_default<T: DeserializeOwned + Default>(config: &Value, key: &str) -> Result<T> {
    match config.get(key) {
        None | Some(Value::Null) => Ok(T::default()),
        Some(v) => serde_json::from_value(v.clone())
            .map_err(|e| MIError::Config(format!("invalid `{key}`: {e}"))),
    }
}

/// Read a boolean key, falling back to `default`.
fn get_bool_or(config: &Value, key: &str, default: bool) -> bool {
    config.get(key).and_then(Value::as_bool).unwrap_or(default)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_gives_defaults() {
        let config = EngineConfig::from_json(&serde_json::json!({})).unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.names_filter, NamesFilter::All);
        assert_eq!(config.export, ExportPolicy::Standard);
        assert!(!config.include_backward);
    }

    #[test]
    fn parses_names_list() {
        let json = serde_json::json!({
            "namesFilter": {"names": ["hook_embed", "blocks.0.attn.hook_pattern"]},
            "export": "none",
            "includeBackward": true
        });
        let config = EngineConfig::from_json(&json).unwrap();
        assert!(config.names_filter.matches(&HookPoint::AttnPattern(0)));
        assert!(!config.names_filter.matches(&HookPoint::AttnQ(0)));
        assert_eq!(config.export, ExportPolicy::None);
        assert!(config.include_backward);
    }

    #[test]
    fn rejects_bad_shapes() {
        assert!(EngineConfig::from_json(&serde_json::json!([1, 2])).is_err());
        assert!(EngineConfig::from_json(&serde_json::json!({"export": "some"})).is_err());
        assert!(EngineConfig::from_json(&serde_json::json!({"namesFilter": {"names": []}})).is_err());
        assert!(EngineConfig::from_json(&serde_json::json!({"namesFilter": {"suffix": ""}})).is_err());
    }

    #[test]
    fn export_policy_standard_set() {
        let policy = ExportPolicy::Standard;
        assert!(policy.includes(&HookPoint::ResidPost(3)));
        assert!(policy.includes(&HookPoint::AttnZ(0)));
        assert!(!policy.includes(&HookPoint::AttnScores(0)));
        assert!(!policy.includes(&HookPoint::MlpPre(1)));
        assert!(!policy.includes(&HookPoint::Custom("x".into())));
        assert!(ExportPolicy::All.includes(&HookPoint::Custom("x".into())));
        assert_eq!(ExportPolicy::None.to_string(), "none");
    }

    #[test]
    fn from_file_reports_missing_file() {
        let err = EngineConfig::from_file("/nonexistent/engine.json").unwrap_err();
        assert!(matches!(err, MIError::Config(_)));
    }
}
