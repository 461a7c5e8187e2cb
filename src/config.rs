//! Interpreter configuration.
//!
//! Every field has a default so a partial JSON object (or none at all) is a
//! valid configuration. Environment overrides use the `JSONUI_` prefix.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Error, Result};

pub const DEFAULT_MAX_DEPTH: usize = 64;
pub const DEFAULT_MAX_CALLS_PER_TICK: usize = 5000;
pub const DEFAULT_MAX_FALLBACKS_PER_TICK: usize = 3;
pub const DEFAULT_TICK_MILLIS: u64 = 16;

/// When the safety guard counters are reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "camelCase")]
pub enum TickCadence {
    /// Reset lazily once `millis` have elapsed since the tick started.
    Interval { millis: u64 },
    /// Reset at the start of every top-level render call.
    PerRender,
    /// Reset only when the host calls `Interpreter::tick`.
    Manual,
}

impl TickCadence {
    pub fn interval(&self) -> Option<Duration> {
        match self {
            TickCadence::Interval { millis } => Some(Duration::from_millis(*millis)),
            _ => None,
        }
    }
}

impl Default for TickCadence {
    fn default() -> Self {
        TickCadence::Interval {
            millis: DEFAULT_TICK_MILLIS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RenderConfig {
    /// Deepest recursion allowed before a subtree is replaced by a fallback.
    pub max_depth: usize,
    /// Interpreter invocations allowed per tick before interpretation halts.
    pub max_calls_per_tick: usize,
    /// Visible depth fallbacks per tick; further ones render nothing.
    pub max_fallbacks_per_tick: usize,
    pub tick: TickCadence,
    /// Log every binding that resolves to undefined, with the available keys.
    pub dev_mode: bool,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_MAX_DEPTH,
            max_calls_per_tick: DEFAULT_MAX_CALLS_PER_TICK,
            max_fallbacks_per_tick: DEFAULT_MAX_FALLBACKS_PER_TICK,
            tick: TickCadence::default(),
            dev_mode: false,
        }
    }
}

impl RenderConfig {
    pub fn from_json(source: &str) -> Result<Self> {
        Ok(serde_json::from_str(source)?)
    }

    /// Defaults overlaid with `JSONUI_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(v) = lookup("JSONUI_MAX_DEPTH") {
            config.max_depth = parse_usize("JSONUI_MAX_DEPTH", &v)?;
        }
        if let Some(v) = lookup("JSONUI_MAX_CALLS_PER_TICK") {
            config.max_calls_per_tick = parse_usize("JSONUI_MAX_CALLS_PER_TICK", &v)?;
        }
        if let Some(v) = lookup("JSONUI_MAX_FALLBACKS_PER_TICK") {
            config.max_fallbacks_per_tick = parse_usize("JSONUI_MAX_FALLBACKS_PER_TICK", &v)?;
        }
        if let Some(v) = lookup("JSONUI_DEV_MODE") {
            config.dev_mode = match v.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" | "" => false,
                _ => {
                    return Err(Error::Config {
                        key: "JSONUI_DEV_MODE".to_string(),
                        value: v,
                    })
                }
            };
        }
        Ok(config)
    }
}

fn parse_usize(key: &str, value: &str) -> Result<usize> {
    value.trim().parse::<usize>().map_err(|_| Error::Config {
        key: key.to_string(),
        value: value.to_string(),
    })
}
