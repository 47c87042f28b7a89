//! Engine configuration: a plain, `serde`-deserializable struct with
//! defaults matching the stipulated ones, optionally layered with
//! environment variables via `dotenvy`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::controller::invocation::MIN_TICK;
use crate::expr::DEFAULT_TIMEOUT as DEFAULT_EXPR_TIMEOUT;

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        (d.as_millis() as u64).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStoreKind {
    Memory,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventStoreConfig {
    pub kind: EventStoreKind,
}

impl Default for EventStoreConfig {
    fn default() -> Self {
        Self { kind: EventStoreKind::Memory }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InternalRuntimeConfig {
    pub enabled: bool,
}

impl Default for InternalRuntimeConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimesConfig {
    pub internal: InternalRuntimeConfig,
}

impl Default for RuntimesConfig {
    fn default() -> Self {
        Self {
            internal: InternalRuntimeConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerToggle {
    pub enabled: bool,
}

impl Default for ControllerToggle {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerConfig {
    pub invocation: ControllerToggle,
    pub workflow: ControllerToggle,
    #[serde(with = "duration_millis")]
    pub tick: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            invocation: ControllerToggle::default(),
            workflow: ControllerToggle::default(),
            tick: MIN_TICK,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExprConfig {
    #[serde(with = "duration_millis")]
    pub timeout: Duration,
}

impl Default for ExprConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_EXPR_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub event_store: EventStoreConfig,
    pub runtimes: RuntimesConfig,
    pub controller: ControllerConfig,
    pub expr: ExprConfig,
}

impl EngineConfig {
    /// Layers environment variables over the defaults. Honors
    /// `FNFLOW_CONTROLLER_TICK_MS`, `FNFLOW_EXPR_TIMEOUT_MS`,
    /// `FNFLOW_CONTROLLER_INVOCATION_ENABLED`, and
    /// `FNFLOW_CONTROLLER_WORKFLOW_ENABLED`; a `.env` file in the working
    /// directory is loaded first if present, matching the teacher's use of
    /// `dotenvy`.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        let mut config = Self::default();

        if let Some(ms) = env_u64("FNFLOW_CONTROLLER_TICK_MS") {
            config.controller.tick = Duration::from_millis(ms).max(MIN_TICK);
        }
        if let Some(ms) = env_u64("FNFLOW_EXPR_TIMEOUT_MS") {
            config.expr.timeout = Duration::from_millis(ms);
        }
        if let Some(enabled) = env_bool("FNFLOW_CONTROLLER_INVOCATION_ENABLED") {
            config.controller.invocation.enabled = enabled;
        }
        if let Some(enabled) = env_bool("FNFLOW_CONTROLLER_WORKFLOW_ENABLED") {
            config.controller.workflow.enabled = enabled;
        }

        config
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_bool(key: &str) -> Option<bool> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
