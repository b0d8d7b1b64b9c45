//! Engine-wide configuration.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use engine_component::IdStrategy;
use engine_entity::RegistryConfig;

use crate::coordinator::CoordinatorConfig;
use crate::error::ConfigError;
use crate::pipeline::StageConfig;
use crate::scheduler::SchedulerConfig;

/// Overrides [`SchedulerConfig::tick_rate`].
pub const TICK_RATE_ENV: &str = "ENGINE_TICK_RATE";
/// Overrides [`RegistryConfig::id_strategy`].
pub const ID_STRATEGY_ENV: &str = "ENGINE_ID_STRATEGY";
/// Overrides [`RegistryConfig::gc_retention`], in seconds.
pub const GC_RETENTION_ENV: &str = "ENGINE_GC_RETENTION_SECS";

/// Every configurable part of the engine.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineConfig {
    pub registry: RegistryConfig,
    pub scheduler: SchedulerConfig,
    pub coordinator: CoordinatorConfig,
    /// Defaults for new pipeline stages.
    pub stage: StageConfig,
    /// Directory for file snapshots; `None` disables file saves.
    pub backup_dir: Option<PathBuf>,
}

fn parse<T>(var: &'static str, value: String) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|err: T::Err| ConfigError::InvalidValue {
            var,
            reason: err.to_string(),
            value,
        })
}

impl EngineConfig {
    /// Defaults with overrides from `ENGINE_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] if a variable is set but cannot
    /// be parsed.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_overrides(|var| std::env::var(var).ok())
    }

    /// Apply overrides looked up through `lookup`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] for unparsable values.
    pub fn with_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(value) = lookup(TICK_RATE_ENV) {
            let rate: f64 = parse(TICK_RATE_ENV, value.clone())?;
            if !(rate.is_finite() && rate > 0.0) {
                return Err(ConfigError::InvalidValue {
                    var: TICK_RATE_ENV,
                    value,
                    reason: "tick rate must be positive".to_string(),
                });
            }
            self.scheduler.tick_rate = rate;
        }
        if let Some(value) = lookup(ID_STRATEGY_ENV) {
            let strategy: IdStrategy = parse(ID_STRATEGY_ENV, value)?;
            self.registry = self.registry.with_id_strategy(strategy);
        }
        if let Some(value) = lookup(GC_RETENTION_ENV) {
            let secs: u64 = parse(GC_RETENTION_ENV, value)?;
            self.registry = self.registry.with_gc_retention(Duration::from_secs(secs));
        }
        Ok(self)
    }

    #[must_use]
    pub fn with_backup_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.backup_dir = Some(dir.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn make_lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_overrides_apply() {
        let config = EngineConfig::default()
            .with_overrides(make_lookup(&[
                (TICK_RATE_ENV, "30"),
                (ID_STRATEGY_ENV, "time-ordered"),
                (GC_RETENTION_ENV, "5"),
            ]))
            .unwrap();
        assert_eq!(config.scheduler.tick_rate, 30.0);
        assert_eq!(config.registry.id_strategy, IdStrategy::TimeOrdered);
        assert_eq!(config.registry.gc_retention, Duration::from_secs(5));
    }

    #[test]
    fn test_no_overrides_keeps_defaults() {
        let config = EngineConfig::default()
            .with_overrides(make_lookup(&[]))
            .unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn test_invalid_override() {
        for (var, value) in [
            (TICK_RATE_ENV, "fast"),
            (TICK_RATE_ENV, "-1"),
            (ID_STRATEGY_ENV, "dice"),
        ] {
            let result = EngineConfig::default().with_overrides(make_lookup(&[(var, value)]));
            assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
        }
    }
}
