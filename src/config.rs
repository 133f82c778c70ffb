//! Run configuration as handed over by the invoking layer.
//!
//! Parsing the operator-facing config file stays outside the engine; this
//! module defines the validated shape the engine consumes and the checks
//! that reject a bad run before any terminal starts.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::error::DriverError;
use crate::phase::{Phase, Rate, TransactionType};
use crate::session::{Dialect, IsolationLevel};

/// One phase as configured: weights are positional, index = transaction
/// type id within the benchmark's transaction table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseSpec {
    pub weights: Vec<u32>,
    /// Terminals active during this phase; all of them when omitted.
    #[serde(default)]
    pub active_terminals: Option<usize>,
    pub rate: Rate,
    pub duration: Duration,
}

/// Everything one benchmark run needs.
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder)]
pub struct DriverConfig {
    #[builder(setter(into))]
    pub benchmark: String,
    pub dialect: Dialect,
    #[builder(setter(into))]
    pub url: String,
    #[builder(default, setter(into))]
    #[serde(default)]
    pub username: String,
    #[builder(default, setter(into))]
    #[serde(default)]
    pub password: String,
    #[builder(default)]
    #[serde(default)]
    pub isolation: IsolationLevel,
    #[builder(default = num_cpus::get())]
    pub terminals: usize,
    /// Warmup before measurement starts; zero skips it.
    #[builder(default = Duration::ZERO)]
    #[serde(default)]
    pub warmup: Duration,
    pub phases: Vec<PhaseSpec>,
    #[builder(default)]
    #[serde(default)]
    pub trace_path: Option<PathBuf>,
    /// Raw sample stream destination; no file when omitted.
    #[builder(default)]
    #[serde(default)]
    pub sample_path: Option<PathBuf>,
    /// Rate governor tick.
    #[builder(default = Duration::from_millis(100))]
    #[serde(default = "default_tick")]
    pub tick: Duration,
}

fn default_tick() -> Duration {
    Duration::from_millis(100)
}

impl DriverConfig {
    /// Reject configurations the engine cannot run. Called before any
    /// terminal is spawned; a failure here maps to a non-zero exit.
    pub fn validate(&self) -> Result<(), DriverError> {
        if self.benchmark.is_empty() {
            return Err(DriverError::Config("benchmark name is empty".into()));
        }
        if self.terminals == 0 {
            return Err(DriverError::Config("at least one terminal is required".into()));
        }
        if self.phases.is_empty() {
            return Err(DriverError::Config("at least one phase is required".into()));
        }
        if self.tick.is_zero() {
            return Err(DriverError::Config("governor tick must be positive".into()));
        }
        for (index, spec) in self.phases.iter().enumerate() {
            let label = index + 1;
            if spec.duration.is_zero() {
                return Err(DriverError::Config(format!(
                    "phase {label}: duration must be positive"
                )));
            }
            if let Some(active) = spec.active_terminals {
                if active > self.terminals {
                    return Err(DriverError::Config(format!(
                        "phase {label}: {active} active terminals but only {} configured",
                        self.terminals
                    )));
                }
                if active == 0 && !matches!(spec.rate, Rate::Disabled) {
                    return Err(DriverError::Config(format!(
                        "phase {label}: zero active terminals in an enabled phase"
                    )));
                }
            }
            match spec.rate {
                Rate::Disabled => {}
                Rate::Limited { per_second } => {
                    if !per_second.is_finite() || per_second <= 0.0 {
                        return Err(DriverError::Config(format!(
                            "phase {label}: target rate must be positive and finite"
                        )));
                    }
                    self.check_weights(spec, label)?;
                }
                Rate::Serial | Rate::Unlimited => self.check_weights(spec, label)?,
            }
        }
        Ok(())
    }

    fn check_weights(&self, spec: &PhaseSpec, label: usize) -> Result<(), DriverError> {
        if spec.weights.iter().all(|w| *w == 0) {
            return Err(DriverError::Config(format!(
                "phase {label}: the transaction mix has no weight"
            )));
        }
        Ok(())
    }

    /// Materialize the phase schedule. Assumes [`validate`](Self::validate)
    /// passed.
    pub fn build_phases(&self) -> Vec<Arc<Phase>> {
        self.phases
            .iter()
            .enumerate()
            .map(|(index, spec)| {
                let mix = spec
                    .weights
                    .iter()
                    .enumerate()
                    .map(|(txn, weight)| (TransactionType(txn), *weight))
                    .collect();
                Arc::new(Phase::new(
                    index + 1,
                    mix,
                    spec.active_terminals.unwrap_or(self.terminals),
                    spec.rate,
                    spec.duration,
                ))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> DriverConfig {
        DriverConfig::builder()
            .benchmark("tpcc")
            .dialect(Dialect::MySql)
            .url("mysql://localhost:3306/tpcc")
            .terminals(4)
            .phases(vec![PhaseSpec {
                weights: vec![45, 43, 4, 4, 4],
                active_terminals: None,
                rate: Rate::Limited { per_second: 100.0 },
                duration: Duration::from_secs(60),
            }])
            .build()
    }

    #[test]
    fn a_sound_config_validates() {
        let config = base();
        config.validate().expect("valid config");
        let phases = config.build_phases();
        assert_eq!(phases.len(), 1);
        assert_eq!(phases[0].id, 1);
        assert_eq!(phases[0].active_terminals, 4);
        assert_eq!(phases[0].mix.len(), 5);
    }

    #[test]
    fn zero_weights_are_rejected() {
        let mut config = base();
        config.phases[0].weights = vec![0, 0];
        let err = config.validate().expect_err("must reject");
        assert!(err.to_string().contains("no weight"), "{err}");
    }

    #[test]
    fn too_many_active_terminals_are_rejected() {
        let mut config = base();
        config.phases[0].active_terminals = Some(9);
        assert!(config.validate().is_err());
    }

    #[test]
    fn non_positive_rates_are_rejected() {
        let mut config = base();
        config.phases[0].rate = Rate::Limited { per_second: 0.0 };
        assert!(config.validate().is_err());
        config.phases[0].rate = Rate::Limited {
            per_second: f64::NAN,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn disabled_phases_need_no_mix() {
        let mut config = base();
        config.phases[0].weights = vec![0];
        config.phases[0].rate = Rate::Disabled;
        config.validate().expect("disabled phase without weights");
    }

    #[test]
    fn empty_schedule_is_rejected() {
        let mut config = base();
        config.phases.clear();
        assert!(config.validate().is_err());
    }
}
