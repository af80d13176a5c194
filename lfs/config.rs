//! Run configuration, stored as TOML.

use crate::engine::EngineOptions;
use crate::types::{SolverKind, WeightBackend};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::ops::RangeInclusive;
use std::path::Path;
use thiserror::Error;

const MAX_KEPT_RANGE: RangeInclusive<usize> = 1..=100;
const ITERATIONS_RANGE: RangeInclusive<usize> = 1..=10;
const N_RAND_RANGE: RangeInclusive<usize> = 100..=10_000;
const N_BETA_RANGE: RangeInclusive<usize> = 5..=100;
const MAX_THREADS_RANGE: RangeInclusive<usize> = 1..=64;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read or write config file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML config file: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize config to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("'{field}' is {value}, but must lie in {min}..={max}.")]
    OutOfRange {
        field: &'static str,
        value: usize,
        min: usize,
        max: usize,
    },
}

/// Every knob of a run. Missing keys take their default.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LfsConfig {
    /// Upper bound on the variables selected per case.
    pub max_kept: usize,
    pub max_threads: usize,
    pub iterations: usize,
    /// Accepted Monte-Carlo samples per β trial.
    pub n_rand: usize,
    /// Number of β trials per case.
    pub n_beta: usize,
    pub solver: SolverKind,
    pub weights: WeightBackend,
    /// One worker, CPU weights, reproducible selections.
    pub deterministic: bool,
    pub verbose: bool,
}

impl Default for LfsConfig {
    fn default() -> Self {
        Self {
            max_kept: 3,
            max_threads: num_cpus::get().clamp(*MAX_THREADS_RANGE.start(), *MAX_THREADS_RANGE.end()),
            iterations: 3,
            n_rand: 500,
            n_beta: 20,
            solver: SolverKind::default(),
            weights: WeightBackend::default(),
            deterministic: false,
            verbose: false,
        }
    }
}

fn check_range(
    field: &'static str,
    value: usize,
    range: &RangeInclusive<usize>,
) -> Result<(), ConfigError> {
    if range.contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange {
            field,
            value,
            min: *range.start(),
            max: *range.end(),
        })
    }
}

impl LfsConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_range("max_kept", self.max_kept, &MAX_KEPT_RANGE)?;
        check_range("max_threads", self.max_threads, &MAX_THREADS_RANGE)?;
        check_range("iterations", self.iterations, &ITERATIONS_RANGE)?;
        check_range("n_rand", self.n_rand, &N_RAND_RANGE)?;
        check_range("n_beta", self.n_beta, &N_BETA_RANGE)?;
        Ok(())
    }

    /// The construction-time subset handed to [`crate::Lfs::with_options`].
    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            max_kept: self.max_kept,
            max_threads: self.max_threads,
            verbose: self.verbose,
            solver: self.solver,
            weights: self.weights,
            deterministic: self.deterministic,
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    /// Reads and validates a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let toml_string = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&toml_string)?;
        config.validate()?;
        Ok(config)
    }
}
