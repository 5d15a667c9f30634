//! Layered settings: struct defaults, then an optional file, then `PSO__*`
//! environment variables (`__` separates nested keys, e.g.
//! `PSO__SWARM__PARTICLES=12`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use pso_resilience::RetryPolicy;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::coefficients::PsoCoefficients;
use crate::driver::DriverConfig;
use crate::error::ConfigError;
use crate::space::{ParameterRange, ParameterSpace};

pub const ENV_PREFIX: &str = "PSO";
pub const CONFIG_FILE_VAR: &str = "PSO_CONFIG_FILE";

/// One parameter axis. Either an explicit `values` list or a `min..=max` grid
/// with `step` (default 1).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub name: String,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
    #[serde(default)]
    pub step: Option<f64>,
    #[serde(default)]
    pub values: Option<Vec<f64>>,
}

impl ParameterSpec {
    pub fn grid(name: &str, min: f64, max: f64, step: f64) -> Self {
        Self { name: name.to_string(), min: Some(min), max: Some(max), step: Some(step), values: None }
    }

    pub fn range(&self) -> Result<ParameterRange, ConfigError> {
        let wrap = |e: ConfigError| ConfigError::Parameter { name: self.name.clone(), reason: e.to_string() };
        if let Some(values) = &self.values {
            return ParameterRange::from_values(values.iter().copied()).map_err(wrap);
        }
        match (self.min, self.max) {
            (Some(min), Some(max)) => ParameterRange::stepped(min, max, self.step.unwrap_or(1.0)).map_err(wrap),
            _ => Err(ConfigError::Parameter { name: self.name.clone(), reason: "needs either `values` or both `min` and `max`".into() }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SwarmSettings {
    pub parameters: Vec<ParameterSpec>,
    pub particles: usize,
    pub target_epochs: u64,
    pub worker_capacity: usize,
    pub replications: usize,
    pub coefficients: PsoCoefficients,
    pub retry: RetryPolicy,
    pub seed: Option<u64>,
    pub initial_stagger_ms: u64,
    /// Live cache location; defaults to `<scratch>/pso_cache`.
    pub cache_dir: Option<PathBuf>,
    pub output_dir: PathBuf,
    pub resume_from: Vec<PathBuf>,
    pub log_level: String,
}

impl Default for SwarmSettings {
    fn default() -> Self {
        Self {
            parameters: vec![ParameterSpec::grid("X", -100.0, 100.0, 1.0), ParameterSpec::grid("Y", -200.0, 200.0, 2.0)],
            particles: 30,
            target_epochs: 100,
            worker_capacity: std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
            replications: 20,
            coefficients: PsoCoefficients::default(),
            retry: RetryPolicy::default(),
            seed: None,
            initial_stagger_ms: 0,
            cache_dir: None,
            output_dir: PathBuf::from("output"),
            resume_from: Vec::new(),
            log_level: "info".into(),
        }
    }
}

impl SwarmSettings {
    pub fn space(&self) -> Result<ParameterSpace, ConfigError> {
        let mut ranges = Vec::with_capacity(self.parameters.len());
        for spec in &self.parameters {
            if ranges.iter().any(|(name, _): &(String, ParameterRange)| name == &spec.name) {
                return Err(ConfigError::Parameter { name: spec.name.clone(), reason: "defined twice".into() });
            }
            ranges.push((spec.name.clone(), spec.range()?));
        }
        ParameterSpace::new(ranges)
    }

    pub fn driver_config(&self) -> DriverConfig {
        DriverConfig {
            particles: self.particles,
            target_epochs: self.target_epochs,
            worker_capacity: self.worker_capacity,
            replications: self.replications,
            coefficients: self.coefficients.clone(),
            retry: self.retry.clone(),
            initial_stagger: Duration::from_millis(self.initial_stagger_ms),
            seed: self.seed,
            resume_from: self.resume_from.clone(),
        }
    }

    pub fn live_cache_dir(&self) -> PathBuf {
        self.cache_dir.clone().unwrap_or_else(|| resolve_scratch_dir(&self.output_dir).join("pso_cache"))
    }

    /// Where the live cache is consolidated at the end of a run.
    pub fn consolidated_cache_dir(&self) -> PathBuf { self.output_dir.join("training_scores") }
}

/// Defaults, then `file` (if given and present), then `PSO__*` env vars.
pub fn load_settings<T: DeserializeOwned>(file: Option<&Path>) -> Result<T, ConfigError> {
    let mut builder = config::Config::builder();
    if let Some(file) = file {
        builder = builder.add_source(config::File::from(file).required(false));
    }
    builder = builder.add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__").try_parsing(true));
    Ok(builder.build()?.try_deserialize()?)
}

/// [`load_settings`] with the file named by `PSO_CONFIG_FILE`.
pub fn load_settings_from_env<T: DeserializeOwned>() -> Result<T, ConfigError> {
    let file = std::env::var(CONFIG_FILE_VAR).ok().map(PathBuf::from);
    load_settings(file.as_deref())
}

/// `$SLURM_TMPDIR`, else `$HOME/scratch` when it exists, else `output_dir`.
pub fn resolve_scratch_dir(output_dir: &Path) -> PathBuf {
    scratch_dir_from(std::env::var_os("SLURM_TMPDIR").map(PathBuf::from), std::env::var_os("HOME").map(PathBuf::from), output_dir)
}

fn scratch_dir_from(slurm_tmp: Option<PathBuf>, home: Option<PathBuf>, output_dir: &Path) -> PathBuf {
    if let Some(tmp) = slurm_tmp.filter(|p| !p.as_os_str().is_empty()) { return tmp; }
    if let Some(scratch) = home.map(|h| h.join("scratch")).filter(|p| p.is_dir()) { return scratch; }
    output_dir.to_path_buf()
}
