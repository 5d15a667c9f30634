use pso_resilience::PolicyError;
use thiserror::Error;

/// Fatal misconfiguration, surfaced before anything is dispatched.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cognitive + social must exceed 4 for a real constriction coefficient (got {theta})")]
    Theta { theta: f64 },

    #[error("PSO coefficient `{name}` must be finite (got {value})")]
    NonFiniteCoefficient { name: &'static str, value: f64 },

    #[error("parameter space has no parameters")]
    EmptySpace,

    #[error("parameter has no legal values")]
    EmptyRange,

    #[error("invalid parameter grid: {0}")]
    InvalidRange(String),

    #[error("parameter `{name}`: {reason}")]
    Parameter { name: String, reason: String },

    #[error("worker capacity must be at least 1")]
    ZeroWorkers,

    #[error("swarm needs at least one particle")]
    ZeroParticles,

    #[error("replication factor must be at least 1")]
    ZeroReplications,

    #[error("target epoch count must be at least 1")]
    ZeroEpochs,

    #[error("retry policy: {0}")]
    Retry(#[from] PolicyError),

    #[error("settings: {0}")]
    Load(#[from] config::ConfigError),
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("result store: {0}")]
    Store(#[from] sled::Error),

    #[error("result row codec: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Why a single evaluation job did not produce a score. Never fatal to a run.
#[derive(Debug, Error)]
pub enum EvaluationError {
    #[error("workload failed: {0}")]
    Workload(String),

    #[error("workload returned a non-finite score ({0})")]
    NonFiniteScore(f64),

    #[error("evaluation task panicked: {0}")]
    Panicked(String),

    #[error(transparent)]
    Cache(#[from] CacheError),
}

#[derive(Debug, Error)]
pub enum DriverError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("all {particles} particles exhausted their failure budget")]
    SwarmExhausted { particles: usize },

    #[error("executor: {0}")]
    Executor(String),
}
