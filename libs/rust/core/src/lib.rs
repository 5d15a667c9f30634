//! Core of the PSO trainer: discretized parameter space, memoizing result
//! cache, particles, and the swarm driver that keeps a bounded number of
//! evaluation jobs in flight.

use anyhow::Result;
use once_cell::sync::OnceCell;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod cache;
pub mod canonical;
pub mod coefficients;
pub mod driver;
pub mod error;
pub mod evaluator;
pub mod executor;
pub mod particle;
pub mod settings;
pub mod space;
mod telemetry;

pub use cache::{CacheEntry, KeyGuard, ParticleProgress, ResultCache};
pub use canonical::{canonical_key, decode_key, Position, Velocity};
pub use coefficients::PsoCoefficients;
pub use driver::{DispatchState, DriverConfig, GlobalBest, ParticleSlot, ParticleSummary, RunCounters, RunReport, SwarmDriver};
pub use error::{CacheError, ConfigError, DriverError, EvaluationError};
pub use evaluator::{EvaluationFailure, EvaluationResult, Evaluator, FnEvaluator, JobOutcome, ScoreSource};
pub use executor::{EvaluationJob, TaskExecutor};
pub use particle::{Particle, ScoreReport};
pub use settings::{load_settings, load_settings_from_env, resolve_scratch_dir, ParameterSpec, SwarmSettings};
pub use space::{ParameterRange, ParameterSpace, Placement};
pub use telemetry::{DriverMetrics, DRIVER_METRICS};

pub use pso_resilience::{Decision, RetryPolicy};

static TRACING_INIT: OnceCell<()> = OnceCell::new();

/// Install the global subscriber once. `RUST_LOG` wins over `default_level`;
/// `PSO_JSON_LOG=1|true` switches to JSON lines.
pub fn init_tracing(service: &str, default_level: &str) -> Result<()> {
    TRACING_INIT.get_or_try_init(|| -> Result<()> {
        let json = std::env::var("PSO_JSON_LOG").ok().map(|v| v == "1" || v.eq_ignore_ascii_case("true")).unwrap_or(false);
        let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(default_level))?;
        let json_layer = json.then(|| {
            tracing_subscriber::fmt::layer()
                .json()
                .flatten_event(true)
                .with_current_span(true)
                .with_span_list(false)
        });
        let text_layer = (!json).then(|| {
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_line_number(true)
        });
        tracing_subscriber::registry().with(env_filter).with(json_layer).with(text_layer).try_init()?;
        Ok(())
    })?;
    info!(target: "pso_core", service, "tracing initialized");
    Ok(())
}
