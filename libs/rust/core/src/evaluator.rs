//! The workload seam. A driver only ever talks to an [`Evaluator`]; what it
//! does with a position (a closed-form function, a simulation fan-out, a
//! remote call) is up to the implementor.

use std::future::Future;

use async_trait::async_trait;
use serde::Serialize;

use crate::canonical::{Position, Velocity};
use crate::error::EvaluationError;

#[async_trait]
pub trait Evaluator: Send + Sync + 'static {
    /// Score one position. Lower is better. Must be finite.
    async fn evaluate(&self, position: &Position) -> Result<f64, EvaluationError>;
}

/// Wraps an async closure as an [`Evaluator`].
pub struct FnEvaluator<F> {
    f: F,
}

impl<F> FnEvaluator<F> {
    pub fn new(f: F) -> Self { Self { f } }
}

#[async_trait]
impl<F, Fut> Evaluator for FnEvaluator<F>
where
    F: Fn(Position) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<f64, EvaluationError>> + Send,
{
    async fn evaluate(&self, position: &Position) -> Result<f64, EvaluationError> {
        (self.f)(position.clone()).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreSource {
    /// The particle had already scored this position; nothing was read or run.
    AlreadyScored,
    Cache,
    Evaluated,
}

/// What a finished job hands back to the driver.
#[derive(Debug, Clone)]
pub struct EvaluationResult {
    pub particle_id: usize,
    pub epoch: u64,
    pub score: f64,
    /// Personal best of the scored snapshot, folded back with [`crate::Particle::complete_evaluation`].
    pub best_score: f64,
    pub best_position: Position,
    pub position: Position,
    pub velocity: Velocity,
    pub source: ScoreSource,
}

#[derive(Debug)]
pub struct EvaluationFailure {
    pub particle_id: usize,
    pub epoch: u64,
    pub cause: EvaluationError,
}

pub type JobOutcome = Result<EvaluationResult, EvaluationFailure>;
