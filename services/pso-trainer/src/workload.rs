//! Training workload: a simulation scored over `scenarios x replications`
//! sub-runs that all draw from one shared worker budget.

use std::f64::consts::{E, PI};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pso_core::{EvaluationError, Evaluator, Position, SwarmSettings};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::debug;

/// Ackley function; global minimum 0 at the origin.
pub fn ackley(x: f64, y: f64) -> f64 {
    -20.0 * (-0.2 * (0.5 * (x * x + y * y)).sqrt()).exp()
        - (0.5 * ((2.0 * PI * x).cos() + (2.0 * PI * y).cos())).exp()
        + E
        + 20.0
}

/// One sub-run of an evaluation. Lower is better.
pub trait Simulation: Send + Sync + 'static {
    fn run(&self, position: &Position, scenario: usize, replication: usize) -> Result<f64, EvaluationError>;
}

#[derive(Debug, Clone)]
pub struct AckleyObjective {
    pub x_param: String,
    pub y_param: String,
    /// Positions are divided by this before scoring.
    pub scale: f64,
}

impl AckleyObjective {
    pub fn new(x_param: &str, y_param: &str, scale: f64) -> Self {
        Self { x_param: x_param.to_string(), y_param: y_param.to_string(), scale }
    }

    fn coordinate(&self, position: &Position, name: &str) -> Result<f64, EvaluationError> {
        position
            .get(name)
            .map(|v| v / self.scale)
            .ok_or_else(|| EvaluationError::Workload(format!("position has no parameter `{name}`")))
    }
}

impl Simulation for AckleyObjective {
    fn run(&self, position: &Position, _scenario: usize, _replication: usize) -> Result<f64, EvaluationError> {
        let x = self.coordinate(position, &self.x_param)?;
        let y = self.coordinate(position, &self.y_param)?;
        Ok(ackley(x, y))
    }
}

/// Scores a position as the mean over every (scenario, replication) sub-run.
/// Each sub-run holds one permit of `budget` while it works.
pub struct ReplicatedEvaluator<S> {
    simulation: Arc<S>,
    scenarios: usize,
    replications: usize,
    budget: Arc<Semaphore>,
    simulated_work: Duration,
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl<S: Simulation> ReplicatedEvaluator<S> {
    pub fn new(simulation: S, scenarios: usize, replications: usize, budget: Arc<Semaphore>, simulated_work: Duration) -> Self {
        Self {
            simulation: Arc::new(simulation),
            scenarios: scenarios.max(1),
            replications: replications.max(1),
            budget,
            simulated_work,
            active: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Highest number of sub-runs observed working at once.
    pub fn peak_concurrency(&self) -> usize { self.peak.load(Ordering::SeqCst) }
}

#[async_trait]
impl<S: Simulation> Evaluator for ReplicatedEvaluator<S> {
    async fn evaluate(&self, position: &Position) -> Result<f64, EvaluationError> {
        let mut runs = JoinSet::new();
        for scenario in 0..self.scenarios {
            for replication in 0..self.replications {
                let simulation = self.simulation.clone();
                let budget = self.budget.clone();
                let active = self.active.clone();
                let peak = self.peak.clone();
                let position = position.clone();
                let work = self.simulated_work;
                runs.spawn(async move {
                    let _permit = budget.acquire_owned().await.map_err(|_| EvaluationError::Workload("worker budget closed".into()))?;
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    if !work.is_zero() { tokio::time::sleep(work).await; }
                    let score = simulation.run(&position, scenario, replication);
                    active.fetch_sub(1, Ordering::SeqCst);
                    score
                });
            }
        }
        let mut total = 0.0;
        let mut count = 0usize;
        while let Some(joined) = runs.join_next().await {
            let score = joined.map_err(|e| EvaluationError::Workload(format!("sub-run aborted: {e}")))??;
            total += score;
            count += 1;
        }
        let mean = total / count as f64;
        debug!(runs = count, mean, "replicated_evaluation_done");
        Ok(mean)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkloadSettings {
    pub scenarios: usize,
    pub x_param: String,
    pub y_param: String,
    pub objective_scale: f64,
    pub simulated_work_ms: u64,
}

impl Default for WorkloadSettings {
    fn default() -> Self {
        Self { scenarios: 20, x_param: "X".into(), y_param: "Y".into(), objective_scale: 1.0, simulated_work_ms: 0 }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerSettings {
    pub swarm: SwarmSettings,
    pub workload: WorkloadSettings,
}

impl TrainerSettings {
    /// Evaluator drawing from a budget of `worker_capacity` permits.
    pub fn evaluator(&self) -> ReplicatedEvaluator<AckleyObjective> {
        ReplicatedEvaluator::new(
            AckleyObjective::new(&self.workload.x_param, &self.workload.y_param, self.workload.objective_scale),
            self.workload.scenarios,
            self.swarm.replications,
            Arc::new(Semaphore::new(self.swarm.worker_capacity.max(1))),
            Duration::from_millis(self.workload.simulated_work_ms),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(x: f64, y: f64) -> Position {
        [("X".to_string(), x), ("Y".to_string(), y)].into_iter().collect()
    }

    #[test]
    fn ackley_minimum_at_origin() {
        assert!(ackley(0.0, 0.0).abs() < 1e-12);
        // -20 e^(-0.2/sqrt 2) + 20
        assert!((ackley(1.0, 0.0) - 2.6375).abs() < 1e-3);
        assert!(ackley(-30.0, 12.0) > ackley(0.5, 0.5));
    }

    #[test]
    fn objective_scales_and_requires_params() {
        let obj = AckleyObjective::new("X", "Y", 10.0);
        assert!((obj.run(&at(10.0, 0.0), 0, 0).unwrap() - ackley(1.0, 0.0)).abs() < 1e-12);
        let missing: Position = [("X".to_string(), 1.0)].into_iter().collect();
        assert!(matches!(obj.run(&missing, 0, 0), Err(EvaluationError::Workload(_))));
    }

    #[tokio::test]
    async fn replicated_mean_over_all_subruns() {
        let budget = Arc::new(Semaphore::new(3));
        let eval = ReplicatedEvaluator::new(AckleyObjective::new("X", "Y", 1.0), 4, 5, budget, Duration::ZERO);
        let score = eval.evaluate(&at(2.0, -1.0)).await.unwrap();
        assert!((score - ackley(2.0, -1.0)).abs() < 1e-9);
        assert!(eval.peak_concurrency() <= 3);
    }

    #[test]
    fn trainer_settings_defaults() {
        let s = TrainerSettings::default();
        assert_eq!(s.workload.scenarios, 20);
        assert_eq!(s.swarm.replications, 20);
        assert_eq!(s.evaluator().replications, 20);
    }
}
