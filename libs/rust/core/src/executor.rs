//! In-process task executor: each evaluation job runs as a tokio task in a
//! `JoinSet`; the driver suspends on `wait_any` until at least one finishes.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio::task::JoinSet;

use crate::cache::ResultCache;
use crate::error::{DriverError, EvaluationError};
use crate::evaluator::{EvaluationFailure, EvaluationResult, Evaluator, JobOutcome};
use crate::particle::Particle;
use crate::telemetry::DRIVER_METRICS;

/// A snapshot of one particle to score at `epoch`, started after `delay`.
#[derive(Debug, Clone)]
pub struct EvaluationJob {
    pub particle: Particle,
    pub epoch: u64,
    pub delay: Duration,
}

pub struct TaskExecutor<E: ?Sized> {
    evaluator: Arc<E>,
    cache: ResultCache,
    jobs: JoinSet<JobOutcome>,
}

impl<E: Evaluator + ?Sized> TaskExecutor<E> {
    pub fn new(evaluator: Arc<E>, cache: ResultCache) -> Self {
        Self { evaluator, cache, jobs: JoinSet::new() }
    }

    pub fn submit(&mut self, job: EvaluationJob) {
        self.jobs.spawn(run_job(job, self.cache.clone(), self.evaluator.clone()));
    }

    pub fn in_flight(&self) -> usize { self.jobs.len() }

    /// Completed jobs, at least one unless nothing is in flight. Order is
    /// completion order, which callers must not rely on.
    pub async fn wait_any(&mut self) -> Result<Vec<JobOutcome>, DriverError> {
        let Some(first) = self.jobs.join_next().await else { return Ok(Vec::new()) };
        let mut done = vec![first.map_err(|e| DriverError::Executor(e.to_string()))?];
        while let Some(Some(next)) = self.jobs.join_next().now_or_never() {
            done.push(next.map_err(|e| DriverError::Executor(e.to_string()))?);
        }
        Ok(done)
    }
}

async fn run_job<E: Evaluator + ?Sized>(job: EvaluationJob, cache: ResultCache, evaluator: Arc<E>) -> JobOutcome {
    let EvaluationJob { mut particle, epoch, delay } = job;
    if !delay.is_zero() { tokio::time::sleep(delay).await; }
    let particle_id = particle.id();
    let started = Instant::now();
    let scored = AssertUnwindSafe(particle.score_current_position(epoch, &cache, evaluator.as_ref()))
        .catch_unwind()
        .await;
    DRIVER_METRICS.job_latency_ms.record(started.elapsed().as_secs_f64() * 1000.0, &[]);
    match scored {
        Ok(Ok(report)) => Ok(EvaluationResult {
            particle_id,
            epoch,
            score: report.score,
            best_score: report.best_score,
            best_position: report.best_position,
            position: particle.position().clone(),
            velocity: report.velocity,
            source: report.source,
        }),
        Ok(Err(cause)) => Err(EvaluationFailure { particle_id, epoch, cause }),
        Err(panic) => Err(EvaluationFailure { particle_id, epoch, cause: EvaluationError::Panicked(panic_message(panic)) }),
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() { return s.to_string(); }
    if let Some(s) = panic.downcast_ref::<String>() { return s.clone(); }
    "non-string panic payload".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::Position;
    use crate::evaluator::{FnEvaluator, ScoreSource};
    use crate::space::{ParameterRange, ParameterSpace};
    use rand::{rngs::StdRng, SeedableRng};

    fn particle(id: usize, rng: &mut StdRng) -> Particle {
        let space = Arc::new(ParameterSpace::new([("X", ParameterRange::stepped(-10.0, 10.0, 1.0).unwrap())]).unwrap());
        Particle::new(id, space, rng)
    }

    #[tokio::test]
    async fn wait_any_collects_results_and_failures() {
        let eval = Arc::new(FnEvaluator::new(|p: Position| async move {
            if p["X"] < 0.0 { Err(EvaluationError::Workload("negative".into())) } else { Ok(p["X"]) }
        }));
        let mut exec = TaskExecutor::new(eval, ResultCache::temporary().unwrap());
        let mut rng = StdRng::seed_from_u64(4);
        for id in 0..6 {
            exec.submit(EvaluationJob { particle: particle(id, &mut rng), epoch: 0, delay: Duration::ZERO });
        }
        assert_eq!(exec.in_flight(), 6);
        let mut seen = 0;
        while exec.in_flight() > 0 {
            let batch = exec.wait_any().await.unwrap();
            assert!(!batch.is_empty());
            for outcome in batch {
                match outcome {
                    Ok(r) => { assert!(r.score >= 0.0); assert_ne!(r.source, ScoreSource::AlreadyScored); }
                    Err(f) => assert!(matches!(f.cause, EvaluationError::Workload(_))),
                }
                seen += 1;
            }
        }
        assert_eq!(seen, 6);
        assert!(exec.wait_any().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn panicking_workload_becomes_failure() {
        let eval = Arc::new(FnEvaluator::new(|_p: Position| async move {
            if true { panic!("simulation blew up"); }
            Ok(0.0)
        }));
        let mut exec = TaskExecutor::new(eval, ResultCache::temporary().unwrap());
        let mut rng = StdRng::seed_from_u64(4);
        exec.submit(EvaluationJob { particle: particle(3, &mut rng), epoch: 2, delay: Duration::from_millis(1) });
        let outcome = exec.wait_any().await.unwrap().pop().unwrap();
        let failure = outcome.unwrap_err();
        assert_eq!((failure.particle_id, failure.epoch), (3, 2));
        match failure.cause {
            EvaluationError::Panicked(msg) => assert!(msg.contains("blew up")),
            other => panic!("unexpected cause {other:?}"),
        }
    }
}
