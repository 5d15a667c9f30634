//! One candidate solution: position, velocity, personal best.
//!
//! A particle is mutated only through its own methods. The driver hands a
//! snapshot clone to an evaluation job and folds the job's result back into
//! the owned particle with [`Particle::complete_evaluation`].

use std::sync::Arc;

use rand::Rng;
use tracing::trace;

use crate::cache::{CacheEntry, ParticleProgress, ResultCache};
use crate::canonical::{canonical_key, Position, Velocity};
use crate::coefficients::PsoCoefficients;
use crate::error::EvaluationError;
use crate::evaluator::{EvaluationResult, Evaluator, ScoreSource};
use crate::space::ParameterSpace;

#[derive(Debug, Clone, PartialEq)]
pub struct ScoreReport {
    /// Raw score of the current position.
    pub score: f64,
    pub best_score: f64,
    pub best_position: Position,
    pub velocity: Velocity,
    pub source: ScoreSource,
}

#[derive(Debug, Clone)]
pub struct Particle {
    id: usize,
    space: Arc<ParameterSpace>,
    position: Position,
    velocity: Velocity,
    best_position: Position,
    best_velocity: Velocity,
    best_score: f64,
    last_score: Option<f64>,
    scored: bool,
}

impl Particle {
    pub fn new<R: Rng>(id: usize, space: Arc<ParameterSpace>, rng: &mut R) -> Self {
        let position = space.random_position(rng);
        let velocity = space.zero_velocity();
        Self {
            id,
            best_position: position.clone(),
            best_velocity: velocity.clone(),
            position,
            velocity,
            space,
            best_score: f64::INFINITY,
            last_score: None,
            scored: false,
        }
    }

    pub fn id(&self) -> usize { self.id }
    pub fn space(&self) -> &Arc<ParameterSpace> { &self.space }
    pub fn position(&self) -> &Position { &self.position }
    pub fn velocity(&self) -> &Velocity { &self.velocity }
    pub fn best_position(&self) -> &Position { &self.best_position }
    pub fn best_velocity(&self) -> &Velocity { &self.best_velocity }
    pub fn best_score(&self) -> f64 { self.best_score }
    pub fn is_scored(&self) -> bool { self.scored }

    /// Score the current position, consulting the cache before the evaluator.
    /// Returns the personal best after folding in the new score.
    pub async fn score_current_position<E>(&mut self, epoch: u64, cache: &ResultCache, evaluator: &E) -> Result<ScoreReport, EvaluationError>
    where
        E: Evaluator + ?Sized,
    {
        if self.scored {
            let score = self.last_score.unwrap_or(self.best_score);
            return Ok(self.report(score, ScoreSource::AlreadyScored));
        }
        let key = canonical_key(&self.position);
        let _claim = cache.reserve(&key).await;
        let (score, source) = match cache.lookup(&key)? {
            Some(score) => (score, ScoreSource::Cache),
            None => {
                let score = evaluator.evaluate(&self.position).await?;
                if !score.is_finite() { return Err(EvaluationError::NonFiniteScore(score)); }
                (score, ScoreSource::Evaluated)
            }
        };
        // hits are rewritten too so the row carries the latest epoch/particle
        cache.upsert(&CacheEntry::new(epoch, self.id, &self.position, &self.velocity, score))?;
        self.scored = true;
        self.last_score = Some(score);
        let (position, velocity) = (self.position.clone(), self.velocity.clone());
        self.offer_best(score, &position, &velocity);
        trace!(particle = self.id, epoch, score, ?source, "position_scored");
        Ok(self.report(score, source))
    }

    /// `v' = chi * (v + c1 r1 (pbest - pos) + c2 r2 (gbest - pos))`, fresh `r1, r2` per parameter.
    pub fn update_velocity<R: Rng>(&mut self, global_best: &Position, coefficients: &PsoCoefficients, rng: &mut R) {
        let chi = coefficients.constriction();
        for (name, v) in self.velocity.iter_mut() {
            let pos = self.position.get(name).copied().unwrap_or_default();
            let pbest = self.best_position.get(name).copied().unwrap_or(pos);
            let gbest = global_best.get(name).copied().unwrap_or(pos);
            let r1: f64 = rng.gen();
            let r2: f64 = rng.gen();
            *v = chi * (*v + coefficients.cognitive * r1 * (pbest - pos) + coefficients.social * r2 * (gbest - pos));
        }
    }

    pub fn update_position(&mut self) {
        for (name, value) in self.position.iter_mut() {
            let v = self.velocity.get(name).copied().unwrap_or_default();
            let Some(placement) = self.space.clamp_and_snap(name, *value + v) else { continue };
            *value = placement.value();
            if placement.is_clamped() { self.velocity.insert(name.clone(), 0.0); }
        }
        self.scored = false;
        self.last_score = None;
    }

    /// Adopt an externally observed result as personal best if it strictly
    /// improves on it. The current velocity follows the adopted best.
    pub fn ingest_external_result(&mut self, score: f64, position: &Position, velocity: &Velocity) -> bool {
        if !self.offer_best(score, position, velocity) { return false; }
        self.velocity = velocity.clone();
        true
    }

    /// Fold a finished job back into this particle. The job scored a snapshot,
    /// so its personal best is offered like any external result.
    pub fn complete_evaluation(&mut self, result: &EvaluationResult) -> bool {
        self.position = result.position.clone();
        self.velocity = result.velocity.clone();
        self.scored = true;
        self.last_score = Some(result.score);
        self.ingest_external_result(result.best_score, &result.best_position, &result.velocity)
    }

    /// Place the particle at a previously scored position (resumption).
    pub fn restore(&mut self, score: f64, position: &Position, velocity: &Velocity) {
        self.position = position.clone();
        self.velocity = velocity.clone();
        self.scored = true;
        self.last_score = Some(score);
        self.ingest_external_result(score, position, velocity);
    }

    /// Snapshot for the cache's progress tree; `None` until the current position is scored.
    pub fn progress(&self, epochs_completed: u64) -> Option<ParticleProgress> {
        let score = self.last_score.filter(|_| self.scored)?;
        Some(ParticleProgress {
            particle_id: self.id,
            epochs_completed,
            position_key: canonical_key(&self.position),
            velocity_key: canonical_key(&self.velocity),
            score,
            best_score: self.best_score,
            best_position_key: canonical_key(&self.best_position),
            best_velocity_key: canonical_key(&self.best_velocity),
            recorded_at: chrono::Utc::now().timestamp_millis(),
        })
    }

    fn offer_best(&mut self, score: f64, position: &Position, velocity: &Velocity) -> bool {
        if score < self.best_score {
            self.best_score = score;
            self.best_position = position.clone();
            self.best_velocity = velocity.clone();
            return true;
        }
        false
    }

    fn report(&self, score: f64, source: ScoreSource) -> ScoreReport {
        ScoreReport {
            score,
            best_score: self.best_score,
            best_position: self.best_position.clone(),
            velocity: self.velocity.clone(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::FnEvaluator;
    use crate::space::ParameterRange;
    use rand::{rngs::StdRng, SeedableRng};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn space() -> Arc<ParameterSpace> {
        Arc::new(ParameterSpace::new([
            ("X", ParameterRange::stepped(-100.0, 100.0, 1.0).unwrap()),
            ("Y", ParameterRange::stepped(-200.0, 200.0, 2.0).unwrap()),
        ]).unwrap())
    }

    fn at(x: f64, y: f64) -> Position {
        [("X".to_string(), x), ("Y".to_string(), y)].into_iter().collect()
    }

    #[test]
    fn clamp_zeroes_velocity_component() {
        let mut rng = StdRng::seed_from_u64(5);
        let mut p = Particle::new(0, space(), &mut rng);
        p.position = at(90.0, 0.0);
        p.velocity = at(25.0, 3.2);
        p.scored = true;
        p.update_position();
        assert_eq!(p.position()["X"], 100.0);
        assert_eq!(p.velocity()["X"], 0.0);
        // 3.2 snaps to 4 (nearest even), velocity kept
        assert_eq!(p.position()["Y"], 4.0);
        assert_eq!(p.velocity()["Y"], 3.2);
        assert!(!p.is_scored());
    }

    #[test]
    fn random_walk_stays_in_bounds() {
        let mut rng = StdRng::seed_from_u64(11);
        let space = space();
        let mut p = Particle::new(1, space.clone(), &mut rng);
        let coeffs = PsoCoefficients::default();
        for step in 0..300 {
            let gbest = space.random_position(&mut rng);
            p.update_velocity(&gbest, &coeffs, &mut rng);
            p.update_position();
            assert!(space.contains_position(p.position()), "step {step}: {:?}", p.position());
        }
    }

    #[test]
    fn velocity_is_zero_when_everything_agrees() {
        let mut rng = StdRng::seed_from_u64(2);
        let mut p = Particle::new(0, space(), &mut rng);
        p.position = at(4.0, 8.0);
        p.best_position = at(4.0, 8.0);
        p.update_velocity(&at(4.0, 8.0), &PsoCoefficients::default(), &mut rng);
        assert!(p.velocity().values().all(|v| *v == 0.0));
    }

    #[test]
    fn personal_best_is_monotone() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut p = Particle::new(0, space(), &mut rng);
        let v = at(0.0, 0.0);
        assert!(p.ingest_external_result(5.0, &at(1.0, 2.0), &v));
        assert!(!p.ingest_external_result(5.0, &at(3.0, 4.0), &v));
        assert!(!p.ingest_external_result(9.0, &at(3.0, 4.0), &v));
        assert!(p.ingest_external_result(1.5, &at(-1.0, -2.0), &at(2.0, 2.0)));
        assert_eq!(p.best_score(), 1.5);
        assert_eq!(p.best_position(), &at(-1.0, -2.0));
        assert_eq!(p.velocity(), &at(2.0, 2.0));
    }

    fn result(score: f64, position: Position, velocity: Velocity, best: (f64, Position)) -> EvaluationResult {
        EvaluationResult {
            particle_id: 0,
            epoch: 0,
            score,
            best_score: best.0,
            best_position: best.1,
            position,
            velocity,
            source: ScoreSource::Evaluated,
        }
    }

    #[test]
    fn completed_job_moves_particle_and_offers_its_best() {
        let mut rng = StdRng::seed_from_u64(6);
        let mut p = Particle::new(0, space(), &mut rng);
        assert!(p.progress(0).is_none());
        assert!(p.complete_evaluation(&result(8.0, at(2.0, 2.0), at(1.0, 0.0), (8.0, at(2.0, 2.0)))));
        assert_eq!(p.best_velocity(), &at(1.0, 0.0));
        // worse score: position and velocity follow the job, best stays
        assert!(!p.complete_evaluation(&result(20.0, at(4.0, 2.0), at(2.0, 0.0), (8.0, at(2.0, 2.0)))));
        assert_eq!(p.position(), &at(4.0, 2.0));
        assert_eq!(p.velocity(), &at(2.0, 0.0));
        assert_eq!((p.best_score(), p.best_position()), (8.0, &at(2.0, 2.0)));

        let progress = p.progress(2).unwrap();
        assert_eq!((progress.epochs_completed, progress.score, progress.best_score), (2, 20.0, 8.0));
        assert_eq!(progress.best_position().unwrap(), at(2.0, 2.0));
        assert_eq!(progress.velocity().unwrap(), at(2.0, 0.0));
    }

    #[test]
    fn restore_keeps_current_velocity_over_an_older_best() {
        let mut rng = StdRng::seed_from_u64(9);
        let mut p = Particle::new(0, space(), &mut rng);
        p.ingest_external_result(1.0, &at(0.0, 0.0), &at(3.0, 0.0));
        p.restore(6.0, &at(5.0, 2.0), &at(-1.0, 0.0));
        assert_eq!(p.position(), &at(5.0, 2.0));
        assert_eq!(p.velocity(), &at(-1.0, 0.0));
        assert_eq!(p.best_velocity(), &at(3.0, 0.0));
        assert!(p.is_scored());
    }

    #[tokio::test]
    async fn second_score_of_same_position_hits_cache() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let eval = FnEvaluator::new(move |pos: Position| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(pos["X"].abs() + pos["Y"].abs())
            }
        });
        let cache = ResultCache::temporary().unwrap();
        let mut rng = StdRng::seed_from_u64(8);
        let mut a = Particle::new(0, space(), &mut rng);
        let mut b = Particle::new(1, space(), &mut rng);
        a.position = at(3.0, -4.0);
        b.position = at(3.0, -4.0);

        let first = a.score_current_position(0, &cache, &eval).await.unwrap();
        assert_eq!(first.source, ScoreSource::Evaluated);
        assert_eq!(first.best_score, 7.0);

        let again = a.score_current_position(0, &cache, &eval).await.unwrap();
        assert_eq!(again.source, ScoreSource::AlreadyScored);

        let second = b.score_current_position(2, &cache, &eval).await.unwrap();
        assert_eq!(second.source, ScoreSource::Cache);
        assert_eq!(second.score, 7.0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        // hit refreshed the row
        let row = cache.get(&canonical_key(&at(3.0, -4.0))).unwrap().unwrap();
        assert_eq!((row.epoch, row.particle_id), (2, 1));
    }

    #[tokio::test]
    async fn non_finite_score_is_an_error() {
        let eval = FnEvaluator::new(|_p: Position| async { Ok(f64::NAN) });
        let cache = ResultCache::temporary().unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        let mut p = Particle::new(0, space(), &mut rng);
        let err = p.score_current_position(0, &cache, &eval).await.unwrap_err();
        assert!(matches!(err, EvaluationError::NonFiniteScore(_)));
        assert!(!p.is_scored());
        assert!(cache.is_empty());
    }
}
