//! Swarm driver: seeds particles, keeps a bounded number of evaluation jobs in
//! flight, folds completions into personal/global bests and refills freed
//! slots with the least-advanced idle particle.
//!
//! All dispatch bookkeeping lives in [`DispatchState`], owned by the driver and
//! touched only between suspensions on [`TaskExecutor::wait_any`].

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use pso_resilience::{Decision, FailureTracker, RetryPolicy};
use rand::{rngs::StdRng, SeedableRng};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::cache::{CacheEntry, ParticleProgress, ResultCache};
use crate::canonical::Position;
use crate::coefficients::PsoCoefficients;
use crate::error::{ConfigError, DriverError};
use crate::evaluator::{Evaluator, JobOutcome, ScoreSource};
use crate::executor::{EvaluationJob, TaskExecutor};
use crate::particle::Particle;
use crate::space::ParameterSpace;
use crate::telemetry::DRIVER_METRICS;

#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub particles: usize,
    pub target_epochs: u64,
    /// Concurrent worker slots available to the whole run.
    pub worker_capacity: usize,
    /// Worker slots one evaluation occupies.
    pub replications: usize,
    pub coefficients: PsoCoefficients,
    pub retry: RetryPolicy,
    /// Pause between submissions of the initial batch.
    pub initial_stagger: Duration,
    pub seed: Option<u64>,
    /// Prior run caches merged into the live cache before replay.
    pub resume_from: Vec<PathBuf>,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            particles: 30,
            target_epochs: 100,
            worker_capacity: 1,
            replications: 1,
            coefficients: PsoCoefficients::default(),
            retry: RetryPolicy::default(),
            initial_stagger: Duration::ZERO,
            seed: None,
            resume_from: Vec::new(),
        }
    }
}

impl DriverConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.particles == 0 { return Err(ConfigError::ZeroParticles); }
        if self.target_epochs == 0 { return Err(ConfigError::ZeroEpochs); }
        if self.worker_capacity == 0 { return Err(ConfigError::ZeroWorkers); }
        if self.replications == 0 { return Err(ConfigError::ZeroReplications); }
        self.coefficients.validate()?;
        self.retry.validate()?;
        Ok(())
    }

    /// Jobs kept in flight: worker slots per job-sized share, at least one, at most one per particle.
    pub fn desired_concurrency(&self) -> usize {
        (self.worker_capacity / self.replications.max(1)).max(1).min(self.particles.max(1))
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParticleSlot {
    pub epochs_completed: u64,
    pub running: bool,
    pub abandoned: bool,
    /// Backoff applied to the next dispatch after a failure.
    pub retry_delay: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GlobalBest {
    pub score: f64,
    pub position: Position,
}

impl GlobalBest {
    /// Strict improvement only; ties keep the first seen.
    pub fn offer(&mut self, score: f64, position: &Position) -> bool {
        if score < self.score {
            self.score = score;
            self.position = position.clone();
            return true;
        }
        false
    }
}

#[derive(Debug, Clone)]
pub struct DispatchState {
    slots: Vec<ParticleSlot>,
    global_best: GlobalBest,
    target_epochs: u64,
    capacity: usize,
    in_flight: usize,
    best_by_level: Vec<f64>,
}

impl DispatchState {
    pub fn new(particles: usize, target_epochs: u64, capacity: usize, seed_position: Position) -> Self {
        Self {
            slots: vec![ParticleSlot::default(); particles],
            global_best: GlobalBest { score: f64::INFINITY, position: seed_position },
            target_epochs,
            capacity,
            in_flight: 0,
            best_by_level: Vec::new(),
        }
    }

    pub fn slots(&self) -> &[ParticleSlot] { &self.slots }
    pub fn global_best(&self) -> &GlobalBest { &self.global_best }
    pub fn in_flight(&self) -> usize { self.in_flight }
    pub fn capacity(&self) -> usize { self.capacity }
    pub fn target_epochs(&self) -> u64 { self.target_epochs }

    /// Global best score at the moment each epoch level was reached; index k is level k+1.
    pub fn best_by_level(&self) -> &[f64] { &self.best_by_level }

    pub fn live_particles(&self) -> usize { self.slots.iter().filter(|s| !s.abandoned).count() }

    /// Minimum epoch count over live particles.
    pub fn min_epochs(&self) -> Option<u64> {
        self.slots.iter().filter(|s| !s.abandoned).map(|s| s.epochs_completed).min()
    }

    pub fn epoch_spread(&self) -> u64 {
        let live = self.slots.iter().filter(|s| !s.abandoned).map(|s| s.epochs_completed);
        let (lo, hi) = live.fold((u64::MAX, 0), |(lo, hi), e| (lo.min(e), hi.max(e)));
        hi.saturating_sub(lo)
    }

    pub fn is_finished(&self) -> bool {
        self.min_epochs().map_or(true, |min| min >= self.target_epochs)
    }

    /// Lowest-index idle live particle at the minimum epoch level, if a slot is free.
    pub fn next_candidate(&self) -> Option<usize> {
        if self.in_flight >= self.capacity || self.is_finished() { return None; }
        let level = self.min_epochs()?;
        self.slots.iter().position(|s| !s.abandoned && !s.running && s.epochs_completed == level)
    }

    pub fn mark_dispatched(&mut self, idx: usize) {
        let slot = &mut self.slots[idx];
        slot.running = true;
        slot.retry_delay = Duration::ZERO;
        self.in_flight += 1;
    }

    /// Returns true when the global best improved.
    pub fn record_success(&mut self, idx: usize, score: f64, position: &Position) -> bool {
        self.release(idx);
        self.slots[idx].epochs_completed += 1;
        let improved = self.global_best.offer(score, position);
        self.note_levels();
        improved
    }

    pub fn record_failure(&mut self, idx: usize, decision: &Decision) {
        self.release(idx);
        match decision {
            Decision::Retry { delay, .. } => self.slots[idx].retry_delay = *delay,
            Decision::Abandon { .. } => self.slots[idx].abandoned = true,
        }
        self.note_levels();
    }

    /// Replay of a persisted row: raise the epoch count, offer the score.
    fn replay(&mut self, idx: usize, epochs_completed: u64, score: f64, position: &Position) {
        let slot = &mut self.slots[idx];
        slot.epochs_completed = slot.epochs_completed.max(epochs_completed);
        self.global_best.offer(score, position);
    }

    fn release(&mut self, idx: usize) {
        let slot = &mut self.slots[idx];
        if slot.running {
            slot.running = false;
            self.in_flight = self.in_flight.saturating_sub(1);
        }
    }

    fn note_levels(&mut self) {
        let Some(level) = self.min_epochs() else { return };
        let level = level.min(self.target_epochs) as usize;
        while self.best_by_level.len() < level {
            self.best_by_level.push(self.global_best.score);
            info!(epoch_level = self.best_by_level.len(), best = self.global_best.score, "epoch_level_reached");
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunCounters {
    pub dispatched: u64,
    pub evaluated: u64,
    pub cache_hits: u64,
    pub failures: u64,
    pub resumed_rows: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParticleSummary {
    pub id: usize,
    pub best_score: f64,
    pub best_position: Position,
    pub epochs_completed: u64,
    pub abandoned: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub best_score: f64,
    pub best_position: Position,
    pub particles: Vec<ParticleSummary>,
    pub best_by_level: Vec<f64>,
    pub counters: RunCounters,
    pub elapsed_ms: u64,
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "run {}: best score {} at {:?}", self.run_id, self.best_score, self.best_position)?;
        for p in &self.particles {
            let state = if p.abandoned { " (abandoned)" } else { "" };
            writeln!(f, "  particle {:>3}: epochs {:>4} best {} at {:?}{}", p.id, p.epochs_completed, p.best_score, p.best_position, state)?;
        }
        write!(
            f,
            "dispatched {} evaluated {} cache hits {} failures {} in {}ms",
            self.counters.dispatched, self.counters.evaluated, self.counters.cache_hits, self.counters.failures, self.elapsed_ms
        )
    }
}

pub struct SwarmDriver<E: ?Sized> {
    run_id: Uuid,
    config: DriverConfig,
    particles: Vec<Particle>,
    state: DispatchState,
    executor: TaskExecutor<E>,
    cache: ResultCache,
    failures: FailureTracker<usize>,
    rng: StdRng,
    counters: RunCounters,
    started: Instant,
}

impl<E: Evaluator + ?Sized> SwarmDriver<E> {
    /// Validates `config`, seeds the swarm and replays any prior results
    /// found in `cache` (after merging `config.resume_from` into it).
    pub fn new(config: DriverConfig, space: Arc<ParameterSpace>, evaluator: Arc<E>, cache: ResultCache) -> Result<Self, DriverError> {
        config.validate()?;
        let mut rng = config.seed.map_or_else(StdRng::from_entropy, StdRng::seed_from_u64);
        let particles: Vec<Particle> = (0..config.particles).map(|id| Particle::new(id, space.clone(), &mut rng)).collect();
        let state = DispatchState::new(
            config.particles,
            config.target_epochs,
            config.desired_concurrency(),
            particles[0].position().clone(),
        );
        let mut driver = Self {
            run_id: Uuid::new_v4(),
            executor: TaskExecutor::new(evaluator, cache.clone()),
            failures: FailureTracker::new(config.retry.clone()),
            config,
            particles,
            state,
            cache,
            rng,
            counters: RunCounters::default(),
            started: Instant::now(),
        };
        driver.resume();
        Ok(driver)
    }

    pub fn run_id(&self) -> Uuid { self.run_id }
    pub fn state(&self) -> &DispatchState { &self.state }
    pub fn particles(&self) -> &[Particle] { &self.particles }
    pub fn cache(&self) -> &ResultCache { &self.cache }
    pub fn counters(&self) -> &RunCounters { &self.counters }

    /// Start to finish: fill, react-and-refill until every live particle
    /// reaches the target, drain, report.
    #[instrument(skip(self), fields(run_id = %self.run_id, particles = self.config.particles, target_epochs = self.config.target_epochs))]
    pub async fn run(mut self) -> Result<RunReport, DriverError> {
        self.start().await?;
        while self.step().await? {}
        self.finish().await
    }

    /// Initial fill, staggered by `initial_stagger`.
    pub async fn start(&mut self) -> Result<(), DriverError> {
        self.ensure_live()?;
        let mut first = true;
        while let Some(idx) = self.state.next_candidate() {
            if !first && !self.config.initial_stagger.is_zero() {
                tokio::time::sleep(self.config.initial_stagger).await;
            }
            first = false;
            self.dispatch(idx);
        }
        info!(in_flight = self.state.in_flight(), capacity = self.state.capacity(), "initial_batch_dispatched");
        Ok(())
    }

    /// One react-and-refill round. Returns false once the search is finished
    /// and nothing is left in flight.
    #[instrument(level = "debug", skip(self), fields(in_flight = self.state.in_flight()))]
    pub async fn step(&mut self) -> Result<bool, DriverError> {
        if self.executor.in_flight() == 0 {
            self.refill();
            if self.executor.in_flight() == 0 { return Ok(false); }
        }
        for outcome in self.executor.wait_any().await? {
            self.react(outcome);
        }
        self.ensure_live()?;
        self.refill();
        Ok(!(self.state.is_finished() && self.executor.in_flight() == 0))
    }

    /// Drain anything still in flight without dispatching more, flush the cache and report.
    pub async fn finish(mut self) -> Result<RunReport, DriverError> {
        while self.executor.in_flight() > 0 {
            for outcome in self.executor.wait_any().await? {
                self.react(outcome);
            }
        }
        self.ensure_live()?;
        self.cache.flush()?;
        let report = self.report();
        info!(
            best = report.best_score,
            position = ?report.best_position,
            dispatched = report.counters.dispatched,
            evaluated = report.counters.evaluated,
            cache_hits = report.counters.cache_hits,
            failures = report.counters.failures,
            elapsed_ms = report.elapsed_ms,
            "run_finished"
        );
        Ok(report)
    }

    fn ensure_live(&self) -> Result<(), DriverError> {
        if self.state.live_particles() == 0 {
            return Err(DriverError::SwarmExhausted { particles: self.particles.len() });
        }
        Ok(())
    }

    fn refill(&mut self) {
        while let Some(idx) = self.state.next_candidate() {
            self.dispatch(idx);
        }
    }

    fn dispatch(&mut self, idx: usize) {
        let particle = &mut self.particles[idx];
        if particle.is_scored() {
            particle.update_velocity(&self.state.global_best.position, &self.config.coefficients, &mut self.rng);
            particle.update_position();
        }
        let epoch = self.state.slots[idx].epochs_completed;
        let delay = self.state.slots[idx].retry_delay;
        let job = EvaluationJob { particle: particle.clone(), epoch, delay };
        debug!(particle = idx, epoch, position = ?job.particle.position(), delay_ms = delay.as_millis() as u64, "particle_dispatched");
        self.state.mark_dispatched(idx);
        self.executor.submit(job);
        self.counters.dispatched += 1;
        DRIVER_METRICS.dispatched_total.add(1, &[]);
    }

    fn react(&mut self, outcome: JobOutcome) {
        match outcome {
            Ok(result) => {
                let idx = result.particle_id;
                match result.source {
                    ScoreSource::Evaluated => { self.counters.evaluated += 1; DRIVER_METRICS.evaluations_total.add(1, &[]); }
                    ScoreSource::Cache => { self.counters.cache_hits += 1; DRIVER_METRICS.cache_hits_total.add(1, &[]); }
                    ScoreSource::AlreadyScored => {}
                }
                self.failures.record_success(&idx);
                self.particles[idx].complete_evaluation(&result);
                let improved = self.state.record_success(idx, result.score, &result.position);
                self.persist_progress(idx);
                debug!(particle = idx, epoch = result.epoch, score = result.score, personal_best = self.particles[idx].best_score(), ?result.source, "evaluation_completed");
                if improved {
                    info!(particle = idx, epoch = result.epoch, score = result.score, position = ?result.position, "global_best_improved");
                }
            }
            Err(failure) => {
                let idx = failure.particle_id;
                self.counters.failures += 1;
                DRIVER_METRICS.failures_total.add(1, &[]);
                warn!(particle = idx, epoch = failure.epoch, error = %failure.cause, "evaluation_failed");
                let decision = self.failures.record_failure(&idx, &mut self.rng);
                if let Decision::Abandon { failures } = decision {
                    warn!(particle = idx, failures, "particle_abandoned");
                }
                self.state.record_failure(idx, &decision);
            }
        }
    }

    /// Merge resume sources, then restore each particle from its progress row.
    /// Particles without one fall back to the score rows they wrote. A read
    /// problem leaves the swarm as freshly seeded.
    fn resume(&mut self) {
        if !self.config.resume_from.is_empty() {
            match self.cache.merge(&self.config.resume_from) {
                Ok(rows) => info!(sources = self.config.resume_from.len(), rows, "resume_sources_merged"),
                // whatever was merged, and the live store's own rows, still replay
                Err(e) => warn!(error = %e, "resume_merge_incomplete"),
            }
        }
        let (progress, mut rows) = match (self.cache.progress(), self.cache.entries()) {
            (Ok(progress), Ok(rows)) => (progress, rows),
            (Err(e), _) | (_, Err(e)) => {
                warn!(error = %e, "resume_read_failed_starting_fresh");
                return;
            }
        };
        if progress.is_empty() && rows.is_empty() { return; }
        let mut restored = vec![false; self.particles.len()];
        let mut replayed = 0usize;
        for row in &progress {
            if self.replay_progress(row) {
                restored[row.particle_id] = true;
                replayed += 1;
            }
        }
        rows.sort_by(|a, b| a.epoch.cmp(&b.epoch).then(a.recorded_at.cmp(&b.recorded_at)));
        for row in rows.iter().filter(|row| !restored.get(row.particle_id).copied().unwrap_or(false)) {
            if self.replay_row(row) { replayed += 1; }
        }
        self.state.note_levels();
        self.counters.resumed_rows = replayed;
        info!(
            particles = progress.len(),
            rows = rows.len(),
            replayed,
            best = self.state.global_best.score,
            min_epochs = self.state.min_epochs().unwrap_or_default(),
            "resume_replayed"
        );
    }

    fn replay_progress(&mut self, row: &ParticleProgress) -> bool {
        let Some(particle) = self.particles.get_mut(row.particle_id) else {
            warn!(particle = row.particle_id, "resume_progress_unknown_particle");
            return false;
        };
        let (position, best_position) = match (row.position(), row.best_position()) {
            (Ok(p), Ok(b)) if particle.space().contains_position(&p) && particle.space().contains_position(&b) => (p, b),
            (Ok(p), Ok(_)) => {
                warn!(particle = row.particle_id, position = ?p, "resume_progress_outside_space");
                return false;
            }
            (Err(e), _) | (_, Err(e)) => {
                warn!(particle = row.particle_id, error = %e, "resume_progress_undecodable");
                return false;
            }
        };
        let velocity = row.velocity().unwrap_or_else(|_| particle.space().zero_velocity());
        let best_velocity = row.best_velocity().unwrap_or_else(|_| velocity.clone());
        particle.ingest_external_result(row.best_score, &best_position, &best_velocity);
        particle.restore(row.score, &position, &velocity);
        self.state.replay(row.particle_id, row.epochs_completed, row.best_score, &best_position);
        true
    }

    fn persist_progress(&self, idx: usize) {
        let Some(progress) = self.particles[idx].progress(self.state.slots[idx].epochs_completed) else { return };
        if let Err(e) = self.cache.record_progress(&progress) {
            warn!(particle = idx, error = %e, "progress_write_failed");
        }
    }

    fn replay_row(&mut self, row: &CacheEntry) -> bool {
        let Some(particle) = self.particles.get_mut(row.particle_id) else {
            warn!(particle = row.particle_id, "resume_row_unknown_particle");
            return false;
        };
        let position = match row.position() {
            Ok(p) if particle.space().contains_position(&p) => p,
            Ok(p) => {
                warn!(particle = row.particle_id, position = ?p, "resume_row_outside_space");
                return false;
            }
            Err(e) => {
                warn!(particle = row.particle_id, error = %e, "resume_row_undecodable");
                return false;
            }
        };
        let velocity = row.velocity().unwrap_or_else(|_| particle.space().zero_velocity());
        particle.restore(row.score, &position, &velocity);
        self.state.replay(row.particle_id, row.epoch + 1, row.score, &position);
        true
    }

    fn report(&self) -> RunReport {
        RunReport {
            run_id: self.run_id,
            best_score: self.state.global_best.score,
            best_position: self.state.global_best.position.clone(),
            particles: self
                .particles
                .iter()
                .zip(self.state.slots.iter())
                .map(|(p, s)| ParticleSummary {
                    id: p.id(),
                    best_score: p.best_score(),
                    best_position: p.best_position().clone(),
                    epochs_completed: s.epochs_completed,
                    abandoned: s.abandoned,
                })
                .collect(),
            best_by_level: self.state.best_by_level.clone(),
            counters: self.counters.clone(),
            elapsed_ms: self.started.elapsed().as_millis() as u64,
        }
    }
}
