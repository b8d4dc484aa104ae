//! Race lifecycle and the background simulation loop.
//!
//! Two actors: one worker thread pumps engine -> router -> particles ->
//! buckets, and the caller's thread starts/stops the race, submits parameter
//! changes and reads snapshots. The worker owns the engine for the whole run;
//! the caller only touches it again after the worker has been joined.
//!
//! ```text
//!  Idle --start--> Running --stop--> Stopping --join+reset--> Idle
//!   ^                 |
//!   +----reset--------+ (only from Idle)
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use log::{debug, error, info, warn};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::buckets::BucketTally;
use crate::config::RaceConfig;
use crate::engine::{ErosionEngine, ErosionParameters};
use crate::error::{EngineError, RaceError, Result};
use crate::grid::Grid;
use crate::particles::{ParticleField, SpeedFactor};
use crate::routing::{FlowRouter, ReceiverMap};
use crate::snapshot::{Snapshot, SnapshotCell, SnapshotReader};

/// Log progress every this many steps.
const PROGRESS_INTERVAL: u64 = 100;

/// Lifecycle state of a [`SimulationController`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControllerState {
    /// Initial or freshly reset; no worker thread
    Idle,
    /// Worker spawned; it may already have exited on a finished race
    Running,
    /// Stop requested, join in progress
    Stopping,
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
        }
    }
}

/// How a run ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunOutcome {
    pub steps: u64,
    pub counts: Vec<usize>,
    /// Present when every particle arrived before the run ended
    pub winner: Option<usize>,
}

/// The engine and every structure one simulation step touches.
pub struct RaceCore<E: ErosionEngine> {
    engine: E,
    config: RaceConfig,
    grid: Grid,
    speed: SpeedFactor,
    params: ErosionParameters,
    router: FlowRouter,
    particles: ParticleField,
    tally: BucketTally,
    receivers: ReceiverMap,
    // Initial topography noise
    rng: ChaCha8Rng,
    step: u64,
    failure: Option<String>,
}

impl<E: ErosionEngine> RaceCore<E> {
    /// Validate `config` and bring engine, particles and buckets to their initial state.
    pub fn new(engine: E, config: RaceConfig) -> Result<Self> {
        config.validate()?;
        let grid = config.grid();
        let speed = SpeedFactor::new(config.speed_factor)?;
        let seed = config.seed.unwrap_or_else(rand::random);
        info!("Race seed: {}", seed);

        let mut master = ChaCha8Rng::seed_from_u64(seed);
        let router = FlowRouter::new(master.gen());
        let particles = ParticleField::new(grid, config.n_particles, master.gen())?;
        let tally = BucketTally::new(&grid, config.n_buckets, config.scale)?;

        let mut core = Self {
            engine,
            grid,
            speed,
            params: ErosionParameters::default(),
            router,
            particles,
            tally,
            receivers: ReceiverMap::identity(grid),
            rng: ChaCha8Rng::seed_from_u64(master.gen()),
            step: 0,
            failure: None,
            config,
        };
        core.initialize_engine()?;
        Ok(core)
    }

    /// Random noise in `[0, 1)` everywhere plus the plateau on the upper half.
    fn initial_topography(&mut self) -> Vec<f64> {
        let scarp = self.grid.scarp_row() * self.grid.cols;
        let plateau = self.config.plateau_height;
        (0..self.grid.len())
            .map(|i| {
                let noise: f64 = self.rng.gen();
                if i < scarp { noise + plateau } else { noise }
            })
            .collect()
    }

    fn initialize_engine(&mut self) -> std::result::Result<(), EngineError> {
        self.engine.initialize(&self.grid)?;
        self.engine.set_boundary_conditions(self.config.boundary_code)?;
        self.engine.set_timestep(self.config.timestep)?;
        let topography = self.initial_topography();
        self.engine.set_topography(&topography)?;
        let uplift = self.params.uplift_field(&self.grid);
        self.engine.set_parameters(&self.params, &uplift)?;
        self.receivers = ReceiverMap::identity(self.grid);
        self.step = 0;
        Ok(())
    }

    /// Destroy and reinitialize the engine, reseed particles, clear buckets.
    pub fn reset(&mut self) -> Result<()> {
        self.engine.destroy();
        self.particles.reset();
        self.tally.reset();
        self.initialize_engine()?;
        Ok(())
    }

    pub fn set_parameters(&mut self, params: ErosionParameters) -> Result<()> {
        let uplift = params.uplift_field(&self.grid);
        self.engine.set_parameters(&params, &uplift)?;
        self.params = params;
        Ok(())
    }

    /// Replace the particle set with `n` fresh particles and clear the buckets.
    pub fn resize_particles(&mut self, n: usize) -> Result<()> {
        self.particles.resize(n)?;
        self.tally.reset();
        self.config.n_particles = n;
        Ok(())
    }

    /// One full iteration: engine step, routing, advection, tally.
    pub fn advance(&mut self) -> Result<()> {
        self.engine.step()?;
        self.receivers = self.router.route(&self.grid, &self.engine.flow())?;
        self.particles.advect(&self.receivers, self.speed);
        self.tally.tally(self.particles.rows(), self.particles.cols());
        self.step += 1;
        Ok(())
    }

    pub fn snapshot(&self) -> Snapshot {
        let (particle_x, particle_y) = self.particles.pixel_positions(self.config.scale);
        Snapshot {
            step: self.step,
            grid: self.grid,
            elevation: self.engine.elevation().to_vec(),
            receivers: self.receivers.as_slice().to_vec(),
            particle_rows: self.particles.rows().to_vec(),
            particle_cols: self.particles.cols().to_vec(),
            particle_x,
            particle_y,
            particle_sizes: self.particles.sizes().to_vec(),
            bucket_edges: self.tally.edges().to_vec(),
            bucket_separators: self.tally.separators(),
            bucket_counts: self.tally.counts().to_vec(),
            leader: self.tally.leader(),
            all_in_buckets: self.tally.all_in_buckets(),
            winner: self.tally.winner(),
            failure: self.failure.clone(),
        }
    }

    pub fn outcome(&self) -> RunOutcome {
        RunOutcome {
            steps: self.step,
            counts: self.tally.counts().to_vec(),
            winner: self.tally.winner(),
        }
    }

    pub fn step(&self) -> u64 {
        self.step
    }
}

type Shared<T> = Arc<Mutex<T>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // Every critical section leaves its data whole, so a poisoned lock is still usable
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Owns the race and its worker thread.
///
/// Control calls come from one thread; other threads read state through
/// [`SimulationController::reader`]. The particle
/// count can only change while idle; changing it under a running loop is
/// rejected with [`RaceError::InvalidTransition`].
pub struct SimulationController<E: ErosionEngine + 'static> {
    state: ControllerState,
    core: Shared<RaceCore<E>>,
    worker: Option<JoinHandle<Result<()>>>,
    running: Arc<AtomicBool>,
    staged: Shared<Option<ErosionParameters>>,
    snapshots: Arc<SnapshotCell>,
    parameters: ErosionParameters,
}

impl<E: ErosionEngine + 'static> SimulationController<E> {
    pub fn new(engine: E, config: RaceConfig) -> Result<Self> {
        let core = RaceCore::new(engine, config)?;
        let snapshots = Arc::new(SnapshotCell::new(core.snapshot()));
        info!(
            "Race ready: {}x{} grid, {} particles, {} buckets",
            core.grid.rows, core.grid.cols, core.particles.len(), core.tally.n_buckets()
        );
        Ok(Self {
            state: ControllerState::Idle,
            parameters: core.params.clone(),
            core: Arc::new(Mutex::new(core)),
            worker: None,
            running: Arc::new(AtomicBool::new(false)),
            staged: Arc::new(Mutex::new(None)),
            snapshots,
        })
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    /// Latest published snapshot.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.snapshots.load()
    }

    /// Snapshot handle that can be moved to a rendering thread.
    pub fn reader(&self) -> SnapshotReader {
        SnapshotReader::new(Arc::clone(&self.snapshots))
    }

    pub fn parameters(&self) -> &ErosionParameters {
        &self.parameters
    }

    /// Submit new erosion coefficients. While running they are staged and
    /// picked up by the worker at the start of its next iteration.
    pub fn set_parameters(&mut self, params: ErosionParameters) -> Result<()> {
        params.validate()?;
        debug!("Staging erosion parameters: {:?}", params);
        *lock(&self.staged) = Some(params.clone());
        self.parameters = params;
        Ok(())
    }

    /// Reinitialize the particle set with `n` particles. Idle only.
    pub fn set_particle_count(&mut self, n: usize) -> Result<()> {
        self.require(ControllerState::Idle, "change the particle count")?;
        let snapshot = {
            let mut core = lock(&self.core);
            core.resize_particles(n)?;
            core.snapshot()
        };
        self.snapshots.publish(snapshot);
        info!("Particle count set to {}", n);
        Ok(())
    }

    /// Apply the current parameters and spawn the worker.
    pub fn start(&mut self) -> Result<()> {
        self.require(ControllerState::Idle, "start")?;
        {
            let mut core = lock(&self.core);
            core.failure = None;
            core.set_parameters(self.parameters.clone())?;
        }
        lock(&self.staged).take();
        self.running.store(true, Ordering::Release);

        let core = Arc::clone(&self.core);
        let running = Arc::clone(&self.running);
        let staged = Arc::clone(&self.staged);
        let snapshots = Arc::clone(&self.snapshots);
        let handle = thread::Builder::new()
            .name("erosion-race".to_string())
            .spawn(move || run_worker(&core, &running, &staged, &snapshots))
            .map_err(|e| {
                self.running.store(false, Ordering::Release);
                RaceError::WorkerSpawn(e.to_string())
            })?;

        self.worker = Some(handle);
        self.state = ControllerState::Running;
        info!("Race started");
        Ok(())
    }

    /// Clear the run flag, join the worker, then reset everything to a fresh race.
    ///
    /// Blocks until the worker observes the flag; there is no timeout. Returns
    /// the outcome of the run, or the engine error that ended it.
    pub fn stop(&mut self) -> Result<RunOutcome> {
        self.require(ControllerState::Running, "stop")?;
        self.running.store(false, Ordering::Release);
        self.state = ControllerState::Stopping;
        info!("Stopping race");

        let outcome = self.join_worker();
        let reset = self.reset_core();
        self.state = ControllerState::Idle;
        let outcome = outcome?;
        reset?;
        Ok(outcome)
    }

    /// Restore engine, particles and buckets to their initial condition. Idle only.
    pub fn reset(&mut self) -> Result<()> {
        self.require(ControllerState::Idle, "reset")?;
        self.reset_core()
    }

    /// Block until the worker exits on its own.
    ///
    /// On a finished race the controller stays `Running` (holding the result
    /// for display) until [`stop`](Self::stop). On an engine failure it resets
    /// and returns to `Idle` before returning the error. Never returns if the
    /// race cannot finish and nobody calls `stop`.
    pub fn wait(&mut self) -> Result<RunOutcome> {
        self.require(ControllerState::Running, "wait")?;
        match self.join_worker() {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                if let Err(reset_err) = self.reset_core() {
                    warn!("Reset after failed run also failed: {}", reset_err);
                }
                self.state = ControllerState::Idle;
                Err(e)
            }
        }
    }

    /// Non-blocking [`wait`](Self::wait): `Ok(None)` while the worker is still going.
    pub fn poll(&mut self) -> Result<Option<RunOutcome>> {
        let finished = self.state == ControllerState::Running
            && self.worker.as_ref().map_or(false, |handle| handle.is_finished());
        if finished {
            self.wait().map(Some)
        } else {
            Ok(None)
        }
    }

    fn require(&self, expected: ControllerState, action: &'static str) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(RaceError::InvalidTransition { from: self.state, action })
        }
    }

    fn join_worker(&mut self) -> Result<RunOutcome> {
        if let Some(handle) = self.worker.take() {
            match handle.join() {
                Ok(result) => result?,
                Err(_) => {
                    error!("Race worker panicked");
                    return Err(RaceError::WorkerPanicked);
                }
            }
        }
        Ok(lock(&self.core).outcome())
    }

    fn reset_core(&mut self) -> Result<()> {
        let (result, snapshot) = {
            let mut core = lock(&self.core);
            let result = core.reset();
            (result, core.snapshot())
        };
        self.snapshots.publish(snapshot);
        info!("Race reset");
        result
    }
}

impl<E: ErosionEngine + 'static> Drop for SimulationController<E> {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

/// Worker thread body. Holds the core lock for the whole run.
fn run_worker<E: ErosionEngine>(
    core: &Mutex<RaceCore<E>>,
    running: &AtomicBool,
    staged: &Mutex<Option<ErosionParameters>>,
    snapshots: &SnapshotCell,
) -> Result<()> {
    let mut core = lock(core);
    let result = race_loop(&mut core, running, staged, snapshots);

    if let Err(e) = &result {
        error!("Race aborted at step {}: {}", core.step, e);
        core.failure = Some(e.to_string());
        if let Err(reset_err) = core.reset() {
            warn!("Reset after engine failure also failed: {}", reset_err);
        }
        snapshots.publish(core.snapshot());
    }
    result
}

fn race_loop<E: ErosionEngine>(
    core: &mut RaceCore<E>,
    running: &AtomicBool,
    staged: &Mutex<Option<ErosionParameters>>,
    snapshots: &SnapshotCell,
) -> Result<()> {
    while running.load(Ordering::Acquire) && !core.tally.all_in_buckets() {
        let pending = lock(staged).take();
        if let Some(params) = pending {
            debug!("Applying staged parameters at step {}", core.step);
            core.set_parameters(params)?;
        }

        core.advance()?;
        snapshots.publish(core.snapshot());

        if core.step % PROGRESS_INTERVAL == 0 {
            debug!(
                "Step {}: {}/{} particles arrived",
                core.step,
                core.tally.total(),
                core.particles.len()
            );
        }
    }

    if let Some(winner) = core.tally.winner() {
        info!(
            "All {} particles arrived after {} steps; bucket {} wins with {}",
            core.particles.len(),
            core.step,
            winner,
            core.tally.counts()[winner]
        );
    } else {
        info!("Race stopped at step {}", core.step);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{FlowView, StreamPowerEngine};
    use std::time::{Duration, Instant};

    /// Fake engine: every cell drains straight down, optionally failing or sleeping.
    #[derive(Default)]
    struct ScriptedEngine {
        grid: Option<Grid>,
        elevation: Vec<f64>,
        receivers: Vec<usize>,
        weights: Vec<f64>,
        single: Vec<usize>,
        steps: u64,
        fail_at: Option<u64>,
        delay: Duration,
        applied: Arc<Mutex<Vec<ErosionParameters>>>,
    }

    impl ErosionEngine for ScriptedEngine {
        fn initialize(&mut self, grid: &Grid) -> std::result::Result<(), EngineError> {
            self.grid = Some(*grid);
            self.elevation = vec![0.0; grid.len()];
            self.single = (0..grid.len())
                .map(|i| {
                    let (row, col) = grid.coords(i);
                    if row == grid.base_row() { i } else { grid.index(row + 1, col) }
                })
                .collect();
            self.receivers = self.single.clone();
            self.weights = self.single.iter().enumerate().map(|(i, &r)| if r == i { 0.0 } else { 1.0 }).collect();
            self.steps = 0;
            Ok(())
        }

        fn set_topography(&mut self, elevation: &[f64]) -> std::result::Result<(), EngineError> {
            self.elevation = elevation.to_vec();
            Ok(())
        }

        fn set_parameters(&mut self, params: &ErosionParameters, _uplift: &[f64]) -> std::result::Result<(), EngineError> {
            lock(&self.applied).push(params.clone());
            Ok(())
        }

        fn set_boundary_conditions(&mut self, _code: u32) -> std::result::Result<(), EngineError> {
            Ok(())
        }

        fn set_timestep(&mut self, _dt: f64) -> std::result::Result<(), EngineError> {
            Ok(())
        }

        fn step(&mut self) -> std::result::Result<(), EngineError> {
            self.grid.ok_or(EngineError::NotInitialized)?;
            self.steps += 1;
            if Some(self.steps) == self.fail_at {
                return Err(EngineError::Other("scripted failure".to_string()));
            }
            thread::sleep(self.delay);
            Ok(())
        }

        fn destroy(&mut self) {
            self.grid = None;
        }

        fn elevation(&self) -> &[f64] {
            &self.elevation
        }

        fn flow(&self) -> FlowView<'_> {
            FlowView {
                stride: 1,
                receivers: &self.receivers,
                weights: &self.weights,
                single_receivers: &self.single,
            }
        }
    }

    fn small_config() -> RaceConfig {
        RaceConfig {
            rows: 10,
            cols: 10,
            length_x: 900.0,
            length_y: 900.0,
            n_particles: 50,
            speed_factor: 1.0,
            n_buckets: 2,
            scale: 1,
            seed: Some(17),
            ..Default::default()
        }
    }

    fn assert_fresh(snapshot: &Snapshot, config: &RaceConfig) {
        let grid = config.grid();
        assert_eq!(snapshot.step, 0);
        assert_eq!(snapshot.n_particles(), config.n_particles);
        assert!(snapshot.particle_rows.iter().all(|&r| r >= 1 && r < grid.scarp_row()));
        assert!(snapshot.particle_cols.iter().all(|&c| c < grid.cols));
        assert!(snapshot.bucket_counts.iter().all(|&c| c == 0));
        assert!(!snapshot.all_in_buckets);
        assert_eq!(snapshot.winner, None);
        assert_eq!(snapshot.receivers, (0..grid.len()).collect::<Vec<_>>());
        for (i, &h) in snapshot.elevation.iter().enumerate() {
            if grid.coords(i).0 < grid.scarp_row() {
                assert!((config.plateau_height..config.plateau_height + 1.0).contains(&h));
            } else {
                assert!((0.0..1.0).contains(&h));
            }
        }
    }

    fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if done() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        done()
    }

    #[test]
    fn test_start_then_stop_returns_to_fresh_idle() {
        let config = RaceConfig { rows: 16, cols: 12, n_particles: 300, speed_factor: 0.5, ..small_config() };
        let mut controller = SimulationController::new(StreamPowerEngine::new(), config.clone()).unwrap();
        assert_fresh(&controller.snapshot(), &config);

        controller.start().unwrap();
        assert_eq!(controller.state(), ControllerState::Running);
        controller.stop().unwrap();

        assert_eq!(controller.state(), ControllerState::Idle);
        assert_fresh(&controller.snapshot(), &config);
    }

    #[test]
    fn test_invalid_transitions_rejected() {
        let engine = ScriptedEngine { delay: Duration::from_millis(5), ..Default::default() };
        let config = RaceConfig { rows: 200, speed_factor: 0.02, ..small_config() };
        let mut controller = SimulationController::new(engine, config).unwrap();

        assert!(matches!(
            controller.stop(),
            Err(RaceError::InvalidTransition { from: ControllerState::Idle, action: "stop" })
        ));

        controller.start().unwrap();
        assert_eq!(
            controller.start(),
            Err(RaceError::InvalidTransition { from: ControllerState::Running, action: "start" })
        );
        assert!(matches!(controller.reset(), Err(RaceError::InvalidTransition { .. })));
        assert!(matches!(controller.set_particle_count(10), Err(RaceError::InvalidTransition { .. })));

        controller.stop().unwrap();
        assert_eq!(controller.state(), ControllerState::Idle);
        controller.reset().unwrap();
    }

    #[test]
    fn test_race_runs_to_a_winner() {
        let config = small_config();
        let mut controller = SimulationController::new(ScriptedEngine::default(), config.clone()).unwrap();
        controller.start().unwrap();

        let outcome = controller.wait().unwrap();
        assert_eq!(controller.state(), ControllerState::Running);
        assert_eq!(outcome.counts.iter().sum::<usize>(), config.n_particles);
        assert!(outcome.steps <= 8, "straight drop from row >= 1 takes at most 8 steps");

        let snapshot = controller.snapshot();
        assert!(snapshot.all_in_buckets);
        assert_eq!(snapshot.winner, outcome.winner);
        assert_eq!(Some(snapshot.leader), outcome.winner);
        assert_eq!(snapshot.bucket_separators, vec![0, 5, 10]);
        assert_eq!(snapshot.particle_x, snapshot.particle_cols.iter().map(|&c| c as u32).collect::<Vec<_>>());
        assert!(snapshot.particle_y.iter().all(|&y| y == 9));
        let best = *outcome.counts.iter().max().unwrap();
        let first_best = outcome.counts.iter().position(|&c| c == best);
        assert_eq!(outcome.winner, first_best);

        let stopped = controller.stop().unwrap();
        assert_eq!(stopped, outcome);
        assert_eq!(controller.state(), ControllerState::Idle);
        assert_fresh(&controller.snapshot(), &config);
    }

    #[test]
    fn test_engine_failure_reaches_consumer() {
        let engine = ScriptedEngine { fail_at: Some(3), ..Default::default() };
        let config = RaceConfig { speed_factor: 0.1, ..small_config() };
        let mut controller = SimulationController::new(engine, config).unwrap();
        controller.start().unwrap();

        let err = controller.wait().unwrap_err();
        assert_eq!(err, RaceError::Engine(EngineError::Other("scripted failure".to_string())));
        assert_eq!(controller.state(), ControllerState::Idle);
        let snapshot = controller.snapshot();
        assert!(snapshot.failure.as_deref().unwrap_or("").contains("scripted failure"));
        assert_eq!(snapshot.step, 0);

        // Recoverable: a new run can start
        controller.start().unwrap();
        let _ = controller.stop();
        assert_eq!(controller.state(), ControllerState::Idle);
    }

    #[test]
    fn test_parameters_applied_at_next_iteration() {
        let applied = Arc::new(Mutex::new(Vec::new()));
        let engine = ScriptedEngine {
            delay: Duration::from_millis(1),
            applied: Arc::clone(&applied),
            ..Default::default()
        };
        let config = RaceConfig { rows: 200, speed_factor: 0.02, ..small_config() };
        let mut controller = SimulationController::new(engine, config).unwrap();

        let bad = ErosionParameters { kf: -1.0, ..Default::default() };
        assert!(matches!(controller.set_parameters(bad), Err(RaceError::Config(_))));

        controller.start().unwrap();
        let tuned = ErosionParameters { kf: 2e-4, g: 1.4, ..Default::default() };
        controller.set_parameters(tuned.clone()).unwrap();

        let seen = wait_until(Duration::from_secs(5), || lock(&applied).contains(&tuned));
        controller.stop().unwrap();
        assert!(seen, "staged parameters never reached the engine");
        assert_eq!(controller.parameters(), &tuned);
    }

    #[test]
    fn test_particle_count_changes_while_idle() {
        let mut controller = SimulationController::new(ScriptedEngine::default(), small_config()).unwrap();
        controller.set_particle_count(30).unwrap();
        assert_eq!(controller.snapshot().n_particles(), 30);
        assert!(matches!(
            controller.set_particle_count(0),
            Err(RaceError::Config(crate::error::ConfigError::ParticleCount))
        ));
    }

    /// Every field of a published snapshot must describe the same step.
    fn assert_consistent(s: &Snapshot) {
        let base_row = s.grid.base_row();
        let mut counts = vec![0; s.bucket_counts.len()];
        for p in 0..s.n_particles() {
            let (row, col) = (s.particle_rows[p], s.particle_cols[p]);
            if row != base_row {
                continue;
            }
            let cell = s.grid.index(row, col);
            assert_eq!(s.receivers[cell], cell, "particle at base level on a draining cell");
            let x = s.particle_x[p] as f64;
            let bucket = (0..counts.len())
                .find(|&b| s.bucket_edges[b] <= x && x < s.bucket_edges[b + 1])
                .unwrap();
            counts[bucket] += 1;
        }
        assert_eq!(counts, s.bucket_counts, "counts disagree with positions at step {}", s.step);
        assert_eq!(s.all_in_buckets, s.arrived() == s.n_particles());
    }

    #[test]
    fn test_reader_sees_progress_from_another_thread() {
        let engine = ScriptedEngine { delay: Duration::from_millis(1), ..Default::default() };
        let config = RaceConfig { speed_factor: 0.1, ..small_config() };
        let mut controller = SimulationController::new(engine, config).unwrap();
        let reader = controller.reader();
        controller.start().unwrap();

        let observer = thread::spawn(move || {
            let mut last = 0;
            let mut saw_arrivals = false;
            for _ in 0..200 {
                let s = reader.latest();
                assert!(s.step >= last, "snapshots went backwards");
                assert_consistent(&s);
                saw_arrivals |= s.arrived() > 0;
                last = s.step;
                if s.all_in_buckets {
                    break;
                }
                thread::sleep(Duration::from_millis(1));
            }
            (last, saw_arrivals)
        });
        let (last, saw_arrivals) = observer.join().unwrap();
        controller.stop().unwrap();
        assert!(last > 0);
        assert!(saw_arrivals, "no particle reached a bucket while observed");
    }

    #[test]
    fn test_invalid_config_fails_fast() {
        let config = RaceConfig { speed_factor: 0.0, ..small_config() };
        let result = SimulationController::new(ScriptedEngine::default(), config);
        assert!(matches!(
            result.err(),
            Some(RaceError::Config(crate::error::ConfigError::SpeedFactor(_)))
        ));
    }
}
