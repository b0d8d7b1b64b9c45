//! Priority-ordered system scheduler.
//!
//! Every [`tick`](Scheduler::tick) picks the systems that are due, orders
//! them by [`Priority`] (ties by registration order) and runs each one's
//! before / execute / after hooks against the [`World`]. A failing or
//! panicking system keeps its previous state and does not affect the rest of
//! the tick.

use std::collections::{BTreeMap, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use engine_system::{
    Priority, System, SystemConfig, SystemError, SystemState, TerminateReason, run_once,
};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::SchedulerError;
use crate::tick::{self, TickLoop};
use crate::world::World;

/// Configuration for the scheduler and its tick loop.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    /// Target ticks per second.
    pub tick_rate: f64,
    /// Maximum number of ticks the loop runs (0 = unlimited).
    pub max_ticks: u64,
    /// A tick taking longer than this counts as an overrun. Defaults to the
    /// tick interval.
    pub tick_budget: Option<Duration>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_rate: 60.0,
            max_ticks: 0,
            tick_budget: None,
        }
    }
}

impl SchedulerConfig {
    #[must_use]
    pub fn with_tick_rate(mut self, tick_rate: f64) -> Self {
        self.tick_rate = tick_rate;
        self
    }

    #[must_use]
    pub fn with_max_ticks(mut self, max_ticks: u64) -> Self {
        self.max_ticks = max_ticks;
        self
    }

    #[must_use]
    pub fn with_tick_budget(mut self, budget: Duration) -> Self {
        self.tick_budget = Some(budget);
        self
    }

    /// Time between tick starts.
    #[must_use]
    pub fn tick_interval(&self) -> Duration {
        if self.tick_rate > 0.0 {
            Duration::from_secs_f64(1.0 / self.tick_rate)
        } else {
            Duration::ZERO
        }
    }

    #[must_use]
    pub fn budget(&self) -> Duration {
        self.tick_budget.unwrap_or_else(|| self.tick_interval())
    }
}

/// Per-system counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemStats {
    pub name: String,
    pub priority: Priority,
    pub runs: u64,
    pub failures: u64,
    /// Due runs skipped by `should_run` or unmet dependencies.
    pub skips: u64,
    pub last_error: Option<String>,
    pub last_run_tick: Option<u64>,
    pub avg_duration: Duration,
    pub registered_at: DateTime<Utc>,
}

/// Scheduler-wide counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SchedulerStats {
    pub ticks: u64,
    pub systems: usize,
    pub avg_tick: Duration,
    pub last_tick: Duration,
    /// Ticks that took longer than the budget.
    pub overruns: u64,
    pub running: bool,
}

/// What a single tick did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickReport {
    pub tick_id: u64,
    /// Systems that ran successfully, in execution order.
    pub ran: Vec<String>,
    /// Due systems that did not run.
    pub skipped: Vec<String>,
    /// `(system, error)` for every failed run.
    pub failed: Vec<(String, String)>,
    pub duration: Duration,
}

struct Entry {
    system: Arc<dyn System>,
    config: SystemConfig,
    priority: Priority,
    run_interval: Option<u64>,
    seq: u64,
    state: SystemState,
    stats: SystemStats,
}

impl Entry {
    fn is_due(&self, tick_id: u64) -> bool {
        match (self.run_interval, self.stats.last_run_tick) {
            (Some(interval), Some(last)) => tick_id.saturating_sub(last) >= interval.max(1),
            _ => true,
        }
    }
}

/// A due system, copied out of [`Inner`] so it can run unlocked.
struct PlannedRun {
    name: String,
    seq: u64,
    system: Arc<dyn System>,
    state: SystemState,
    ready: bool,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    order: BTreeMap<(Priority, u64), String>,
    current_tick: u64,
    next_seq: u64,
    last_tick_at: Option<Instant>,
    stats: SchedulerStats,
}

impl Inner {
    /// Systems due at `tick_id`, in execution order.
    fn plan(&self, tick_id: u64) -> Vec<PlannedRun> {
        self.order
            .values()
            .filter_map(|name| self.entries.get(name))
            .filter(|entry| entry.is_due(tick_id))
            .map(|entry| PlannedRun {
                name: entry.stats.name.clone(),
                seq: entry.seq,
                system: Arc::clone(&entry.system),
                state: entry.state.clone(),
                ready: entry
                    .config
                    .dependencies
                    .iter()
                    .all(|dep| self.entries.contains_key(dep)),
            })
            .collect()
    }
}

/// Runs registered systems against a shared [`World`].
pub struct Scheduler {
    world: Arc<World>,
    config: SchedulerConfig,
    inner: Mutex<Inner>,
    tick_lock: Mutex<()>,
    running: Mutex<Option<TickLoop>>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Scheduler")
            .field("config", &self.config)
            .field("current_tick", &inner.current_tick)
            .field("systems", &inner.order.values().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn running_mean(mean: Duration, sample: Duration, n: u64) -> Duration {
    if n == 0 {
        return sample;
    }
    let mean = mean.as_secs_f64();
    Duration::from_secs_f64(mean + (sample.as_secs_f64() - mean) / n as f64)
}

impl Scheduler {
    #[must_use]
    pub fn new(world: Arc<World>, config: SchedulerConfig) -> Self {
        Self {
            world,
            config,
            inner: Mutex::new(Inner::default()),
            tick_lock: Mutex::new(()),
            running: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn world(&self) -> &Arc<World> {
        &self.world
    }

    #[must_use]
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Register a system under its own name with default configuration.
    ///
    /// # Errors
    ///
    /// See [`register_system`](Self::register_system).
    pub fn register(&self, system: impl System) -> Result<(), SchedulerError> {
        let config = SystemConfig::new(system.name());
        self.register_system(Arc::new(system), config)
    }

    /// Initialise `system` and add it to the schedule.
    ///
    /// The config's priority and run interval override the system's own.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::DuplicateSystem`] if the name is taken, or
    /// [`SchedulerError::InitFailed`] if `init` fails; the system is not
    /// added in either case.
    pub fn register_system(
        &self,
        system: Arc<dyn System>,
        config: SystemConfig,
    ) -> Result<(), SchedulerError> {
        let name = system.name().to_string();
        if self.inner.lock().entries.contains_key(&name) {
            return Err(SchedulerError::DuplicateSystem(name));
        }

        let state = system.init(&config).map_err(|source| {
            warn!(system = %name, error = %source, "system failed to initialise");
            SchedulerError::InitFailed {
                system: name.clone(),
                source,
            }
        })?;

        let priority = config.priority.unwrap_or_else(|| system.priority());
        let run_interval = config.run_interval.or_else(|| system.run_interval());

        let mut inner = self.inner.lock();
        if inner.entries.contains_key(&name) {
            return Err(SchedulerError::DuplicateSystem(name));
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.order.insert((priority, seq), name.clone());
        inner.entries.insert(
            name.clone(),
            Entry {
                system,
                config,
                priority,
                run_interval,
                seq,
                state,
                stats: SystemStats {
                    name: name.clone(),
                    priority,
                    runs: 0,
                    failures: 0,
                    skips: 0,
                    last_error: None,
                    last_run_tick: None,
                    avg_duration: Duration::ZERO,
                    registered_at: Utc::now(),
                },
            },
        );
        inner.stats.systems = inner.entries.len();
        info!(system = %name, %priority, "registered system");
        Ok(())
    }

    /// Remove a system, calling its `terminate` hook. Returns its last
    /// state.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::NotRegistered`] for unknown names.
    pub fn unregister_system(&self, name: &str) -> Result<SystemState, SchedulerError> {
        let entry = {
            let mut inner = self.inner.lock();
            let entry = inner
                .entries
                .remove(name)
                .ok_or_else(|| SchedulerError::NotRegistered(name.to_string()))?;
            inner.order.remove(&(entry.priority, entry.seq));
            inner.stats.systems = inner.entries.len();
            entry
        };
        entry
            .system
            .terminate(&TerminateReason::Unregistered, &entry.state);
        info!(system = %name, "unregistered system");
        Ok(entry.state)
    }

    /// Move a system to a new priority. Its state and registration order are
    /// kept.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::NotRegistered`] for unknown names.
    pub fn set_priority(&self, name: &str, priority: Priority) -> Result<(), SchedulerError> {
        let mut inner = self.inner.lock();
        let entry = inner
            .entries
            .get_mut(name)
            .ok_or_else(|| SchedulerError::NotRegistered(name.to_string()))?;
        let old = (entry.priority, entry.seq);
        entry.priority = priority;
        entry.stats.priority = priority;
        let new = (priority, entry.seq);
        inner.order.remove(&old);
        inner.order.insert(new, name.to_string());
        debug!(system = %name, %priority, "changed system priority");
        Ok(())
    }

    /// Registered system names in execution order.
    #[must_use]
    pub fn execution_order(&self) -> Vec<String> {
        self.inner.lock().order.values().cloned().collect()
    }

    #[must_use]
    pub fn is_registered(&self, name: &str) -> bool {
        self.inner.lock().entries.contains_key(name)
    }

    #[must_use]
    pub fn state(&self, name: &str) -> Option<SystemState> {
        self.inner.lock().entries.get(name).map(|e| e.state.clone())
    }

    #[must_use]
    pub fn system_config(&self, name: &str) -> Option<SystemConfig> {
        self.inner.lock().entries.get(name).map(|e| e.config.clone())
    }

    #[must_use]
    pub fn system_stats(&self, name: &str) -> Option<SystemStats> {
        self.inner.lock().entries.get(name).map(|e| e.stats.clone())
    }

    /// Stats for every system, in execution order.
    #[must_use]
    pub fn all_system_stats(&self) -> Vec<SystemStats> {
        let inner = self.inner.lock();
        inner
            .order
            .values()
            .filter_map(|name| inner.entries.get(name))
            .map(|e| e.stats.clone())
            .collect()
    }

    #[must_use]
    pub fn current_tick(&self) -> u64 {
        self.inner.lock().current_tick
    }

    #[must_use]
    pub fn stats(&self) -> SchedulerStats {
        let mut stats = self.inner.lock().stats.clone();
        stats.running = self.is_running();
        stats
    }

    /// Run one tick.
    ///
    /// The system table is locked only to take a snapshot of the due systems
    /// and to write each result back, so systems may call back into the
    /// scheduler while they run. Ticks are serialised; calling `tick` from a
    /// system deadlocks.
    pub fn tick(&self) -> TickReport {
        let _serial = self.tick_lock.lock();
        let start = Instant::now();
        let (tick_id, dt, planned) = {
            let mut inner = self.inner.lock();
            let tick_id = inner.current_tick + 1;
            let dt = inner
                .last_tick_at
                .map_or_else(|| self.config.tick_interval(), |at| start.duration_since(at))
                .as_secs_f64();
            inner.last_tick_at = Some(start);
            (tick_id, dt, inner.plan(tick_id))
        };

        let mut report = TickReport {
            tick_id,
            ..TickReport::default()
        };
        for run in planned {
            if !self.with_entry(&run, |_| ()) {
                continue;
            }
            if !run.ready {
                debug!(tick_id, system = %run.name, "dependencies not registered, skipping");
                self.with_entry(&run, |entry| entry.stats.skips += 1);
                report.skipped.push(run.name);
                continue;
            }

            let mut ctx = self.world.context(tick_id, dt);
            if !run.system.should_run(&ctx, &run.state) {
                self.with_entry(&run, |entry| entry.stats.skips += 1);
                report.skipped.push(run.name);
                continue;
            }

            let started = Instant::now();
            let outcome = match self.world.matching_entities(&run.system.query()) {
                Ok(entities) => panic::catch_unwind(AssertUnwindSafe(|| {
                    run_once(run.system.as_ref(), &mut ctx, &entities, run.state.clone())
                }))
                .unwrap_or_else(|payload| {
                    Err(SystemError::Panicked {
                        system: run.name.clone(),
                        message: panic_message(payload.as_ref()),
                    })
                }),
                Err(err) => Err(SystemError::failed(&run.name, err.to_string())),
            };
            let elapsed = started.elapsed();

            let error = outcome.as_ref().err().map(ToString::to_string);
            let kept = self.with_entry(&run, |entry| {
                entry.stats.runs += 1;
                entry.stats.last_run_tick = Some(tick_id);
                entry.stats.avg_duration =
                    running_mean(entry.stats.avg_duration, elapsed, entry.stats.runs);
                match outcome {
                    Ok(state) => entry.state = state,
                    Err(_) => {
                        entry.stats.failures += 1;
                        entry.stats.last_error.clone_from(&error);
                    }
                }
            });
            if !kept {
                debug!(tick_id, system = %run.name, "system unregistered while running");
            }
            match error {
                None => report.ran.push(run.name),
                Some(err) => {
                    warn!(tick_id, system = %run.name, error = %err, "system failed");
                    report.failed.push((run.name, err));
                }
            }
        }

        let mut inner = self.inner.lock();
        inner.current_tick = tick_id;
        let duration = start.elapsed();
        report.duration = duration;
        inner.stats.ticks += 1;
        inner.stats.last_tick = duration;
        inner.stats.avg_tick = running_mean(inner.stats.avg_tick, duration, inner.stats.ticks);

        let budget = self.config.budget();
        if !budget.is_zero() && duration > budget {
            inner.stats.overruns += 1;
            warn!(
                tick_id,
                elapsed_ms = duration.as_millis() as u64,
                budget_ms = budget.as_millis() as u64,
                "tick exceeded time budget"
            );
        }
        debug!(
            tick_id,
            dt,
            ran = report.ran.len(),
            failed = report.failed.len(),
            "tick complete"
        );
        report
    }

    /// Apply `f` to the entry `run` was planned from. Returns `false` if the
    /// system has been unregistered or replaced since.
    fn with_entry(&self, run: &PlannedRun, f: impl FnOnce(&mut Entry)) -> bool {
        let mut inner = self.inner.lock();
        match inner.entries.get_mut(&run.name) {
            Some(entry) if entry.seq == run.seq => {
                f(entry);
                true
            }
            _ => false,
        }
    }

    /// Start the automatic tick loop. Must be called from within a Tokio
    /// runtime.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::AlreadyRunning`] if a loop is active.
    pub fn start(self: &Arc<Self>) -> Result<(), SchedulerError> {
        let mut running = self.running.lock();
        if running.as_ref().is_some_and(|l| !l.is_finished()) {
            return Err(SchedulerError::AlreadyRunning);
        }
        *running = Some(tick::spawn_loop(Arc::clone(self)));
        Ok(())
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .is_some_and(|l| !l.is_finished())
    }

    /// Stop the tick loop. The next tick is cancelled; a tick already in
    /// progress finishes first. Returns the number of ticks the loop ran.
    pub async fn stop(&self) -> Option<u64> {
        let handle = self.running.lock().take()?;
        let ticks = handle.stop().await;
        info!(ticks, "scheduler stopped");
        Some(ticks)
    }

    /// Wait for the tick loop to end on its own (`max_ticks`) or through
    /// [`stop`](Self::stop). Returns the number of ticks it ran.
    pub async fn join(&self) -> Option<u64> {
        let finished = self.running.lock().as_ref().map(TickLoop::finished)?;
        Some(finished.await)
    }

    /// Terminate and remove every system. Signals the tick loop to stop
    /// without waiting for it.
    pub fn shutdown(&self) {
        if let Some(handle) = self.running.lock().as_ref() {
            handle.signal_stop();
        }
        let entries: Vec<Entry> = {
            let mut inner = self.inner.lock();
            inner.order.clear();
            inner.stats.systems = 0;
            inner.entries.drain().map(|(_, e)| e).collect()
        };
        for entry in &entries {
            entry
                .system
                .terminate(&TerminateReason::Shutdown, &entry.state);
        }
        info!(systems = entries.len(), "scheduler shut down");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{OnceLock, Weak};

    use engine_component::{ComponentQuery, ComponentType, EntityId, FieldType};
    use engine_entity::{CreateOptions, EntityChanges, EntityStatus};
    use engine_system::SystemContext;
    use serde_json::{Value, json};

    use super::*;

    type Log = Arc<Mutex<Vec<String>>>;

    struct Recorder {
        name: &'static str,
        priority: Priority,
        log: Log,
    }

    impl System for Recorder {
        fn name(&self) -> &str {
            self.name
        }

        fn priority(&self) -> Priority {
            self.priority
        }

        fn execute(
            &self,
            _ctx: &mut SystemContext,
            _entities: &[EntityId],
            state: SystemState,
        ) -> Result<SystemState, SystemError> {
            self.log.lock().push(self.name.to_string());
            let runs = state["runs"].as_u64().unwrap_or(0) + 1;
            Ok(json!({ "runs": runs }))
        }

        fn terminate(&self, reason: &TerminateReason, _state: &SystemState) {
            self.log.lock().push(format!("terminate:{}:{reason:?}", self.name));
        }
    }

    struct Flaky {
        fail_on: u64,
        panic: bool,
    }

    impl System for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }

        fn execute(
            &self,
            ctx: &mut SystemContext,
            _entities: &[EntityId],
            state: SystemState,
        ) -> Result<SystemState, SystemError> {
            if ctx.tick_id == self.fail_on {
                if self.panic {
                    panic!("boom");
                }
                return Err(SystemError::failed("flaky", "bad tick"));
            }
            Ok(json!({ "tick": ctx.tick_id }))
        }
    }

    struct Mover;

    impl System for Mover {
        fn name(&self) -> &str {
            "mover"
        }

        fn query(&self) -> ComponentQuery {
            ComponentQuery::new().require("position")
        }

        fn process_entity(
            &self,
            ctx: &mut SystemContext,
            entity: EntityId,
            components: &BTreeMap<String, Value>,
            state: SystemState,
        ) -> Result<SystemState, SystemError> {
            let x = components["position"]["x"].as_i64().unwrap_or(0);
            ctx.write(entity, "position", json!({ "x": x + 1 }))?;
            Ok(state)
        }
    }

    struct Refuses;

    impl System for Refuses {
        fn name(&self) -> &str {
            "refuses"
        }

        fn init(&self, _config: &SystemConfig) -> Result<SystemState, SystemError> {
            Err(SystemError::init_failed("refuses", "missing asset"))
        }
    }

    /// Calls back into its own scheduler while running.
    struct Janitor {
        scheduler: Arc<OnceLock<Weak<Scheduler>>>,
        log: Log,
    }

    impl System for Janitor {
        fn name(&self) -> &str {
            "janitor"
        }

        fn priority(&self) -> Priority {
            Priority::Critical
        }

        fn execute(
            &self,
            _ctx: &mut SystemContext,
            _entities: &[EntityId],
            state: SystemState,
        ) -> Result<SystemState, SystemError> {
            let scheduler = self
                .scheduler
                .get()
                .and_then(Weak::upgrade)
                .ok_or_else(|| SystemError::failed("janitor", "scheduler gone"))?;
            let order = scheduler.execution_order().join(",");
            self.log.lock().push(format!("order:{order}"));
            scheduler
                .unregister_system("victim")
                .map_err(|err| SystemError::failed("janitor", err.to_string()))?;
            Ok(state)
        }
    }

    fn make_scheduler() -> Scheduler {
        Scheduler::new(Arc::new(World::default()), SchedulerConfig::default())
    }

    fn make_recorder(name: &'static str, priority: Priority, log: &Log) -> Recorder {
        Recorder {
            name,
            priority,
            log: Arc::clone(log),
        }
    }

    #[test]
    fn test_priority_order() {
        let scheduler = make_scheduler();
        let log = Log::default();
        scheduler
            .register(make_recorder("low", Priority::Low, &log))
            .unwrap();
        scheduler
            .register(make_recorder("critical", Priority::Critical, &log))
            .unwrap();
        scheduler
            .register(make_recorder("medium", Priority::Medium, &log))
            .unwrap();
        scheduler
            .register(make_recorder("medium_2", Priority::Medium, &log))
            .unwrap();

        let report = scheduler.tick();
        assert_eq!(report.tick_id, 1);
        assert_eq!(*log.lock(), vec!["critical", "medium", "medium_2", "low"]);
        assert_eq!(scheduler.current_tick(), 1);
        assert_eq!(scheduler.state("low"), Some(json!({"runs": 1})));
    }

    #[test]
    fn test_duplicate_and_init_failure() {
        let scheduler = make_scheduler();
        let log = Log::default();
        scheduler
            .register(make_recorder("a", Priority::Medium, &log))
            .unwrap();
        assert!(matches!(
            scheduler.register(make_recorder("a", Priority::Low, &log)),
            Err(SchedulerError::DuplicateSystem(_))
        ));
        assert!(matches!(
            scheduler.register(Refuses),
            Err(SchedulerError::InitFailed { .. })
        ));
        assert_eq!(scheduler.execution_order(), vec!["a"]);
    }

    #[test]
    fn test_run_interval() {
        let scheduler = make_scheduler();
        let log = Log::default();
        scheduler
            .register_system(
                Arc::new(make_recorder("slow", Priority::Medium, &log)),
                SystemConfig::new("slow").with_run_interval(2),
            )
            .unwrap();
        let ran: Vec<bool> = (0..5)
            .map(|_| !scheduler.tick().ran.is_empty())
            .collect();
        assert_eq!(ran, vec![true, false, true, false, true]);
        assert_eq!(scheduler.system_stats("slow").unwrap().last_run_tick, Some(5));
    }

    #[test]
    fn test_failure_keeps_state_and_isolates() {
        for panic in [false, true] {
            let scheduler = make_scheduler();
            let log = Log::default();
            scheduler.register(Flaky { fail_on: 2, panic }).unwrap();
            scheduler
                .register(make_recorder("after", Priority::Low, &log))
                .unwrap();

            scheduler.tick();
            let report = scheduler.tick();
            assert_eq!(report.failed.len(), 1);
            assert_eq!(report.ran, vec!["after"]);
            assert_eq!(scheduler.state("flaky"), Some(json!({"tick": 1})));

            let stats = scheduler.system_stats("flaky").unwrap();
            assert_eq!(stats.runs, 2);
            assert_eq!(stats.failures, 1);
            assert!(stats.last_error.is_some());

            scheduler.tick();
            assert_eq!(scheduler.state("flaky"), Some(json!({"tick": 3})));
        }
    }

    #[test]
    fn test_set_priority_keeps_state() {
        let scheduler = make_scheduler();
        let log = Log::default();
        scheduler
            .register(make_recorder("a", Priority::High, &log))
            .unwrap();
        scheduler
            .register(make_recorder("b", Priority::Low, &log))
            .unwrap();
        scheduler.tick();

        scheduler.set_priority("b", Priority::Critical).unwrap();
        assert_eq!(scheduler.execution_order(), vec!["b", "a"]);
        assert_eq!(scheduler.state("b"), Some(json!({"runs": 1})));
        assert!(scheduler.set_priority("c", Priority::Low).is_err());
    }

    #[test]
    fn test_unregister_and_shutdown_terminate() {
        let scheduler = make_scheduler();
        let log = Log::default();
        scheduler
            .register(make_recorder("a", Priority::Medium, &log))
            .unwrap();
        scheduler
            .register(make_recorder("b", Priority::Medium, &log))
            .unwrap();

        scheduler.unregister_system("a").unwrap();
        assert!(log.lock().contains(&"terminate:a:Unregistered".to_string()));
        assert!(matches!(
            scheduler.unregister_system("a"),
            Err(SchedulerError::NotRegistered(_))
        ));

        scheduler.shutdown();
        assert!(log.lock().contains(&"terminate:b:Shutdown".to_string()));
        assert!(scheduler.execution_order().is_empty());
    }

    #[test]
    fn test_dependencies_gate_runs() {
        let scheduler = make_scheduler();
        let log = Log::default();
        scheduler
            .register_system(
                Arc::new(make_recorder("render", Priority::Medium, &log)),
                SystemConfig::new("render").with_dependency("physics"),
            )
            .unwrap();
        assert_eq!(scheduler.tick().skipped, vec!["render"]);

        scheduler
            .register(make_recorder("physics", Priority::High, &log))
            .unwrap();
        assert_eq!(scheduler.tick().ran, vec!["physics", "render"]);
    }

    #[test]
    fn test_system_can_call_scheduler_during_tick() {
        let scheduler = Arc::new(make_scheduler());
        let handle = Arc::new(OnceLock::new());
        let log = Log::default();
        scheduler
            .register(Janitor {
                scheduler: Arc::clone(&handle),
                log: Arc::clone(&log),
            })
            .unwrap();
        scheduler
            .register(make_recorder("victim", Priority::Low, &log))
            .unwrap();
        handle.set(Arc::downgrade(&scheduler)).unwrap();

        let report = scheduler.tick();
        assert_eq!(report.ran, vec!["janitor"]);
        assert_eq!(
            *log.lock(),
            vec!["order:janitor,victim", "terminate:victim:Unregistered"]
        );
        assert!(!scheduler.is_registered("victim"));
        assert_eq!(scheduler.system_stats("janitor").unwrap().runs, 1);
    }

    #[test]
    fn test_systems_see_only_active_entities() {
        let world = Arc::new(World::default());
        world
            .register_component(ComponentType::new("position").field("x", FieldType::Int))
            .unwrap();
        let a = world.create(CreateOptions::new()).unwrap();
        let b = world.create(CreateOptions::new()).unwrap();
        for id in [a, b] {
            world.store().put(id, "position", json!({"x": 0})).unwrap();
        }
        world
            .registry()
            .write()
            .update(b, EntityChanges::new().with_status(EntityStatus::Inactive))
            .unwrap();

        let scheduler = Scheduler::new(Arc::clone(&world), SchedulerConfig::default());
        scheduler.register(Mover).unwrap();
        scheduler.tick();

        assert_eq!(world.store().get(a, "position").unwrap(), json!({"x": 1}));
        assert_eq!(world.store().get(b, "position").unwrap(), json!({"x": 0}));
    }

    #[tokio::test]
    async fn test_loop_runs_max_ticks() {
        let scheduler = Arc::new(Scheduler::new(
            Arc::new(World::default()),
            SchedulerConfig::default()
                .with_tick_rate(1000.0)
                .with_max_ticks(3),
        ));
        scheduler.start().unwrap();
        assert_eq!(scheduler.join().await, Some(3));
        assert_eq!(scheduler.current_tick(), 3);
        assert!(!scheduler.is_running());
    }

    #[tokio::test]
    async fn test_start_twice_and_stop() {
        let scheduler = Arc::new(Scheduler::new(
            Arc::new(World::default()),
            SchedulerConfig::default().with_tick_rate(100.0),
        ));
        scheduler.start().unwrap();
        assert!(matches!(
            scheduler.start(),
            Err(SchedulerError::AlreadyRunning)
        ));

        tokio::time::sleep(Duration::from_millis(30)).await;
        let ticks = scheduler.stop().await.unwrap();
        assert!(ticks >= 1);
        assert_eq!(scheduler.current_tick(), ticks);
        assert_eq!(scheduler.stop().await, None);

        scheduler.start().unwrap();
        assert!(scheduler.stop().await.is_some());
    }
}
