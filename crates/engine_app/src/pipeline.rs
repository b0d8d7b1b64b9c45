//! Staged data pipelines.
//!
//! A [`Pipeline`] is an ordered list of named [`Stage`]s. Each stage's
//! output is the next stage's input. Systems in a sequential stage are
//! chained; systems in a parallel stage all receive the stage input and their
//! outputs are merged.
//!
//! Every stage owns a [`CircuitBreaker`]. While it is open the stage is
//! skipped and its input passes through unchanged.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use engine_system::{System, SystemError, run_once};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::breaker::{BreakerState, CircuitBreaker};
use crate::error::PipelineError;
use crate::metrics::WindowedRatio;
use crate::scheduler::panic_message;
use crate::world::World;

/// What a stage does when it fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorPolicy {
    /// Run the stage again with the same input, up to `max_retries` times.
    Retry,
    /// Pass the stage input on unchanged.
    Skip,
    /// Abort the run.
    #[default]
    Halt,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageConfig {
    pub parallel: bool,
    /// Per-system timeout in parallel mode.
    pub timeout: Duration,
    pub error_policy: ErrorPolicy,
    pub breaker_threshold: u32,
    /// Extra attempts under [`ErrorPolicy::Retry`].
    pub max_retries: u32,
    /// Number of recent runs the success ratio covers.
    pub stats_window: usize,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            parallel: false,
            timeout: Duration::from_secs(5),
            error_policy: ErrorPolicy::Halt,
            breaker_threshold: 5,
            max_retries: 3,
            stats_window: 100,
        }
    }
}

impl StageConfig {
    #[must_use]
    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_error_policy(mut self, error_policy: ErrorPolicy) -> Self {
        self.error_policy = error_policy;
        self
    }

    #[must_use]
    pub fn with_breaker_threshold(mut self, threshold: u32) -> Self {
        self.breaker_threshold = threshold;
        self
    }

    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    #[must_use]
    pub fn with_stats_window(mut self, window: usize) -> Self {
        self.stats_window = window;
        self
    }
}

/// A pure data-shaping step applied to a stage's input.
pub type Transformer = Arc<dyn Fn(Value) -> Value + Send + Sync>;

/// A named group of systems.
#[derive(Clone)]
pub struct Stage {
    name: String,
    systems: Vec<Arc<dyn System>>,
    transformers: Vec<Transformer>,
    config: StageConfig,
}

impl std::fmt::Debug for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stage")
            .field("name", &self.name)
            .field(
                "systems",
                &self.systems.iter().map(|s| s.name()).collect::<Vec<_>>(),
            )
            .field("transformers", &self.transformers.len())
            .field("config", &self.config)
            .finish()
    }
}

impl Stage {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            systems: Vec::new(),
            transformers: Vec::new(),
            config: StageConfig::default(),
        }
    }

    #[must_use]
    pub fn with_system(self, system: impl System) -> Self {
        self.with_shared_system(Arc::new(system))
    }

    #[must_use]
    pub fn with_shared_system(mut self, system: Arc<dyn System>) -> Self {
        self.systems.push(system);
        self
    }

    #[must_use]
    pub fn with_transformer(mut self, f: impl Fn(Value) -> Value + Send + Sync + 'static) -> Self {
        self.transformers.push(Arc::new(f));
        self
    }

    #[must_use]
    pub fn with_config(mut self, config: StageConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn config(&self) -> &StageConfig {
        &self.config
    }

    #[must_use]
    pub fn system_names(&self) -> Vec<String> {
        self.systems.iter().map(|s| s.name().to_string()).collect()
    }

    fn transform(&self, input: Value) -> Value {
        self.transformers.iter().fold(input, |data, f| f(data))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StageStatus {
    Completed,
    /// Failed and skipped under [`ErrorPolicy::Skip`].
    Skipped,
    /// Not run because the breaker was open.
    CircuitOpen,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageOutcome {
    pub stage: String,
    pub status: StageStatus,
    pub attempts: u32,
    pub duration: Duration,
}

/// Result of a pipeline run.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineRun {
    pub output: Value,
    pub stages: Vec<StageOutcome>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageStats {
    pub stage: String,
    /// Attempts, retries included.
    pub runs: u64,
    pub failures: u64,
    pub skips: u64,
    /// Success ratio over the most recent attempts.
    pub success_ratio: Option<f64>,
    pub breaker: BreakerState,
}

#[derive(Debug)]
struct StageRuntime {
    stage: Stage,
    breaker: CircuitBreaker,
    runs: u64,
    failures: u64,
    skips: u64,
    window: WindowedRatio,
}

impl StageRuntime {
    fn new(stage: Stage) -> Self {
        Self {
            breaker: CircuitBreaker::new(stage.config.breaker_threshold),
            window: WindowedRatio::new(stage.config.stats_window),
            stage,
            runs: 0,
            failures: 0,
            skips: 0,
        }
    }

    fn stats(&self) -> StageStats {
        StageStats {
            stage: self.stage.name.clone(),
            runs: self.runs,
            failures: self.failures,
            skips: self.skips,
            success_ratio: self.window.ratio(),
            breaker: self.breaker.state(),
        }
    }
}

fn run_system(
    world: &World,
    run_id: u64,
    system: &dyn System,
    input: Value,
    cancel: Option<Arc<AtomicBool>>,
) -> Result<Value, SystemError> {
    let query = system.query();
    let entities = if query.is_empty() {
        Vec::new()
    } else {
        world
            .matching_entities(&query)
            .map_err(|err| SystemError::failed(system.name(), err.to_string()))?
    };
    let mut ctx = world.context(run_id, 0.0);
    if let Some(flag) = cancel {
        ctx = ctx.with_cancellation(flag);
    }
    panic::catch_unwind(AssertUnwindSafe(|| {
        run_once(system, &mut ctx, &entities, input)
    }))
    .unwrap_or_else(|payload| {
        Err(SystemError::Panicked {
            system: system.name().to_string(),
            message: panic_message(payload.as_ref()),
        })
    })
}

/// Objects are merged key by key in system order; anything else is
/// collected into an array.
fn merge_outputs(mut outputs: Vec<Value>) -> Value {
    if outputs.len() == 1 {
        return outputs.remove(0);
    }
    if outputs.iter().all(Value::is_object) {
        let mut merged = Map::new();
        for output in outputs {
            if let Value::Object(map) = output {
                merged.extend(map);
            }
        }
        return Value::Object(merged);
    }
    Value::Array(outputs)
}

async fn execute_stage(
    world: &Arc<World>,
    stage: &Stage,
    run_id: u64,
    input: Value,
) -> Result<Value, PipelineError> {
    if !stage.config.parallel {
        return stage
            .systems
            .iter()
            .try_fold(input, |data, system| {
                run_system(world, run_id, system.as_ref(), data, None)
            })
            .map_err(|source| PipelineError::System {
                stage: stage.name.clone(),
                source,
            });
    }

    let timeout = stage.config.timeout;
    let tasks = stage.systems.iter().map(|system| {
        let system = Arc::clone(system);
        let world = Arc::clone(world);
        let input = input.clone();
        async move {
            let name = system.name().to_string();
            let cancel = Arc::new(AtomicBool::new(false));
            let handle = tokio::task::spawn_blocking({
                let world = Arc::clone(&world);
                let cancel = Arc::clone(&cancel);
                move || run_system(&world, run_id, system.as_ref(), input, Some(cancel))
            });
            let result = tokio::time::timeout(timeout, handle).await;
            if result.is_err() {
                // A write already past the flag check holds the registry
                // lock; waiting for it leaves no write in flight.
                cancel.store(true, Ordering::SeqCst);
                drop(world.registry().write());
                debug!(system = %name, "cancelled timed-out system");
            }
            (name, result)
        }
    });

    let mut outputs = Vec::with_capacity(stage.systems.len());
    for (system, result) in join_all(tasks).await {
        match result {
            Ok(Ok(Ok(output))) => outputs.push(output),
            Ok(Ok(Err(source))) => {
                return Err(PipelineError::System {
                    stage: stage.name.clone(),
                    source,
                });
            }
            Ok(Err(err)) => {
                return Err(PipelineError::Join {
                    stage: stage.name.clone(),
                    system,
                    reason: err.to_string(),
                });
            }
            Err(_) => {
                return Err(PipelineError::Timeout {
                    stage: stage.name.clone(),
                    system,
                    after: timeout,
                });
            }
        }
    }
    if outputs.is_empty() {
        return Ok(input);
    }
    Ok(merge_outputs(outputs))
}

/// An ordered chain of stages over a shared [`World`].
///
/// Systems with a non-empty query run over the world's matching active
/// entities and write through the world, so component writes bump entity
/// versions.
#[derive(Debug)]
pub struct Pipeline {
    name: String,
    world: Arc<World>,
    stages: Vec<StageRuntime>,
    runs: u64,
}

impl Pipeline {
    #[must_use]
    pub fn new(name: impl Into<String>, world: Arc<World>) -> Self {
        Self {
            name: name.into(),
            world,
            stages: Vec::new(),
            runs: 0,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn world(&self) -> &Arc<World> {
        &self.world
    }

    /// Append a stage.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::DuplicateStage`] if the name is taken.
    pub fn add_stage(&mut self, stage: Stage) -> Result<(), PipelineError> {
        if self.stages.iter().any(|s| s.stage.name == stage.name) {
            return Err(PipelineError::DuplicateStage(stage.name));
        }
        debug!(pipeline = %self.name, stage = %stage.name, "added stage");
        self.stages.push(StageRuntime::new(stage));
        Ok(())
    }

    /// # Errors
    ///
    /// Returns [`PipelineError::UnknownStage`] if no stage has this name.
    pub fn remove_stage(&mut self, name: &str) -> Result<Stage, PipelineError> {
        let pos = self.position(name)?;
        Ok(self.stages.remove(pos).stage)
    }

    /// Stage names in run order.
    #[must_use]
    pub fn stage_names(&self) -> Vec<String> {
        self.stages.iter().map(|s| s.stage.name.clone()).collect()
    }

    fn position(&self, name: &str) -> Result<usize, PipelineError> {
        self.stages
            .iter()
            .position(|s| s.stage.name == name)
            .ok_or_else(|| PipelineError::UnknownStage(name.to_string()))
    }

    /// Close a stage's breaker and clear its failure count.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::UnknownStage`] if no stage has this name.
    pub fn reset_breaker(&mut self, name: &str) -> Result<(), PipelineError> {
        let pos = self.position(name)?;
        self.stages[pos].breaker.reset();
        info!(pipeline = %self.name, stage = %name, "circuit breaker reset");
        Ok(())
    }

    #[must_use]
    pub fn breaker(&self, name: &str) -> Option<&CircuitBreaker> {
        self.stages
            .iter()
            .find(|s| s.stage.name == name)
            .map(|s| &s.breaker)
    }

    #[must_use]
    pub fn stage_stats(&self, name: &str) -> Option<StageStats> {
        self.stages
            .iter()
            .find(|s| s.stage.name == name)
            .map(StageRuntime::stats)
    }

    #[must_use]
    pub fn all_stage_stats(&self) -> Vec<StageStats> {
        self.stages.iter().map(StageRuntime::stats).collect()
    }

    /// Run every stage in order, feeding each stage's output to the next.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Halted`] when a stage with
    /// [`ErrorPolicy::Halt`] fails, or [`PipelineError::RetriesExhausted`]
    /// when a stage with [`ErrorPolicy::Retry`] fails on every attempt.
    pub async fn run(&mut self, input: Value) -> Result<PipelineRun, PipelineError> {
        self.runs += 1;
        let run_id = self.runs;
        let mut data = input;
        let mut outcomes = Vec::with_capacity(self.stages.len());

        for runtime in &mut self.stages {
            let started = Instant::now();
            let stage_name = runtime.stage.name.clone();

            if runtime.breaker.is_open() {
                info!(pipeline = %self.name, stage = %stage_name, "circuit open, skipping stage");
                runtime.skips += 1;
                outcomes.push(StageOutcome {
                    stage: stage_name,
                    status: StageStatus::CircuitOpen,
                    attempts: 0,
                    duration: started.elapsed(),
                });
                continue;
            }

            let staged = runtime.stage.transform(data.clone());
            let mut attempts = 0u32;
            let status = loop {
                attempts += 1;
                runtime.runs += 1;
                let err =
                    match execute_stage(&self.world, &runtime.stage, run_id, staged.clone()).await {
                        Ok(output) => {
                            runtime.breaker.record_success();
                            runtime.window.record(true);
                            data = output;
                            break StageStatus::Completed;
                        }
                        Err(err) => err,
                    };

                runtime.failures += 1;
                runtime.window.record(false);
                warn!(
                    pipeline = %self.name,
                    stage = %stage_name,
                    attempt = attempts,
                    error = %err,
                    "stage failed"
                );
                if runtime.breaker.record_failure() {
                    warn!(
                        pipeline = %self.name,
                        stage = %stage_name,
                        failures = runtime.breaker.failures(),
                        "circuit breaker opened"
                    );
                }

                match runtime.stage.config.error_policy {
                    ErrorPolicy::Halt => {
                        return Err(PipelineError::Halted {
                            stage: stage_name,
                            source: Box::new(err),
                        });
                    }
                    ErrorPolicy::Skip => {
                        runtime.skips += 1;
                        break StageStatus::Skipped;
                    }
                    ErrorPolicy::Retry => {
                        if runtime.breaker.is_open() {
                            info!(pipeline = %self.name, stage = %stage_name, "circuit open, skipping stage");
                            runtime.skips += 1;
                            break StageStatus::CircuitOpen;
                        }
                        if attempts > runtime.stage.config.max_retries {
                            return Err(PipelineError::RetriesExhausted {
                                stage: stage_name,
                                attempts,
                                source: Box::new(err),
                            });
                        }
                    }
                }
            };

            outcomes.push(StageOutcome {
                stage: stage_name,
                status,
                attempts,
                duration: started.elapsed(),
            });
        }

        debug!(pipeline = %self.name, run_id, stages = outcomes.len(), "pipeline run complete");
        Ok(PipelineRun {
            output: data,
            stages: outcomes,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use engine_component::{ComponentQuery, ComponentType, EntityId, FieldType};
    use engine_entity::CreateOptions;
    use engine_system::{SystemContext, SystemState};
    use serde_json::json;

    use super::*;

    /// Adds `amount` to the input's `value` field.
    struct Add {
        name: &'static str,
        amount: i64,
    }

    impl System for Add {
        fn name(&self) -> &str {
            self.name
        }

        fn execute(
            &self,
            _ctx: &mut SystemContext,
            _entities: &[EntityId],
            mut state: SystemState,
        ) -> Result<SystemState, SystemError> {
            let value = state["value"].as_i64().unwrap_or(0);
            state["value"] = json!(value + self.amount);
            Ok(state)
        }
    }

    /// Sets `key` to `true` on the input.
    struct Mark(&'static str);

    impl System for Mark {
        fn name(&self) -> &str {
            self.0
        }

        fn execute(
            &self,
            _ctx: &mut SystemContext,
            _entities: &[EntityId],
            _state: SystemState,
        ) -> Result<SystemState, SystemError> {
            Ok(json!({ (self.0): true }))
        }
    }

    /// Fails while `failing` is set, or for its first `fail_first` calls.
    struct Unreliable {
        calls: Arc<AtomicUsize>,
        failing: Arc<AtomicBool>,
        fail_first: usize,
    }

    impl System for Unreliable {
        fn name(&self) -> &str {
            "unreliable"
        }

        fn execute(
            &self,
            _ctx: &mut SystemContext,
            _entities: &[EntityId],
            state: SystemState,
        ) -> Result<SystemState, SystemError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) || call < self.fail_first {
                return Err(SystemError::failed("unreliable", "service down"));
            }
            Ok(state)
        }
    }

    struct Sleeper;

    impl System for Sleeper {
        fn name(&self) -> &str {
            "sleeper"
        }

        fn execute(
            &self,
            _ctx: &mut SystemContext,
            _entities: &[EntityId],
            state: SystemState,
        ) -> Result<SystemState, SystemError> {
            std::thread::sleep(Duration::from_millis(200));
            Ok(state)
        }
    }

    /// Lists the entities it was handed.
    struct Census;

    impl System for Census {
        fn name(&self) -> &str {
            "census"
        }

        fn query(&self) -> ComponentQuery {
            ComponentQuery::new().require("position")
        }

        fn execute(
            &self,
            _ctx: &mut SystemContext,
            entities: &[EntityId],
            _state: SystemState,
        ) -> Result<SystemState, SystemError> {
            let seen: Vec<String> = entities.iter().map(ToString::to_string).collect();
            Ok(json!({ "seen": seen }))
        }
    }

    /// Writes to `target` after outliving its stage timeout.
    struct LateWriter {
        target: EntityId,
        refused: Arc<AtomicBool>,
    }

    impl System for LateWriter {
        fn name(&self) -> &str {
            "late_writer"
        }

        fn execute(
            &self,
            ctx: &mut SystemContext,
            _entities: &[EntityId],
            state: SystemState,
        ) -> Result<SystemState, SystemError> {
            std::thread::sleep(Duration::from_millis(100));
            let written = ctx.write(self.target, "position", json!({"x": 99}));
            if matches!(written, Err(SystemError::Cancelled { .. })) {
                self.refused.store(true, Ordering::SeqCst);
            }
            written?;
            Ok(state)
        }
    }

    fn make_world() -> Arc<World> {
        let world = Arc::new(World::default());
        world
            .register_component(ComponentType::new("position").field("x", FieldType::Int))
            .unwrap();
        world
    }

    fn make_pipeline() -> Pipeline {
        Pipeline::new("test", make_world())
    }

    fn make_unreliable(fail_first: usize) -> (Unreliable, Arc<AtomicUsize>, Arc<AtomicBool>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let failing = Arc::new(AtomicBool::new(false));
        let system = Unreliable {
            calls: Arc::clone(&calls),
            failing: Arc::clone(&failing),
            fail_first,
        };
        (system, calls, failing)
    }

    #[tokio::test]
    async fn test_sequential_stages_chain() {
        let mut pipeline = make_pipeline();
        pipeline
            .add_stage(
                Stage::new("add")
                    .with_system(Add { name: "two", amount: 2 })
                    .with_system(Add { name: "three", amount: 3 }),
            )
            .unwrap();
        pipeline
            .add_stage(
                Stage::new("double")
                    .with_transformer(|mut v| {
                        let value = v["value"].as_i64().unwrap_or(0);
                        v["value"] = json!(value * 2);
                        v
                    })
                    .with_system(Add { name: "one", amount: 1 }),
            )
            .unwrap();

        let run = pipeline.run(json!({"value": 1})).await.unwrap();
        assert_eq!(run.output, json!({"value": 13}));
        assert!(run.stages.iter().all(|s| s.status == StageStatus::Completed));
        assert!(matches!(
            pipeline.add_stage(Stage::new("add")),
            Err(PipelineError::DuplicateStage(_))
        ));
    }

    #[tokio::test]
    async fn test_parallel_stage_merges_outputs() {
        let mut pipeline = make_pipeline();
        pipeline
            .add_stage(
                Stage::new("mark")
                    .with_system(Mark("a"))
                    .with_system(Mark("b"))
                    .with_config(StageConfig::default().with_parallel(true)),
            )
            .unwrap();

        let run = pipeline.run(json!({})).await.unwrap();
        assert_eq!(run.output, json!({"a": true, "b": true}));
    }

    #[tokio::test]
    async fn test_parallel_timeout_halts() {
        let mut pipeline = make_pipeline();
        pipeline
            .add_stage(
                Stage::new("slow").with_system(Sleeper).with_config(
                    StageConfig::default()
                        .with_parallel(true)
                        .with_timeout(Duration::from_millis(20)),
                ),
            )
            .unwrap();

        let err = pipeline.run(json!({})).await.unwrap_err();
        match err {
            PipelineError::Halted { stage, source } => {
                assert_eq!(stage, "slow");
                assert!(matches!(*source, PipelineError::Timeout { .. }));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_breaker_opens_and_resets() {
        let (system, calls, failing) = make_unreliable(0);
        failing.store(true, Ordering::SeqCst);
        let mut pipeline = make_pipeline();
        pipeline
            .add_stage(
                Stage::new("flaky").with_system(system).with_config(
                    StageConfig::default()
                        .with_error_policy(ErrorPolicy::Skip)
                        .with_breaker_threshold(3),
                ),
            )
            .unwrap();

        for _ in 0..3 {
            let run = pipeline.run(json!({"n": 1})).await.unwrap();
            assert_eq!(run.output, json!({"n": 1}));
            assert_eq!(run.stages[0].status, StageStatus::Skipped);
        }
        assert_eq!(pipeline.breaker("flaky").unwrap().state(), BreakerState::Open);

        let run = pipeline.run(json!({"n": 1})).await.unwrap();
        assert_eq!(run.stages[0].status, StageStatus::CircuitOpen);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        pipeline.reset_breaker("flaky").unwrap();
        failing.store(false, Ordering::SeqCst);
        let run = pipeline.run(json!({"n": 1})).await.unwrap();
        assert_eq!(run.stages[0].status, StageStatus::Completed);

        let breaker = pipeline.breaker("flaky").unwrap();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.failures(), 0);

        let stats = pipeline.stage_stats("flaky").unwrap();
        assert_eq!(stats.runs, 4);
        assert_eq!(stats.failures, 3);
        assert_eq!(stats.skips, 4);
        assert_eq!(stats.success_ratio, Some(0.25));
    }

    #[tokio::test]
    async fn test_retry_policy() {
        let (system, calls, _) = make_unreliable(2);
        let mut pipeline = make_pipeline();
        pipeline
            .add_stage(
                Stage::new("retrying").with_system(system).with_config(
                    StageConfig::default()
                        .with_error_policy(ErrorPolicy::Retry)
                        .with_max_retries(3),
                ),
            )
            .unwrap();
        let run = pipeline.run(json!({"id": 7})).await.unwrap();
        assert_eq!(run.output, json!({"id": 7}));
        assert_eq!(run.stages[0].attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let (system, _, failing) = make_unreliable(0);
        failing.store(true, Ordering::SeqCst);
        let mut pipeline = make_pipeline();
        pipeline
            .add_stage(
                Stage::new("doomed").with_system(system).with_config(
                    StageConfig::default()
                        .with_error_policy(ErrorPolicy::Retry)
                        .with_max_retries(2)
                        .with_breaker_threshold(10),
                ),
            )
            .unwrap();
        assert!(matches!(
            pipeline.run(json!(null)).await,
            Err(PipelineError::RetriesExhausted { attempts: 3, .. })
        ));
    }

    #[tokio::test]
    async fn test_reset_unknown_stage() {
        let mut pipeline = make_pipeline();
        assert!(matches!(
            pipeline.reset_breaker("nope"),
            Err(PipelineError::UnknownStage(_))
        ));
        assert!(pipeline.breaker("nope").is_none());
    }

    #[tokio::test]
    async fn test_systems_skip_destroyed_entities() {
        let world = make_world();
        let mut ids = Vec::new();
        for _ in 0..3 {
            let id = world.create(CreateOptions::new()).unwrap();
            world.put_component(id, "position", json!({"x": 0})).unwrap();
            ids.push(id);
        }
        world.destroy(ids[1]).unwrap();

        let mut pipeline = Pipeline::new("census", Arc::clone(&world));
        pipeline
            .add_stage(Stage::new("count").with_system(Census))
            .unwrap();
        let run = pipeline.run(json!({})).await.unwrap();
        assert_eq!(run.output, json!({"seen": [ids[0].to_string(), ids[2].to_string()]}));
    }

    #[tokio::test]
    async fn test_timed_out_system_cannot_write() {
        let world = make_world();
        let target = world.create(CreateOptions::new()).unwrap();
        world.put_component(target, "position", json!({"x": 1})).unwrap();
        let version = world.registry().read().get(target).unwrap().version;
        let refused = Arc::new(AtomicBool::new(false));

        let mut pipeline = Pipeline::new("late", Arc::clone(&world));
        pipeline
            .add_stage(
                Stage::new("slow")
                    .with_system(LateWriter {
                        target,
                        refused: Arc::clone(&refused),
                    })
                    .with_config(
                        StageConfig::default()
                            .with_parallel(true)
                            .with_timeout(Duration::from_millis(20)),
                    ),
            )
            .unwrap();
        assert!(pipeline.run(json!({})).await.is_err());

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(refused.load(Ordering::SeqCst));
        assert_eq!(world.store().get(target, "position").unwrap(), json!({"x": 1}));
        assert_eq!(world.registry().read().get(target).unwrap().version, version);
    }
}
