//! The DAG scheduler.
//!
//! One cooperative loop owns all scheduling state. Ready nodes are
//! dispatched in declaration order under the concurrency cap; container
//! activities run on a `JoinSet` and their completions are consumed one at
//! a time, so readiness updates and output commitment need no locking.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::events::{EventKind, EventWriter, RunEvent};
use super::graph::Graph;
use super::plumbing;
use crate::condition;
use crate::error::{Error, ErrorKind, Result};
use crate::model::{
    validate_workflow, Artifact, DagNode, DagWorkflow, NodeResult, NodeStatus, OutputDefinition,
    RunIds, RunResult, StepOutputs,
};
use crate::outputs::extract_outputs;
use crate::runtime::LaunchSpec;
use crate::store::{run_prefix, ArtifactStore};
use crate::template::{self, TemplateContext};

/// One dispatched step, handed to the executor.
#[derive(Debug)]
pub struct StepRun {
    pub node: String,
    pub launch: LaunchSpec,
    pub cancel: CancellationToken,
}

/// The container-execution seam.
///
/// Production plugs in the container runner; tests substitute fakes that
/// fabricate [`NodeResult`]s.
pub trait StepExecutor: Send + Sync + 'static {
    fn execute(&self, step: StepRun) -> impl Future<Output = NodeResult> + Send;
}

/// Engine tunables beyond what the workflow itself carries.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Host directory for per-node artifact staging.
    pub staging_dir: PathBuf,
    /// Budget for each exit handler.
    pub handler_timeout: Duration,
    /// Delete the run's artifacts after a successful run.
    pub enable_cleanup: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            staging_dir: std::env::temp_dir().join("stevedore"),
            handler_timeout: Duration::from_secs(300),
            enable_cleanup: false,
        }
    }
}

/// Executes validated workflows.
pub struct Engine<E: StepExecutor> {
    executor: Arc<E>,
    store: Option<Arc<dyn ArtifactStore>>,
    config: EngineConfig,
    event_tx: Option<mpsc::UnboundedSender<RunEvent>>,
    event_writer: Option<std::sync::Mutex<EventWriter>>,
}

impl<E: StepExecutor> Engine<E> {
    pub fn new(executor: E) -> Self {
        Self {
            executor: Arc::new(executor),
            store: None,
            config: EngineConfig::default(),
            event_tx: None,
            event_writer: None,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn ArtifactStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Stream run events to the given channel.
    pub fn with_events(mut self, tx: mpsc::UnboundedSender<RunEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// Append run events to a JSONL file.
    pub fn with_event_log(mut self, path: &std::path::Path) -> Result<Self> {
        self.event_writer = Some(std::sync::Mutex::new(EventWriter::create(path)?));
        Ok(self)
    }

    /// Execute with generated run identity and no external cancellation.
    pub async fn execute(
        &self,
        workflow: &DagWorkflow,
        params: &HashMap<String, String>,
    ) -> Result<RunResult> {
        let ids = RunIds::generate(workflow.workflow_id.clone());
        self.execute_run(workflow, params, ids, CancellationToken::new())
            .await
    }

    /// Execute a workflow run to completion.
    ///
    /// Validation failures return `Err` before any container starts; every
    /// later failure is folded into the returned [`RunResult`].
    pub async fn execute_run(
        &self,
        workflow: &DagWorkflow,
        params: &HashMap<String, String>,
        ids: RunIds,
        cancel: CancellationToken,
    ) -> Result<RunResult> {
        validate_workflow(workflow)?;

        let needs_store = workflow
            .nodes
            .iter()
            .any(|n| !n.input_artifacts.is_empty() || !n.output_artifacts.is_empty());
        if needs_store && self.store.is_none() {
            return Err(Error::Validation(
                "workflow declares artifacts but no artifact store is configured".into(),
            ));
        }

        let started = Instant::now();
        info!(
            workflow_id = %ids.workflow_id,
            run_id = %ids.run_id,
            nodes = workflow.nodes.len(),
            fail_fast = workflow.fail_fast,
            max_concurrency = workflow.max_concurrency,
            "starting workflow run"
        );
        self.emit(RunEvent::new(
            EventKind::RunStarted,
            None,
            serde_json::json!({
                "workflow_id": ids.workflow_id,
                "run_id": ids.run_id,
            }),
        ));

        let mut state = RunState::new(workflow);
        state.seed();
        self.drain_events(&mut state);

        let cap = if workflow.max_concurrency == 0 {
            usize::MAX
        } else {
            workflow.max_concurrency
        };

        let mut join_set: JoinSet<NodeResult> = JoinSet::new();
        let mut task_nodes: HashMap<tokio::task::Id, String> = HashMap::new();
        let mut running = 0usize;
        let mut canceled = false;

        loop {
            if !state.halted && !canceled {
                while running < cap && !state.halted {
                    let Some(name) = state.next_ready() else { break };
                    self.dispatch(
                        &mut state,
                        &mut join_set,
                        &mut task_nodes,
                        &name,
                        &ids,
                        &cancel,
                        params,
                        &mut running,
                    );
                }
                self.drain_events(&mut state);
            }

            if join_set.is_empty() {
                if state.all_terminal() {
                    break;
                }
                if state.halted || canceled {
                    state.skip_all_unstarted("skipped: run halted");
                    self.drain_events(&mut state);
                    if state.all_terminal() {
                        break;
                    }
                }
                if state.next_ready().is_some() {
                    continue;
                }
                return Err(Error::Internal(
                    "scheduler stalled: nothing running and work not terminal".into(),
                ));
            }

            tokio::select! {
                biased;

                _ = cancel.cancelled(), if !canceled => {
                    warn!(run_id = %ids.run_id, "run canceled; draining running steps");
                    canceled = true;
                    state.skip_all_unstarted("skipped: run canceled");
                    self.drain_events(&mut state);
                }

                joined = join_set.join_next_with_id() => {
                    match joined {
                        Some(Ok((task_id, result))) => {
                            running = running.saturating_sub(1);
                            task_nodes.remove(&task_id);
                            state.record_termination(result);
                        }
                        Some(Err(join_err)) => {
                            running = running.saturating_sub(1);
                            let name = task_nodes
                                .remove(&join_err.id())
                                .unwrap_or_else(|| "unknown".to_string());
                            let error = Error::Internal(format!("step task failed: {join_err}"));
                            state.record_termination(NodeResult::failed(&name, &error));
                        }
                        None => {}
                    }
                    self.drain_events(&mut state);
                }
            }
        }

        // Exit handlers run exactly once, after every graph node is
        // terminal, whatever the outcome.
        let handler_results = self
            .run_exit_handlers(workflow, params, &state.outputs)
            .await;

        let success = !canceled && state.fatal.is_empty();

        if success && self.config.enable_cleanup {
            if let Some(store) = &self.store {
                match store.delete_prefix(&run_prefix(&ids)).await {
                    Ok(removed) => debug!(run_id = %ids.run_id, removed, "run artifacts cleaned up"),
                    Err(e) => warn!(run_id = %ids.run_id, error = %e, "artifact cleanup failed"),
                }
            }
        }

        let mut succeeded = Vec::new();
        let mut failed = Vec::new();
        let mut skipped = Vec::new();
        for name in &state.graph.order {
            match state.status.get(name) {
                Some(NodeStatus::Succeeded) => succeeded.push(name.clone()),
                Some(NodeStatus::Failed) => failed.push(name.clone()),
                _ => skipped.push(name.clone()),
            }
        }

        let result = RunResult {
            workflow_id: ids.workflow_id.clone(),
            run_id: ids.run_id.clone(),
            success,
            canceled,
            node_results: state.results,
            total_success: succeeded.len(),
            total_failed: failed.len(),
            total_skipped: skipped.len(),
            succeeded,
            failed,
            skipped,
            duration_ms: started.elapsed().as_millis() as u64,
            handler_results,
        };

        self.emit(RunEvent::new(
            EventKind::RunFinished,
            None,
            serde_json::json!({
                "success": result.success,
                "canceled": result.canceled,
                "succeeded": result.total_success,
                "failed": result.total_failed,
                "skipped": result.total_skipped,
            }),
        ));
        info!(
            run_id = %ids.run_id,
            success = result.success,
            succeeded = result.total_success,
            failed = result.total_failed,
            skipped = result.total_skipped,
            duration_ms = result.duration_ms,
            "workflow run complete"
        );

        Ok(result)
    }

    #[allow(clippy::too_many_arguments)]
    fn dispatch(
        &self,
        state: &mut RunState<'_>,
        join_set: &mut JoinSet<NodeResult>,
        task_nodes: &mut HashMap<tokio::task::Id, String>,
        name: &str,
        ids: &RunIds,
        cancel: &CancellationToken,
        params: &HashMap<String, String>,
        running: &mut usize,
    ) {
        let Some(node) = state.workflow.node(name).cloned() else {
            let error = Error::Internal(format!("dispatched unknown node '{name}'"));
            state.record_termination(NodeResult::failed(name, &error));
            return;
        };

        let launch = match self.prepare_launch(state, &node, params) {
            Ok(launch) => launch,
            Err(e) => {
                state.record_termination(NodeResult::failed(name, &e));
                return;
            }
        };

        let input_plan = match input_plan(state.workflow, &node) {
            Ok(plan) => plan,
            Err(e) => {
                state.record_termination(NodeResult::failed(name, &e));
                return;
            }
        };

        state.mark_running(name);
        *running += 1;
        debug!(node = name, "dispatching");
        state.push_event(EventKind::NodeStarted, Some(name.to_string()), serde_json::json!({}));

        let executor = Arc::clone(&self.executor);
        let store = self.store.clone();
        let ids = ids.clone();
        let staging_dir = self.config.staging_dir.clone();
        let node_name = name.to_string();
        let output_defs = node.outputs.clone();
        let output_artifacts = node.output_artifacts.clone();
        let cancel = cancel.clone();

        let handle = join_set.spawn(run_step(
            executor,
            store,
            ids,
            staging_dir,
            node_name.clone(),
            launch,
            input_plan,
            output_artifacts,
            output_defs,
            cancel,
        ));
        task_nodes.insert(handle.id(), node_name);
    }

    fn prepare_launch(
        &self,
        state: &RunState<'_>,
        node: &DagNode,
        params: &HashMap<String, String>,
    ) -> Result<LaunchSpec> {
        let ctx = TemplateContext {
            params,
            node_params: Some(&node.params),
            iteration: node.iteration.as_ref(),
            outputs: &state.outputs,
        };
        let mut rendered = template::render_spec(&node.container, &ctx)?;

        for mapping in &node.input_mappings {
            let Some((step, output)) = mapping.parse_source() else {
                return Err(Error::Internal(format!(
                    "input mapping '{}' unparsed past validation",
                    mapping.source
                )));
            };
            let value = state
                .outputs
                .output(step, output)
                .map(str::to_string)
                .or_else(|| mapping.default.clone());
            match value {
                Some(value) => {
                    rendered.env.insert(mapping.env.clone(), value);
                }
                None if mapping.required => {
                    return Err(Error::Template(format!(
                        "required input mapping '{}' resolved no value",
                        mapping.source
                    )));
                }
                None => {
                    debug!(node = %node.name, source = %mapping.source, "optional input mapping unresolved");
                }
            }
        }

        if rendered.name.is_empty() {
            rendered.name = node.name.clone();
        }

        Ok(LaunchSpec {
            spec: rendered,
            extra_binds: Vec::new(),
            resources: node.resources.clone(),
        })
    }

    async fn run_exit_handlers(
        &self,
        workflow: &DagWorkflow,
        params: &HashMap<String, String>,
        outputs: &StepOutputs,
    ) -> Vec<NodeResult> {
        let mut results = Vec::new();

        for (idx, spec) in workflow.exit_handlers.iter().enumerate() {
            let name = if spec.name.is_empty() {
                format!("handler-{idx}")
            } else {
                spec.name.clone()
            };

            self.emit(RunEvent::new(
                EventKind::HandlerStarted,
                Some(name.clone()),
                serde_json::json!({}),
            ));

            let ctx = TemplateContext {
                params,
                node_params: None,
                iteration: None,
                outputs,
            };

            let result = match template::render_spec(spec, &ctx) {
                Err(e) => NodeResult::failed(&name, &e),
                Ok(rendered) => {
                    let handler_cancel = CancellationToken::new();
                    let step = StepRun {
                        node: name.clone(),
                        launch: LaunchSpec::new(rendered),
                        cancel: handler_cancel.clone(),
                    };
                    let fut = self.executor.execute(step);
                    tokio::pin!(fut);
                    tokio::select! {
                        result = &mut fut => result,
                        _ = tokio::time::sleep(self.config.handler_timeout) => {
                            handler_cancel.cancel();
                            let mut result = fut.await;
                            fail_result(&mut result, &Error::RunTimeout(format!(
                                "exit handler did not finish within {}s",
                                self.config.handler_timeout.as_secs()
                            )));
                            result
                        }
                    }
                }
            };

            if !result.success {
                warn!(handler = %name, error = ?result.error, "exit handler failed");
            }
            self.emit(RunEvent::new(
                EventKind::HandlerFinished,
                Some(name),
                serde_json::json!({ "success": result.success }),
            ));
            results.push(result);
        }

        results
    }

    fn emit(&self, event: RunEvent) {
        if let Some(writer) = &self.event_writer {
            if let Ok(mut writer) = writer.lock() {
                if let Err(e) = writer.write_event(&event) {
                    warn!(error = %e, "failed to persist run event");
                }
            }
        }
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event);
        }
    }

    fn drain_events(&self, state: &mut RunState<'_>) {
        for event in state.events.drain(..) {
            if let Some(writer) = &self.event_writer {
                if let Ok(mut writer) = writer.lock() {
                    if let Err(e) = writer.write_event(&event) {
                        warn!(error = %e, "failed to persist run event");
                    }
                }
            }
            if let Some(tx) = &self.event_tx {
                let _ = tx.send(event);
            }
        }
    }
}

/// Resolve each input artifact to its producing step.
fn input_plan(workflow: &DagWorkflow, node: &DagNode) -> Result<Vec<(Artifact, Option<String>)>> {
    node.input_artifacts
        .iter()
        .map(|artifact| {
            crate::model::resolve_input_producer(workflow, node, artifact)
                .map(|producer| (artifact.clone(), producer))
        })
        .collect()
}

/// The per-node activity: stage inputs, run the container, extract
/// outputs, upload output artifacts. Every failure folds into the result.
#[allow(clippy::too_many_arguments)]
async fn run_step<E: StepExecutor>(
    executor: Arc<E>,
    store: Option<Arc<dyn ArtifactStore>>,
    ids: RunIds,
    staging_dir: PathBuf,
    node_name: String,
    mut launch: LaunchSpec,
    input_plan: Vec<(Artifact, Option<String>)>,
    output_artifacts: Vec<Artifact>,
    output_defs: Vec<OutputDefinition>,
    cancel: CancellationToken,
) -> NodeResult {
    let staged = match plumbing::stage(
        store.as_deref(),
        &ids,
        &node_name,
        &input_plan,
        &output_artifacts,
        &staging_dir,
    )
    .await
    {
        Ok(staged) => staged,
        Err(e) => return NodeResult::failed(&node_name, &e),
    };

    launch.extra_binds = staged.binds.clone();

    let mut result = executor
        .execute(StepRun {
            node: node_name.clone(),
            launch,
            cancel,
        })
        .await;

    if result.success {
        match extract_outputs(&output_defs, &result.stdout, &result.stderr, |path| {
            staged.resolve(path)
        }) {
            Ok(values) => result.outputs = values,
            Err(e) => fail_result(&mut result, &e),
        }
    }

    if result.success {
        if let Err(e) = plumbing::collect_outputs(
            store.as_deref(),
            &ids,
            &node_name,
            &output_artifacts,
            &staged,
        )
        .await
        {
            fail_result(&mut result, &e);
        }
    }

    staged.cleanup().await;
    result
}

fn fail_result(result: &mut NodeResult, error: &Error) {
    result.success = false;
    result.status = NodeStatus::Failed;
    result.error = Some(error.to_string());
    result.error_kind = Some(error.kind());
}

// ---------------------------------------------------------------------------
// Scheduling state
// ---------------------------------------------------------------------------

/// All mutable state of one run, owned by the scheduler loop.
struct RunState<'wf> {
    workflow: &'wf DagWorkflow,
    graph: Graph,
    status: HashMap<String, NodeStatus>,
    in_degree: HashMap<String, usize>,
    outputs: StepOutputs,
    results: Vec<NodeResult>,
    /// Nodes whose failure was not forgiven by `continue_on_*`.
    fatal: HashSet<String>,
    halted: bool,
    /// Buffered events, drained by the engine after each mutation batch.
    events: Vec<RunEvent>,
}

impl<'wf> RunState<'wf> {
    fn new(workflow: &'wf DagWorkflow) -> Self {
        let graph = Graph::build(workflow);
        let status = graph
            .order
            .iter()
            .map(|n| (n.clone(), NodeStatus::Pending))
            .collect();
        let in_degree = graph.in_degree.clone();
        Self {
            workflow,
            graph,
            status,
            in_degree,
            outputs: StepOutputs::new(),
            results: Vec::new(),
            fatal: HashSet::new(),
            halted: false,
            events: Vec::new(),
        }
    }

    fn push_event(&mut self, kind: EventKind, node: Option<String>, data: serde_json::Value) {
        self.events.push(RunEvent::new(kind, node, data));
    }

    fn all_terminal(&self) -> bool {
        self.status.values().all(NodeStatus::is_terminal)
    }

    /// First declaration-order node that is ready to dispatch.
    fn next_ready(&self) -> Option<String> {
        self.graph
            .order
            .iter()
            .find(|n| self.status.get(n.as_str()) == Some(&NodeStatus::Ready))
            .cloned()
    }

    fn mark_running(&mut self, name: &str) {
        self.status.insert(name.to_string(), NodeStatus::Running);
    }

    /// Make every zero-in-degree node eligible.
    fn seed(&mut self) {
        for name in self.graph.order.clone() {
            if self.in_degree.get(&name).copied() == Some(0) {
                self.resolve_eligibility(&name);
            }
        }
    }

    /// All dependencies of `name` are terminal; decide ready / skipped /
    /// failed-conditional.
    fn resolve_eligibility(&mut self, name: &str) {
        if self.halted || self.status.get(name) != Some(&NodeStatus::Pending) {
            return;
        }
        let Some(node) = self.workflow.node(name) else {
            return;
        };

        let upstream_fatal = node.depends_on.iter().any(|d| self.fatal.contains(d));
        if upstream_fatal && node.when.is_none() {
            self.skip_cascade(name, "skipped: upstream dependency failed");
            return;
        }

        match &node.when {
            None => {
                self.status.insert(name.to_string(), NodeStatus::Ready);
            }
            Some(when) => match condition::evaluate(when, &self.outputs) {
                Ok(true) => {
                    self.status.insert(name.to_string(), NodeStatus::Ready);
                }
                Ok(false) => {
                    self.skip_cascade(name, "skipped: condition evaluated false");
                }
                Err(e) => {
                    self.record_termination(NodeResult::failed(name, &e));
                }
            },
        }
    }

    /// Skip a node and walk its dependents.
    fn skip_cascade(&mut self, name: &str, reason: &str) {
        debug!(node = name, reason, "node skipped");
        self.status.insert(name.to_string(), NodeStatus::Skipped);
        self.outputs.mark_skipped(name);
        self.results.push(NodeResult::skipped(name, reason));
        self.push_event(
            EventKind::NodeSkipped,
            Some(name.to_string()),
            serde_json::json!({ "reason": reason }),
        );
        self.propagate_to_dependents(name);
    }

    /// A node terminated with a real result (success, failure, or a
    /// pre-container failure). Commit outputs, apply failure policy, and
    /// walk dependents.
    fn record_termination(&mut self, result: NodeResult) {
        let name = result.node.clone();
        self.status.insert(name.clone(), result.status);
        self.outputs
            .commit(&name, result.exit_code, result.outputs.clone());
        self.push_event(
            EventKind::NodeFinished,
            Some(name.clone()),
            serde_json::json!({
                "success": result.success,
                "exit_code": result.exit_code,
                "error": result.error,
            }),
        );

        let forgiven = if result.success {
            true
        } else {
            self.failure_forgiven(&name, &result)
        };
        self.results.push(result);

        if !forgiven {
            self.fatal.insert(name.clone());
            if self.workflow.fail_fast && !self.halted {
                warn!(node = %name, "fatal failure under fail-fast; halting dispatch");
                self.halted = true;
                self.skip_all_unstarted(&format!("skipped: fail-fast after '{name}' failed"));
            }
        }

        self.propagate_to_dependents(&name);
    }

    fn propagate_to_dependents(&mut self, name: &str) {
        for dependent in self.graph.dependents_of(name).to_vec() {
            if let Some(degree) = self.in_degree.get_mut(&dependent) {
                *degree = degree.saturating_sub(1);
                if *degree == 0 && !self.halted {
                    self.resolve_eligibility(&dependent);
                }
            }
        }
    }

    /// Whether a failure propagates or is tolerated by the node's policy.
    fn failure_forgiven(&self, name: &str, result: &NodeResult) -> bool {
        let Some(node) = self.workflow.node(name) else {
            return false;
        };
        match result.error_kind {
            Some(ErrorKind::Container) if result.exit_code > 0 => node.continue_on_fail,
            Some(ErrorKind::Canceled) => false,
            _ => node.continue_on_error,
        }
    }

    /// Mark every node that has not started as skipped.
    fn skip_all_unstarted(&mut self, reason: &str) {
        for name in self.graph.order.clone() {
            if matches!(
                self.status.get(&name),
                Some(NodeStatus::Pending) | Some(NodeStatus::Ready)
            ) {
                self.status.insert(name.clone(), NodeStatus::Skipped);
                self.outputs.mark_skipped(&name);
                self.results.push(NodeResult::skipped(&name, reason));
                self.push_event(
                    EventKind::NodeSkipped,
                    Some(name),
                    serde_json::json!({ "reason": reason }),
                );
            }
        }
    }
}
