//! Integration tests for the DAG scheduler: ordering, failure policy,
//! conditionals, artifacts, handlers, cancellation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use stevedore_core::engine::{Engine, EngineConfig, EventKind, RunEvent, StepExecutor, StepRun};
use stevedore_core::model::{
    Artifact, ArtifactKind, ContainerSpec, DagNode, DagWorkflow, InputMapping, NodeResult,
    NodeStatus, OutputDefinition, OutputSource, RunIds,
};
use stevedore_core::shapes::{self, FailureStrategy, ParameterAxis, PipelineStep};
use stevedore_core::store::{ArtifactKey, ArtifactStore, LocalStore};
use stevedore_core::ErrorKind;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn node(name: &str, deps: &[&str]) -> DagNode {
    let mut n = DagNode::new(name, ContainerSpec::new("alpine:3"));
    n.container.command = vec!["true".into()];
    n.depends_on = deps.iter().map(|d| d.to_string()).collect();
    n
}

fn result(name: &str, exit_code: i64, stdout: &str) -> NodeResult {
    let now = Utc::now();
    let success = exit_code == 0;
    NodeResult {
        node: name.to_string(),
        status: if success {
            NodeStatus::Succeeded
        } else {
            NodeStatus::Failed
        },
        container_id: Some(format!("ctr-{name}")),
        exit_code,
        stdout: stdout.to_string(),
        stderr: String::new(),
        host_ports: HashMap::new(),
        started_at: now,
        finished_at: now,
        duration_ms: 1,
        success,
        error: (!success).then(|| format!("exited with code {exit_code}")),
        error_kind: (!success).then_some(ErrorKind::Container),
        outputs: HashMap::new(),
    }
}

/// Per-node scripted behavior.
#[derive(Debug, Clone, Default)]
struct Script {
    exit_code: i64,
    stdout: String,
    delay_ms: u64,
}

/// Fake executor: scripted exit codes, dispatch log, concurrency gauge.
#[derive(Default)]
struct ScriptedExecutor {
    scripts: HashMap<String, Script>,
    dispatched: Mutex<Vec<(String, Vec<String>)>>,
    running: AtomicUsize,
    max_running: AtomicUsize,
}

impl ScriptedExecutor {
    fn new() -> Self {
        Self::default()
    }

    fn script(mut self, node: &str, script: Script) -> Self {
        self.scripts.insert(node.to_string(), script);
        self
    }

    fn dispatched_nodes(&self) -> Vec<String> {
        self.dispatched
            .lock()
            .unwrap()
            .iter()
            .map(|(n, _)| n.clone())
            .collect()
    }

    fn command_of(&self, node: &str) -> Option<Vec<String>> {
        self.dispatched
            .lock()
            .unwrap()
            .iter()
            .find(|(n, _)| n == node)
            .map(|(_, cmd)| cmd.clone())
    }

    fn high_water_mark(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }
}

impl StepExecutor for ScriptedExecutor {
    async fn execute(&self, step: StepRun) -> NodeResult {
        self.dispatched
            .lock()
            .unwrap()
            .push((step.node.clone(), step.launch.spec.command.clone()));

        let now_running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now_running, Ordering::SeqCst);

        let script = self.scripts.get(&step.node).cloned().unwrap_or_default();

        let outcome = tokio::select! {
            _ = step.cancel.cancelled() => {
                let mut r = result(&step.node, -1, "");
                r.error = Some("canceled while running".into());
                r.error_kind = Some(ErrorKind::Canceled);
                r
            }
            _ = tokio::time::sleep(Duration::from_millis(script.delay_ms)) => {
                result(&step.node, script.exit_code, &script.stdout)
            }
        };

        self.running.fetch_sub(1, Ordering::SeqCst);
        outcome
    }
}

/// Lets a test keep a handle on the executor the engine owns.
struct Shared<E: StepExecutor>(Arc<E>);

impl<E: StepExecutor> StepExecutor for Shared<E> {
    async fn execute(&self, step: StepRun) -> NodeResult {
        self.0.execute(step).await
    }
}

fn no_params() -> HashMap<String, String> {
    HashMap::new()
}

fn started_nodes(rx: &mut mpsc::UnboundedReceiver<RunEvent>) -> Vec<String> {
    let mut names = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if event.kind == EventKind::NodeStarted {
            if let Some(node) = event.node {
                names.push(node);
            }
        }
    }
    names
}

// ---------------------------------------------------------------------------
// S1: simple pipeline
// ---------------------------------------------------------------------------

#[tokio::test]
async fn s1_pipeline_runs_in_order() {
    let wf = shapes::pipeline(
        "release",
        vec![
            PipelineStep { node: node("build", &[]), cleanup: None },
            PipelineStep { node: node("test", &[]), cleanup: None },
            PipelineStep { node: node("deploy", &[]), cleanup: None },
        ],
        true,
    )
    .unwrap();

    let engine = Engine::new(ScriptedExecutor::new());
    let run = engine.execute(&wf, &no_params()).await.unwrap();

    assert!(run.success);
    assert_eq!(run.total_success, 3);
    assert_eq!(run.total_failed, 0);
    assert_eq!(run.node_results.len(), 3);
    assert!(run.node_results.iter().all(|r| r.exit_code == 0));
    assert_eq!(
        run.node_results.iter().map(|r| r.node.as_str()).collect::<Vec<_>>(),
        vec!["build", "test", "deploy"]
    );
}

// ---------------------------------------------------------------------------
// S2: fail-fast halt
// ---------------------------------------------------------------------------

#[tokio::test]
async fn s2_fail_fast_skips_unreached_nodes() {
    let mut wf = DagWorkflow::new("wf", vec![node("A", &[]), node("B", &["A"])]);
    wf.fail_fast = true;
    wf.exit_handlers.push(ContainerSpec::new("alpine:3"));

    let executor =
        ScriptedExecutor::new().script("A", Script { exit_code: 1, ..Default::default() });
    let engine = Engine::new(executor);
    let run = engine.execute(&wf, &no_params()).await.unwrap();

    assert!(!run.success);
    assert_eq!(run.total_success, 0);
    assert_eq!(run.total_failed, 1);
    assert_eq!(run.failed, vec!["A"]);
    assert_eq!(run.skipped, vec!["B"]);

    let b = run.result("B").unwrap();
    assert_eq!(b.status, NodeStatus::Skipped);
    // Never started: no container behind it.
    assert!(b.container_id.is_none());

    // The handler still ran, exactly once.
    assert_eq!(run.handler_results.len(), 1);
    assert!(run.handler_results[0].success);
}

// ---------------------------------------------------------------------------
// S3: artifact transfer
// ---------------------------------------------------------------------------

/// Behaves like containers writing and reading mounted artifact paths.
struct ArtifactExecutor {
    seen_by_deploy: Mutex<Option<Vec<u8>>>,
}

impl StepExecutor for ArtifactExecutor {
    async fn execute(&self, step: StepRun) -> NodeResult {
        match step.node.as_str() {
            "build" => {
                // The engine bound a host dir over /out; write the artifact.
                let bind = step
                    .launch
                    .extra_binds
                    .iter()
                    .find(|b| b.container == "/out")
                    .expect("output mount for /out");
                std::fs::write(bind.host.join("app"), b"binary-bytes").unwrap();
                result("build", 0, "")
            }
            "deploy" => {
                // The engine staged /app from the store.
                let bind = step
                    .launch
                    .extra_binds
                    .iter()
                    .find(|b| b.container == "/app")
                    .expect("input mount for /app");
                let bytes = std::fs::read(&bind.host).unwrap();
                *self.seen_by_deploy.lock().unwrap() = Some(bytes);
                result("deploy", 0, "")
            }
            other => result(other, 0, ""),
        }
    }
}

#[tokio::test]
async fn s3_artifact_flows_between_steps() {
    let tmp = tempfile::tempdir().unwrap();
    let store = Arc::new(LocalStore::new(tmp.path().join("store")));

    let mut build = node("build", &[]);
    build.output_artifacts.push(Artifact {
        name: "binary".into(),
        path: "/out/app".into(),
        kind: ArtifactKind::File,
        optional: false,
        source_step: None,
    });
    let mut deploy = node("deploy", &["build"]);
    deploy.input_artifacts.push(Artifact {
        name: "binary".into(),
        path: "/app".into(),
        kind: ArtifactKind::File,
        optional: false,
        source_step: None,
    });

    let wf = DagWorkflow::new("wf", vec![build, deploy]);

    let executor = Arc::new(ArtifactExecutor { seen_by_deploy: Mutex::new(None) });
    let config = EngineConfig {
        staging_dir: tmp.path().join("staging"),
        ..EngineConfig::default()
    };
    let engine = Engine::new(Shared(executor.clone()))
        .with_store(store.clone() as Arc<dyn ArtifactStore>)
        .with_config(config);

    let run = engine.execute(&wf, &no_params()).await.unwrap();
    assert!(run.success, "run failed: {:?}", run.node_results);

    // The bytes the deploy step saw are exactly what build wrote.
    assert_eq!(
        executor.seen_by_deploy.lock().unwrap().as_deref(),
        Some(b"binary-bytes".as_slice())
    );

    // The store holds the artifact under the run's key.
    let key = ArtifactKey::new(&run.workflow_id, &run.run_id, "build", "binary").unwrap();
    assert!(store.exists(&key).await.unwrap());
}

// ---------------------------------------------------------------------------
// S4: parameter sweep
// ---------------------------------------------------------------------------

fn sweep_workflow() -> DagWorkflow {
    let mut template = node("deploy", &[]);
    template.container.command = vec![
        "deploy".into(),
        "--env={{.env}}".into(),
        "--region={{.region}}".into(),
    ];

    shapes::loop_parameters(
        "sweep",
        template,
        vec![
            ParameterAxis { name: "env".into(), values: vec!["dev".into(), "prod".into()] },
            ParameterAxis { name: "region".into(), values: vec!["w".into(), "e".into()] },
        ],
        true,
        2,
    )
    .unwrap()
}

#[tokio::test]
async fn s4_sweep_renders_all_combinations_in_order() {
    let wf = sweep_workflow();

    let mut scripted = ScriptedExecutor::new();
    for i in 0..4 {
        scripted = scripted.script(
            &format!("deploy-{i}"),
            Script { delay_ms: 40, ..Default::default() },
        );
    }
    let executor = Arc::new(scripted);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let engine = Engine::new(Shared(executor.clone())).with_events(tx);
    let run = engine.execute(&wf, &no_params()).await.unwrap();

    assert!(run.success);
    assert_eq!(run.total_success, 4);

    let commands: Vec<String> = (0..4)
        .map(|i| executor.command_of(&format!("deploy-{i}")).unwrap().join(" "))
        .collect();
    assert_eq!(
        commands,
        vec![
            "deploy --env=dev --region=w",
            "deploy --env=dev --region=e",
            "deploy --env=prod --region=w",
            "deploy --env=prod --region=e",
        ]
    );

    // No more than two ran at once, and dispatch followed declaration order.
    assert!(executor.high_water_mark() <= 2, "cap exceeded: {}", executor.high_water_mark());
    assert_eq!(
        started_nodes(&mut rx),
        vec!["deploy-0", "deploy-1", "deploy-2", "deploy-3"]
    );
}

// ---------------------------------------------------------------------------
// S5: conditional skip
// ---------------------------------------------------------------------------

#[tokio::test]
async fn s5_conditional_skip_on_failed_test() {
    let mut deploy = node("deploy-prod", &["test"]);
    deploy.when = Some("{{steps.test.exitCode}} == 0".into());
    let mut wf = DagWorkflow::new("wf", vec![node("test", &[]), deploy]);
    wf.fail_fast = false;

    let executor =
        ScriptedExecutor::new().script("test", Script { exit_code: 1, ..Default::default() });
    let engine = Engine::new(executor);
    let run = engine.execute(&wf, &no_params()).await.unwrap();

    assert!(!run.success);
    assert_eq!(run.failed, vec!["test"]);
    assert_eq!(run.skipped, vec!["deploy-prod"]);
    assert_eq!(run.result("deploy-prod").unwrap().status, NodeStatus::Skipped);
}

#[tokio::test]
async fn conditional_opt_in_runs_on_failure() {
    let mut notify = node("notify", &["test"]);
    notify.when = Some("{{steps.test.exitCode}} != 0".into());
    let mut wf = DagWorkflow::new("wf", vec![node("test", &[]), notify]);
    wf.fail_fast = false;

    let executor =
        ScriptedExecutor::new().script("test", Script { exit_code: 1, ..Default::default() });
    let engine = Engine::new(executor);
    let run = engine.execute(&wf, &no_params()).await.unwrap();

    assert!(!run.success);
    assert_eq!(run.result("notify").unwrap().status, NodeStatus::Succeeded);
}

// ---------------------------------------------------------------------------
// S6: cycle rejection
// ---------------------------------------------------------------------------

#[tokio::test]
async fn s6_cycle_rejected_before_execution() {
    let wf = DagWorkflow::new("wf", vec![node("A", &["B"]), node("B", &["A"])]);

    let executor = Arc::new(ScriptedExecutor::new());
    let engine = Engine::new(Shared(executor.clone()));
    let err = engine.execute(&wf, &no_params()).await.unwrap_err();

    let message = err.to_string();
    assert!(message.contains("cycle"), "message: {message}");
    assert!(message.contains("'A'") && message.contains("'B'"), "message: {message}");
    // No container ever started.
    assert!(executor.dispatched_nodes().is_empty());
}

// ---------------------------------------------------------------------------
// Output visibility
// ---------------------------------------------------------------------------

#[tokio::test]
async fn outputs_visible_to_dependents_before_dispatch() {
    let mut build = node("build", &[]);
    build.outputs.push(OutputDefinition {
        name: "version".into(),
        source: OutputSource::Stdout,
        path: None,
        regex: Some(r"version: (\S+)".into()),
        default: None,
        required: true,
    });
    let mut deploy = node("deploy", &["build"]);
    deploy.container.command = vec!["release".into(), "{{steps.build.version}}".into()];

    let wf = DagWorkflow::new("wf", vec![build, deploy]);

    let executor = Arc::new(
        ScriptedExecutor::new()
            .script("build", Script { stdout: "version: 1.2.3\n".into(), ..Default::default() }),
    );
    let engine = Engine::new(Shared(executor.clone()));
    let run = engine.execute(&wf, &no_params()).await.unwrap();

    assert!(run.success);
    assert_eq!(run.result("build").unwrap().outputs["version"], "1.2.3");
    assert_eq!(
        executor.command_of("deploy").unwrap(),
        vec!["release".to_string(), "1.2.3".to_string()]
    );
}

#[tokio::test]
async fn input_mapping_injects_env() {
    let mut build = node("build", &[]);
    build.outputs.push(OutputDefinition {
        name: "version".into(),
        source: OutputSource::Stdout,
        path: None,
        regex: None,
        default: None,
        required: true,
    });
    let mut deploy = node("deploy", &["build"]);
    deploy.input_mappings.push(InputMapping {
        env: "BUILD_VERSION".into(),
        source: "build.version".into(),
        required: true,
        default: None,
    });

    let wf = DagWorkflow::new("wf", vec![build, deploy]);

    struct EnvCapture {
        seen: Mutex<Option<String>>,
    }
    impl StepExecutor for EnvCapture {
        async fn execute(&self, step: StepRun) -> NodeResult {
            if step.node == "deploy" {
                *self.seen.lock().unwrap() = step.launch.spec.env.get("BUILD_VERSION").cloned();
                result("deploy", 0, "")
            } else {
                result(&step.node, 0, "2.0.0\n")
            }
        }
    }

    let executor = Arc::new(EnvCapture { seen: Mutex::new(None) });
    let engine = Engine::new(Shared(executor.clone()));
    let run = engine.execute(&wf, &no_params()).await.unwrap();

    assert!(run.success);
    assert_eq!(executor.seen.lock().unwrap().as_deref(), Some("2.0.0"));
}

// ---------------------------------------------------------------------------
// Skip propagation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn skipped_nodes_do_not_block_dependents() {
    let mut gated = node("gated", &["first"]);
    gated.when = Some("{{steps.first.exitCode}} != 0".into());
    let last = node("last", &["gated"]);
    let wf = DagWorkflow::new("wf", vec![node("first", &[]), gated, last]);

    let executor = Arc::new(ScriptedExecutor::new());
    let engine = Engine::new(Shared(executor.clone()));
    let run = engine.execute(&wf, &no_params()).await.unwrap();

    assert!(run.success);
    assert_eq!(run.skipped, vec!["gated"]);
    assert_eq!(run.result("last").unwrap().status, NodeStatus::Succeeded);
    // The skipped node never entered Running.
    assert_eq!(executor.dispatched_nodes(), vec!["first", "last"]);
}

// ---------------------------------------------------------------------------
// Fail-fast drain
// ---------------------------------------------------------------------------

#[tokio::test]
async fn fail_fast_drains_running_work() {
    let mut wf = DagWorkflow::new(
        "wf",
        vec![node("slow", &[]), node("doomed", &[]), node("late", &["slow"])],
    );
    wf.fail_fast = true;

    let executor = Arc::new(
        ScriptedExecutor::new()
            .script("slow", Script { delay_ms: 120, ..Default::default() })
            .script("doomed", Script { exit_code: 1, delay_ms: 10, ..Default::default() }),
    );
    let engine = Engine::new(Shared(executor.clone()));
    let run = engine.execute(&wf, &no_params()).await.unwrap();

    assert!(!run.success);
    // The in-flight node drained to completion.
    assert_eq!(run.result("slow").unwrap().status, NodeStatus::Succeeded);
    // The unreached dependent never started.
    assert_eq!(run.result("late").unwrap().status, NodeStatus::Skipped);
    assert!(!executor.dispatched_nodes().contains(&"late".to_string()));
}

// ---------------------------------------------------------------------------
// continue_on_fail
// ---------------------------------------------------------------------------

#[tokio::test]
async fn continue_on_fail_keeps_run_successful() {
    let mut flaky = node("flaky", &[]);
    flaky.continue_on_fail = true;
    let after = node("after", &["flaky"]);
    let wf = DagWorkflow::new("wf", vec![flaky, after]);

    let executor =
        ScriptedExecutor::new().script("flaky", Script { exit_code: 2, ..Default::default() });
    let engine = Engine::new(executor);
    let run = engine.execute(&wf, &no_params()).await.unwrap();

    assert!(run.success, "forgiven failure must not fail the run");
    assert_eq!(run.result("after").unwrap().status, NodeStatus::Succeeded);
    // The node itself still reports failure.
    assert!(!run.result("flaky").unwrap().success);
}

// ---------------------------------------------------------------------------
// Exit handlers
// ---------------------------------------------------------------------------

#[tokio::test]
async fn exit_handlers_see_step_outputs() {
    let mut build = node("build", &[]);
    build.outputs.push(OutputDefinition {
        name: "version".into(),
        source: OutputSource::Stdout,
        path: None,
        regex: None,
        default: None,
        required: true,
    });
    let mut wf = DagWorkflow::new("wf", vec![build]);
    let mut handler = ContainerSpec::new("alpine:3");
    handler.name = "announce".into();
    handler.command = vec!["echo".into(), "built {{steps.build.version}}".into()];
    wf.exit_handlers.push(handler);

    let executor = Arc::new(
        ScriptedExecutor::new()
            .script("build", Script { stdout: "3.1.4\n".into(), ..Default::default() }),
    );
    let engine = Engine::new(Shared(executor.clone()));
    let run = engine.execute(&wf, &no_params()).await.unwrap();

    assert!(run.success);
    assert_eq!(run.handler_results.len(), 1);
    assert_eq!(
        executor.command_of("announce").unwrap(),
        vec!["echo".to_string(), "built 3.1.4".to_string()]
    );
}

#[tokio::test]
async fn handler_failure_does_not_flip_success() {
    let mut wf = DagWorkflow::new("wf", vec![node("only", &[])]);
    let mut handler = ContainerSpec::new("alpine:3");
    handler.name = "broken-handler".into();
    wf.exit_handlers.push(handler);

    let executor = ScriptedExecutor::new()
        .script("broken-handler", Script { exit_code: 7, ..Default::default() });
    let engine = Engine::new(executor);
    let run = engine.execute(&wf, &no_params()).await.unwrap();

    assert!(run.success);
    assert_eq!(run.handler_results.len(), 1);
    assert!(!run.handler_results[0].success);
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancellation_drains_and_still_runs_handlers() {
    let mut wf = DagWorkflow::new("wf", vec![node("slow", &[]), node("after", &["slow"])]);
    wf.exit_handlers.push(ContainerSpec::new("alpine:3"));

    let executor =
        ScriptedExecutor::new().script("slow", Script { delay_ms: 5_000, ..Default::default() });
    let engine = Engine::new(executor);

    let cancel = CancellationToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });

    let ids = RunIds::generate("wf");
    let run = engine.execute_run(&wf, &no_params(), ids, cancel).await.unwrap();

    assert!(!run.success);
    assert!(run.canceled);
    assert_eq!(run.result("slow").unwrap().error_kind, Some(ErrorKind::Canceled));
    assert_eq!(run.result("after").unwrap().status, NodeStatus::Skipped);
    assert_eq!(run.handler_results.len(), 1);
}

// ---------------------------------------------------------------------------
// Determinism
// ---------------------------------------------------------------------------

#[tokio::test]
async fn serial_dispatch_follows_declaration_order() {
    let nodes: Vec<DagNode> = ["e", "d", "c", "b", "a"].iter().map(|n| node(n, &[])).collect();
    let wf = shapes::parallel("wf", nodes, FailureStrategy::FailFast, 1).unwrap();

    let executor = Arc::new(ScriptedExecutor::new());
    let (tx, mut rx) = mpsc::unbounded_channel();
    let engine = Engine::new(Shared(executor.clone())).with_events(tx);
    let run = engine.execute(&wf, &no_params()).await.unwrap();

    assert!(run.success);
    assert_eq!(executor.high_water_mark(), 1);
    assert_eq!(started_nodes(&mut rx), vec!["e", "d", "c", "b", "a"]);
}
