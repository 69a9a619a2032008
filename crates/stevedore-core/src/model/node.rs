use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::container::ContainerSpec;
use super::resources::ResourceLimits;
use crate::error::ErrorKind;

/// A file or directory transferred between steps through the artifact store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Artifact {
    /// Unique per step direction; doubles as the key's terminal segment.
    pub name: String,
    /// Absolute path inside the container filesystem.
    pub path: String,
    #[serde(default)]
    pub kind: ArtifactKind,
    /// Missing artifacts do not fail the step when optional.
    #[serde(default)]
    pub optional: bool,
    /// Producing step for inputs. When absent, the unique transitive
    /// dependency that declares an output artifact of the same name is used.
    #[serde(default)]
    pub source_step: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    File,
    Directory,
    /// A pre-built tar stored and restored as-is.
    Archive,
}

impl Default for ArtifactKind {
    fn default() -> Self {
        ArtifactKind::File
    }
}

/// Where a declared output value is read from after the step terminates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputSource {
    Stdout,
    Stderr,
    File,
}

impl Default for OutputSource {
    fn default() -> Self {
        OutputSource::Stdout
    }
}

/// A named value extracted from a step's output streams or files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutputDefinition {
    pub name: String,
    #[serde(default)]
    pub source: OutputSource,
    /// Container path to read; only meaningful for the `file` source.
    #[serde(default)]
    pub path: Option<String>,
    /// First capture group becomes the value; whole match when the regex
    /// has no group.
    #[serde(default)]
    pub regex: Option<String>,
    #[serde(default)]
    pub default: Option<String>,
    /// Fail the step when no value can be produced.
    #[serde(default)]
    pub required: bool,
}

/// Environment variable populated from another step's output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InputMapping {
    /// Target environment variable name.
    pub env: String,
    /// `"stepName.outputName"`.
    pub source: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<String>,
}

impl InputMapping {
    /// Split `source` into `(step, output)`.
    pub fn parse_source(&self) -> Option<(&str, &str)> {
        self.source.split_once('.')
    }
}

/// Loop-iteration bindings substituted as `{{item}}` and `{{index}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Iteration {
    pub item: Option<String>,
    pub index: usize,
}

/// One named element of the graph: a container plus its wiring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct DagNode {
    pub name: String,
    pub container: ContainerSpec,
    pub depends_on: Vec<String>,
    pub resources: Option<ResourceLimits>,
    pub input_artifacts: Vec<Artifact>,
    pub output_artifacts: Vec<Artifact>,
    pub outputs: Vec<OutputDefinition>,
    pub input_mappings: Vec<InputMapping>,
    /// Boolean expression gating execution; false means skipped.
    pub when: Option<String>,
    /// Non-zero exit does not abort the graph.
    pub continue_on_fail: bool,
    /// Infrastructure failure does not abort the graph.
    pub continue_on_error: bool,
    /// Per-node parameter overrides (set by the loop shapes).
    pub params: HashMap<String, String>,
    /// Loop bindings, when this node came from a loop shape.
    pub iteration: Option<Iteration>,
}

impl Default for DagNode {
    fn default() -> Self {
        Self {
            name: String::new(),
            container: ContainerSpec::default(),
            depends_on: Vec::new(),
            resources: None,
            input_artifacts: Vec::new(),
            output_artifacts: Vec::new(),
            outputs: Vec::new(),
            input_mappings: Vec::new(),
            when: None,
            continue_on_fail: false,
            continue_on_error: false,
            params: HashMap::new(),
            iteration: None,
        }
    }
}

impl DagNode {
    pub fn new(name: impl Into<String>, container: ContainerSpec) -> Self {
        Self {
            name: name.into(),
            container,
            ..Self::default()
        }
    }
}

fn default_fail_fast() -> bool {
    true
}

/// A validated-on-submission graph of container steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct DagWorkflow {
    pub workflow_id: String,
    /// Declaration order is the dispatch tie-break order.
    pub nodes: Vec<DagNode>,
    pub fail_fast: bool,
    /// `0` means unlimited.
    pub max_concurrency: usize,
    /// Run after every graph node is terminal, in declared order.
    pub exit_handlers: Vec<ContainerSpec>,
}

impl Default for DagWorkflow {
    fn default() -> Self {
        Self {
            workflow_id: String::new(),
            nodes: Vec::new(),
            fail_fast: default_fail_fast(),
            max_concurrency: 0,
            exit_handlers: Vec::new(),
        }
    }
}

impl DagWorkflow {
    pub fn new(workflow_id: impl Into<String>, nodes: Vec<DagNode>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            nodes,
            ..Self::default()
        }
    }

    pub fn node(&self, name: &str) -> Option<&DagNode> {
        self.nodes.iter().find(|n| n.name == name)
    }
}

/// Identity of one execution, injected by the caller or generated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunIds {
    pub workflow_id: String,
    pub run_id: String,
}

impl RunIds {
    /// Fresh run id for the given workflow.
    pub fn generate(workflow_id: impl Into<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            run_id: Uuid::new_v4().to_string(),
        }
    }
}

/// Scheduler state of one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Ready,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl NodeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NodeStatus::Succeeded | NodeStatus::Failed | NodeStatus::Skipped
        )
    }
}

/// Structured result of one node execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeResult {
    pub node: String,
    pub status: NodeStatus,
    pub container_id: Option<String>,
    /// `-1` when the container never produced an exit code.
    pub exit_code: i64,
    /// Bounded tails.
    pub stdout: String,
    pub stderr: String,
    /// Container port to mapped host port.
    pub host_ports: HashMap<u16, u16>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub success: bool,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub outputs: HashMap<String, String>,
}

impl NodeResult {
    /// A skipped node: terminal, no outputs, not a failure.
    pub fn skipped(node: impl Into<String>, reason: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            node: node.into(),
            status: NodeStatus::Skipped,
            container_id: None,
            exit_code: -1,
            stdout: String::new(),
            stderr: String::new(),
            host_ports: HashMap::new(),
            started_at: now,
            finished_at: now,
            duration_ms: 0,
            success: false,
            error: Some(reason.into()),
            error_kind: None,
            outputs: HashMap::new(),
        }
    }

    /// A node that failed before or outside the container.
    pub fn failed(node: impl Into<String>, error: &crate::Error) -> Self {
        let now = Utc::now();
        Self {
            node: node.into(),
            status: NodeStatus::Failed,
            container_id: None,
            exit_code: -1,
            stdout: String::new(),
            stderr: String::new(),
            host_ports: HashMap::new(),
            started_at: now,
            finished_at: now,
            duration_ms: 0,
            success: false,
            error: Some(error.to_string()),
            error_kind: Some(error.kind()),
            outputs: HashMap::new(),
        }
    }
}

/// Aggregated result of a whole run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub workflow_id: String,
    pub run_id: String,
    pub success: bool,
    pub canceled: bool,
    /// Completion order.
    pub node_results: Vec<NodeResult>,
    pub succeeded: Vec<String>,
    pub failed: Vec<String>,
    pub skipped: Vec<String>,
    pub total_success: usize,
    pub total_failed: usize,
    pub total_skipped: usize,
    pub duration_ms: u64,
    /// Exit handler results; failures here never flip `success`.
    pub handler_results: Vec<NodeResult>,
}

impl RunResult {
    pub fn result(&self, node: &str) -> Option<&NodeResult> {
        self.node_results.iter().find(|r| r.node == node)
    }
}

/// Outputs and exit codes published by terminated nodes.
///
/// Mutated only by the scheduler when a node terminates, before any
/// dependent is dispatched.
#[derive(Debug, Clone, Default)]
pub struct StepOutputs {
    values: HashMap<String, HashMap<String, String>>,
    exit_codes: HashMap<String, i64>,
    skipped: HashSet<String>,
}

impl StepOutputs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Commit a terminated node's outputs and exit code atomically.
    pub fn commit(&mut self, node: &str, exit_code: i64, outputs: HashMap<String, String>) {
        self.exit_codes.insert(node.to_string(), exit_code);
        self.values.insert(node.to_string(), outputs);
    }

    /// Record a node as skipped; it publishes no outputs.
    pub fn mark_skipped(&mut self, node: &str) {
        self.skipped.insert(node.to_string());
    }

    pub fn output(&self, node: &str, name: &str) -> Option<&str> {
        self.values.get(node)?.get(name).map(String::as_str)
    }

    pub fn exit_code(&self, node: &str) -> Option<i64> {
        self.exit_codes.get(node).copied()
    }

    /// Whether the node has terminated with a recorded exit code.
    pub fn has_terminated(&self, node: &str) -> bool {
        self.exit_codes.contains_key(node)
    }

    pub fn is_skipped(&self, node: &str) -> bool {
        self.skipped.contains(node)
    }
}
