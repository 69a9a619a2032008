//! Workflow TOML documents: one shape per file, folded into a DAG.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use stevedore_core::model::{validate_workflow, ContainerSpec, DagNode, DagWorkflow};
use stevedore_core::shapes::{self, FailureStrategy, ParameterAxis, PipelineStep};
use stevedore_core::{Error, Result};

fn default_true() -> bool {
    true
}

/// The `[shape]` table: which of the five shapes this file declares.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ShapeDoc {
    Single {
        node: DagNode,
    },
    Pipeline {
        steps: Vec<PipelineStep>,
        #[serde(default = "default_true")]
        stop_on_error: bool,
    },
    Parallel {
        steps: Vec<DagNode>,
        #[serde(default)]
        failure_strategy: FailureStrategy,
        #[serde(default)]
        max_concurrency: usize,
    },
    /// Loop over a list of items.
    Items {
        node: DagNode,
        items: Vec<String>,
        #[serde(default = "default_true")]
        parallel: bool,
        #[serde(default)]
        max_concurrency: usize,
    },
    /// Loop over the Cartesian product of parameter axes.
    Matrix {
        node: DagNode,
        axes: Vec<ParameterAxis>,
        #[serde(default = "default_true")]
        parallel: bool,
        #[serde(default)]
        max_concurrency: usize,
    },
    Dag {
        nodes: Vec<DagNode>,
        #[serde(default = "default_true")]
        fail_fast: bool,
        #[serde(default)]
        max_concurrency: usize,
    },
}

/// Optional per-file overrides of the run policy.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
struct RunOverrides {
    max_concurrency: Option<usize>,
    fail_fast: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct WorkflowDoc {
    workflow_id: String,
    /// Default parameters; `--param` wins on conflict.
    #[serde(default)]
    params: HashMap<String, String>,
    #[serde(default)]
    run: RunOverrides,
    /// Containers that run after every node is terminal.
    #[serde(default)]
    exit_handlers: Vec<ContainerSpec>,
    shape: ShapeDoc,
}

/// A parsed, validated workflow plus its file-level parameters.
#[derive(Debug, Clone)]
pub struct LoadedWorkflow {
    pub workflow: DagWorkflow,
    pub params: HashMap<String, String>,
}

/// Load and validate a workflow file.
pub fn load(path: &Path) -> Result<LoadedWorkflow> {
    let data = std::fs::read_to_string(path)
        .map_err(|e| Error::Validation(format!("reading '{}': {e}", path.display())))?;
    parse(&data)
}

/// Parse and validate a workflow document.
pub fn parse(data: &str) -> Result<LoadedWorkflow> {
    let doc: WorkflowDoc =
        toml::from_str(data).map_err(|e| Error::Validation(format!("parsing workflow: {e}")))?;

    let id = doc.workflow_id.clone();
    let mut workflow = match doc.shape {
        ShapeDoc::Single { node } => shapes::single(id, node),
        ShapeDoc::Pipeline { steps, stop_on_error } => shapes::pipeline(id, steps, stop_on_error)?,
        ShapeDoc::Parallel { steps, failure_strategy, max_concurrency } => {
            shapes::parallel(id, steps, failure_strategy, max_concurrency)?
        }
        ShapeDoc::Items { node, items, parallel, max_concurrency } => {
            shapes::loop_items(id, node, items, parallel, max_concurrency)?
        }
        ShapeDoc::Matrix { node, axes, parallel, max_concurrency } => {
            shapes::loop_parameters(id, node, axes, parallel, max_concurrency)?
        }
        ShapeDoc::Dag { nodes, fail_fast, max_concurrency } => {
            let mut wf = DagWorkflow::new(id, nodes);
            wf.fail_fast = fail_fast;
            wf.max_concurrency = max_concurrency;
            wf
        }
    };

    if let Some(max_concurrency) = doc.run.max_concurrency {
        workflow.max_concurrency = max_concurrency;
    }
    if let Some(fail_fast) = doc.run.fail_fast {
        workflow.fail_fast = fail_fast;
    }
    workflow.exit_handlers.extend(doc.exit_handlers);

    validate_workflow(&workflow)?;

    Ok(LoadedWorkflow {
        workflow,
        params: doc.params,
    })
}
