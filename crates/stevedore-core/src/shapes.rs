//! Workflow shapes: thin constructors that fold single containers,
//! pipelines, parallel groups, and loops into DAG workflows.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::{ContainerSpec, DagNode, DagWorkflow, Iteration};

/// Failure policy for parallel groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStrategy {
    /// Keep dispatching after a failure.
    Continue,
    /// Halt new dispatch on the first fatal failure.
    FailFast,
}

impl Default for FailureStrategy {
    fn default() -> Self {
        FailureStrategy::FailFast
    }
}

/// One pipeline stage plus an optional teardown container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineStep {
    pub node: DagNode,
    /// Runs after the stage, tolerated on failure, off the critical path.
    #[serde(default)]
    pub cleanup: Option<ContainerSpec>,
}

/// One parameter dimension of a parameterized loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ParameterAxis {
    pub name: String,
    pub values: Vec<String>,
}

/// A single container: one node, no dependencies.
pub fn single(workflow_id: impl Into<String>, mut node: DagNode) -> DagWorkflow {
    node.depends_on.clear();
    DagWorkflow::new(workflow_id, vec![node])
}

/// A linear pipeline: each stage depends on the previous one.
///
/// `stop_on_error` maps to the DAG's fail-fast policy. Cleanup containers
/// become `<stage>-cleanup` nodes hanging off their stage; the chain itself
/// never waits on them.
pub fn pipeline(
    workflow_id: impl Into<String>,
    steps: Vec<PipelineStep>,
    stop_on_error: bool,
) -> Result<DagWorkflow> {
    if steps.is_empty() {
        return Err(Error::Validation("pipeline has no steps".into()));
    }

    let mut nodes = Vec::with_capacity(steps.len() * 2);
    let mut previous: Option<String> = None;

    for step in steps {
        let mut node = step.node;
        node.depends_on = previous.iter().cloned().collect();
        previous = Some(node.name.clone());

        let stage_name = node.name.clone();
        nodes.push(node);

        if let Some(cleanup) = step.cleanup {
            let mut teardown = DagNode::new(format!("{stage_name}-cleanup"), cleanup);
            teardown.depends_on = vec![stage_name];
            teardown.continue_on_fail = true;
            teardown.continue_on_error = true;
            nodes.push(teardown);
        }
    }

    let mut workflow = DagWorkflow::new(workflow_id, nodes);
    workflow.fail_fast = stop_on_error;
    Ok(workflow)
}

/// An unordered parallel group.
pub fn parallel(
    workflow_id: impl Into<String>,
    nodes: Vec<DagNode>,
    strategy: FailureStrategy,
    max_concurrency: usize,
) -> Result<DagWorkflow> {
    if nodes.is_empty() {
        return Err(Error::Validation("parallel group has no steps".into()));
    }

    let nodes = nodes
        .into_iter()
        .map(|mut n| {
            n.depends_on.clear();
            n
        })
        .collect();

    let mut workflow = DagWorkflow::new(workflow_id, nodes);
    workflow.fail_fast = strategy == FailureStrategy::FailFast;
    workflow.max_concurrency = max_concurrency;
    Ok(workflow)
}

/// A loop over items: one copy of the template node per item, with
/// `{{item}}` and `{{index}}` bound. Sequential unless `parallel`.
pub fn loop_items(
    workflow_id: impl Into<String>,
    template: DagNode,
    items: Vec<String>,
    parallel: bool,
    max_concurrency: usize,
) -> Result<DagWorkflow> {
    if items.is_empty() {
        return Err(Error::Validation("loop has no items".into()));
    }

    let base = template.name.clone();
    let mut nodes = Vec::with_capacity(items.len());

    for (index, item) in items.into_iter().enumerate() {
        let mut node = template.clone();
        node.name = format!("{base}-{index}");
        node.iteration = Some(Iteration {
            item: Some(item),
            index,
        });
        node.depends_on = if parallel || index == 0 {
            Vec::new()
        } else {
            vec![format!("{base}-{}", index - 1)]
        };
        nodes.push(node);
    }

    let mut workflow = DagWorkflow::new(workflow_id, nodes);
    workflow.max_concurrency = max_concurrency;
    Ok(workflow)
}

/// A parameterized loop: the Cartesian product of the axes, one node per
/// combination, first axis outermost. Values are bound as per-node
/// parameters for `{{.name}}` substitution.
pub fn loop_parameters(
    workflow_id: impl Into<String>,
    template: DagNode,
    axes: Vec<ParameterAxis>,
    parallel: bool,
    max_concurrency: usize,
) -> Result<DagWorkflow> {
    if axes.is_empty() {
        return Err(Error::Validation("parameterized loop has no axes".into()));
    }
    for axis in &axes {
        if axis.values.is_empty() {
            return Err(Error::Validation(format!(
                "parameter axis '{}' has no values",
                axis.name
            )));
        }
    }

    let mut combinations: Vec<Vec<(String, String)>> = vec![Vec::new()];
    for axis in &axes {
        let mut expanded = Vec::with_capacity(combinations.len() * axis.values.len());
        for combo in &combinations {
            for value in &axis.values {
                let mut next = combo.clone();
                next.push((axis.name.clone(), value.clone()));
                expanded.push(next);
            }
        }
        combinations = expanded;
    }

    let base = template.name.clone();
    let mut nodes = Vec::with_capacity(combinations.len());

    for (index, combo) in combinations.into_iter().enumerate() {
        let mut node = template.clone();
        node.name = format!("{base}-{index}");
        node.params.extend(combo);
        node.iteration = Some(Iteration { item: None, index });
        node.depends_on = if parallel || index == 0 {
            Vec::new()
        } else {
            vec![format!("{base}-{}", index - 1)]
        };
        nodes.push(node);
    }

    let mut workflow = DagWorkflow::new(workflow_id, nodes);
    workflow.max_concurrency = max_concurrency;
    Ok(workflow)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::validate_workflow;

    fn node(name: &str) -> DagNode {
        DagNode::new(name, ContainerSpec::new("alpine:3"))
    }

    #[test]
    fn single_has_one_root_node() {
        let wf = single("wf", node("only"));
        validate_workflow(&wf).unwrap();
        assert_eq!(wf.nodes.len(), 1);
        assert!(wf.nodes[0].depends_on.is_empty());
    }

    #[test]
    fn pipeline_chains_stages() {
        let wf = pipeline(
            "wf",
            vec![
                PipelineStep { node: node("build"), cleanup: None },
                PipelineStep { node: node("test"), cleanup: None },
                PipelineStep { node: node("deploy"), cleanup: None },
            ],
            true,
        )
        .unwrap();
        validate_workflow(&wf).unwrap();

        assert!(wf.fail_fast);
        assert!(wf.nodes[0].depends_on.is_empty());
        assert_eq!(wf.nodes[1].depends_on, vec!["build"]);
        assert_eq!(wf.nodes[2].depends_on, vec!["test"]);
    }

    #[test]
    fn pipeline_cleanup_hangs_off_stage() {
        let wf = pipeline(
            "wf",
            vec![
                PipelineStep {
                    node: node("build"),
                    cleanup: Some(ContainerSpec::new("alpine:3")),
                },
                PipelineStep { node: node("test"), cleanup: None },
            ],
            false,
        )
        .unwrap();
        validate_workflow(&wf).unwrap();

        let teardown = wf.node("build-cleanup").unwrap();
        assert_eq!(teardown.depends_on, vec!["build"]);
        assert!(teardown.continue_on_fail);
        // The chain does not route through the cleanup node.
        assert_eq!(wf.node("test").unwrap().depends_on, vec!["build"]);
    }

    #[test]
    fn empty_pipeline_rejected() {
        assert!(pipeline("wf", vec![], true).is_err());
    }

    #[test]
    fn parallel_strips_dependencies() {
        let mut stray = node("b");
        stray.depends_on = vec!["a".into()];
        let wf = parallel("wf", vec![node("a"), stray], FailureStrategy::Continue, 3).unwrap();
        validate_workflow(&wf).unwrap();

        assert!(!wf.fail_fast);
        assert_eq!(wf.max_concurrency, 3);
        assert!(wf.nodes.iter().all(|n| n.depends_on.is_empty()));
    }

    #[test]
    fn loop_items_binds_iteration() {
        let wf = loop_items("wf", node("copy"), vec!["a.txt".into(), "b.txt".into()], true, 0)
            .unwrap();
        validate_workflow(&wf).unwrap();

        assert_eq!(wf.nodes.len(), 2);
        assert_eq!(wf.nodes[0].name, "copy-0");
        assert_eq!(
            wf.nodes[1].iteration,
            Some(Iteration { item: Some("b.txt".into()), index: 1 })
        );
        assert!(wf.nodes[1].depends_on.is_empty());
    }

    #[test]
    fn sequential_loop_chains_iterations() {
        let wf = loop_items("wf", node("copy"), vec!["a".into(), "b".into(), "c".into()], false, 0)
            .unwrap();
        assert_eq!(wf.nodes[1].depends_on, vec!["copy-0"]);
        assert_eq!(wf.nodes[2].depends_on, vec!["copy-1"]);
    }

    #[test]
    fn empty_loop_rejected() {
        assert!(loop_items("wf", node("copy"), vec![], true, 0).is_err());
    }

    #[test]
    fn parameter_product_order_is_first_axis_outermost() {
        let mut template = node("deploy");
        template.container.command =
            vec!["deploy".into(), "--env={{.env}}".into(), "--region={{.region}}".into()];

        let wf = loop_parameters(
            "wf",
            template,
            vec![
                ParameterAxis { name: "env".into(), values: vec!["dev".into(), "prod".into()] },
                ParameterAxis { name: "region".into(), values: vec!["w".into(), "e".into()] },
            ],
            true,
            2,
        )
        .unwrap();
        validate_workflow(&wf).unwrap();

        assert_eq!(wf.nodes.len(), 4);
        assert_eq!(wf.max_concurrency, 2);

        let combos: Vec<(String, String)> = wf
            .nodes
            .iter()
            .map(|n| (n.params["env"].clone(), n.params["region"].clone()))
            .collect();
        assert_eq!(
            combos,
            vec![
                ("dev".into(), "w".into()),
                ("dev".into(), "e".into()),
                ("prod".into(), "w".into()),
                ("prod".into(), "e".into()),
            ]
        );
    }

    #[test]
    fn axis_without_values_rejected() {
        let err = loop_parameters(
            "wf",
            node("deploy"),
            vec![ParameterAxis { name: "env".into(), values: vec![] }],
            true,
            0,
        );
        assert!(err.is_err());
    }
}
