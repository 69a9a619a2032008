use std::collections::HashMap;

use crate::model::DagWorkflow;

/// Arena view of a validated graph: declaration order, reverse edges, and
/// in-degrees, all keyed by node name.
#[derive(Debug, Clone)]
pub struct Graph {
    /// Node names in declaration order; the dispatch tie-break.
    pub order: Vec<String>,
    /// Reverse edges: node to the nodes that depend on it, in declaration
    /// order.
    pub dependents: HashMap<String, Vec<String>>,
    pub in_degree: HashMap<String, usize>,
}

impl Graph {
    /// Build the arena. The workflow must already have passed validation.
    pub fn build(workflow: &DagWorkflow) -> Self {
        let order: Vec<String> = workflow.nodes.iter().map(|n| n.name.clone()).collect();

        let mut dependents: HashMap<String, Vec<String>> =
            order.iter().map(|n| (n.clone(), Vec::new())).collect();
        let mut in_degree: HashMap<String, usize> =
            order.iter().map(|n| (n.clone(), 0)).collect();

        for node in &workflow.nodes {
            for dep in &node.depends_on {
                if let Some(list) = dependents.get_mut(dep) {
                    list.push(node.name.clone());
                }
                if let Some(degree) = in_degree.get_mut(&node.name) {
                    *degree += 1;
                }
            }
        }

        Self {
            order,
            dependents,
            in_degree,
        }
    }

    pub fn dependents_of(&self, name: &str) -> &[String] {
        self.dependents.get(name).map(Vec::as_slice).unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ContainerSpec, DagNode};

    fn node(name: &str, deps: &[&str]) -> DagNode {
        let mut n = DagNode::new(name, ContainerSpec::new("alpine:3"));
        n.depends_on = deps.iter().map(|d| d.to_string()).collect();
        n
    }

    #[test]
    fn arena_structure() {
        let wf = DagWorkflow::new(
            "wf",
            vec![
                node("build", &[]),
                node("test", &["build"]),
                node("lint", &["build"]),
                node("deploy", &["test", "lint"]),
            ],
        );
        let graph = Graph::build(&wf);

        assert_eq!(graph.order, vec!["build", "test", "lint", "deploy"]);
        assert_eq!(graph.dependents_of("build"), &["test", "lint"]);
        assert_eq!(graph.dependents_of("deploy"), &[] as &[String]);
        assert_eq!(graph.in_degree["build"], 0);
        assert_eq!(graph.in_degree["deploy"], 2);
    }
}
