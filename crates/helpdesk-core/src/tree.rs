use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use thiserror::Error;

use crate::outcome::resolution_tag_for;

/// Platform component ids carry `ts:<node-id>:solved` and are capped at 100 chars.
pub const MAX_NODE_ID_LEN: usize = 90;
pub const DEFAULT_ROOT_ID: &str = "root";

#[derive(Debug, Error)]
pub enum TreeError {
    #[error("invalid decision tree: {}", join_problems(.problems))]
    Validation { problems: Vec<ValidationProblem> },
    #[error("unknown node: {0}")]
    NodeNotFound(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationProblem {
    NoRoot,
    MultipleRoots { roots: Vec<String> },
    MissingRoot { root: String },
    DanglingEdge {
        node: String,
        label: String,
        target: String,
    },
    DanglingFallback { node: String, target: String },
    SolutionHasEdges { node: String },
    QuestionWithoutOptions { node: String },
    EmptyLabel { node: String, position: usize },
    DuplicateLabel { node: String, label: String },
    InvalidNodeId { node: String, reason: &'static str },
}

impl fmt::Display for ValidationProblem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoRoot => write!(f, "no root node declared"),
            Self::MultipleRoots { roots } => {
                write!(f, "multiple root nodes declared: {}", roots.join(", "))
            }
            Self::MissingRoot { root } => write!(f, "root {root:?} is not a node"),
            Self::DanglingEdge {
                node,
                label,
                target,
            } => write!(
                f,
                "node {node:?} option {label:?} references missing node {target:?}"
            ),
            Self::DanglingFallback { node, target } => write!(
                f,
                "node {node:?} did_not_help references missing node {target:?}"
            ),
            Self::SolutionHasEdges { node } => {
                write!(f, "solution node {node:?} must not have options")
            }
            Self::QuestionWithoutOptions { node } => {
                write!(f, "question node {node:?} has no labeled options")
            }
            Self::EmptyLabel { node, position } => {
                write!(f, "question node {node:?} option #{position} has an empty label")
            }
            Self::DuplicateLabel { node, label } => {
                write!(f, "question node {node:?} repeats option label {label:?}")
            }
            Self::InvalidNodeId { node, reason } => write!(f, "node id {node:?} {reason}"),
        }
    }
}

fn join_problems(problems: &[ValidationProblem]) -> String {
    problems
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Declarative graph handed over by the tree-definition loader.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct GraphDescription {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<String>,
    pub nodes: BTreeMap<String, NodeDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeDefinition {
    Question {
        #[serde(alias = "text")]
        prompt: String,
        #[serde(default)]
        options: Vec<OptionDefinition>,
        #[serde(default)]
        root: bool,
    },
    Solution {
        #[serde(alias = "text")]
        prompt: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tag: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        collect: Vec<CollectField>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        did_not_help: Option<String>,
        // Accepted only so that load can reject it.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        options: Vec<OptionDefinition>,
        #[serde(default)]
        root: bool,
    },
}

impl NodeDefinition {
    fn options(&self) -> &[OptionDefinition] {
        match self {
            Self::Question { options, .. } | Self::Solution { options, .. } => options,
        }
    }

    fn flagged_root(&self) -> bool {
        match self {
            Self::Question { root, .. } | Self::Solution { root, .. } => *root,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OptionDefinition {
    pub label: String,
    pub next: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CollectField {
    pub key: String,
    pub prompt: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edge {
    pub label: String,
    pub target: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    Question {
        edges: Vec<Edge>,
    },
    Solution {
        resolution_tag: String,
        collect: Vec<CollectField>,
        did_not_help: Option<usize>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeNode {
    pub id: String,
    pub prompt: String,
    pub kind: NodeKind,
}

impl TreeNode {
    pub fn is_solution(&self) -> bool {
        matches!(self.kind, NodeKind::Solution { .. })
    }

    pub fn edges(&self) -> &[Edge] {
        match &self.kind {
            NodeKind::Question { edges } => edges,
            NodeKind::Solution { .. } => &[],
        }
    }

    /// Exact, case-sensitive label match.
    pub fn edge(&self, label: &str) -> Option<&Edge> {
        self.edges().iter().find(|edge| edge.label == label)
    }

    pub fn resolution_tag(&self) -> Option<&str> {
        match &self.kind {
            NodeKind::Solution { resolution_tag, .. } => Some(resolution_tag),
            NodeKind::Question { .. } => None,
        }
    }
}

/// Validated, immutable decision graph. Nodes live in an arena and edges point at arena
/// slots, so cyclic data needs no special handling here.
#[derive(Debug, Clone)]
pub struct DecisionTree {
    nodes: Vec<TreeNode>,
    index: HashMap<String, usize>,
    root: usize,
}

impl DecisionTree {
    pub fn load(description: &GraphDescription) -> Result<Self, TreeError> {
        let mut problems = Vec::new();
        let ids = description.nodes.keys().cloned().collect::<BTreeSet<_>>();

        let root_id = resolve_root(description, &ids, &mut problems);

        for (node_id, definition) in &description.nodes {
            validate_node_id(node_id, &mut problems);
            validate_definition(node_id, definition, &ids, &mut problems);
        }

        if !problems.is_empty() {
            return Err(TreeError::Validation { problems });
        }
        let Some(root_id) = root_id else {
            return Err(TreeError::Validation {
                problems: vec![ValidationProblem::NoRoot],
            });
        };

        let index = description
            .nodes
            .keys()
            .enumerate()
            .map(|(position, id)| (id.clone(), position))
            .collect::<HashMap<_, _>>();

        let nodes = description
            .nodes
            .iter()
            .map(|(node_id, definition)| build_node(node_id, definition, &index))
            .collect::<Vec<_>>();

        Ok(Self {
            root: index[&root_id],
            nodes,
            index,
        })
    }

    pub fn root(&self) -> &str {
        &self.nodes[self.root].id
    }

    pub fn root_index(&self) -> usize {
        self.root
    }

    pub fn node(&self, id: &str) -> Result<&TreeNode, TreeError> {
        self.index
            .get(id)
            .map(|position| &self.nodes[*position])
            .ok_or_else(|| TreeError::NodeNotFound(id.to_string()))
    }

    pub fn node_at(&self, position: usize) -> Option<&TreeNode> {
        self.nodes.get(position)
    }

    pub fn position_of(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn edges_of(&self, id: &str) -> Result<Vec<(&str, &str)>, TreeError> {
        let node = self.node(id)?;
        Ok(node
            .edges()
            .iter()
            .map(|edge| (edge.label.as_str(), self.nodes[edge.target].id.as_str()))
            .collect())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

fn resolve_root(
    description: &GraphDescription,
    ids: &BTreeSet<String>,
    problems: &mut Vec<ValidationProblem>,
) -> Option<String> {
    let mut declared = BTreeSet::new();
    if let Some(root) = description
        .root
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
    {
        declared.insert(root.to_string());
    }
    for (node_id, definition) in &description.nodes {
        if definition.flagged_root() {
            declared.insert(node_id.clone());
        }
    }
    if declared.is_empty() && ids.contains(DEFAULT_ROOT_ID) {
        declared.insert(DEFAULT_ROOT_ID.to_string());
    }

    match declared.len() {
        0 => {
            problems.push(ValidationProblem::NoRoot);
            None
        }
        1 => {
            let root = declared.into_iter().next()?;
            if ids.contains(&root) {
                Some(root)
            } else {
                problems.push(ValidationProblem::MissingRoot { root });
                None
            }
        }
        _ => {
            problems.push(ValidationProblem::MultipleRoots {
                roots: declared.into_iter().collect(),
            });
            None
        }
    }
}

fn validate_node_id(node_id: &str, problems: &mut Vec<ValidationProblem>) {
    if node_id.trim().is_empty() {
        problems.push(ValidationProblem::InvalidNodeId {
            node: node_id.to_string(),
            reason: "is empty",
        });
    } else if node_id.chars().count() > MAX_NODE_ID_LEN {
        problems.push(ValidationProblem::InvalidNodeId {
            node: node_id.to_string(),
            reason: "is too long for a component id",
        });
    }
}

fn validate_definition(
    node_id: &str,
    definition: &NodeDefinition,
    ids: &BTreeSet<String>,
    problems: &mut Vec<ValidationProblem>,
) {
    let options = definition.options();
    match definition {
        NodeDefinition::Solution { did_not_help, .. } => {
            if !options.is_empty() {
                problems.push(ValidationProblem::SolutionHasEdges {
                    node: node_id.to_string(),
                });
            }
            if let Some(target) = did_not_help {
                if !ids.contains(target) {
                    problems.push(ValidationProblem::DanglingFallback {
                        node: node_id.to_string(),
                        target: target.clone(),
                    });
                }
            }
        }
        NodeDefinition::Question { .. } => {
            if options.is_empty() {
                problems.push(ValidationProblem::QuestionWithoutOptions {
                    node: node_id.to_string(),
                });
            }
            let mut seen = BTreeSet::new();
            for (position, option) in options.iter().enumerate() {
                if option.label.trim().is_empty() {
                    problems.push(ValidationProblem::EmptyLabel {
                        node: node_id.to_string(),
                        position,
                    });
                } else if !seen.insert(option.label.as_str()) {
                    problems.push(ValidationProblem::DuplicateLabel {
                        node: node_id.to_string(),
                        label: option.label.clone(),
                    });
                }
            }
        }
    }

    for option in options {
        if !ids.contains(&option.next) {
            problems.push(ValidationProblem::DanglingEdge {
                node: node_id.to_string(),
                label: option.label.clone(),
                target: option.next.clone(),
            });
        }
    }
}

fn build_node(
    node_id: &str,
    definition: &NodeDefinition,
    index: &HashMap<String, usize>,
) -> TreeNode {
    match definition {
        NodeDefinition::Question {
            prompt, options, ..
        } => TreeNode {
            id: node_id.to_string(),
            prompt: prompt.trim().to_string(),
            kind: NodeKind::Question {
                edges: options
                    .iter()
                    .map(|option| Edge {
                        label: option.label.clone(),
                        target: index[&option.next],
                    })
                    .collect(),
            },
        },
        NodeDefinition::Solution {
            prompt,
            tag,
            collect,
            did_not_help,
            ..
        } => TreeNode {
            id: node_id.to_string(),
            prompt: prompt.trim().to_string(),
            kind: NodeKind::Solution {
                resolution_tag: tag
                    .as_deref()
                    .map(str::trim)
                    .filter(|value| !value.is_empty())
                    .map(str::to_string)
                    .unwrap_or_else(|| resolution_tag_for(node_id)),
                collect: collect.clone(),
                did_not_help: did_not_help.as_ref().map(|target| index[target]),
            },
        },
    }
}
