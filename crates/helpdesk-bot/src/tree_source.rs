use anyhow::{Context, Result};
use helpdesk_core::{DecisionTree, GraphDescription};
use std::path::Path;

/// Reads and validates the YAML tree. Any validation problem is fatal at startup.
pub fn load_tree(path: &Path) -> Result<DecisionTree> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("reading tree {}", path.display()))?;
    parse_tree(&contents).with_context(|| format!("loading tree {}", path.display()))
}

pub fn parse_tree(contents: &str) -> Result<DecisionTree> {
    let description: GraphDescription =
        serde_yaml::from_str(contents).context("tree is not valid YAML")?;
    Ok(DecisionTree::load(&description)?)
}
