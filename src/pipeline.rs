//! Deployment descriptor: the YAML document describing a pipeline's input streams and the
//! operator/stream graph to wire up for them.
//!
//! Parsed with plain serde over an untagged enum rather than a hand-rolled YAML walk.

use std::collections::HashSet;
use std::path::Path;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::{EstuaryError, Result};

/// One node of the nested `pipelines` map: either another nested map (an operator chained to
/// further operators) or a list of leaf stream selectors the operator's output is connected to.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PipelineNode {
    Chain(PipelineMap),
    Leaves(Vec<String>),
}

pub type PipelineMap = IndexMap<String, PipelineNode>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSpec {
    pub name: String,
    #[serde(default)]
    pub streams: Vec<String>,
    pub pipelines: PipelineMap,
}

impl PipelineSpec {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    pub fn known_streams(&self) -> HashSet<String> {
        self.streams.iter().cloned().collect()
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(EstuaryError::Deployment)
    }
}
