//! Graph definitions.
//!
//! A graph is a start node name plus a map of named nodes. Each node is bound
//! to a registered tool and may carry a default `next`, an ordered branch
//! table and a loop condition. Definitions are immutable once stored; dangling
//! references are only detected at traversal time unless `validate` is used.

use std::collections::HashMap;
use std::fmt;

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Ordered branch table: state key → target node name.
///
/// Order is definition order, preserved through JSON (de)serialization,
/// because the first truthy key wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Branches(Vec<(String, String)>);

impl Branches {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a branch. A repeated key replaces the earlier target in place.
    pub fn push(&mut self, key: impl Into<String>, target: impl Into<String>) {
        let key = key.into();
        let target = target.into();
        match self.0.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = target,
            None => self.0.push((key, target)),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, t)| (k.as_str(), t.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl<K: Into<String>, T: Into<String>> FromIterator<(K, T)> for Branches {
    fn from_iter<I: IntoIterator<Item = (K, T)>>(iter: I) -> Self {
        let mut branches = Branches::new();
        for (k, t) in iter {
            branches.push(k, t);
        }
        branches
    }
}

impl Serialize for Branches {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (k, t) in &self.0 {
            map.serialize_entry(k, t)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Branches {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct BranchesVisitor;

        impl<'de> Visitor<'de> for BranchesVisitor {
            type Value = Branches;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of state keys to node names")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Branches, A::Error> {
                let mut branches = Branches::new();
                while let Some((key, target)) = access.next_entry::<String, String>()? {
                    branches.push(key, target);
                }
                Ok(branches)
            }
        }

        deserializer.deserialize_map(BranchesVisitor)
    }
}

/// A node in a graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDef {
    /// Node name. Inside a graph this is always the node's key.
    #[serde(default)]
    pub name: String,
    /// Name of the registered tool backing this node.
    #[serde(rename = "fn", alias = "tool_name", alias = "tool")]
    pub tool_name: String,
    /// Default next node; `None` ends traversal.
    #[serde(default)]
    pub next: Option<String>,
    /// Conditional edges, evaluated before `next`.
    #[serde(default, skip_serializing_if = "Branches::is_empty")]
    pub branches: Branches,
    /// State key that must become truthy before the node stops repeating.
    #[serde(default)]
    pub loop_condition: Option<String>,
}

impl NodeDef {
    /// Create a node with no outgoing edges.
    pub fn new(name: impl Into<String>, tool_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tool_name: tool_name.into(),
            next: None,
            branches: Branches::new(),
            loop_condition: None,
        }
    }

    /// Set the default next node.
    pub fn with_next(mut self, next: impl Into<String>) -> Self {
        self.next = Some(next.into());
        self
    }

    /// Add a branch: when `key` is truthy, go to `target`.
    pub fn with_branch(mut self, key: impl Into<String>, target: impl Into<String>) -> Self {
        self.branches.push(key, target);
        self
    }

    /// Repeat this node until `key` is truthy.
    pub fn with_loop_condition(mut self, key: impl Into<String>) -> Self {
        self.loop_condition = Some(key.into());
        self
    }
}

#[derive(Deserialize)]
struct RawGraphDef {
    start: String,
    nodes: HashMap<String, NodeDef>,
}

/// An immutable workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawGraphDef")]
pub struct GraphDef {
    pub start: String,
    pub nodes: HashMap<String, NodeDef>,
}

impl From<RawGraphDef> for GraphDef {
    fn from(raw: RawGraphDef) -> Self {
        let nodes = raw
            .nodes
            .into_iter()
            .map(|(name, mut node)| {
                node.name = name.clone();
                (name, node)
            })
            .collect();
        Self {
            start: raw.start,
            nodes,
        }
    }
}

impl GraphDef {
    /// Build a graph from a list of nodes, keyed by their names.
    pub fn new(start: impl Into<String>, nodes: impl IntoIterator<Item = NodeDef>) -> Self {
        Self {
            start: start.into(),
            nodes: nodes.into_iter().map(|n| (n.name.clone(), n)).collect(),
        }
    }

    pub fn node(&self, name: &str) -> Option<&NodeDef> {
        self.nodes.get(name)
    }

    /// Report references to nodes that do not exist.
    ///
    /// Returns an empty list for a fully-resolved graph. Problems are sorted
    /// so the output is stable.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if !self.nodes.contains_key(&self.start) {
            problems.push(format!("start node '{}' is not defined", self.start));
        }
        for node in self.nodes.values() {
            if let Some(next) = &node.next {
                if !self.nodes.contains_key(next) {
                    problems.push(format!(
                        "node '{}' has next '{}' which is not defined",
                        node.name, next
                    ));
                }
            }
            for (key, target) in node.branches.iter() {
                if !self.nodes.contains_key(target) {
                    problems.push(format!(
                        "node '{}' branch '{}' targets '{}' which is not defined",
                        node.name, key, target
                    ));
                }
            }
        }
        problems.sort();
        problems
    }
}
