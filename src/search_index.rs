//! Search index
//!
//! Holds a denormalized document per node (immediate parents, ancestor-depth
//! map, child count, properties) and answers filtered subtree queries.

use crate::condition::Condition;
use crate::error::Result;
use crate::graph::{Graph, GraphNode, NodeHit};
use crate::types::*;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{debug, warn};

/// Which documents a search may match
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchScope {
    /// Descendants of `roots` at relative distance `1..=max_relative_depth`
    Subtree {
        roots: BTreeSet<NodeId>,
        max_relative_depth: u32,
    },
    /// Exactly these nodes
    Nodes(BTreeSet<NodeId>),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubtreeHits {
    pub hits: Vec<NodeHit>,
    pub total_child_count: u64,
    /// More documents matched than the hit cap allowed
    pub truncated: bool,
}

pub trait SearchIndex: Send + Sync {
    fn search_subtree(
        &self,
        scope: &SearchScope,
        condition: &Condition,
        post_filter: Option<&Condition>,
    ) -> Result<SubtreeHits>;
}

/// Denormalized copy of a node as stored in the index
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexedDocument {
    pub id: NodeId,
    pub parents: BTreeSet<NodeId>,
    pub ancestors: AncestorDepths,
    pub child_count: u64,
    pub properties: Properties,
}

impl From<&GraphNode> for IndexedDocument {
    fn from(node: &GraphNode) -> Self {
        IndexedDocument {
            id: node.id.clone(),
            parents: node.immediate_parents().cloned().collect(),
            ancestors: node.ancestors.clone(),
            child_count: node.child_count,
            properties: node.properties.clone(),
        }
    }
}

impl IndexedDocument {
    fn in_scope(&self, scope: &SearchScope) -> bool {
        match scope {
            SearchScope::Nodes(ids) => ids.contains(&self.id),
            SearchScope::Subtree {
                roots,
                max_relative_depth,
            } => {
                if *max_relative_depth <= 1 {
                    self.parents.iter().any(|p| roots.contains(p))
                } else {
                    self.ancestors
                        .iter()
                        .any(|(a, d)| *d <= *max_relative_depth && roots.contains(a))
                }
            }
        }
    }
}

/// In-memory search index
pub struct MemoryIndex {
    documents: DashMap<NodeId, IndexedDocument>,
    max_hits: usize,
}

impl MemoryIndex {
    pub fn new(max_hits: usize) -> Self {
        MemoryIndex {
            documents: DashMap::new(),
            max_hits,
        }
    }

    pub fn index_node(&self, node: &GraphNode) {
        self.documents
            .insert(node.id.clone(), IndexedDocument::from(node));
    }

    /// Index every node of the graph; returns the number of documents written
    pub fn index_graph(&self, graph: &Graph) -> usize {
        let nodes = graph.nodes();
        for node in &nodes {
            self.index_node(node);
        }
        debug!(documents = nodes.len(), "indexed graph");
        nodes.len()
    }

    pub fn remove(&self, id: &str) -> bool {
        self.documents.remove(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

impl SearchIndex for MemoryIndex {
    fn search_subtree(
        &self,
        scope: &SearchScope,
        condition: &Condition,
        post_filter: Option<&Condition>,
    ) -> Result<SubtreeHits> {
        let mut hits: Vec<NodeHit> = self
            .documents
            .iter()
            .filter(|doc| doc.in_scope(scope))
            .filter(|doc| condition.matches(&doc.properties))
            .filter(|doc| post_filter.map_or(true, |f| f.matches(&doc.properties)))
            .map(|doc| NodeHit {
                id: doc.id.clone(),
                child_count: doc.child_count,
            })
            .collect();
        hits.sort_by(|a, b| a.id.cmp(&b.id));

        let truncated = hits.len() > self.max_hits;
        if truncated {
            warn!(
                matched = hits.len(),
                max_hits = self.max_hits,
                "search index hit cap exceeded, truncating"
            );
            hits.truncate(self.max_hits);
        }

        let total_child_count = hits.iter().map(|h| h.child_count).sum();
        Ok(SubtreeHits {
            hits,
            total_child_count,
            truncated,
        })
    }
}
