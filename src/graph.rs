//! Graph nodes and the node store
//!
//! Key points:
//! - Every node carries its ancestor-depth map (all transitive ancestors with
//!   their minimal distance), so reachability checks are point lookups
//! - Depth maps only ever grow; distances only ever shrink (min-merge)
//! - Lock-free concurrent access (DashMap)

use crate::condition::Condition;
use crate::error::{QueryError, Result};
use crate::path;
use crate::types::*;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::SystemTime;

/// A node of the archival hierarchy (domain, intermediate or leaf)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: NodeId,
    pub properties: Properties,
    pub is_domain: bool,
    pub domain_parents: BTreeSet<NodeId>,
    pub structural_parents: BTreeSet<NodeId>,
    pub ancestors: AncestorDepths,
    pub child_count: u64,
    pub created_at: SystemTime,
}

impl GraphNode {
    pub fn new(id: impl Into<NodeId>, properties: Properties) -> Self {
        GraphNode {
            id: id.into(),
            properties,
            is_domain: false,
            domain_parents: BTreeSet::new(),
            structural_parents: BTreeSet::new(),
            ancestors: AncestorDepths::new(),
            child_count: 0,
            created_at: SystemTime::now(),
        }
    }

    pub fn new_domain(id: impl Into<NodeId>, properties: Properties) -> Self {
        let mut node = GraphNode::new(id, properties);
        node.is_domain = true;
        node
    }

    pub fn parents(&self, link: ParentLink) -> &BTreeSet<NodeId> {
        match link {
            ParentLink::Domain => &self.domain_parents,
            ParentLink::Structural => &self.structural_parents,
        }
    }

    fn parents_mut(&mut self, link: ParentLink) -> &mut BTreeSet<NodeId> {
        match link {
            ParentLink::Domain => &mut self.domain_parents,
            ParentLink::Structural => &mut self.structural_parents,
        }
    }

    /// Immediate parents, domain links first
    pub fn immediate_parents(&self) -> impl Iterator<Item = &NodeId> {
        self.domain_parents.iter().chain(self.structural_parents.iter())
    }

    /// True if the last segment of `path_or_id` is an immediate parent
    pub fn is_immediate_parent(&self, path_or_id: &str) -> bool {
        let last = path::last_segment(path_or_id);
        ParentLink::ORDER
            .iter()
            .any(|link| self.parents(*link).contains(last))
    }

    pub fn has_ancestor(&self, id: &str) -> bool {
        self.ancestors.contains_key(id)
    }

    /// Depth of this node counted from its closest root in `roots` (roots
    /// are level 1). Falls back to [`GraphNode::level`] when no ancestor is
    /// a known root.
    pub fn level_in(&self, roots: &RootSet) -> u32 {
        self.ancestors
            .iter()
            .filter(|(id, _)| roots.contains(id.as_str()))
            .map(|(_, distance)| distance + 1)
            .min()
            .unwrap_or_else(|| self.level())
    }

    /// Depth counted from the farthest ancestor.
    ///
    /// Every ancestor chain ends at a root, so on a single-rooted archive
    /// this is the distance to that root plus one.
    pub fn level(&self) -> u32 {
        self.ancestors.values().max().map(|d| d + 1).unwrap_or(1)
    }
}

/// Depth-map contribution of linking a child under `parent`
pub fn derive_depths(parent: &GraphNode) -> AncestorDepths {
    let mut depths: AncestorDepths = parent
        .ancestors
        .iter()
        .map(|(id, depth)| (id.clone(), depth + 1))
        .collect();
    depths.insert(parent.id.clone(), 1);
    depths
}

/// Pointwise-minimum merge of two depth maps
pub fn merge_depths(old: &AncestorDepths, new: &AncestorDepths) -> AncestorDepths {
    let mut merged = old.clone();
    for (id, depth) in new {
        merged
            .entry(id.clone())
            .and_modify(|d| *d = (*d).min(*depth))
            .or_insert(*depth);
    }
    merged
}

/// Registry of domain (root) ids, handed to stores and the executor
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootSet(BTreeSet<NodeId>);

impl RootSet {
    pub fn new() -> Self {
        RootSet(BTreeSet::new())
    }

    pub fn insert(&mut self, id: impl Into<NodeId>) -> bool {
        self.0.insert(id.into())
    }

    pub fn remove(&mut self, id: &str) -> bool {
        self.0.remove(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.0.contains(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &NodeId> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn ids(&self) -> &BTreeSet<NodeId> {
        &self.0
    }
}

impl<S: Into<NodeId>> FromIterator<S> for RootSet {
    fn from_iter<T: IntoIterator<Item = S>>(iter: T) -> Self {
        RootSet(iter.into_iter().map(Into::into).collect())
    }
}

/// Filter condition of a node store `find`
#[derive(Debug, Clone, Default)]
pub struct NodeFilter {
    /// Restrict to these ids
    pub ids: Option<BTreeSet<NodeId>>,
    /// Restrict to nodes having one of these immediate parents via one of the links
    pub parents: Option<(Vec<ParentLink>, BTreeSet<NodeId>)>,
    /// Restrict to domain nodes
    pub domains_only: bool,
    pub condition: Condition,
}

impl NodeFilter {
    pub fn domains(condition: Condition) -> Self {
        NodeFilter {
            domains_only: true,
            condition,
            ..Default::default()
        }
    }

    pub fn children_of(links: Vec<ParentLink>, parents: BTreeSet<NodeId>, condition: Condition) -> Self {
        NodeFilter {
            parents: Some((links, parents)),
            condition,
            ..Default::default()
        }
    }

    pub fn among(ids: BTreeSet<NodeId>, condition: Condition) -> Self {
        NodeFilter {
            ids: Some(ids),
            condition,
            ..Default::default()
        }
    }

    pub fn matches(&self, node: &GraphNode) -> bool {
        if let Some(ids) = &self.ids {
            if !ids.contains(&node.id) {
                return false;
            }
        }
        if let Some((links, parents)) = &self.parents {
            let linked = links
                .iter()
                .any(|link| node.parents(*link).iter().any(|p| parents.contains(p)));
            if !linked {
                return false;
            }
        }
        if self.domains_only && !node.is_domain {
            return false;
        }
        self.condition.matches(&node.properties)
    }
}

/// Projection returned by `find`: id and immediate-child counter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeHit {
    pub id: NodeId,
    pub child_count: u64,
}

impl From<&GraphNode> for NodeHit {
    fn from(node: &GraphNode) -> Self {
        NodeHit {
            id: node.id.clone(),
            child_count: node.child_count,
        }
    }
}

/// Document store holding the authoritative graph
pub trait NodeStore: Send + Sync {
    /// Point lookup by identifier
    fn get(&self, id: &str) -> Result<Option<GraphNode>>;

    /// Filtered scan returning (id, child count), ordered by id
    fn find(&self, filter: &NodeFilter) -> Result<Vec<NodeHit>>;

    fn exists(&self, id: &str) -> Result<bool>;

    /// Domain ids registered when the store was opened
    fn roots(&self) -> RootSet;
}

/// In-memory node store
///
/// Maps parent -> children per link category for fast child queries.
pub struct Graph {
    nodes: DashMap<NodeId, GraphNode>,
    children: DashMap<(ParentLink, NodeId), BTreeSet<NodeId>>,
    roots: RwLock<RootSet>,
}

impl Graph {
    pub fn new() -> Self {
        Graph {
            nodes: DashMap::new(),
            children: DashMap::new(),
            roots: RwLock::new(RootSet::new()),
        }
    }

    /// Add (or refresh the properties of) a domain
    pub fn add_domain(&self, id: &str, properties: Properties) -> Result<()> {
        path::validate_id(id)?;
        self.nodes
            .entry(id.to_string())
            .and_modify(|node| {
                node.is_domain = true;
                node.properties.extend(properties.clone());
            })
            .or_insert_with(|| GraphNode::new_domain(id, properties));
        self.roots.write().insert(id);
        Ok(())
    }

    /// Ingest a node under the given parents
    ///
    /// Re-ingesting an existing id unions its parents, extends its properties
    /// and min-merges its depth map.
    pub fn add_node(&self, id: &str, properties: Properties, parents: &[(ParentLink, &str)]) -> Result<()> {
        path::validate_id(id)?;
        let mut node = GraphNode::new(id, properties);
        for (link, parent_id) in parents {
            // Clone the parent out so no shard lock is held while inserting
            let parent = self
                .nodes
                .get(*parent_id)
                .map(|p| p.clone())
                .ok_or_else(|| QueryError::NodeNotFound(parent_id.to_string()))?;
            node.ancestors = merge_depths(&node.ancestors, &derive_depths(&parent));
            node.parents_mut(*link).insert(parent.id.clone());
        }
        self.upsert(node)
    }

    /// Link an existing node under one more parent
    pub fn link_parent(&self, id: &str, link: ParentLink, parent_id: &str) -> Result<()> {
        if !self.nodes.contains_key(id) {
            return Err(QueryError::NodeNotFound(id.to_string()));
        }
        self.add_node(id, Properties::new(), &[(link, parent_id)])
    }

    /// Insert or merge a fully built node (also used for restore)
    pub fn upsert(&self, mut node: GraphNode) -> Result<()> {
        path::validate_id(&node.id)?;
        for link in ParentLink::ORDER {
            for parent in node.parents(link).clone() {
                node.ancestors.insert(parent, 1);
            }
        }

        let mut new_links = Vec::new();
        let depths_changed = match self.nodes.get_mut(&node.id) {
            Some(mut existing) => {
                for link in ParentLink::ORDER {
                    for parent in node.parents(link) {
                        if existing.parents_mut(link).insert(parent.clone()) {
                            new_links.push((link, parent.clone()));
                        }
                    }
                }
                let merged = merge_depths(&existing.ancestors, &node.ancestors);
                let changed = merged != existing.ancestors;
                existing.ancestors = merged;
                existing.properties.extend(node.properties);
                existing.is_domain |= node.is_domain;
                changed
            }
            None => {
                for link in ParentLink::ORDER {
                    for parent in node.parents(link) {
                        new_links.push((link, parent.clone()));
                    }
                }
                if node.is_domain {
                    self.roots.write().insert(node.id.clone());
                }
                self.nodes.insert(node.id.clone(), node.clone());
                true
            }
        };

        for (link, parent) in new_links {
            let inserted = self
                .children
                .entry((link, parent.clone()))
                .or_default()
                .insert(node.id.clone());
            if inserted {
                if let Some(mut p) = self.nodes.get_mut(&parent) {
                    p.child_count += 1;
                }
            }
        }

        if depths_changed {
            self.propagate_depths(&node.id);
        }
        Ok(())
    }

    /// Min-merge the depth map of `id` down into every descendant.
    ///
    /// A descendant is revisited only when its map actually shrank, so the
    /// walk ends even on cyclic links.
    fn propagate_depths(&self, id: &str) {
        let mut pending = vec![id.to_string()];
        while let Some(current) = pending.pop() {
            let contribution = match self.nodes.get(&current) {
                Some(node) => derive_depths(node.value()),
                None => continue,
            };
            for link in ParentLink::ORDER {
                let children: Vec<NodeId> = self
                    .children
                    .get(&(link, current.clone()))
                    .map(|c| c.iter().cloned().collect())
                    .unwrap_or_default();
                for child in children {
                    if let Some(mut node) = self.nodes.get_mut(&child) {
                        let merged = merge_depths(&node.ancestors, &contribution);
                        if merged != node.ancestors {
                            node.ancestors = merged;
                            pending.push(child);
                        }
                    }
                }
            }
        }
    }

    /// Remove a whole node; its parents' child counters are decremented
    pub fn remove_node(&self, id: &str) -> Option<GraphNode> {
        let (_, node) = self.nodes.remove(id)?;
        for link in ParentLink::ORDER {
            for parent in node.parents(link) {
                if let Some(mut children) = self.children.get_mut(&(link, parent.clone())) {
                    children.remove(id);
                }
                if let Some(mut p) = self.nodes.get_mut(parent) {
                    p.child_count = p.child_count.saturating_sub(1);
                }
            }
        }
        if node.is_domain {
            self.roots.write().remove(id);
        }
        Some(node)
    }

    /// Snapshot of every node (for indexing and backup)
    pub fn nodes(&self) -> Vec<GraphNode> {
        let mut all: Vec<GraphNode> = self.nodes.iter().map(|n| n.value().clone()).collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn stats(&self) -> GraphStats {
        let roots = self.roots.read().clone();
        let max_level = self.nodes.iter().map(|n| n.level_in(&roots)).max().unwrap_or(0);
        GraphStats {
            node_count: self.nodes.len(),
            domain_count: self.roots.read().len(),
            max_level,
        }
    }

    fn candidates(&self, filter: &NodeFilter) -> Vec<NodeId> {
        if let Some(ids) = &filter.ids {
            return ids.iter().cloned().collect();
        }
        if let Some((links, parents)) = &filter.parents {
            let mut out = BTreeSet::new();
            for link in links {
                for parent in parents {
                    if let Some(children) = self.children.get(&(*link, parent.clone())) {
                        out.extend(children.iter().cloned());
                    }
                }
            }
            return out.into_iter().collect();
        }
        if filter.domains_only {
            return self.roots.read().iter().cloned().collect();
        }
        self.nodes.iter().map(|n| n.key().clone()).collect()
    }
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeStore for Graph {
    fn get(&self, id: &str) -> Result<Option<GraphNode>> {
        Ok(self.nodes.get(id).map(|n| n.clone()))
    }

    fn find(&self, filter: &NodeFilter) -> Result<Vec<NodeHit>> {
        let mut hits: Vec<NodeHit> = self
            .candidates(filter)
            .into_iter()
            .filter_map(|id| {
                self.nodes
                    .get(&id)
                    .filter(|node| filter.matches(node))
                    .map(|node| NodeHit::from(node.value()))
            })
            .collect();
        hits.sort_by(|a, b| a.id.cmp(&b.id));
        hits.dedup_by(|a, b| a.id == b.id);
        Ok(hits)
    }

    fn exists(&self, id: &str) -> Result<bool> {
        Ok(self.nodes.contains_key(id))
    }

    fn roots(&self) -> RootSet {
        self.roots.read().clone()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphStats {
    pub node_count: usize,
    pub domain_count: usize,
    pub max_level: u32,
}
