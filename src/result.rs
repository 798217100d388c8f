//! Stage results
//!
//! A [`StageResult`] is the unit of data flowing between the stages of a
//! query: a set of node ids (bare ids or path strings) with depth bounds.
//! The same struct is stored by every result cache backend.

use crate::error::Result;
use crate::graph::{NodeHit, NodeStore, RootSet};
use crate::path;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::warn;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageResult {
    /// Cache key of the stage that produced this result
    pub key: String,
    /// Bare node ids or path strings
    pub node_ids: BTreeSet<String>,
    /// 0 means not yet depth-resolved (start set only)
    pub min_level: u32,
    pub max_level: u32,
    /// Sum of the immediate-child counts of the members
    pub sub_node_count: u64,
    /// True when read back from the cache or built from known paths
    #[serde(skip)]
    pub loaded: bool,
    /// Members are ancestors of the previous stage rather than descendants
    pub ancestor_hop: bool,
}

impl StageResult {
    /// Start set (or path reference) built from known path strings
    pub fn from_paths<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut result = StageResult {
            node_ids: paths.into_iter().map(Into::into).collect(),
            loaded: true,
            ..Default::default()
        };
        result.update_min_max();
        result
    }

    /// Unresolved start set made of every registered root
    pub fn from_roots(roots: &RootSet) -> Self {
        StageResult {
            node_ids: roots.iter().cloned().collect(),
            loaded: true,
            ..Default::default()
        }
    }

    /// Freshly computed result from node store or search index hits
    pub fn from_hits(hits: Vec<NodeHit>) -> Self {
        let sub_node_count = hits.iter().map(|h| h.child_count).sum();
        StageResult {
            node_ids: hits.into_iter().map(|h| h.id).collect(),
            sub_node_count,
            ..Default::default()
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    pub fn len(&self) -> usize {
        self.node_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.node_ids.is_empty()
    }

    /// True if the members are multi-segment path strings
    pub fn is_paths(&self) -> bool {
        self.node_ids.iter().any(|id| path::is_multi(id))
    }

    pub fn last_segments(&self) -> BTreeSet<String> {
        self.node_ids
            .iter()
            .map(|id| path::last_segment(id).to_string())
            .collect()
    }

    /// Recompute the depth bounds from the segment count of each member.
    ///
    /// Only meaningful when the members are path strings.
    pub fn update_min_max(&mut self) {
        let levels: Vec<u32> = self
            .node_ids
            .iter()
            .map(|id| path::segment_count(id) as u32)
            .collect();
        self.set_bounds(levels);
    }

    /// Recompute the depth bounds of a bare-id set by loading each node.
    ///
    /// A bare id sits one below its closest root ancestor; path strings
    /// count their segments. Nodes that cannot be loaded do not contribute.
    pub fn update_load_min_max(&mut self, store: &dyn NodeStore) -> Result<()> {
        let roots = store.roots();
        let mut levels = Vec::with_capacity(self.node_ids.len());
        for id in &self.node_ids {
            if path::is_multi(id) {
                levels.push(path::segment_count(id) as u32);
                continue;
            }
            match store.get(id)? {
                Some(node) => levels.push(node.level_in(&roots)),
                None => warn!(node = %id, "node missing while computing levels"),
            }
        }
        self.set_bounds(levels);
        Ok(())
    }

    fn set_bounds(&mut self, levels: impl IntoIterator<Item = u32>) {
        let mut bounds: Option<(u32, u32)> = None;
        for level in levels {
            bounds = Some(match bounds {
                Some((min, max)) => (min.min(level), max.max(level)),
                None => (level, level),
            });
        }
        let (min, max) = bounds.unwrap_or((0, 0));
        self.min_level = min;
        self.max_level = max;
    }

    /// Members of `candidates` reachable from this result.
    ///
    /// A candidate survives when one of its segments is the last segment of a
    /// member of this result, or when the node named by its first segment has
    /// such a last segment among its ancestors. Candidates are grouped by
    /// first segment so each node is loaded once; unloadable nodes are dropped.
    pub fn reachable_from(
        &self,
        store: &dyn NodeStore,
        candidates: &BTreeSet<String>,
    ) -> Result<BTreeSet<String>> {
        let previous_last = self.last_segments();

        let mut by_first: BTreeMap<&str, Vec<&String>> = BTreeMap::new();
        for candidate in candidates {
            by_first
                .entry(path::first_segment(candidate))
                .or_default()
                .push(candidate);
        }

        let mut survivors = BTreeSet::new();
        for (first, members) in by_first {
            let mut pending = Vec::new();
            for member in members {
                if path::segments(member).any(|s| previous_last.contains(s)) {
                    survivors.insert(member.clone());
                } else {
                    pending.push(member);
                }
            }
            if pending.is_empty() {
                continue;
            }

            let node = match store.get(first)? {
                Some(node) => node,
                None => {
                    warn!(node = %first, "dropping unloadable node from ancestor check");
                    continue;
                }
            };
            if node.ancestors.keys().any(|a| previous_last.contains(a)) {
                survivors.extend(pending.into_iter().cloned());
            }
        }
        Ok(survivors)
    }

    /// Narrow `next` to the members reachable from this result.
    ///
    /// Returns false when nothing survives.
    pub fn check_ancestor(&self, store: &dyn NodeStore, next: &mut StageResult) -> Result<bool> {
        next.node_ids = self.reachable_from(store, &next.node_ids)?;
        Ok(!next.node_ids.is_empty())
    }
}
