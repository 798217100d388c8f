//! Parent-path enumeration
//!
//! Lists every chain of intermediate nodes between a node and one of its
//! (non-immediate) ancestors, walking immediate parents upward and pruning
//! branches whose depth map does not contain the target.

use crate::error::{QueryError, Result};
use crate::graph::{GraphNode, NodeStore};
use crate::path;
use std::collections::BTreeSet;
use tracing::warn;

pub struct PathEnumerator<'a> {
    store: &'a dyn NodeStore,
    max_depth: usize,
}

impl<'a> PathEnumerator<'a> {
    pub fn new(store: &'a dyn NodeStore, max_depth: usize) -> Self {
        PathEnumerator { store, max_depth }
    }

    /// Intermediate chains (root side first, both ends excluded) from
    /// `node` up to `ancestor`.
    ///
    /// Returns a single empty chain when `ancestor` is an immediate parent
    /// and no chain at all when it is not an ancestor.
    pub fn paths_to_ancestor(&self, node: &GraphNode, ancestor: &str) -> Result<Vec<String>> {
        let target = path::last_segment(ancestor);
        if node.is_immediate_parent(target) {
            return Ok(vec![String::new()]);
        }
        if !node.has_ancestor(target) {
            return Ok(Vec::new());
        }

        let mut found = BTreeSet::new();
        let mut stack = vec![node.id.clone()];
        self.walk(target, node, &mut stack, &mut found)?;
        Ok(found.into_iter().collect())
    }

    /// `stack` holds the ids from the starting node up to `current`
    fn walk(
        &self,
        target: &str,
        current: &GraphNode,
        stack: &mut Vec<String>,
        found: &mut BTreeSet<String>,
    ) -> Result<()> {
        if stack.len() > self.max_depth {
            return Err(QueryError::DepthExceeded {
                node: stack[0].clone(),
                max: self.max_depth,
            });
        }

        for parent_id in current.immediate_parents() {
            if stack.contains(parent_id) {
                return Err(QueryError::CyclicAncestry(parent_id.clone()));
            }
            let parent = match self.store.get(parent_id)? {
                Some(parent) => parent,
                None => {
                    warn!(node = %parent_id, "parent missing during path enumeration");
                    continue;
                }
            };

            if parent.is_immediate_parent(target) {
                // stack[0] is the node itself and is not part of the chain
                let chain = std::iter::once(parent_id.as_str())
                    .chain(stack[1..].iter().rev().map(String::as_str));
                found.insert(path::join_all(chain));
            } else if parent.has_ancestor(target) {
                stack.push(parent_id.clone());
                self.walk(target, &parent, stack, found)?;
                stack.pop();
            }
        }
        Ok(())
    }
}
