//! Multi-stage query executor
//!
//! Walks a compiled query stage by stage:
//! 1. Resolve the longest cached prefix (path references always resolve)
//! 2. Run each remaining stage on the node store or the search index
//! 3. Check that every new member descends from the previous stage
//! 4. Write newly computed stages through to the result cache
//! 5. Rebuild root-to-node paths from the chain of stage results
//!
//! Stages run strictly in order; a stage never starts before the previous
//! one has been validated.

use crate::cache::ResultCache;
use crate::condition::Condition;
use crate::config::EngineConfig;
use crate::error::{QueryError, Result};
use crate::graph::{GraphNode, NodeFilter, NodeHit, NodeStore, RootSet};
use crate::metrics::{QueryMetrics, NODE_STORE_FIND, NODE_STORE_GET, SEARCH_INDEX};
use crate::path;
use crate::paths::PathEnumerator;
use crate::plan::{CompiledQuery, DepthRequest, StageDescriptor};
use crate::result::StageResult;
use crate::search_index::{SearchIndex, SearchScope, SubtreeHits};
use crate::types::ParentLink;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    /// A freshly computed stage had no member reachable from its predecessor
    NoAncestor { stage: usize },
    /// A cached stage emptied once re-filtered against the start set
    EmptyCachedStage { stage: usize },
    /// Path reconstruction left no path reachable from the start set
    Unreachable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryState {
    ResolvingCachePrefix,
    ExecutingStage(usize),
    ValidatingAncestor(usize),
    Finalizing,
    Done,
    Failed(FailureReason),
}

/// Strategy chosen for one stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    PathReference,
    AncestorHop,
    Depth,
    Domain,
    ChildFromIndex,
    ChildFromStore,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::PathReference => "path_reference",
            Strategy::AncestorHop => "ancestor_hop",
            Strategy::Depth => "depth",
            Strategy::Domain => "domain",
            Strategy::ChildFromIndex => "child_index",
            Strategy::ChildFromStore => "child_store",
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueryOutcome {
    /// Start set followed by one result per executed or cached stage
    pub chain: Vec<StageResult>,
    pub state: QueryState,
    /// Highest stage rank resolved from the cache or a path reference
    pub last_cache_rank: Option<usize>,
    pub final_paths: Option<StageResult>,
}

impl QueryOutcome {
    pub fn is_done(&self) -> bool {
        self.state == QueryState::Done
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.state, QueryState::Failed(_))
    }

    /// Done, but nothing matched
    pub fn is_validly_empty(&self) -> bool {
        self.is_done() && self.final_paths.as_ref().map_or(true, StageResult::is_empty)
    }

    /// Final root-to-node paths (empty unless done)
    pub fn paths(&self) -> BTreeSet<String> {
        self.final_paths
            .as_ref()
            .map(|r| r.node_ids.clone())
            .unwrap_or_default()
    }

    fn label(&self) -> &'static str {
        match self.state {
            QueryState::Done if self.is_validly_empty() => "empty",
            QueryState::Done => "done",
            QueryState::Failed(FailureReason::NoAncestor { .. }) => "no_ancestor",
            QueryState::Failed(FailureReason::EmptyCachedStage { .. }) => "empty_cached_stage",
            QueryState::Failed(FailureReason::Unreachable) => "unreachable",
            _ => "aborted",
        }
    }
}

/// Node store wrapper counting backend calls
struct MeteredStore {
    inner: Arc<dyn NodeStore>,
    metrics: Arc<QueryMetrics>,
}

impl NodeStore for MeteredStore {
    fn get(&self, id: &str) -> Result<Option<GraphNode>> {
        self.metrics.record_backend_call(NODE_STORE_GET);
        self.inner.get(id)
    }

    fn find(&self, filter: &NodeFilter) -> Result<Vec<NodeHit>> {
        self.metrics.record_backend_call(NODE_STORE_FIND);
        self.inner.find(filter)
    }

    fn exists(&self, id: &str) -> Result<bool> {
        self.metrics.record_backend_call(NODE_STORE_GET);
        self.inner.exists(id)
    }

    fn roots(&self) -> RootSet {
        self.inner.roots()
    }
}

pub struct QueryExecutor {
    store: MeteredStore,
    index: Arc<dyn SearchIndex>,
    cache: Arc<dyn ResultCache>,
    config: EngineConfig,
    metrics: Arc<QueryMetrics>,
}

impl QueryExecutor {
    pub fn new(
        node_store: Arc<dyn NodeStore>,
        search_index: Arc<dyn SearchIndex>,
        cache: Arc<dyn ResultCache>,
        config: EngineConfig,
        metrics: Arc<QueryMetrics>,
    ) -> Self {
        QueryExecutor {
            store: MeteredStore {
                inner: node_store,
                metrics: Arc::clone(&metrics),
            },
            index: search_index,
            cache,
            config,
            metrics,
        }
    }

    pub fn roots(&self) -> RootSet {
        self.store.roots()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<QueryMetrics> {
        &self.metrics
    }

    pub fn cache(&self) -> &Arc<dyn ResultCache> {
        &self.cache
    }

    /// Execute a compiled query from a start set.
    ///
    /// Backend and descriptor errors abort with `Err`; an unsatisfiable query
    /// comes back as `Ok` with a `Failed` state or a validly-empty `Done`.
    pub fn execute(&self, query: &CompiledQuery, start: StageResult) -> Result<QueryOutcome> {
        let started = Instant::now();
        let outcome = self.run(query, start);
        let elapsed = started.elapsed();

        match &outcome {
            Ok(o) => {
                self.metrics.record_query(o.label(), elapsed.as_secs_f64());
                info!(
                    stages = query.stages.len(),
                    last_cache_rank = ?o.last_cache_rank,
                    state = ?o.state,
                    paths = o.final_paths.as_ref().map_or(0, StageResult::len),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "query finished"
                );
            }
            Err(e) => {
                self.metrics.record_query("error", elapsed.as_secs_f64());
                warn!(code = e.code(), error = %e, "query failed");
            }
        }
        outcome
    }

    fn run(&self, query: &CompiledQuery, mut start: StageResult) -> Result<QueryOutcome> {
        query.validate()?;
        let keys = query.stage_keys();
        start.loaded = true;

        let mut outcome = QueryOutcome {
            chain: Vec::with_capacity(query.stages.len() + 1),
            state: QueryState::ResolvingCachePrefix,
            last_cache_rank: None,
            final_paths: None,
        };
        outcome.chain.push(start);

        if query.simulate {
            self.simulate(query, &keys, &mut outcome);
            return Ok(outcome);
        }

        if let Some(state) = self.resolve_cache_prefix(query, &keys, &mut outcome)? {
            outcome.state = state;
            return Ok(outcome);
        }

        let first = outcome.last_cache_rank.map_or(0, |rank| rank + 1);
        for rank in first..query.stages.len() {
            outcome.state = QueryState::ExecutingStage(rank);
            let stage_started = Instant::now();

            let previous = outcome.chain.last().ok_or_else(|| {
                QueryError::Backend("stage chain lost its start set".to_string())
            })?;
            let (mut result, strategy) = self.run_stage(rank, &query.stages[rank], previous)?;
            result.key = keys[rank].clone();

            outcome.state = QueryState::ValidatingAncestor(rank);
            // Ancestor hops hold ancestors of the previous stage, so they can
            // only be checked against the start set
            let anchor = if result.ancestor_hop {
                &outcome.chain[0]
            } else {
                previous
            };
            let reachable = anchor.check_ancestor(&self.store, &mut result)?;
            if !reachable {
                if strategy == Strategy::PathReference {
                    info!(stage = rank, "path reference not reachable, empty result");
                    outcome.final_paths = Some(StageResult::default().with_key(keys[rank].clone()));
                    outcome.chain.push(result);
                    outcome.state = QueryState::Done;
                } else {
                    error!(
                        stage = rank,
                        key = %keys[rank],
                        strategy = strategy.as_str(),
                        "no member has an ancestor in the previous stage"
                    );
                    outcome.chain.push(result);
                    outcome.state = QueryState::Failed(FailureReason::NoAncestor { stage: rank });
                }
                return Ok(outcome);
            }

            match strategy {
                Strategy::Depth | Strategy::AncestorHop | Strategy::PathReference => {
                    result.update_load_min_max(&self.store)?
                }
                Strategy::Domain => result.update_min_max(),
                Strategy::ChildFromIndex | Strategy::ChildFromStore => {}
            }

            self.metrics
                .record_stage(strategy.as_str(), stage_started.elapsed().as_secs_f64());
            debug!(
                stage = rank,
                strategy = strategy.as_str(),
                nodes = result.len(),
                min_level = result.min_level,
                max_level = result.max_level,
                sub_nodes = result.sub_node_count,
                "stage executed"
            );

            if query.use_cache && strategy != Strategy::PathReference {
                self.persist(&result);
            }
            outcome.chain.push(result);
        }

        outcome.state = QueryState::Finalizing;
        match self.finalize_results(&outcome.chain)? {
            Some(paths) => {
                outcome.final_paths = Some(paths);
                outcome.state = QueryState::Done;
            }
            None => {
                error!(stages = query.stages.len(), "no final path reachable from the start set");
                outcome.state = QueryState::Failed(FailureReason::Unreachable);
            }
        }
        Ok(outcome)
    }

    /// Dry run of `query`: every stage yields one placeholder member whose
    /// level follows the requested depth. Nothing reaches a backend or the
    /// cache.
    fn simulate(&self, query: &CompiledQuery, keys: &[String], outcome: &mut QueryOutcome) {
        for (rank, descriptor) in query.stages.iter().enumerate() {
            let base = outcome.chain.last().map_or(0, |previous| previous.min_level);
            let result = match &descriptor.path_ref {
                Some(paths) => StageResult::from_paths(paths.iter().cloned()),
                None => {
                    let level = match descriptor.depth {
                        DepthRequest::None => base + 1,
                        DepthRequest::Exact(level) => level,
                        DepthRequest::Relative(depth) if depth > 0 => base.max(1) + depth.unsigned_abs(),
                        DepthRequest::Relative(depth) => base.saturating_sub(depth.unsigned_abs()).max(1),
                    };
                    StageResult {
                        node_ids: std::iter::once(format!("simulated-{}", rank)).collect(),
                        min_level: level,
                        max_level: level,
                        sub_node_count: 1,
                        ancestor_hop: matches!(descriptor.depth, DepthRequest::Relative(d) if d < 0),
                        ..Default::default()
                    }
                }
            };
            debug!(stage = rank, min_level = result.min_level, "stage simulated");
            outcome.chain.push(StageResult {
                loaded: true,
                ..result.with_key(keys[rank].clone())
            });
        }

        let last = outcome.chain.len() - 1;
        let mut paths = outcome.chain[last].node_ids.clone();
        for lower in outcome.chain[..last].iter().rev() {
            paths = lower
                .node_ids
                .iter()
                .flat_map(|prefix| paths.iter().map(move |p| path::join(prefix, p)))
                .collect();
            if lower.is_paths() || lower.max_level <= 1 {
                break;
            }
        }
        let mut final_paths = StageResult {
            key: outcome.chain[last].key.clone(),
            node_ids: paths,
            sub_node_count: 1,
            loaded: true,
            ..Default::default()
        };
        final_paths.update_min_max();
        outcome.final_paths = Some(final_paths);
        outcome.state = QueryState::Done;
    }

    /// Push every leading stage resolvable without execution onto the chain.
    ///
    /// Returns a terminal state when resolution alone ends the query.
    fn resolve_cache_prefix(
        &self,
        query: &CompiledQuery,
        keys: &[String],
        outcome: &mut QueryOutcome,
    ) -> Result<Option<QueryState>> {
        for (rank, descriptor) in query.stages.iter().enumerate() {
            let key = &keys[rank];

            if let Some(paths) = &descriptor.path_ref {
                let mut result = StageResult::from_paths(paths.iter().cloned()).with_key(key.clone());
                let reachable = outcome.chain[0].check_ancestor(&self.store, &mut result)?;
                // References may name bare ids as well as full paths
                result.update_load_min_max(&self.store)?;
                outcome.last_cache_rank = Some(rank);
                outcome.chain.push(result);
                if !reachable {
                    info!(stage = rank, "path reference not reachable from start set, empty result");
                    outcome.final_paths = Some(StageResult::default().with_key(key.clone()));
                    return Ok(Some(QueryState::Done));
                }
                continue;
            }

            if !query.use_cache {
                break;
            }
            let cached = self.cache.get(key)?;
            self.metrics.record_cache_lookup(cached.is_some());
            let Some(mut cached) = cached else {
                break;
            };
            self.cache.touch_ttl(key, self.config.cache_ttl_secs)?;

            let before = cached.len();
            let reachable = outcome.chain[0].check_ancestor(&self.store, &mut cached)?;
            if !reachable {
                error!(stage = rank, key = %key, "cached stage has no member reachable from start set");
                outcome.chain.push(cached);
                return Ok(Some(QueryState::Failed(FailureReason::EmptyCachedStage {
                    stage: rank,
                })));
            }
            if cached.len() < before {
                warn!(
                    stage = rank,
                    dropped = before - cached.len(),
                    "cached stage re-filtered against start set"
                );
            }
            debug!(stage = rank, key = %key, nodes = cached.len(), "stage served from cache");
            outcome.last_cache_rank = Some(rank);
            outcome.chain.push(cached);
        }
        Ok(None)
    }

    fn run_stage(
        &self,
        rank: usize,
        descriptor: &StageDescriptor,
        previous: &StageResult,
    ) -> Result<(StageResult, Strategy)> {
        if let Some(paths) = &descriptor.path_ref {
            return Ok((StageResult::from_paths(paths.iter().cloned()), Strategy::PathReference));
        }

        match descriptor.depth {
            DepthRequest::Relative(depth) if depth < 0 => {
                self.ancestor_stage(rank, descriptor, previous, depth.unsigned_abs())
            }
            DepthRequest::Relative(depth) => {
                self.depth_stage(rank, descriptor, previous, depth.unsigned_abs())
            }
            DepthRequest::Exact(level) => {
                // An unresolved start set stands for the roots (level 1)
                let base = previous.min_level.max(1);
                if level <= base {
                    return Err(QueryError::descriptor(
                        rank,
                        format!("exact depth {} is not below previous level {}", level, base),
                    ));
                }
                self.depth_stage(rank, descriptor, previous, level - base)
            }
            DepthRequest::None if previous.min_level < 1 => self.domain_stage(rank, descriptor),
            DepthRequest::None => self.child_stage(rank, descriptor, previous),
        }
    }

    fn search(
        &self,
        scope: &SearchScope,
        condition: &Condition,
        filter: Option<&Condition>,
    ) -> Result<SubtreeHits> {
        self.metrics.record_backend_call(SEARCH_INDEX);
        self.index.search_subtree(scope, condition, filter)
    }

    fn depth_stage(
        &self,
        rank: usize,
        descriptor: &StageDescriptor,
        previous: &StageResult,
        depth: u32,
    ) -> Result<(StageResult, Strategy)> {
        let condition = descriptor.search_condition.as_ref().ok_or_else(|| {
            QueryError::descriptor(rank, "depth request needs a search-index condition")
        })?;
        let scope = SearchScope::Subtree {
            roots: previous.last_segments(),
            max_relative_depth: depth,
        };
        let hits = self.search(&scope, condition, descriptor.search_filter.as_ref())?;
        Ok((StageResult::from_hits(hits.hits), Strategy::Depth))
    }

    fn domain_stage(&self, rank: usize, descriptor: &StageDescriptor) -> Result<(StageResult, Strategy)> {
        if descriptor.search_only {
            return Err(QueryError::descriptor(
                rank,
                "search-index-only stage cannot query domains",
            ));
        }
        let condition = descriptor.store_condition.as_ref().ok_or_else(|| {
            QueryError::descriptor(rank, "domain query needs a node-store condition")
        })?;
        let hits = self.store.find(&NodeFilter::domains(condition.clone()))?;
        Ok((StageResult::from_hits(hits), Strategy::Domain))
    }

    /// Link categories joining `previous` to its children
    fn child_links(previous: &StageResult) -> Vec<ParentLink> {
        if previous.max_level <= 1 {
            vec![ParentLink::Domain]
        } else if previous.min_level > 1 {
            vec![ParentLink::Structural]
        } else {
            ParentLink::ORDER.to_vec()
        }
    }

    fn child_stage(
        &self,
        rank: usize,
        descriptor: &StageDescriptor,
        previous: &StageResult,
    ) -> Result<(StageResult, Strategy)> {
        let large = previous.sub_node_count > self.config.search_index_threshold;
        let parents = previous.last_segments();

        let (mut result, strategy) = match &descriptor.search_condition {
            Some(condition)
                if descriptor.search_only || large || descriptor.store_condition.is_none() =>
            {
                let scope = SearchScope::Subtree {
                    roots: parents,
                    max_relative_depth: 1,
                };
                let hits = self.search(&scope, condition, descriptor.search_filter.as_ref())?;
                (StageResult::from_hits(hits.hits), Strategy::ChildFromIndex)
            }
            _ => {
                let condition = descriptor.store_condition.as_ref().ok_or_else(|| {
                    QueryError::descriptor(rank, "child query needs a node-store condition")
                })?;
                let filter = NodeFilter::children_of(
                    Self::child_links(previous),
                    parents,
                    condition.clone(),
                );
                let hits = self.store.find(&filter)?;
                (StageResult::from_hits(hits), Strategy::ChildFromStore)
            }
        };
        result.min_level = previous.min_level + 1;
        result.max_level = previous.max_level + 1;
        Ok((result, strategy))
    }

    /// Ancestors at exactly `distance` above the previous stage, filtered by
    /// the stage condition
    fn ancestor_stage(
        &self,
        rank: usize,
        descriptor: &StageDescriptor,
        previous: &StageResult,
        distance: u32,
    ) -> Result<(StageResult, Strategy)> {
        let mut ancestors = BTreeSet::new();
        for member in &previous.node_ids {
            let id = path::last_segment(member);
            match self.store.get(id)? {
                Some(node) => ancestors.extend(
                    node.ancestors
                        .iter()
                        .filter(|(_, d)| **d == distance)
                        .map(|(a, _)| a.clone()),
                ),
                None => warn!(node = %id, "node missing while resolving ancestors"),
            }
        }

        let hits = if ancestors.is_empty() {
            Vec::new()
        } else {
            match (&descriptor.store_condition, &descriptor.search_condition) {
                (Some(condition), _) if !descriptor.search_only => self
                    .store
                    .find(&NodeFilter::among(ancestors, condition.clone()))?,
                (_, Some(condition)) => {
                    let scope = SearchScope::Nodes(ancestors);
                    self.search(&scope, condition, descriptor.search_filter.as_ref())?
                        .hits
                }
                _ => {
                    return Err(QueryError::descriptor(
                        rank,
                        "ancestor query has no usable condition",
                    ))
                }
            }
        };

        let mut result = StageResult::from_hits(hits);
        result.ancestor_hop = true;
        Ok((result, Strategy::AncestorHop))
    }

    fn persist(&self, result: &StageResult) {
        match self.cache.put(&result.key, result, self.config.cache_ttl_secs) {
            Ok(()) => self.metrics.record_cache_write(true),
            Err(e) => {
                self.metrics.record_cache_write(false);
                warn!(key = %result.key, error = %e, "failed to persist stage result");
            }
        }
    }

    /// Rebuild full root-to-node paths from a stage chain.
    ///
    /// Walks the chain backwards, prefixing every partial path with each
    /// member of the stage below that is one of its ancestors (expanding the
    /// intermediate nodes when the link is not immediate). The walk stops at
    /// the start set, at a stage already made of paths, or at a root-level
    /// stage. Returns `None` when no path is reachable from the start set.
    /// The finalized result is never written to the cache.
    pub fn finalize_results(&self, chain: &[StageResult]) -> Result<Option<StageResult>> {
        let (start, last) = match (chain.first(), chain.last()) {
            (Some(start), Some(last)) => (start, last),
            _ => return Ok(None),
        };
        if last.is_empty() {
            return Ok(None);
        }

        let mut paths = last.node_ids.clone();
        if !last.is_paths() {
            let mut upper = chain.len() - 1;
            while upper > 0 {
                let lower_rank = if chain[upper].ancestor_hop { 0 } else { upper - 1 };
                let lower = &chain[lower_rank];
                if lower.is_empty() {
                    return Ok(None);
                }
                paths = self.prefix_paths(&paths, lower)?;
                if lower.is_paths() || lower.max_level == 1 {
                    break;
                }
                upper = lower_rank;
            }
        }

        let reachable = start.reachable_from(&self.store, &paths)?;
        if reachable.is_empty() {
            return Ok(None);
        }
        let mut result = StageResult {
            key: last.key.clone(),
            node_ids: reachable,
            sub_node_count: last.sub_node_count,
            loaded: true,
            ..Default::default()
        };
        result.update_min_max();
        Ok(Some(result))
    }

    fn prefix_paths(&self, paths: &BTreeSet<String>, lower: &StageResult) -> Result<BTreeSet<String>> {
        let enumerator = PathEnumerator::new(&self.store, self.config.max_depth);

        let mut by_last: BTreeMap<&str, Vec<&String>> = BTreeMap::new();
        for member in &lower.node_ids {
            by_last
                .entry(path::last_segment(member))
                .or_default()
                .push(member);
        }

        let mut extended = BTreeSet::new();
        for partial in paths {
            let first = path::first_segment(partial);

            // The stage below already ends at this node
            if let Some(members) = by_last.get(first) {
                for member in members {
                    extended.insert(path::join(path::parent_path(member), partial));
                }
                continue;
            }

            let node = match self.store.get(first)? {
                Some(node) => node,
                None => {
                    warn!(node = %first, "node missing during path reconstruction");
                    continue;
                }
            };
            for (anchor, members) in &by_last {
                if !node.has_ancestor(anchor) {
                    continue;
                }
                for chain in enumerator.paths_to_ancestor(&node, anchor)? {
                    for member in members {
                        let head = path::join(member, &chain);
                        extended.insert(path::join(&head, partial));
                    }
                }
            }
        }
        Ok(extended)
    }
}
