//! Executor Scenarios - End-to-End Query Runs
//!
//! Runs multi-stage queries against an in-memory archive and checks the
//! chain, the cache interaction and the rebuilt paths.

use lineage_core::metrics::{NODE_STORE_FIND, SEARCH_INDEX};
use lineage_core::*;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;

// rootA -> s1 (series) -> f1 (file) -> leaf1 (item, 1920)
//                      -> f2 (file) -> leaf2 (item, 1880)
// rootA -> s2 (series)
// rootB -> s3 (series) -> f3 (file) -> leaf3 (item, 1950)
fn archive() -> Arc<Graph> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let graph = Arc::new(Graph::new());
    graph.add_domain("rootA", properties([("name", "Fonds A")])).unwrap();
    graph.add_domain("rootB", properties([("name", "Fonds B")])).unwrap();

    let series = || properties([("kind", "series")]);
    graph.add_node("s1", series(), &[(ParentLink::Domain, "rootA")]).unwrap();
    graph.add_node("s2", series(), &[(ParentLink::Domain, "rootA")]).unwrap();
    graph.add_node("s3", series(), &[(ParentLink::Domain, "rootB")]).unwrap();

    let file = || properties([("kind", "file")]);
    graph.add_node("f1", file(), &[(ParentLink::Structural, "s1")]).unwrap();
    graph.add_node("f2", file(), &[(ParentLink::Structural, "s1")]).unwrap();
    graph.add_node("f3", file(), &[(ParentLink::Structural, "s3")]).unwrap();

    let item = |year: i64| {
        let mut props = properties([("kind", "item")]);
        props.insert("year".to_string(), PropertyValue::Int(year));
        props
    };
    graph.add_node("leaf1", item(1920), &[(ParentLink::Structural, "f1")]).unwrap();
    graph.add_node("leaf2", item(1880), &[(ParentLink::Structural, "f2")]).unwrap();
    graph.add_node("leaf3", item(1950), &[(ParentLink::Structural, "f3")]).unwrap();
    graph
}

fn executor_with(store: Arc<dyn NodeStore>, graph: &Graph, cache: Arc<dyn ResultCache>) -> QueryExecutor {
    let index = Arc::new(MemoryIndex::new(1000));
    index.index_graph(graph);
    QueryExecutor::new(
        store,
        index,
        cache,
        EngineConfig::default(),
        Arc::new(QueryMetrics::new().unwrap()),
    )
}

fn executor(graph: &Arc<Graph>, cache: Arc<dyn ResultCache>) -> QueryExecutor {
    executor_with(graph.clone(), graph, cache)
}

fn set(items: &[&str]) -> BTreeSet<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn series_stage() -> StageDescriptor {
    StageDescriptor::new("kind = series", Condition::eq("kind", "series"))
}

/// Node store recording every `find` filter it receives
struct RecordingStore {
    inner: Arc<Graph>,
    finds: Mutex<Vec<NodeFilter>>,
}

impl NodeStore for RecordingStore {
    fn get(&self, id: &str) -> Result<Option<GraphNode>> {
        self.inner.get(id)
    }

    fn find(&self, filter: &NodeFilter) -> Result<Vec<NodeHit>> {
        self.finds.lock().push(filter.clone());
        self.inner.find(filter)
    }

    fn exists(&self, id: &str) -> Result<bool> {
        self.inner.exists(id)
    }

    fn roots(&self) -> RootSet {
        self.inner.roots()
    }
}

/// Test: 1-level child query under a single domain
#[test]
fn test_children_of_single_domain() {
    let graph = archive();
    let executor = executor(&graph, Arc::new(NoCache));

    let query = CompiledQuery::new(vec![series_stage()]);
    let outcome = executor.execute(&query, StageResult::from_paths(["rootA"])).unwrap();

    assert!(outcome.is_done());
    let stage = &outcome.chain[1];
    assert_eq!((stage.min_level, stage.max_level), (2, 2));
    assert!(stage.node_ids.is_subset(&set(&["s1", "s2"])));
    assert_eq!(outcome.paths(), set(&["rootA#s1", "rootA#s2"]));

    let final_paths = outcome.final_paths.unwrap();
    assert_eq!((final_paths.min_level, final_paths.max_level), (2, 2));

    println!("✓ Child query under one domain");
}

/// Test: cached first stage followed by an exact-depth search stage
#[test]
fn test_cached_prefix_then_exact_depth() {
    let graph = archive();
    let executor = executor(&graph, Arc::new(LruResultCache::new(64)));
    let start = || StageResult::from_paths(["rootA"]);

    // Warm the cache with the first stage only
    let warm = CompiledQuery::new(vec![series_stage()]);
    assert!(executor.execute(&warm, start()).unwrap().is_done());

    let query = CompiledQuery::new(vec![
        series_stage(),
        StageDescriptor::search("year > 1900", Condition::gt("year", 1900i64)).exact_depth(4),
    ]);
    let searches_before = executor.metrics().backend_calls(SEARCH_INDEX);
    let outcome = executor.execute(&query, start()).unwrap();

    assert!(outcome.is_done());
    assert_eq!(outcome.last_cache_rank, Some(0));
    assert_eq!(executor.metrics().backend_calls(SEARCH_INDEX) - searches_before, 1);
    assert_eq!(outcome.chain[2].node_ids, set(&["leaf1"]));
    assert_eq!((outcome.chain[2].min_level, outcome.chain[2].max_level), (4, 4));

    let paths = outcome.paths();
    assert_eq!(paths, set(&["rootA#s1#f1#leaf1"]));
    assert!(paths.iter().all(|p| p.split('#').count() == 4));

    println!("✓ Cached prefix with exact-depth stage");
}

/// Test: a path reference outside the start set yields an empty result
#[test]
fn test_unreachable_path_reference() {
    let graph = archive();
    let executor = executor(&graph, Arc::new(LruResultCache::new(64)));

    let query = CompiledQuery::new(vec![
        StageDescriptor::path_reference("rootA#s1", ["rootA#s1"]),
        StageDescriptor::new("kind = file", Condition::eq("kind", "file")),
    ]);
    let outcome = executor.execute(&query, StageResult::from_paths(["rootB"])).unwrap();

    assert!(outcome.is_done());
    assert!(outcome.is_validly_empty());
    assert!(outcome.paths().is_empty());
    assert_eq!(outcome.last_cache_rank, Some(0));
    assert_eq!(executor.metrics().backend_calls(NODE_STORE_FIND), 0);

    println!("✓ Unreachable path reference");
}

/// Test: path reference reachable from the start set feeds the next stage
#[test]
fn test_path_reference_then_children() {
    let graph = archive();
    let executor = executor(&graph, Arc::new(NoCache));

    let query = CompiledQuery::new(vec![
        StageDescriptor::path_reference("rootA#s1", ["rootA#s1"]),
        StageDescriptor::new("kind = file", Condition::eq("kind", "file")),
    ]);
    let outcome = executor.execute(&query, StageResult::from_paths(["rootA"])).unwrap();

    assert!(outcome.is_done());
    assert_eq!(outcome.chain[2].node_ids, set(&["f1", "f2"]));
    assert_eq!(outcome.paths(), set(&["rootA#s1#f1", "rootA#s1#f2"]));

    println!("✓ Path reference followed by child stage");
}

/// Test: a path reference naming a bare id takes its level from the depth map
#[test]
fn test_bare_id_path_reference() {
    let graph = archive();
    let executor = executor(&graph, Arc::new(NoCache));

    let query = CompiledQuery::new(vec![
        StageDescriptor::path_reference("s1", ["s1"]),
        StageDescriptor::new("kind = file", Condition::eq("kind", "file")),
    ]);
    let outcome = executor.execute(&query, StageResult::from_paths(["rootA"])).unwrap();

    assert!(outcome.is_done(), "state = {:?}", outcome.state);
    assert_eq!((outcome.chain[1].min_level, outcome.chain[1].max_level), (2, 2));
    assert_eq!(outcome.chain[2].node_ids, set(&["f1", "f2"]));
    assert_eq!(outcome.paths(), set(&["rootA#s1#f1", "rootA#s1#f2"]));

    println!("✓ Bare-id path reference resolved at level 2");
}

/// Test: relinking a series under a second fonds exposes its whole subtree there
#[test]
fn test_relinked_subtree_reachable_from_new_root() {
    let graph = archive();
    graph.link_parent("s1", ParentLink::Domain, "rootB").unwrap();
    let leaf1 = graph.get("leaf1").unwrap().unwrap();
    assert_eq!(leaf1.ancestors.get("rootB"), Some(&3));

    let executor = executor(&graph, Arc::new(NoCache));
    let query = CompiledQuery::new(vec![
        StageDescriptor::search("kind = item", Condition::eq("kind", "item")).relative_depth(3),
    ]);
    let outcome = executor.execute(&query, StageResult::from_paths(["rootB"])).unwrap();

    assert!(outcome.is_done(), "state = {:?}", outcome.state);
    assert_eq!(outcome.chain[1].node_ids, set(&["leaf1", "leaf2", "leaf3"]));
    let paths = outcome.paths();
    assert!(paths.contains("rootB#s1#f1#leaf1"));
    assert!(paths.iter().all(|p| p.starts_with("rootB#")));

    println!("✓ Relinked subtree reachable from its new root");
}

/// Test: negative depth queries only the ancestors at the requested distance
#[test]
fn test_negative_depth_targets_ancestors() {
    let graph = archive();
    let store = Arc::new(RecordingStore {
        inner: graph.clone(),
        finds: Mutex::new(Vec::new()),
    });
    let executor = executor_with(store.clone(), &graph, Arc::new(NoCache));

    let query = CompiledQuery::new(vec![
        StageDescriptor::search("kind = item", Condition::eq("kind", "item")).exact_depth(4),
        StageDescriptor::store("kind = series", Condition::eq("kind", "series")).relative_depth(-2),
    ]);
    let outcome = executor.execute(&query, StageResult::from_paths(["rootA"])).unwrap();

    assert!(outcome.is_done());
    assert_eq!(outcome.chain[1].node_ids, set(&["leaf1", "leaf2"]));

    let finds = store.finds.lock();
    assert_eq!(finds.len(), 1);
    assert_eq!(finds[0].ids, Some(set(&["s1"])));

    assert!(outcome.chain[2].ancestor_hop);
    assert_eq!(outcome.paths(), set(&["rootA#s1"]));

    println!("✓ Negative depth");
}

/// Test: replaying a fully cached query touches neither backend's query path
#[test]
fn test_replay_is_deterministic() {
    let graph = archive();
    let executor = executor(&graph, Arc::new(LruResultCache::new(64)));
    let query = CompiledQuery::new(vec![
        series_stage(),
        StageDescriptor::new("kind = file", Condition::eq("kind", "file")),
        StageDescriptor::search("kind = item", Condition::eq("kind", "item")).relative_depth(1),
    ]);
    let start = || StageResult::from_paths(["rootA", "rootB"]);

    let first = executor.execute(&query, start()).unwrap();
    assert!(first.is_done());
    assert_eq!(first.last_cache_rank, None);

    let finds = executor.metrics().backend_calls(NODE_STORE_FIND);
    let searches = executor.metrics().backend_calls(SEARCH_INDEX);
    let second = executor.execute(&query, start()).unwrap();

    assert_eq!(second.last_cache_rank, Some(2));
    assert_eq!(executor.metrics().backend_calls(NODE_STORE_FIND), finds);
    assert_eq!(executor.metrics().backend_calls(SEARCH_INDEX), searches);
    assert_eq!(first.paths(), second.paths());
    assert_eq!(
        second.paths(),
        set(&["rootA#s1#f1#leaf1", "rootA#s1#f2#leaf2", "rootB#s3#f3#leaf3"])
    );
    assert_eq!(executor.metrics().cache_lookups("hit"), 3);

    println!("✓ Deterministic replay");
}

/// Test: every member lies within its stage's depth bounds
#[test]
fn test_depth_bounds_hold() {
    let graph = archive();
    let executor = executor(&graph, Arc::new(NoCache));
    let query = CompiledQuery::new(vec![
        series_stage(),
        StageDescriptor::search("kind = item", Condition::eq("kind", "item")).relative_depth(2),
    ]);
    let outcome = executor.execute(&query, StageResult::from_paths(["rootA", "rootB"])).unwrap();
    assert!(outcome.is_done());

    for stage in &outcome.chain[1..] {
        for id in &stage.node_ids {
            let level = graph.get(id).unwrap().unwrap().level();
            assert!(stage.min_level <= level && level <= stage.max_level, "{} at {}", id, level);
        }
    }

    let final_paths = outcome.final_paths.unwrap();
    for p in &final_paths.node_ids {
        let level = p.split('#').count() as u32;
        assert!(final_paths.min_level <= level && level <= final_paths.max_level);
    }

    println!("✓ Depth bounds");
}

/// Test: final paths start in the start set and end in the last stage
#[test]
fn test_final_paths_invert_the_chain() {
    let graph = archive();
    let executor = executor(&graph, Arc::new(NoCache));
    let query = CompiledQuery::new(vec![
        series_stage(),
        StageDescriptor::search("kind = item", Condition::eq("kind", "item")).relative_depth(2),
    ]);
    let start = StageResult::from_paths(["rootA", "rootB"]);
    let outcome = executor.execute(&query, start.clone()).unwrap();

    let last = outcome.chain.last().unwrap();
    let paths = outcome.paths();
    assert_eq!(paths.len(), 3);
    for p in &paths {
        let first = p.split('#').next().unwrap();
        let tail = p.rsplit('#').next().unwrap();
        assert!(start.node_ids.contains(first));
        assert!(last.node_ids.contains(tail));
    }

    // Checking the final paths against the start set keeps all of them
    let mut again = outcome.final_paths.clone().unwrap();
    assert!(start.check_ancestor(&*graph, &mut again).unwrap());
    assert_eq!(again.node_ids, paths);

    println!("✓ Final paths invert the chain");
}

/// Test: a chain already made of paths comes back as its reachable subset
#[test]
fn test_finalize_keeps_reachable_paths() {
    let graph = archive();
    let executor = executor(&graph, Arc::new(NoCache));
    let chain = vec![
        StageResult::from_paths(["rootA"]),
        StageResult::from_paths(["rootA#s1#f1", "rootA#s2", "rootB#s3"]),
    ];

    let result = executor.finalize_results(&chain).unwrap().unwrap();
    assert_eq!(result.node_ids, set(&["rootA#s1#f1", "rootA#s2"]));
    assert_eq!((result.min_level, result.max_level), (2, 3));

    let unreachable = vec![StageResult::from_paths(["rootA"]), StageResult::from_paths(["rootB#s3"])];
    assert!(executor.finalize_results(&unreachable).unwrap().is_none());
}

/// Test: plain child stages sit exactly one level below their predecessor
#[test]
fn test_child_stages_step_one_level() {
    let graph = archive();
    let executor = executor(&graph, Arc::new(NoCache));
    let query = CompiledQuery::new(vec![
        series_stage(),
        StageDescriptor::new("kind = file", Condition::eq("kind", "file")),
        StageDescriptor::new("kind = item", Condition::eq("kind", "item")),
    ]);
    let outcome = executor.execute(&query, StageResult::from_paths(["rootA", "rootB"])).unwrap();
    assert!(outcome.is_done());

    for pair in outcome.chain.windows(2) {
        assert_eq!(pair[1].min_level, pair[0].min_level + 1);
        assert_eq!(pair[1].max_level, pair[0].max_level + 1);
    }
    assert_eq!(outcome.paths().len(), 3);
}

/// Test: cached stages are re-filtered against a different start set
#[test]
fn test_cached_stage_refiltered() {
    let graph = archive();
    let executor = executor(&graph, Arc::new(LruResultCache::new(64)));
    let query = CompiledQuery::new(vec![series_stage()]);

    let wide = executor
        .execute(&query, StageResult::from_paths(["rootA", "rootB"]))
        .unwrap();
    assert_eq!(wide.chain[1].node_ids, set(&["s1", "s2", "s3"]));

    let narrow = executor.execute(&query, StageResult::from_paths(["rootB"])).unwrap();
    assert_eq!(narrow.last_cache_rank, Some(0));
    assert_eq!(narrow.paths(), set(&["rootB#s3"]));

    println!("✓ Cached stage re-filtered");
}

/// Test: a cached stage with nothing under the start set fails the query
#[test]
fn test_empty_cached_stage_fails() {
    let graph = archive();
    let executor = executor(&graph, Arc::new(LruResultCache::new(64)));
    let query = CompiledQuery::new(vec![series_stage()]);

    executor.execute(&query, StageResult::from_paths(["rootA"])).unwrap();
    graph.add_domain("rootC", properties([("name", "Fonds C")])).unwrap();

    let outcome = executor.execute(&query, StageResult::from_paths(["rootC"])).unwrap();
    assert_eq!(
        outcome.state,
        QueryState::Failed(FailureReason::EmptyCachedStage { stage: 0 })
    );
    assert!(outcome.is_failed());
    assert!(outcome.paths().is_empty());

    println!("✓ Empty cached stage");
}

/// Test: queries starting from every root go through the domain stage
#[test]
fn test_domain_stage_from_roots() {
    let graph = archive();
    let executor = executor(&graph, Arc::new(NoCache));
    let query = CompiledQuery::new(vec![
        StageDescriptor::store("name = Fonds B", Condition::eq("name", "Fonds B")),
        series_stage(),
        StageDescriptor::new("kind = file", Condition::eq("kind", "file")),
    ]);
    let outcome = executor
        .execute(&query, StageResult::from_roots(&executor.roots()))
        .unwrap();

    assert!(outcome.is_done());
    assert_eq!(outcome.chain[1].node_ids, set(&["rootB"]));
    assert_eq!(outcome.paths(), set(&["rootB#s3#f3"]));

    println!("✓ Domain stage from roots");
}

/// Test: the search post-filter narrows a depth stage
#[test]
fn test_search_filter_applies() {
    let graph = archive();
    let executor = executor(&graph, Arc::new(NoCache));
    let query = CompiledQuery::new(vec![
        StageDescriptor::search("kind = item", Condition::eq("kind", "item"))
            .exact_depth(4)
            .with_search_filter(Condition::lt("year", 1900i64)),
    ]);
    let outcome = executor.execute(&query, StageResult::from_paths(["rootA", "rootB"])).unwrap();

    assert!(outcome.is_done());
    assert_eq!(outcome.paths(), set(&["rootA#s1#f2#leaf2"]));
}

/// Test: queries with caching disabled never write
#[test]
fn test_without_cache_skips_writes() {
    let graph = archive();
    let cache = Arc::new(LruResultCache::new(64));
    let executor = executor(&graph, cache.clone());

    let query = CompiledQuery::new(vec![series_stage()]).without_cache();
    let outcome = executor.execute(&query, StageResult::from_paths(["rootA"])).unwrap();

    assert!(outcome.is_done());
    assert_eq!(cache.approximate_count().unwrap(), 0);
    assert_eq!(executor.metrics().cache_lookups("miss"), 0);

    println!("✓ Cache disabled");
}

/// Test: a simulated query touches no backend and writes nothing to the cache
#[test]
fn test_simulated_query_is_a_dry_run() {
    let graph = archive();
    let cache = Arc::new(LruResultCache::new(64));
    let executor = executor(&graph, cache.clone());

    let query = CompiledQuery::new(vec![
        series_stage(),
        StageDescriptor::new("kind = file", Condition::eq("kind", "file")),
        StageDescriptor::search("kind = item", Condition::eq("kind", "item")).exact_depth(5),
    ])
    .simulated();
    let outcome = executor.execute(&query, StageResult::from_paths(["rootA"])).unwrap();

    assert!(outcome.is_done());
    let levels: Vec<(u32, u32)> = outcome.chain.iter().map(|s| (s.min_level, s.max_level)).collect();
    assert_eq!(levels, vec![(1, 1), (2, 2), (3, 3), (5, 5)]);
    assert_eq!(outcome.chain[1].key, "{kind = series}");
    assert_eq!(
        outcome.paths(),
        set(&["rootA#simulated-0#simulated-1#simulated-2"])
    );

    let metrics = executor.metrics();
    assert_eq!(metrics.backend_calls(NODE_STORE_FIND), 0);
    assert_eq!(metrics.backend_calls(SEARCH_INDEX), 0);
    assert_eq!(metrics.cache_lookups("miss"), 0);
    assert_eq!(cache.approximate_count().unwrap(), 0);

    println!("✓ Simulated query");
}
