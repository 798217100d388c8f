//! Persistent node store using RocksDB
//!
//! Holds the authoritative graph (one bincode record per node), optional
//! secondary indexes over the parent-link fields and ancestor-map keys, the
//! root registry, and the `requests` collection used as a result cache.

use crate::cache::ResultCache;
use crate::config::MAX_CACHE_TTL_SECS;
use crate::error::{QueryError, Result};
use crate::graph::{merge_depths, Graph, GraphNode, NodeFilter, NodeHit, NodeStore, RootSet};
use crate::path::SEPARATOR;
use crate::result::StageResult;
use crate::types::*;
use parking_lot::{Mutex, RwLock};
use rocksdb::{ColumnFamily, Direction, IteratorMode, Options, WriteBatch, DB};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

/// Column families for different data types
const CF_NODES: &str = "nodes";
const CF_INDEXES: &str = "indexes";
const CF_REQUESTS: &str = "requests";
const CF_METADATA: &str = "metadata";

const META_ROOTS: &[u8] = b"roots";
const META_PARENT_INDEXES: &[u8] = b"parent_indexes";

/// Storage engine backed by RocksDB
///
/// The root registry is loaded once at open time and kept in memory.
pub struct StorageEngine {
    db: Arc<DB>,
    roots: RwLock<RootSet>,
    parent_indexes: RwLock<bool>,
    // Serializes the read-merge-write of node records
    write_lock: Mutex<()>,
}

impl StorageEngine {
    /// Open or create a database at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        // Performance tuning
        opts.set_max_background_jobs(4);
        opts.set_bytes_per_sync(1024 * 1024); // 1MB
        opts.increase_parallelism(num_cpus::get() as i32);
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);

        let cfs = vec![CF_NODES, CF_INDEXES, CF_REQUESTS, CF_METADATA];
        let db = DB::open_cf(&opts, path, cfs)?;

        let engine = StorageEngine {
            db: Arc::new(db),
            roots: RwLock::new(RootSet::new()),
            parent_indexes: RwLock::new(false),
            write_lock: Mutex::new(()),
        };

        let meta = engine.cf(CF_METADATA)?;
        if let Some(bytes) = engine.db.get_cf(meta, META_ROOTS)? {
            *engine.roots.write() = bincode::deserialize(&bytes)?;
        }
        *engine.parent_indexes.write() = engine.db.get_cf(meta, META_PARENT_INDEXES)?.is_some();

        info!(roots = engine.roots.read().len(), "node store opened");
        Ok(engine)
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| QueryError::Backend(format!("column family {} not found", name)))
    }

    /// Store a node, min-merging with any previous version of it.
    ///
    /// Every parent link the node gains bumps that parent's child counter in
    /// the same write batch.
    pub fn put_node(&self, node: &GraphNode) -> Result<()> {
        self.write_node(node, true)
    }

    /// Persist every node of an in-memory graph.
    ///
    /// Child counters are copied from the graph as they are.
    pub fn import_graph(&self, graph: &Graph) -> Result<usize> {
        let nodes = graph.nodes();
        for node in &nodes {
            self.write_node(node, false)?;
        }
        debug!(nodes = nodes.len(), "imported graph");
        Ok(nodes.len())
    }

    fn write_node(&self, node: &GraphNode, count_links: bool) -> Result<()> {
        let _guard = self.write_lock.lock();

        let mut new_links: Vec<(ParentLink, NodeId)> = Vec::new();
        let merged = match self.get(&node.id)? {
            Some(mut existing) => {
                for link in ParentLink::ORDER {
                    for parent in node.parents(link) {
                        if !existing.parents(link).contains(parent) {
                            new_links.push((link, parent.clone()));
                        }
                    }
                }
                existing.ancestors = merge_depths(&existing.ancestors, &node.ancestors);
                existing.domain_parents.extend(node.domain_parents.iter().cloned());
                existing.structural_parents.extend(node.structural_parents.iter().cloned());
                existing.properties.extend(node.properties.clone());
                existing.child_count = existing.child_count.max(node.child_count);
                existing.is_domain |= node.is_domain;
                existing
            }
            None => {
                for link in ParentLink::ORDER {
                    new_links.extend(node.parents(link).iter().map(|p| (link, p.clone())));
                }
                node.clone()
            }
        };

        let mut batch = WriteBatch::default();
        let nodes = self.cf(CF_NODES)?;
        batch.put_cf(nodes, node_key(&merged.id), bincode::serialize(&merged)?);
        if *self.parent_indexes.read() {
            self.index_entries(&merged, &mut batch)?;
        }
        if count_links {
            let mut added: BTreeMap<NodeId, u64> = BTreeMap::new();
            for (_, parent) in new_links.into_iter().filter(|(_, p)| *p != merged.id) {
                *added.entry(parent).or_default() += 1;
            }
            self.adjust_child_counts(&added, true, &mut batch)?;
        }
        if merged.is_domain && !self.roots.read().contains(&merged.id) {
            let mut roots = self.roots.write();
            roots.insert(merged.id.clone());
            batch.put_cf(self.cf(CF_METADATA)?, META_ROOTS, bincode::serialize(&*roots)?);
        }
        self.db.write(batch)?;
        Ok(())
    }

    /// Stage updated child counters for `parents` into `batch`
    fn adjust_child_counts(
        &self,
        parents: &BTreeMap<NodeId, u64>,
        increment: bool,
        batch: &mut WriteBatch,
    ) -> Result<()> {
        let nodes = self.cf(CF_NODES)?;
        for (parent_id, count) in parents {
            let Some(mut parent) = self.get(parent_id)? else {
                continue;
            };
            parent.child_count = if increment {
                parent.child_count.saturating_add(*count)
            } else {
                parent.child_count.saturating_sub(*count)
            };
            batch.put_cf(nodes, node_key(parent_id), bincode::serialize(&parent)?);
        }
        Ok(())
    }

    /// Remove a whole node with its index entries; its parents' child
    /// counters are decremented
    pub fn delete_node(&self, id: &str) -> Result<bool> {
        let _guard = self.write_lock.lock();
        let node = match self.get(id)? {
            Some(node) => node,
            None => return Ok(false),
        };

        let mut batch = WriteBatch::default();
        batch.delete_cf(self.cf(CF_NODES)?, node_key(id));
        let indexes = self.cf(CF_INDEXES)?;
        for key in index_keys(&node) {
            batch.delete_cf(indexes, key);
        }

        let mut removed: BTreeMap<NodeId, u64> = BTreeMap::new();
        for link in ParentLink::ORDER {
            for parent in node.parents(link).iter().filter(|p| p.as_str() != id) {
                *removed.entry(parent.clone()).or_default() += 1;
            }
        }
        self.adjust_child_counts(&removed, false, &mut batch)?;

        if node.is_domain {
            let mut roots = self.roots.write();
            roots.remove(id);
            batch.put_cf(self.cf(CF_METADATA)?, META_ROOTS, bincode::serialize(&*roots)?);
        }
        self.db.write(batch)?;
        Ok(true)
    }

    fn index_entries(&self, node: &GraphNode, batch: &mut WriteBatch) -> Result<()> {
        let indexes = self.cf(CF_INDEXES)?;
        for key in index_keys(node) {
            batch.put_cf(indexes, key, b"");
        }
        Ok(())
    }

    /// Build secondary indexes over both parent-link fields and the
    /// ancestor-map keys; returns the number of indexed nodes
    pub fn create_parent_indexes(&self) -> Result<usize> {
        let mut batch = WriteBatch::default();
        let nodes = self.scan_nodes()?;
        for node in &nodes {
            self.index_entries(node, &mut batch)?;
        }
        batch.put_cf(self.cf(CF_METADATA)?, META_PARENT_INDEXES, [1u8]);
        self.db.write(batch)?;
        *self.parent_indexes.write() = true;
        info!(nodes = nodes.len(), "parent indexes created");
        Ok(nodes.len())
    }

    pub fn drop_parent_indexes(&self) -> Result<()> {
        let indexes = self.cf(CF_INDEXES)?;
        let mut batch = WriteBatch::default();
        for item in self.db.iterator_cf(indexes, IteratorMode::Start) {
            let (key, _) = item?;
            batch.delete_cf(indexes, key);
        }
        batch.delete_cf(self.cf(CF_METADATA)?, META_PARENT_INDEXES);
        self.db.write(batch)?;
        *self.parent_indexes.write() = false;
        info!("parent indexes dropped");
        Ok(())
    }

    pub fn has_parent_indexes(&self) -> bool {
        *self.parent_indexes.read()
    }

    /// Children of `parent` via `link` according to the parent index
    pub fn indexed_children(&self, link: ParentLink, parent: &str) -> Result<BTreeSet<NodeId>> {
        self.prefix_ids(&parent_prefix(link, parent))
    }

    /// Descendants of `ancestor` according to the ancestor index
    pub fn indexed_descendants(&self, ancestor: &str) -> Result<BTreeSet<NodeId>> {
        self.prefix_ids(&ancestor_prefix(ancestor))
    }

    fn prefix_ids(&self, prefix: &[u8]) -> Result<BTreeSet<NodeId>> {
        let indexes = self.cf(CF_INDEXES)?;
        let mut ids = BTreeSet::new();
        for item in self
            .db
            .iterator_cf(indexes, IteratorMode::From(prefix, Direction::Forward))
        {
            let (key, _) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            ids.insert(String::from_utf8_lossy(&key[prefix.len()..]).into_owned());
        }
        Ok(ids)
    }

    /// Scan all nodes (range scan)
    pub fn scan_nodes(&self) -> Result<Vec<GraphNode>> {
        let cf = self.cf(CF_NODES)?;
        let mut nodes = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_key, value) = item?;
            nodes.push(bincode::deserialize(&value)?);
        }
        Ok(nodes)
    }

    fn load_many<'a, I>(&self, ids: I, filter: &NodeFilter) -> Result<Vec<NodeHit>>
    where
        I: IntoIterator<Item = &'a NodeId>,
    {
        let mut hits = Vec::new();
        for id in ids {
            if let Some(node) = self.get(id)? {
                if filter.matches(&node) {
                    hits.push(NodeHit::from(&node));
                }
            }
        }
        Ok(hits)
    }

    /// Flush all writes to disk
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

impl NodeStore for StorageEngine {
    fn get(&self, id: &str) -> Result<Option<GraphNode>> {
        match self.db.get_cf(self.cf(CF_NODES)?, node_key(id))? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    fn find(&self, filter: &NodeFilter) -> Result<Vec<NodeHit>> {
        let mut hits = if let Some(ids) = &filter.ids {
            self.load_many(ids, filter)?
        } else if let (Some((links, parents)), true) = (&filter.parents, self.has_parent_indexes()) {
            let mut candidates = BTreeSet::new();
            for link in links {
                for parent in parents {
                    candidates.extend(self.indexed_children(*link, parent)?);
                }
            }
            self.load_many(&candidates, filter)?
        } else if filter.domains_only {
            let roots = self.roots.read().clone();
            self.load_many(roots.iter(), filter)?
        } else {
            self.scan_nodes()?
                .iter()
                .filter(|node| filter.matches(node))
                .map(NodeHit::from)
                .collect()
        };
        hits.sort_by(|a, b| a.id.cmp(&b.id));
        hits.dedup_by(|a, b| a.id == b.id);
        Ok(hits)
    }

    fn exists(&self, id: &str) -> Result<bool> {
        Ok(self.db.get_pinned_cf(self.cf(CF_NODES)?, node_key(id))?.is_some())
    }

    fn roots(&self) -> RootSet {
        self.roots.read().clone()
    }
}

#[derive(Serialize, Deserialize)]
struct StoredResult {
    result: StageResult,
    expires_at: u64,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Result cache kept in the node store's `requests` collection
pub struct StoreResultCache {
    storage: Arc<StorageEngine>,
}

impl StoreResultCache {
    pub fn new(storage: Arc<StorageEngine>) -> Self {
        StoreResultCache { storage }
    }

    fn load(&self, key: &str) -> Result<Option<StoredResult>> {
        let cf = self.storage.cf(CF_REQUESTS)?;
        let stored: StoredResult = match self.storage.db.get_cf(cf, key.as_bytes())? {
            Some(bytes) => bincode::deserialize(&bytes)?,
            None => return Ok(None),
        };
        if stored.expires_at <= unix_now() {
            self.storage.db.delete_cf(cf, key.as_bytes())?;
            return Ok(None);
        }
        Ok(Some(stored))
    }

    fn store(&self, key: &str, stored: &StoredResult) -> Result<()> {
        let cf = self.storage.cf(CF_REQUESTS)?;
        self.storage
            .db
            .put_cf(cf, key.as_bytes(), bincode::serialize(stored)?)?;
        Ok(())
    }
}

impl ResultCache for StoreResultCache {
    fn get(&self, key: &str) -> Result<Option<StageResult>> {
        Ok(self.load(key)?.map(|stored| {
            let mut result = stored.result;
            result.loaded = true;
            result
        }))
    }

    fn put(&self, key: &str, result: &StageResult, ttl_secs: u64) -> Result<()> {
        self.store(
            key,
            &StoredResult {
                result: result.clone(),
                expires_at: unix_now().saturating_add(ttl_secs.min(MAX_CACHE_TTL_SECS)),
            },
        )
    }

    fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.load(key)?.is_some())
    }

    fn touch_ttl(&self, key: &str, ttl_secs: u64) -> Result<bool> {
        match self.load(key)? {
            Some(mut stored) => {
                stored.expires_at = unix_now().saturating_add(ttl_secs.min(MAX_CACHE_TTL_SECS));
                self.store(key, &stored)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// RocksDB key estimate; may include expired entries
    fn approximate_count(&self) -> Result<u64> {
        let cf = self.storage.cf(CF_REQUESTS)?;
        Ok(self
            .storage
            .db
            .property_int_value_cf(cf, "rocksdb.estimate-num-keys")?
            .unwrap_or(0))
    }

    fn name(&self) -> &'static str {
        "store"
    }
}

// Key encoding functions

fn node_key(id: &str) -> Vec<u8> {
    format!("n:{}", id).into_bytes()
}

// Ids never contain the separator, so it terminates the parent part
fn parent_prefix(link: ParentLink, parent: &str) -> Vec<u8> {
    format!("p:{}:{}{}", link.field_name(), parent, SEPARATOR).into_bytes()
}

fn ancestor_prefix(ancestor: &str) -> Vec<u8> {
    format!("a:{}{}", ancestor, SEPARATOR).into_bytes()
}

fn index_keys(node: &GraphNode) -> Vec<Vec<u8>> {
    let mut keys = Vec::new();
    for link in ParentLink::ORDER {
        for parent in node.parents(link) {
            let mut key = parent_prefix(link, parent);
            key.extend_from_slice(node.id.as_bytes());
            keys.push(key);
        }
    }
    for ancestor in node.ancestors.keys() {
        let mut key = ancestor_prefix(ancestor);
        key.extend_from_slice(node.id.as_bytes());
        keys.push(key);
    }
    keys
}
