//! Lineage - multi-stage query engine for archival record graphs
//!
//! Executes chains of sub-queries over a hierarchy of domains, intermediate
//! nodes and leaves, split across a document store and a search index.
//! Per-stage results are cached and replayed, and every stage is checked
//! against its predecessor before full root-to-node paths are rebuilt.
//!
//! # Architecture
//!
//! - Graph Layer: nodes with parent links and ancestor-depth maps
//! - Storage Layer: RocksDB-based node store with parent indexes
//! - Search Layer: denormalized documents for filtered subtree queries
//! - Cache Layer: pluggable stage-result caches (LRU, blob, store, none)
//! - Execution Layer: cache prefix resolution, strategy selection, path reconstruction
//! - Service Layer: bounded concurrent execution with Tokio

pub mod types;
pub mod path;
pub mod condition;
pub mod error;
pub mod config;

// Node store modules
pub mod graph;
pub mod storage;

// Search index module
pub mod search_index;

// Stage results and caching
pub mod result;
pub mod cache;

// Query execution modules
pub mod plan;
pub mod paths;
pub mod executor;

// Observability
pub mod metrics;

// Async service
pub mod service;

pub use types::{AncestorDepths, NodeId, ParentLink, Properties, PropertyValue, properties};
pub use condition::Condition;
pub use error::{QueryError, Result};
pub use config::{init_logging, CacheBackend, EngineConfig};

// Node store exports
pub use graph::{derive_depths, merge_depths, Graph, GraphNode, GraphStats, NodeFilter, NodeHit, NodeStore, RootSet};
pub use storage::{StorageEngine, StoreResultCache};

// Search index exports
pub use search_index::{IndexedDocument, MemoryIndex, SearchIndex, SearchScope, SubtreeHits};

// Result and cache exports
pub use result::StageResult;
pub use cache::{build_cache, BlobResultCache, LruResultCache, NoCache, ResultCache};

// Execution exports
pub use plan::{CompiledQuery, DepthRequest, StageDescriptor};
pub use paths::PathEnumerator;
pub use executor::{FailureReason, QueryExecutor, QueryOutcome, QueryState, Strategy};
pub use metrics::QueryMetrics;
pub use service::QueryService;
