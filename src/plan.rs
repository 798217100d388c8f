//! Compiled query plans
//!
//! A [`CompiledQuery`] is what the query compiler hands to the executor: one
//! [`StageDescriptor`] per stage, each carrying a condition per backend it
//! supports and the source fragment its cache key is built from.

use crate::condition::Condition;
use crate::error::{QueryError, Result};
use crate::types::NodeId;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DepthRequest {
    /// Plain 1-level child query
    #[default]
    None,
    /// Absolute level counted from the roots (roots are level 1)
    Exact(u32),
    /// Positive: descendants up to k levels below; negative: ancestors at exactly |k|
    Relative(i32),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageDescriptor {
    /// Cache-key fragment
    pub source: String,
    /// Literal path list of a direct path reference
    pub path_ref: Option<Vec<NodeId>>,
    pub depth: DepthRequest,
    /// The node store cannot answer this stage
    pub search_only: bool,
    pub store_condition: Option<Condition>,
    pub search_condition: Option<Condition>,
    /// Optional post-filter applied by the search index
    pub search_filter: Option<Condition>,
}

impl StageDescriptor {
    /// Stage answerable by both backends with the same condition
    pub fn new(source: impl Into<String>, condition: Condition) -> Self {
        StageDescriptor {
            source: source.into(),
            store_condition: Some(condition.clone()),
            search_condition: Some(condition),
            ..Default::default()
        }
    }

    pub fn path_reference<I, S>(source: impl Into<String>, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<NodeId>,
    {
        StageDescriptor {
            source: source.into(),
            path_ref: Some(paths.into_iter().map(Into::into).collect()),
            ..Default::default()
        }
    }

    /// Stage only the search index can answer
    pub fn search(source: impl Into<String>, condition: Condition) -> Self {
        StageDescriptor {
            source: source.into(),
            search_only: true,
            search_condition: Some(condition),
            ..Default::default()
        }
    }

    /// Stage only the node store can answer
    pub fn store(source: impl Into<String>, condition: Condition) -> Self {
        StageDescriptor {
            source: source.into(),
            store_condition: Some(condition),
            ..Default::default()
        }
    }

    pub fn exact_depth(mut self, level: u32) -> Self {
        self.depth = DepthRequest::Exact(level);
        self
    }

    pub fn relative_depth(mut self, depth: i32) -> Self {
        self.depth = DepthRequest::Relative(depth);
        self
    }

    pub fn with_search_filter(mut self, filter: Condition) -> Self {
        self.search_filter = Some(filter);
        self
    }

    pub fn is_path_reference(&self) -> bool {
        self.path_ref.is_some()
    }

    fn validate(&self, stage: usize) -> Result<()> {
        if let Some(paths) = &self.path_ref {
            if paths.is_empty() {
                return Err(QueryError::descriptor(stage, "empty path reference"));
            }
            return Ok(());
        }
        match self.depth {
            DepthRequest::Exact(0) => {
                return Err(QueryError::descriptor(stage, "exact depth must be at least 1"))
            }
            DepthRequest::Relative(0) => {
                return Err(QueryError::descriptor(stage, "relative depth must not be 0"))
            }
            _ => {}
        }
        if self.store_condition.is_none() && self.search_condition.is_none() {
            return Err(QueryError::descriptor(stage, "no condition for any backend"));
        }
        if self.search_only && self.search_condition.is_none() {
            return Err(QueryError::descriptor(
                stage,
                "search-index-only stage without a search condition",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompiledQuery {
    pub stages: Vec<StageDescriptor>,
    pub order_by: Option<String>,
    pub use_cache: bool,
    /// Dry run: stages are not sent to any backend or cache
    #[serde(default)]
    pub simulate: bool,
}

impl CompiledQuery {
    pub fn new(stages: Vec<StageDescriptor>) -> Self {
        CompiledQuery {
            stages,
            order_by: None,
            use_cache: true,
            simulate: false,
        }
    }

    pub fn with_order_by(mut self, order_by: impl Into<String>) -> Self {
        self.order_by = Some(order_by.into());
        self
    }

    pub fn without_cache(mut self) -> Self {
        self.use_cache = false;
        self
    }

    pub fn simulated(mut self) -> Self {
        self.simulate = true;
        self
    }

    pub fn validate(&self) -> Result<()> {
        for (rank, stage) in self.stages.iter().enumerate() {
            stage.validate(rank)?;
        }
        Ok(())
    }

    fn order_by_fragment(&self) -> String {
        match &self.order_by {
            Some(order) => format!("orderby: {{{}}}", order),
            None => String::new(),
        }
    }

    /// Cache key of every stage.
    ///
    /// Each key concatenates the `{source}` fragments of the stages up to and
    /// including it, restarting at the latest path reference, followed by the
    /// order-by fragment. Limit, offset and projection never take part.
    pub fn stage_keys(&self) -> Vec<String> {
        let order_by = self.order_by_fragment();
        let mut prefix = String::new();
        self.stages
            .iter()
            .map(|stage| {
                if stage.is_path_reference() {
                    prefix.clear();
                }
                prefix.push('{');
                prefix.push_str(&stage.source);
                prefix.push('}');
                format!("{}{}", prefix, order_by)
            })
            .collect()
    }
}
