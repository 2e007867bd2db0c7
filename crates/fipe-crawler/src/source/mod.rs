//! Automation source abstraction.
//!
//! Defines the `AutomationSource` and `SourceFactory` traits that abstract
//! over the interactive surface the crawl drives (a headless browser in
//! production, a scripted catalog in tests). Absence is a success variant;
//! only faults travel in the error channel.

pub mod chromium;
pub mod scripted;

use crate::hierarchy::Level;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Ancestor labels, root first: at most period, brand, model, model-year.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodePath {
    segments: Vec<String>,
}

impl NodePath {
    /// The empty path above the period level.
    pub fn root() -> Self {
        Self::default()
    }

    /// This path extended by one label.
    pub fn child(&self, label: &str) -> Self {
        let mut segments = self.segments.clone();
        segments.push(label.to_string());
        Self { segments }
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn depth(&self) -> usize {
        self.segments.len()
    }

    /// Level of the deepest label, `None` for the root.
    pub fn level(&self) -> Option<Level> {
        self.depth().checked_sub(1).and_then(|i| Level::ALL.get(i).copied())
    }

    /// Level whose labels are listed under this path.
    pub fn child_level(&self) -> Option<Level> {
        Level::ALL.get(self.depth()).copied()
    }

    pub fn is_leaf(&self) -> bool {
        self.level() == Some(Level::ModelYear)
    }

    pub fn period(&self) -> Option<&str> {
        self.segment(0)
    }

    pub fn brand(&self) -> Option<&str> {
        self.segment(1)
    }

    pub fn model(&self) -> Option<&str> {
        self.segment(2)
    }

    pub fn model_year(&self) -> Option<&str> {
        self.segment(3)
    }

    fn segment(&self, index: usize) -> Option<&str> {
        self.segments.get(index).map(String::as_str)
    }
}

impl std::fmt::Display for NodePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.segments.is_empty() {
            return write!(f, "<root>");
        }
        write!(f, "{}", self.segments.join(" > "))
    }
}

/// Result of [`AutomationSource::select_path`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection {
    Selected,
    /// The surface has no entry for the deepest label of the path.
    Absent,
}

/// The data shown for a fully selected leaf.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeafReport {
    pub value: f64,
    /// Source-side model code, when the surface shows one.
    pub model_code: Option<String>,
}

/// Result of [`AutomationSource::extract_leaf`].
#[derive(Debug, Clone, PartialEq)]
pub enum Extraction {
    Observation(LeafReport),
    /// The surface answered with an explicit "not found".
    Absent,
}

/// A failed interaction. The session may be left corrupted.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceFault {
    /// An expected affordance could not be interacted with.
    #[error("interaction failed: {0}")]
    Interaction(String),

    /// An expected element or value could not be found.
    #[error("lookup failed: {0}")]
    Lookup(String),

    /// The surface did not answer within the interaction budget.
    #[error("timed out: {0}")]
    Timeout(String),

    #[error("unclassified failure: {0}")]
    Unclassified(String),
}

pub type SourceResult<T> = std::result::Result<T, SourceFault>;

/// One live session on the interactive surface.
///
/// The surface keeps no selection state between leaves: every leaf attempt
/// restates its full path before extracting.
#[async_trait]
pub trait AutomationSource: Send {
    /// Ordered labels of the children of `path`. May legitimately be empty.
    async fn list_children(&mut self, path: &NodePath) -> SourceResult<Vec<String>>;

    /// Select every label of `path` in order, root first.
    async fn select_path(&mut self, path: &NodePath) -> SourceResult<Selection>;

    /// Extract the result for the leaf selected last.
    async fn extract_leaf(&mut self) -> SourceResult<Extraction>;

    /// Tear the session down.
    async fn close(self: Box<Self>) -> SourceResult<()>;
}

/// Opens fresh sessions; resetting a source means closing it and opening anew.
#[async_trait]
pub trait SourceFactory: Send + Sync {
    async fn open(&self) -> SourceResult<Box<dyn AutomationSource>>;
}
