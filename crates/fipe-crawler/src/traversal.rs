// Copyright 2026 FIPE Crawler Contributors
// SPDX-License-Identifier: Apache-2.0

//! Traversal engine driving the nested Period → Brand → Model → ModelYear
//! expansion.
//!
//! Each level runs the same loop: populate the children of the current
//! parent from the source (once per pass), then visit unvisited children in
//! frontier order until none is left, and mark the parent visited. Every
//! interaction restates its full path, since the source forgets its
//! selection after each leaf.
//!
//! Only the leaf step claims its node: a claimed model-year turns `Visited`
//! once its observation is recorded, or is deleted when the source reports
//! it absent.

use crate::config::CrawlConfig;
use crate::error::{CrawlError, Result};
use crate::frontier::{Deletion, Frontier, Node, Population};
use crate::hierarchy::{Level, Parent};
use crate::progress::{CrawlEventKind, CrawlEventSender, Emitter};
use crate::recorder::{ObservationRecorder, Recorded};
use crate::recovery::{Decision, RecoveryController};
use crate::source::{
    AutomationSource, Extraction, LeafReport, NodePath, Selection, SourceFactory, SourceResult,
};
use async_trait::async_trait;
use crate::store::Database;
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Counters for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub observations_written: u64,
    /// Leaves whose observation was already stored by an earlier run.
    pub observations_present: u64,
    pub leaves_absent: u64,
    pub nodes_deleted: u64,
    pub faults: u64,
    pub resets: u32,
    pub reclaimed: usize,
    pub elapsed_ms: u64,
}

/// Result of one source step that did not fault.
#[derive(Debug)]
enum Found<T> {
    Present(T),
    Absent,
}

/// One interaction with the source, replayed from a full selection on retry.
#[async_trait]
trait Step: Send + Sync {
    type Output: Send;

    async fn run(
        &self,
        source: &mut dyn AutomationSource,
        path: &NodePath,
    ) -> SourceResult<Found<Self::Output>>;
}

/// Select the path (the root needs none), then list its children.
struct ListChildren;

#[async_trait]
impl Step for ListChildren {
    type Output = Vec<String>;

    async fn run(
        &self,
        source: &mut dyn AutomationSource,
        path: &NodePath,
    ) -> SourceResult<Found<Vec<String>>> {
        if path.depth() > 0 && source.select_path(path).await? == Selection::Absent {
            return Ok(Found::Absent);
        }
        Ok(Found::Present(source.list_children(path).await?))
    }
}

/// Select the full leaf path, then extract its observation.
struct ExtractLeaf;

#[async_trait]
impl Step for ExtractLeaf {
    type Output = LeafReport;

    async fn run(
        &self,
        source: &mut dyn AutomationSource,
        path: &NodePath,
    ) -> SourceResult<Found<LeafReport>> {
        if source.select_path(path).await? == Selection::Absent {
            return Ok(Found::Absent);
        }
        Ok(match source.extract_leaf().await? {
            Extraction::Observation(report) => Found::Present(report),
            Extraction::Absent => Found::Absent,
        })
    }
}

/// How a subtree ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Subtree {
    Done,
    Absent,
}

pub struct TraversalEngine {
    db: Database,
    recovery: RecoveryController,
    emitter: Emitter,
    run_id: String,
    lease: Duration,
    summary: RunSummary,
}

impl TraversalEngine {
    pub fn new(db: Database, factory: Box<dyn SourceFactory>, config: &CrawlConfig) -> Self {
        let run_id = uuid::Uuid::new_v4().to_string();
        Self {
            db,
            recovery: RecoveryController::new(factory, config),
            emitter: Emitter::new(None, &run_id),
            run_id,
            lease: config.lease,
            summary: RunSummary::default(),
        }
    }

    /// Publish crawl events to `tx`.
    pub fn with_events(mut self, tx: CrawlEventSender) -> Self {
        self.emitter = Emitter::new(Some(tx), &self.run_id);
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Crawl until the frontier is exhausted.
    ///
    /// The automation session is released whatever the outcome.
    pub async fn run(&mut self) -> Result<RunSummary> {
        let started = Instant::now();
        self.summary = RunSummary::default();
        self.summary.reclaimed = self.frontier().reclaim_abandoned()?;
        self.emitter.emit(CrawlEventKind::RunStarted {
            reclaimed: self.summary.reclaimed,
        });
        info!("crawl {} started", self.run_id);

        let result = self.crawl_periods().await;
        self.recovery.shutdown().await;
        result?;

        self.summary.resets = self.recovery.resets();
        self.summary.elapsed_ms = started.elapsed().as_millis() as u64;
        let observations = ObservationRecorder::new(&self.db).count()?;
        self.emitter.emit(CrawlEventKind::RunComplete {
            observations,
            elapsed_ms: self.summary.elapsed_ms,
        });
        info!(
            "crawl complete: {} new observation(s), {} absent leaf/leaves, {} fault(s) in {}ms",
            self.summary.observations_written,
            self.summary.leaves_absent,
            self.summary.faults,
            self.summary.elapsed_ms
        );
        Ok(self.summary.clone())
    }

    /// Release the automation session after an interrupted run.
    pub async fn shutdown(&mut self) {
        self.recovery.shutdown().await;
    }

    fn frontier(&self) -> Frontier<'_> {
        Frontier::new(&self.db)
    }

    async fn crawl_periods(&mut self) -> Result<()> {
        let root = NodePath::root();
        // The root always merges, so newly published periods are picked up.
        self.populate(Parent::Root, &root).await?;

        loop {
            let next = self.frontier().next_unvisited(Parent::Root)?;
            let Some(period) = next else { break };
            let path = root.child(&period.label);
            info!("period {}", period.label);
            self.enter(&period, &path);

            if self.crawl_brands(period.id, &path).await? == Subtree::Absent {
                warn!("{path}: period no longer published");
            }
            self.frontier().mark_visited(Level::Period, period.id)?;
            self.visited(&period, &path);
        }
        Ok(())
    }

    async fn crawl_brands(&mut self, period: i64, path: &NodePath) -> Result<Subtree> {
        let parent = Parent::Period(period);
        if self.populate(parent, path).await? == Subtree::Absent {
            return Ok(Subtree::Absent);
        }

        loop {
            let next = self.frontier().next_unvisited(parent)?;
            let Some(brand) = next else { break };
            let path = path.child(&brand.label);
            info!("brand {path}");
            self.enter(&brand, &path);

            if self.crawl_models(period, brand.id, &path).await? == Subtree::Absent {
                warn!("{path}: brand not offered");
                self.emitter.emit(CrawlEventKind::NodeAbsent {
                    level: Level::Brand,
                    path: path.to_string(),
                    deleted: false,
                });
            }
            self.frontier().mark_visited(Level::Brand, brand.id)?;
            self.visited(&brand, &path);
        }
        Ok(Subtree::Done)
    }

    async fn crawl_models(&mut self, period: i64, brand: i64, path: &NodePath) -> Result<Subtree> {
        let parent = Parent::Brand { period, brand };
        if self.populate(parent, path).await? == Subtree::Absent {
            return Ok(Subtree::Absent);
        }

        loop {
            let next = self.frontier().next_unvisited(parent)?;
            let Some(model) = next else { break };
            let path = path.child(&model.label);
            debug!("model {path}");
            self.enter(&model, &path);

            match self.crawl_years(period, model.id, &path).await? {
                Subtree::Done => {
                    self.frontier().mark_visited(Level::Model, model.id)?;
                    self.visited(&model, &path);
                }
                Subtree::Absent => match self.frontier().delete(Level::Model, model.id)? {
                    Deletion::Deleted => {
                        self.summary.nodes_deleted += 1;
                        self.emitter.emit(CrawlEventKind::NodeAbsent {
                            level: Level::Model,
                            path: path.to_string(),
                            deleted: true,
                        });
                    }
                    Deletion::Retained => {
                        warn!("{path}: model not offered, keeping its recorded history");
                        self.frontier().mark_visited(Level::Model, model.id)?;
                        self.emitter.emit(CrawlEventKind::NodeAbsent {
                            level: Level::Model,
                            path: path.to_string(),
                            deleted: false,
                        });
                    }
                },
            }
        }
        Ok(Subtree::Done)
    }

    async fn crawl_years(&mut self, period: i64, model: i64, path: &NodePath) -> Result<Subtree> {
        let parent = Parent::Model { period, model };
        if self.populate(parent, path).await? == Subtree::Absent {
            return Ok(Subtree::Absent);
        }

        loop {
            let next = self.frontier().next_unvisited(parent)?;
            let Some(year) = next else { break };
            let path = path.child(&year.label);
            self.visit_leaf(period, model, &year, &path).await?;
        }
        Ok(Subtree::Done)
    }

    /// Claim, select, extract, then record and mark, or delete.
    async fn visit_leaf(
        &mut self,
        period: i64,
        model: i64,
        year: &Node,
        path: &NodePath,
    ) -> Result<()> {
        if !self
            .frontier()
            .claim(Level::ModelYear, year.id, &self.run_id, self.lease)?
        {
            debug!("{path}: claimed elsewhere");
            return Ok(());
        }
        self.enter(year, path);

        let result = match self.interact(path, &ExtractLeaf).await {
            Ok(found) => self.settle_leaf(period, model, year, path, found),
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            if let Err(release) = self.frontier().release(Level::ModelYear, year.id) {
                warn!("{path}: failed to release claim: {release}");
            }
            return Err(e);
        }
        Ok(())
    }

    /// Record and mark a claimed leaf, or drop it when the source lacks it.
    fn settle_leaf(
        &mut self,
        period: i64,
        model: i64,
        year: &Node,
        path: &NodePath,
        found: Found<LeafReport>,
    ) -> Result<()> {
        let report = match found {
            Found::Present(report) => report,
            Found::Absent => return self.drop_leaf(year, path),
        };
        let recorder = ObservationRecorder::new(&self.db);
        match recorder.record(period, year.id, report.value)? {
            Recorded::Written => self.summary.observations_written += 1,
            Recorded::AlreadyPresent => self.summary.observations_present += 1,
        }
        if let Some(code) = report.model_code.as_deref() {
            recorder.record_model_code(model, code)?;
        }
        self.frontier().mark_visited(Level::ModelYear, year.id)?;
        debug!("{path}: {:.2}", report.value);
        self.emitter.emit(CrawlEventKind::ObservationRecorded {
            path: path.to_string(),
            value: report.value,
        });
        self.visited(year, path);
        Ok(())
    }

    fn drop_leaf(&mut self, year: &Node, path: &NodePath) -> Result<()> {
        let deleted = self.frontier().delete(Level::ModelYear, year.id)? == Deletion::Deleted;
        if deleted {
            self.summary.nodes_deleted += 1;
        } else {
            // Recorded before; never turn it back into work.
            self.frontier().mark_visited(Level::ModelYear, year.id)?;
        }
        self.summary.leaves_absent += 1;
        info!("{path}: not found, dropped");
        self.emitter.emit(CrawlEventKind::NodeAbsent {
            level: Level::ModelYear,
            path: path.to_string(),
            deleted,
        });
        Ok(())
    }

    /// Populate the children of `parent` from the source if this pass has
    /// not done so yet.
    async fn populate(&mut self, parent: Parent, path: &NodePath) -> Result<Subtree> {
        if parent != Parent::Root
            && (self.frontier().has_unvisited(parent)? || self.frontier().is_populated(parent)?)
        {
            return Ok(Subtree::Done);
        }

        let children = match self.interact(path, &ListChildren).await? {
            Found::Present(children) => children,
            Found::Absent => return Ok(Subtree::Absent),
        };
        if let Population::Populated { inserted, reset } =
            self.frontier().ensure_populated(parent, &children)?
        {
            self.emitter.emit(CrawlEventKind::Populated {
                level: parent.child_level(),
                path: path.to_string(),
                inserted,
                reset,
            });
        }
        Ok(Subtree::Done)
    }

    /// Run one step against the source until it succeeds, reports absence,
    /// or the recovery controller gives up.
    async fn interact<S: Step>(&mut self, path: &NodePath, step: &S) -> Result<Found<S::Output>> {
        loop {
            self.recovery.begin(path);
            let source = self.recovery.source().await?;
            let decision = match step.run(source, path).await {
                Ok(Found::Present(output)) => {
                    self.recovery.succeeded();
                    return Ok(Found::Present(output));
                }
                Ok(Found::Absent) => self.recovery.absent(),
                Err(fault) => {
                    self.summary.faults += 1;
                    let decision = self.recovery.fault(path, &fault).await?;
                    self.emitter.emit(CrawlEventKind::Fault {
                        path: path.to_string(),
                        fault: fault.to_string(),
                        decision: decision.to_string(),
                    });
                    decision
                }
            };

            match decision {
                Decision::DropNode => return Ok(Found::Absent),
                Decision::EscalateFatal => {
                    return Err(CrawlError::FaultBudgetExhausted {
                        path: path.to_string(),
                        faults: self.recovery.consecutive_faults(),
                    })
                }
                Decision::ResetAndRetry => self.emitter.emit(CrawlEventKind::SessionReset {
                    attempts: self.recovery.resets(),
                }),
                Decision::RetrySameNode => {}
            }
        }
    }

    fn enter(&mut self, node: &Node, path: &NodePath) {
        self.emitter.emit(CrawlEventKind::NodeEntered {
            level: node.level,
            path: path.to_string(),
        });
    }

    fn visited(&mut self, node: &Node, path: &NodePath) {
        self.emitter.emit(CrawlEventKind::NodeVisited {
            level: node.level,
            path: path.to_string(),
        });
    }
}
