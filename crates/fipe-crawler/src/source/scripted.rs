//! Scripted automation source.
//!
//! Serves a fixed [`Catalog`] of periods, brands, models and model-years and
//! behaves like the real surface: selection is forgotten after every leaf,
//! and extraction needs a fully selected path. Faults can be injected on the
//! n-th call of an operation to exercise the recovery path. Loadable from a
//! JSON fixture for `fipe-crawler simulate`.

use super::{
    AutomationSource, Extraction, LeafReport, NodePath, Selection, SourceFactory, SourceFault,
    SourceResult,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

/// The full hierarchy the source publishes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Catalog {
    pub periods: Vec<PeriodEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeriodEntry {
    pub label: String,
    #[serde(default)]
    pub brands: Vec<BrandEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrandEntry {
    pub name: String,
    #[serde(default)]
    pub models: Vec<ModelEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelEntry {
    pub name: String,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub years: Vec<YearEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct YearEntry {
    pub label: String,
    /// `None` makes extraction report the leaf as absent.
    #[serde(default)]
    pub value: Option<f64>,
}

impl Catalog {
    /// Build a catalog from flat leaf rows, keeping first-seen order.
    pub fn from_leaves(leaves: &[(&str, &str, &str, &str, Option<f64>)]) -> Self {
        let mut catalog = Catalog::default();
        for (period, brand, model, year, value) in leaves {
            let period = find_or_push(
                &mut catalog.periods,
                |p| p.label == *period,
                || PeriodEntry {
                    label: period.to_string(),
                    brands: Vec::new(),
                },
            );
            let brand = find_or_push(
                &mut period.brands,
                |b| b.name == *brand,
                || BrandEntry {
                    name: brand.to_string(),
                    models: Vec::new(),
                },
            );
            let model = find_or_push(
                &mut brand.models,
                |m| m.name == *model,
                || ModelEntry {
                    name: model.to_string(),
                    code: None,
                    years: Vec::new(),
                },
            );
            model.years.push(YearEntry {
                label: year.to_string(),
                value: *value,
            });
        }
        catalog
    }

    pub fn from_json(json: &str) -> crate::error::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load(path: &Path) -> crate::error::Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Labels under `path`, or `None` if the path itself is unknown.
    pub fn children(&self, path: &NodePath) -> Option<Vec<String>> {
        let labels = match path.depth() {
            0 => self.periods.iter().map(|p| p.label.clone()).collect(),
            1 => self
                .period(path)?
                .brands
                .iter()
                .map(|b| b.name.clone())
                .collect(),
            2 => self
                .brand(path)?
                .models
                .iter()
                .map(|m| m.name.clone())
                .collect(),
            3 => self
                .model(path)?
                .years
                .iter()
                .map(|y| y.label.clone())
                .collect(),
            _ => Vec::new(),
        };
        Some(labels)
    }

    /// Whether every label of `path` exists.
    pub fn contains(&self, path: &NodePath) -> bool {
        match path.depth() {
            0 => true,
            1 => self.period(path).is_some(),
            2 => self.brand(path).is_some(),
            3 => self.model(path).is_some(),
            4 => self.year(path).is_some(),
            _ => false,
        }
    }

    /// Number of leaves that extract a value.
    pub fn priced_leaves(&self) -> usize {
        self.periods
            .iter()
            .flat_map(|p| &p.brands)
            .flat_map(|b| &b.models)
            .flat_map(|m| &m.years)
            .filter(|y| y.value.is_some())
            .count()
    }

    fn period(&self, path: &NodePath) -> Option<&PeriodEntry> {
        let label = path.period()?;
        self.periods.iter().find(|p| p.label == label)
    }

    fn brand(&self, path: &NodePath) -> Option<&BrandEntry> {
        let name = path.brand()?;
        self.period(path)?.brands.iter().find(|b| b.name == name)
    }

    fn model(&self, path: &NodePath) -> Option<&ModelEntry> {
        let name = path.model()?;
        self.brand(path)?.models.iter().find(|m| m.name == name)
    }

    fn year(&self, path: &NodePath) -> Option<&YearEntry> {
        let label = path.model_year()?;
        self.model(path)?.years.iter().find(|y| y.label == label)
    }
}

fn find_or_push<'a, T>(
    items: &'a mut Vec<T>,
    matches: impl Fn(&T) -> bool,
    make: impl FnOnce() -> T,
) -> &'a mut T {
    let index = match items.iter().position(matches) {
        Some(index) => index,
        None => {
            items.push(make());
            items.len() - 1
        }
    };
    &mut items[index]
}

/// Operation a fault can be injected into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    ListChildren,
    SelectPath,
    ExtractLeaf,
}

/// Fail the `call`-th invocation (1-based, counted across sessions) of `op`.
#[derive(Debug, Clone, PartialEq)]
pub struct InjectedFault {
    pub op: Operation,
    pub call: u64,
    pub fault: SourceFault,
}

/// Counters shared by a factory and every session it opened.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScriptStats {
    pub sessions_opened: u64,
    pub sessions_closed: u64,
    pub failed_opens: u64,
    pub list_calls: u64,
    pub select_calls: u64,
    pub extract_calls: u64,
    /// Leaf paths in the order they were extracted, absent ones included.
    pub extracted: Vec<String>,
    pub faults_raised: u64,
}

#[derive(Debug, Default)]
struct Script {
    faults: Vec<InjectedFault>,
    failing_opens: u64,
    stats: ScriptStats,
}

/// Opens [`ScriptedSource`] sessions over one catalog.
#[derive(Clone)]
pub struct ScriptedFactory {
    catalog: Arc<Catalog>,
    script: Arc<Mutex<Script>>,
}

impl ScriptedFactory {
    pub fn new(catalog: Catalog) -> Self {
        Self {
            catalog: Arc::new(catalog),
            script: Arc::new(Mutex::new(Script::default())),
        }
    }

    /// Inject a fault on the `call`-th invocation of `op`.
    pub fn with_fault(self, op: Operation, call: u64, fault: SourceFault) -> Self {
        lock(&self.script).faults.push(InjectedFault { op, call, fault });
        self
    }

    /// Make the next `count` calls to [`SourceFactory::open`] fail.
    pub fn with_failing_opens(self, count: u64) -> Self {
        lock(&self.script).failing_opens = count;
        self
    }

    /// Replace the published catalog, e.g. to publish a new period.
    pub fn republish(&mut self, catalog: Catalog) {
        self.catalog = Arc::new(catalog);
    }

    pub fn stats(&self) -> ScriptStats {
        lock(&self.script).stats.clone()
    }
}

#[async_trait]
impl SourceFactory for ScriptedFactory {
    async fn open(&self) -> SourceResult<Box<dyn AutomationSource>> {
        {
            let mut script = lock(&self.script);
            if script.failing_opens > 0 {
                script.failing_opens -= 1;
                script.stats.failed_opens += 1;
                return Err(SourceFault::Interaction("session failed to start".into()));
            }
            script.stats.sessions_opened += 1;
        }
        Ok(Box::new(ScriptedSource {
            catalog: Arc::clone(&self.catalog),
            script: Arc::clone(&self.script),
            selected: None,
        }))
    }
}

/// One scripted session.
pub struct ScriptedSource {
    catalog: Arc<Catalog>,
    script: Arc<Mutex<Script>>,
    selected: Option<NodePath>,
}

impl ScriptedSource {
    /// Count the call and raise the fault planned for it, if any.
    fn enter(&mut self, op: Operation) -> SourceResult<()> {
        let mut script = lock(&self.script);
        let call = match op {
            Operation::ListChildren => {
                script.stats.list_calls += 1;
                script.stats.list_calls
            }
            Operation::SelectPath => {
                script.stats.select_calls += 1;
                script.stats.select_calls
            }
            Operation::ExtractLeaf => {
                script.stats.extract_calls += 1;
                script.stats.extract_calls
            }
        };
        let planned = script
            .faults
            .iter()
            .find(|f| f.op == op && f.call == call)
            .map(|f| f.fault.clone());
        if let Some(fault) = planned {
            script.stats.faults_raised += 1;
            drop(script);
            // A fault leaves the surface in an unknown state.
            self.selected = None;
            return Err(fault);
        }
        Ok(())
    }
}

#[async_trait]
impl AutomationSource for ScriptedSource {
    async fn list_children(&mut self, path: &NodePath) -> SourceResult<Vec<String>> {
        self.enter(Operation::ListChildren)?;
        self.catalog
            .children(path)
            .ok_or_else(|| SourceFault::Lookup(format!("no entry for {path}")))
    }

    async fn select_path(&mut self, path: &NodePath) -> SourceResult<Selection> {
        self.enter(Operation::SelectPath)?;
        self.selected = None;
        if !self.catalog.contains(path) {
            return Ok(Selection::Absent);
        }
        self.selected = Some(path.clone());
        Ok(Selection::Selected)
    }

    async fn extract_leaf(&mut self) -> SourceResult<Extraction> {
        self.enter(Operation::ExtractLeaf)?;
        // The surface clears its form once a result is shown.
        let path = match self.selected.take() {
            Some(path) if path.is_leaf() => path,
            _ => return Err(SourceFault::Interaction("no leaf selected".into())),
        };
        lock(&self.script).stats.extracted.push(path.to_string());

        let value = self.catalog.year(&path).and_then(|y| y.value);
        Ok(match value {
            Some(value) => Extraction::Observation(LeafReport {
                value,
                model_code: self.catalog.model(&path).and_then(|m| m.code.clone()),
            }),
            None => Extraction::Absent,
        })
    }

    async fn close(self: Box<Self>) -> SourceResult<()> {
        lock(&self.script).stats.sessions_closed += 1;
        Ok(())
    }
}

/// The script holds plain counters, so a poisoned lock is still usable.
fn lock(script: &Mutex<Script>) -> MutexGuard<'_, Script> {
    script.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
