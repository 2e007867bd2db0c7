// Copyright 2026 FIPE Crawler Contributors
// SPDX-License-Identifier: Apache-2.0

//! Frontier store: per-level visitation state of the crawl.
//!
//! The frontier exclusively owns every status mutation. Calls are safe to
//! repeat: population is idempotent per scope, transitions are upserts that
//! tolerate a row already being in the target state.
//!
//! ## Population scope
//!
//! Children of a non-root parent are populated at most once per period pass.
//! A marker row in `population` is written in the same transaction as the
//! children, so a crash either leaves no trace or a fully populated scope.
//! Children that already exist under their natural key are reset to
//! `Unvisited` instead of being inserted again.

use crate::error::{CrawlError, Result};
use crate::hierarchy::{self, Level, Parent, Status};
use crate::store::Database;
use chrono::{NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde::Serialize;
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, info};

/// Rows that may be picked up: unvisited, or claimed under an expired lease.
const AVAILABLE: &str = "(status = 1 OR (status = 3 AND lease_expires_at <= ?1))";

/// A frontier node, as handed to the traversal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub level: Level,
    pub id: i64,
    pub label: String,
}

/// Outcome of [`Frontier::ensure_populated`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Population {
    /// The scope was already populated this pass, or still has work.
    Skipped,
    Populated { inserted: usize, reset: usize },
}

/// Outcome of [`Frontier::delete`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deletion {
    Deleted,
    /// Kept because recorded observations still reference it.
    Retained,
}

/// Status counts for one level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LevelCounts {
    pub unvisited: u64,
    pub visiting: u64,
    pub visited: u64,
}

impl LevelCounts {
    pub fn total(&self) -> u64 {
        self.unvisited + self.visiting + self.visited
    }
}

/// Thin contract over the [`Database`] for frontier state.
pub struct Frontier<'a> {
    db: &'a Database,
}

impl<'a> Frontier<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Populate the children of `parent` from the source's listing, once.
    ///
    /// The root level merges: periods the source newly publishes are added,
    /// known periods keep their status. Any other level only populates when
    /// it has no available row under `parent` and no population marker for
    /// this pass.
    pub fn ensure_populated(&self, parent: Parent, children: &[String]) -> Result<Population> {
        if parent != Parent::Root && (self.has_unvisited(parent)? || self.is_populated(parent)?) {
            debug!("{} under {parent:?} already populated", parent.child_level());
            return Ok(Population::Skipped);
        }
        let outcome = self.populate(parent, children)?;
        if let Population::Populated { inserted, reset } = outcome {
            info!(
                "populated {} {}(s) under {parent:?}: {inserted} new, {reset} reset",
                children.len(),
                parent.child_level()
            );
        }
        Ok(outcome)
    }

    /// Whether the children of `parent` were populated during this pass.
    pub fn is_populated(&self, parent: Parent) -> Result<bool> {
        if parent == Parent::Root {
            return Ok(self.counts(Level::Period)?.total() > 0);
        }
        let found: Option<i64> = self
            .db
            .conn()
            .query_row(
                "SELECT 1 FROM population WHERE period_id = ?1 AND level = ?2 AND parent_id = ?3",
                params![
                    parent.period_id(),
                    parent.child_level().table(),
                    parent.parent_id()
                ],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Unguarded merge of `children` into the scope of `parent`.
    ///
    /// Duplicate labels in the listing are merged into one row.
    pub fn populate(&self, parent: Parent, children: &[String]) -> Result<Population> {
        let now = Utc::now().to_rfc3339();

        self.db.write(|tx| {
            let mut seen = HashSet::new();
            let (mut inserted, mut reset) = (0, 0);
            for label in children {
                let label = label.trim();
                if label.is_empty() || !seen.insert(label) {
                    continue;
                }
                match merge_child(tx, parent, label)? {
                    Merge::Inserted => inserted += 1,
                    Merge::Reset => reset += 1,
                    Merge::Kept => {}
                }
            }
            if parent != Parent::Root {
                tx.execute(
                    "INSERT OR IGNORE INTO population (period_id, level, parent_id, populated_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![
                        parent.period_id(),
                        parent.child_level().table(),
                        parent.parent_id(),
                        now
                    ],
                )?;
            }
            Ok(Population::Populated { inserted, reset })
        })
    }

    /// Earliest available child under `parent`.
    ///
    /// Periods, brands and model-years come in insertion order; models in
    /// lexical order of their name.
    pub fn next_unvisited(&self, parent: Parent) -> Result<Option<Node>> {
        let now = Utc::now().timestamp();
        let conn = self.db.conn();
        let level = parent.child_level();
        let row = match parent {
            Parent::Root => conn
                .query_row(
                    &format!("SELECT id, label FROM period WHERE {AVAILABLE} ORDER BY id LIMIT 1"),
                    params![now],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?,
            Parent::Period(period) => conn
                .query_row(
                    "SELECT b.id, b.name FROM brand b
                     JOIN period_brand pb ON pb.brand_id = b.id
                     WHERE pb.period_id = ?2
                       AND (b.status = 1 OR (b.status = 3 AND b.lease_expires_at <= ?1))
                     ORDER BY b.id LIMIT 1",
                    params![now, period],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?,
            Parent::Brand { brand, .. } => conn
                .query_row(
                    &format!(
                        "SELECT id, name FROM model WHERE brand_id = ?2 AND {AVAILABLE}
                         ORDER BY name, id LIMIT 1"
                    ),
                    params![now, brand],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?,
            Parent::Model { period, model } => conn
                .query_row(
                    &format!(
                        "SELECT id, label FROM model_year
                         WHERE model_id = ?2 AND period_id = ?3 AND {AVAILABLE}
                         ORDER BY id LIMIT 1"
                    ),
                    params![now, model, period],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?,
        };
        Ok(row.map(|(id, label)| Node { level, id, label }))
    }

    /// Loop guard: whether any child under `parent` is still available.
    pub fn has_unvisited(&self, parent: Parent) -> Result<bool> {
        Ok(self.next_unvisited(parent)?.is_some())
    }

    pub fn mark_visited(&self, level: Level, id: i64) -> Result<()> {
        self.set_status(level, id, Status::Visited)
    }

    /// Reset the node with natural key `label` under `parent` to `Unvisited`.
    ///
    /// Returns whether such a node exists.
    pub fn mark_unvisited(&self, parent: Parent, label: &str) -> Result<bool> {
        match find_by_key(self.db.conn(), parent, label.trim())? {
            Some(id) => {
                self.set_status(parent.child_level(), id, Status::Unvisited)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Remove a node for good: the source confirmed its path does not exist.
    ///
    /// Nodes referenced by recorded observations are retained. Periods and
    /// brands anchor history and are rejected with [`CrawlError::NotDeletable`].
    pub fn delete(&self, level: Level, id: i64) -> Result<Deletion> {
        let references = match level {
            Level::ModelYear => "SELECT COUNT(*) FROM observation WHERE model_year_id = ?1",
            Level::Model => {
                "SELECT COUNT(*) FROM observation o
                 JOIN model_year my ON my.id = o.model_year_id
                 WHERE my.model_id = ?1"
            }
            Level::Period | Level::Brand => return Err(CrawlError::NotDeletable(level)),
        };
        self.db.write(|tx| {
            let referenced: i64 = tx.query_row(references, params![id], |row| row.get(0))?;
            if referenced > 0 {
                return Ok(Deletion::Retained);
            }
            if level == Level::Model {
                tx.execute("DELETE FROM model_year WHERE model_id = ?1", params![id])?;
                tx.execute(
                    "DELETE FROM population WHERE level = ?1 AND parent_id = ?2",
                    params![Level::ModelYear.table(), id],
                )?;
            }
            tx.execute(
                &format!("DELETE FROM {} WHERE id = ?1", level.table()),
                params![id],
            )?;
            Ok(Deletion::Deleted)
        })
    }

    /// Claim an available node under a lease. Returns `false` if someone else
    /// holds a live lease on it, or it is already visited.
    pub fn claim(&self, level: Level, id: i64, owner: &str, lease: Duration) -> Result<bool> {
        let now = Utc::now().timestamp();
        let expires = now + lease.as_secs() as i64;
        let rows = self.db.write(|tx| {
            tx.execute(
                &format!(
                    "UPDATE {} SET status = 3, lease_owner = ?2, lease_expires_at = ?3
                     WHERE id = ?4 AND {AVAILABLE}",
                    level.table()
                ),
                params![now, owner, expires, id],
            )
        })?;
        Ok(rows == 1)
    }

    /// Give up a claim without confirming it.
    pub fn release(&self, level: Level, id: i64) -> Result<()> {
        self.db.write(|tx| {
            tx.execute(
                &format!(
                    "UPDATE {} SET status = 1, lease_owner = NULL, lease_expires_at = NULL
                     WHERE id = ?1 AND status = 3",
                    level.table()
                ),
                params![id],
            )
        })?;
        Ok(())
    }

    /// Return every claimed node to `Unvisited`, live lease or not.
    ///
    /// Only valid when a single worker owns the store, at start-up.
    pub fn reclaim_abandoned(&self) -> Result<usize> {
        let reclaimed = self.db.write(|tx| {
            let mut total = 0;
            for level in Level::ALL {
                total += tx.execute(
                    &format!(
                        "UPDATE {} SET status = 1, lease_owner = NULL, lease_expires_at = NULL
                         WHERE status = 3",
                        level.table()
                    ),
                    [],
                )?;
            }
            Ok(total)
        })?;
        if reclaimed > 0 {
            info!("reclaimed {reclaimed} abandoned claim(s)");
        }
        Ok(reclaimed)
    }

    pub fn counts(&self, level: Level) -> Result<LevelCounts> {
        let mut stmt = self.db.conn().prepare(&format!(
            "SELECT status, COUNT(*) FROM {} GROUP BY status",
            level.table()
        ))?;
        let mut counts = LevelCounts::default();
        let rows = stmt.query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)))?;
        for row in rows {
            let (code, count) = row?;
            match Status::from_code(code) {
                Some(Status::Unvisited) => counts.unvisited += count as u64,
                Some(Status::Visiting) => counts.visiting += count as u64,
                Some(Status::Visited) => counts.visited += count as u64,
                None => {}
            }
        }
        Ok(counts)
    }

    pub fn status(&self, level: Level, id: i64) -> Result<Option<Status>> {
        let code: Option<i64> = self
            .db
            .conn()
            .query_row(
                &format!("SELECT status FROM {} WHERE id = ?1", level.table()),
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(code.and_then(Status::from_code))
    }

    fn set_status(&self, level: Level, id: i64, status: Status) -> Result<()> {
        self.db.write(|tx| {
            tx.execute(
                &format!(
                    "UPDATE {} SET status = ?1, lease_owner = NULL, lease_expires_at = NULL
                     WHERE id = ?2",
                    level.table()
                ),
                params![status.code(), id],
            )
        })?;
        Ok(())
    }
}

enum Merge {
    Inserted,
    Reset,
    Kept,
}

/// Id of the node with natural key `label` in the scope of `parent`.
fn find_by_key(conn: &Connection, parent: Parent, label: &str) -> rusqlite::Result<Option<i64>> {
    match parent {
        Parent::Root => {
            let date = match hierarchy::parse_period_label(label) {
                Ok(date) => date,
                Err(_) => return Ok(None),
            };
            conn.query_row(
                "SELECT id FROM period WHERE period_date = ?1",
                params![date],
                |row| row.get(0),
            )
            .optional()
        }
        Parent::Period(_) => conn
            .query_row("SELECT id FROM brand WHERE name = ?1", params![label], |row| {
                row.get(0)
            })
            .optional(),
        Parent::Brand { brand, .. } => conn
            .query_row(
                "SELECT id FROM model WHERE brand_id = ?1 AND name = ?2",
                params![brand, label],
                |row| row.get(0),
            )
            .optional(),
        Parent::Model { period, model } => conn
            .query_row(
                "SELECT id FROM model_year WHERE model_id = ?1 AND period_id = ?2 AND label = ?3",
                params![model, period, label],
                |row| row.get(0),
            )
            .optional(),
    }
}

fn merge_child(tx: &Transaction<'_>, parent: Parent, label: &str) -> rusqlite::Result<Merge> {
    let existing = find_by_key(tx, parent, label)?;
    let table = parent.child_level().table();

    if let Some(id) = existing {
        if parent == Parent::Root {
            return Ok(Merge::Kept);
        }
        tx.execute(
            &format!(
                "UPDATE {table} SET status = 1, lease_owner = NULL, lease_expires_at = NULL
                 WHERE id = ?1"
            ),
            params![id],
        )?;
        if let Parent::Period(period) = parent {
            tx.execute(
                "INSERT OR IGNORE INTO period_brand (period_id, brand_id) VALUES (?1, ?2)",
                params![period, id],
            )?;
        }
        return Ok(Merge::Reset);
    }

    match parent {
        Parent::Root => {
            let date = match hierarchy::parse_period_label(label) {
                Ok(date) => date,
                Err(e) => {
                    tracing::warn!("skipping period: {e}");
                    return Ok(Merge::Kept);
                }
            };
            tx.execute(
                "INSERT INTO period (label, period_date) VALUES (?1, ?2)",
                params![label, date],
            )?;
        }
        Parent::Period(period) => {
            tx.execute("INSERT INTO brand (name) VALUES (?1)", params![label])?;
            tx.execute(
                "INSERT INTO period_brand (period_id, brand_id) VALUES (?1, ?2)",
                params![period, tx.last_insert_rowid()],
            )?;
        }
        Parent::Brand { brand, .. } => {
            tx.execute(
                "INSERT INTO model (brand_id, name) VALUES (?1, ?2)",
                params![brand, label],
            )?;
        }
        Parent::Model { period, model } => {
            let period_date: NaiveDate = tx.query_row(
                "SELECT period_date FROM period WHERE id = ?1",
                params![period],
                |row| row.get(0),
            )?;
            let (year, variant) = hierarchy::parse_model_year_label(label, period_date);
            tx.execute(
                "INSERT INTO model_year (model_id, period_id, label, year, variant)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![model, period, label, year, variant],
            )?;
        }
    }
    Ok(Merge::Inserted)
}
