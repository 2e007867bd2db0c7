//! Observation recorder: one value per (period, model-year) leaf path.

use crate::error::Result;
use crate::hierarchy::Observation;
use crate::store::Database;
use chrono::Utc;
use rusqlite::params;
use tracing::{debug, warn};

/// Result of [`ObservationRecorder::record`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recorded {
    Written,
    /// An observation already existed for the pair; nothing was written.
    AlreadyPresent,
}

/// Period, brand, model and model-year labels with the recorded value.
pub type SnapshotRow = (String, String, String, String, f64);

pub struct ObservationRecorder<'a> {
    db: &'a Database,
}

impl<'a> ObservationRecorder<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Durably record the value extracted for a leaf.
    ///
    /// A second call for the same pair is ignored, so a crash between this
    /// write and the visited mark cannot produce a duplicate.
    pub fn record(&self, period_id: i64, model_year_id: i64, value: f64) -> Result<Recorded> {
        let recorded_at = Utc::now().to_rfc3339();
        let rows = self.db.write(|tx| {
            tx.execute(
                "INSERT OR IGNORE INTO observation (period_id, model_year_id, value, recorded_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![period_id, model_year_id, value, recorded_at],
            )
        })?;
        if rows == 0 {
            warn!("observation for period {period_id} / model-year {model_year_id} already recorded");
            return Ok(Recorded::AlreadyPresent);
        }
        debug!("recorded {value:.2} for period {period_id} / model-year {model_year_id}");
        Ok(Recorded::Written)
    }

    /// Store the source's code for a model. Last write wins.
    pub fn record_model_code(&self, model_id: i64, code: &str) -> Result<()> {
        let code = code.trim().to_string();
        if code.is_empty() {
            return Ok(());
        }
        self.db.write(|tx| {
            tx.execute(
                "UPDATE model SET external_code = ?1 WHERE id = ?2",
                params![code, model_id],
            )
        })?;
        Ok(())
    }

    pub fn get(&self, period_id: i64, model_year_id: i64) -> Result<Option<Observation>> {
        use rusqlite::OptionalExtension;
        let observation = self
            .db
            .conn()
            .query_row(
                "SELECT id, period_id, model_year_id, value FROM observation
                 WHERE period_id = ?1 AND model_year_id = ?2",
                params![period_id, model_year_id],
                |row| {
                    Ok(Observation {
                        id: row.get(0)?,
                        period_id: row.get(1)?,
                        model_year_id: row.get(2)?,
                        value: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(observation)
    }

    pub fn count(&self) -> Result<u64> {
        let count: i64 = self
            .db
            .conn()
            .query_row("SELECT COUNT(*) FROM observation", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Every observation keyed by its labels, sorted; used to compare runs.
    pub fn snapshot(&self) -> Result<Vec<SnapshotRow>> {
        let mut stmt = self.db.conn().prepare(
            "SELECT p.label, b.name, m.name, my.label, o.value FROM observation o
             JOIN period p ON p.id = o.period_id
             JOIN model_year my ON my.id = o.model_year_id
             JOIN model m ON m.id = my.model_id
             JOIN brand b ON b.id = m.brand_id
             ORDER BY p.label, b.name, m.name, my.label",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
            })?
            .collect::<std::result::Result<Vec<SnapshotRow>, _>>()?;
        Ok(rows)
    }
}
