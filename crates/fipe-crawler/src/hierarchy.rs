//! The four crawl levels, node status and label parsing.
//!
//! Every node lives at one [`Level`] and is addressed under a [`Parent`]
//! scope. Status codes are persisted as small integers so that existing
//! databases stay readable.

use crate::error::{CrawlError, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// One level of the Period → Brand → Model → ModelYear hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Level {
    Period,
    Brand,
    Model,
    ModelYear,
}

impl Level {
    /// All levels, root first.
    pub const ALL: [Level; 4] = [Level::Period, Level::Brand, Level::Model, Level::ModelYear];

    /// Backing table for this level.
    pub fn table(self) -> &'static str {
        match self {
            Self::Period => "period",
            Self::Brand => "brand",
            Self::Model => "model",
            Self::ModelYear => "model_year",
        }
    }
}

impl std::fmt::Display for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Period => write!(f, "period"),
            Self::Brand => write!(f, "brand"),
            Self::Model => write!(f, "model"),
            Self::ModelYear => write!(f, "model-year"),
        }
    }
}

/// Visitation status of a frontier node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    Unvisited,
    Visited,
    /// Claimed under a lease, not yet confirmed.
    Visiting,
}

impl Status {
    pub fn code(self) -> i64 {
        match self {
            Self::Unvisited => 1,
            Self::Visited => 2,
            Self::Visiting => 3,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(Self::Unvisited),
            2 => Some(Self::Visited),
            3 => Some(Self::Visiting),
            _ => None,
        }
    }
}

/// Scope under which the children of a level are looked up and populated.
///
/// Brands reach their period through a join record; models and model-years
/// carry the period so population markers stay per pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Parent {
    /// Parent of the period level.
    Root,
    Period(i64),
    Brand { period: i64, brand: i64 },
    Model { period: i64, model: i64 },
}

impl Parent {
    /// The level whose children live under this scope.
    pub fn child_level(self) -> Level {
        match self {
            Self::Root => Level::Period,
            Self::Period(_) => Level::Brand,
            Self::Brand { .. } => Level::Model,
            Self::Model { .. } => Level::ModelYear,
        }
    }

    /// Period id of this scope (0 for the root).
    pub fn period_id(self) -> i64 {
        match self {
            Self::Root => 0,
            Self::Period(period) => period,
            Self::Brand { period, .. } | Self::Model { period, .. } => period,
        }
    }

    /// Id of the parent row itself (0 for the root).
    pub fn parent_id(self) -> i64 {
        match self {
            Self::Root => 0,
            Self::Period(period) => period,
            Self::Brand { brand, .. } => brand,
            Self::Model { model, .. } => model,
        }
    }
}

/// An observation recorded for a leaf path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub id: i64,
    pub period_id: i64,
    pub model_year_id: i64,
    pub value: f64,
}

const MONTHS: [&str; 12] = [
    "janeiro",
    "fevereiro",
    "março",
    "abril",
    "maio",
    "junho",
    "julho",
    "agosto",
    "setembro",
    "outubro",
    "novembro",
    "dezembro",
];

/// Parse a period label such as `março/2021` into the first day of that month.
pub fn parse_period_label(label: &str) -> Result<NaiveDate> {
    let invalid = || CrawlError::InvalidLabel(format!("period label '{label}'"));
    let (month, year) = label.trim().split_once('/').ok_or_else(invalid)?;
    let month = month.trim().to_lowercase();
    let month = MONTHS
        .iter()
        .position(|m| *m == month)
        .ok_or_else(invalid)? as u32
        + 1;
    let year: i32 = year.trim().parse().map_err(|_| invalid())?;
    NaiveDate::from_ymd_opt(year, month, 1).ok_or_else(invalid)
}

/// Split a model-year label such as `2020 Gasolina` into its year and variant.
///
/// A leading token that is not a plausible calendar year (the source lists
/// brand-new vehicles as `32000`) falls back to `period_date`.
pub fn parse_model_year_label(label: &str, period_date: NaiveDate) -> (NaiveDate, String) {
    let label = label.trim();
    let (head, rest) = label.split_once(' ').unwrap_or((label, ""));
    let year = head
        .parse::<i32>()
        .ok()
        .filter(|y| (1..=9999).contains(y))
        .and_then(|y| NaiveDate::from_ymd_opt(y, 1, 1))
        .unwrap_or(period_date);
    (year, rest.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_period_label() {
        let date = parse_period_label("janeiro/2020").unwrap();
        assert_eq!(date, NaiveDate::from_ymd_opt(2020, 1, 1).unwrap());

        let date = parse_period_label("março/2021").unwrap();
        assert_eq!(date, NaiveDate::from_ymd_opt(2021, 3, 1).unwrap());

        let date = parse_period_label(" Dezembro / 2019 ").unwrap();
        assert_eq!(date, NaiveDate::from_ymd_opt(2019, 12, 1).unwrap());
    }

    #[test]
    fn test_parse_period_label_rejects_garbage() {
        assert!(parse_period_label("january/2020").is_err());
        assert!(parse_period_label("janeiro").is_err());
        assert!(parse_period_label("janeiro/20x0").is_err());
    }

    #[test]
    fn test_parse_model_year_label() {
        let period = NaiveDate::from_ymd_opt(2020, 1, 1).unwrap();
        let (year, variant) = parse_model_year_label("2018 Gasolina", period);
        assert_eq!(year, NaiveDate::from_ymd_opt(2018, 1, 1).unwrap());
        assert_eq!(variant, "Gasolina");
    }

    #[test]
    fn test_parse_model_year_label_zero_km_uses_period() {
        let period = NaiveDate::from_ymd_opt(2020, 6, 1).unwrap();
        let (year, variant) = parse_model_year_label("32000 Diesel", period);
        assert_eq!(year, period);
        assert_eq!(variant, "Diesel");

        let (year, variant) = parse_model_year_label("Flex", period);
        assert_eq!(year, period);
        assert_eq!(variant, "");
    }

    #[test]
    fn test_status_codes() {
        for status in [Status::Unvisited, Status::Visited, Status::Visiting] {
            assert_eq!(Status::from_code(status.code()), Some(status));
        }
        assert_eq!(Status::from_code(9), None);
    }

    #[test]
    fn test_parent_child_level() {
        assert_eq!(Parent::Root.child_level(), Level::Period);
        assert_eq!(Parent::Period(1).child_level(), Level::Brand);
        assert_eq!(
            Parent::Model { period: 1, model: 7 }.child_level(),
            Level::ModelYear
        );
        assert_eq!(Parent::Brand { period: 3, brand: 9 }.period_id(), 3);
        assert_eq!(Parent::Brand { period: 3, brand: 9 }.parent_id(), 9);
    }
}
