// Copyright 2026 FIPE Crawler Contributors
// SPDX-License-Identifier: Apache-2.0

//! Resumable crawler for the FIPE vehicle price table.
//!
//! The crawl walks Period → Brand → Model → ModelYear, persisting a
//! frontier in SQLite so an interrupted run resumes where it stopped and
//! records at most one observation per leaf.

pub mod config;
pub mod error;
pub mod frontier;
pub mod hierarchy;
pub mod progress;
pub mod recorder;
pub mod recovery;
pub mod source;
pub mod store;
pub mod traversal;

pub use config::CrawlConfig;
pub use error::{CrawlError, Result};
pub use store::Database;
pub use traversal::{RunSummary, TraversalEngine};
