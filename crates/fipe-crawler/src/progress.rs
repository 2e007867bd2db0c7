// Copyright 2026 FIPE Crawler Contributors
// SPDX-License-Identifier: Apache-2.0

//! Crawl event types and broadcast channel.
//!
//! The traversal emits `CrawlEvent`s as it walks the hierarchy, which flow
//! through a `tokio::sync::broadcast` channel to every subscriber (CLI
//! summary, tests). When no subscriber exists, events are silently dropped.

use crate::hierarchy::Level;
use serde::{Deserialize, Serialize};

/// An event emitted during a crawl run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlEvent {
    /// Owner id of the run this event belongs to.
    pub run_id: String,
    /// Monotonically increasing sequence number.
    pub seq: u64,
    pub event: CrawlEventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum CrawlEventKind {
    RunStarted { reclaimed: usize },
    /// Children were populated under `path`.
    Populated {
        level: Level,
        path: String,
        inserted: usize,
        reset: usize,
    },
    /// A node was entered, ancestors re-selected.
    NodeEntered { level: Level, path: String },
    /// A node and its whole subtree are done.
    NodeVisited { level: Level, path: String },
    /// The source confirmed the node does not exist.
    NodeAbsent {
        level: Level,
        path: String,
        deleted: bool,
    },
    ObservationRecorded { path: String, value: f64 },
    /// An interaction fault and the decision taken for it.
    Fault {
        path: String,
        fault: String,
        decision: String,
    },
    SessionReset { attempts: u32 },
    RunComplete {
        observations: u64,
        elapsed_ms: u64,
    },
}

pub type CrawlEventSender = tokio::sync::broadcast::Sender<CrawlEvent>;

pub type CrawlEventReceiver = tokio::sync::broadcast::Receiver<CrawlEvent>;

/// Create a new crawl event channel with a bounded buffer.
///
/// Slow subscribers lose the oldest events.
pub fn channel() -> (CrawlEventSender, CrawlEventReceiver) {
    tokio::sync::broadcast::channel(4096)
}

/// Stamps events with the run id and sequence number.
#[derive(Debug)]
pub struct Emitter {
    tx: Option<CrawlEventSender>,
    run_id: String,
    seq: u64,
}

impl Emitter {
    pub fn new(tx: Option<CrawlEventSender>, run_id: &str) -> Self {
        Self {
            tx,
            run_id: run_id.to_string(),
            seq: 0,
        }
    }

    /// Emit an event, ignoring send errors (no receivers listening).
    pub fn emit(&mut self, event: CrawlEventKind) {
        if let Some(ref sender) = self.tx {
            self.seq += 1;
            let _ = sender.send(CrawlEvent {
                run_id: self.run_id.clone(),
                seq: self.seq,
                event,
            });
        }
    }
}

/// Drain every event currently buffered in `rx`.
pub fn drain(rx: &mut CrawlEventReceiver) -> Vec<CrawlEvent> {
    let mut events = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) => events.push(event),
            Err(tokio::sync::broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }
    events
}
