//! Delivery trace log
//!
//! A debugging aid recording what the delivery pipeline did to each payload.
//! Recording never influences delivery.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use tracing::debug;

/// One step in the life of a payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryTraceState {
    /// Intake accepted a payload for storage
    IntakeAccepted { filename: String, complete: bool },
    /// A cached snapshot was superseded and deleted
    SnapshotSuperseded { filename: String },
    PayloadStored { filename: String, bytes: u64 },
    PayloadStoreFailed { filename: String, reason: String },
    PayloadEvicted { filename: String },
    PayloadDeleted { filename: String },
    /// Payload moved to the dropped area
    PayloadDropped { filename: String, reason: String },
    DeliveryStarted { filename: String },
    DeliverySucceeded { filename: String },
    /// Transient failure; retry scheduled after `delay_ms`
    RetryScheduled { filename: String, attempt: u32, delay_ms: u64 },
    /// Payload file vanished before delivery
    PayloadMissing { filename: String },
    /// Endpoint paused after a `429` until `until_ms`
    EndpointBlocked { endpoint: &'static str, until_ms: i64 },
    ConnectivityChanged { connected: bool },
    ResurrectionStarted { candidates: usize },
    PayloadResurrected { filename: String },
    ResurrectionFailed { filename: String, reason: String },
    SnapshotCached { filename: String },
}

impl fmt::Display for DeliveryTraceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IntakeAccepted { filename, complete } => {
                write!(f, "intake accepted {filename} (complete={complete})")
            }
            Self::SnapshotSuperseded { filename } => write!(f, "snapshot superseded {filename}"),
            Self::PayloadStored { filename, bytes } => write!(f, "stored {filename} ({bytes} bytes)"),
            Self::PayloadStoreFailed { filename, reason } => {
                write!(f, "store failed {filename}: {reason}")
            }
            Self::PayloadEvicted { filename } => write!(f, "evicted {filename}"),
            Self::PayloadDeleted { filename } => write!(f, "deleted {filename}"),
            Self::PayloadDropped { filename, reason } => write!(f, "dropped {filename}: {reason}"),
            Self::DeliveryStarted { filename } => write!(f, "delivering {filename}"),
            Self::DeliverySucceeded { filename } => write!(f, "delivered {filename}"),
            Self::RetryScheduled {
                filename,
                attempt,
                delay_ms,
            } => write!(f, "retry #{attempt} of {filename} in {delay_ms}ms"),
            Self::PayloadMissing { filename } => write!(f, "missing {filename}"),
            Self::EndpointBlocked { endpoint, until_ms } => {
                write!(f, "endpoint {endpoint} blocked until {until_ms}")
            }
            Self::ConnectivityChanged { connected } => write!(f, "connectivity connected={connected}"),
            Self::ResurrectionStarted { candidates } => {
                write!(f, "resurrection started with {candidates} candidates")
            }
            Self::PayloadResurrected { filename } => write!(f, "resurrected {filename}"),
            Self::ResurrectionFailed { filename, reason } => {
                write!(f, "resurrection failed {filename}: {reason}")
            }
            Self::SnapshotCached { filename } => write!(f, "cached snapshot {filename}"),
        }
    }
}

/// A recorded trace event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceEntry {
    pub at: DateTime<Utc>,
    pub state: DeliveryTraceState,
}

/// Bounded in-memory ring of trace events
#[derive(Debug)]
pub struct DeliveryTracer {
    capacity: usize,
    entries: Mutex<VecDeque<TraceEntry>>,
}

impl DeliveryTracer {
    pub const DEFAULT_CAPACITY: usize = 1000;

    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::new()),
        }
    }

    /// Records an event, dropping the oldest one when full
    pub fn record(&self, state: DeliveryTraceState) {
        debug!(trace = %state, "Delivery trace");
        let mut entries = match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(TraceEntry {
            at: Utc::now(),
            state,
        });
    }

    /// Copy of the recorded events, oldest first
    pub fn entries(&self) -> Vec<TraceEntry> {
        match self.entries.lock() {
            Ok(guard) => guard.iter().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().iter().cloned().collect(),
        }
    }

    /// Recorded states only, oldest first
    pub fn states(&self) -> Vec<DeliveryTraceState> {
        self.entries().into_iter().map(|e| e.state).collect()
    }
}

impl Default for DeliveryTracer {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

/// Records `state` if a tracer is configured
pub fn trace(tracer: Option<&DeliveryTracer>, state: DeliveryTraceState) {
    if let Some(tracer) = tracer {
        tracer.record(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_drops_oldest() {
        let tracer = DeliveryTracer::new(2);
        for i in 0..3 {
            tracer.record(DeliveryTraceState::PayloadDeleted {
                filename: format!("f{i}"),
            });
        }
        let states = tracer.states();
        assert_eq!(states.len(), 2);
        assert_eq!(
            states[0],
            DeliveryTraceState::PayloadDeleted {
                filename: "f1".to_string()
            }
        );
    }

    #[test]
    fn test_display() {
        let state = DeliveryTraceState::RetryScheduled {
            filename: "a.json".to_string(),
            attempt: 2,
            delay_ms: 120_000,
        };
        assert_eq!(state.to_string(), "retry #2 of a.json in 120000ms");
    }

    #[test]
    fn test_trace_without_tracer_is_noop() {
        trace(None, DeliveryTraceState::ConnectivityChanged { connected: true });
    }
}
