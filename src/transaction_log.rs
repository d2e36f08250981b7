use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use parking_lot::Mutex;

use crate::logging::{TransactionRecord, TransactionRecordBuilder, log_transaction};

/// Lifecycle of a single exchange. Only `Complete`, `BodyFailed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeState {
    Pending,
    HeaderReceived,
    BodyReceived,
    BodyFailed,
    Complete,
    Failed,
}

impl ExchangeState {
    pub fn as_label(&self) -> &'static str {
        match self {
            ExchangeState::Pending => "pending",
            ExchangeState::HeaderReceived => "header_received",
            ExchangeState::BodyReceived => "body_received",
            ExchangeState::BodyFailed => "body_failed",
            ExchangeState::Complete => "complete",
            ExchangeState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExchangeState::Complete | ExchangeState::BodyFailed | ExchangeState::Failed
        )
    }
}

struct InFlight {
    record: TransactionRecord,
    started: Instant,
}

struct LogState {
    next_id: u64,
    in_flight: HashMap<u64, InFlight>,
    completed: VecDeque<TransactionRecord>,
}

/// Tracks in-flight exchanges and keeps the last `capacity` finished ones.
///
/// Every finished exchange is emitted on the `transaction_log` tracing target regardless of
/// capacity; a capacity of zero only disables retention.
pub struct TransactionLog {
    capacity: usize,
    state: Mutex<LogState>,
}

impl TransactionLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(LogState {
                next_id: 1,
                in_flight: HashMap::new(),
                completed: VecDeque::with_capacity(capacity),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn begin(&self, builder: TransactionRecordBuilder) -> u64 {
        let mut record = builder.state(ExchangeState::Pending).build();
        let mut state = self.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        record.id = id;
        state.in_flight.insert(
            id,
            InFlight {
                record,
                started: Instant::now(),
            },
        );
        id
    }

    /// Applies `update` to an in-flight record. Unknown or already finished ids are ignored.
    pub fn update<F>(&self, id: u64, update: F)
    where
        F: FnOnce(&mut TransactionRecord),
    {
        let mut state = self.state.lock();
        if let Some(entry) = state.in_flight.get_mut(&id) {
            update(&mut entry.record);
        }
    }

    pub fn transition(&self, id: u64, next: ExchangeState) {
        self.update(id, |record| {
            if !record.state.is_terminal() {
                record.state = next;
            }
        });
    }

    /// Moves the record to its terminal state, logs it and retains it. Returns false when the
    /// id was already finished, so each exchange is reported once.
    pub fn finish(&self, id: u64, terminal: ExchangeState, error: Option<&str>) -> bool {
        let record = {
            let mut state = self.state.lock();
            let Some(entry) = state.in_flight.remove(&id) else {
                return false;
            };
            let mut record = entry.record;
            record.state = terminal;
            record.elapsed_ms = entry.started.elapsed().as_millis();
            if let Some(error) = error {
                record.error_reason = Some(terminal.as_label().to_string());
                record.error_detail = Some(error.to_string());
            }
            if self.capacity > 0 {
                if state.completed.len() == self.capacity {
                    state.completed.pop_front();
                }
                state.completed.push_back(record.clone());
            }
            record
        };
        log_transaction(&record);
        true
    }

    pub fn in_flight(&self) -> Vec<TransactionRecord> {
        let state = self.state.lock();
        let mut records: Vec<_> = state
            .in_flight
            .values()
            .map(|entry| entry.record.clone())
            .collect();
        records.sort_by_key(|record| record.id);
        records
    }

    pub fn completed(&self) -> Vec<TransactionRecord> {
        self.state.lock().completed.iter().cloned().collect()
    }
}

impl std::fmt::Debug for TransactionLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("TransactionLog")
            .field("capacity", &self.capacity)
            .field("in_flight", &state.in_flight.len())
            .field("completed", &state.completed.len())
            .finish()
    }
}
