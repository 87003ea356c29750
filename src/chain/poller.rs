//! Registry event polling.
//!
//! The ledger replays registry-contract events in chain order. Each poll
//! scans a bounded block window filtered to the registry address and the
//! seven event topics, decodes what it can, and reports undecodable logs
//! individually so one malformed log cannot sink the batch.

use crate::chain::rpc::{normalize_address, RpcClient};
use crate::domain::types::{LedgerPollCursor, ObservedEvent, RuntimeSnapshot};
use crate::ledger::events::{decode_registry_log, registry_event_topics};
use crate::timing::current_time_ns;
use async_trait::async_trait;
use serde_json::json;
use std::cell::RefCell;
use std::collections::VecDeque;

const MAX_BLOCK_RANGE_PER_POLL: u64 = 1_000;
const DEFAULT_MAX_LOGS_PER_POLL: usize = 200;

pub struct LedgerPollResult {
    pub cursor: LedgerPollCursor,
    pub events: Vec<ObservedEvent>,
    /// Human-readable reasons for logs that were skipped, one per log.
    pub skipped: Vec<String>,
}

#[async_trait(?Send)]
pub trait LedgerPoller {
    async fn poll(&self, cursor: &LedgerPollCursor) -> Result<LedgerPollResult, String>;
}

#[derive(Debug)]
pub struct HttpLedgerPoller {
    rpc: RpcClient,
    registry_address: String,
    max_logs_per_poll: usize,
}

impl HttpLedgerPoller {
    pub fn from_snapshot(snapshot: &RuntimeSnapshot) -> Result<Self, String> {
        let registry_address = snapshot
            .registry_address
            .as_deref()
            .ok_or_else(|| "registry address is not configured".to_string())
            .and_then(normalize_address)?;
        Ok(Self {
            rpc: RpcClient::from_snapshot(snapshot)?,
            registry_address,
            max_logs_per_poll: DEFAULT_MAX_LOGS_PER_POLL,
        })
    }
}

#[async_trait(?Send)]
impl LedgerPoller for HttpLedgerPoller {
    async fn poll(&self, cursor: &LedgerPollCursor) -> Result<LedgerPollResult, String> {
        let now = current_time_ns();
        let latest_block = self.rpc.eth_block_number().await?;

        // A fresh cursor anchors at the chain head instead of replaying the
        // full chain history one window at a time.
        if cursor.next_block == 0 {
            return Ok(LedgerPollResult {
                cursor: LedgerPollCursor {
                    chain_id: cursor.chain_id,
                    next_block: latest_block.saturating_add(1),
                    last_poll_at_ns: now,
                    consecutive_empty_polls: cursor.consecutive_empty_polls.saturating_add(1),
                },
                events: Vec::new(),
                skipped: Vec::new(),
            });
        }

        let from_block = cursor.next_block;
        let to_block = latest_block.min(from_block.saturating_add(MAX_BLOCK_RANGE_PER_POLL));

        if from_block > to_block {
            return Ok(LedgerPollResult {
                cursor: LedgerPollCursor {
                    chain_id: cursor.chain_id,
                    next_block: cursor.next_block,
                    last_poll_at_ns: now,
                    consecutive_empty_polls: cursor.consecutive_empty_polls.saturating_add(1),
                },
                events: Vec::new(),
                skipped: Vec::new(),
            });
        }

        // Position 0 of the topics filter is an OR-list over every event the
        // ledger understands.
        let topics_filter = json!([registry_event_topics()]);
        let logs = self
            .rpc
            .eth_get_logs(
                from_block,
                to_block,
                Some(self.registry_address.as_str()),
                Some(topics_filter),
                self.rpc.max_response_bytes(),
            )
            .await?;

        let mut events = Vec::new();
        let mut skipped = Vec::new();
        for log in logs.into_iter().take(self.max_logs_per_poll) {
            match decode_registry_log(&log, cursor.chain_id, now) {
                Ok(event) => events.push(event),
                Err(error) => skipped.push(format!(
                    "log {}:{} skipped: {error}",
                    log.block_number.as_deref().unwrap_or("?"),
                    log.log_index.as_deref().unwrap_or("?")
                )),
            }
        }

        let consecutive_empty_polls = if events.is_empty() {
            cursor.consecutive_empty_polls.saturating_add(1)
        } else {
            0
        };

        Ok(LedgerPollResult {
            cursor: LedgerPollCursor {
                chain_id: cursor.chain_id,
                next_block: to_block.saturating_add(1),
                last_poll_at_ns: now,
                consecutive_empty_polls,
            },
            events,
            skipped,
        })
    }
}

/// Scripted poller for ledger and scheduler tests. Events queued on
/// `pending` are drained in order; each poll advances the cursor one block.
#[allow(dead_code)]
pub struct MockLedgerPoller {
    pub pending: RefCell<VecDeque<ObservedEvent>>,
    pub fail_next_with: RefCell<Option<String>>,
}

#[allow(dead_code)]
impl MockLedgerPoller {
    pub fn new() -> Self {
        Self {
            pending: RefCell::new(VecDeque::new()),
            fail_next_with: RefCell::new(None),
        }
    }

    pub fn with_events(events: Vec<ObservedEvent>) -> Self {
        let poller = Self::new();
        poller.pending.borrow_mut().extend(events);
        poller
    }
}

impl Default for MockLedgerPoller {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait(?Send)]
impl LedgerPoller for MockLedgerPoller {
    async fn poll(&self, cursor: &LedgerPollCursor) -> Result<LedgerPollResult, String> {
        if let Some(error) = self.fail_next_with.borrow_mut().take() {
            return Err(error);
        }
        let events: Vec<ObservedEvent> = self.pending.borrow_mut().drain(..).collect();
        let consecutive_empty_polls = if events.is_empty() {
            cursor.consecutive_empty_polls.saturating_add(1)
        } else {
            0
        };
        Ok(LedgerPollResult {
            cursor: LedgerPollCursor {
                chain_id: cursor.chain_id,
                next_block: cursor.next_block.saturating_add(1),
                last_poll_at_ns: current_time_ns(),
                consecutive_empty_polls,
            },
            events,
            skipped: Vec::new(),
        })
    }
}
