use std::collections::VecDeque;
use std::time::SystemTime;

use tokio::time::Instant;

use crate::client::message::Promise;
use crate::common::frame::TxId;
use crate::common::function::FunctionCode;
use crate::common::pdu::Pdu;
use crate::error::RequestError;

/// How responses are matched to pending requests
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum CorrelationMode {
    /// TCP: responses carry the transaction id and may arrive out of send order
    TransactionId,
    /// RTU: the transport guarantees send order, match the oldest pending entry
    Fifo,
}

/// Who is waiting for the response
pub(crate) enum Responder {
    /// an application caller holding the other end of a promise
    Promise(Promise),
    /// an internal poll cycle
    Poll {
        poll_index: usize,
        started: SystemTime,
    },
}

/// A request that has been written to the transport and awaits its response.
///
/// Owned exclusively by the [Correlator]; removed on a matching response or
/// on deadline expiry, never both.
pub(crate) struct PendingRequest {
    pub(crate) tx_id: Option<TxId>,
    pub(crate) function: FunctionCode,
    pub(crate) request: Pdu,
    pub(crate) sent_at: Instant,
    pub(crate) deadline: Instant,
    pub(crate) responder: Responder,
}

/// Matches asynchronous responses to pending requests and bounds the number
/// of requests in flight on the wire.
pub(crate) struct Correlator {
    mode: CorrelationMode,
    limit: usize,
    pending: VecDeque<PendingRequest>,
}

impl Correlator {
    pub(crate) fn new(mode: CorrelationMode, limit: usize) -> Self {
        Self {
            mode,
            limit,
            pending: VecDeque::new(),
        }
    }

    /// true if another request may be written to the transport
    pub(crate) fn has_capacity(&self) -> bool {
        self.pending.len() < self.limit
    }

    pub(crate) fn record(&mut self, entry: PendingRequest) {
        self.pending.push_back(entry);
    }

    /// Match an arriving response to a pending entry, removing it.
    ///
    /// Returns `None` for an unknown or already-resolved id: a protocol
    /// anomaly the caller logs and drops.
    pub(crate) fn match_response(&mut self, tx_id: Option<TxId>) -> Option<PendingRequest> {
        match self.mode {
            CorrelationMode::Fifo => self.pending.pop_front(),
            CorrelationMode::TransactionId => {
                let tx_id = tx_id?;
                let index = self
                    .pending
                    .iter()
                    .position(|entry| entry.tx_id == Some(tx_id))?;
                self.pending.remove(index)
            }
        }
    }

    /// The earliest deadline among pending entries
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.pending.iter().map(|entry| entry.deadline).min()
    }

    /// Remove and return every entry whose deadline has elapsed
    pub(crate) fn take_expired(&mut self, now: Instant) -> Vec<PendingRequest> {
        let mut expired = Vec::new();
        let mut index = 0;
        while index < self.pending.len() {
            if self.pending[index].deadline <= now {
                if let Some(entry) = self.pending.remove(index) {
                    expired.push(entry);
                }
            } else {
                index += 1;
            }
        }
        expired
    }

    /// Fail every pending entry with the given error, e.g. `Cancelled` on stop.
    ///
    /// Returns how many entries were resolved.
    pub(crate) fn cancel_all(&mut self, err: RequestError) -> usize {
        let mut count = 0;
        for entry in self.pending.drain(..) {
            count += 1;
            match entry.responder {
                Responder::Promise(promise) => promise.complete(Err(err)),
                // poll cycles have no caller to notify
                Responder::Poll { .. } => {}
            }
        }
        count
    }
}
