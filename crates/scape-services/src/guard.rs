//! Rate/replay guard: admission control for client commands.
//!
//! Two independent checks must both pass:
//!   Replay window: once a sequence number has been accepted, the next one
//!                   must be greater and at most `SEQ_WINDOW` ahead.
//!   Rate limits:   per-client and per-device counters over one-second
//!                   windows. A client that exceeds its limit is refused for
//!                   `1 + client_penalty` ticks, whether or not it keeps sending.
//!
//! Counters are reset by [`RateState::tick`], driven once a second by the
//! registry's housekeeping tick. A limit of 0 means unlimited.

use scape_core::ScapeError;

use crate::device::{RateState, SecurityState};
use crate::registry::DeviceRegistry;

/// How far ahead of the last accepted sequence number a command may be.
pub const SEQ_WINDOW: i64 = 100;

/// Upper bound for the configurable client penalty, in ticks.
pub const MAX_PENALTY: i64 = 60;

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accepted,
    StaleSequence,
    Penalized,
    ClientRateExceeded,
    TotalRateExceeded,
}

impl Verdict {
    pub fn is_accepted(self) -> bool {
        matches!(self, Verdict::Accepted)
    }
}

/// Run the admission algorithm against a security state, updating it.
pub fn admit(state: &mut SecurityState, client_id: &str, seq: i64) -> Verdict {
    if state.last_seq >= 0
        && (seq <= state.last_seq || seq > state.last_seq.saturating_add(SEQ_WINDOW))
    {
        return Verdict::StaleSequence;
    }

    let rate = &mut state.rate;
    let client = rate.clients.entry(client_id.to_string()).or_default();

    if client.penalty > 0 {
        return Verdict::Penalized;
    }

    if rate.client_rate > 0 && client.count + 1 > rate.client_rate {
        client.penalty = 1 + rate.client_penalty;
        return Verdict::ClientRateExceeded;
    }

    if rate.total_rate > 0 && rate.total_count + 1 > rate.total_rate {
        return Verdict::TotalRateExceeded;
    }

    rate.total_count += 1;
    client.count += 1;
    if seq > -1 {
        state.last_seq = seq;
    }
    Verdict::Accepted
}

impl RateState {
    /// One-second housekeeping: counters to zero, penalties down by one.
    /// Clients with nothing left to remember are dropped.
    pub fn tick(&mut self) {
        self.total_count = 0;
        self.clients.retain(|_, client| {
            client.count = 0;
            client.penalty = client.penalty.saturating_sub(1);
            client.penalty > 0
        });
    }

    /// Negative rates become 0; the penalty is clamped to [0, 60].
    pub fn set_client_rate(&mut self, rate: i64, penalty: i64) {
        self.client_rate = rate.clamp(0, u32::MAX as i64) as u32;
        self.client_penalty = penalty.clamp(0, MAX_PENALTY) as u32;
    }

    pub fn set_total_rate(&mut self, rate: i64) {
        self.total_rate = rate.clamp(0, u32::MAX as i64) as u32;
    }

    /// Remove all limits and forget all clients.
    pub fn reset(&mut self) {
        *self = RateState::default();
    }
}

/// Admission checks against devices in a registry. Linked devices are
/// checked against the state they link to.
#[derive(Clone)]
pub struct Guard {
    registry: DeviceRegistry,
}

impl Guard {
    pub fn new(registry: DeviceRegistry) -> Self {
        Self { registry }
    }

    /// Whether `client_id` may issue a command with sequence number `seq`
    /// (−1 for none) to the device.
    pub fn accepts(
        &self,
        service: &str,
        id: &str,
        client_id: &str,
        seq: i64,
    ) -> Result<bool, ScapeError> {
        let verdict = self
            .registry
            .with_security(service, id, |state| admit(state, client_id, seq))?;
        if !verdict.is_accepted() {
            tracing::debug!(service, id, client = client_id, seq, ?verdict, "command refused");
        }
        Ok(verdict.is_accepted())
    }
}
