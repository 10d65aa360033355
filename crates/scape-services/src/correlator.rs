//! Request correlator: matches device responses to in-flight calls.
//!
//! Each call gets a process-unique id (a counter followed by wall-clock
//! milliseconds). The pending entry is registered before the datagram goes
//! out, so a fast response cannot race past it. An unanswered call is sent
//! once more after the timeout; a second timeout resolves to
//! [`Reply::TimedOut`] rather than an error.
//!
//! Binary-family devices answer queries with telemetry instead of responses,
//! so the correlator also keeps one-shot waiters keyed by event type.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use scape_core::message::{DeviceRequest, DeviceResponse, Returns};
use scape_core::ScapeError;
use serde_json::{Map, Value};
use tokio::sync::oneshot;

use crate::device::DeviceKey;
use crate::registry::DeviceRegistry;
use crate::transport::{send_logged, DatagramSink};

/// Text a timed-out call resolves to when shown to a client.
pub const TIMEOUT_SENTINEL: &str = "Response timed out.";

/// Client id used for calls the server makes on its own behalf.
pub const SERVER_CLIENT: &str = "server";

/// How a call resolved.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// No answer was expected.
    Void,
    Value(Value),
    /// Both attempts went unanswered.
    TimedOut,
}

impl Reply {
    pub fn is_timed_out(&self) -> bool {
        matches!(self, Reply::TimedOut)
    }

    /// JSON form handed to callers; a timeout becomes the sentinel string.
    pub fn into_value(self) -> Value {
        match self {
            Reply::Void => Value::Null,
            Reply::Value(value) => value,
            Reply::TimedOut => Value::String(TIMEOUT_SENTINEL.to_string()),
        }
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Void => Ok(()),
            Reply::Value(Value::String(s)) => f.write_str(s),
            Reply::Value(value) => write!(f, "{value}"),
            Reply::TimedOut => f.write_str(TIMEOUT_SENTINEL),
        }
    }
}

struct Pending {
    device: DeviceKey,
    function: String,
    multi: bool,
    resolver: oneshot::Sender<Result<Value, ScapeError>>,
}

/// A request built by [`Correlator::prepare`], not yet sent.
#[derive(Debug, Clone)]
pub struct PreparedCall {
    id: String,
    device: DeviceKey,
    function: String,
    datagram: Vec<u8>,
    expects_reply: bool,
    multi: bool,
}

impl PreparedCall {
    pub fn request_id(&self) -> &str {
        &self.id
    }

    pub fn device(&self) -> &DeviceKey {
        &self.device
    }
}

/// Removes a call's pending entry when its future goes away.
struct PendingEntry {
    pending: Arc<DashMap<String, Pending>>,
    id: String,
}

impl Drop for PendingEntry {
    fn drop(&mut self) {
        if self.pending.remove(&self.id).is_some() {
            tracing::debug!(request = %self.id, "pending call abandoned");
        }
    }
}

type EventWaiters = Arc<DashMap<(DeviceKey, String), Vec<oneshot::Sender<Map<String, Value>>>>>;

/// One registered event waiter. Dropping it prunes closed senders from its
/// slot.
struct EventWaiter {
    waiters: EventWaiters,
    slot: (DeviceKey, String),
    rx: oneshot::Receiver<Map<String, Value>>,
}

impl Drop for EventWaiter {
    fn drop(&mut self) {
        self.rx.close();
        self.waiters.remove_if_mut(&self.slot, |_, waiters| {
            waiters.retain(|tx| !tx.is_closed());
            waiters.is_empty()
        });
    }
}

#[derive(Clone)]
pub struct Correlator {
    pending: Arc<DashMap<String, Pending>>,
    event_waiters: EventWaiters,
    counter: Arc<AtomicU64>,
    timeout: Duration,
}

impl Correlator {
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: Arc::new(DashMap::new()),
            event_waiters: Arc::new(DashMap::new()),
            counter: Arc::new(AtomicU64::new(0)),
            timeout,
        }
    }

    /// Counter followed by wall-clock milliseconds.
    pub fn next_request_id(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        format!("{n}{millis}")
    }

    /// Calls awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Event slots with at least one waiter.
    pub fn waiting_events(&self) -> usize {
        self.event_waiters.len()
    }

    /// Send a request to a JSON-family device and wait for its answer.
    ///
    /// `client_id` defaults to `"server"`. Void and event returns resolve
    /// immediately with [`Reply::Void`]. The device address is looked up
    /// again for the retry, so a device that moved still gets it.
    pub async fn call(
        &self,
        registry: &DeviceRegistry,
        sink: &dyn DatagramSink,
        device: &DeviceKey,
        function: &str,
        client_id: Option<&str>,
        params: Vec<Value>,
        returns: &Returns,
    ) -> Result<Reply, ScapeError> {
        let call = self.prepare(device, function, client_id, params, returns)?;
        self.dispatch(registry, sink, call).await
    }

    /// Build a request without sending it. The id is known from here on, so
    /// the caller can hand it to [`Correlator::cancel`] while
    /// [`Correlator::dispatch`] is in flight.
    pub fn prepare(
        &self,
        device: &DeviceKey,
        function: &str,
        client_id: Option<&str>,
        params: Vec<Value>,
        returns: &Returns,
    ) -> Result<PreparedCall, ScapeError> {
        let request = DeviceRequest {
            id: self.next_request_id(),
            service: device.service.clone(),
            device: device.id.clone(),
            function: function.to_string(),
            params,
            client_id: client_id.unwrap_or(SERVER_CLIENT).to_string(),
        };
        let datagram = serde_json::to_vec(&request)
            .map_err(|e| ScapeError::MalformedCommand(e.to_string()))?;
        Ok(PreparedCall {
            id: request.id,
            device: device.clone(),
            function: request.function,
            datagram,
            expects_reply: returns.expects_reply(),
            multi: returns.is_multi(),
        })
    }

    /// Send a prepared request and wait for its answer. Dropping the future
    /// removes the pending entry.
    pub async fn dispatch(
        &self,
        registry: &DeviceRegistry,
        sink: &dyn DatagramSink,
        call: PreparedCall,
    ) -> Result<Reply, ScapeError> {
        let device = &call.device;
        let function = call.function.as_str();

        if !call.expects_reply {
            let addr = registry.address(&device.service, &device.id)?;
            send_logged(sink, &call.datagram, addr);
            return Ok(Reply::Void);
        }

        let _entry = PendingEntry {
            pending: self.pending.clone(),
            id: call.id.clone(),
        };
        for attempt in 1..=2 {
            let addr = registry.address(&device.service, &device.id)?;
            let (tx, rx) = oneshot::channel();
            self.pending.insert(
                call.id.clone(),
                Pending {
                    device: device.clone(),
                    function: function.to_string(),
                    multi: call.multi,
                    resolver: tx,
                },
            );
            send_logged(sink, &call.datagram, addr);

            match tokio::time::timeout(self.timeout, rx).await {
                Ok(Ok(result)) => return result.map(Reply::Value),
                Ok(Err(_)) => return Err(ScapeError::Cancelled(call.id)),
                Err(_) => {
                    self.pending.remove(&call.id);
                    tracing::debug!(device = %device, function, attempt, "request timed out");
                }
            }
        }

        tracing::info!(device = %device, function, "request timed out twice, giving up");
        Ok(Reply::TimedOut)
    }

    /// Device a pending request was sent to.
    pub fn pending_device(&self, request_id: &str) -> Option<DeviceKey> {
        self.pending.get(request_id).map(|pending| pending.device.clone())
    }

    /// Deliver a response to its waiting call. Returns false for unknown or
    /// already-resolved ids, and for responses that carry no values.
    pub fn resolve(&self, response: &DeviceResponse) -> bool {
        let Some(values) = response.values() else {
            tracing::trace!(request = %response.request, "response without values");
            return false;
        };
        let Some((_, pending)) = self.pending.remove(&response.request) else {
            tracing::trace!(request = %response.request, "response for unknown request");
            return false;
        };

        let value = if pending.multi {
            Value::Array(values)
        } else {
            values.into_iter().next().unwrap_or(Value::Null)
        };
        tracing::debug!(device = %pending.device, function = %pending.function, "response matched");
        // the caller may have gone away
        let _ = pending.resolver.send(Ok(value));
        true
    }

    /// Reject a pending call with `Cancelled`.
    pub fn cancel(&self, request_id: &str) -> bool {
        match self.pending.remove(request_id) {
            Some((id, pending)) => {
                let _ = pending.resolver.send(Err(ScapeError::Cancelled(id)));
                true
            }
            None => false,
        }
    }

    /// Cancel every pending call and event waiter for a device.
    pub fn cancel_device(&self, device: &DeviceKey) -> usize {
        let ids: Vec<String> = self
            .pending
            .iter()
            .filter(|entry| entry.device == *device)
            .map(|entry| entry.key().clone())
            .collect();
        let cancelled = ids.iter().filter(|id| self.cancel(id)).count();
        self.event_waiters.retain(|(key, _), _| key != device);
        cancelled
    }

    // ── Event waiters ─────────────────────────────────────────────────────────

    /// Register for the next `event` from `device`, run `send`, then wait up
    /// to `timeout`. `None` when nothing arrived in time.
    pub async fn expect_event(
        &self,
        device: &DeviceKey,
        event: &str,
        timeout: Duration,
        send: impl FnOnce(),
    ) -> Option<Map<String, Value>> {
        let slot = (device.clone(), event.to_string());
        let (tx, rx) = oneshot::channel();
        self.event_waiters.entry(slot.clone()).or_default().push(tx);
        let mut waiter = EventWaiter {
            waiters: self.event_waiters.clone(),
            slot,
            rx,
        };
        send();

        let result = tokio::time::timeout(timeout, &mut waiter.rx).await;
        match result {
            Ok(Ok(content)) => Some(content),
            _ => None,
        }
    }

    /// Wake every waiter for this event. Returns how many were waiting.
    pub fn notify_event(&self, device: &DeviceKey, event: &str, content: &Map<String, Value>) -> usize {
        let Some((_, waiters)) = self
            .event_waiters
            .remove(&(device.clone(), event.to_string()))
        else {
            return 0;
        };
        waiters
            .into_iter()
            .filter(|tx| !tx.is_closed())
            .map(|tx| tx.send(content.clone()))
            .filter(Result::is_ok)
            .count()
    }
}
