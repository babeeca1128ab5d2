//! Future tracking for asynchronous wire operations.
//!
//! The manager is a pure state machine: it never runs user callbacks itself.
//! Every method that can complete futures returns the completions as values,
//! and the caller delivers them after releasing its borrow of the client
//! state. That keeps re-entrant callbacks (a map callback that immediately
//! maps another buffer, say) from tripping over a live `RefCell` borrow.

use std::collections::BTreeMap;
use std::rc::Rc;

use gpuwire_protocol::cmd::{CallbackStatus, DeviceLostReason};
use gpuwire_protocol::WireError;

use crate::client::ProxyInner;

/// When a tracked future's callback is allowed to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackMode {
    /// Only from inside `wait_any` on this future's id.
    WaitAnyOnly,
    /// From `wait_any` or an explicit `process_events` poll.
    AllowProcessEvents,
    /// Also at shutdown-style boundaries that drain pending futures.
    AllowSpontaneous,
}

/// Lifecycle of the manager itself. Transitions are monotone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ManagerState {
    Nominal,
    InstanceDropped,
    ClientDropped,
}

/// Why a future's callback is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompleteReason {
    /// The operation produced a result.
    Ready,
    /// The manager was torn down before (or instead of) a result arriving.
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestDeviceResult {
    pub status: CallbackStatus,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapBufferResult {
    pub status: CallbackStatus,
    pub message: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceLostInfo {
    pub reason: DeviceLostReason,
    pub message: String,
}

/// One slot in a `wait_any` call. `completed` is an out-parameter.
#[derive(Debug, Clone, Copy)]
pub struct WaitEntry {
    pub future_id: u64,
    pub completed: bool,
}

impl WaitEntry {
    pub fn new(future_id: u64) -> Self {
        Self { future_id, completed: false }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    /// At least one entry completed.
    Success,
    /// No entry was ready.
    TimedOut,
    /// A non-zero timeout was requested; only immediate polls are supported.
    UnsupportedTimeout,
}

pub(crate) type RequestDeviceCallback = Box<dyn FnOnce(CompleteReason, RequestDeviceResult)>;
pub(crate) type MapBufferCallback = Box<dyn FnOnce(CompleteReason, MapBufferResult)>;
pub(crate) type DeviceLostCallback = Box<dyn FnOnce(CompleteReason, DeviceLostInfo)>;

pub(crate) enum EventKind {
    RequestDevice {
        callback: Option<RequestDeviceCallback>,
        result: Option<RequestDeviceResult>,
    },
    MapBuffer {
        callback: Option<MapBufferCallback>,
        result: Option<MapBufferResult>,
    },
    DeviceLost {
        callback: Option<DeviceLostCallback>,
        result: Option<DeviceLostInfo>,
    },
}

impl EventKind {
    fn name(&self) -> &'static str {
        match self {
            EventKind::RequestDevice { .. } => "request_device",
            EventKind::MapBuffer { .. } => "map_buffer",
            EventKind::DeviceLost { .. } => "device_lost",
        }
    }
}

pub(crate) struct TrackedEvent {
    pub mode: CallbackMode,
    pub ready: bool,
    /// Strong reference that keeps the subject proxy alive until the
    /// callback has run, even if the caller dropped its own handle.
    pub retained: Option<Rc<ProxyInner>>,
    pub kind: EventKind,
}

impl TrackedEvent {
    pub fn new(mode: CallbackMode, retained: Option<Rc<ProxyInner>>, kind: EventKind) -> Self {
        Self { mode, ready: false, retained, kind }
    }
}

/// A future removed from the manager, ready to run its callback.
pub(crate) struct Completion {
    pub future_id: u64,
    pub reason: CompleteReason,
    event: TrackedEvent,
}

impl Completion {
    /// Runs the user callback. Must be called with no client borrow held.
    pub fn deliver(self) {
        let reason = self.reason;
        tracing::trace!(
            future_id = self.future_id,
            ?reason,
            kind = self.event.kind.name(),
            "completing future"
        );
        match self.event.kind {
            EventKind::RequestDevice { callback, result } => {
                if let Some(cb) = callback {
                    cb(reason, result.unwrap_or(RequestDeviceResult {
                        status: CallbackStatus::Shutdown,
                        message: String::new(),
                    }));
                }
            }
            EventKind::MapBuffer { callback, result } => {
                if let Some(cb) = callback {
                    cb(reason, result.unwrap_or(MapBufferResult {
                        status: CallbackStatus::Shutdown,
                        message: String::new(),
                        data: Vec::new(),
                    }));
                }
            }
            EventKind::DeviceLost { callback, result } => {
                if let Some(cb) = callback {
                    cb(reason, result.unwrap_or(DeviceLostInfo {
                        reason: DeviceLostReason::Shutdown,
                        message: String::new(),
                    }));
                }
            }
        }
        // `retained` drops here, after the callback ran.
    }
}

pub(crate) struct EventManager {
    state: ManagerState,
    next_future_id: u64,
    events: BTreeMap<u64, TrackedEvent>,
}

impl Default for EventManager {
    fn default() -> Self {
        Self::new()
    }
}

impl EventManager {
    pub fn new() -> Self {
        Self {
            state: ManagerState::Nominal,
            next_future_id: 1,
            events: BTreeMap::new(),
        }
    }

    pub fn state(&self) -> ManagerState {
        self.state
    }

    pub fn tracked_count(&self) -> usize {
        self.events.len()
    }

    /// Registers a future and mints its id. Ids are never reused, even for
    /// futures rejected because the manager is already shutting down; a
    /// rejected future comes back as an immediate shutdown completion the
    /// caller must deliver.
    pub fn track_event(&mut self, event: TrackedEvent) -> (u64, Option<Completion>) {
        let future_id = self.next_future_id;
        self.next_future_id += 1;
        let rejected = match self.state {
            ManagerState::Nominal => false,
            ManagerState::InstanceDropped => event.mode != CallbackMode::AllowSpontaneous,
            ManagerState::ClientDropped => true,
        };
        if rejected {
            tracing::debug!(future_id, kind = event.kind.name(), "future rejected at shutdown");
            return (
                future_id,
                Some(Completion { future_id, reason: CompleteReason::Shutdown, event }),
            );
        }
        self.events.insert(future_id, event);
        (future_id, None)
    }

    pub fn set_ready_request_device(
        &mut self,
        future_id: u64,
        result: RequestDeviceResult,
    ) -> Result<(), WireError> {
        let event = self.lookup(future_id)?;
        match &mut event.kind {
            EventKind::RequestDevice { result: slot, .. } => *slot = Some(result),
            _ => return Err(WireError::FutureKindMismatch(future_id)),
        }
        event.ready = true;
        Ok(())
    }

    pub fn set_ready_map_buffer(
        &mut self,
        future_id: u64,
        result: MapBufferResult,
    ) -> Result<(), WireError> {
        let event = self.lookup(future_id)?;
        match &mut event.kind {
            EventKind::MapBuffer { result: slot, .. } => *slot = Some(result),
            _ => return Err(WireError::FutureKindMismatch(future_id)),
        }
        event.ready = true;
        Ok(())
    }

    pub fn set_ready_device_lost(
        &mut self,
        future_id: u64,
        result: DeviceLostInfo,
    ) -> Result<(), WireError> {
        let event = self.lookup(future_id)?;
        match &mut event.kind {
            EventKind::DeviceLost { result: slot, .. } => *slot = Some(result),
            _ => return Err(WireError::FutureKindMismatch(future_id)),
        }
        event.ready = true;
        Ok(())
    }

    fn lookup(&mut self, future_id: u64) -> Result<&mut TrackedEvent, WireError> {
        self.events
            .get_mut(&future_id)
            .ok_or(WireError::UnknownFuture(future_id))
    }

    /// Removes every ready future whose mode permits poll delivery, in
    /// ascending future-id order.
    pub fn process_poll_events(&mut self) -> Vec<Completion> {
        let ids: Vec<u64> = self
            .events
            .iter()
            .filter(|(_, ev)| ev.ready && ev.mode != CallbackMode::WaitAnyOnly)
            .map(|(id, _)| *id)
            .collect();
        self.take_ready(&ids)
    }

    /// Polls the given futures. Only a zero timeout is supported; a non-zero
    /// timeout returns `UnsupportedTimeout` without touching the entries.
    pub fn wait_any(
        &mut self,
        entries: &mut [WaitEntry],
        timeout_ns: u64,
    ) -> (WaitStatus, Vec<Completion>) {
        if timeout_ns != 0 {
            return (WaitStatus::UnsupportedTimeout, Vec::new());
        }
        let mut ready = Vec::new();
        let mut any = false;
        for entry in entries.iter_mut() {
            match self.events.get(&entry.future_id) {
                None => {
                    // Unknown means already completed (or never tracked);
                    // either way there is nothing left to wait for.
                    entry.completed = true;
                    any = true;
                }
                Some(ev) if ev.ready => {
                    entry.completed = true;
                    any = true;
                    ready.push(entry.future_id);
                }
                Some(_) => {}
            }
        }
        ready.sort_unstable();
        let completions = self.take_ready(&ready);
        let status = if any { WaitStatus::Success } else { WaitStatus::TimedOut };
        (status, completions)
    }

    /// Advances the manager state and removes one batch of futures that must
    /// complete at the new boundary. Callbacks delivered from the batch may
    /// track further futures, so callers loop until the batch is empty.
    pub fn transition_to(&mut self, target: ManagerState) -> Vec<Completion> {
        if target > self.state {
            tracing::debug!(from = ?self.state, to = ?target, "event manager shutdown transition");
            self.state = target;
        }
        let drain_all = self.state == ManagerState::ClientDropped;
        if self.state == ManagerState::Nominal {
            return Vec::new();
        }
        let ids: Vec<u64> = self
            .events
            .iter()
            .filter(|(_, ev)| drain_all || ev.mode != CallbackMode::AllowSpontaneous)
            .map(|(id, _)| *id)
            .collect();
        ids.into_iter()
            .filter_map(|id| {
                self.events.remove(&id).map(|event| Completion {
                    future_id: id,
                    reason: CompleteReason::Shutdown,
                    event,
                })
            })
            .collect()
    }

    fn take_ready(&mut self, ids: &[u64]) -> Vec<Completion> {
        ids.iter()
            .filter_map(|id| {
                self.events.remove(id).map(|event| Completion {
                    future_id: *id,
                    reason: CompleteReason::Ready,
                    event,
                })
            })
            .collect()
    }
}
