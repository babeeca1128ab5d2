//! Client-side wire state and proxy objects.
//!
//! All shared state lives in a single `Rc<RefCell<ClientInner>>`. Proxies
//! hold a `Weak` back-reference so a proxy outliving its client degrades to
//! a no-op instead of keeping the connection alive. User callbacks are never
//! invoked while the inner borrow is held; completion values are collected
//! first and delivered after the borrow drops, so callbacks may freely call
//! back into the client.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use tracing::{debug, warn};

use gpuwire_protocol::cmd::{
    BufferDescriptor, CallbackStatus, DeviceDescriptor, DeviceLostReason, ForwardCmd, MapMode,
    ReturnCmd, TextureDescriptor, WireCommand, CMD_HEADER_LEN,
};
use gpuwire_protocol::{
    ChunkedCommandSerializer, CmdReader, CommandReassembler, CommandSink, NullSink, ObjectHandle,
    ObjectTable, ObjectType, SlotState, WireError,
};

use crate::events::{
    CallbackMode, CompleteReason, DeviceLostInfo, EventKind, EventManager, ManagerState,
    MapBufferResult, RequestDeviceResult, TrackedEvent, WaitEntry, WaitStatus,
};

/// Shared record behind every proxy object.
pub(crate) struct ProxyInner {
    pub ty: ObjectType,
    pub handle: ObjectHandle,
    pub client: Weak<RefCell<ClientInner>>,
    pub released: Cell<bool>,
    /// Future id of the device-lost watch; devices only.
    pub lost_future: Cell<Option<u64>>,
}

impl ProxyInner {
    /// Inert proxy handed out when the client is already gone. Carries the
    /// null handle and starts released, so every operation on it no-ops.
    fn dangling(ty: ObjectType, client: &Weak<RefCell<ClientInner>>) -> Rc<Self> {
        Rc::new(Self {
            ty,
            handle: ObjectHandle::NULL,
            client: client.clone(),
            released: Cell::new(true),
            lost_future: Cell::new(None),
        })
    }
}

pub(crate) struct ClientInner {
    serializer: ChunkedCommandSerializer<Box<dyn CommandSink>>,
    reassembler: CommandReassembler,
    /// Indexed by `ObjectType as usize`.
    tables: [ObjectTable<Rc<ProxyInner>>; 4],
    events: EventManager,
    connected: bool,
}

impl ClientInner {
    /// Mints an id, binds a fresh proxy into the table, and returns it.
    fn register(&mut self, ty: ObjectType, client: &Weak<RefCell<ClientInner>>) -> Rc<ProxyInner> {
        let table = &mut self.tables[ty as usize];
        let handle = table.reserve_handle();
        let proxy = Rc::new(ProxyInner {
            ty,
            handle,
            client: client.clone(),
            released: Cell::new(false),
            lost_future: Cell::new(None),
        });
        let bound = table.allocate(handle, Some(proxy.clone()), SlotState::Allocated);
        debug_assert!(bound.is_ok());
        proxy
    }

    fn dispatch_return(&mut self, frame: &[u8]) -> Result<(), WireError> {
        let opcode = u32::from_le_bytes([frame[8], frame[9], frame[10], frame[11]]);
        let mut r = CmdReader::new(&frame[CMD_HEADER_LEN..]);
        match ReturnCmd::decode(opcode, &mut r)? {
            ReturnCmd::RequestDeviceReturn {
                future_id,
                status,
                message,
            } => self
                .events
                .set_ready_request_device(future_id, RequestDeviceResult { status, message }),
            ReturnCmd::MapBufferReturn {
                future_id,
                status,
                message,
                data,
            } => self.events.set_ready_map_buffer(
                future_id,
                MapBufferResult {
                    status,
                    message,
                    data,
                },
            ),
            ReturnCmd::DeviceLost {
                device,
                reason,
                message,
            } => {
                // The device may already be released locally; a stale
                // reference in a return command is not a protocol fault.
                let future_id = self.tables[ObjectType::Device as usize]
                    .resolve(device)
                    .and_then(|proxy| proxy.lost_future.get());
                match future_id {
                    Some(future_id) => self
                        .events
                        .set_ready_device_lost(future_id, DeviceLostInfo { reason, message }),
                    None => {
                        debug!(
                            id = device.id,
                            generation = device.generation,
                            "device lost for stale or unknown device, ignoring"
                        );
                        Ok(())
                    }
                }
            }
        }
    }
}

/// Client half of a wire connection.
///
/// Owns the outgoing serializer and the incoming return-command path. Not
/// `Clone`: dropping the client disconnects it, and proxies keep only weak
/// references back.
pub struct WireClient {
    inner: Rc<RefCell<ClientInner>>,
}

impl WireClient {
    pub fn new(sink: Box<dyn CommandSink>) -> Self {
        Self {
            inner: Rc::new(RefCell::new(ClientInner {
                serializer: ChunkedCommandSerializer::new(sink),
                reassembler: CommandReassembler::new(),
                tables: [
                    ObjectTable::new(ObjectType::Device),
                    ObjectTable::new(ObjectType::Buffer),
                    ObjectTable::new(ObjectType::Texture),
                    ObjectTable::new(ObjectType::Queue),
                ],
                events: EventManager::new(),
                connected: true,
            })),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.borrow().connected
    }

    /// Requests a device. The device proxy is usable for recording commands
    /// immediately; `callback` reports whether creation actually succeeded,
    /// and `lost_callback` fires at most once when the device is lost (or at
    /// shutdown). Returns the proxy and the request's future id.
    pub fn request_device(
        &self,
        desc: &DeviceDescriptor,
        mode: CallbackMode,
        callback: impl FnOnce(CompleteReason, RequestDeviceResult) + 'static,
        lost_callback: impl FnOnce(CompleteReason, DeviceLostInfo) + 'static,
    ) -> (Device, u64) {
        let weak = Rc::downgrade(&self.inner);
        let mut c = self.inner.borrow_mut();
        let proxy = c.register(ObjectType::Device, &weak);
        let (future_id, rejected) = c.events.track_event(TrackedEvent::new(
            mode,
            Some(proxy.clone()),
            EventKind::RequestDevice {
                callback: Some(Box::new(callback)),
                result: None,
            },
        ));
        let (lost_id, lost_rejected) = c.events.track_event(TrackedEvent::new(
            CallbackMode::AllowSpontaneous,
            Some(proxy.clone()),
            EventKind::DeviceLost {
                callback: Some(Box::new(lost_callback)),
                result: None,
            },
        ));
        proxy.lost_future.set(Some(lost_id));
        if rejected.is_none() {
            c.serializer.serialize_command(&ForwardCmd::RequestDevice {
                device: proxy.handle,
                future_id,
                desc: desc.clone(),
            });
        }
        drop(c);
        for completion in [rejected, lost_rejected].into_iter().flatten() {
            completion.deliver();
        }
        (Device { inner: proxy }, future_id)
    }

    /// Feeds bytes received from the server. Whole return commands are
    /// decoded and their futures marked ready; delivery happens later via
    /// [`process_events`](Self::process_events) or
    /// [`wait_any`](Self::wait_any). A fatal error poisons the stream.
    pub fn handle_commands(&self, bytes: &[u8]) -> Result<usize, WireError> {
        let mut c = self.inner.borrow_mut();
        if !c.connected {
            warn!(len = bytes.len(), "return bytes after disconnect, dropping");
            return Ok(bytes.len());
        }
        let mut reassembler = std::mem::take(&mut c.reassembler);
        let result = reassembler.handle_commands(bytes, |frame| c.dispatch_return(frame));
        c.reassembler = reassembler;
        result
    }

    /// Delivers every ready future whose callback mode permits polling, in
    /// ascending future-id order.
    pub fn process_events(&self) {
        let completions = self.inner.borrow_mut().events.process_poll_events();
        for completion in completions {
            completion.deliver();
        }
    }

    /// Polls the given futures for completion. Only a zero timeout is
    /// supported.
    pub fn wait_any(&self, entries: &mut [WaitEntry], timeout_ns: u64) -> WaitStatus {
        let (status, completions) = self.inner.borrow_mut().events.wait_any(entries, timeout_ns);
        for completion in completions {
            completion.deliver();
        }
        status
    }

    pub fn flush(&self) -> bool {
        self.inner.borrow_mut().serializer.flush()
    }

    /// Completes every future not marked spontaneous with a shutdown reason.
    /// Spontaneous watches (device lost) stay live until disconnect.
    pub fn release_instance(&self) {
        self.drain_to(ManagerState::InstanceDropped);
    }

    /// Severs the connection. Idempotent. Pending writes are replaced by a
    /// swallowing sink, a device-lost notification is synthesized for every
    /// live device, and every remaining future completes with shutdown.
    pub fn disconnect(&self) {
        {
            let mut c = self.inner.borrow_mut();
            if !c.connected {
                return;
            }
            c.connected = false;
            c.serializer = ChunkedCommandSerializer::new(Box::new(NullSink::new()));
            let lost: Vec<u64> = c.tables[ObjectType::Device as usize]
                .iter_allocated()
                .filter_map(|(_, proxy)| proxy.lost_future.get())
                .collect();
            for future_id in lost {
                let info = DeviceLostInfo {
                    reason: DeviceLostReason::Shutdown,
                    message: "client disconnected".to_string(),
                };
                if let Err(err) = c.events.set_ready_device_lost(future_id, info) {
                    debug!(future_id, %err, "device lost watch already resolved");
                }
            }
        }
        self.drain_to(ManagerState::ClientDropped);
    }

    fn drain_to(&self, target: ManagerState) {
        // Callbacks may track further futures, so drain in batches until the
        // manager comes back empty.
        loop {
            let batch = self.inner.borrow_mut().events.transition_to(target);
            if batch.is_empty() {
                break;
            }
            for completion in batch {
                completion.deliver();
            }
        }
    }
}

impl Drop for WireClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn release_proxy(inner: &Rc<ProxyInner>) {
    if inner.released.replace(true) || inner.handle.is_null() {
        return;
    }
    let Some(client) = inner.client.upgrade() else {
        return;
    };
    let mut c = client.borrow_mut();
    c.serializer.serialize_command(&ForwardCmd::UnregisterObject {
        ty: inner.ty,
        id: inner.handle.id,
    });
    c.tables[inner.ty as usize].free(inner.handle.id);
}

#[derive(Clone)]
pub struct Device {
    inner: Rc<ProxyInner>,
}

impl Device {
    pub fn handle(&self) -> ObjectHandle {
        self.inner.handle
    }

    pub fn create_buffer(&self, desc: &BufferDescriptor) -> Buffer {
        let Some(client) = self.inner.client.upgrade() else {
            return Buffer {
                inner: ProxyInner::dangling(ObjectType::Buffer, &self.inner.client),
            };
        };
        let mut c = client.borrow_mut();
        let proxy = c.register(ObjectType::Buffer, &self.inner.client);
        c.serializer.serialize_command(&ForwardCmd::CreateBuffer {
            device_id: self.inner.handle.id,
            buffer: proxy.handle,
            desc: *desc,
        });
        Buffer { inner: proxy }
    }

    pub fn create_texture(&self, desc: &TextureDescriptor) -> Texture {
        let Some(client) = self.inner.client.upgrade() else {
            return Texture {
                inner: ProxyInner::dangling(ObjectType::Texture, &self.inner.client),
            };
        };
        let mut c = client.borrow_mut();
        let proxy = c.register(ObjectType::Texture, &self.inner.client);
        c.serializer.serialize_command(&ForwardCmd::CreateTexture {
            device_id: self.inner.handle.id,
            texture: proxy.handle,
            desc: desc.clone(),
        });
        Texture { inner: proxy }
    }

    pub fn queue(&self) -> Queue {
        let Some(client) = self.inner.client.upgrade() else {
            return Queue {
                inner: ProxyInner::dangling(ObjectType::Queue, &self.inner.client),
            };
        };
        let mut c = client.borrow_mut();
        let proxy = c.register(ObjectType::Queue, &self.inner.client);
        c.serializer.serialize_command(&ForwardCmd::GetQueue {
            device_id: self.inner.handle.id,
            queue: proxy.handle,
        });
        Queue { inner: proxy }
    }

    /// Releases the server-side object. Idempotent; the device-lost watch
    /// stays tracked until the server reports loss or the client shuts down.
    pub fn release(&self) {
        release_proxy(&self.inner);
    }
}

#[derive(Clone)]
pub struct Buffer {
    inner: Rc<ProxyInner>,
}

impl Buffer {
    pub fn handle(&self) -> ObjectHandle {
        self.inner.handle
    }

    /// Starts an asynchronous map. Returns the minted future id; the result
    /// arrives through `callback` once the server responds and the client
    /// polls (or waits on) the future.
    pub fn map_async(
        &self,
        mode: MapMode,
        offset: u64,
        size: u64,
        callback_mode: CallbackMode,
        callback: impl FnOnce(CompleteReason, MapBufferResult) + 'static,
    ) -> u64 {
        let Some(client) = self.inner.client.upgrade() else {
            // No manager left to mint an id from.
            callback(
                CompleteReason::Shutdown,
                MapBufferResult {
                    status: CallbackStatus::Shutdown,
                    message: String::new(),
                    data: Vec::new(),
                },
            );
            return 0;
        };
        let mut c = client.borrow_mut();
        let (future_id, rejected) = c.events.track_event(TrackedEvent::new(
            callback_mode,
            Some(self.inner.clone()),
            EventKind::MapBuffer {
                callback: Some(Box::new(callback)),
                result: None,
            },
        ));
        if rejected.is_none() {
            c.serializer.serialize_command(&ForwardCmd::MapBufferAsync {
                buffer_id: self.inner.handle.id,
                future_id,
                mode,
                offset,
                size,
            });
        }
        drop(c);
        if let Some(completion) = rejected {
            completion.deliver();
        }
        future_id
    }

    pub fn release(&self) {
        release_proxy(&self.inner);
    }
}

#[derive(Clone)]
pub struct Texture {
    inner: Rc<ProxyInner>,
}

impl Texture {
    pub fn handle(&self) -> ObjectHandle {
        self.inner.handle
    }

    pub fn release(&self) {
        release_proxy(&self.inner);
    }
}

#[derive(Clone)]
pub struct Queue {
    inner: Rc<ProxyInner>,
}

impl Queue {
    pub fn handle(&self) -> ObjectHandle {
        self.inner.handle
    }

    /// Uploads `data` into `buffer` at `offset`. Fire-and-forget; oversized
    /// payloads are chunked transparently by the serializer.
    pub fn write_buffer(&self, buffer: &Buffer, offset: u64, data: &[u8]) {
        let Some(client) = self.inner.client.upgrade() else {
            return;
        };
        client
            .borrow_mut()
            .serializer
            .serialize_command(&ForwardCmd::WriteBuffer {
                buffer_id: buffer.inner.handle.id,
                offset,
                data: data.to_vec(),
            });
    }

    pub fn release(&self) {
        release_proxy(&self.inner);
    }
}
