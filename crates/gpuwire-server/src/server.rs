//! Server-side dispatch core.

use std::collections::HashMap;

use tracing::{debug, warn};

use gpuwire_protocol::cmd::{CallbackStatus, ForwardCmd, ReturnCmd, WireCommand, CMD_HEADER_LEN};
use gpuwire_protocol::{
    ChunkedCommandSerializer, CmdReader, CommandReassembler, CommandSink, ObjectHandle,
    ObjectTable, ObjectType, SlotState, WireError,
};

use crate::driver::{DriverEvent, GpuDriver};

/// Server-minted bookkeeping for one in-flight driver operation. Each entry
/// is consumed exactly once by the matching completion event.
enum PendingOp {
    RequestDevice { device_id: u32, future_id: u64 },
    MapBuffer { future_id: u64 },
}

/// Decodes forward commands and drives a [`GpuDriver`], sending return
/// commands back through the supplied sink.
///
/// Ids arriving in forward commands are the client's: the server's tables
/// mirror the client's allocations. Output-position ids are bound `Reserved`
/// before the driver is called, so any re-entrant observation of the tables
/// sees the id as taken.
pub struct WireServer<D: GpuDriver, S: CommandSink> {
    driver: D,
    serializer: ChunkedCommandSerializer<S>,
    reassembler: CommandReassembler,
    devices: ObjectTable<D::Device>,
    buffers: ObjectTable<D::Buffer>,
    textures: ObjectTable<D::Texture>,
    queues: ObjectTable<D::Queue>,
    pending: HashMap<u64, PendingOp>,
    /// Creation token -> device id, for routing spontaneous device loss.
    watches: HashMap<u64, u32>,
    next_token: u64,
}

impl<D: GpuDriver, S: CommandSink> WireServer<D, S> {
    pub fn new(driver: D, sink: S) -> Self {
        Self {
            driver,
            serializer: ChunkedCommandSerializer::new(sink),
            reassembler: CommandReassembler::new(),
            devices: ObjectTable::new(ObjectType::Device),
            buffers: ObjectTable::new(ObjectType::Buffer),
            textures: ObjectTable::new(ObjectType::Texture),
            queues: ObjectTable::new(ObjectType::Queue),
            pending: HashMap::new(),
            watches: HashMap::new(),
            next_token: 1,
        }
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }

    pub fn sink_mut(&mut self) -> &mut S {
        self.serializer.sink_mut()
    }

    /// Feeds bytes received from the client. After the batch is decoded the
    /// driver is pumped and any resulting return commands are flushed. A
    /// fatal error poisons the stream.
    pub fn handle_commands(&mut self, bytes: &[u8]) -> Result<usize, WireError> {
        let mut reassembler = std::mem::take(&mut self.reassembler);
        let result = reassembler.handle_commands(bytes, |frame| self.dispatch_forward(frame));
        self.reassembler = reassembler;
        let consumed = result?;
        self.pump_events();
        Ok(consumed)
    }

    /// Pumps driver progress and sends completions. Also useful without
    /// incoming traffic, e.g. to pick up a spontaneous device loss.
    pub fn pump_events(&mut self) {
        for (_, device) in self.devices.iter_allocated() {
            self.driver.process_device_events(device);
        }
        for event in self.driver.poll_events() {
            self.handle_driver_event(event);
        }
        if !self.serializer.flush() {
            warn!("transport flush failed");
        }
    }

    /// Registers an externally created texture under `handle`, owned by the
    /// device named by `owner`. The owner reference carries the generation
    /// observed at sharing time; a mismatch means the device was since
    /// replaced and the injection is refused.
    pub fn inject_texture(
        &mut self,
        handle: ObjectHandle,
        owner: ObjectHandle,
        texture: D::Texture,
    ) -> Result<(), WireError> {
        let current = self.devices.generation(owner.id)?;
        if self.devices.state(owner.id)? != SlotState::Allocated || current != owner.generation {
            return Err(WireError::GenerationMismatch {
                ty: ObjectType::Device,
                id: owner.id,
                generation: owner.generation,
                current,
            });
        }
        self.textures.allocate(handle, Some(texture), SlotState::Allocated)
    }

    fn mint_token(&mut self) -> u64 {
        let token = self.next_token;
        self.next_token += 1;
        token
    }

    fn send_return(&mut self, cmd: &ReturnCmd) {
        self.serializer.serialize_command(cmd);
    }

    fn dispatch_forward(&mut self, frame: &[u8]) -> Result<(), WireError> {
        let opcode = u32::from_le_bytes([frame[8], frame[9], frame[10], frame[11]]);
        let mut r = CmdReader::new(&frame[CMD_HEADER_LEN..]);
        match ForwardCmd::decode(opcode, &mut r)? {
            ForwardCmd::RequestDevice {
                device,
                future_id,
                desc,
            } => {
                self.devices.allocate(device, None, SlotState::Reserved)?;
                let unsupported = desc.required_features - self.driver.supported_features();
                if !unsupported.is_empty() {
                    // Recoverable: the reservation is unwound and the client
                    // hears about it through the normal return path.
                    self.devices.free(device.id);
                    self.send_return(&ReturnCmd::RequestDeviceReturn {
                        future_id,
                        status: CallbackStatus::Error,
                        message: format!("unsupported features requested: {unsupported:?}"),
                    });
                    return Ok(());
                }
                let token = self.mint_token();
                self.pending.insert(
                    token,
                    PendingOp::RequestDevice {
                        device_id: device.id,
                        future_id,
                    },
                );
                self.watches.insert(token, device.id);
                self.driver.request_device(token, &desc);
                Ok(())
            }
            ForwardCmd::CreateBuffer {
                device_id,
                buffer,
                desc,
            } => {
                let device = self.devices.get_known(device_id)?;
                self.buffers.allocate(buffer, None, SlotState::Reserved)?;
                let native = self.driver.create_buffer(device, &desc);
                self.buffers.fill_reservation(buffer.id, native)
            }
            ForwardCmd::CreateTexture {
                device_id,
                texture,
                desc,
            } => {
                let device = self.devices.get_known(device_id)?;
                self.textures.allocate(texture, None, SlotState::Reserved)?;
                let native = self.driver.create_texture(device, &desc);
                self.textures.fill_reservation(texture.id, native)
            }
            ForwardCmd::GetQueue { device_id, queue } => {
                let device = self.devices.get_known(device_id)?;
                self.queues.allocate(queue, None, SlotState::Reserved)?;
                let native = self.driver.get_queue(device);
                self.queues.fill_reservation(queue.id, native)
            }
            ForwardCmd::WriteBuffer {
                buffer_id,
                offset,
                data,
            } => {
                let buffer = self.buffers.get_known(buffer_id)?;
                self.driver.write_buffer(buffer, offset, &data);
                Ok(())
            }
            ForwardCmd::MapBufferAsync {
                buffer_id,
                future_id,
                mode,
                offset,
                size,
            } => {
                // Token minting borrows all of self, so it cannot overlap
                // the buffer borrow below.
                let token = self.mint_token();
                let buffer = self.buffers.get_known(buffer_id)?;
                self.pending.insert(token, PendingOp::MapBuffer { future_id });
                self.driver.map_buffer(token, buffer, mode, offset, size);
                Ok(())
            }
            ForwardCmd::UnregisterObject { ty, id } => {
                self.unregister(ty, id);
                Ok(())
            }
        }
    }

    /// Releases one object. An id that is already free is ignored: the
    /// client's release may race a server-side loss notification.
    fn unregister(&mut self, ty: ObjectType, id: u32) {
        match ty {
            ObjectType::Device => {
                self.watches.retain(|_, device_id| *device_id != id);
                if let Some(native) = self.devices.free(id) {
                    self.driver.release_device(native);
                }
            }
            ObjectType::Buffer => {
                if let Some(native) = self.buffers.free(id) {
                    self.driver.release_buffer(native);
                }
            }
            ObjectType::Texture => {
                if let Some(native) = self.textures.free(id) {
                    self.driver.release_texture(native);
                }
            }
            ObjectType::Queue => {
                if let Some(native) = self.queues.free(id) {
                    self.driver.release_queue(native);
                }
            }
        }
    }

    fn handle_driver_event(&mut self, event: DriverEvent<D::Device>) {
        match event {
            DriverEvent::DeviceReady { token, result } => {
                let Some(op) = self.pending.remove(&token) else {
                    debug!(token, "device ready for unknown token, dropping");
                    return;
                };
                let PendingOp::RequestDevice {
                    device_id,
                    future_id,
                } = op
                else {
                    warn!(token, "device ready for a non-device token, dropping");
                    return;
                };
                match result {
                    Ok(native) => {
                        if self.devices.state(device_id) == Ok(SlotState::Reserved) {
                            if self.devices.fill_reservation(device_id, native).is_ok() {
                                self.send_return(&ReturnCmd::RequestDeviceReturn {
                                    future_id,
                                    status: CallbackStatus::Success,
                                    message: String::new(),
                                });
                            }
                        } else {
                            // The client released the id while creation was
                            // still in flight.
                            debug!(device_id, "device arrived after release");
                            self.watches.remove(&token);
                            self.driver.release_device(native);
                            self.send_return(&ReturnCmd::RequestDeviceReturn {
                                future_id,
                                status: CallbackStatus::Error,
                                message: "device released before creation finished".to_string(),
                            });
                        }
                    }
                    Err(message) => {
                        self.watches.remove(&token);
                        self.devices.free(device_id);
                        self.send_return(&ReturnCmd::RequestDeviceReturn {
                            future_id,
                            status: CallbackStatus::Error,
                            message,
                        });
                    }
                }
            }
            DriverEvent::MapComplete { token, result } => {
                let Some(op) = self.pending.remove(&token) else {
                    debug!(token, "map completion for unknown token, dropping");
                    return;
                };
                let PendingOp::MapBuffer { future_id } = op else {
                    warn!(token, "map completion for a non-map token, dropping");
                    return;
                };
                let cmd = match result {
                    Ok(data) => ReturnCmd::MapBufferReturn {
                        future_id,
                        status: CallbackStatus::Success,
                        message: String::new(),
                        data,
                    },
                    Err(message) => ReturnCmd::MapBufferReturn {
                        future_id,
                        status: CallbackStatus::Error,
                        message,
                        data: Vec::new(),
                    },
                };
                self.send_return(&cmd);
            }
            DriverEvent::DeviceLost {
                token,
                reason,
                message,
            } => {
                let Some(device_id) = self.watches.remove(&token) else {
                    debug!(token, "device loss for unknown token, dropping");
                    return;
                };
                let Ok(generation) = self.devices.generation(device_id) else {
                    return;
                };
                if self.devices.state(device_id) != Ok(SlotState::Allocated) {
                    return;
                }
                self.send_return(&ReturnCmd::DeviceLost {
                    device: ObjectHandle {
                        id: device_id,
                        generation,
                    },
                    reason,
                    message,
                });
            }
        }
    }
}

impl<D: GpuDriver, S: CommandSink> Drop for WireServer<D, S> {
    /// Devices go back to the driver first: device destruction implicitly
    /// invalidates its children, after which releasing them is a pure
    /// bookkeeping operation on the driver side.
    fn drop(&mut self) {
        self.pending.clear();
        self.watches.clear();
        for device in self.devices.acquire_all_handles() {
            self.driver.release_device(device);
        }
        for queue in self.queues.acquire_all_handles() {
            self.driver.release_queue(queue);
        }
        for texture in self.textures.acquire_all_handles() {
            self.driver.release_texture(texture);
        }
        for buffer in self.buffers.acquire_all_handles() {
            self.driver.release_buffer(buffer);
        }
    }
}
