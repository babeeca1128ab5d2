//! Server dispatch against a scripted mock driver.

use std::cell::RefCell;
use std::rc::Rc;

use gpuwire_protocol::cmd::{
    BufferDescriptor, BufferUsage, CallbackStatus, DeviceDescriptor, DeviceLostReason, FeatureBits,
    ForwardCmd, MapMode, ReturnCmd, TextureDescriptor, WireCommand, CMD_HEADER_LEN,
};
use gpuwire_protocol::{
    ChunkedCommandSerializer, CmdReader, CommandReassembler, ObjectHandle, ObjectType, VecSink,
    WireError,
};
use gpuwire_server::{DriverEvent, GpuDriver, WireServer};

#[derive(Debug, PartialEq, Eq)]
struct MockDevice(u32);
#[derive(Debug, PartialEq, Eq)]
struct MockBuffer(u32);
#[derive(Debug, PartialEq, Eq)]
struct MockTexture(u32);
#[derive(Debug, PartialEq, Eq)]
struct MockQueue(u32);

/// Driver that records every call and only completes asynchronous work when
/// the test scripts an event.
struct MockDriver {
    supported: FeatureBits,
    next_native: u32,
    log: Rc<RefCell<Vec<String>>>,
    /// Tokens handed to `request_device`, in order.
    device_tokens: Vec<u64>,
    /// Tokens handed to `map_buffer`, in order.
    map_tokens: Vec<u64>,
    /// Events to surface on the next `poll_events`.
    events: Vec<DriverEvent<MockDevice>>,
}

impl MockDriver {
    fn new(supported: FeatureBits) -> (Self, Rc<RefCell<Vec<String>>>) {
        let log = Rc::new(RefCell::new(Vec::new()));
        (
            Self {
                supported,
                next_native: 100,
                log: log.clone(),
                device_tokens: Vec::new(),
                map_tokens: Vec::new(),
                events: Vec::new(),
            },
            log,
        )
    }

    fn mint_native(&mut self) -> u32 {
        let n = self.next_native;
        self.next_native += 1;
        n
    }

    fn record(&self, entry: String) {
        self.log.borrow_mut().push(entry);
    }
}

impl GpuDriver for MockDriver {
    type Device = MockDevice;
    type Buffer = MockBuffer;
    type Texture = MockTexture;
    type Queue = MockQueue;

    fn supported_features(&self) -> FeatureBits {
        self.supported
    }

    fn request_device(&mut self, token: u64, desc: &DeviceDescriptor) {
        self.record(format!("request_device({token}, {:?})", desc.label));
        self.device_tokens.push(token);
    }

    fn create_buffer(&mut self, device: &MockDevice, desc: &BufferDescriptor) -> MockBuffer {
        let n = self.mint_native();
        self.record(format!("create_buffer(dev {}, size {}) -> {n}", device.0, desc.size));
        MockBuffer(n)
    }

    fn create_texture(&mut self, device: &MockDevice, desc: &TextureDescriptor) -> MockTexture {
        let n = self.mint_native();
        self.record(format!(
            "create_texture(dev {}, {}x{}) -> {n}",
            device.0, desc.width, desc.height
        ));
        MockTexture(n)
    }

    fn get_queue(&mut self, device: &MockDevice) -> MockQueue {
        let n = self.mint_native();
        self.record(format!("get_queue(dev {}) -> {n}", device.0));
        MockQueue(n)
    }

    fn write_buffer(&mut self, buffer: &MockBuffer, offset: u64, data: &[u8]) {
        self.record(format!(
            "write_buffer(buf {}, off {offset}, len {})",
            buffer.0,
            data.len()
        ));
    }

    fn map_buffer(
        &mut self,
        token: u64,
        buffer: &MockBuffer,
        mode: MapMode,
        offset: u64,
        size: u64,
    ) {
        self.record(format!("map_buffer({token}, buf {}, {mode:?}, {offset}, {size})", buffer.0));
        self.map_tokens.push(token);
    }

    fn process_device_events(&mut self, device: &MockDevice) {
        self.record(format!("process_device_events(dev {})", device.0));
    }

    fn poll_events(&mut self) -> Vec<DriverEvent<MockDevice>> {
        std::mem::take(&mut self.events)
    }

    fn release_device(&mut self, device: MockDevice) {
        self.record(format!("release_device({})", device.0));
    }

    fn release_buffer(&mut self, buffer: MockBuffer) {
        self.record(format!("release_buffer({})", buffer.0));
    }

    fn release_texture(&mut self, texture: MockTexture) {
        self.record(format!("release_texture({})", texture.0));
    }

    fn release_queue(&mut self, queue: MockQueue) {
        self.record(format!("release_queue({})", queue.0));
    }
}

fn server(supported: FeatureBits) -> (WireServer<MockDriver, VecSink>, Rc<RefCell<Vec<String>>>) {
    let (driver, log) = MockDriver::new(supported);
    (WireServer::new(driver, VecSink::new(1 << 20)), log)
}

fn forward_frame(cmd: &ForwardCmd) -> Vec<u8> {
    let mut ser = ChunkedCommandSerializer::new(VecSink::new(usize::MAX));
    ser.serialize_command(cmd);
    ser.sink_mut().take_written()
}

/// Decodes every return command the server has written so far.
fn drain_returns(server: &mut WireServer<MockDriver, VecSink>) -> Vec<ReturnCmd> {
    let bytes = server.sink_mut().take_written();
    let mut out = Vec::new();
    let mut re = CommandReassembler::new();
    re.handle_commands(&bytes, |frame| {
        let opcode = u32::from_le_bytes([frame[8], frame[9], frame[10], frame[11]]);
        let mut r = CmdReader::new(&frame[CMD_HEADER_LEN..]);
        out.push(ReturnCmd::decode(opcode, &mut r)?);
        Ok(())
    })
    .unwrap();
    out
}

fn handle(id: u32, generation: u32) -> ObjectHandle {
    ObjectHandle { id, generation }
}

fn request_device_frame(id: u32, future_id: u64, features: FeatureBits) -> Vec<u8> {
    forward_frame(&ForwardCmd::RequestDevice {
        device: handle(id, 0),
        future_id,
        desc: DeviceDescriptor {
            label: "mock".to_string(),
            required_features: features,
        },
    })
}

#[test]
fn request_device_completes_through_driver_events() {
    let (mut server, log) = server(FeatureBits::all());
    server
        .handle_commands(&request_device_frame(1, 10, FeatureBits::SHADER_F16))
        .unwrap();
    // Creation is pending; nothing has been returned yet.
    assert!(drain_returns(&mut server).is_empty());
    let token = server.driver().device_tokens[0];

    server.driver_mut().events.push(DriverEvent::DeviceReady {
        token,
        result: Ok(MockDevice(7)),
    });
    server.pump_events();
    assert_eq!(
        drain_returns(&mut server),
        vec![ReturnCmd::RequestDeviceReturn {
            future_id: 10,
            status: CallbackStatus::Success,
            message: String::new(),
        }]
    );

    // The live device now gets pumped after every batch.
    server.pump_events();
    assert!(log.borrow().iter().any(|e| e == "process_device_events(dev 7)"));
}

#[test]
fn unsupported_features_fail_without_touching_the_driver() {
    let (mut server, log) = server(FeatureBits::TIMESTAMP_QUERY);
    server
        .handle_commands(&request_device_frame(1, 10, FeatureBits::SHADER_F16))
        .unwrap();

    let returns = drain_returns(&mut server);
    assert_eq!(returns.len(), 1);
    match &returns[0] {
        ReturnCmd::RequestDeviceReturn {
            future_id,
            status,
            message,
        } => {
            assert_eq!(*future_id, 10);
            assert_eq!(*status, CallbackStatus::Error);
            assert!(message.contains("SHADER_F16"), "{message}");
        }
        other => panic!("unexpected return {other:?}"),
    }
    assert!(log.borrow().is_empty());

    // The reservation was unwound; the id is reusable at the next
    // generation.
    server
        .handle_commands(&forward_frame(&ForwardCmd::RequestDevice {
            device: handle(1, 1),
            future_id: 11,
            desc: DeviceDescriptor {
                label: "retry".to_string(),
                required_features: FeatureBits::TIMESTAMP_QUERY,
            },
        }))
        .unwrap();
    assert_eq!(server.driver().device_tokens.len(), 1);
}

#[test]
fn release_racing_creation_unwinds_cleanly() {
    let (mut server, log) = server(FeatureBits::all());
    server
        .handle_commands(&request_device_frame(1, 10, FeatureBits::empty()))
        .unwrap();
    let token = server.driver().device_tokens[0];

    // The client gives up on the device before the driver finishes.
    server
        .handle_commands(&forward_frame(&ForwardCmd::UnregisterObject {
            ty: ObjectType::Device,
            id: 1,
        }))
        .unwrap();

    server.driver_mut().events.push(DriverEvent::DeviceReady {
        token,
        result: Ok(MockDevice(7)),
    });
    server.pump_events();

    // The late arrival is handed straight back to the driver and the
    // client's future still resolves.
    assert!(log.borrow().iter().any(|e| e == "release_device(7)"));
    assert_eq!(
        drain_returns(&mut server),
        vec![ReturnCmd::RequestDeviceReturn {
            future_id: 10,
            status: CallbackStatus::Error,
            message: "device released before creation finished".to_string(),
        }]
    );
}

#[test]
fn failed_creation_frees_the_reservation() {
    let (mut server, _log) = server(FeatureBits::all());
    server
        .handle_commands(&request_device_frame(1, 10, FeatureBits::empty()))
        .unwrap();
    let token = server.driver().device_tokens[0];
    server.driver_mut().events.push(DriverEvent::DeviceReady {
        token,
        result: Err("no adapter".to_string()),
    });
    server.pump_events();
    assert_eq!(
        drain_returns(&mut server),
        vec![ReturnCmd::RequestDeviceReturn {
            future_id: 10,
            status: CallbackStatus::Error,
            message: "no adapter".to_string(),
        }]
    );

    // Reusing the id requires a bumped generation.
    let stale = server.handle_commands(&request_device_frame(1, 11, FeatureBits::empty()));
    assert!(matches!(stale, Err(WireError::StaleGeneration { .. })));
}

#[test]
fn unknown_completion_token_is_a_noop() {
    let (mut server, _log) = server(FeatureBits::all());
    server.driver_mut().events.push(DriverEvent::MapComplete {
        token: 99,
        result: Ok(vec![1, 2, 3]),
    });
    server.pump_events();
    assert!(drain_returns(&mut server).is_empty());
}

#[test]
fn map_buffer_roundtrip_through_the_driver() {
    let (mut server, _log) = server(FeatureBits::all());
    server
        .handle_commands(&request_device_frame(1, 10, FeatureBits::empty()))
        .unwrap();
    let token = server.driver().device_tokens[0];
    server.driver_mut().events.push(DriverEvent::DeviceReady {
        token,
        result: Ok(MockDevice(7)),
    });
    server.pump_events();
    drain_returns(&mut server);

    server
        .handle_commands(&forward_frame(&ForwardCmd::CreateBuffer {
            device_id: 1,
            buffer: handle(1, 0),
            desc: BufferDescriptor {
                size: 256,
                usage: BufferUsage::MAP_READ,
            },
        }))
        .unwrap();
    server
        .handle_commands(&forward_frame(&ForwardCmd::MapBufferAsync {
            buffer_id: 1,
            future_id: 20,
            mode: MapMode::Read,
            offset: 0,
            size: 4,
        }))
        .unwrap();
    let map_token = server.driver().map_tokens[0];
    server.driver_mut().events.push(DriverEvent::MapComplete {
        token: map_token,
        result: Ok(vec![9, 8, 7, 6]),
    });
    server.pump_events();
    assert_eq!(
        drain_returns(&mut server),
        vec![ReturnCmd::MapBufferReturn {
            future_id: 20,
            status: CallbackStatus::Success,
            message: String::new(),
            data: vec![9, 8, 7, 6],
        }]
    );
}

#[test]
fn device_lost_event_routes_through_the_creation_token() {
    let (mut server, _log) = server(FeatureBits::all());
    server
        .handle_commands(&request_device_frame(1, 10, FeatureBits::empty()))
        .unwrap();
    let token = server.driver().device_tokens[0];
    server.driver_mut().events.push(DriverEvent::DeviceReady {
        token,
        result: Ok(MockDevice(7)),
    });
    server.pump_events();
    drain_returns(&mut server);

    server.driver_mut().events.push(DriverEvent::DeviceLost {
        token,
        reason: DeviceLostReason::Destroyed,
        message: "surprise removal".to_string(),
    });
    server.pump_events();
    assert_eq!(
        drain_returns(&mut server),
        vec![ReturnCmd::DeviceLost {
            device: handle(1, 0),
            reason: DeviceLostReason::Destroyed,
            message: "surprise removal".to_string(),
        }]
    );

    // A second loss for the same token has no watch left to route to.
    server.driver_mut().events.push(DriverEvent::DeviceLost {
        token,
        reason: DeviceLostReason::Destroyed,
        message: "again".to_string(),
    });
    server.pump_events();
    assert!(drain_returns(&mut server).is_empty());
}

#[test]
fn commands_against_unknown_objects_are_fatal() {
    let (mut server, _log) = server(FeatureBits::all());
    let err = server
        .handle_commands(&forward_frame(&ForwardCmd::CreateBuffer {
            device_id: 5,
            buffer: handle(1, 0),
            desc: BufferDescriptor {
                size: 16,
                usage: BufferUsage::COPY_DST,
            },
        }))
        .unwrap_err();
    assert!(matches!(err, WireError::IdOutOfRange { .. }));

    // The stream is poisoned from here on.
    assert!(matches!(
        server.handle_commands(&forward_frame(&ForwardCmd::UnregisterObject {
            ty: ObjectType::Buffer,
            id: 1,
        })),
        Err(WireError::Poisoned)
    ));
}

#[test]
fn inject_texture_checks_the_owner_generation() {
    let (mut server, _log) = server(FeatureBits::all());
    server
        .handle_commands(&request_device_frame(1, 10, FeatureBits::empty()))
        .unwrap();
    let token = server.driver().device_tokens[0];
    server.driver_mut().events.push(DriverEvent::DeviceReady {
        token,
        result: Ok(MockDevice(7)),
    });
    server.pump_events();

    // Stale owner generation: refused.
    assert!(matches!(
        server.inject_texture(handle(1, 0), handle(1, 5), MockTexture(50)),
        Err(WireError::GenerationMismatch { .. })
    ));
    // Matching generation: the texture is now addressable.
    server
        .inject_texture(handle(1, 0), handle(1, 0), MockTexture(51))
        .unwrap();
}

#[test]
fn teardown_releases_devices_before_their_children() {
    let (mut server, log) = server(FeatureBits::all());
    server
        .handle_commands(&request_device_frame(1, 10, FeatureBits::empty()))
        .unwrap();
    let token = server.driver().device_tokens[0];
    server.driver_mut().events.push(DriverEvent::DeviceReady {
        token,
        result: Ok(MockDevice(7)),
    });
    server.pump_events();
    server
        .handle_commands(&forward_frame(&ForwardCmd::CreateBuffer {
            device_id: 1,
            buffer: handle(1, 0),
            desc: BufferDescriptor {
                size: 64,
                usage: BufferUsage::VERTEX,
            },
        }))
        .unwrap();
    server
        .handle_commands(&forward_frame(&ForwardCmd::GetQueue {
            device_id: 1,
            queue: handle(1, 0),
        }))
        .unwrap();

    drop(server);
    let entries = log.borrow();
    let pos = |needle: &str| {
        entries
            .iter()
            .position(|e| e.starts_with(needle))
            .unwrap_or_else(|| panic!("missing {needle} in {entries:?}"))
    };
    assert!(pos("release_device") < pos("release_queue"));
    assert!(pos("release_device") < pos("release_buffer"));
}

#[test]
fn write_buffer_reaches_the_driver_with_its_payload() {
    let (mut server, log) = server(FeatureBits::all());
    server
        .handle_commands(&request_device_frame(1, 10, FeatureBits::empty()))
        .unwrap();
    let token = server.driver().device_tokens[0];
    server.driver_mut().events.push(DriverEvent::DeviceReady {
        token,
        result: Ok(MockDevice(7)),
    });
    server.pump_events();
    server
        .handle_commands(&forward_frame(&ForwardCmd::CreateBuffer {
            device_id: 1,
            buffer: handle(1, 0),
            desc: BufferDescriptor {
                size: 4096,
                usage: BufferUsage::COPY_DST,
            },
        }))
        .unwrap();
    server
        .handle_commands(&forward_frame(&ForwardCmd::WriteBuffer {
            buffer_id: 1,
            offset: 128,
            data: vec![0xA5; 1000],
        }))
        .unwrap();
    assert!(log
        .borrow()
        .iter()
        .any(|e| e == "write_buffer(buf 100, off 128, len 1000)"));
}
