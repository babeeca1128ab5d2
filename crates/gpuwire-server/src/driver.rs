//! Embedder-facing driver abstraction.

use gpuwire_protocol::cmd::{
    BufferDescriptor, DeviceDescriptor, DeviceLostReason, FeatureBits, MapMode, TextureDescriptor,
};

/// Completion reported by the driver for an earlier token-carrying call.
///
/// Tokens are server-minted and opaque to the driver; the driver echoes them
/// back unchanged. An event carrying a token the server no longer knows is
/// silently dropped, so a slow driver completing after teardown is harmless.
#[derive(Debug)]
pub enum DriverEvent<Dev> {
    /// Finishes a [`GpuDriver::request_device`] call.
    DeviceReady {
        token: u64,
        result: Result<Dev, String>,
    },
    /// Finishes a [`GpuDriver::map_buffer`] call.
    MapComplete {
        token: u64,
        result: Result<Vec<u8>, String>,
    },
    /// Spontaneous device loss, keyed by the device's creation token.
    DeviceLost {
        token: u64,
        reason: DeviceLostReason,
        message: String,
    },
}

/// The actual GPU backend the server drives.
///
/// Creation of child objects is synchronous and infallible from the wire's
/// point of view; device creation and buffer mapping are asynchronous and
/// complete via [`poll_events`](Self::poll_events). Nothing here may block.
pub trait GpuDriver {
    type Device;
    type Buffer;
    type Texture;
    type Queue;

    fn supported_features(&self) -> FeatureBits;

    /// Begins asynchronous device creation. Completion arrives later as
    /// [`DriverEvent::DeviceReady`] carrying `token`.
    fn request_device(&mut self, token: u64, desc: &DeviceDescriptor);

    fn create_buffer(&mut self, device: &Self::Device, desc: &BufferDescriptor) -> Self::Buffer;
    fn create_texture(&mut self, device: &Self::Device, desc: &TextureDescriptor) -> Self::Texture;
    fn get_queue(&mut self, device: &Self::Device) -> Self::Queue;

    fn write_buffer(&mut self, buffer: &Self::Buffer, offset: u64, data: &[u8]);

    /// Begins an asynchronous map. Completion arrives later as
    /// [`DriverEvent::MapComplete`] carrying `token`.
    fn map_buffer(
        &mut self,
        token: u64,
        buffer: &Self::Buffer,
        mode: MapMode,
        offset: u64,
        size: u64,
    );

    /// Gives the driver a chance to make forward progress on work queued
    /// against `device`. Called once per live device after each command
    /// batch.
    fn process_device_events(&mut self, device: &Self::Device);

    /// Drains every completion that has occurred since the last poll.
    fn poll_events(&mut self) -> Vec<DriverEvent<Self::Device>>;

    fn release_device(&mut self, device: Self::Device);
    fn release_buffer(&mut self, buffer: Self::Buffer);
    fn release_texture(&mut self, texture: Self::Texture);
    fn release_queue(&mut self, queue: Self::Queue);
}
