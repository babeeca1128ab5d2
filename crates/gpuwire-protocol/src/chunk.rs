//! Chunked command framing and serialization.
//!
//! The transport may deliver partial writes, and a single logical command
//! can itself be split across several transport allocations when it exceeds
//! the transport's maximum allocation size. [`CommandReassembler`] buffers
//! partial frames so the decode path only ever sees whole, contiguous
//! commands; [`ChunkedCommandSerializer`] produces correctly framed bytes on
//! the sending side, splitting oversized commands across multiple
//! allocations.

use tracing::{debug, warn};

use crate::cmd::{align_up, framed_size, WireCommand, CMD_HEADER_LEN};
use crate::codec::CmdWriter;
use crate::error::WireError;

/// Alignment of extension blobs within a frame, and of frames themselves.
pub const EXT_ALIGN: usize = 8;

/// Embedder-supplied transport write half.
///
/// `get_cmd_space` is never called with a size above
/// `max_allocation_size()`; returning `None` signals an allocation failure.
/// None of these calls may block from the wire layer's point of view.
pub trait CommandSink {
    fn max_allocation_size(&self) -> usize;
    fn get_cmd_space(&mut self, size: usize) -> Option<&mut [u8]>;
    fn flush(&mut self) -> bool;
    /// Notification hook for recoverable serialization failures.
    fn on_serialize_error(&mut self) {}
}

impl CommandSink for Box<dyn CommandSink> {
    fn max_allocation_size(&self) -> usize {
        (**self).max_allocation_size()
    }
    fn get_cmd_space(&mut self, size: usize) -> Option<&mut [u8]> {
        (**self).get_cmd_space(size)
    }
    fn flush(&mut self) -> bool {
        (**self).flush()
    }
    fn on_serialize_error(&mut self) {
        (**self).on_serialize_error()
    }
}

/// Sink that swallows everything. Installed in place of the live transport
/// after a disconnect so further serialization is a silent no-op.
#[derive(Debug, Default)]
pub struct NullSink {
    scratch: Vec<u8>,
}

impl NullSink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CommandSink for NullSink {
    fn max_allocation_size(&self) -> usize {
        usize::MAX
    }

    fn get_cmd_space(&mut self, size: usize) -> Option<&mut [u8]> {
        self.scratch.clear();
        self.scratch.resize(size, 0);
        Some(&mut self.scratch[..])
    }

    fn flush(&mut self) -> bool {
        true
    }
}

/// In-memory sink collecting written frames, used by tests and the
/// loopback transport.
#[derive(Debug)]
pub struct VecSink {
    max_allocation_size: usize,
    written: Vec<u8>,
    staged: usize,
    pub cmd_space_calls: usize,
    pub fail_allocations: bool,
}

impl VecSink {
    pub fn new(max_allocation_size: usize) -> Self {
        Self {
            max_allocation_size,
            written: Vec::new(),
            staged: 0,
            cmd_space_calls: 0,
            fail_allocations: false,
        }
    }

    /// Drains everything written so far.
    pub fn take_written(&mut self) -> Vec<u8> {
        self.staged = 0;
        std::mem::take(&mut self.written)
    }

    pub fn written(&self) -> &[u8] {
        &self.written
    }
}

impl CommandSink for VecSink {
    fn max_allocation_size(&self) -> usize {
        self.max_allocation_size
    }

    fn get_cmd_space(&mut self, size: usize) -> Option<&mut [u8]> {
        self.cmd_space_calls += 1;
        if self.fail_allocations {
            return None;
        }
        debug_assert!(size <= self.max_allocation_size);
        let start = self.written.len();
        self.written.resize(start + size, 0);
        self.staged = start;
        Some(&mut self.written[start..])
    }

    fn flush(&mut self) -> bool {
        true
    }
}

/// Serializes typed commands into transport allocations, splitting a
/// command across several writes when it exceeds the transport's maximum
/// allocation size.
pub struct ChunkedCommandSerializer<S: CommandSink> {
    sink: S,
}

impl<S: CommandSink> ChunkedCommandSerializer<S> {
    pub fn new(sink: S) -> Self {
        Self { sink }
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    pub fn flush(&mut self) -> bool {
        self.sink.flush()
    }

    /// Frames and writes one command plus its extension blobs.
    ///
    /// Failure here is a recoverable, transport-level condition: the sink is
    /// notified through `on_serialize_error` and the command is abandoned.
    /// Bytes already handed to the transport on the oversized path are not
    /// un-sent.
    pub fn serialize_command<C: WireCommand>(&mut self, cmd: &C) {
        let total = framed_size(cmd);
        let max = self.sink.max_allocation_size();

        if total <= max {
            let Some(space) = self.sink.get_cmd_space(total) else {
                warn!(size = total, "transport refused command allocation");
                self.sink.on_serialize_error();
                return;
            };
            write_frame(space, cmd, total);
            return;
        }

        // Oversized: build the whole frame locally, then copy it out in
        // max-allocation-sized pieces.
        debug!(size = total, max, "serializing oversized command in chunks");
        let mut scratch = vec![0u8; total];
        write_frame(&mut scratch, cmd, total);

        let mut offset = 0;
        while offset < total {
            let piece = (total - offset).min(max);
            let Some(space) = self.sink.get_cmd_space(piece) else {
                return;
            };
            space[..piece].copy_from_slice(&scratch[offset..offset + piece]);
            offset += piece;
        }
    }
}

fn write_frame<C: WireCommand>(space: &mut [u8], cmd: &C, total: usize) {
    debug_assert!(space.len() >= total);
    space[..total].fill(0);
    space[0..8].copy_from_slice(&(total as u64).to_le_bytes());
    space[8..12].copy_from_slice(&cmd.opcode().to_le_bytes());

    let payload_len = cmd.payload_size();
    let mut w = CmdWriter::new(&mut space[CMD_HEADER_LEN..CMD_HEADER_LEN + payload_len]);
    cmd.serialize_payload(&mut w);
    debug_assert_eq!(w.position(), payload_len);

    let mut ext_off = align_up(CMD_HEADER_LEN + payload_len, EXT_ALIGN);
    for ext in cmd.extensions() {
        space[ext_off..ext_off + ext.len()].copy_from_slice(ext);
        ext_off = align_up(ext_off + ext.len(), EXT_ALIGN);
    }
    debug_assert_eq!(ext_off, total);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReassemblyState {
    Idle,
    Buffering,
    Error,
}

/// Reassembles whole command frames out of arbitrarily fragmented transport
/// reads.
///
/// The internal buffer is retained (capacity kept, length reset) across
/// commands so steady-state buffering does not reallocate per command.
#[derive(Debug)]
pub struct CommandReassembler {
    state: ReassemblyState,
    /// Partial frame, header included, while `Buffering`.
    buf: Vec<u8>,
    /// Declared total frame size once the header has been seen; 0 while the
    /// header itself is still incomplete.
    target: usize,
}

impl Default for CommandReassembler {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandReassembler {
    pub fn new() -> Self {
        Self {
            state: ReassemblyState::Idle,
            buf: Vec::new(),
            target: 0,
        }
    }

    /// Feeds transport bytes through, invoking `dispatch` once per fully
    /// assembled frame. Consumes either the entire input (returning its
    /// length) or nothing (returning the fatal error); a fatal error
    /// poisons the reassembler permanently.
    pub fn handle_commands<F>(&mut self, bytes: &[u8], mut dispatch: F) -> Result<usize, WireError>
    where
        F: FnMut(&[u8]) -> Result<(), WireError>,
    {
        if self.state == ReassemblyState::Error {
            return Err(WireError::Poisoned);
        }
        match self.feed(bytes, &mut dispatch) {
            Ok(()) => Ok(bytes.len()),
            Err(err) => {
                self.state = ReassemblyState::Error;
                self.buf = Vec::new();
                self.target = 0;
                Err(err)
            }
        }
    }

    fn feed<F>(&mut self, mut bytes: &[u8], dispatch: &mut F) -> Result<(), WireError>
    where
        F: FnMut(&[u8]) -> Result<(), WireError>,
    {
        while !bytes.is_empty() {
            if self.state == ReassemblyState::Buffering {
                bytes = self.continue_buffering(bytes, dispatch)?;
                continue;
            }

            // Idle: the header may not be fully visible yet.
            if bytes.len() < CMD_HEADER_LEN {
                self.start_buffering(bytes, 0);
                return Ok(());
            }

            let declared = declared_size(bytes)?;
            if bytes.len() >= declared {
                // Passthrough: the whole command is visible in the caller's
                // buffer, decode in place with no copy.
                dispatch(&bytes[..declared])?;
                bytes = &bytes[declared..];
            } else {
                self.start_buffering(bytes, declared);
                return Ok(());
            }
        }
        Ok(())
    }

    /// Begins buffering a partial frame. `target` is the declared total
    /// frame size when the header was already visible, or 0 while the
    /// header itself is still incomplete.
    fn start_buffering(&mut self, bytes: &[u8], target: usize) {
        debug_assert!(self.buf.is_empty());
        debug_assert!(target == 0 || bytes.len() >= CMD_HEADER_LEN);
        self.state = ReassemblyState::Buffering;
        self.target = target;
        if target > bytes.len() {
            self.buf.reserve(target);
        }
        self.buf.extend_from_slice(bytes);
    }

    /// Appends to the partial frame, dispatching it once complete. Returns
    /// the unconsumed remainder of `bytes`.
    fn continue_buffering<'a, F>(
        &mut self,
        mut bytes: &'a [u8],
        dispatch: &mut F,
    ) -> Result<&'a [u8], WireError>
    where
        F: FnMut(&[u8]) -> Result<(), WireError>,
    {
        if self.target == 0 {
            // Still waiting for the rest of the header; with the header
            // visible the target is recorded at buffering start.
            debug_assert!(self.buf.len() < CMD_HEADER_LEN);
            let want = CMD_HEADER_LEN - self.buf.len();
            let take = want.min(bytes.len());
            self.buf.extend_from_slice(&bytes[..take]);
            bytes = &bytes[take..];
            if self.buf.len() < CMD_HEADER_LEN {
                debug_assert!(bytes.is_empty());
                return Ok(bytes);
            }
            self.target = declared_size(&self.buf)?;
            self.buf.reserve(self.target - self.buf.len());
        }

        let want = self.target - self.buf.len();
        let take = want.min(bytes.len());
        self.buf.extend_from_slice(&bytes[..take]);
        bytes = &bytes[take..];

        if self.buf.len() == self.target {
            // Hand the reassembled frame to the normal decode path, then
            // reset for the next command, keeping the buffer's capacity.
            let frame = std::mem::take(&mut self.buf);
            let result = dispatch(&frame);
            self.buf = frame;
            self.buf.clear();
            self.target = 0;
            self.state = ReassemblyState::Idle;
            result?;
        }
        Ok(bytes)
    }
}

fn declared_size(header: &[u8]) -> Result<usize, WireError> {
    debug_assert!(header.len() >= CMD_HEADER_LEN);
    let declared = u64::from_le_bytes(header[0..8].try_into().unwrap());
    let declared_usize =
        usize::try_from(declared).map_err(|_| WireError::UnrepresentableSize(declared))?;
    if declared_usize < CMD_HEADER_LEN || declared_usize % EXT_ALIGN != 0 {
        return Err(WireError::RuntCommand(declared));
    }
    Ok(declared_usize)
}
