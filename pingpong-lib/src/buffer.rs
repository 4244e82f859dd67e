use std::{alloc::Layout, ptr::NonNull};

use crate::{
    api::LocalSlice,
    config::BUFFER_ALIGN,
    error::{PingpongError, Result},
};

/// Room for an endpoint name, an encoded `RmaInfo` or a sync token.
pub const CONTROL_MSG_SIZE: usize = 256;

/// Page-aligned heap buffer with a stable address, suitable for registration.
pub struct ChannelBuffer {
    ptr: NonNull<u8>,
    layout: Layout,
}

unsafe impl Send for ChannelBuffer {}

impl ChannelBuffer {
    pub fn filled(len: usize, fill: u8) -> Result<Self> {
        let layout = Layout::from_size_align(len.max(1), BUFFER_ALIGN)
            .map_err(|_| PingpongError::Custom("invalid buffer layout"))?;
        let ptr = unsafe { std::alloc::alloc(layout) };
        let ptr = NonNull::new(ptr).ok_or(PingpongError::Custom("No memory"))?;
        unsafe { ptr.as_ptr().write_bytes(fill, layout.size()) };
        Ok(Self { ptr, layout })
    }

    pub fn len(&self) -> usize {
        self.layout.size()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn addr(&self) -> u64 {
        self.ptr.as_ptr() as u64
    }

    pub fn as_nonnull(&self) -> NonNull<u8> {
        self.ptr
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len()) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len()) }
    }

    /// The first `len` bytes, as handed to the transport.
    pub fn slice(&self, len: usize) -> Result<LocalSlice> {
        if len > self.len() {
            return Err(PingpongError::Config(format!(
                "{len} bytes exceed buffer capacity {}",
                self.len()
            )));
        }
        Ok(unsafe { LocalSlice::new(self.ptr, len) })
    }
}

impl Drop for ChannelBuffer {
    fn drop(&mut self) {
        unsafe { std::alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

/// Buffers owned by one channel. `send` and `recv` carry benchmark payloads
/// and are the ones exposed to the peer in one-sided modes; the control pair
/// carries handshake and sync messages.
pub struct ChannelBuffers {
    pub send: ChannelBuffer,
    pub recv: ChannelBuffer,
    pub ctrl_send: ChannelBuffer,
    pub ctrl_recv: ChannelBuffer,
}

impl ChannelBuffers {
    pub fn new(index: usize, capacity: usize) -> Result<Self> {
        let index = index as u8;
        Ok(Self {
            send: ChannelBuffer::filled(capacity, b'a'.wrapping_add(index))?,
            recv: ChannelBuffer::filled(capacity, b'o'.wrapping_add(index))?,
            ctrl_send: ChannelBuffer::filled(CONTROL_MSG_SIZE, 0)?,
            ctrl_recv: ChannelBuffer::filled(CONTROL_MSG_SIZE, 0)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffers_are_aligned_and_patterned() {
        let buffers = ChannelBuffers::new(2, 8192).unwrap();
        assert_eq!(buffers.send.addr() % BUFFER_ALIGN as u64, 0);
        assert_eq!(buffers.recv.addr() % BUFFER_ALIGN as u64, 0);
        assert_eq!(buffers.send.len(), 8192);
        assert!(buffers.send.as_slice().iter().all(|&b| b == b'c'));
        assert!(buffers.recv.as_slice().iter().all(|&b| b == b'q'));
        assert_eq!(buffers.ctrl_send.len(), CONTROL_MSG_SIZE);
    }

    #[test]
    fn slice_is_bounded_by_capacity() {
        let buffer = ChannelBuffer::filled(4096, 0).unwrap();
        assert_eq!(buffer.slice(4096).unwrap().len(), 4096);
        assert!(buffer.slice(4097).is_err());
    }
}
