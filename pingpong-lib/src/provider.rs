use std::borrow::Cow;

use crate::{
    api::{
        AtomicOp, Completion, EndpointAddress, KeyMode, LocalSlice, PeerAddr, PostStatus,
        RemoteBufferDescriptor, RmaInfo,
    },
    buffer::ChannelBuffers,
    error::Result,
};

/// One scalable endpoint: address table, identity and the factory for the
/// per-channel transmit/receive contexts.
pub trait Provider {
    type Transport: ChannelTransport;

    fn name(&self) -> Cow<'_, str>;

    fn key_mode(&self) -> KeyMode;

    fn rx_ctx_bits(&self) -> u32;

    fn local_address(&self) -> Result<EndpointAddress>;

    /// Address of the server resolved out of band. Client only.
    fn server_address(&self) -> Result<EndpointAddress>;

    /// Inserts `addr` into the address table and returns the base peer address.
    fn insert_address(&mut self, addr: &EndpointAddress) -> Result<PeerAddr>;

    /// Creates the transmit context, receive context and completion queue of
    /// channel `index`. With `one_sided` the data buffers are also registered
    /// for remote access and a remote-write counter is bound.
    fn open_channel(
        &mut self,
        index: usize,
        buffers: &ChannelBuffers,
        one_sided: bool,
    ) -> Result<Self::Transport>;
}

/// Non-blocking primitives of a single channel. Each accepted operation
/// produces exactly one completion on this channel's queue.
#[cfg_attr(test, mockall::automock)]
pub trait ChannelTransport: Send {
    fn post_send(
        &mut self,
        src: LocalSlice,
        dest: PeerAddr,
        tag: Option<u64>,
    ) -> Result<PostStatus>;

    fn post_recv(
        &mut self,
        dst: LocalSlice,
        src: Option<PeerAddr>,
        tag: Option<u64>,
    ) -> Result<PostStatus>;

    fn post_write(
        &mut self,
        src: LocalSlice,
        dest: PeerAddr,
        remote: RemoteBufferDescriptor,
    ) -> Result<PostStatus>;

    fn post_read(
        &mut self,
        dst: LocalSlice,
        src: PeerAddr,
        remote: RemoteBufferDescriptor,
    ) -> Result<PostStatus>;

    fn post_atomic(
        &mut self,
        src: LocalSlice,
        count: usize,
        dest: PeerAddr,
        remote: RemoteBufferDescriptor,
        op: AtomicOp,
    ) -> Result<PostStatus>;

    fn post_fetch_atomic(
        &mut self,
        src: LocalSlice,
        result: LocalSlice,
        count: usize,
        dest: PeerAddr,
        remote: RemoteBufferDescriptor,
        op: AtomicOp,
    ) -> Result<PostStatus>;

    /// Reads up to `entries.len()` completions. `Ok(0)` means nothing is ready.
    fn read_cq(&mut self, entries: &mut [Completion]) -> Result<usize>;

    /// Drives the provider without consuming any completion.
    fn progress(&mut self) -> Result<()>;

    /// Number of remote writes that have landed in this channel's buffers.
    fn read_counter(&mut self) -> Result<u64>;

    /// Largest element count one atomic `op` may carry, `None` if unsupported.
    fn atomic_max_count(&self, op: AtomicOp) -> Option<usize>;

    /// Descriptors of this channel's registered buffers.
    fn local_rma(&self) -> Option<RmaInfo>;
}
