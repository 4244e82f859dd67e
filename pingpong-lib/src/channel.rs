use once_cell::sync::OnceCell;
use tracing::debug;

use crate::{
    abort::AbortSignal,
    api::{AtomicOp, Completion, PeerAddr, PostStatus, RmaInfo, SmallVec},
    buffer::ChannelBuffers,
    error::{PingpongError, Result},
    provider::ChannelTransport,
};

/// Completions requested from the transport per `read_cq` call.
pub const CQ_BATCH: usize = 16;

/// Size of an atomic element; atomics always operate on u64.
pub const ATOMIC_ELEM_SIZE: usize = size_of::<u64>();

/// One logical transmit and receive path of the scalable endpoint.
pub struct Channel<T> {
    index: usize,
    // Closed before the buffers it registered are freed.
    transport: T,
    buffers: ChannelBuffers,
    tag: Option<u64>,
    local_rma: Option<RmaInfo>,
    peer_addr: OnceCell<PeerAddr>,
    peer_rma: OnceCell<RmaInfo>,
    counter_seen: u64,
    outstanding: usize,
    abort: AbortSignal,
}

impl<T: ChannelTransport> Channel<T> {
    pub fn new(
        index: usize,
        transport: T,
        buffers: ChannelBuffers,
        tag: Option<u64>,
        abort: AbortSignal,
    ) -> Self {
        let local_rma = transport.local_rma();
        Self {
            index,
            transport,
            buffers,
            tag,
            local_rma,
            peer_addr: OnceCell::new(),
            peer_rma: OnceCell::new(),
            counter_seen: 0,
            outstanding: 0,
            abort,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    pub fn counter_seen(&self) -> u64 {
        self.counter_seen
    }

    pub fn local_rma(&self) -> Option<RmaInfo> {
        self.local_rma
    }

    pub fn peer_rma(&self) -> Option<RmaInfo> {
        self.peer_rma.get().copied()
    }

    pub fn peer_addr(&self) -> Option<PeerAddr> {
        self.peer_addr.get().copied()
    }

    pub fn buffers(&self) -> &ChannelBuffers {
        &self.buffers
    }

    pub fn atomic_max_count(&self, op: AtomicOp) -> Option<usize> {
        self.transport.atomic_max_count(op)
    }

    pub fn set_peer_addr(&self, addr: PeerAddr) -> Result<()> {
        self.peer_addr.set(addr).map_err(|_| {
            PingpongError::desync(format!("channel {}: peer address set twice", self.index))
        })
    }

    pub fn set_peer_rma(&self, info: RmaInfo) -> Result<()> {
        self.peer_rma.set(info).map_err(|_| {
            PingpongError::desync(format!("channel {}: peer rma info set twice", self.index))
        })
    }

    fn require_peer_addr(&self) -> Result<PeerAddr> {
        self.peer_addr().ok_or_else(|| {
            PingpongError::desync(format!("channel {}: no peer address", self.index))
        })
    }

    fn require_peer_rma(&self) -> Result<RmaInfo> {
        self.peer_rma().ok_or_else(|| {
            PingpongError::desync(format!("channel {}: no peer rma info", self.index))
        })
    }

    pub fn check_abort(&self) -> Result<()> {
        self.abort.check()
    }

    /// Posts with `post` until the transport accepts it, driving progress on
    /// backpressure.
    fn post_until_accepted<F>(&mut self, mut post: F) -> Result<()>
    where
        F: FnMut(&mut T) -> Result<PostStatus>,
    {
        loop {
            match post(&mut self.transport)? {
                PostStatus::Posted => {
                    self.outstanding += 1;
                    return Ok(());
                }
                PostStatus::TryAgain => {
                    self.abort.check()?;
                    self.transport.progress()?;
                    std::hint::spin_loop();
                }
            }
        }
    }

    pub fn issue_send(&mut self, len: usize) -> Result<()> {
        let src = self.buffers.send.slice(len)?;
        let dest = self.require_peer_addr()?;
        let tag = self.tag;
        self.post_until_accepted(|t| t.post_send(src, dest, tag))
    }

    pub fn issue_receive(&mut self, len: usize) -> Result<()> {
        let dst = self.buffers.recv.slice(len)?;
        let src = self.require_peer_addr()?;
        let tag = self.tag;
        self.post_until_accepted(|t| t.post_recv(dst, Some(src), tag))
    }

    /// Writes `len` bytes of the send buffer into the peer's receive buffer.
    pub fn issue_write(&mut self, len: usize) -> Result<()> {
        let src = self.buffers.send.slice(len)?;
        let dest = self.require_peer_addr()?;
        let remote = self.require_peer_rma()?.recv;
        self.post_until_accepted(|t| t.post_write(src, dest, remote))
    }

    /// Reads `len` bytes of the peer's send buffer into the receive buffer.
    pub fn issue_read(&mut self, len: usize) -> Result<()> {
        let dst = self.buffers.recv.slice(len)?;
        let src = self.require_peer_addr()?;
        let remote = self.require_peer_rma()?.send;
        self.post_until_accepted(|t| t.post_read(dst, src, remote))
    }

    /// Atomically writes `count` u64 elements into the peer's receive buffer.
    pub fn issue_atomic(&mut self, count: usize) -> Result<()> {
        let src = self.buffers.send.slice(count * ATOMIC_ELEM_SIZE)?;
        let dest = self.require_peer_addr()?;
        let remote = self.require_peer_rma()?.recv;
        self.post_until_accepted(|t| t.post_atomic(src, count, dest, remote, AtomicOp::Write))
    }

    /// Atomically reads `count` u64 elements of the peer's receive buffer
    /// into the local receive buffer.
    pub fn issue_fetch_atomic(&mut self, count: usize) -> Result<()> {
        let len = count * ATOMIC_ELEM_SIZE;
        let src = self.buffers.send.slice(len)?;
        let result = self.buffers.recv.slice(len)?;
        let dest = self.require_peer_addr()?;
        let remote = self.require_peer_rma()?.recv;
        self.post_until_accepted(|t| {
            t.post_fetch_atomic(src, result, count, dest, remote, AtomicOp::Read)
        })
    }

    /// Sends `payload` from the control buffer to the peer. The previous
    /// control send must have completed.
    pub fn issue_control_send(&mut self, payload: &[u8]) -> Result<()> {
        let dst = self.buffers.ctrl_send.as_mut_slice();
        if payload.len() > dst.len() {
            return Err(PingpongError::desync(format!(
                "channel {}: control message of {} bytes",
                self.index,
                payload.len()
            )));
        }
        dst[..payload.len()].copy_from_slice(payload);
        let src = self.buffers.ctrl_send.slice(payload.len())?;
        let dest = self.require_peer_addr()?;
        let tag = self.tag;
        self.post_until_accepted(|t| t.post_send(src, dest, tag))
    }

    /// Posts a control receive of up to `max_len` bytes. Without a peer
    /// address yet, the receive accepts any source.
    pub fn issue_control_receive(&mut self, max_len: usize) -> Result<()> {
        let dst = self.buffers.ctrl_recv.slice(max_len)?;
        let src = self.peer_addr();
        let tag = self.tag;
        self.post_until_accepted(|t| t.post_recv(dst, src, tag))
    }

    /// First `len` bytes of the last control message received.
    pub fn control_received(&self, len: usize) -> Result<&[u8]> {
        let bytes = self.buffers.ctrl_recv.as_slice();
        bytes.get(..len).ok_or_else(|| {
            PingpongError::desync(format!(
                "channel {}: control message of {len} bytes",
                self.index
            ))
        })
    }

    /// One non-blocking poll of this channel's completion queue.
    pub fn poll_completions(&mut self, entries: &mut [Completion]) -> Result<usize> {
        let n = self.transport.read_cq(entries)?;
        if n > self.outstanding {
            return Err(PingpongError::desync(format!(
                "channel {}: {n} completions with {} operations outstanding",
                self.index, self.outstanding
            )));
        }
        self.outstanding -= n;
        Ok(n)
    }

    pub fn progress(&mut self) -> Result<()> {
        self.transport.progress()
    }

    /// Spins on this channel's completion queue alone until `count`
    /// completions have been observed.
    pub fn wait_completions(&mut self, count: usize) -> Result<SmallVec<Completion>> {
        let mut done = SmallVec::new();
        let mut entries = [Completion::default(); CQ_BATCH];
        while done.len() < count {
            let want = (count - done.len()).min(CQ_BATCH);
            let n = self.poll_completions(&mut entries[..want])?;
            if n == 0 {
                self.abort.check()?;
                std::hint::spin_loop();
                continue;
            }
            done.extend_from_slice(&entries[..n]);
        }
        Ok(done)
    }

    /// True once the remote counter reached `last observed + increment`.
    pub fn remote_counter_reached(&mut self, increment: u64) -> Result<bool> {
        Ok(self.transport.read_counter()? >= self.counter_seen + increment)
    }

    pub fn advance_remote_counter(&mut self, increment: u64) {
        self.counter_seen += increment;
    }

    /// Spins until `increment` more remote writes have landed since the last
    /// call, then records them as seen.
    pub fn wait_remote_counter(&mut self, increment: u64) -> Result<()> {
        while !self.remote_counter_reached(increment)? {
            self.abort.check()?;
            std::hint::spin_loop();
        }
        self.advance_remote_counter(increment);
        Ok(())
    }

    /// Fails unless nothing is in flight and the completion queue is empty.
    pub fn ensure_quiescent(&mut self) -> Result<()> {
        if self.outstanding != 0 {
            return Err(PingpongError::desync(format!(
                "channel {}: {} operations still outstanding",
                self.index, self.outstanding
            )));
        }
        let mut entry = [Completion::default(); 1];
        let n = self.transport.read_cq(&mut entry)?;
        if n != 0 {
            return Err(PingpongError::desync(format!(
                "channel {}: unexpected completion {:?}",
                self.index, entry[0]
            )));
        }
        debug!(channel = self.index, counter = self.counter_seen, "channel quiescent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            Arc,
            atomic::{AtomicU64, Ordering},
        },
        thread,
        time::Duration,
    };

    use super::*;
    use crate::{
        api::CompletionKind,
        provider::MockChannelTransport,
    };

    fn channel(transport: MockChannelTransport) -> Channel<MockChannelTransport> {
        let buffers = ChannelBuffers::new(0, 4096).unwrap();
        let channel = Channel::new(0, transport, buffers, None, AbortSignal::new());
        channel.set_peer_addr(PeerAddr(1)).unwrap();
        channel
    }

    fn mock_without_rma() -> MockChannelTransport {
        let mut mock = MockChannelTransport::new();
        mock.expect_local_rma().return_const(None::<RmaInfo>);
        mock
    }

    #[test]
    fn send_retries_backpressure() {
        let mut mock = mock_without_rma();
        let mut attempts = 0;
        mock.expect_post_send().times(3).returning(move |src, dest, tag| {
            assert_eq!(src.len(), 8);
            assert_eq!(dest, PeerAddr(1));
            assert_eq!(tag, None);
            attempts += 1;
            Ok(if attempts < 3 { PostStatus::TryAgain } else { PostStatus::Posted })
        });
        mock.expect_progress().times(2).returning(|| Ok(()));
        let mut ch = channel(mock);
        ch.issue_send(8).unwrap();
        assert_eq!(ch.outstanding(), 1);
    }

    #[test]
    fn peer_address_is_write_once() {
        let ch = channel(mock_without_rma());
        assert!(matches!(
            ch.set_peer_addr(PeerAddr(2)),
            Err(PingpongError::ProtocolDesync(_))
        ));
        assert_eq!(ch.peer_addr(), Some(PeerAddr(1)));
    }

    #[test]
    fn write_without_peer_rma_is_desync() {
        let mut ch = channel(mock_without_rma());
        assert!(matches!(ch.issue_write(8), Err(PingpongError::ProtocolDesync(_))));
    }

    #[test]
    fn excess_completions_are_desync() {
        let mut mock = mock_without_rma();
        mock.expect_read_cq().returning(|entries| {
            entries[0] = Completion { kind: CompletionKind::Recv, len: 4 };
            Ok(1)
        });
        let mut ch = channel(mock);
        let mut entries = [Completion::default(); 4];
        assert!(matches!(
            ch.poll_completions(&mut entries),
            Err(PingpongError::ProtocolDesync(_))
        ));
    }

    #[test]
    fn wait_completions_never_over_reads() {
        let mut mock = mock_without_rma();
        mock.expect_post_send().times(3).returning(|_, _, _| Ok(PostStatus::Posted));
        let mut round = 0;
        mock.expect_read_cq().returning(move |entries| {
            round += 1;
            if round % 2 == 1 {
                return Ok(0);
            }
            assert!(entries.len() <= 3);
            entries[0] = Completion { kind: CompletionKind::Send, len: 8 };
            Ok(1)
        });
        let mut ch = channel(mock);
        for _ in 0..3 {
            ch.issue_send(8).unwrap();
        }
        let done = ch.wait_completions(3).unwrap();
        assert_eq!(done.len(), 3);
        assert_eq!(ch.outstanding(), 0);
    }

    #[test]
    fn remote_counter_wait_is_monotonic() {
        let counter = Arc::new(AtomicU64::new(0));
        let mut mock = mock_without_rma();
        let reader = counter.clone();
        mock.expect_read_counter()
            .returning(move || Ok(reader.load(Ordering::Acquire)));
        let mut ch = channel(mock);

        let writer = counter.clone();
        let bumper = thread::spawn(move || {
            for _ in 0..50 {
                writer.fetch_add(1, Ordering::Release);
                thread::sleep(Duration::from_micros(50));
            }
            // Coalesced arrivals.
            writer.fetch_add(10, Ordering::Release);
        });

        let mut last = ch.counter_seen();
        for _ in 0..50 {
            ch.wait_remote_counter(1).unwrap();
            assert_eq!(ch.counter_seen(), last + 1);
            assert!(counter.load(Ordering::Acquire) >= ch.counter_seen());
            last = ch.counter_seen();
        }
        ch.wait_remote_counter(10).unwrap();
        assert_eq!(ch.counter_seen(), 60);
        bumper.join().unwrap();
    }

    #[test]
    fn abort_stops_counter_wait() {
        let mut mock = mock_without_rma();
        mock.expect_read_counter().returning(|| Ok(0));
        let abort = AbortSignal::new();
        let buffers = ChannelBuffers::new(0, 4096).unwrap();
        let mut ch = Channel::new(0, mock, buffers, None, abort.clone());
        abort.raise();
        assert!(matches!(ch.wait_remote_counter(1), Err(PingpongError::Aborted)));
    }
}
