//! Completion observation for the channels owned by one execution context.

use tracing::info;

use crate::{
    api::{Completion, SmallVec},
    channel::{CQ_BATCH, Channel},
    error::{PingpongError, Result},
    provider::ChannelTransport,
};

/// Bytes of the token exchanged by [`ChannelGroup::synchronize`].
pub const SYNC_TOKEN_LEN: usize = 4;

/// How a context waits on one of its channels while the others may also
/// have operations in flight.
pub trait ProgressDiscipline {
    fn wait_completions<T: ChannelTransport>(
        &self,
        channels: &mut [Channel<T>],
        target: usize,
        count: usize,
    ) -> Result<SmallVec<Completion>>;

    fn wait_remote_counter<T: ChannelTransport>(
        &self,
        channels: &mut [Channel<T>],
        target: usize,
        increment: u64,
    ) -> Result<()>;
}

/// Polls only the target channel. For contexts that own a single channel.
#[derive(Debug, Clone, Copy, Default)]
pub struct Dedicated;

impl ProgressDiscipline for Dedicated {
    fn wait_completions<T: ChannelTransport>(
        &self,
        channels: &mut [Channel<T>],
        target: usize,
        count: usize,
    ) -> Result<SmallVec<Completion>> {
        channels[target].wait_completions(count)
    }

    fn wait_remote_counter<T: ChannelTransport>(
        &self,
        channels: &mut [Channel<T>],
        target: usize,
        increment: u64,
    ) -> Result<()> {
        channels[target].wait_remote_counter(increment)
    }
}

/// Round-robins over every channel each iteration. The target's queue is
/// read; the others are only progressed so their completions stay queued for
/// their own waits.
#[derive(Debug, Clone, Copy, Default)]
pub struct SharedProgress;

impl ProgressDiscipline for SharedProgress {
    fn wait_completions<T: ChannelTransport>(
        &self,
        channels: &mut [Channel<T>],
        target: usize,
        count: usize,
    ) -> Result<SmallVec<Completion>> {
        let mut done = SmallVec::new();
        let mut entries = [Completion::default(); CQ_BATCH];
        while done.len() < count {
            for (pos, channel) in channels.iter_mut().enumerate() {
                if pos == target {
                    let want = (count - done.len()).min(CQ_BATCH);
                    let n = channel.poll_completions(&mut entries[..want])?;
                    done.extend_from_slice(&entries[..n]);
                } else {
                    channel.progress()?;
                }
            }
            if done.len() < count {
                channels[target].check_abort()?;
                std::hint::spin_loop();
            }
        }
        Ok(done)
    }

    fn wait_remote_counter<T: ChannelTransport>(
        &self,
        channels: &mut [Channel<T>],
        target: usize,
        increment: u64,
    ) -> Result<()> {
        loop {
            let mut reached = false;
            for (pos, channel) in channels.iter_mut().enumerate() {
                if pos == target {
                    reached = channel.remote_counter_reached(increment)?;
                } else {
                    channel.progress()?;
                }
            }
            if reached {
                break;
            }
            channels[target].check_abort()?;
            std::hint::spin_loop();
        }
        channels[target].advance_remote_counter(increment);
        Ok(())
    }
}

/// The channels driven by one execution context and the discipline used to
/// wait on them. Positions are local to the group; channel indices are global.
pub struct ChannelGroup<T, P> {
    channels: Vec<Channel<T>>,
    discipline: P,
}

impl<T: ChannelTransport, P: ProgressDiscipline> ChannelGroup<T, P> {
    pub fn new(channels: Vec<Channel<T>>, discipline: P) -> Self {
        Self { channels, discipline }
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn channels(&self) -> &[Channel<T>] {
        &self.channels
    }

    pub fn channel(&self, pos: usize) -> &Channel<T> {
        &self.channels[pos]
    }

    pub fn channel_mut(&mut self, pos: usize) -> &mut Channel<T> {
        &mut self.channels[pos]
    }

    pub fn channels_mut(&mut self) -> &mut [Channel<T>] {
        &mut self.channels
    }

    pub fn into_channels(self) -> Vec<Channel<T>> {
        self.channels
    }

    /// True if this group drives channel 0, the timing reference.
    pub fn owns_reference(&self) -> bool {
        self.channels.iter().any(|c| c.index() == 0)
    }

    pub fn wait(&mut self, pos: usize, count: usize) -> Result<SmallVec<Completion>> {
        self.discipline.wait_completions(&mut self.channels, pos, count)
    }

    pub fn wait_remote_counter(&mut self, pos: usize, increment: u64) -> Result<()> {
        self.discipline.wait_remote_counter(&mut self.channels, pos, increment)
    }

    /// Token round trip on the channel at `pos`: both sides send and receive
    /// once, so neither returns before the other arrived.
    pub fn synchronize_one(&mut self, pos: usize) -> Result<()> {
        let channel = &mut self.channels[pos];
        channel.issue_control_receive(SYNC_TOKEN_LEN)?;
        let token = (channel.index() as u32).to_le_bytes();
        channel.issue_control_send(&token)?;
        let done = self.wait(pos, 2)?;
        if done.len() != 2 {
            return Err(PingpongError::desync(format!(
                "sync: {} completions instead of 2",
                done.len()
            )));
        }
        Ok(())
    }

    pub fn synchronize(&mut self) -> Result<()> {
        for pos in 0..self.channels.len() {
            self.synchronize_one(pos)?;
        }
        info!(
            channels = ?self.channels.iter().map(|c| c.index()).collect::<Vec<_>>(),
            "sync"
        );
        Ok(())
    }

    /// Fails unless every channel has drained all of its operations.
    pub fn ensure_quiescent(&mut self) -> Result<()> {
        for channel in &mut self.channels {
            channel.ensure_quiescent()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use super::*;
    use crate::{
        abort::AbortSignal,
        api::{CompletionKind, PeerAddr, PostStatus, RmaInfo},
        buffer::ChannelBuffers,
        provider::MockChannelTransport,
    };

    fn channel(index: usize, mock: MockChannelTransport) -> Channel<MockChannelTransport> {
        let buffers = ChannelBuffers::new(index, 4096).unwrap();
        let channel = Channel::new(index, mock, buffers, None, AbortSignal::new());
        channel.set_peer_addr(PeerAddr(index as u64)).unwrap();
        channel
    }

    fn mock() -> MockChannelTransport {
        let mut mock = MockChannelTransport::new();
        mock.expect_local_rma().return_const(None::<RmaInfo>);
        mock.expect_post_send().returning(|_, _, _| Ok(PostStatus::Posted));
        mock
    }

    /// A and B each have one pending send completion. Waiting on A must
    /// converge while B's queue is only progressed, never read, and B's
    /// completion must still be there for B's own wait.
    #[test]
    fn shared_progress_keeps_other_channels_events() {
        let b_reads = Arc::new(AtomicUsize::new(0));
        let b_progress = Arc::new(AtomicUsize::new(0));

        let mut a = mock();
        let mut a_polls = 0;
        a.expect_read_cq().returning(move |entries| {
            a_polls += 1;
            if a_polls < 5 {
                return Ok(0);
            }
            entries[0] = Completion { kind: CompletionKind::Send, len: 1 };
            Ok(1)
        });
        a.expect_progress().returning(|| Ok(()));

        let mut b = mock();
        let reads = b_reads.clone();
        let mut b_pending = 1;
        b.expect_read_cq().returning(move |entries| {
            reads.fetch_add(1, Ordering::SeqCst);
            if b_pending == 0 {
                return Ok(0);
            }
            b_pending -= 1;
            entries[0] = Completion { kind: CompletionKind::Send, len: 1 };
            Ok(1)
        });
        let progress = b_progress.clone();
        b.expect_progress().returning(move || {
            progress.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let mut group = ChannelGroup::new(vec![channel(0, a), channel(1, b)], SharedProgress);
        group.channel_mut(0).issue_send(1).unwrap();
        group.channel_mut(1).issue_send(1).unwrap();

        let done = group.wait(0, 1).unwrap();
        assert_eq!(done.len(), 1);
        assert_eq!(b_reads.load(Ordering::SeqCst), 0);
        assert_eq!(b_progress.load(Ordering::SeqCst), 5);
        assert_eq!(group.channel(1).outstanding(), 1);

        let done = group.wait(1, 1).unwrap();
        assert_eq!(done[0].kind, CompletionKind::Send);
        assert_eq!(b_reads.load(Ordering::SeqCst), 1);
        assert_eq!(group.channel(1).outstanding(), 0);
    }

    #[test]
    fn shared_counter_wait_progresses_others() {
        let mut a = mock();
        let mut value = 0u64;
        a.expect_read_counter().returning(move || {
            value += 1;
            Ok(value / 3)
        });
        let mut b = mock();
        b.expect_progress().times(3).returning(|| Ok(()));

        let mut group = ChannelGroup::new(vec![channel(0, a), channel(1, b)], SharedProgress);
        group.wait_remote_counter(0, 1).unwrap();
        assert_eq!(group.channel(0).counter_seen(), 1);
        assert_eq!(group.channel(1).counter_seen(), 0);
    }

    #[test]
    fn synchronize_round_trips_each_channel() {
        let mut group_channels = Vec::new();
        for index in 0..3 {
            let mut m = mock();
            m.expect_post_recv().times(1).returning(|dst, src, _| {
                assert_eq!(dst.len(), SYNC_TOKEN_LEN);
                assert!(src.is_some());
                Ok(PostStatus::Posted)
            });
            let mut kinds = vec![CompletionKind::Send, CompletionKind::Recv];
            m.expect_read_cq().returning(move |entries| match kinds.pop() {
                Some(kind) => {
                    entries[0] = Completion { kind, len: SYNC_TOKEN_LEN };
                    Ok(1)
                }
                None => Ok(0),
            });
            group_channels.push(channel(index, m));
        }
        let mut group = ChannelGroup::new(group_channels, Dedicated);
        group.synchronize().unwrap();
        group.ensure_quiescent().unwrap();
    }
}
