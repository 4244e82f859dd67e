//! Units of work per test mode. The driver only times them.

use crate::{
    config::Role,
    error::{PingpongError, Result},
    progress::{ChannelGroup, ProgressDiscipline},
    provider::ChannelTransport,
};

/// Size of the message that ends a one-way two-sided sweep point.
pub const DONE_SIGNAL_LEN: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    SendRecv,
    Write,
    Read,
    AtomicWrite,
    AtomicRead,
}

impl Phase {
    pub fn label(self) -> &'static str {
        match self {
            Phase::SendRecv => "send/recv",
            Phase::Write => "write",
            Phase::Read => "read ",
            Phase::AtomicWrite => "atomic write u64x",
            Phase::AtomicRead => "atomic read  u64x",
        }
    }
}

pub trait UnitOfWork {
    fn phase(&self) -> Phase;

    /// Operations per unit that the latency is divided by.
    fn direction_factor(&self) -> usize;

    /// One unit of `units` on every channel of the group.
    fn iterate<T, P>(&self, group: &mut ChannelGroup<T, P>, units: usize) -> Result<()>
    where
        T: ChannelTransport,
        P: ProgressDiscipline;

    /// Work after the last unit that still belongs in the timing window.
    fn finish<T, P>(&self, _group: &mut ChannelGroup<T, P>, _units: usize) -> Result<()>
    where
        T: ChannelTransport,
        P: ProgressDiscipline,
    {
        Ok(())
    }
}

fn wait_each<T, P>(group: &mut ChannelGroup<T, P>, count: usize) -> Result<()>
where
    T: ChannelTransport,
    P: ProgressDiscipline,
{
    for pos in 0..group.len() {
        let done = group.wait(pos, count)?;
        if done.len() != count {
            return Err(PingpongError::desync(format!(
                "channel {}: {} completions instead of {count}",
                group.channel(pos).index(),
                done.len()
            )));
        }
    }
    Ok(())
}

fn send_all<T, P>(group: &mut ChannelGroup<T, P>, len: usize) -> Result<()>
where
    T: ChannelTransport,
    P: ProgressDiscipline,
{
    for channel in group.channels_mut() {
        channel.issue_send(len)?;
    }
    wait_each(group, 1)
}

fn receive_all<T, P>(group: &mut ChannelGroup<T, P>, len: usize) -> Result<()>
where
    T: ChannelTransport,
    P: ProgressDiscipline,
{
    for channel in group.channels_mut() {
        channel.issue_receive(len)?;
    }
    wait_each(group, 1)
}

fn await_remote_writes<T, P>(group: &mut ChannelGroup<T, P>) -> Result<()>
where
    T: ChannelTransport,
    P: ProgressDiscipline,
{
    for pos in 0..group.len() {
        group.wait_remote_counter(pos, 1)?;
    }
    Ok(())
}

/// Two-sided ping-pong. The client sends first; the server echoes when
/// bidirectional.
#[derive(Debug, Clone, Copy)]
pub struct MessagePolicy {
    pub role: Role,
    pub bidirectional: bool,
}

impl UnitOfWork for MessagePolicy {
    fn phase(&self) -> Phase {
        Phase::SendRecv
    }

    fn direction_factor(&self) -> usize {
        if self.bidirectional { 2 } else { 1 }
    }

    fn iterate<T, P>(&self, group: &mut ChannelGroup<T, P>, units: usize) -> Result<()>
    where
        T: ChannelTransport,
        P: ProgressDiscipline,
    {
        match (self.role, self.bidirectional) {
            (Role::Client, false) => send_all(group, units),
            (Role::Server, false) => receive_all(group, units),
            (Role::Client, true) => {
                send_all(group, units)?;
                receive_all(group, units)
            }
            (Role::Server, true) => {
                receive_all(group, units)?;
                send_all(group, units)
            }
        }
    }

    /// One-way runs end with a done message from the server so the client
    /// does not stop its clock before the last message was received.
    fn finish<T, P>(&self, group: &mut ChannelGroup<T, P>, _units: usize) -> Result<()>
    where
        T: ChannelTransport,
        P: ProgressDiscipline,
    {
        if self.bidirectional {
            return Ok(());
        }
        match self.role {
            Role::Client => receive_all(group, DONE_SIGNAL_LEN),
            Role::Server => send_all(group, DONE_SIGNAL_LEN),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RmaOp {
    Write,
    Read,
}

/// One-sided write or read of the peer's exposed buffers.
#[derive(Debug, Clone, Copy)]
pub struct RmaPolicy {
    pub op: RmaOp,
    pub role: Role,
    pub bidirectional: bool,
}

impl UnitOfWork for RmaPolicy {
    fn phase(&self) -> Phase {
        match self.op {
            RmaOp::Write => Phase::Write,
            RmaOp::Read => Phase::Read,
        }
    }

    fn direction_factor(&self) -> usize {
        1
    }

    fn iterate<T, P>(&self, group: &mut ChannelGroup<T, P>, units: usize) -> Result<()>
    where
        T: ChannelTransport,
        P: ProgressDiscipline,
    {
        match self.op {
            RmaOp::Write => {
                let write = |group: &mut ChannelGroup<T, P>| -> Result<()> {
                    for channel in group.channels_mut() {
                        channel.issue_write(units)?;
                    }
                    wait_each(group, 1)
                };
                match self.role {
                    Role::Client => {
                        write(group)?;
                        if self.bidirectional {
                            await_remote_writes(group)?;
                        }
                        Ok(())
                    }
                    Role::Server => {
                        await_remote_writes(group)?;
                        if self.bidirectional {
                            write(group)?;
                        }
                        Ok(())
                    }
                }
            }
            RmaOp::Read => {
                for channel in group.channels_mut() {
                    channel.issue_read(units)?;
                }
                wait_each(group, 1)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtomicKind {
    Write,
    FetchRead,
}

/// One-sided u64 atomics on the peer's receive buffer. `units` counts elements.
#[derive(Debug, Clone, Copy)]
pub struct AtomicPolicy {
    pub kind: AtomicKind,
    pub role: Role,
    pub bidirectional: bool,
}

impl UnitOfWork for AtomicPolicy {
    fn phase(&self) -> Phase {
        match self.kind {
            AtomicKind::Write => Phase::AtomicWrite,
            AtomicKind::FetchRead => Phase::AtomicRead,
        }
    }

    fn direction_factor(&self) -> usize {
        1
    }

    fn iterate<T, P>(&self, group: &mut ChannelGroup<T, P>, units: usize) -> Result<()>
    where
        T: ChannelTransport,
        P: ProgressDiscipline,
    {
        match self.kind {
            AtomicKind::Write => {
                let write = |group: &mut ChannelGroup<T, P>| -> Result<()> {
                    for channel in group.channels_mut() {
                        channel.issue_atomic(units)?;
                    }
                    wait_each(group, 1)
                };
                match self.role {
                    Role::Client => {
                        write(group)?;
                        if self.bidirectional {
                            await_remote_writes(group)?;
                        }
                        Ok(())
                    }
                    Role::Server => {
                        await_remote_writes(group)?;
                        if self.bidirectional {
                            write(group)?;
                        }
                        Ok(())
                    }
                }
            }
            AtomicKind::FetchRead => {
                for channel in group.channels_mut() {
                    channel.issue_fetch_atomic(units)?;
                }
                wait_each(group, 1)
            }
        }
    }
}

/// Closed set of policies so plans can mix them without trait objects.
#[derive(Debug, Clone, Copy)]
pub enum Workload {
    Message(MessagePolicy),
    Rma(RmaPolicy),
    Atomic(AtomicPolicy),
}

impl UnitOfWork for Workload {
    fn phase(&self) -> Phase {
        match self {
            Workload::Message(p) => p.phase(),
            Workload::Rma(p) => p.phase(),
            Workload::Atomic(p) => p.phase(),
        }
    }

    fn direction_factor(&self) -> usize {
        match self {
            Workload::Message(p) => p.direction_factor(),
            Workload::Rma(p) => p.direction_factor(),
            Workload::Atomic(p) => p.direction_factor(),
        }
    }

    fn iterate<T, P>(&self, group: &mut ChannelGroup<T, P>, units: usize) -> Result<()>
    where
        T: ChannelTransport,
        P: ProgressDiscipline,
    {
        match self {
            Workload::Message(p) => p.iterate(group, units),
            Workload::Rma(p) => p.iterate(group, units),
            Workload::Atomic(p) => p.iterate(group, units),
        }
    }

    fn finish<T, P>(&self, group: &mut ChannelGroup<T, P>, units: usize) -> Result<()>
    where
        T: ChannelTransport,
        P: ProgressDiscipline,
    {
        match self {
            Workload::Message(p) => p.finish(group, units),
            Workload::Rma(p) => p.finish(group, units),
            Workload::Atomic(p) => p.finish(group, units),
        }
    }
}
