use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use parking_lot::Mutex;

use crate::{
    api::{
        AtomicOp, Completion, CompletionKind, LocalSlice, PeerAddr, PostStatus, RX_CTX_BITS,
        RemoteBufferDescriptor, RmaInfo,
    },
    channel::ATOMIC_ELEM_SIZE,
    error::{PingpongError, Result},
    loopback::loopback_fabric::{Endpoint, LoopbackFabric, LoopbackOptions},
    provider::ChannelTransport,
};

struct PostedRecv {
    dst: LocalSlice,
    src: Option<u64>,
    tag: Option<u64>,
}

struct Unexpected {
    src: u64,
    tag: Option<u64>,
    data: Vec<u8>,
}

#[derive(Default)]
struct Matcher {
    posted: VecDeque<PostedRecv>,
    unexpected: VecDeque<Unexpected>,
}

type CqEntry = std::result::Result<Completion, String>;

/// Receive side and completion queue of one channel, reachable by peers.
/// Traffic can arrive before the owning channel is opened; it queues here
/// until the channel adopts the context.
#[derive(Default)]
pub(crate) struct RxContext {
    matcher: Mutex<Matcher>,
    cq: Mutex<VecDeque<CqEntry>>,
    counter: AtomicU64,
    opened: AtomicBool,
}

impl RxContext {
    /// Marks the context as owned by an open channel. False if it already was.
    pub(super) fn adopt(&self) -> bool {
        !self.opened.swap(true, Ordering::AcqRel)
    }

    pub(super) fn is_open(&self) -> bool {
        self.opened.load(Ordering::Acquire)
    }

    fn complete(&self, entry: CqEntry) {
        self.cq.lock().push_back(entry);
    }

    /// Lands an arriving message in the oldest matching posted receive, or
    /// queues it until one is posted.
    fn deliver(&self, src: u64, tag: Option<u64>, data: &[u8]) {
        let mut matcher = self.matcher.lock();
        let found = matcher
            .posted
            .iter()
            .position(|recv| recv.tag == tag && recv.src.is_none_or(|s| s == src));
        match found.and_then(|pos| matcher.posted.remove(pos)) {
            Some(recv) => self.complete(land(recv.dst, data)),
            None => matcher.unexpected.push_back(Unexpected { src, tag, data: data.to_vec() }),
        }
    }

    fn post_recv(&self, dst: LocalSlice, src: Option<u64>, tag: Option<u64>) {
        let mut matcher = self.matcher.lock();
        let found = matcher
            .unexpected
            .iter()
            .position(|msg| msg.tag == tag && src.is_none_or(|s| s == msg.src));
        match found.and_then(|pos| matcher.unexpected.remove(pos)) {
            Some(msg) => self.complete(land(dst, &msg.data)),
            None => matcher.posted.push_back(PostedRecv { dst, src, tag }),
        }
    }
}

fn land(dst: LocalSlice, data: &[u8]) -> CqEntry {
    if data.len() > dst.len() {
        return Err(format!(
            "truncated: {} byte message for a {} byte receive",
            data.len(),
            dst.len()
        ));
    }
    unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), dst.as_ptr(), data.len()) };
    Ok(Completion { kind: CompletionKind::Recv, len: data.len() })
}

/// # Safety
/// The owner of `slice` keeps it alive until the operation completes.
unsafe fn local_bytes(slice: &LocalSlice) -> &[u8] {
    unsafe { std::slice::from_raw_parts(slice.as_ptr(), slice.len()) }
}

pub struct LoopbackTransport {
    fabric: LoopbackFabric,
    endpoint: Arc<Endpoint>,
    index: usize,
    context: Arc<RxContext>,
    local_rma: Option<RmaInfo>,
    options: LoopbackOptions,
    attempts: u32,
}

impl LoopbackTransport {
    pub(super) fn new(
        fabric: LoopbackFabric,
        endpoint: Arc<Endpoint>,
        index: usize,
        context: Arc<RxContext>,
        local_rma: Option<RmaInfo>,
        options: LoopbackOptions,
    ) -> Self {
        Self { fabric, endpoint, index, context, local_rma, options, attempts: 0 }
    }

    /// True when this attempt should report backpressure.
    fn busy(&mut self) -> bool {
        let Some(every) = self.options.busy_every else {
            return false;
        };
        self.attempts = self.attempts.wrapping_add(1);
        self.attempts % every == 0
    }

    fn peer(&self, addr: PeerAddr, op: &'static str) -> Result<(Arc<Endpoint>, Arc<RxContext>)> {
        let (base, rx_index) = addr.split(RX_CTX_BITS);
        let id = self.endpoint.lookup(base)?;
        let peer = self
            .fabric
            .endpoint(id)
            .ok_or_else(|| PingpongError::transport(op, format!("endpoint {id} is gone")))?;
        let context = peer.rx_context(rx_index);
        Ok((peer, context))
    }

    fn check_atomic(&self, op: AtomicOp, count: usize) -> Result<()> {
        match self.atomic_max_count(op) {
            Some(max) if count <= max => Ok(()),
            Some(max) => Err(PingpongError::transport(
                "atomic",
                format!("{count} elements exceed the limit of {max}"),
            )),
            None => Err(PingpongError::transport("atomic", format!("{op:?} unsupported"))),
        }
    }

    /// Completion for a one-sided operation, or the error the access raised.
    fn complete_one_sided(
        &self,
        kind: CompletionKind,
        len: usize,
        landed: std::result::Result<(), String>,
    ) {
        self.context.complete(landed.map(|()| Completion { kind, len }));
    }
}

impl ChannelTransport for LoopbackTransport {
    fn post_send(
        &mut self,
        src: LocalSlice,
        dest: PeerAddr,
        tag: Option<u64>,
    ) -> Result<PostStatus> {
        if self.busy() {
            return Ok(PostStatus::TryAgain);
        }
        let (_, context) = self.peer(dest, "send")?;
        context.deliver(self.endpoint.id, tag, unsafe { local_bytes(&src) });
        self.context.complete(Ok(Completion { kind: CompletionKind::Send, len: src.len() }));
        Ok(PostStatus::Posted)
    }

    fn post_recv(
        &mut self,
        dst: LocalSlice,
        src: Option<PeerAddr>,
        tag: Option<u64>,
    ) -> Result<PostStatus> {
        if self.busy() {
            return Ok(PostStatus::TryAgain);
        }
        let src = match src {
            Some(addr) => Some(self.endpoint.lookup(addr.split(RX_CTX_BITS).0)?),
            None => None,
        };
        self.context.post_recv(dst, src, tag);
        Ok(PostStatus::Posted)
    }

    fn post_write(
        &mut self,
        src: LocalSlice,
        dest: PeerAddr,
        remote: RemoteBufferDescriptor,
    ) -> Result<PostStatus> {
        if self.busy() {
            return Ok(PostStatus::TryAgain);
        }
        let (peer, context) = self.peer(dest, "write")?;
        let landed = peer.access(remote, src.len(), true, |dst| unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), dst, src.len());
        });
        if landed.is_ok() {
            context.counter.fetch_add(1, Ordering::Release);
        }
        self.complete_one_sided(CompletionKind::Write, src.len(), landed);
        Ok(PostStatus::Posted)
    }

    fn post_read(
        &mut self,
        dst: LocalSlice,
        src: PeerAddr,
        remote: RemoteBufferDescriptor,
    ) -> Result<PostStatus> {
        if self.busy() {
            return Ok(PostStatus::TryAgain);
        }
        let (peer, _) = self.peer(src, "read")?;
        let landed = peer.access(remote, dst.len(), false, |from| unsafe {
            std::ptr::copy_nonoverlapping(from, dst.as_ptr(), dst.len());
        });
        self.complete_one_sided(CompletionKind::Read, dst.len(), landed);
        Ok(PostStatus::Posted)
    }

    fn post_atomic(
        &mut self,
        src: LocalSlice,
        count: usize,
        dest: PeerAddr,
        remote: RemoteBufferDescriptor,
        op: AtomicOp,
    ) -> Result<PostStatus> {
        self.check_atomic(op, count)?;
        let len = count * ATOMIC_ELEM_SIZE;
        if src.len() < len {
            return Err(PingpongError::transport("atomic", "source shorter than count"));
        }
        if self.busy() {
            return Ok(PostStatus::TryAgain);
        }
        let (peer, context) = self.peer(dest, "atomic")?;
        let landed = peer
            .access(remote, len, op == AtomicOp::Write, |target| {
                if target.align_offset(ATOMIC_ELEM_SIZE) != 0 {
                    return Err(format!("unaligned atomic target {target:p}"));
                }
                for i in 0..count {
                    unsafe {
                        let value = src.as_ptr().add(i * ATOMIC_ELEM_SIZE).cast::<u64>();
                        let elem = AtomicU64::from_ptr(target.add(i * ATOMIC_ELEM_SIZE).cast());
                        match op {
                            AtomicOp::Write => elem.store(value.read_unaligned(), Ordering::Release),
                            AtomicOp::Read => {
                                elem.load(Ordering::Acquire);
                            }
                        }
                    }
                }
                Ok(())
            })
            .and_then(|r| r);
        if landed.is_ok() && op == AtomicOp::Write {
            context.counter.fetch_add(1, Ordering::Release);
        }
        self.complete_one_sided(CompletionKind::Atomic, len, landed);
        Ok(PostStatus::Posted)
    }

    fn post_fetch_atomic(
        &mut self,
        src: LocalSlice,
        result: LocalSlice,
        count: usize,
        dest: PeerAddr,
        remote: RemoteBufferDescriptor,
        op: AtomicOp,
    ) -> Result<PostStatus> {
        self.check_atomic(op, count)?;
        let len = count * ATOMIC_ELEM_SIZE;
        if src.len() < len || result.len() < len {
            return Err(PingpongError::transport("fetch_atomic", "buffers shorter than count"));
        }
        if self.busy() {
            return Ok(PostStatus::TryAgain);
        }
        let (peer, context) = self.peer(dest, "fetch_atomic")?;
        let landed = peer
            .access(remote, len, op == AtomicOp::Write, |target| {
                if target.align_offset(ATOMIC_ELEM_SIZE) != 0 {
                    return Err(format!("unaligned atomic target {target:p}"));
                }
                for i in 0..count {
                    unsafe {
                        let offset = i * ATOMIC_ELEM_SIZE;
                        let elem = AtomicU64::from_ptr(target.add(offset).cast());
                        let old = match op {
                            AtomicOp::Write => elem.swap(
                                src.as_ptr().add(offset).cast::<u64>().read_unaligned(),
                                Ordering::AcqRel,
                            ),
                            AtomicOp::Read => elem.load(Ordering::Acquire),
                        };
                        result.as_ptr().add(offset).cast::<u64>().write_unaligned(old);
                    }
                }
                Ok(())
            })
            .and_then(|r| r);
        if landed.is_ok() && op == AtomicOp::Write {
            context.counter.fetch_add(1, Ordering::Release);
        }
        self.complete_one_sided(CompletionKind::FetchAtomic, len, landed);
        Ok(PostStatus::Posted)
    }

    fn read_cq(&mut self, entries: &mut [Completion]) -> Result<usize> {
        let mut cq = self.context.cq.lock();
        let mut n = 0;
        while n < entries.len() {
            match cq.pop_front() {
                Some(Ok(completion)) => {
                    entries[n] = completion;
                    n += 1;
                }
                Some(Err(message)) if n == 0 => {
                    return Err(PingpongError::Completion(format!(
                        "channel {}: {message}",
                        self.index
                    )));
                }
                Some(err) => {
                    cq.push_front(err);
                    break;
                }
                None => break,
            }
        }
        Ok(n)
    }

    fn progress(&mut self) -> Result<()> {
        Ok(())
    }

    fn read_counter(&mut self) -> Result<u64> {
        Ok(self.context.counter.load(Ordering::Acquire))
    }

    fn atomic_max_count(&self, op: AtomicOp) -> Option<usize> {
        match op {
            AtomicOp::Write => self.options.atomic_write_max,
            AtomicOp::Read => self.options.atomic_read_max,
        }
    }

    fn local_rma(&self) -> Option<RmaInfo> {
        self.local_rma
    }
}

impl Drop for LoopbackTransport {
    fn drop(&mut self) {
        if let Some(info) = self.local_rma {
            let mut regions = self.endpoint.regions.write();
            regions.remove(&info.send.key);
            regions.remove(&info.recv.key);
        }
        self.endpoint.contexts.write().remove(&self.index);
        self.context.matcher.lock().posted.clear();
    }
}
