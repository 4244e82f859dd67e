use std::{
    ffi::{CStr, c_void},
    mem::MaybeUninit,
    ptr::{NonNull, null_mut},
};

use libfabric_sys::{
    FI_ADDR_UNSPEC, FI_ATOMIC, FI_ATOMIC_READ, FI_ATOMIC_WRITE, FI_CQ_FORMAT_TAGGED, FI_ENABLE,
    FI_READ, FI_RECV, FI_REMOTE_READ, FI_REMOTE_WRITE, FI_SEND, FI_UINT64, FI_WRITE,
    fi_cntr_attr, fi_context, fi_cq_attr, fi_cq_err_entry, fi_cq_tagged_entry, fi_op, fid,
    fid_av, fid_cntr, fid_cq, fid_domain, fid_ep, fid_mr,
};
use tracing::debug;

use crate::{
    api::{
        AtomicOp, Completion, CompletionKind, KeyMode, LocalSlice, PeerAddr, PostStatus,
        RemoteBufferDescriptor, RmaInfo,
    },
    buffer::{ChannelBuffer, ChannelBuffers},
    channel::CQ_BATCH,
    error::{LibfabricError, PingpongError, Result},
    ofi::{EAGAIN, EAVAIL, FidGuard, close},
    provider::ChannelTransport,
};

const CQ_SIZE: usize = 100;

/// Context slot for transmit-side operations.
const TX_CTX: usize = 0;
/// Context slot for receives and fetching atomics.
const RX_CTX: usize = 1;

fn fi_atomic_op(op: AtomicOp) -> fi_op {
    match op {
        AtomicOp::Write => FI_ATOMIC_WRITE,
        AtomicOp::Read => FI_ATOMIC_READ,
    }
}

fn completion_kind(flags: u64) -> CompletionKind {
    let has = |bit: u64| flags & bit != 0;
    if has(FI_ATOMIC as u64) {
        if has(FI_READ as u64) { CompletionKind::FetchAtomic } else { CompletionKind::Atomic }
    } else if has(FI_RECV as u64) {
        CompletionKind::Recv
    } else if has(FI_READ as u64) {
        CompletionKind::Read
    } else if has(FI_WRITE as u64) {
        CompletionKind::Write
    } else {
        CompletionKind::Send
    }
}

fn post_status(ret: isize, context: &'static str) -> Result<PostStatus> {
    match ret {
        0 => Ok(PostStatus::Posted),
        EAGAIN => Ok(PostStatus::TryAgain),
        _ => Err(LibfabricError::new(ret, context).into()),
    }
}

unsafe fn ep_bind(
    ep: NonNull<fid_ep>,
    bfid: *mut fid,
    flags: u64,
    context: &'static str,
) -> Result<()> {
    unsafe {
        let ep_fid = &raw mut (*ep.as_ptr()).fid;
        let fi_ep_bind = (*(*ep_fid).ops).bind.unwrap_unchecked();
        let ret = fi_ep_bind(ep_fid, bfid, flags);
        if ret != 0 {
            return Err(LibfabricError::new(ret, context).into());
        }
    }
    Ok(())
}

unsafe fn enable(ep: NonNull<fid_ep>) -> Result<()> {
    unsafe {
        let ep_fid = &raw mut (*ep.as_ptr()).fid;
        let fi_control = (*(*ep_fid).ops).control.unwrap_unchecked();
        let ret = fi_control(ep_fid, FI_ENABLE as i32, null_mut());
        if ret != 0 {
            return Err(LibfabricError::new(ret, "fi_enable").into());
        }
    }
    Ok(())
}

unsafe fn mr_reg(
    domain: NonNull<fid_domain>,
    buffer: &ChannelBuffer,
    access: u64,
    requested_key: u64,
) -> Result<NonNull<fid_mr>> {
    let mut mr = null_mut();
    let ret = unsafe {
        let fi_mr_reg = (*(*domain.as_ptr()).mr).reg.unwrap_unchecked();
        fi_mr_reg(
            &raw mut (*domain.as_ptr()).fid,
            buffer.as_nonnull().as_ptr() as *const c_void,
            buffer.len(),
            access,
            0,
            requested_key,
            0,
            &raw mut mr,
            null_mut(),
        )
    };
    NonNull::new(mr).ok_or_else(|| LibfabricError::new(ret, "fi_mr_reg").into())
}

/// Transmit context, receive context and completion queue of one channel,
/// plus the registrations and counter of one-sided modes.
pub struct OfiChannel {
    index: usize,
    tx: NonNull<fid_ep>,
    rx: NonNull<fid_ep>,
    cq: NonNull<fid_cq>,
    cntr: Option<NonNull<fid_cntr>>,
    mrs: Option<[NonNull<fid_mr>; 2]>,
    local_rma: Option<RmaInfo>,
    // FI_CONTEXT: libfabric owns these until the operation completes.
    contexts: Box<[fi_context; 2]>,
}

unsafe impl Send for OfiChannel {}

impl OfiChannel {
    /// # Safety
    /// The fids must stay open for the life of the channel and `buffers`
    /// must outlive it.
    pub(super) unsafe fn open(
        domain: NonNull<fid_domain>,
        sep: NonNull<fid_ep>,
        av: NonNull<fid_av>,
        index: usize,
        buffers: &ChannelBuffers,
        one_sided: bool,
        key_mode: KeyMode,
    ) -> Result<Self> {
        unsafe {
            // Completion queue
            let mut cq = null_mut();
            let mut cq_attr =
                fi_cq_attr { format: FI_CQ_FORMAT_TAGGED, size: CQ_SIZE, ..Default::default() };
            let fi_cq_open = (*(*domain.as_ptr()).ops).cq_open.unwrap_unchecked();
            let ret = fi_cq_open(domain.as_ptr(), &raw mut cq_attr, &raw mut cq, null_mut());
            let cq = NonNull::new(cq).ok_or_else(|| LibfabricError::new(ret, "fi_cq_open"))?;
            let mut guard_cq = FidGuard::new(&raw mut (*cq.as_ptr()).fid, "cq");

            // Transmit and receive contexts
            let fi_tx_context = (*(*sep.as_ptr()).ops).tx_ctx.unwrap_unchecked();
            let mut tx = null_mut();
            let ret =
                fi_tx_context(sep.as_ptr(), index as i32, null_mut(), &raw mut tx, null_mut());
            let tx = NonNull::new(tx).ok_or_else(|| LibfabricError::new(ret, "fi_tx_context"))?;
            let mut guard_tx = FidGuard::new(&raw mut (*tx.as_ptr()).fid, "tx");

            let fi_rx_context = (*(*sep.as_ptr()).ops).rx_ctx.unwrap_unchecked();
            let mut rx = null_mut();
            let ret =
                fi_rx_context(sep.as_ptr(), index as i32, null_mut(), &raw mut rx, null_mut());
            let rx = NonNull::new(rx).ok_or_else(|| LibfabricError::new(ret, "fi_rx_context"))?;
            let mut guard_rx = FidGuard::new(&raw mut (*rx.as_ptr()).fid, "rx");

            // Bind and enable
            let cq_fid = &raw mut (*cq.as_ptr()).fid;
            ep_bind(tx, cq_fid, FI_SEND as u64, "fi_ep_bind cq")?;
            ep_bind(rx, cq_fid, FI_RECV as u64, "fi_ep_bind cq")?;
            ep_bind(tx, &raw mut (*av.as_ptr()).fid, 0, "fi_ep_bind av")?;
            enable(tx)?;
            enable(rx)?;

            let mut channel = OfiChannel {
                index,
                tx,
                rx,
                cq,
                cntr: None,
                mrs: None,
                local_rma: None,
                contexts: Box::new([fi_context::default(), fi_context::default()]),
            };
            guard_cq.disarm();
            guard_tx.disarm();
            guard_rx.disarm();
            if !one_sided {
                debug!(channel = index, "ofi channel open");
                return Ok(channel);
            }

            // From here on dropping `channel` closes whatever was attached.
            let send_mr = mr_reg(
                domain,
                &buffers.send,
                FI_REMOTE_READ as u64,
                RmaInfo::pooled_send_key(index),
            )?;
            let mut guard_send_mr = FidGuard::new(&raw mut (*send_mr.as_ptr()).fid, "send mr");
            // Read and write access for fetching atomics.
            let recv_mr = mr_reg(
                domain,
                &buffers.recv,
                (FI_REMOTE_READ | FI_REMOTE_WRITE) as u64,
                RmaInfo::pooled_recv_key(index),
            )?;
            guard_send_mr.disarm();
            channel.mrs = Some([send_mr, recv_mr]);

            let mut cntr = null_mut();
            let mut cntr_attr = fi_cntr_attr::default();
            let fi_cntr_open = (*(*domain.as_ptr()).ops).cntr_open.unwrap_unchecked();
            let ret =
                fi_cntr_open(domain.as_ptr(), &raw mut cntr_attr, &raw mut cntr, null_mut());
            let cntr =
                NonNull::new(cntr).ok_or_else(|| LibfabricError::new(ret, "fi_cntr_open"))?;
            channel.cntr = Some(cntr);
            let cntr_fid = &raw mut (*cntr.as_ptr()).fid;
            ep_bind(rx, cntr_fid, FI_REMOTE_WRITE as u64, "fi_ep_bind cntr")?;

            channel.local_rma = Some(match key_mode {
                KeyMode::Pooled => RmaInfo::pooled(index),
                KeyMode::PerRegistration => RmaInfo {
                    send: RemoteBufferDescriptor {
                        addr: buffers.send.addr(),
                        key: send_mr.as_ref().key,
                    },
                    recv: RemoteBufferDescriptor {
                        addr: buffers.recv.addr(),
                        key: recv_mr.as_ref().key,
                    },
                },
            });
            debug!(channel = index, local_rma = ?channel.local_rma, "ofi channel open");
            Ok(channel)
        }
    }

    fn context(&mut self, slot: usize) -> *mut c_void {
        (&raw mut self.contexts[slot]) as *mut c_void
    }

    fn cq_error(&self) -> PingpongError {
        let mut err_entry = fi_cq_err_entry::default();
        let ret = unsafe {
            let fi_cq_readerr = (*(*self.cq.as_ptr()).ops).readerr.unwrap_unchecked();
            fi_cq_readerr(self.cq.as_ptr(), &raw mut err_entry, 0)
        };
        if ret <= 0 {
            return LibfabricError::new(ret, "fi_cq_readerr").into();
        }
        let errmsg = unsafe {
            let fi_cq_strerror = (*(*self.cq.as_ptr()).ops).strerror.unwrap_unchecked();
            CStr::from_ptr(fi_cq_strerror(
                self.cq.as_ptr(),
                err_entry.prov_errno,
                err_entry.err_data,
                null_mut(),
                0,
            ))
            .to_string_lossy()
            .into_owned()
        };
        PingpongError::Completion(format!(
            "channel {}: {} (err {}, prov_errno {})",
            self.index, errmsg, err_entry.err, err_entry.prov_errno
        ))
    }
}

impl ChannelTransport for OfiChannel {
    fn post_send(
        &mut self,
        src: LocalSlice,
        dest: PeerAddr,
        tag: Option<u64>,
    ) -> Result<PostStatus> {
        let ctx = self.context(TX_CTX);
        let buf = src.as_ptr() as *const c_void;
        match tag {
            None => {
                let ret = unsafe {
                    let fi_send = (*(*self.tx.as_ptr()).msg).send.unwrap_unchecked();
                    fi_send(self.tx.as_ptr(), buf, src.len(), null_mut(), dest.0, ctx)
                };
                post_status(ret, "fi_send")
            }
            Some(tag) => {
                let ret = unsafe {
                    let fi_tsend = (*(*self.tx.as_ptr()).tagged).send.unwrap_unchecked();
                    fi_tsend(self.tx.as_ptr(), buf, src.len(), null_mut(), dest.0, tag, ctx)
                };
                post_status(ret, "fi_tsend")
            }
        }
    }

    fn post_recv(
        &mut self,
        dst: LocalSlice,
        src: Option<PeerAddr>,
        tag: Option<u64>,
    ) -> Result<PostStatus> {
        let ctx = self.context(RX_CTX);
        let buf = dst.as_ptr() as *mut c_void;
        let src = src.map_or(FI_ADDR_UNSPEC, |addr| addr.0);
        match tag {
            None => {
                let ret = unsafe {
                    let fi_recv = (*(*self.rx.as_ptr()).msg).recv.unwrap_unchecked();
                    fi_recv(self.rx.as_ptr(), buf, dst.len(), null_mut(), src, ctx)
                };
                post_status(ret, "fi_recv")
            }
            Some(tag) => {
                let ret = unsafe {
                    let fi_trecv = (*(*self.rx.as_ptr()).tagged).recv.unwrap_unchecked();
                    fi_trecv(self.rx.as_ptr(), buf, dst.len(), null_mut(), src, tag, 0, ctx)
                };
                post_status(ret, "fi_trecv")
            }
        }
    }

    fn post_write(
        &mut self,
        src: LocalSlice,
        dest: PeerAddr,
        remote: RemoteBufferDescriptor,
    ) -> Result<PostStatus> {
        let ctx = self.context(TX_CTX);
        let ret = unsafe {
            let fi_write = (*(*self.tx.as_ptr()).rma).write.unwrap_unchecked();
            fi_write(
                self.tx.as_ptr(),
                src.as_ptr() as *const c_void,
                src.len(),
                null_mut(),
                dest.0,
                remote.addr,
                remote.key,
                ctx,
            )
        };
        post_status(ret, "fi_write")
    }

    fn post_read(
        &mut self,
        dst: LocalSlice,
        src: PeerAddr,
        remote: RemoteBufferDescriptor,
    ) -> Result<PostStatus> {
        let ctx = self.context(TX_CTX);
        let ret = unsafe {
            let fi_read = (*(*self.tx.as_ptr()).rma).read.unwrap_unchecked();
            fi_read(
                self.tx.as_ptr(),
                dst.as_ptr() as *mut c_void,
                dst.len(),
                null_mut(),
                src.0,
                remote.addr,
                remote.key,
                ctx,
            )
        };
        post_status(ret, "fi_read")
    }

    fn post_atomic(
        &mut self,
        src: LocalSlice,
        count: usize,
        dest: PeerAddr,
        remote: RemoteBufferDescriptor,
        op: AtomicOp,
    ) -> Result<PostStatus> {
        let ctx = self.context(TX_CTX);
        let ret = unsafe {
            let fi_atomic = (*(*self.tx.as_ptr()).atomic).write.unwrap_unchecked();
            fi_atomic(
                self.tx.as_ptr(),
                src.as_ptr() as *const c_void,
                count,
                null_mut(),
                dest.0,
                remote.addr,
                remote.key,
                FI_UINT64,
                fi_atomic_op(op),
                ctx,
            )
        };
        post_status(ret, "fi_atomic")
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
        let ctx = self.context(RX_CTX);
        let ret = unsafe {
            let fi_fetch_atomic = (*(*self.tx.as_ptr()).atomic).readwrite.unwrap_unchecked();
            fi_fetch_atomic(
                self.tx.as_ptr(),
                src.as_ptr() as *const c_void,
                count,
                null_mut(),
                result.as_ptr() as *mut c_void,
                null_mut(),
                dest.0,
                remote.addr,
                remote.key,
                FI_UINT64,
                fi_atomic_op(op),
                ctx,
            )
        };
        post_status(ret, "fi_fetch_atomic")
    }

    fn read_cq(&mut self, entries: &mut [Completion]) -> Result<usize> {
        let want = entries.len().min(CQ_BATCH);
        let mut cqes = MaybeUninit::<[fi_cq_tagged_entry; CQ_BATCH]>::uninit();
        let ret = unsafe {
            let fi_cq_read = (*(*self.cq.as_ptr()).ops).read.unwrap_unchecked();
            fi_cq_read(self.cq.as_ptr(), cqes.as_mut_ptr() as *mut c_void, want)
        };
        match ret {
            n if n > 0 => {
                let n = n as usize;
                let cqes = cqes.as_ptr() as *const fi_cq_tagged_entry;
                for (i, entry) in entries.iter_mut().take(n).enumerate() {
                    let cqe = unsafe { &*cqes.add(i) };
                    *entry = Completion { kind: completion_kind(cqe.flags), len: cqe.len };
                }
                Ok(n)
            }
            0 | EAGAIN => Ok(0),
            EAVAIL => Err(self.cq_error()),
            _ => Err(LibfabricError::new(ret, "fi_cq_read").into()),
        }
    }

    fn progress(&mut self) -> Result<()> {
        let ret = unsafe {
            let fi_cq_read = (*(*self.cq.as_ptr()).ops).read.unwrap_unchecked();
            fi_cq_read(self.cq.as_ptr(), null_mut(), 0)
        };
        match ret {
            n if n >= 0 => Ok(()),
            EAGAIN | EAVAIL => Ok(()),
            _ => Err(LibfabricError::new(ret, "fi_cq_read").into()),
        }
    }

    fn read_counter(&mut self) -> Result<u64> {
        let cntr = self.cntr.ok_or_else(|| {
            PingpongError::transport(
                "fi_cntr_read",
                format!("channel {} has no counter", self.index),
            )
        })?;
        Ok(unsafe {
            let fi_cntr_read = (*(*cntr.as_ptr()).ops).read.unwrap_unchecked();
            fi_cntr_read(cntr.as_ptr())
        })
    }

    fn atomic_max_count(&self, op: AtomicOp) -> Option<usize> {
        let mut count = 0usize;
        let ret = unsafe {
            let ops = (*self.tx.as_ptr()).atomic;
            if ops.is_null() {
                return None;
            }
            match op {
                AtomicOp::Write => (*ops).writevalid?(
                    self.tx.as_ptr(),
                    FI_UINT64,
                    FI_ATOMIC_WRITE,
                    &raw mut count,
                ),
                AtomicOp::Read => (*ops).readwritevalid?(
                    self.tx.as_ptr(),
                    FI_UINT64,
                    FI_ATOMIC_READ,
                    &raw mut count,
                ),
            }
        };
        (ret == 0 && count > 0).then_some(count)
    }

    fn local_rma(&self) -> Option<RmaInfo> {
        self.local_rma
    }
}

impl Drop for OfiChannel {
    fn drop(&mut self) {
        unsafe {
            if let Some(cntr) = self.cntr {
                close(&raw mut (*cntr.as_ptr()).fid, "cntr");
            }
            if let Some(mrs) = self.mrs {
                for mr in mrs.into_iter().rev() {
                    close(&raw mut (*mr.as_ptr()).fid, "mr");
                }
            }
            close(&raw mut (*self.tx.as_ptr()).fid, "tx");
            close(&raw mut (*self.rx.as_ptr()).fid, "rx");
            close(&raw mut (*self.cq.as_ptr()).fid, "cq");
        }
    }
}

#[cfg(test)]
mod tests {
    use libfabric_sys::{FI_MSG, FI_RMA};

    use super::*;

    #[test]
    fn completion_flags_map_to_kinds() {
        assert_eq!(completion_kind((FI_MSG | FI_SEND) as u64), CompletionKind::Send);
        assert_eq!(completion_kind(FI_RECV as u64), CompletionKind::Recv);
        assert_eq!(completion_kind((FI_RMA | FI_WRITE) as u64), CompletionKind::Write);
        assert_eq!(completion_kind((FI_RMA | FI_READ) as u64), CompletionKind::Read);
        assert_eq!(completion_kind((FI_ATOMIC | FI_WRITE) as u64), CompletionKind::Atomic);
        assert_eq!(completion_kind((FI_ATOMIC | FI_READ) as u64), CompletionKind::FetchAtomic);
    }
}
