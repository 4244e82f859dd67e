mod ofi_channel;
mod ofi_info;
mod ofi_provider;

use libfabric_sys::{FI_EAGAIN, FI_EAVAIL, fi_close, fid};
use tracing::warn;

pub use ofi_channel::OfiChannel;
pub use ofi_info::OfiInfo;
pub use ofi_provider::OfiProvider;

const EAGAIN: isize = -(FI_EAGAIN as isize);
const EAVAIL: isize = -(FI_EAVAIL as isize);

/// Closes a fid that is only partially wired up when setup bails out.
struct FidGuard {
    fid: *mut fid,
    what: &'static str,
    armed: bool,
}

impl FidGuard {
    /// # Safety
    /// `fid` must be an open libfabric object not closed by anyone else
    /// while the guard is armed.
    unsafe fn new(fid: *mut fid, what: &'static str) -> Self {
        Self { fid, what, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for FidGuard {
    fn drop(&mut self) {
        if self.armed {
            unsafe { close(self.fid, self.what) };
        }
    }
}

/// # Safety
/// `fid` must be open and not used afterwards.
unsafe fn close(fid: *mut fid, what: &'static str) {
    let ret = unsafe { fi_close(fid) };
    if ret != 0 {
        warn!(what, ret, "fi_close failed");
    }
}
