use std::{
    borrow::Cow,
    ffi::{CStr, CString},
    ptr::{NonNull, null, null_mut},
};

use bytes::Bytes;
use libfabric_sys::{
    FI_ATOMIC, FI_CONTEXT, FI_ENOMEM, FI_EP_RDM, FI_MR_SCALABLE, FI_MSG, FI_RMA,
    FI_RMA_EVENT, FI_SOURCE, FI_TAGGED, fi_dupinfo, fi_freeinfo, fi_getinfo, fi_info,
    make_fi_version,
};

use crate::{
    api::{EndpointAddress, KeyMode},
    config::{BenchConfig, Role, TestMode},
    error::{LibfabricError, PingpongError, Result},
};

/// Service the server binds and the client resolves.
const SERVICE: &CStr = c"12345";

/// Capabilities requested for a test mode.
fn caps(mode: TestMode) -> u64 {
    let mut caps = FI_MSG as u64;
    caps |= match mode {
        TestMode::Msg => 0,
        TestMode::Tagged => FI_TAGGED as u64,
        TestMode::Rma => FI_RMA as u64,
        TestMode::Atomic => FI_ATOMIC as u64,
    };
    if mode.one_sided() {
        caps |= FI_RMA_EVENT as u64;
    }
    caps
}

fn c_string(value: &str, what: &str) -> Result<CString> {
    CString::new(value).map_err(|_| PingpongError::Config(format!("{what} contains NUL")))
}

/// Result of `fi_getinfo` for the benchmark's hints. The first entry is used.
#[derive(Debug)]
pub struct OfiInfo {
    fi: NonNull<fi_info>,
}

unsafe impl Send for OfiInfo {}

impl OfiInfo {
    pub fn query(config: &BenchConfig) -> Result<Self> {
        let node = config.server_name.as_deref().map(|s| c_string(s, "server name")).transpose()?;
        let prov_name =
            config.provider_name.as_deref().map(|s| c_string(s, "provider name")).transpose()?;
        let flags = match config.role() {
            Role::Client => 0,
            Role::Server => FI_SOURCE as u64,
        };

        unsafe {
            let mut hints = NonNull::new(fi_dupinfo(null()))
                .ok_or_else(|| LibfabricError::new(FI_ENOMEM as i32, "fi_dupinfo"))?;
            let h = hints.as_mut();
            (*h.ep_attr).type_ = FI_EP_RDM;
            (*h.ep_attr).tx_ctx_cnt = config.num_channels;
            (*h.ep_attr).rx_ctx_cnt = config.num_channels;
            h.caps = caps(config.mode);
            h.mode = FI_CONTEXT as u64;
            if let Some(name) = &prov_name {
                (*h.fabric_attr).prov_name = name.as_ptr() as *mut std::ffi::c_char;
            }

            let mut info = null_mut();
            let ret = fi_getinfo(
                make_fi_version(1, 0),
                node.as_ref().map_or(null(), |n| n.as_ptr()),
                SERVICE.as_ptr(),
                flags,
                h,
                &raw mut info,
            );

            // Avoid fi_freeinfo freeing prov_name
            (*h.fabric_attr).prov_name = null_mut();
            fi_freeinfo(h);

            let fi = NonNull::new(info).ok_or_else(|| LibfabricError::new(ret, "fi_getinfo"))?;
            Ok(Self { fi })
        }
    }

    pub fn fi(&self) -> NonNull<fi_info> {
        self.fi
    }

    pub fn provider_name(&self) -> Cow<'_, str> {
        unsafe {
            let attr = (*self.fi.as_ptr()).fabric_attr;
            if attr.is_null() || (*attr).prov_name.is_null() {
                return Cow::Borrowed("unknown");
            }
            CStr::from_ptr((*attr).prov_name).to_string_lossy()
        }
    }

    pub fn fabric_name(&self) -> Cow<'_, str> {
        unsafe {
            let attr = (*self.fi.as_ptr()).fabric_attr;
            if attr.is_null() || (*attr).name.is_null() {
                return Cow::Borrowed("unknown");
            }
            CStr::from_ptr((*attr).name).to_string_lossy()
        }
    }

    /// Scalable memory registration means keys are requested by the
    /// application and addresses are offsets.
    pub fn key_mode(&self) -> KeyMode {
        let mr_mode = unsafe { (*(*self.fi.as_ptr()).domain_attr).mr_mode };
        if mr_mode == FI_MR_SCALABLE as i32 { KeyMode::Pooled } else { KeyMode::PerRegistration }
    }

    /// Address resolved from the node name passed to `fi_getinfo`.
    pub fn dest_address(&self) -> Option<EndpointAddress> {
        unsafe {
            let fi = self.fi.as_ref();
            if fi.dest_addr.is_null() || fi.dest_addrlen == 0 {
                return None;
            }
            let bytes = std::slice::from_raw_parts(fi.dest_addr as *const u8, fi.dest_addrlen);
            Some(EndpointAddress(Bytes::copy_from_slice(bytes)))
        }
    }
}

impl Drop for OfiInfo {
    fn drop(&mut self) {
        unsafe { fi_freeinfo(self.fi.as_ptr()) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caps_follow_mode() {
        assert_eq!(caps(TestMode::Msg), FI_MSG as u64);
        assert_eq!(caps(TestMode::Tagged), FI_MSG as u64 | FI_TAGGED as u64);
        assert_eq!(caps(TestMode::Rma), FI_MSG as u64 | FI_RMA as u64 | FI_RMA_EVENT as u64);
        assert_ne!(caps(TestMode::Atomic) & FI_ATOMIC as u64, 0);
    }
}
