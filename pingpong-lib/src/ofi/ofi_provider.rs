use std::{
    borrow::Cow,
    ffi::c_void,
    ptr::{NonNull, null_mut},
};

use bytes::Bytes;
use libfabric_sys::{
    FI_ADDR_UNSPEC, FI_AV_MAP, fi_addr_t, fi_av_attr, fi_fabric, fid_av, fid_domain, fid_ep,
    fid_fabric,
};
use tracing::{debug, info};

use crate::{
    api::{EndpointAddress, KeyMode, PeerAddr, RX_CTX_BITS},
    buffer::ChannelBuffers,
    config::BenchConfig,
    error::{LibfabricError, PingpongError, Result},
    ofi::{FidGuard, close, ofi_channel::OfiChannel, ofi_info::OfiInfo},
    provider::Provider,
};

/// Fabric, domain, address vector and scalable endpoint shared by all
/// channels of one side.
pub struct OfiProvider {
    info: OfiInfo,
    fabric: NonNull<fid_fabric>,
    domain: NonNull<fid_domain>,
    av: NonNull<fid_av>,
    sep: NonNull<fid_ep>,
}

unsafe impl Send for OfiProvider {}

impl OfiProvider {
    pub fn open(config: &BenchConfig) -> Result<Self> {
        let info = OfiInfo::query(config)?;
        info!(
            provider = %info.provider_name(),
            fabric = %info.fabric_name(),
            key_mode = ?info.key_mode(),
            "Using OFI device"
        );

        unsafe {
            let fi = info.fi();

            // Fabric
            let mut fabric = null_mut();
            let ret = fi_fabric(fi.as_ref().fabric_attr, &raw mut fabric, null_mut());
            let fabric =
                NonNull::new(fabric).ok_or_else(|| LibfabricError::new(ret, "fi_fabric"))?;
            let mut guard_fabric = FidGuard::new(&raw mut (*fabric.as_ptr()).fid, "fabric");

            // Domain
            let mut domain = null_mut();
            let fi_domain = (*(*fabric.as_ptr()).ops).domain.unwrap_unchecked();
            let ret = fi_domain(fabric.as_ptr(), fi.as_ptr(), &raw mut domain, null_mut());
            let domain =
                NonNull::new(domain).ok_or_else(|| LibfabricError::new(ret, "fi_domain"))?;
            let mut guard_domain = FidGuard::new(&raw mut (*domain.as_ptr()).fid, "domain");

            // Address vector with receive-context addressing
            let mut av = null_mut();
            let mut av_attr = fi_av_attr {
                type_: FI_AV_MAP,
                rx_ctx_bits: RX_CTX_BITS as i32,
                ..Default::default()
            };
            let fi_av_open = (*(*domain.as_ptr()).ops).av_open.unwrap_unchecked();
            let ret = fi_av_open(domain.as_ptr(), &raw mut av_attr, &raw mut av, null_mut());
            let av = NonNull::new(av).ok_or_else(|| LibfabricError::new(ret, "fi_av_open"))?;
            let mut guard_av = FidGuard::new(&raw mut (*av.as_ptr()).fid, "av");

            // Scalable endpoint
            let mut sep = null_mut();
            let fi_scalable_ep = (*(*domain.as_ptr()).ops).scalable_ep.unwrap_unchecked();
            let ret = fi_scalable_ep(domain.as_ptr(), fi.as_ptr(), &raw mut sep, null_mut());
            let sep =
                NonNull::new(sep).ok_or_else(|| LibfabricError::new(ret, "fi_scalable_ep"))?;

            guard_fabric.disarm();
            guard_domain.disarm();
            guard_av.disarm();

            Ok(Self { info, fabric, domain, av, sep })
        }
    }

    pub fn info(&self) -> &OfiInfo {
        &self.info
    }
}

impl Provider for OfiProvider {
    type Transport = OfiChannel;

    fn name(&self) -> Cow<'_, str> {
        self.info.provider_name()
    }

    fn key_mode(&self) -> KeyMode {
        self.info.key_mode()
    }

    fn rx_ctx_bits(&self) -> u32 {
        RX_CTX_BITS
    }

    fn local_address(&self) -> Result<EndpointAddress> {
        let mut addrbuf = [0u8; 128];
        let mut addrlen = addrbuf.len();
        let ret = unsafe {
            let sep_fid = &raw mut (*self.sep.as_ptr()).fid;
            let fi_getname = (*(*self.sep.as_ptr()).cm).getname.unwrap_unchecked();
            fi_getname(sep_fid, addrbuf.as_mut_ptr() as *mut c_void, &raw mut addrlen)
        };
        if ret != 0 {
            return Err(LibfabricError::new(ret, "fi_getname").into());
        }
        let len = addrlen.min(addrbuf.len());
        Ok(EndpointAddress(Bytes::copy_from_slice(&addrbuf[..len])))
    }

    fn server_address(&self) -> Result<EndpointAddress> {
        self.info.dest_address().ok_or_else(|| {
            PingpongError::transport("server_address", "couldn't get server address")
        })
    }

    fn insert_address(&mut self, addr: &EndpointAddress) -> Result<PeerAddr> {
        let mut fi_addr: fi_addr_t = FI_ADDR_UNSPEC;
        let ret = unsafe {
            let fi_av_insert = (*(*self.av.as_ptr()).ops).insert.unwrap_unchecked();
            fi_av_insert(
                self.av.as_ptr(),
                addr.0.as_ptr() as *const c_void,
                1,
                &raw mut fi_addr,
                0,
                null_mut(),
            )
        };
        if ret != 1 {
            return Err(LibfabricError::new(ret, "fi_av_insert").into());
        }
        debug!(peer = %addr, fi_addr, "inserted peer address");
        Ok(PeerAddr(fi_addr))
    }

    fn open_channel(
        &mut self,
        index: usize,
        buffers: &ChannelBuffers,
        one_sided: bool,
    ) -> Result<OfiChannel> {
        unsafe {
            OfiChannel::open(
                self.domain,
                self.sep,
                self.av,
                index,
                buffers,
                one_sided,
                self.info.key_mode(),
            )
        }
    }
}

impl Drop for OfiProvider {
    fn drop(&mut self) {
        unsafe {
            close(&raw mut (*self.sep.as_ptr()).fid, "sep");
            close(&raw mut (*self.av.as_ptr()).fid, "av");
            close(&raw mut (*self.domain.as_ptr()).fid, "domain");
            close(&raw mut (*self.fabric.as_ptr()).fid, "fabric");
        }
    }
}

#[cfg(test)]
mod tests {
    use libfabric_sys::fi_rx_addr;

    use super::*;

    #[test]
    fn peer_derivation_matches_fi_rx_addr() {
        let base = PeerAddr(0x1234);
        for index in [0usize, 1, 63, 255] {
            assert_eq!(
                base.derive(index, RX_CTX_BITS).0,
                fi_rx_addr(base.0, index as i32, RX_CTX_BITS as i32)
            );
        }
    }
}
