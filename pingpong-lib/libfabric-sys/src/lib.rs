#![allow(warnings)]
include!(concat!(env!("OUT_DIR"), "/libfabric-bindings.rs"));

pub const FI_ADDR_UNSPEC: fi_addr_t = u64::MAX;

pub fn make_fi_version(major: u16, minor: u16) -> u32 {
    ((major as u32) << 16) | (minor as u32)
}

/// `fi_rx_addr` is a static inline in `fi_endpoint.h`, so bindgen skips it.
pub fn fi_rx_addr(fi_addr: fi_addr_t, rx_index: i32, rx_ctx_bits: i32) -> fi_addr_t {
    ((rx_index as u64) << (64 - rx_ctx_bits)) | fi_addr
}

pub unsafe fn fi_close(fid: *mut fid) -> i32 {
    (*(*fid).ops).close.unwrap_unchecked()(fid)
}
