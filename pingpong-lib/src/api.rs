//! Types shared between the benchmark core and the transport providers.

use std::{ptr::NonNull, str::FromStr};

use bincode::{Decode, Encode};
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::{PingpongError, Result};

pub type SmallVec<T> = ::smallvec::SmallVec<[T; 4]>;

/// Tag carried by every two-sided message in tagged mode.
pub const MSG_TAG: u64 = 0xFFFF_0000_FFFF_0000;

/// Receive-context bits in a peer address, as configured on the address vector.
pub const RX_CTX_BITS: u32 = 8;

/// Raw endpoint name as produced by `fi_getname` or a loopback registration.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointAddress(pub Bytes);

fn fmt_hex(f: &mut std::fmt::Formatter<'_>, bytes: &[u8]) -> std::fmt::Result {
    for x in bytes {
        write!(f, "{:02x}", x)?;
    }
    Ok(())
}

impl std::fmt::Debug for EndpointAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt_hex(f, &self.0)
    }
}

impl std::fmt::Display for EndpointAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt_hex(f, &self.0)
    }
}

impl FromStr for EndpointAddress {
    type Err = PingpongError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        if s.len() % 2 != 0 || s.is_empty() {
            return Err(PingpongError::Custom("Invalid address length"));
        }
        let mut bytes = BytesMut::with_capacity(s.len() / 2);
        for i in (0..s.len()).step_by(2) {
            let byte = u8::from_str_radix(&s[i..i + 2], 16)
                .map_err(|_| PingpongError::Custom("Invalid address"))?;
            bytes.put_u8(byte);
        }
        Ok(Self(bytes.freeze()))
    }
}

/// Resolved address of a peer receive context (`fi_addr_t`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PeerAddr(pub u64);

impl PeerAddr {
    /// Address of receive context `index` behind the scalable endpoint at
    /// `self`. The same computation runs on both sides of the handshake.
    pub fn derive(self, index: usize, rx_ctx_bits: u32) -> PeerAddr {
        if rx_ctx_bits == 0 {
            return self;
        }
        PeerAddr(((index as u64) << (64 - rx_ctx_bits)) | self.0)
    }

    /// Inverse of [`PeerAddr::derive`]: `(base, receive context index)`.
    pub fn split(self, rx_ctx_bits: u32) -> (PeerAddr, usize) {
        if rx_ctx_bits == 0 {
            return (self, 0);
        }
        let shift = 64 - rx_ctx_bits;
        let base = self.0 & ((1u64 << shift) - 1);
        (PeerAddr(base), (self.0 >> shift) as usize)
    }
}

/// Address + key pair a peer uses to target a registered buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Encode, Decode)]
pub struct RemoteBufferDescriptor {
    pub addr: u64,
    pub key: u64,
}

impl std::fmt::Display for RemoteBufferDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "addr={:x} key={:x}", self.addr, self.key)
    }
}

/// Descriptors for one channel's send buffer (remote read) and receive
/// buffer (remote read and write).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Encode, Decode)]
pub struct RmaInfo {
    pub send: RemoteBufferDescriptor,
    pub recv: RemoteBufferDescriptor,
}

impl RmaInfo {
    /// Requested key for channel `index`'s send buffer in pooled key mode.
    pub fn pooled_send_key(index: usize) -> u64 {
        (index + index + 1) as u64
    }

    /// Requested key for channel `index`'s receive buffer in pooled key mode.
    pub fn pooled_recv_key(index: usize) -> u64 {
        (index + index + 2) as u64
    }

    /// Descriptors for channel `index` when keys come from the pool and
    /// addresses are offsets into the registration.
    pub fn pooled(index: usize) -> Self {
        Self {
            send: RemoteBufferDescriptor { addr: 0, key: Self::pooled_send_key(index) },
            recv: RemoteBufferDescriptor { addr: 0, key: Self::pooled_recv_key(index) },
        }
    }

    pub fn encode<'a>(&self, buf: &'a mut [u8]) -> Result<&'a mut [u8]> {
        let len = bincode::encode_into_slice(self, buf, bincode::config::standard())
            .map_err(|e| PingpongError::desync(format!("encode rma info: {e}")))?;
        Ok(&mut buf[..len])
    }

    /// Decodes exactly one `RmaInfo`; leftover bytes mean the peers disagree.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let (info, read): (RmaInfo, usize) =
            bincode::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| PingpongError::desync(format!("decode rma info: {e}")))?;
        if read != bytes.len() {
            return Err(PingpongError::desync(format!(
                "rma info: {} trailing bytes",
                bytes.len() - read
            )));
        }
        Ok(info)
    }
}

impl std::fmt::Display for RmaInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "saddr={:x} skey={:x} raddr={:x} rkey={:x}",
            self.send.addr, self.send.key, self.recv.addr, self.recv.key
        )
    }
}

/// How remote keys are produced by the provider's registration model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyMode {
    /// Keys and addresses come out of each registration and must be exchanged.
    PerRegistration,
    /// Keys are requested by the application and addresses are offsets, so
    /// both sides derive the peer's descriptors from the channel index.
    Pooled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompletionKind {
    #[default]
    Send,
    Recv,
    Write,
    Read,
    Atomic,
    FetchAtomic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Completion {
    pub kind: CompletionKind,
    pub len: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtomicOp {
    Write,
    Read,
}

/// Outcome of posting an operation that was not a hard failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostStatus {
    Posted,
    /// Transport backpressure. Drive progress and post again.
    TryAgain,
}

/// Borrowed view of a local buffer handed to the transport. The owner keeps
/// the memory alive and untouched until the matching completion is observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalSlice {
    ptr: NonNull<u8>,
    len: usize,
}

unsafe impl Send for LocalSlice {}
unsafe impl Sync for LocalSlice {}

impl LocalSlice {
    /// # Safety
    /// `ptr` must be valid for reads and writes of `len` bytes for as long as
    /// the transport may access it.
    pub unsafe fn new(ptr: NonNull<u8>, len: usize) -> Self {
        Self { ptr, len }
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn addr(&self) -> u64 {
        self.ptr.as_ptr() as u64
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_and_split_are_inverse() {
        let base = PeerAddr(0x2a);
        for index in [0usize, 1, 17, 79, 255] {
            let addr = base.derive(index, RX_CTX_BITS);
            assert_eq!(addr.split(RX_CTX_BITS), (base, index));
        }
        assert_eq!(base.derive(3, RX_CTX_BITS).0, (3u64 << 56) | 0x2a);
    }

    #[test]
    fn derive_is_injective_per_base() {
        let base = PeerAddr(7);
        let mut seen = std::collections::HashSet::new();
        for index in 0..256 {
            assert!(seen.insert(base.derive(index, RX_CTX_BITS)));
        }
    }

    #[test]
    fn pooled_keys_follow_channel_index() {
        let info = RmaInfo::pooled(3);
        assert_eq!(info.send, RemoteBufferDescriptor { addr: 0, key: 7 });
        assert_eq!(info.recv, RemoteBufferDescriptor { addr: 0, key: 8 });
    }

    #[test]
    fn rma_info_rejects_trailing_bytes() {
        let info = RmaInfo {
            send: RemoteBufferDescriptor { addr: 0x7f00_0000_1000, key: 0x11 },
            recv: RemoteBufferDescriptor { addr: 0x7f00_0020_0000, key: 0x12 },
        };
        let mut buf = [0u8; 64];
        let len = info.encode(&mut buf).unwrap().len();
        assert_eq!(RmaInfo::decode(&buf[..len]).unwrap(), info);
        assert!(matches!(
            RmaInfo::decode(&buf[..len + 1]),
            Err(PingpongError::ProtocolDesync(_))
        ));
        assert!(matches!(
            RmaInfo::decode(&buf[..2]),
            Err(PingpongError::ProtocolDesync(_))
        ));
    }

    #[test]
    fn endpoint_address_hex() {
        let addr: EndpointAddress = "0a0b10ff".parse().unwrap();
        assert_eq!(addr.0.as_ref(), &[0x0a, 0x0b, 0x10, 0xff]);
        assert_eq!(addr.to_string(), "0a0b10ff");
        assert!("abc".parse::<EndpointAddress>().is_err());
    }
}
