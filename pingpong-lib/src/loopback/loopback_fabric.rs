use std::{
    borrow::Cow,
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use bytes::Bytes;
use parking_lot::RwLock;
use tracing::debug;

use crate::{
    api::{EndpointAddress, KeyMode, PeerAddr, RX_CTX_BITS, RemoteBufferDescriptor, RmaInfo},
    buffer::{ChannelBuffer, ChannelBuffers},
    error::{PingpongError, Result},
    loopback::loopback_transport::{LoopbackTransport, RxContext},
    provider::Provider,
};

/// Provider-chosen keys start above every pooled key.
const FIRST_PROVIDER_KEY: u64 = 0x1_0000;

#[derive(Debug, Clone, Copy)]
pub struct LoopbackOptions {
    pub key_mode: KeyMode,
    /// Largest element count of one atomic write, `None` if unsupported.
    pub atomic_write_max: Option<usize>,
    /// Largest element count of one fetching atomic read.
    pub atomic_read_max: Option<usize>,
    /// Every n-th post attempt reports backpressure instead of executing.
    pub busy_every: Option<u32>,
}

impl Default for LoopbackOptions {
    fn default() -> Self {
        Self {
            key_mode: KeyMode::PerRegistration,
            atomic_write_max: Some(64),
            atomic_read_max: Some(64),
            busy_every: None,
        }
    }
}

/// A registered buffer as the peer sees it.
#[derive(Debug, Clone, Copy)]
pub(super) struct Region {
    base: u64,
    len: usize,
    remote_write: bool,
}

impl Region {
    fn new(buffer: &ChannelBuffer, remote_write: bool) -> Self {
        Self { base: buffer.addr(), len: buffer.len(), remote_write }
    }

    /// Local address of `len` bytes at `addr` inside the region.
    fn resolve(&self, key_mode: KeyMode, addr: u64, len: usize) -> Option<u64> {
        let offset = match key_mode {
            KeyMode::Pooled => addr,
            KeyMode::PerRegistration => addr.checked_sub(self.base)?,
        };
        let end = offset.checked_add(len as u64)?;
        (end <= self.len as u64).then_some(self.base + offset)
    }
}

pub(super) struct Endpoint {
    pub(super) id: u64,
    name: String,
    key_mode: KeyMode,
    av: RwLock<Vec<u64>>,
    pub(super) contexts: RwLock<HashMap<usize, Arc<RxContext>>>,
    pub(super) regions: RwLock<HashMap<u64, Region>>,
    next_key: AtomicU64,
}

impl Endpoint {
    /// Receive context `index`, created on first use so that messages sent
    /// before the channel opens are queued instead of lost.
    pub(super) fn rx_context(&self, index: usize) -> Arc<RxContext> {
        if let Some(context) = self.contexts.read().get(&index) {
            return context.clone();
        }
        self.contexts.write().entry(index).or_default().clone()
    }

    pub(super) fn address(&self) -> EndpointAddress {
        EndpointAddress(Bytes::copy_from_slice(&self.id.to_le_bytes()))
    }

    /// Endpoint id stored in this endpoint's address table at `base`.
    pub(super) fn lookup(&self, base: PeerAddr) -> Result<u64> {
        let av = self.av.read();
        usize::try_from(base.0)
            .ok()
            .and_then(|slot| av.get(slot).copied())
            .ok_or_else(|| {
                PingpongError::transport("av_lookup", format!("{base:?} not in address table"))
            })
    }

    /// Runs `f` on the local address of `len` bytes described by `remote`
    /// while the registration is held. `Err` carries the completion error a
    /// NIC would report for the access.
    pub(super) fn access<R>(
        &self,
        remote: RemoteBufferDescriptor,
        len: usize,
        write: bool,
        f: impl FnOnce(*mut u8) -> R,
    ) -> std::result::Result<R, String> {
        let regions = self.regions.read();
        let region = regions
            .get(&remote.key)
            .ok_or_else(|| format!("invalid remote key {:#x}", remote.key))?;
        if write && !region.remote_write {
            return Err(format!("remote key {:#x} is not writable", remote.key));
        }
        let addr = region.resolve(self.key_mode, remote.addr, len).ok_or_else(|| {
            format!("{len} bytes at {:#x} outside remote key {:#x}", remote.addr, remote.key)
        })?;
        Ok(f(addr as *mut u8))
    }
}

fn endpoint_id(addr: &EndpointAddress) -> Result<u64> {
    let bytes: [u8; 8] = addr.0.as_ref().try_into().map_err(|_| {
        PingpongError::transport("av_insert", format!("malformed loopback address {addr}"))
    })?;
    Ok(u64::from_le_bytes(bytes))
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    names: HashMap<String, u64>,
    endpoints: HashMap<u64, Arc<Endpoint>>,
}

/// Namespace loopback endpoints resolve each other in. Clones share it.
#[derive(Clone, Default)]
pub struct LoopbackFabric {
    registry: Arc<RwLock<Registry>>,
}

impl LoopbackFabric {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an endpoint under `name`. A client passes the name of the
    /// server it will look up.
    pub fn open(
        &self,
        name: &str,
        options: LoopbackOptions,
        server: Option<&str>,
    ) -> Result<LoopbackProvider> {
        if options.busy_every.is_some_and(|n| n < 2) {
            return Err(PingpongError::Config("busy_every must be at least 2".into()));
        }
        let mut registry = self.registry.write();
        if registry.names.contains_key(name) {
            return Err(PingpongError::Config(format!(
                "loopback endpoint {name:?} already registered"
            )));
        }
        registry.next_id += 1;
        let id = registry.next_id;
        let endpoint = Arc::new(Endpoint {
            id,
            name: name.to_owned(),
            key_mode: options.key_mode,
            av: RwLock::default(),
            contexts: RwLock::default(),
            regions: RwLock::default(),
            next_key: AtomicU64::new(FIRST_PROVIDER_KEY),
        });
        registry.names.insert(name.to_owned(), id);
        registry.endpoints.insert(id, endpoint.clone());
        debug!(name, id, key_mode = ?options.key_mode, "loopback endpoint registered");

        Ok(LoopbackProvider {
            fabric: self.clone(),
            endpoint,
            options,
            server: server.map(str::to_owned),
        })
    }

    pub(super) fn endpoint(&self, id: u64) -> Option<Arc<Endpoint>> {
        self.registry.read().endpoints.get(&id).cloned()
    }

    fn endpoint_by_name(&self, name: &str) -> Option<Arc<Endpoint>> {
        let registry = self.registry.read();
        registry.names.get(name).and_then(|id| registry.endpoints.get(id)).cloned()
    }

    /// The endpoint and receive context that `addr` names in the address
    /// table of the endpoint at `origin`.
    pub fn resolve(
        &self,
        origin: &EndpointAddress,
        addr: PeerAddr,
    ) -> Result<(EndpointAddress, usize)> {
        let from = self.endpoint(endpoint_id(origin)?).ok_or_else(|| {
            PingpongError::transport("resolve", format!("unknown endpoint {origin}"))
        })?;
        let (base, index) = addr.split(RX_CTX_BITS);
        let id = from.lookup(base)?;
        let peer = self.endpoint(id).ok_or_else(|| {
            PingpongError::transport("resolve", format!("endpoint {id} is gone"))
        })?;
        Ok((peer.address(), index))
    }

    fn unregister(&self, endpoint: &Endpoint) {
        let mut registry = self.registry.write();
        registry.names.remove(&endpoint.name);
        registry.endpoints.remove(&endpoint.id);
    }
}

pub struct LoopbackProvider {
    fabric: LoopbackFabric,
    endpoint: Arc<Endpoint>,
    options: LoopbackOptions,
    server: Option<String>,
}

impl LoopbackProvider {
    pub fn address(&self) -> EndpointAddress {
        self.endpoint.address()
    }

    pub fn fabric(&self) -> &LoopbackFabric {
        &self.fabric
    }

    fn register(&self, index: usize, buffers: &ChannelBuffers) -> Result<RmaInfo> {
        let key_mode = self.options.key_mode;
        let (send_key, recv_key) = match key_mode {
            KeyMode::Pooled => (RmaInfo::pooled_send_key(index), RmaInfo::pooled_recv_key(index)),
            KeyMode::PerRegistration => (
                self.endpoint.next_key.fetch_add(1, Ordering::Relaxed),
                self.endpoint.next_key.fetch_add(1, Ordering::Relaxed),
            ),
        };
        let send = Region::new(&buffers.send, false);
        let recv = Region::new(&buffers.recv, true);

        let mut regions = self.endpoint.regions.write();
        if regions.contains_key(&send_key) || regions.contains_key(&recv_key) {
            return Err(PingpongError::transport(
                "mr_reg",
                format!("channel {index}: key {send_key:#x} or {recv_key:#x} in use"),
            ));
        }
        regions.insert(send_key, send);
        regions.insert(recv_key, recv);

        let descriptor = |region: &Region, key| RemoteBufferDescriptor {
            addr: match key_mode {
                KeyMode::Pooled => 0,
                KeyMode::PerRegistration => region.base,
            },
            key,
        };
        Ok(RmaInfo { send: descriptor(&send, send_key), recv: descriptor(&recv, recv_key) })
    }
}

impl Provider for LoopbackProvider {
    type Transport = LoopbackTransport;

    fn name(&self) -> Cow<'_, str> {
        Cow::Borrowed("loopback")
    }

    fn key_mode(&self) -> KeyMode {
        self.options.key_mode
    }

    fn rx_ctx_bits(&self) -> u32 {
        RX_CTX_BITS
    }

    fn local_address(&self) -> Result<EndpointAddress> {
        Ok(self.endpoint.address())
    }

    fn server_address(&self) -> Result<EndpointAddress> {
        self.server
            .as_deref()
            .and_then(|name| self.fabric.endpoint_by_name(name))
            .map(|endpoint| endpoint.address())
            .ok_or_else(|| {
                PingpongError::transport("server_address", "couldn't get server address")
            })
    }

    fn insert_address(&mut self, addr: &EndpointAddress) -> Result<PeerAddr> {
        let id = endpoint_id(addr)?;
        let mut av = self.endpoint.av.write();
        av.push(id);
        Ok(PeerAddr((av.len() - 1) as u64))
    }

    fn open_channel(
        &mut self,
        index: usize,
        buffers: &ChannelBuffers,
        one_sided: bool,
    ) -> Result<LoopbackTransport> {
        if index >= 1 << RX_CTX_BITS {
            return Err(PingpongError::Config(format!(
                "channel {index} exceeds the receive context bits"
            )));
        }
        let already_open =
            || PingpongError::Config(format!("channel {index} already open"));
        if self.endpoint.contexts.read().get(&index).is_some_and(|c| c.is_open()) {
            return Err(already_open());
        }
        let local_rma = if one_sided { Some(self.register(index, buffers)?) } else { None };

        let context = self.endpoint.rx_context(index);
        if !context.adopt() {
            return Err(already_open());
        }
        debug!(channel = index, ?local_rma, "loopback channel open");
        Ok(LoopbackTransport::new(
            self.fabric.clone(),
            self.endpoint.clone(),
            index,
            context,
            local_rma,
            self.options,
        ))
    }
}

impl Drop for LoopbackProvider {
    fn drop(&mut self) {
        self.fabric.unregister(&self.endpoint);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ChannelTransport;

    #[test]
    fn names_are_unique() {
        let fabric = LoopbackFabric::new();
        let _server = fabric.open("server", LoopbackOptions::default(), None).unwrap();
        assert!(matches!(
            fabric.open("server", LoopbackOptions::default(), None),
            Err(PingpongError::Config(_))
        ));
    }

    #[test]
    fn missing_server_is_reported() {
        let fabric = LoopbackFabric::new();
        let client = fabric.open("client", LoopbackOptions::default(), Some("nobody")).unwrap();
        let err = client.server_address().unwrap_err();
        assert!(err.to_string().contains("couldn't get server address"), "{err}");
    }

    #[test]
    fn resolve_follows_the_address_table() {
        let fabric = LoopbackFabric::new();
        let server = fabric.open("server", LoopbackOptions::default(), None).unwrap();
        let mut client =
            fabric.open("client", LoopbackOptions::default(), Some("server")).unwrap();
        let base = client.insert_address(&client.server_address().unwrap()).unwrap();
        let (addr, index) =
            fabric.resolve(&client.address(), base.derive(5, RX_CTX_BITS)).unwrap();
        assert_eq!(addr, server.address());
        assert_eq!(index, 5);
    }

    #[test]
    fn registration_keys_follow_key_mode() {
        let fabric = LoopbackFabric::new();
        let buffers = ChannelBuffers::new(3, 4096).unwrap();

        let options = LoopbackOptions { key_mode: KeyMode::Pooled, ..Default::default() };
        let mut pooled = fabric.open("pooled", options, None).unwrap();
        let transport = pooled.open_channel(3, &buffers, true).unwrap();
        assert_eq!(transport.local_rma(), Some(RmaInfo::pooled(3)));
        drop(transport);

        let mut own = fabric.open("own", LoopbackOptions::default(), None).unwrap();
        let info = own.open_channel(3, &buffers, true).unwrap().local_rma().unwrap();
        assert_eq!(info.send.addr, buffers.send.addr());
        assert_eq!(info.recv.addr, buffers.recv.addr());
        assert_ne!(info.send.key, info.recv.key);
    }

    #[test]
    fn region_bounds() {
        let region = Region { base: 0x1000, len: 0x100, remote_write: true };
        assert_eq!(region.resolve(KeyMode::PerRegistration, 0x1000, 0x100), Some(0x1000));
        assert_eq!(region.resolve(KeyMode::PerRegistration, 0x1001, 0x100), None);
        assert_eq!(region.resolve(KeyMode::PerRegistration, 0x0fff, 1), None);
        assert_eq!(region.resolve(KeyMode::Pooled, 0x80, 0x80), Some(0x1080));
        assert_eq!(region.resolve(KeyMode::Pooled, 0x80, 0x81), None);
    }
}
