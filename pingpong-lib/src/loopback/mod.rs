//! In-process provider. Endpoints find each other by name in a shared
//! [`LoopbackFabric`] and every operation is carried out by the posting
//! thread, so completions are ready as soon as the post returns.

mod loopback_fabric;
mod loopback_transport;

pub use loopback_fabric::{LoopbackFabric, LoopbackOptions, LoopbackProvider};
pub use loopback_transport::LoopbackTransport;
