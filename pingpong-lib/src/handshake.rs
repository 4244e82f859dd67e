//! Peer discovery on the control channel and per-channel descriptor exchange.

use bytes::Bytes;
use tracing::{debug, info};

use crate::{
    api::{CompletionKind, EndpointAddress, KeyMode, PeerAddr, RmaInfo},
    buffer::CONTROL_MSG_SIZE,
    config::Role,
    error::{PingpongError, Result},
    progress::{ChannelGroup, ProgressDiscipline},
    provider::{ChannelTransport, Provider},
};

/// Position of the control channel (channel 0) in the setup group.
const CONTROL: usize = 0;

/// Resolves the peer endpoint and fills in every channel's peer address.
///
/// The client looks the server up, then sends its own endpoint name on
/// channel 0. The server learns the client from that message. Both derive
/// the per-channel addresses from the base address the same way and finish
/// with a token round trip on channel 0.
pub fn exchange_addresses<Pr, P>(
    provider: &mut Pr,
    group: &mut ChannelGroup<Pr::Transport, P>,
    role: Role,
) -> Result<()>
where
    Pr: Provider,
    P: ProgressDiscipline,
{
    if group.is_empty() || group.channel(CONTROL).index() != 0 {
        return Err(PingpongError::Custom("handshake needs channel 0 first"));
    }

    let base = match role {
        Role::Client => {
            let server = provider.server_address()?;
            let base = provider.insert_address(&server)?;
            assign_peer_addresses(provider, group, base)?;

            let local = provider.local_address()?;
            debug!(%local, %server, "sending local address");
            group.channel_mut(CONTROL).issue_control_send(&local.0)?;
            group.wait(CONTROL, 1)?;
            base
        }
        Role::Server => {
            group.channel_mut(CONTROL).issue_control_receive(CONTROL_MSG_SIZE)?;
            let done = group.wait(CONTROL, 1)?;
            let len = done[0].len;
            if done[0].kind != CompletionKind::Recv || len == 0 {
                return Err(PingpongError::desync(format!(
                    "expected peer address, got {:?}",
                    done[0]
                )));
            }
            let client = EndpointAddress(Bytes::copy_from_slice(
                group.channel(CONTROL).control_received(len)?,
            ));
            debug!(%client, "received peer address");
            let base = provider.insert_address(&client)?;
            assign_peer_addresses(provider, group, base)?;
            base
        }
    };

    group.synchronize_one(CONTROL)?;
    info!(
        provider = %provider.name(),
        ?role,
        peer = base.0,
        channels = group.len(),
        "handshake complete"
    );
    Ok(())
}

fn assign_peer_addresses<Pr, P>(
    provider: &Pr,
    group: &ChannelGroup<Pr::Transport, P>,
    base: PeerAddr,
) -> Result<()>
where
    Pr: Provider,
    P: ProgressDiscipline,
{
    let bits = provider.rx_ctx_bits();
    for channel in group.channels() {
        channel.set_peer_addr(base.derive(channel.index(), bits))?;
    }
    Ok(())
}

/// Gives the channel at `pos` the peer's buffer descriptors. With pooled
/// keys they are derived from the index; otherwise each side sends its own
/// and receives the peer's on that channel.
pub fn exchange_rma<T, P>(group: &mut ChannelGroup<T, P>, pos: usize, key_mode: KeyMode) -> Result<()>
where
    T: ChannelTransport,
    P: ProgressDiscipline,
{
    let channel = group.channel_mut(pos);
    let index = channel.index();
    if key_mode == KeyMode::Pooled {
        return channel.set_peer_rma(RmaInfo::pooled(index));
    }

    let mine = channel.local_rma().ok_or_else(|| {
        PingpongError::desync(format!("channel {index}: no registered buffers"))
    })?;
    info!(channel = index, "my rma info: {mine}");

    let mut encoded = [0u8; CONTROL_MSG_SIZE];
    let payload = mine.encode(&mut encoded)?;
    channel.issue_control_receive(CONTROL_MSG_SIZE)?;
    channel.issue_control_send(payload)?;

    let done = group.wait(pos, 2)?;
    let received: Vec<_> =
        done.iter().filter(|c| c.kind == CompletionKind::Recv).collect();
    if done.len() != 2 || received.len() != 1 {
        return Err(PingpongError::desync(format!(
            "channel {index}: rma info exchange completed with {done:?}"
        )));
    }
    let len = received[0].len;

    let channel = group.channel_mut(pos);
    let peer = RmaInfo::decode(channel.control_received(len)?)?;
    info!(channel = index, "peer rma info: {peer}");
    channel.set_peer_rma(peer)
}
