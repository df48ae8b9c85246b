pub mod node;

pub use node::*;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};

use crate::consensus::{ConsensusEvent, ConsensusMessage, MessageCodec, MsgInfo};

/*
    Peers exchange opaque byte payloads tagged with a channel id. Delivery
    is in order per (peer, channel) and unordered across peers. A broadcast
    sends the same payload to every connected peer; the node's own messages
    reach its state machine through the internal queue, not the network.
*/

pub type PeerId = String;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub enum ChannelId {
    State,
    Data,
    Vote,
    VoteSetBits,
}

impl ChannelId {
    pub fn as_byte(&self) -> u8 {
        match self {
            ChannelId::State => 0x20,
            ChannelId::Data => 0x21,
            ChannelId::Vote => 0x22,
            ChannelId::VoteSetBits => 0x23,
        }
    }
}

/// Outbound side of the peer transport.
pub trait PeerChannel: Send + Sync {
    fn broadcast(&self, channel: ChannelId, bytes: Vec<u8>);

    /// Returns false if the peer is unknown or gone.
    fn send(&self, peer: &PeerId, channel: ChannelId, bytes: Vec<u8>) -> bool;
}

/// An inbound payload.
#[derive(Clone, Debug)]
pub struct Envelope {
    pub from: PeerId,
    pub channel: ChannelId,
    pub bytes: Vec<u8>,
}

/// Drops everything. For a node running alone.
pub struct NullPeerChannel;

impl PeerChannel for NullPeerChannel {
    fn broadcast(&self, _channel: ChannelId, _bytes: Vec<u8>) {}

    fn send(&self, _peer: &PeerId, _channel: ChannelId, _bytes: Vec<u8>) -> bool {
        false
    }
}

type Routes = HashMap<PeerId, mpsc::UnboundedSender<Envelope>>;

/// In-process hub connecting every joined peer to every other.
#[derive(Clone, Default)]
pub struct LocalNetwork {
    routes: Arc<Mutex<Routes>>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        LocalNetwork::default()
    }

    /// Connects `peer`, replacing any earlier connection under the same id.
    pub fn join(&self, peer: &str) -> (LocalPeer, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut routes) = self.routes.lock() {
            routes.insert(peer.to_string(), tx);
        }
        debug!(peer, "joined local network");
        let handle = LocalPeer {
            id: peer.to_string(),
            network: self.clone(),
        };
        (handle, rx)
    }

    /// Disconnects `peer`; payloads addressed to it are dropped from now on.
    pub fn leave(&self, peer: &str) {
        if let Ok(mut routes) = self.routes.lock() {
            routes.remove(peer);
        }
        debug!(peer, "left local network");
    }

    pub fn peers(&self) -> Vec<PeerId> {
        self.routes
            .lock()
            .map(|routes| routes.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn deliver(&self, to: &str, envelope: Envelope) -> bool {
        let Ok(routes) = self.routes.lock() else {
            return false;
        };
        match routes.get(to) {
            Some(tx) => tx.send(envelope).is_ok(),
            None => false,
        }
    }
}

/// One peer's handle on a [`LocalNetwork`].
#[derive(Clone)]
pub struct LocalPeer {
    id: PeerId,
    network: LocalNetwork,
}

impl LocalPeer {
    pub fn id(&self) -> &PeerId {
        &self.id
    }
}

impl PeerChannel for LocalPeer {
    fn broadcast(&self, channel: ChannelId, bytes: Vec<u8>) {
        for peer in self.network.peers() {
            if peer == self.id {
                continue;
            }
            let envelope = Envelope {
                from: self.id.clone(),
                channel,
                bytes: bytes.clone(),
            };
            if !self.network.deliver(&peer, envelope) {
                trace!(from = %self.id, to = %peer, "dropped broadcast to closed peer");
            }
        }
    }

    fn send(&self, peer: &PeerId, channel: ChannelId, bytes: Vec<u8>) -> bool {
        self.network.deliver(
            peer,
            Envelope {
                from: self.id.clone(),
                channel,
                bytes,
            },
        )
    }
}

/*
    Turns inbound payloads into consensus events. Undecodable payloads and
    payloads that arrive on the wrong channel are dropped here. Peer state
    announcements (NewRoundStep, NewValidBlock, HasVote, ProposalPol,
    VoteSetBits) only matter for gossip and are not forwarded.
*/
pub struct Reactor {
    codec: MessageCodec,
    mailbox: mpsc::Sender<ConsensusEvent>,
}

impl Reactor {
    pub fn new(mailbox: mpsc::Sender<ConsensusEvent>) -> Self {
        Reactor {
            codec: MessageCodec::default(),
            mailbox,
        }
    }

    pub async fn run(self, mut inbound: mpsc::UnboundedReceiver<Envelope>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    debug!("reactor shutting down");
                    return;
                }
                envelope = inbound.recv() => {
                    let Some(envelope) = envelope else {
                        debug!("inbound channel closed");
                        return;
                    };
                    if !self.receive(envelope).await {
                        debug!("consensus mailbox closed, stopping reactor");
                        return;
                    }
                }
            }
        }
    }

    /// Returns false once the mailbox is closed.
    pub async fn receive(&self, envelope: Envelope) -> bool {
        let Envelope { from, channel, bytes } = envelope;
        let msg = match self.codec.decode(&bytes) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(peer = %from, channel = channel.as_byte(), err = %e, "dropping undecodable message");
                return true;
            }
        };
        if msg.channel() != channel {
            warn!(peer = %from, channel = channel.as_byte(), "message on the wrong channel");
            return true;
        }
        match msg {
            ConsensusMessage::Proposal(_)
            | ConsensusMessage::BlockPart { .. }
            | ConsensusMessage::Vote(_)
            | ConsensusMessage::VoteSetMaj23 { .. } => {}
            other => {
                trace!(peer = %from, msg = ?other, "peer state message");
                return true;
            }
        }
        self.mailbox
            .send(ConsensusEvent::Message(MsgInfo::from_peer(msg, from)))
            .await
            .is_ok()
    }
}
