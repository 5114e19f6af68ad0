//! Ring wiring over TCP.
//!
//! The leader accepts one connection per other participant and orders them
//! by the id announced in the connection preamble. Ring links are opened
//! only between consecutive non-leaders: the leader-to-node-1 handoff and
//! the last-node-to-leader handoff ride the leader sockets that exist
//! anyway.

use dissent_core::{
    error::{CryptoError, ProtocolViolation, Reason},
    msgs::Hello,
    wire, NodeId,
};
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

use crate::{
    error::{RoundError, TransportError},
    net,
    session::RoundConfig,
};

/// A participant's established sockets for one round.
pub(crate) enum Links {
    /// The leader's view: one socket per other participant, ordered by id.
    Leader(LeaderLinks),
    /// A member's view: the leader socket plus any ring-neighbor links.
    Member(MemberLinks),
}

/// The leader's socket set.
pub(crate) struct LeaderLinks {
    peers: Vec<TcpStream>,
}

/// A member's socket set.
pub(crate) struct MemberLinks {
    id: NodeId,
    leader: TcpStream,
    ring_in: Option<TcpStream>,
    ring_out: Option<TcpStream>,
}

impl Links {
    /// Wires up every socket this participant needs, exchanging preambles.
    pub(crate) async fn establish(
        cfg: &RoundConfig,
        listener: TcpListener,
    ) -> Result<Self, RoundError> {
        if cfg.is_leader() {
            establish_leader(cfg, listener).await
        } else {
            establish_member(cfg, listener).await
        }
    }
}

async fn establish_leader(cfg: &RoundConfig, listener: TcpListener) -> Result<Links, RoundError> {
    let n = cfg.n_nodes;
    let mut slots: Vec<Option<TcpStream>> = (1..n).map(|_| None).collect();
    for _ in 1..n {
        let (mut stream, addr) = listener.accept().await.map_err(TransportError::from)?;
        stream.set_nodelay(true).map_err(TransportError::from)?;
        let frame = net::recv_frame(&mut stream).await?;
        let hello: Hello =
            wire::decode(&frame).map_err(|_| CryptoError::AnonymousPayload)?;
        if hello.round != cfg.round {
            return Err(ProtocolViolation::new(hello.id, Reason::RoundMismatch).into());
        }
        if hello.id.index() == 0 || hello.id.index() >= n {
            return Err(ProtocolViolation::new(hello.id, Reason::MalformedPayload).into());
        }
        let slot = &mut slots[hello.id.index() - 1];
        if slot.is_some() {
            return Err(ProtocolViolation::new(hello.id, Reason::MalformedPayload).into());
        }
        debug!(peer = hello.id.0, %addr, "accepted");
        *slot = Some(stream);
    }
    let peers = slots
        .into_iter()
        .map(|s| s.ok_or_else(|| RoundError::Local("peer connection missing".into())))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Links::Leader(LeaderLinks { peers }))
}

async fn establish_member(cfg: &RoundConfig, listener: TcpListener) -> Result<Links, RoundError> {
    let id = cfg.id;
    let n = cfg.n_nodes;
    let hello = wire::encode(&Hello {
        id,
        round: cfg.round,
    })
    .map_err(CryptoError::from)?;

    let leader_fut = async {
        let mut stream =
            net::connect_with_retry(cfg.endpoints.leader, cfg.connect_attempts).await?;
        net::send_frame(&mut stream, &hello).await?;
        Ok::<_, RoundError>(stream)
    };

    // Only nodes 2..n accept a ring predecessor; node 1 is fed by the
    // leader directly.
    let ring_in_fut = async {
        if id.index() < 2 {
            return Ok(None);
        }
        let (mut stream, addr) = listener.accept().await.map_err(TransportError::from)?;
        stream.set_nodelay(true).map_err(TransportError::from)?;
        let frame = net::recv_frame(&mut stream).await?;
        let peer: Hello = wire::decode(&frame).map_err(|_| CryptoError::AnonymousPayload)?;
        if peer.round != cfg.round {
            return Err(ProtocolViolation::new(peer.id, Reason::RoundMismatch).into());
        }
        if peer.id.index() != id.index() - 1 {
            return Err(ProtocolViolation::new(peer.id, Reason::MalformedPayload).into());
        }
        debug!(peer = peer.id.0, %addr, "ring predecessor connected");
        Ok::<_, RoundError>(Some(stream))
    };

    // Nodes 1..n-1 dial their ring successor; the last node hands the bag
    // back over its leader socket.
    let ring_out_fut = async {
        if id.index() > n - 2 {
            return Ok(None);
        }
        let mut stream = net::connect_with_retry(cfg.endpoints.next, cfg.connect_attempts).await?;
        net::send_frame(&mut stream, &hello).await?;
        Ok::<_, RoundError>(Some(stream))
    };

    let (leader, ring_in, ring_out) = tokio::try_join!(leader_fut, ring_in_fut, ring_out_fut)?;
    Ok(Links::Member(MemberLinks {
        id,
        leader,
        ring_in,
        ring_out,
    }))
}

impl LeaderLinks {
    /// Receives one frame from every peer concurrently, returned in id
    /// order regardless of arrival order.
    pub(crate) async fn fan_in(&mut self) -> Result<Vec<(NodeId, Vec<u8>)>, TransportError> {
        let reads = self.peers.iter_mut().enumerate().map(|(i, stream)| async move {
            let frame = net::recv_frame(stream).await?;
            Ok::<_, TransportError>((NodeId(i as u32 + 1), frame))
        });
        futures::future::try_join_all(reads).await
    }

    /// Sends the same frame to every peer concurrently.
    pub(crate) async fn broadcast(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        let writes = self
            .peers
            .iter_mut()
            .map(|stream| net::send_frame(stream, payload));
        futures::future::try_join_all(writes).await.map(|_| ())
    }

    /// Sends one frame to a single peer.
    pub(crate) async fn send_to(
        &mut self,
        id: NodeId,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        let stream = self
            .peers
            .get_mut(id.index().wrapping_sub(1))
            .ok_or(TransportError::NoRoute(id))?;
        net::send_frame(stream, payload).await
    }

    /// Receives one frame from a single peer.
    pub(crate) async fn recv_from(&mut self, id: NodeId) -> Result<Vec<u8>, TransportError> {
        let stream = self
            .peers
            .get_mut(id.index().wrapping_sub(1))
            .ok_or(TransportError::NoRoute(id))?;
        net::recv_frame(stream).await
    }
}

impl MemberLinks {
    /// The ring predecessor's id.
    pub(crate) fn pred(&self) -> NodeId {
        NodeId(self.id.0 - 1)
    }

    /// Sends one frame to the leader.
    pub(crate) async fn send_leader(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        net::send_frame(&mut self.leader, payload).await
    }

    /// Receives one frame from the leader.
    pub(crate) async fn recv_leader(&mut self) -> Result<Vec<u8>, TransportError> {
        net::recv_frame(&mut self.leader).await
    }

    /// Receives the bag from the ring predecessor (the leader, for node 1).
    pub(crate) async fn recv_bag(&mut self) -> Result<Vec<u8>, TransportError> {
        match &mut self.ring_in {
            Some(stream) => net::recv_frame(stream).await,
            None => net::recv_frame(&mut self.leader).await,
        }
    }

    /// Hands the bag to the ring successor (the leader, for the last node).
    pub(crate) async fn send_bag(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        match &mut self.ring_out {
            Some(stream) => net::send_frame(stream, payload).await,
            None => net::send_frame(&mut self.leader, payload).await,
        }
    }
}
