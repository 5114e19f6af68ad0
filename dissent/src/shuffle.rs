//! The five-phase shuffle driver.
//!
//! Every phase has a single leader-coordinated completion point; the state
//! machine only moves forward. The pure protocol steps live in
//! `dissent_core::shuffle`, this module does the socket choreography.

use dissent_core::{
    error::{CryptoError, ProtocolViolation, Reason},
    msgs::{GoVector, KeyReveal, SignedEnvelope, TaggedCipher},
    onion::{self, Onion},
    padding,
    shuffle::{self, ShufflePhase},
    sign, wire, NodeId, LEADER,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info, warn};

use crate::{
    error::{step, RoundError, RoundFailure},
    keyx::{self, Exchanged},
    net,
    session::RoundConfig,
    topology::Links,
};

/// What a completed shuffle hands back to its caller.
pub(crate) struct ShuffleOutcome {
    /// The delivered plaintexts, in shuffled slot order.
    pub(crate) slots: Vec<Vec<u8>>,
    /// Size of this participant's submitted onion ciphertext.
    pub(crate) cipher_len: usize,
}

/// Runs one complete shuffle round over established links.
pub(crate) async fn run(
    cfg: &RoundConfig,
    links: &mut Links,
    message: &[u8],
    max_len: usize,
) -> Result<ShuffleOutcome, RoundFailure> {
    let budget = cfg.phase_budget();
    let mut rng = StdRng::from_entropy();

    let phase = ShufflePhase::KeyExchange;
    let keyx = step(phase.number(), budget, keyx::exchange(cfg, links)).await?;

    let phase = ShufflePhase::Submit;
    let (own, leader_bag) = step(
        phase.number(),
        budget,
        submit(cfg, links, &keyx, &mut rng, message, max_len),
    )
    .await?;

    let phase = ShufflePhase::Anonymize;
    let final_bag = step(
        phase.number(),
        budget,
        anonymize(cfg, links, &keyx, &mut rng, leader_bag),
    )
    .await?;

    let phase = ShufflePhase::Verify;
    let bag = step(phase.number(), budget, verify(cfg, links, &keyx, &own, final_bag)).await?;

    let phase = ShufflePhase::Reveal;
    let slots = step(phase.number(), budget, reveal(cfg, links, &keyx, &bag)).await?;

    info!(id = cfg.id.0, slots = slots.len(), "shuffle complete");
    Ok(ShuffleOutcome {
        slots,
        cipher_len: own.outer.bytes.len(),
    })
}

/// Phase 2: build both onion forms and hand the outer one to the leader,
/// which assembles the submission bag.
async fn submit(
    cfg: &RoundConfig,
    links: &mut Links,
    keyx: &Exchanged,
    rng: &mut StdRng,
    message: &[u8],
    max_len: usize,
) -> Result<(Onion, Option<Vec<TaggedCipher>>), RoundError> {
    let padded = padding::pad(message, max_len)?;
    let own = onion::build(rng, &keyx.book, cfg.round, &padded)?;
    debug!(id = cfg.id.0, len = own.outer.bytes.len(), "onion built");

    match links {
        Links::Leader(leader) => {
            let mut others = Vec::with_capacity(cfg.n_nodes - 1);
            for (from, frame) in leader.fan_in().await? {
                let cipher: TaggedCipher = net::decode_from(&frame, from)?;
                others.push((from, cipher));
            }
            let bag = shuffle::collect_bag(own.outer.clone(), others, cfg.round)?;
            info!(id = cfg.id.0, "all ciphertexts submitted");
            Ok((own, Some(bag)))
        }
        Links::Member(member) => {
            member
                .send_leader(&wire::encode(&own.outer).map_err(CryptoError::from)?)
                .await?;
            Ok((own, None))
        }
    }
}

/// Phase 3: the bag travels the ring, permuted and peeled at every stop.
/// The leader peels before forwarding to node 1 and receives the fully
/// peeled bag from the last node.
async fn anonymize(
    cfg: &RoundConfig,
    links: &mut Links,
    keyx: &Exchanged,
    rng: &mut StdRng,
    leader_bag: Option<Vec<TaggedCipher>>,
) -> Result<Option<Vec<TaggedCipher>>, RoundError> {
    let n = cfg.n_nodes;
    match links {
        Links::Leader(leader) => {
            let bag =
                leader_bag.ok_or_else(|| RoundError::Local("submission bag missing".into()))?;
            let bag = shuffle::shuffle_and_peel(rng, &keyx.primary, cfg.round, n, bag, cfg.id)?;
            leader
                .send_to(NodeId(1), &wire::encode(&bag).map_err(CryptoError::from)?)
                .await?;
            debug!(id = cfg.id.0, "bag handed to node 1");

            let last = NodeId(n as u32 - 1);
            let frame = leader.recv_from(last).await?;
            let bag: Vec<TaggedCipher> = net::decode_from(&frame, last)?;
            if bag.len() != n {
                return Err(ProtocolViolation::new(last, Reason::MissingCiphertext).into());
            }
            debug!(id = cfg.id.0, "fully peeled bag received");
            Ok(Some(bag))
        }
        Links::Member(member) => {
            let pred = member.pred();
            let frame = member.recv_bag().await?;
            let bag: Vec<TaggedCipher> = net::decode_from(&frame, pred)?;
            let bag = shuffle::shuffle_and_peel(rng, &keyx.primary, cfg.round, n, bag, pred)?;
            member
                .send_bag(&wire::encode(&bag).map_err(CryptoError::from)?)
                .await?;
            debug!(id = cfg.id.0, "bag shuffled and forwarded");
            Ok(None)
        }
    }
}

/// Phase 4: the leader broadcasts the final bag; everyone checks its own
/// inner ciphertext is present and exchanges signed go votes agreeing on a
/// digest of the bag.
async fn verify(
    cfg: &RoundConfig,
    links: &mut Links,
    keyx: &Exchanged,
    own: &Onion,
    final_bag: Option<Vec<TaggedCipher>>,
) -> Result<Vec<TaggedCipher>, RoundError> {
    let bag = match links {
        Links::Leader(leader) => {
            let bag =
                final_bag.ok_or_else(|| RoundError::Local("final bag missing".into()))?;
            leader
                .broadcast(&wire::encode(&bag).map_err(CryptoError::from)?)
                .await?;
            bag
        }
        Links::Member(member) => {
            let frame = member.recv_leader().await?;
            let bag: Vec<TaggedCipher> = net::decode_from(&frame, LEADER)?;
            if bag.len() != cfg.n_nodes {
                return Err(ProtocolViolation::new(LEADER, Reason::MissingCiphertext).into());
            }
            bag
        }
    };

    let vote = shuffle::make_vote(cfg.id, cfg.round, &bag, &own.inner)?;
    if !vote.go {
        warn!(id = cfg.id.0, "own ciphertext missing from the final bag");
    }
    let env = sign::sign_envelope(
        cfg.id,
        &keyx.primary,
        wire::encode(&vote).map_err(CryptoError::from)?,
    )?;

    let vector = match links {
        Links::Leader(leader) => {
            let mut votes = vec![env];
            for (from, frame) in leader.fan_in().await? {
                let peer: SignedEnvelope = net::decode_from(&frame, from)?;
                if peer.sender != from {
                    return Err(ProtocolViolation::new(from, Reason::MalformedPayload).into());
                }
                keyx.book.verify(&peer)?;
                votes.push(peer);
            }
            let vector = GoVector { votes };
            leader
                .broadcast(&wire::encode(&vector).map_err(CryptoError::from)?)
                .await?;
            vector
        }
        Links::Member(member) => {
            member
                .send_leader(&wire::encode(&env).map_err(CryptoError::from)?)
                .await?;
            let frame = member.recv_leader().await?;
            net::decode_from::<GoVector>(&frame, LEADER)?
        }
    };

    shuffle::check_votes(&vector.votes, &keyx.book, cfg.round, vote.digest)?;
    info!(id = cfg.id.0, "all nodes report go");
    Ok(bag)
}

/// Phase 5: everyone discloses its secondary private key through the
/// leader, validates the full set, and peels the verified bag down to the
/// plaintexts.
async fn reveal(
    cfg: &RoundConfig,
    links: &mut Links,
    keyx: &Exchanged,
    bag: &[TaggedCipher],
) -> Result<Vec<Vec<u8>>, RoundError> {
    let disclosure = KeyReveal {
        id: cfg.id,
        round: cfg.round,
        secondary_priv_pem: dissent_core::keys::private_to_pem(&keyx.secondary)?,
    };
    let env = sign::sign_envelope(
        cfg.id,
        &keyx.primary,
        wire::encode(&disclosure).map_err(CryptoError::from)?,
    )?;

    let reveals = match links {
        Links::Leader(leader) => {
            let mut reveals = vec![env];
            for (from, frame) in leader.fan_in().await? {
                let peer: SignedEnvelope = net::decode_from(&frame, from)?;
                if peer.sender != from {
                    return Err(ProtocolViolation::new(from, Reason::MalformedPayload).into());
                }
                reveals.push(peer);
            }
            leader
                .broadcast(&wire::encode(&reveals).map_err(CryptoError::from)?)
                .await?;
            reveals
        }
        Links::Member(member) => {
            member
                .send_leader(&wire::encode(&env).map_err(CryptoError::from)?)
                .await?;
            let frame = member.recv_leader().await?;
            net::decode_from::<Vec<SignedEnvelope>>(&frame, LEADER)?
        }
    };

    let keys = shuffle::collect_reveals(&reveals, &keyx.book, cfg.round)?;
    let slots = shuffle::open_bag(bag, &keys, cfg.round)?;
    info!(id = cfg.id.0, "ciphertexts decrypted");
    Ok(slots)
}
