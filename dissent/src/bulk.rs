//! The bulk-transport driver.
//!
//! Key exchange, descriptor generation, a complete hosted shuffle round to
//! disseminate the descriptors anonymously, then the pad exchange and the
//! per-slot XOR reassembly.

use dissent_core::{
    bulk::{self, BulkPhase, Submission},
    error::{CryptoError, ProtocolViolation, Reason},
    msgs::{Descriptor, MasterPads, PadSet},
    wire, NodeId, LEADER,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info, warn};

use crate::{
    error::{step, RoundError, RoundFailure},
    keyx::{self, Exchanged},
    net,
    session::RoundConfig,
    shuffle,
    topology::Links,
};

/// What a completed bulk round hands back to its caller.
pub(crate) struct BulkOutcome {
    /// The delivered plaintexts, in slot order.
    pub(crate) slots: Vec<Vec<u8>>,
    /// Size of this participant's canonical descriptor.
    pub(crate) descriptor_len: usize,
}

/// Runs one complete bulk round over established links.
pub(crate) async fn run(
    cfg: &RoundConfig,
    links: &mut Links,
    message: &[u8],
) -> Result<BulkOutcome, RoundFailure> {
    let budget = cfg.phase_budget();
    let mut rng = StdRng::from_entropy();

    let phase = BulkPhase::KeyExchange;
    let keyx = step(phase.number(), budget, keyx::exchange(cfg, links)).await?;

    let phase = BulkPhase::DescriptorGen;
    let submission = step(phase.number(), budget, async {
        let submission =
            bulk::prepare_submission(&mut rng, &keyx.book, cfg.id, cfg.round, message)?;
        debug!(
            id = cfg.id.0,
            msg_len = message.len(),
            "descriptor and cheating pad ready"
        );
        Ok(submission)
    })
    .await?;

    // The descriptor dissemination is one full shuffle round, fresh keys
    // and all, riding the same links.
    let phase = BulkPhase::DescriptorShuffle;
    let payload = wire::encode(&submission.descriptor)
        .map_err(|e| RoundFailure::new(phase.number(), CryptoError::from(e)))?;
    let slot_len = bulk::shuffle_slot_len(&submission.descriptor)
        .map_err(|e| RoundFailure::new(phase.number(), e))?;
    let shuffled = shuffle::run(cfg, links, &payload, slot_len)
        .await
        .map_err(|inner| {
            warn!(
                id = cfg.id.0,
                inner_phase = inner.phase,
                "hosted descriptor shuffle failed"
            );
            RoundFailure::new(phase.number(), inner.error)
        })?;
    let descriptors = bulk::parse_descriptors(&shuffled.slots, cfg.round, cfg.n_nodes)
        .map_err(|e| RoundFailure::new(phase.number(), RoundError::from(e)))?;
    info!(id = cfg.id.0, "descriptors disseminated");

    let phase = BulkPhase::Transmit;
    let master = step(
        phase.number(),
        budget,
        transmit(cfg, links, &keyx, &descriptors, &submission),
    )
    .await?;

    let phase = BulkPhase::Verify;
    let slots = step(phase.number(), budget, async {
        deliver(&descriptors, &master)
    })
    .await?;

    info!(id = cfg.id.0, slots = slots.len(), "bulk round complete");
    Ok(BulkOutcome {
        slots,
        descriptor_len: payload.len(),
    })
}

/// Phase 3: expand and cross-check this participant's file for every slot,
/// exchange pad sets through the leader.
///
/// Exactly one slot must match the sealed seed this participant produced
/// for itself; zero matches mean its own descriptor was censored.
async fn transmit(
    cfg: &RoundConfig,
    links: &mut Links,
    keyx: &Exchanged,
    descriptors: &[Descriptor],
    submission: &Submission,
) -> Result<MasterPads, RoundError> {
    let n = cfg.n_nodes;
    let mut own_slots = Vec::new();
    let mut files = Vec::with_capacity(descriptors.len());
    for (slot, desc) in descriptors.iter().enumerate() {
        let (bytes, own) =
            bulk::slot_contribution(desc, slot, cfg.id, &keyx.primary, submission)?;
        if own {
            own_slots.push(slot);
        }
        files.push(bytes);
    }
    match own_slots.as_slice() {
        [] => {
            warn!(id = cfg.id.0, "own descriptor missing from the shuffle output");
            return Err(ProtocolViolation::new(cfg.id, Reason::MissingCiphertext).into());
        }
        [_] => {}
        [_, dup, ..] => {
            let author = descriptors[*dup].author;
            return Err(ProtocolViolation::new(author, Reason::DuplicateCiphertext)
                .with_slot(*dup)
                .into());
        }
    }

    let own_set = PadSet {
        id: cfg.id,
        slots: files,
    };
    match links {
        Links::Leader(leader) => {
            let mut sets = vec![own_set];
            for (from, frame) in leader.fan_in().await? {
                let set: PadSet = net::decode_from(&frame, from)?;
                if set.id != from || set.slots.len() != n {
                    return Err(ProtocolViolation::new(from, Reason::MalformedPayload).into());
                }
                sets.push(set);
            }
            let master = MasterPads { sets };
            leader
                .broadcast(&wire::encode(&master).map_err(CryptoError::from)?)
                .await?;
            info!(id = cfg.id.0, "master pad set broadcast");
            Ok(master)
        }
        Links::Member(member) => {
            member
                .send_leader(&wire::encode(&own_set).map_err(CryptoError::from)?)
                .await?;
            let frame = member.recv_leader().await?;
            let master: MasterPads = net::decode_from(&frame, LEADER)?;
            if master.sets.len() != n {
                return Err(ProtocolViolation::new(LEADER, Reason::MalformedPayload).into());
            }
            for (j, set) in master.sets.iter().enumerate() {
                if set.id != NodeId(j as u32) || set.slots.len() != n {
                    return Err(ProtocolViolation::new(LEADER, Reason::MalformedPayload).into());
                }
            }
            Ok(master)
        }
    }
}

/// Phase 4: re-hash every contribution against its descriptor and XOR each
/// slot back to its author's plaintext.
fn deliver(descriptors: &[Descriptor], master: &MasterPads) -> Result<Vec<Vec<u8>>, RoundError> {
    let mut out = Vec::with_capacity(descriptors.len());
    for (slot, desc) in descriptors.iter().enumerate() {
        let contributions: Vec<Vec<u8>> = master
            .sets
            .iter()
            .map(|set| set.slots[slot].clone())
            .collect();
        out.push(bulk::combine_slot(desc, slot, &contributions)?);
    }
    Ok(out)
}
