//! The key-exchange phase shared by both engines.
//!
//! Members report their primary public key (trusted on first use) and a
//! secondary public key signed under the primary. The leader validates all
//! reports, assembles the key book, and broadcasts it signed with its own
//! primary key.

use dissent_core::{
    error::{CryptoError, ProtocolViolation, Reason},
    keys::{self, KeyBook},
    msgs::{KeyReport, SignedEnvelope},
    sign, wire, LEADER,
};
use rand::{rngs::StdRng, SeedableRng};
use rsa::RsaPrivateKey;
use tracing::{debug, info};

use crate::{
    error::RoundError,
    net,
    session::RoundConfig,
    topology::Links,
};

/// This participant's keys for the round plus the validated book.
pub(crate) struct Exchanged {
    pub(crate) primary: RsaPrivateKey,
    pub(crate) secondary: RsaPrivateKey,
    pub(crate) book: KeyBook,
}

/// Runs the key exchange and returns the participant's keys and book.
pub(crate) async fn exchange(cfg: &RoundConfig, links: &mut Links) -> Result<Exchanged, RoundError> {
    let bits = cfg.key_bits;
    let (primary, secondary) = tokio::task::spawn_blocking(move || {
        let mut rng = StdRng::from_entropy();
        let primary = keys::generate(&mut rng, bits)?;
        let secondary = keys::generate(&mut rng, bits)?;
        Ok::<_, CryptoError>((primary, secondary))
    })
    .await
    .map_err(|e| RoundError::Local(format!("key generation task: {e}")))??;
    debug!(id = cfg.id.0, "keypairs ready");

    let report = build_report(cfg, &primary, &secondary)?;
    let book = match links {
        Links::Leader(leader) => {
            let mut reports = vec![report];
            for (from, frame) in leader.fan_in().await? {
                let peer: KeyReport = net::decode_from(&frame, from)?;
                if peer.id != from {
                    return Err(ProtocolViolation::new(from, Reason::MalformedPayload).into());
                }
                reports.push(peer);
            }
            let (announce, book) = keys::build_announce(cfg.round, cfg.n_nodes, &reports)?;
            info!(id = cfg.id.0, "all public keys collected");

            let payload = wire::encode(&announce).map_err(CryptoError::from)?;
            let env = sign::sign_envelope(cfg.id, &primary, payload)?;
            let bytes = wire::encode(&env).map_err(CryptoError::from)?;
            leader.broadcast(&bytes).await?;
            book
        }
        Links::Member(member) => {
            let bytes = wire::encode(&report).map_err(CryptoError::from)?;
            member.send_leader(&bytes).await?;
            let frame = member.recv_leader().await?;
            let env: SignedEnvelope = net::decode_from(&frame, LEADER)?;
            keys::verify_announce(&env, cfg.round, cfg.n_nodes)?
        }
    };
    info!(id = cfg.id.0, "key book verified");
    Ok(Exchanged {
        primary,
        secondary,
        book,
    })
}

fn build_report(
    cfg: &RoundConfig,
    primary: &RsaPrivateKey,
    secondary: &RsaPrivateKey,
) -> Result<KeyReport, RoundError> {
    let secondary_pem = keys::public_to_pem(&secondary.to_public_key())?;
    let attested = sign::sign_envelope(cfg.id, primary, secondary_pem.into_bytes())?;
    Ok(KeyReport {
        id: cfg.id,
        round: cfg.round,
        ip: cfg.endpoints.me.ip().to_string(),
        port: cfg.endpoints.me.port(),
        primary_pem: keys::public_to_pem(&primary.to_public_key())?,
        secondary: attested,
    })
}
