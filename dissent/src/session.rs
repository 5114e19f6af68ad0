//! Per-round session: configuration, scratch ownership, entry points.
//!
//! A round owns its scratch directory for the whole run; the directory is
//! removed on every abort path and handed to the caller inside
//! [`RoundOutput`] on success, so partial outputs never outlive a failed
//! round.

use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use dissent_core::{NodeId, RoundId};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tracing::{info, Instrument};

use crate::{
    bulk,
    error::{RoundError, RoundFailure},
    shuffle,
    topology::Links,
};

/// The four addresses a participant is launched with.
#[derive(Debug, Clone, Copy)]
pub struct Endpoints {
    /// Where this participant listens.
    pub me: SocketAddr,
    /// The leader's listener.
    pub leader: SocketAddr,
    /// The ring predecessor's listener.
    pub prev: SocketAddr,
    /// The ring successor's listener.
    pub next: SocketAddr,
}

/// The decoded launch tuple a participant runs one round with.
#[derive(Debug, Clone)]
pub struct RoundConfig {
    /// This participant's id in `0..n_nodes`; id 0 leads.
    pub id: NodeId,
    /// Number of participants.
    pub n_nodes: usize,
    /// The round identifier tagged onto every envelope.
    pub round: RoundId,
    /// RSA modulus width for both keypairs.
    pub key_bits: usize,
    /// Slot size every shuffle submission is padded to.
    pub max_len: usize,
    /// Connection attempt budget during setup.
    pub connect_attempts: usize,
    /// The participant's addresses.
    pub endpoints: Endpoints,
}

impl RoundConfig {
    /// Whether this participant coordinates the round.
    pub fn is_leader(&self) -> bool {
        self.id.is_leader()
    }

    /// Wallclock budget for a single phase.
    pub(crate) fn phase_budget(&self) -> Duration {
        Duration::from_secs(30 * self.n_nodes as u64)
    }

    fn validate(&self) -> Result<(), String> {
        if self.n_nodes < 3 {
            return Err(format!("need at least 3 nodes, got {}", self.n_nodes));
        }
        if self.id.index() >= self.n_nodes {
            return Err(format!("id {} out of range 0..{}", self.id.0, self.n_nodes));
        }
        if self.key_bits < 1024 {
            return Err(format!("key width {} below the 1024-bit minimum", self.key_bits));
        }
        if self.max_len == 0 {
            return Err("slot size must be non-zero".into());
        }
        Ok(())
    }
}

/// Timing and sizing record of a successful round.
#[derive(Debug, Clone)]
pub struct RoundSummary {
    /// Wall time from listener handover to delivery.
    pub wall_time: Duration,
    /// Size of this participant's submitted ciphertext (its descriptor,
    /// for bulk rounds).
    pub cipher_len: usize,
    /// Sizes of the delivered slots.
    pub slot_sizes: Vec<usize>,
}

/// A delivered round: one plaintext per slot, each also written to a file
/// under the round's scratch directory.
#[derive(Debug)]
pub struct RoundOutput {
    /// The delivered plaintexts, in slot order.
    pub messages: Vec<Vec<u8>>,
    /// One flat file per slot, inside the scratch directory.
    pub files: Vec<PathBuf>,
    /// Timing and sizing record.
    pub summary: RoundSummary,
    scratch: TempDir,
}

impl RoundOutput {
    /// The scratch directory holding the slot files. Removed when the
    /// output is dropped.
    pub fn scratch_dir(&self) -> &Path {
        self.scratch.path()
    }

    /// Keeps the slot files on disk past the lifetime of this value and
    /// returns their paths.
    pub fn persist(self) -> Vec<PathBuf> {
        let _ = self.scratch.into_path();
        self.files
    }
}

/// Runs one shuffle round to completion.
///
/// `listener` must already be bound to `config.endpoints.me`; handing it in
/// pre-bound keeps the accept queue open before any peer dials.
pub async fn run_shuffle(
    config: RoundConfig,
    message: Vec<u8>,
    listener: TcpListener,
) -> Result<RoundOutput, RoundFailure> {
    let span = tracing::info_span!("round", id = config.id.0, round = config.round);
    async move {
        let (scratch, started, mut links) = setup(&config, listener).await?;
        let outcome = shuffle::run(&config, &mut links, &message, config.max_len).await?;
        finish(scratch, started, outcome.cipher_len, outcome.slots, 6)
    }
    .instrument(span)
    .await
}

/// Runs one bulk round to completion. Same contract as [`run_shuffle`].
pub async fn run_bulk(
    config: RoundConfig,
    message: Vec<u8>,
    listener: TcpListener,
) -> Result<RoundOutput, RoundFailure> {
    let span = tracing::info_span!("round", id = config.id.0, round = config.round);
    async move {
        let (scratch, started, mut links) = setup(&config, listener).await?;
        let outcome = bulk::run(&config, &mut links, &message).await?;
        finish(scratch, started, outcome.descriptor_len, outcome.slots, 5)
    }
    .instrument(span)
    .await
}

async fn setup(
    config: &RoundConfig,
    listener: TcpListener,
) -> Result<(TempDir, Instant, Links), RoundFailure> {
    config
        .validate()
        .map_err(|e| RoundFailure::new(0, RoundError::Local(e)))?;
    let scratch = TempDir::new().map_err(|e| RoundFailure::new(0, RoundError::Io(e)))?;
    let started = Instant::now();
    info!(
        id = config.id.0,
        n = config.n_nodes,
        leader = config.is_leader(),
        "node started"
    );
    let links = Links::establish(config, listener)
        .await
        .map_err(|e| RoundFailure::new(0, e))?;
    Ok((scratch, started, links))
}

fn finish(
    scratch: TempDir,
    started: Instant,
    cipher_len: usize,
    slots: Vec<Vec<u8>>,
    done_phase: u8,
) -> Result<RoundOutput, RoundFailure> {
    let mut files = Vec::with_capacity(slots.len());
    for (i, slot) in slots.iter().enumerate() {
        let path = scratch.path().join(format!("slot_{i}.out"));
        std::fs::write(&path, slot)
            .map_err(|e| RoundFailure::new(done_phase, RoundError::Io(e)))?;
        files.push(path);
    }
    let summary = RoundSummary {
        wall_time: started.elapsed(),
        cipher_len,
        slot_sizes: slots.iter().map(Vec::len).collect(),
    };
    info!(secs = summary.wall_time.as_secs_f64(), "finished");
    Ok(RoundOutput {
        messages: slots,
        files,
        summary,
        scratch,
    })
}
