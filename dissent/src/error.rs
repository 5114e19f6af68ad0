//! Round-level error taxonomy.
//!
//! Transport problems retry only during connection setup; everything else
//! aborts the round. A [`RoundFailure`] records the phase the round died in
//! and, for violations, the blamable peer.

use std::{future::Future, io, net::SocketAddr, time::Duration};

use dissent_core::{
    error::{CryptoError, Fault, ProtocolViolation},
    NodeId,
};

/// A failure of the byte transport.
#[derive(Debug, thiserror::Error)]
#[allow(missing_docs)]
pub enum TransportError {
    #[error("connect to {addr} failed after {attempts} attempts")]
    Connect { addr: SocketAddr, attempts: usize },
    #[error("peer closed the connection mid-message")]
    Closed,
    #[error("frame of {0} bytes exceeds the frame limit")]
    Oversize(u64),
    #[error("no link to {0}")]
    NoRoute(NodeId),
    #[error("phase deadline exceeded")]
    Timeout,
    #[error("i/o: {0}")]
    Io(#[from] io::Error),
}

/// Any way a round can go wrong.
#[derive(Debug, thiserror::Error)]
#[allow(missing_docs)]
pub enum RoundError {
    #[error("transport: {0}")]
    Transport(#[from] TransportError),
    #[error("protocol violation by {0}")]
    Violation(#[from] ProtocolViolation),
    #[error("crypto: {0}")]
    Crypto(#[from] CryptoError),
    #[error("i/o: {0}")]
    Io(#[from] io::Error),
    #[error("local: {0}")]
    Local(String),
}

impl From<Fault> for RoundError {
    fn from(fault: Fault) -> Self {
        match fault {
            Fault::Violation(v) => v.into(),
            Fault::Crypto(c) => c.into(),
        }
    }
}

/// An aborted round: the error plus the phase it surfaced in.
#[derive(Debug, thiserror::Error)]
#[error("phase {phase}: {error}")]
pub struct RoundFailure {
    /// The phase number the round died in.
    pub phase: u8,
    /// What went wrong.
    pub error: RoundError,
}

impl RoundFailure {
    pub(crate) fn new(phase: u8, error: impl Into<RoundError>) -> Self {
        Self {
            phase,
            error: error.into(),
        }
    }

    /// The peer at fault, if the failure is a blamable violation.
    pub fn blamed_peer(&self) -> Option<NodeId> {
        match &self.error {
            RoundError::Violation(v) => Some(v.peer),
            _ => None,
        }
    }
}

/// Runs one phase body under the session's wallclock budget and tags any
/// failure with the phase number.
pub(crate) async fn step<T, F>(phase: u8, budget: Duration, fut: F) -> Result<T, RoundFailure>
where
    F: Future<Output = Result<T, RoundError>>,
{
    match tokio::time::timeout(budget, fut).await {
        Err(_) => Err(RoundFailure::new(phase, TransportError::Timeout)),
        Ok(result) => result.map_err(|e| RoundFailure::new(phase, e)),
    }
}
