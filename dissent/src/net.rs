//! Length-prefixed framing and the retrying connector.
//!
//! Every stream message is `u64_be(len) || payload`. Reads loop until the
//! whole frame arrives; a peer closing mid-frame is a transport failure,
//! never a short read.

use std::{io, net::SocketAddr, time::Duration};

use dissent_core::{
    error::{ProtocolViolation, Reason},
    wire, NodeId,
};
use rand::Rng;
use serde::de::DeserializeOwned;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time::sleep,
};
use tracing::debug;

use crate::error::{RoundError, TransportError};

/// Upper bound on a single frame.
pub(crate) const MAX_FRAME: u64 = 1 << 30;

/// Writes one framed message.
pub(crate) async fn send_frame(
    stream: &mut TcpStream,
    payload: &[u8],
) -> Result<(), TransportError> {
    stream
        .write_all(&(payload.len() as u64).to_be_bytes())
        .await?;
    stream.write_all(payload).await?;
    stream.flush().await?;
    Ok(())
}

/// Reads one framed message.
pub(crate) async fn recv_frame(stream: &mut TcpStream) -> Result<Vec<u8>, TransportError> {
    let mut header = [0u8; 8];
    stream
        .read_exact(&mut header)
        .await
        .map_err(eof_to_closed)?;
    let len = u64::from_be_bytes(header);
    if len > MAX_FRAME {
        return Err(TransportError::Oversize(len));
    }
    let mut payload = vec![0u8; len as usize];
    stream
        .read_exact(&mut payload)
        .await
        .map_err(eof_to_closed)?;
    Ok(payload)
}

/// Decodes peer-supplied bytes, blaming `from` on failure.
pub(crate) fn decode_from<T: DeserializeOwned>(
    bytes: &[u8],
    from: NodeId,
) -> Result<T, RoundError> {
    wire::decode(bytes).map_err(|_| ProtocolViolation::new(from, Reason::MalformedPayload).into())
}

/// Connects with bounded retries and randomized backoff on the transient
/// refusals seen while the rest of the ring is still starting up.
pub(crate) async fn connect_with_retry(
    addr: SocketAddr,
    attempts: usize,
) -> Result<TcpStream, TransportError> {
    for attempt in 1..=attempts {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Err(e) if retriable(&e) => {
                if attempt == attempts {
                    break;
                }
                let backoff = rand::thread_rng().gen_range(5..=10);
                debug!(%addr, attempt, backoff, "connect refused, waiting for peer");
                sleep(Duration::from_secs(backoff)).await;
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(TransportError::Connect { addr, attempts })
}

fn retriable(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::InvalidInput
            | io::ErrorKind::AddrNotAvailable
    )
}

fn eof_to_closed(e: io::Error) -> TransportError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        TransportError::Closed
    } else {
        e.into()
    }
}
