//! Accountable group-anonymity rounds over TCP.
//!
//! A fixed set of `n >= 3` participants exchanges messages in a single
//! round such that the origin of each delivered message is hidden inside
//! the set of honest participants, any deviation is detected and pinned on
//! a participant before delivery, and the round either succeeds everywhere
//! or aborts with a blamable fault.
//!
//! Two engines share one topology and session model: the onion shuffle for
//! short equal-length messages, and the bulk transport for long uneven
//! ones, which disseminates its slot descriptors through a hosted shuffle
//! round.
#![deny(missing_docs, unreachable_pub, unused_must_use)]
#![deny(clippy::all)]

pub mod error;
pub mod session;

mod bulk;
mod keyx;
mod net;
mod shuffle;
mod topology;

pub use error::{RoundError, RoundFailure, TransportError};
pub use session::{run_bulk, run_shuffle, Endpoints, RoundConfig, RoundOutput, RoundSummary};
