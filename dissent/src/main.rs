use std::net::{IpAddr, SocketAddr};

use anyhow::Context;
use clap::Parser;
use dissent::{run_bulk, run_shuffle, Endpoints, RoundConfig};
use dissent_core::NodeId;
use rand::RngCore;
use tokio::net::TcpListener;
use tracing::error;
use tracing_subscriber::EnvFilter;

/// One participant of an accountable anonymous messaging round.
///
/// The external driver launches one process per participant and passes the
/// whole topology positionally; this binary only decodes the tuple and
/// hands it to the round entry points.
#[derive(Parser, Debug)]
#[clap(name = "dissent-node")]
struct Args {
    /// Participant id in 0..n_nodes; id 0 leads.
    id: u32,
    /// RSA modulus width in bits.
    key_len: usize,
    /// Round identifier.
    round_id: u64,
    /// Number of participants.
    n_nodes: usize,
    my_ip: IpAddr,
    my_port: u16,
    leader_ip: IpAddr,
    leader_port: u16,
    prev_ip: IpAddr,
    prev_port: u16,
    next_ip: IpAddr,
    next_port: u16,
    /// A message length to fill with random bytes, or a file to read.
    msg_len_or_file: String,
    /// Shuffle slot size; every participant must pass the same value.
    max_len: Option<usize>,
    /// Run the bulk transport instead of the plain shuffle.
    #[clap(long)]
    bulk: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();

    let message = match args.msg_len_or_file.parse::<usize>() {
        Ok(len) => {
            let mut bytes = vec![0u8; len];
            rand::thread_rng().fill_bytes(&mut bytes);
            bytes
        }
        Err(_) => std::fs::read(&args.msg_len_or_file)
            .with_context(|| format!("reading message file {}", args.msg_len_or_file))?,
    };

    let config = RoundConfig {
        id: NodeId(args.id),
        n_nodes: args.n_nodes,
        round: args.round_id,
        key_bits: args.key_len,
        max_len: args
            .max_len
            .unwrap_or_else(|| message.len().next_power_of_two().max(16)),
        connect_attempts: 20,
        endpoints: Endpoints {
            me: SocketAddr::new(args.my_ip, args.my_port),
            leader: SocketAddr::new(args.leader_ip, args.leader_port),
            prev: SocketAddr::new(args.prev_ip, args.prev_port),
            next: SocketAddr::new(args.next_ip, args.next_port),
        },
    };

    let listener = TcpListener::bind(config.endpoints.me)
        .await
        .with_context(|| format!("binding {}", config.endpoints.me))?;

    let result = if args.bulk {
        run_bulk(config, message, listener).await
    } else {
        run_shuffle(config, message, listener).await
    };

    match result {
        Ok(output) => {
            let summary = output.summary.clone();
            println!(
                "round complete in {:.3}s, cipher {} bytes, slots {:?}",
                summary.wall_time.as_secs_f64(),
                summary.cipher_len,
                summary.slot_sizes,
            );
            for path in output.persist() {
                println!("{}", path.display());
            }
            Ok(())
        }
        Err(failure) => {
            match failure.blamed_peer() {
                Some(peer) => error!(phase = failure.phase, %peer, "round aborted: {}", failure.error),
                None => error!(phase = failure.phase, "round aborted: {}", failure.error),
            }
            anyhow::bail!("round aborted in phase {}: {}", failure.phase, failure.error)
        }
    }
}
