use std::net::SocketAddr;

use dissent::{Endpoints, RoundConfig};
use dissent_core::NodeId;
use tokio::net::TcpListener;

pub const ROUND: u64 = 42;

/// Binds one loopback listener per participant so every node knows the full
/// address map before any of them starts.
pub async fn bind_ring(n: usize) -> (Vec<TcpListener>, Vec<SocketAddr>) {
    let mut listeners = Vec::with_capacity(n);
    let mut addrs = Vec::with_capacity(n);
    for _ in 0..n {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        addrs.push(listener.local_addr().unwrap());
        listeners.push(listener);
    }
    (listeners, addrs)
}

pub fn ring_config(id: usize, addrs: &[SocketAddr], max_len: usize) -> RoundConfig {
    let n = addrs.len();
    RoundConfig {
        id: NodeId(id as u32),
        n_nodes: n,
        round: ROUND,
        key_bits: 1024,
        max_len,
        connect_attempts: 20,
        endpoints: Endpoints {
            me: addrs[id],
            leader: addrs[0],
            prev: addrs[(id + n - 1) % n],
            next: addrs[(id + 1) % n],
        },
    }
}
