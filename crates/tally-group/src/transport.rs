//! Transport layer: tarpc RPC between participants and the coordinator.
//!
//! `CollectiveService` is the RPC interface rank 0 hosts for the group.
//! `framed_transport` puts tarpc's serde transport on top of any byte stream
//! (a TCP socket between processes); in-process groups use tarpc's channel
//! transport instead.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::op::ReduceOp;

/// Protocol version. Incremented on breaking wire format changes.
pub const PROTOCOL_VERSION: u32 = 1;

/// Largest frame accepted on a byte-stream transport.
pub const MAX_FRAME_BYTES: usize = 256 * 1024 * 1024;

/// Which collective a participant entered for a round.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Collective {
    Barrier,
    Broadcast { root: u32 },
    Gather { root: u32 },
    AllGather,
    Reduce { op: ReduceOp, root: u32 },
    AllReduce { op: ReduceOp },
}

/// One participant's share of a collective round.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Contribution {
    /// Round number; every participant numbers its collectives identically.
    pub round: u64,
    /// Contributing rank.
    pub rank: u32,
    /// The collective being performed.
    pub kind: Collective,
    /// Raw bytes (reals in native layout for reductions).
    pub payload: Vec<u8>,
}

/// Create a tarpc serde transport over a byte stream.
///
/// Uses length-delimited framing + JSON codec for tarpc message exchange.
pub fn framed_transport<S, Item, SinkItem>(
    stream: S,
) -> tarpc::serde_transport::Transport<S, Item, SinkItem, tokio_serde::formats::Json<Item, SinkItem>>
where
    S: AsyncRead + AsyncWrite,
    Item: for<'de> Deserialize<'de>,
    SinkItem: Serialize,
{
    tarpc::serde_transport::new(
        tokio_util::codec::length_delimited::Builder::new()
            .max_frame_length(MAX_FRAME_BYTES)
            .new_framed(stream),
        tokio_serde::formats::Json::default(),
    )
}

/// RPC service the coordinator exposes to participants.
///
/// Every participant, rank 0 included, is a client. Collective calls return
/// once the whole group contributed to the round.
#[tarpc::service]
pub trait CollectiveService {
    /// Handshake. Fails if the version, group size or rank disagree with the host.
    async fn join(version: u32, rank: u32, size: u32) -> Result<(), String>;

    /// Contribute to a collective round and wait for its result.
    ///
    /// Rooted collectives return the result to every participant; the
    /// non-root callers discard it.
    async fn contribute(contribution: Contribution) -> Result<Vec<u8>, String>;

    /// Queue a point-to-point message from `source` to `dest`.
    async fn post(source: u32, dest: u32, tag: u32, payload: Vec<u8>) -> Result<(), String>;

    /// Take the next message from `source` to `dest` with `tag`, waiting for one.
    async fn fetch(dest: u32, source: u32, tag: u32) -> Result<Vec<u8>, String>;

    /// Health check ping. Returns the same sequence number.
    async fn ping(seq: u64) -> u64;
}
