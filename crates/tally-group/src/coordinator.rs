//! Coordinator: completes collective rounds for the whole group.
//!
//! Star topology: rank 0 hosts the coordinator, every participant sends its
//! contribution, the coordinator computes the round's result once all
//! contributions are in and answers everyone. Point-to-point messages go
//! through a mailbox kept here as well.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use tarpc::context;
use tarpc::server::{BaseChannel, Channel};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{oneshot, Mutex, Notify};
use tracing::{debug, info, warn};

use crate::error::GroupError;
use crate::op::OpRegistry;
use crate::transport::{Collective, CollectiveService, Contribution, PROTOCOL_VERSION};

type Outcome = Result<Vec<u8>, String>;

/// A collective round waiting for contributions.
struct Round {
    kind: Collective,
    payloads: Vec<Option<Vec<u8>>>,
    arrived: usize,
    /// First contract violation seen in this round, reported to everyone.
    fault: Option<String>,
    waiters: Vec<oneshot::Sender<Outcome>>,
}

impl Round {
    fn new(kind: Collective, size: usize) -> Self {
        Self {
            kind,
            payloads: vec![None; size],
            arrived: 0,
            fault: None,
            waiters: Vec::with_capacity(size),
        }
    }
}

type MailKey = (u32, u32, u32);

/// Point-to-point messages keyed by (source, dest, tag), FIFO per key.
#[derive(Default)]
struct Mailbox {
    queued: HashMap<MailKey, VecDeque<Vec<u8>>>,
    waiting: HashMap<MailKey, VecDeque<oneshot::Sender<Vec<u8>>>>,
}

impl Mailbox {
    fn post(&mut self, key: MailKey, payload: Vec<u8>) {
        if let Some(payload) = self.hand_to_waiter(key, payload) {
            self.queued.entry(key).or_default().push_back(payload);
        }
    }

    /// Give `payload` to the oldest live receiver; returns it if there is none.
    fn hand_to_waiter(&mut self, key: MailKey, mut payload: Vec<u8>) -> Option<Vec<u8>> {
        let Entry::Occupied(mut waiters) = self.waiting.entry(key) else {
            return Some(payload);
        };
        let undelivered = loop {
            let Some(tx) = waiters.get_mut().pop_front() else {
                break Some(payload);
            };
            match tx.send(payload) {
                Ok(()) => break None,
                // Receiver gave up; try the next one.
                Err(returned) => payload = returned,
            }
        };
        if waiters.get().is_empty() {
            waiters.remove();
        }
        undelivered
    }

    fn fetch(&mut self, key: MailKey) -> Result<Vec<u8>, oneshot::Receiver<Vec<u8>>> {
        if let Entry::Occupied(mut queued) = self.queued.entry(key) {
            let payload = queued.get_mut().pop_front();
            if queued.get().is_empty() {
                queued.remove();
            }
            if let Some(payload) = payload {
                return Ok(payload);
            }
        }
        let (tx, rx) = oneshot::channel();
        self.waiting.entry(key).or_default().push_back(tx);
        Err(rx)
    }

    #[cfg(test)]
    fn is_empty(&self) -> bool {
        self.queued.is_empty() && self.waiting.is_empty()
    }
}

/// Shared coordinator state.
struct CoordinatorState {
    size: usize,
    /// Rounds in progress, keyed by round number.
    rounds: HashMap<u64, Round>,
    mailbox: Mailbox,
    completed: u64,
}

impl CoordinatorState {
    /// Record a contribution; returns the receiver for the round's outcome.
    fn enter(&mut self, c: Contribution, registry: &RwLock<OpRegistry>) -> oneshot::Receiver<Outcome> {
        let (tx, rx) = oneshot::channel();
        let size = self.size;
        let rank = c.rank as usize;

        if rank >= size {
            let _ = tx.send(Err(format!("rank {rank} is out of range for a group of {size}")));
            return rx;
        }

        let round = self
            .rounds
            .entry(c.round)
            .or_insert_with(|| Round::new(c.kind, size));
        round.waiters.push(tx);

        if round.kind != c.kind && round.fault.is_none() {
            warn!(
                "round {}: rank {rank} entered {:?} while others entered {:?}",
                c.round, c.kind, round.kind
            );
            round.fault = Some(format!(
                "collective mismatch in round {}: {:?} vs {:?}",
                c.round, round.kind, c.kind
            ));
        }
        if round.payloads[rank].is_some() && round.fault.is_none() {
            round.fault = Some(format!("rank {rank} contributed twice to round {}", c.round));
        }
        round.payloads[rank] = Some(c.payload);
        round.arrived += 1;

        if round.arrived < size {
            return rx;
        }

        if let Some(round) = self.rounds.remove(&c.round) {
            let outcome = match round.fault {
                Some(fault) => Err(fault),
                None => {
                    let payloads = round.payloads.into_iter().flatten().collect::<Vec<_>>();
                    complete(round.kind, payloads, registry)
                }
            };
            for waiter in round.waiters {
                let _ = waiter.send(outcome.clone());
            }
            self.completed += 1;
            debug!("round {} complete ({:?})", c.round, round.kind);
        }
        rx
    }
}

/// Compute a round's result from all payloads, in rank order.
fn complete(kind: Collective, payloads: Vec<Vec<u8>>, registry: &RwLock<OpRegistry>) -> Outcome {
    match kind {
        Collective::Barrier => Ok(Vec::new()),
        Collective::Broadcast { root } => payloads
            .into_iter()
            .nth(root as usize)
            .ok_or_else(|| format!("broadcast root {root} did not contribute")),
        Collective::Gather { .. } | Collective::AllGather => {
            let len = payloads.first().map_or(0, Vec::len);
            if payloads.iter().any(|p| p.len() != len) {
                return Err("gather contributions differ in length".into());
            }
            Ok(payloads.concat())
        }
        Collective::Reduce { op, .. } | Collective::AllReduce { op } => {
            let reals = payloads
                .iter()
                .map(|p| decode_reals(p))
                .collect::<Result<Vec<_>, _>>()?;
            let registry = registry.read().unwrap_or_else(PoisonError::into_inner);
            let reduced = registry.reduce(op, &reals).map_err(|e| e.to_string())?;
            Ok(bytemuck::cast_slice(&reduced).to_vec())
        }
    }
}

/// Read native-endian reals from a payload of arbitrary alignment.
pub(crate) fn decode_reals(bytes: &[u8]) -> Result<Vec<f64>, String> {
    if bytes.len() % std::mem::size_of::<f64>() != 0 {
        return Err(format!("payload of {} bytes is not a whole number of reals", bytes.len()));
    }
    Ok(bytes
        .chunks_exact(std::mem::size_of::<f64>())
        .map(bytemuck::pod_read_unaligned::<f64>)
        .collect())
}

/// The group's coordinator. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Coordinator {
    state: Arc<Mutex<CoordinatorState>>,
    /// Operators used to complete reductions (the host's registry).
    registry: Arc<RwLock<OpRegistry>>,
    /// Open byte-stream connections.
    connections: Arc<AtomicUsize>,
    disconnected: Arc<Notify>,
}

impl Coordinator {
    /// Create a coordinator for a group of `size` participants.
    pub fn new(size: usize, registry: Arc<RwLock<OpRegistry>>) -> Self {
        Self {
            state: Arc::new(Mutex::new(CoordinatorState {
                size,
                rounds: HashMap::new(),
                mailbox: Mailbox::default(),
                completed: 0,
            })),
            registry,
            connections: Arc::new(AtomicUsize::new(0)),
            disconnected: Arc::new(Notify::new()),
        }
    }

    /// Serve a tarpc channel transport in-process.
    ///
    /// Returns a client that can call the coordinator. Must be called from
    /// within a tokio runtime context.
    pub fn spawn_channel(&self) -> crate::transport::CollectiveServiceClient {
        let (client_transport, server_transport) = tarpc::transport::channel::unbounded();

        let server = BaseChannel::with_defaults(server_transport);
        let handler = CoordinatorHandler {
            coordinator: self.clone(),
        };

        tokio::spawn(async move {
            use futures_util::StreamExt;
            server
                .execute(handler.serve())
                .for_each(|response| async move {
                    tokio::spawn(response);
                })
                .await;
        });

        crate::transport::CollectiveServiceClient::new(
            tarpc::client::Config::default(),
            client_transport,
        )
        .spawn()
    }

    /// Serve a single connected byte stream via tarpc.
    pub fn serve_connection<S>(&self, stream: S)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let transport = crate::transport::framed_transport(stream);
        let server = BaseChannel::with_defaults(transport);
        let handler = CoordinatorHandler {
            coordinator: self.clone(),
        };
        let connections = self.connections.clone();
        let disconnected = self.disconnected.clone();
        connections.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            use futures_util::StreamExt;
            server
                .execute(handler.serve())
                .for_each(|response| async move {
                    tokio::spawn(response);
                })
                .await;
            connections.fetch_sub(1, Ordering::SeqCst);
            disconnected.notify_waiters();
        });
    }

    /// Accept loop: serve tarpc over incoming TCP connections.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), GroupError> {
        loop {
            let (stream, peer) = listener.accept().await?;
            stream.set_nodelay(true)?;
            info!("participant connected from {peer}");
            self.serve_connection(stream);
        }
    }

    /// Number of open byte-stream connections.
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Resolve once every byte-stream connection has closed.
    pub async fn wait_for_disconnects(&self) {
        loop {
            let notified = self.disconnected.notified();
            if self.connections() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Number of participants the coordinator waits for.
    pub async fn size(&self) -> usize {
        self.state.lock().await.size
    }

    /// Number of collective rounds completed so far.
    pub async fn rounds_completed(&self) -> u64 {
        self.state.lock().await.completed
    }

    /// Number of rounds still waiting for contributions.
    pub async fn rounds_pending(&self) -> usize {
        self.state.lock().await.rounds.len()
    }
}

/// tarpc service implementation for the coordinator.
#[derive(Clone)]
struct CoordinatorHandler {
    coordinator: Coordinator,
}

impl CollectiveService for CoordinatorHandler {
    async fn join(self, _ctx: context::Context, version: u32, rank: u32, size: u32) -> Result<(), String> {
        if version != PROTOCOL_VERSION {
            return Err(format!(
                "protocol version mismatch: expected {PROTOCOL_VERSION}, got {version}"
            ));
        }
        let expected = self.coordinator.size().await;
        if size as usize != expected {
            return Err(format!("group size mismatch: host has {expected}, participant says {size}"));
        }
        if rank as usize >= expected {
            return Err(format!("rank {rank} is out of range for a group of {expected}"));
        }
        info!("rank {rank} joined");
        Ok(())
    }

    async fn contribute(self, _ctx: context::Context, contribution: Contribution) -> Result<Vec<u8>, String> {
        let rx = {
            let mut state = self.coordinator.state.lock().await;
            state.enter(contribution, &self.coordinator.registry)
        };
        rx.await
            .map_err(|_| "coordinator dropped the round".to_string())?
    }

    async fn post(
        self,
        _ctx: context::Context,
        source: u32,
        dest: u32,
        tag: u32,
        payload: Vec<u8>,
    ) -> Result<(), String> {
        let mut state = self.coordinator.state.lock().await;
        if dest as usize >= state.size {
            return Err(format!("destination {dest} is out of range"));
        }
        state.mailbox.post((source, dest, tag), payload);
        Ok(())
    }

    async fn fetch(self, _ctx: context::Context, dest: u32, source: u32, tag: u32) -> Result<Vec<u8>, String> {
        let pending = {
            let mut state = self.coordinator.state.lock().await;
            if source as usize >= state.size {
                return Err(format!("source {source} is out of range"));
            }
            state.mailbox.fetch((source, dest, tag))
        };
        match pending {
            Ok(payload) => Ok(payload),
            Err(rx) => rx
                .await
                .map_err(|_| "coordinator dropped the message".to_string()),
        }
    }

    async fn ping(self, _ctx: context::Context, seq: u64) -> u64 {
        seq
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::op::{CustomOp, ReduceOp};

    fn contribution(round: u64, rank: u32, kind: Collective, payload: Vec<u8>) -> Contribution {
        Contribution { round, rank, kind, payload }
    }

    fn reals(values: &[f64]) -> Vec<u8> {
        bytemuck::cast_slice(values).to_vec()
    }

    fn state(size: usize) -> CoordinatorState {
        CoordinatorState {
            size,
            rounds: HashMap::new(),
            mailbox: Mailbox::default(),
            completed: 0,
        }
    }

    #[test]
    fn round_completes_when_all_arrive() {
        let registry = RwLock::new(OpRegistry::new());
        let mut st = state(2);
        let kind = Collective::AllReduce { op: ReduceOp::Sum };

        let mut rx0 = st.enter(contribution(0, 0, kind, reals(&[1.0, 2.0])), &registry);
        assert!(rx0.try_recv().is_err());
        assert_eq!(st.rounds.len(), 1);

        let mut rx1 = st.enter(contribution(0, 1, kind, reals(&[3.0, 4.0])), &registry);
        let out0 = rx0.try_recv().unwrap().unwrap();
        let out1 = rx1.try_recv().unwrap().unwrap();
        assert_eq!(out0, out1);
        assert_eq!(decode_reals(&out0).unwrap(), vec![4.0, 6.0]);
        assert_eq!(st.completed, 1);
        assert!(st.rounds.is_empty());
    }

    #[test]
    fn gather_concatenates_in_rank_order() {
        let registry = RwLock::new(OpRegistry::new());
        let mut st = state(3);
        let kind = Collective::AllGather;
        // Arrive out of order.
        let _ = st.enter(contribution(5, 2, kind, vec![2, 2]), &registry);
        let _ = st.enter(contribution(5, 0, kind, vec![0, 0]), &registry);
        let mut rx = st.enter(contribution(5, 1, kind, vec![1, 1]), &registry);
        assert_eq!(rx.try_recv().unwrap().unwrap(), vec![0, 0, 1, 1, 2, 2]);
    }

    #[test]
    fn broadcast_returns_root_payload() {
        let registry = RwLock::new(OpRegistry::new());
        let mut st = state(2);
        let kind = Collective::Broadcast { root: 1 };
        let mut rx = st.enter(contribution(0, 0, kind, Vec::new()), &registry);
        let _ = st.enter(contribution(0, 1, kind, vec![9, 8, 7]), &registry);
        assert_eq!(rx.try_recv().unwrap().unwrap(), vec![9, 8, 7]);
    }

    #[test]
    fn mismatched_collectives_fail_everyone() {
        let registry = RwLock::new(OpRegistry::new());
        let mut st = state(2);
        let mut rx0 = st.enter(contribution(0, 0, Collective::Barrier, Vec::new()), &registry);
        let mut rx1 = st.enter(contribution(0, 1, Collective::AllGather, vec![1]), &registry);
        assert!(rx0.try_recv().unwrap().unwrap_err().contains("mismatch"));
        assert!(rx1.try_recv().unwrap().unwrap_err().contains("mismatch"));
    }

    #[test]
    fn reduction_uses_registered_op() {
        let registry = RwLock::new(OpRegistry::new());
        let id = registry
            .write()
            .unwrap()
            .register(CustomOp::new(1, |input, inout| {
                for (r, x) in inout.iter_mut().zip(input) {
                    *r = r.max(*x) + 0.5;
                }
            }));
        let mut st = state(2);
        let kind = Collective::AllReduce { op: ReduceOp::Custom(id) };
        let _ = st.enter(contribution(0, 0, kind, reals(&[1.0])), &registry);
        let mut rx = st.enter(contribution(0, 1, kind, reals(&[2.0])), &registry);
        assert_eq!(decode_reals(&rx.try_recv().unwrap().unwrap()).unwrap(), vec![2.5]);
    }

    #[test]
    fn unknown_op_is_reported() {
        let registry = RwLock::new(OpRegistry::new());
        let mut st = state(1);
        let kind = Collective::AllReduce { op: ReduceOp::Custom(crate::op::OpId(3)) };
        let mut rx = st.enter(contribution(0, 0, kind, reals(&[1.0])), &registry);
        assert!(rx.try_recv().unwrap().unwrap_err().contains("op-3"));
    }

    #[test]
    fn out_of_range_rank_is_rejected() {
        let registry = RwLock::new(OpRegistry::new());
        let mut st = state(2);
        let mut rx = st.enter(contribution(0, 7, Collective::Barrier, Vec::new()), &registry);
        assert!(rx.try_recv().unwrap().unwrap_err().contains("out of range"));
        assert!(st.rounds.is_empty());
    }

    #[test]
    fn mailbox_is_fifo_per_key() {
        let mut mailbox = Mailbox::default();
        mailbox.post((0, 1, 7), vec![1]);
        mailbox.post((0, 1, 7), vec![2]);
        mailbox.post((0, 1, 8), vec![3]);
        assert_eq!(mailbox.fetch((0, 1, 7)).ok(), Some(vec![1]));
        assert_eq!(mailbox.fetch((0, 1, 8)).ok(), Some(vec![3]));
        assert_eq!(mailbox.fetch((0, 1, 7)).ok(), Some(vec![2]));
    }

    #[test]
    fn mailbox_delivers_to_waiting_receiver() {
        let mut mailbox = Mailbox::default();
        let mut rx = mailbox.fetch((2, 0, 1)).unwrap_err();
        mailbox.post((2, 0, 1), vec![42]);
        assert_eq!(rx.try_recv().unwrap(), vec![42]);
        assert!(mailbox.is_empty());
    }

    #[test]
    fn mailbox_forgets_drained_keys() {
        let mut mailbox = Mailbox::default();
        for tag in 0..64 {
            mailbox.post((0, 1, tag), vec![tag as u8]);
            assert_eq!(mailbox.fetch((0, 1, tag)).ok(), Some(vec![tag as u8]));
        }
        assert!(mailbox.is_empty());

        // A receiver that gave up is skipped, and its key still goes away.
        let abandoned = mailbox.fetch((3, 1, 0)).unwrap_err();
        drop(abandoned);
        let mut rx = mailbox.fetch((3, 1, 0)).unwrap_err();
        mailbox.post((3, 1, 0), vec![9]);
        assert_eq!(rx.try_recv().unwrap(), vec![9]);
        assert!(mailbox.is_empty());

        // Nobody waiting: the message queues, then the key drains.
        let abandoned = mailbox.fetch((4, 1, 0)).unwrap_err();
        drop(abandoned);
        mailbox.post((4, 1, 0), vec![5]);
        assert!(mailbox.waiting.is_empty());
        assert_eq!(mailbox.fetch((4, 1, 0)).ok(), Some(vec![5]));
        assert!(mailbox.is_empty());
    }

    #[test]
    fn decode_rejects_partial_reals() {
        assert!(decode_reals(&[0u8; 12]).is_err());
        assert_eq!(decode_reals(&reals(&[1.0, -1.0])).unwrap(), vec![1.0, -1.0]);
    }

    #[tokio::test]
    async fn coordinator_ping_over_channel() {
        let coordinator = Coordinator::new(1, Arc::new(RwLock::new(OpRegistry::new())));
        let client = coordinator.spawn_channel();
        let seq = client.ping(context::current(), 42).await.unwrap();
        assert_eq!(seq, 42);
    }

    #[tokio::test]
    async fn coordinator_join_checks() {
        let coordinator = Coordinator::new(2, Arc::new(RwLock::new(OpRegistry::new())));
        let client = coordinator.spawn_channel();

        let ok = client.join(context::current(), PROTOCOL_VERSION, 1, 2).await.unwrap();
        assert!(ok.is_ok());

        let bad_version = client.join(context::current(), 999, 1, 2).await.unwrap();
        assert!(bad_version.unwrap_err().contains("version mismatch"));

        let bad_size = client.join(context::current(), PROTOCOL_VERSION, 1, 3).await.unwrap();
        assert!(bad_size.unwrap_err().contains("size mismatch"));
    }

    #[tokio::test]
    async fn coordinator_barrier_over_channels() {
        let coordinator = Coordinator::new(2, Arc::new(RwLock::new(OpRegistry::new())));
        let c0 = coordinator.spawn_channel();
        let c1 = coordinator.spawn_channel();

        let f0 = c0.contribute(context::current(), contribution(0, 0, Collective::Barrier, Vec::new()));
        let f1 = c1.contribute(context::current(), contribution(0, 1, Collective::Barrier, Vec::new()));
        let (r0, r1) = tokio::join!(f0, f1);
        assert!(r0.unwrap().is_ok());
        assert!(r1.unwrap().is_ok());
        assert_eq!(coordinator.rounds_completed().await, 1);
        assert_eq!(coordinator.rounds_pending().await, 0);
    }
}
