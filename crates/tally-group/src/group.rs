//! Multi-participant communicator backed by the coordinator service.
//!
//! Every participant holds a `CollectiveServiceClient` to the coordinator and
//! turns each blocking call into one RPC, driven on a tokio runtime the
//! communicator owns. In-process groups share one runtime and talk over
//! tarpc channels; separate processes talk over TCP.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

use tarpc::context;
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Runtime;
use tracing::{debug, info, warn};

use crate::comm::{check_gather, check_peer, check_reduce, check_root, Communicator, Request};
use crate::config::GroupConfig;
use crate::coordinator::{decode_reals, Coordinator};
use crate::error::GroupError;
use crate::op::{CustomOp, OpId, OpRegistry, ReduceOp};
use crate::transport::{
    framed_transport, Collective, CollectiveServiceClient, Contribution, PROTOCOL_VERSION,
};

/// One participant of a coordinated group.
pub struct CoordinatedGroup {
    rank: usize,
    size: usize,
    client: CollectiveServiceClient,
    runtime: Arc<Runtime>,
    /// Local operators. Rank 0 shares this registry with the coordinator.
    registry: Arc<RwLock<OpRegistry>>,
    /// Next collective round number.
    round: AtomicU64,
    config: GroupConfig,
    epoch: Instant,
    local_addr: Option<SocketAddr>,
    /// Coordinator served over TCP by this participant (the host only).
    hosted: Option<Coordinator>,
}

impl CoordinatedGroup {
    /// Create all `size` participants of a group living in this process.
    ///
    /// Hand each participant to its own thread; collectives block until every
    /// participant has entered them.
    pub fn in_process(size: usize, config: GroupConfig) -> Result<Vec<Self>, GroupError> {
        check_size(size)?;
        let runtime = Arc::new(config.build_runtime()?);
        let host_registry = Arc::new(RwLock::new(OpRegistry::new()));
        let coordinator = Coordinator::new(size, host_registry.clone());
        info!("in-process group of {size}");

        let clients = {
            let _guard = runtime.enter();
            (0..size).map(|_| coordinator.spawn_channel()).collect::<Vec<_>>()
        };
        let mut group = Vec::with_capacity(size);
        for (rank, client) in clients.into_iter().enumerate() {
            let registry = if rank == 0 {
                host_registry.clone()
            } else {
                Arc::new(RwLock::new(OpRegistry::new()))
            };
            let member = Self::new(rank, size, client, runtime.clone(), registry, config.clone(), None);
            member.join()?;
            group.push(member);
        }
        Ok(group)
    }

    /// Rank 0 over TCP: host the coordinator on `addr` and join it.
    ///
    /// The coordinator lives as long as this participant. Dropping the host
    /// waits, at most the connect timeout, for the other participants to
    /// disconnect first.
    pub fn host(addr: SocketAddr, size: usize, config: GroupConfig) -> Result<Self, GroupError> {
        check_size(size)?;
        let runtime = Arc::new(config.build_runtime()?);
        let registry = Arc::new(RwLock::new(OpRegistry::new()));
        let coordinator = Coordinator::new(size, registry.clone());

        let listener = runtime.block_on(TcpListener::bind(addr))?;
        let local_addr = listener.local_addr()?;
        info!("hosting group of {size} on {local_addr}");

        let server = coordinator.clone();
        runtime.spawn(async move {
            if let Err(e) = server.serve(listener).await {
                warn!("coordinator stopped accepting: {e}");
            }
        });

        let client = {
            let _guard = runtime.enter();
            coordinator.spawn_channel()
        };
        let mut group = Self::new(0, size, client, runtime, registry, config, Some(local_addr));
        group.hosted = Some(coordinator);
        group.join()?;
        Ok(group)
    }

    /// Rank 1.. over TCP: connect to the coordinator at `addr`.
    ///
    /// Retries until the host is up or the configured connect timeout runs out.
    pub fn connect(
        addr: SocketAddr,
        rank: usize,
        size: usize,
        config: GroupConfig,
    ) -> Result<Self, GroupError> {
        check_size(size)?;
        if rank == 0 || rank >= size {
            return Err(GroupError::InvalidConfig(format!(
                "rank {rank} cannot connect to a group of {size} (rank 0 hosts)"
            )));
        }
        let runtime = Arc::new(config.build_runtime()?);
        let stream = runtime.block_on(connect_with_retry(addr, &config))?;
        stream.set_nodelay(true)?;
        let local_addr = stream.local_addr().ok();

        let client = {
            let _guard = runtime.enter();
            CollectiveServiceClient::new(tarpc::client::Config::default(), framed_transport(stream))
                .spawn()
        };
        let registry = Arc::new(RwLock::new(OpRegistry::new()));
        let group = Self::new(rank, size, client, runtime, registry, config, local_addr);
        group.join()?;
        info!("rank {rank} joined group of {size} at {addr}");
        Ok(group)
    }

    fn new(
        rank: usize,
        size: usize,
        client: CollectiveServiceClient,
        runtime: Arc<Runtime>,
        registry: Arc<RwLock<OpRegistry>>,
        config: GroupConfig,
        local_addr: Option<SocketAddr>,
    ) -> Self {
        Self {
            rank,
            size,
            client,
            runtime,
            registry,
            round: AtomicU64::new(0),
            config,
            epoch: Instant::now(),
            local_addr,
            hosted: None,
        }
    }

    /// Address of this participant's socket: the listening address for the
    /// host, the local end of the connection for other TCP ranks, `None`
    /// in-process.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Transport configuration in use.
    pub fn config(&self) -> &GroupConfig {
        &self.config
    }

    /// Round-trip a ping through the coordinator.
    pub fn ping(&self, seq: u64) -> Result<u64, GroupError> {
        self.runtime
            .block_on(self.client.ping(self.context(), seq))
            .map_err(rpc_error)
    }

    fn join(&self) -> Result<(), GroupError> {
        self.runtime
            .block_on(self.client.join(
                self.context(),
                PROTOCOL_VERSION,
                self.rank as u32,
                self.size as u32,
            ))
            .map_err(rpc_error)?
            .map_err(GroupError::Handshake)
    }

    fn context(&self) -> context::Context {
        let mut ctx = context::current();
        ctx.deadline = Instant::now() + self.config.collective_deadline();
        ctx
    }

    /// Enter the next collective round and wait for its result.
    fn collective(&self, kind: Collective, payload: Vec<u8>) -> Result<Vec<u8>, GroupError> {
        let round = self.round.fetch_add(1, Ordering::SeqCst);
        debug!("rank {} enters round {round} ({kind:?})", self.rank);
        let contribution = Contribution {
            round,
            rank: self.rank as u32,
            kind,
            payload,
        };
        self.runtime
            .block_on(self.client.contribute(self.context(), contribution))
            .map_err(rpc_error)?
            .map_err(GroupError::Collective)
    }

    fn check_local_reduce(&self, call: &str, op: ReduceOp, send: usize, recv: usize) {
        let registry = self.registry.read().unwrap_or_else(PoisonError::into_inner);
        check_reduce(call, &registry, op, send, recv);
    }

    fn copy_reals(call: &str, result: &[u8], recv: &mut [f64]) -> Result<(), GroupError> {
        let reals = decode_reals(result).map_err(GroupError::Collective)?;
        if reals.len() != recv.len() {
            return Err(GroupError::Collective(format!(
                "{call}: coordinator returned {} reals for a buffer of {}",
                reals.len(),
                recv.len()
            )));
        }
        recv.copy_from_slice(&reals);
        Ok(())
    }
}

impl Communicator for CoordinatedGroup {
    fn size(&self) -> usize {
        self.size
    }

    fn rank(&self) -> usize {
        self.rank
    }

    fn barrier(&self) -> Result<(), GroupError> {
        self.collective(Collective::Barrier, Vec::new()).map(|_| ())
    }

    fn broadcast(&self, buffer: &mut [u8], root: usize) -> Result<(), GroupError> {
        check_root("broadcast", root, self.size);
        let payload = if self.rank == root {
            buffer.to_vec()
        } else {
            Vec::new()
        };
        let result = self.collective(Collective::Broadcast { root: root as u32 }, payload)?;
        assert_eq!(
            result.len(),
            buffer.len(),
            "broadcast: root sent {} bytes into a buffer of {}",
            result.len(),
            buffer.len()
        );
        buffer.copy_from_slice(&result);
        Ok(())
    }

    fn gather(&self, send: &[u8], recv: &mut [u8], root: usize) -> Result<(), GroupError> {
        check_root("gather", root, self.size);
        // Only the root's receive buffer is written.
        if self.rank == root {
            check_gather("gather", send.len(), recv.len(), self.size);
        }
        let result = self.collective(Collective::Gather { root: root as u32 }, send.to_vec())?;
        if self.rank == root {
            recv.copy_from_slice(&result);
        }
        Ok(())
    }

    fn all_gather(&self, send: &[u8], recv: &mut [u8]) -> Result<(), GroupError> {
        check_gather("all_gather", send.len(), recv.len(), self.size);
        let result = self.collective(Collective::AllGather, send.to_vec())?;
        recv.copy_from_slice(&result);
        Ok(())
    }

    fn reduce(
        &self,
        send: &[f64],
        recv: &mut [f64],
        op: ReduceOp,
        root: usize,
    ) -> Result<(), GroupError> {
        check_root("reduce", root, self.size);
        // Non-root receive buffers are not touched.
        let recv_len = if self.rank == root { recv.len() } else { send.len() };
        self.check_local_reduce("reduce", op, send.len(), recv_len);
        let kind = Collective::Reduce {
            op,
            root: root as u32,
        };
        let result = self.collective(kind, bytemuck::cast_slice(send).to_vec())?;
        if self.rank == root {
            Self::copy_reals("reduce", &result, recv)?;
        }
        Ok(())
    }

    fn all_reduce(&self, send: &[f64], recv: &mut [f64], op: ReduceOp) -> Result<(), GroupError> {
        self.check_local_reduce("all_reduce", op, send.len(), recv.len());
        let result = self.collective(
            Collective::AllReduce { op },
            bytemuck::cast_slice(send).to_vec(),
        )?;
        Self::copy_reals("all_reduce", &result, recv)
    }

    fn send(&self, payload: &[u8], dest: usize, tag: u32) -> Result<(), GroupError> {
        check_peer("send", dest, self.size);
        self.runtime
            .block_on(self.client.post(
                self.context(),
                self.rank as u32,
                dest as u32,
                tag,
                payload.to_vec(),
            ))
            .map_err(rpc_error)?
            .map_err(GroupError::Collective)
    }

    fn recv(&self, source: usize, tag: u32) -> Result<Vec<u8>, GroupError> {
        check_peer("recv", source, self.size);
        self.runtime
            .block_on(self.client.fetch(
                self.context(),
                self.rank as u32,
                source as u32,
                tag,
            ))
            .map_err(rpc_error)?
            .map_err(GroupError::Collective)
    }

    fn isend(&self, payload: &[u8], dest: usize, tag: u32) -> Result<Request, GroupError> {
        check_peer("isend", dest, self.size);
        let client = self.client.clone();
        let ctx = self.context();
        let (source, dest) = (self.rank as u32, dest as u32);
        let payload = payload.to_vec();
        let handle = self.runtime.spawn(async move {
            client
                .post(ctx, source, dest, tag, payload)
                .await
                .map_err(rpc_error)?
                .map_err(GroupError::Collective)?;
            Ok::<_, GroupError>(None)
        });
        Ok(Request::new(handle))
    }

    fn irecv(&self, source: usize, tag: u32) -> Result<Request, GroupError> {
        check_peer("irecv", source, self.size);
        let client = self.client.clone();
        let ctx = self.context();
        let (dest, source) = (self.rank as u32, source as u32);
        let handle = self.runtime.spawn(async move {
            let payload = client
                .fetch(ctx, dest, source, tag)
                .await
                .map_err(rpc_error)?
                .map_err(GroupError::Collective)?;
            Ok::<_, GroupError>(Some(payload))
        });
        Ok(Request::new(handle))
    }

    fn wait_all(&self, requests: Vec<Request>) -> Result<Vec<Option<Vec<u8>>>, GroupError> {
        requests
            .into_iter()
            .map(|request| self.runtime.block_on(request.into_handle())?)
            .collect()
    }

    fn register_op(&self, op: CustomOp) -> OpId {
        self.registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .register(op)
    }

    fn free_op(&self, id: OpId) {
        self.registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .free(id);
    }

    fn wall_time(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }
}

impl Drop for CoordinatedGroup {
    fn drop(&mut self) {
        let Some(coordinator) = self.hosted.take() else {
            return;
        };
        let linger = self.config.connect_timeout();
        let waited = self.runtime.block_on(async move {
            tokio::time::timeout(linger, coordinator.wait_for_disconnects()).await
        });
        if waited.is_err() {
            warn!("host shutting down with participants still connected");
        }
    }
}

impl std::fmt::Debug for CoordinatedGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordinatedGroup")
            .field("rank", &self.rank)
            .field("size", &self.size)
            .field("round", &self.round.load(Ordering::Relaxed))
            .field("local_addr", &self.local_addr)
            .finish_non_exhaustive()
    }
}

fn check_size(size: usize) -> Result<(), GroupError> {
    if size == 0 || size > u32::MAX as usize {
        return Err(GroupError::InvalidConfig(format!("group size {size} is out of range")));
    }
    Ok(())
}

fn rpc_error(e: tarpc::client::RpcError) -> GroupError {
    GroupError::Rpc(e.to_string())
}

async fn connect_with_retry(addr: SocketAddr, config: &GroupConfig) -> Result<TcpStream, GroupError> {
    let deadline = tokio::time::Instant::now() + config.connect_timeout();
    loop {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) if tokio::time::Instant::now() < deadline => {
                debug!("coordinator at {addr} not reachable yet: {e}");
                tokio::time::sleep(config.connect_retry_interval()).await;
            }
            Err(e) => {
                return Err(GroupError::Transport(format!(
                    "could not reach coordinator at {addr}: {e}"
                )))
            }
        }
    }
}
