//! The `Communicator` capability: blocking collectives over a ranked group.
//!
//! Two backings implement it: [`SingleProcess`](crate::SingleProcess), where
//! the group is exactly one participant, and
//! [`CoordinatedGroup`](crate::CoordinatedGroup), a real multi-participant
//! transport. Code written against the trait runs unchanged on either.

use bytemuck::Pod;
use tokio::task::JoinHandle;

use crate::error::GroupError;
use crate::op::{CustomOp, OpId, OpRegistry, ReduceOp};

/// Blocking collective operations over a fixed-size, ranked group.
///
/// Every collective must be entered by every participant, in the same order.
/// Byte buffers hold `count * element_size` bytes; reductions work on reals.
/// Contract violations panic; transport failures come back as `GroupError`.
pub trait Communicator: Send + Sync {
    /// Number of participants.
    fn size(&self) -> usize;

    /// This participant's 0-based rank.
    fn rank(&self) -> usize;

    /// Return once every participant has entered the barrier.
    fn barrier(&self) -> Result<(), GroupError>;

    /// Overwrite `buffer` everywhere with the root's contents.
    fn broadcast(&self, buffer: &mut [u8], root: usize) -> Result<(), GroupError>;

    /// Lay every participant's `send` bytes out in rank order in the root's `recv`.
    fn gather(&self, send: &[u8], recv: &mut [u8], root: usize) -> Result<(), GroupError>;

    /// Like [`gather`](Self::gather), with the result delivered to everyone.
    fn all_gather(&self, send: &[u8], recv: &mut [u8]) -> Result<(), GroupError>;

    /// Reduce everyone's `send` with `op` into the root's `recv`.
    fn reduce(&self, send: &[f64], recv: &mut [f64], op: ReduceOp, root: usize)
        -> Result<(), GroupError>;

    /// Reduce everyone's `send` with `op` into everyone's `recv`.
    fn all_reduce(&self, send: &[f64], recv: &mut [f64], op: ReduceOp) -> Result<(), GroupError>;

    /// Blocking point-to-point send.
    fn send(&self, payload: &[u8], dest: usize, tag: u32) -> Result<(), GroupError>;

    /// Blocking point-to-point receive of the next message from `source` with `tag`.
    fn recv(&self, source: usize, tag: u32) -> Result<Vec<u8>, GroupError>;

    /// Start a send; complete it with [`wait_all`](Self::wait_all).
    fn isend(&self, payload: &[u8], dest: usize, tag: u32) -> Result<Request, GroupError>;

    /// Start a receive; complete it with [`wait_all`](Self::wait_all).
    fn irecv(&self, source: usize, tag: u32) -> Result<Request, GroupError>;

    /// Complete requests in order. Receives yield `Some(payload)`, sends `None`.
    fn wait_all(&self, requests: Vec<Request>) -> Result<Vec<Option<Vec<u8>>>, GroupError>;

    /// Register a custom reduction operator.
    fn register_op(&self, op: CustomOp) -> OpId;

    /// Release a custom reduction operator.
    fn free_op(&self, id: OpId);

    /// Monotonic wall-clock reading in seconds.
    fn wall_time(&self) -> f64;
}

/// A pending non-blocking point-to-point operation.
#[derive(Debug)]
pub struct Request {
    handle: JoinHandle<Result<Option<Vec<u8>>, GroupError>>,
}

impl Request {
    pub(crate) fn new(handle: JoinHandle<Result<Option<Vec<u8>>, GroupError>>) -> Self {
        Self { handle }
    }

    pub(crate) fn into_handle(self) -> JoinHandle<Result<Option<Vec<u8>>, GroupError>> {
        self.handle
    }
}

/// Typed conveniences over any [`Communicator`].
pub trait CommunicatorExt: Communicator {
    /// Whether this participant is rank 0.
    fn is_root(&self) -> bool {
        self.rank() == 0
    }

    /// [`broadcast`](Communicator::broadcast) over plain-old-data elements.
    fn broadcast_pod<T: Pod>(&self, buffer: &mut [T], root: usize) -> Result<(), GroupError> {
        self.broadcast(bytemuck::cast_slice_mut(buffer), root)
    }

    /// [`gather`](Communicator::gather) over plain-old-data elements.
    fn gather_pod<T: Pod>(&self, send: &[T], recv: &mut [T], root: usize) -> Result<(), GroupError> {
        self.gather(bytemuck::cast_slice(send), bytemuck::cast_slice_mut(recv), root)
    }

    /// [`all_gather`](Communicator::all_gather) over plain-old-data elements.
    fn all_gather_pod<T: Pod>(&self, send: &[T], recv: &mut [T]) -> Result<(), GroupError> {
        self.all_gather(bytemuck::cast_slice(send), bytemuck::cast_slice_mut(recv))
    }
}

impl<C: Communicator + ?Sized> CommunicatorExt for C {}

// ---------------------------------------------------------------------------
// Contract checks shared by both backings
// ---------------------------------------------------------------------------

pub(crate) fn check_root(call: &str, root: usize, size: usize) {
    assert!(
        root < size,
        "{call}: root {root} is out of range for a group of {size}"
    );
}

pub(crate) fn check_peer(call: &str, peer: usize, size: usize) {
    assert!(
        peer < size,
        "{call}: rank {peer} is out of range for a group of {size}"
    );
}

pub(crate) fn check_reduce(call: &str, registry: &OpRegistry, op: ReduceOp, send: usize, recv: usize) {
    assert_eq!(
        send, recv,
        "{call}: send holds {send} elements but receive buffer holds {recv}"
    );
    if let Err(e) = registry.validate(op, send) {
        panic!("{call}: {e}");
    }
}

pub(crate) fn check_gather(call: &str, send: usize, recv: usize, size: usize) {
    assert_eq!(
        send * size,
        recv,
        "{call}: {size} participants sending {send} bytes need a {} byte receive buffer, got {recv}",
        send * size
    );
}
