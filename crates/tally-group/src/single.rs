//! Single-participant communicator.
//!
//! The group is this process alone: rank 0 of 1. Collectives degenerate to
//! no-ops or byte-exact copies, with the same preconditions a real transport
//! would enforce for a one-member group. Point-to-point messaging has no peer
//! to talk to and panics.

use std::sync::{PoisonError, RwLock};
use std::time::Instant;

use tracing::debug;

use crate::comm::{check_gather, check_reduce, check_root, Communicator, Request};
use crate::error::GroupError;
use crate::op::{CustomOp, OpId, OpRegistry, ReduceOp};

/// A group consisting of exactly one participant.
#[derive(Debug)]
pub struct SingleProcess {
    registry: RwLock<OpRegistry>,
    epoch: Instant,
}

impl SingleProcess {
    /// Create a single-participant communicator.
    pub fn new() -> Self {
        debug!("single-participant communicator");
        Self {
            registry: RwLock::new(OpRegistry::new()),
            epoch: Instant::now(),
        }
    }

    fn copy_reduced(&self, call: &str, send: &[f64], recv: &mut [f64], op: ReduceOp) {
        let registry = self.registry.read().unwrap_or_else(PoisonError::into_inner);
        check_reduce(call, &registry, op, send.len(), recv.len());
        recv.copy_from_slice(send);
    }
}

impl Default for SingleProcess {
    fn default() -> Self {
        Self::new()
    }
}

impl Communicator for SingleProcess {
    fn size(&self) -> usize {
        1
    }

    fn rank(&self) -> usize {
        0
    }

    fn barrier(&self) -> Result<(), GroupError> {
        Ok(())
    }

    fn broadcast(&self, _buffer: &mut [u8], root: usize) -> Result<(), GroupError> {
        check_root("broadcast", root, 1);
        Ok(())
    }

    fn gather(&self, send: &[u8], recv: &mut [u8], root: usize) -> Result<(), GroupError> {
        check_root("gather", root, 1);
        check_gather("gather", send.len(), recv.len(), 1);
        recv.copy_from_slice(send);
        Ok(())
    }

    fn all_gather(&self, send: &[u8], recv: &mut [u8]) -> Result<(), GroupError> {
        check_gather("all_gather", send.len(), recv.len(), 1);
        recv.copy_from_slice(send);
        Ok(())
    }

    fn reduce(
        &self,
        send: &[f64],
        recv: &mut [f64],
        op: ReduceOp,
        root: usize,
    ) -> Result<(), GroupError> {
        check_root("reduce", root, 1);
        self.copy_reduced("reduce", send, recv, op);
        Ok(())
    }

    fn all_reduce(&self, send: &[f64], recv: &mut [f64], op: ReduceOp) -> Result<(), GroupError> {
        self.copy_reduced("all_reduce", send, recv, op);
        Ok(())
    }

    fn send(&self, _payload: &[u8], _dest: usize, _tag: u32) -> Result<(), GroupError> {
        panic!("send is not supported by a single-participant group");
    }

    fn recv(&self, _source: usize, _tag: u32) -> Result<Vec<u8>, GroupError> {
        panic!("recv is not supported by a single-participant group");
    }

    fn isend(&self, _payload: &[u8], _dest: usize, _tag: u32) -> Result<Request, GroupError> {
        panic!("isend is not supported by a single-participant group");
    }

    fn irecv(&self, _source: usize, _tag: u32) -> Result<Request, GroupError> {
        panic!("irecv is not supported by a single-participant group");
    }

    fn wait_all(&self, requests: Vec<Request>) -> Result<Vec<Option<Vec<u8>>>, GroupError> {
        assert!(
            requests.is_empty(),
            "wait_all: a single-participant group handles only zero requests, got {}",
            requests.len()
        );
        Ok(Vec::new())
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::CommunicatorExt;

    #[test]
    fn size_and_rank() {
        let comm = SingleProcess::new();
        assert_eq!((comm.size(), comm.rank()), (1, 0));
        assert!(comm.is_root());
        comm.barrier().unwrap();
    }

    #[test]
    fn broadcast_from_root_is_noop() {
        let comm = SingleProcess::new();
        let mut buf = [1u32, 2, 3];
        comm.broadcast_pod(&mut buf, 0).unwrap();
        assert_eq!(buf, [1, 2, 3]);
    }

    #[test]
    #[should_panic(expected = "root 1 is out of range")]
    fn broadcast_wrong_root_panics() {
        let comm = SingleProcess::new();
        comm.broadcast(&mut [0u8; 4], 1).unwrap();
    }

    #[test]
    fn gather_copies_bytes() {
        let comm = SingleProcess::new();
        let send = [1.5f64, -2.0];
        let mut recv = [0.0f64; 2];
        comm.gather_pod(&send, &mut recv, 0).unwrap();
        assert_eq!(recv, send);

        let mut all = [0.0f64; 2];
        comm.all_gather_pod(&send, &mut all).unwrap();
        assert_eq!(all, send);
    }

    #[test]
    fn gather_across_element_types() {
        // Byte counts must match, element types need not.
        let comm = SingleProcess::new();
        let send = [0x0403_0201u32];
        let mut recv = [0u8; 4];
        comm.gather(bytemuck::cast_slice(&send), &mut recv, 0).unwrap();
        assert_eq!(recv, 0x0403_0201u32.to_ne_bytes());
    }

    #[test]
    #[should_panic(expected = "receive buffer")]
    fn gather_size_mismatch_panics() {
        let comm = SingleProcess::new();
        let mut recv = [0u8; 3];
        comm.gather(&[1, 2, 3, 4], &mut recv, 0).unwrap();
    }

    #[test]
    fn reduce_is_a_copy() {
        let comm = SingleProcess::new();
        let send = [1.0, f64::INFINITY, -3.5];
        let mut recv = [0.0; 3];
        comm.all_reduce(&send, &mut recv, ReduceOp::Sum).unwrap();
        assert_eq!(recv, send);
        let mut root = [0.0; 3];
        comm.reduce(&send, &mut root, ReduceOp::Min, 0).unwrap();
        assert_eq!(root, send);
    }

    #[test]
    fn custom_op_register_and_free() {
        let comm = SingleProcess::new();
        let id = comm.register_op(CustomOp::new(2, |_, _| {}));
        let mut recv = [0.0; 4];
        comm.all_reduce(&[1.0, 2.0, 3.0, 4.0], &mut recv, ReduceOp::Custom(id)).unwrap();
        assert_eq!(recv, [1.0, 2.0, 3.0, 4.0]);
        comm.free_op(id);
    }

    #[test]
    #[should_panic(expected = "unknown reduction operator")]
    fn freed_op_is_unknown() {
        let comm = SingleProcess::new();
        let id = comm.register_op(CustomOp::new(1, |_, _| {}));
        comm.free_op(id);
        let mut recv = [0.0];
        let _ = comm.all_reduce(&[1.0], &mut recv, ReduceOp::Custom(id));
    }

    #[test]
    #[should_panic(expected = "not supported by a single-participant group")]
    fn point_to_point_panics() {
        let comm = SingleProcess::new();
        let _ = comm.send(&[1], 0, 0);
    }

    #[test]
    fn wait_all_accepts_zero_requests() {
        let comm = SingleProcess::new();
        assert!(comm.wait_all(Vec::new()).unwrap().is_empty());
    }

    #[test]
    fn wall_time_is_monotonic() {
        let comm = SingleProcess::new();
        let a = comm.wall_time();
        let b = comm.wall_time();
        assert!(a >= 0.0);
        assert!(b >= a);
    }
}
