//! Global reduction of statistics records.

use tally_group::{Communicator, CustomOp, GroupError, ReduceOp};
use tracing::debug;

use crate::record::StatRecord;
use crate::tuple::{StatTuple, WIDTH};

/// Reduce `records` across the group and derive the global statistics.
///
/// Collective: every participant calls it with the same number of records,
/// in the same order. On return every participant holds the same global
/// accumulators, extremum ranks and derived fields.
pub fn compute<C: Communicator + ?Sized>(comm: &C, records: &mut [StatRecord]) -> Result<(), GroupError> {
    let rank = comm.rank();
    let send = records
        .iter()
        .map(|r| StatTuple::from_record(r, rank))
        .collect::<Vec<_>>();
    let mut recv = vec![<StatTuple as bytemuck::Zeroable>::zeroed(); send.len()];

    debug!(
        "reducing {} records across {} participants",
        records.len(),
        comm.size()
    );
    let op = comm.register_op(CustomOp::new(WIDTH, StatTuple::merge_slices));
    let reduced = comm.all_reduce(
        bytemuck::cast_slice(&send),
        bytemuck::cast_slice_mut(&mut recv),
        ReduceOp::Custom(op),
    );
    comm.free_op(op);
    reduced?;

    for (tuple, record) in recv.iter().zip(records.iter_mut()) {
        tuple.apply_to(record);
    }
    Ok(())
}

/// [`compute`] for records holding one value per participant.
///
/// Each record's `sum_values` is taken as this participant's single sample;
/// the other accumulators are overwritten.
pub fn compute1<C: Communicator + ?Sized>(comm: &C, records: &mut [StatRecord]) -> Result<(), GroupError> {
    for record in records.iter_mut() {
        let value = record.sum_values;
        record.set1(value);
    }
    compute(comm, records)
}
