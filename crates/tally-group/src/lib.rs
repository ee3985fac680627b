//! tally-group — Process groups with blocking collectives.
//!
//! A fixed-size, ranked group of participants that enter collective
//! operations together: barrier, broadcast, gather, reduce and all-reduce,
//! plus point-to-point messaging. Code is written once against the
//! [`Communicator`] trait and runs on either backing:
//!
//! - [`SingleProcess`]: the group is this process alone.
//! - [`CoordinatedGroup`]: a real group. Rank 0 hosts a coordinator, every
//!   participant sends its contribution there and gets the round's result back.
//!
//! # Architecture
//!
//! ```text
//!  rank 0 (host)                       rank 1..n
//! ┌──────────────────────┐           ┌──────────────┐
//! │ Coordinator          │ contribute│ Coordinated  │
//! │  round table ◄───────┼───────────┤ Group        │
//! │  mailbox             │  result   │  (client)    │
//! │ CoordinatedGroup ────┤ ─────────►│              │
//! └──────────────────────┘   tarpc   └──────────────┘
//! ```
//!
//! # Quick start
//!
//! ```ignore
//! use tally_group::{Backing, Communicator, GroupConfig, ReduceOp};
//!
//! let comm = Backing::from_env()?.build(GroupConfig::default())?;
//! let mut total = [0.0];
//! comm.all_reduce(&[comm.rank() as f64], &mut total, ReduceOp::Sum)?;
//! ```

pub mod comm;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod group;
pub mod op;
pub mod single;
pub mod transport;

// Re-exports
pub use comm::{Communicator, CommunicatorExt, Request};
pub use config::{Backing, GroupConfig};
pub use coordinator::Coordinator;
pub use error::GroupError;
pub use group::CoordinatedGroup;
pub use op::{CustomOp, OpId, OpRegistry, ReduceOp};
pub use single::SingleProcess;
pub use transport::PROTOCOL_VERSION;
