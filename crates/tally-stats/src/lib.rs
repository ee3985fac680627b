//! tally-stats — Global statistics over a process group.
//!
//! Every participant seeds one [`StatRecord`] per tracked variable from its
//! own samples. [`compute`] flattens the records, all-reduces them with a
//! merge operator registered on the group, and derives mean, variance,
//! standard deviation and the statistics of the mean. Every participant ends
//! up with the same global summary, including which rank attained the
//! minimum and maximum.
//!
//! ```text
//!  StatRecord ──flatten──► StatTuple ──all_reduce(merge)──► StatTuple
//!      ▲                                                       │
//!      └──────────────────── unflatten + derive ◄──────────────┘
//! ```
//!
//! # Quick start
//!
//! ```ignore
//! use tally_stats::{compute, print_root, PrintOptions, StatRecord};
//!
//! let mut records = vec![
//!     StatRecord::from_value(elapsed).with_label("solve time"),
//! ];
//! compute(&comm, &mut records)?;
//! print_root(&comm, &records, PrintOptions::new(true, true), Some(&mut std::io::stdout()))?;
//! ```

pub mod compute;
pub mod flop;
pub mod print;
pub mod record;
pub mod tuple;

// Re-exports
pub use compute::{compute, compute1};
pub use flop::{FlopCounter, FlopInfo, FlopReading, NoCounters};
pub use print::{format_g, print, print_root, PrintOptions};
pub use record::{StatRecord, Status};
pub use tuple::{StatTuple, WIDTH};
