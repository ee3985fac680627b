//! Reduce a few timings across whatever group the environment describes.
//!
//! Alone:
//!
//! ```text
//! cargo run -p tally-stats --example global_stats
//! ```
//!
//! As a group of three on one machine (one shell per rank):
//!
//! ```text
//! TALLY_SIZE=3 TALLY_RANK=0 TALLY_ADDR=127.0.0.1:7400 cargo run -p tally-stats --example global_stats
//! TALLY_SIZE=3 TALLY_RANK=1 TALLY_ADDR=127.0.0.1:7400 cargo run -p tally-stats --example global_stats
//! TALLY_SIZE=3 TALLY_RANK=2 TALLY_ADDR=127.0.0.1:7400 cargo run -p tally-stats --example global_stats
//! ```

use std::io;

use tally_group::{Backing, Communicator, GroupConfig};
use tally_stats::{compute, print_root, FlopInfo, NoCounters, PrintOptions, StatRecord};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let comm = Backing::from_env()?.build(GroupConfig::default())?;
    let rank = comm.rank();

    let mut flops = FlopInfo::start(comm.as_ref(), &mut NoCounters);
    let mut work = StatRecord::new().with_label("work units");
    for i in 0..=rank {
        work.push((rank * 10 + i) as f64);
    }
    flops.stop(comm.as_ref(), &mut NoCounters);

    let mut records = vec![
        StatRecord::from_value(rank as f64).with_label("rank"),
        work,
        StatRecord::from_value(flops.seconds).with_label("seconds"),
    ];
    compute(comm.as_ref(), &mut records)?;

    let mut stdout = io::stdout();
    print_root(comm.as_ref(), &records, PrintOptions::new(true, true), Some(&mut stdout))?;
    comm.barrier()?;
    Ok(())
}
