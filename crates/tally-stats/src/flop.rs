//! Timing and floating-point operation counts around a region of code.

use tally_group::Communicator;

/// One reading of a hardware counter source.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct FlopReading {
    /// Real time in seconds.
    pub rtime: f32,
    /// Process time in seconds.
    pub ptime: f32,
    /// Floating point operations so far.
    pub flpops: i64,
    /// Current rate in MFlop/s.
    pub mflops: f32,
}

/// A source of cumulative time and flop counters.
pub trait FlopCounter {
    /// Current readings, or `None` if counters are unavailable.
    fn read(&mut self) -> Option<FlopReading>;
}

/// Counter source for platforms without hardware counters.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoCounters;

impl FlopCounter for NoCounters {
    fn read(&mut self) -> Option<FlopReading> {
        None
    }
}

/// Elapsed time and flops between [`start`](Self::start) and
/// [`stop`](Self::stop).
///
/// Between the two calls the fields hold negated start readings; `stop`
/// adds the end readings, leaving the differences.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct FlopInfo {
    /// Wall-clock seconds from the communicator.
    pub seconds: f64,
    pub rtime: f32,
    pub ptime: f32,
    pub flpops: i64,
    pub mflops: f32,
}

impl FlopInfo {
    /// Begin measuring.
    pub fn start<C: Communicator + ?Sized>(comm: &C, counter: &mut dyn FlopCounter) -> Self {
        let seconds = -comm.wall_time();
        let reading = counter.read().unwrap_or_default();
        Self {
            seconds,
            rtime: -reading.rtime,
            ptime: -reading.ptime,
            flpops: -reading.flpops,
            mflops: 0.0,
        }
    }

    /// Finish measuring. Counter fields are zeroed if no reading is available.
    pub fn stop<C: Communicator + ?Sized>(&mut self, comm: &C, counter: &mut dyn FlopCounter) {
        match counter.read() {
            Some(reading) => {
                self.rtime += reading.rtime;
                self.ptime += reading.ptime;
                self.flpops += reading.flpops;
                self.mflops = reading.mflops;
            }
            None => {
                self.rtime = 0.0;
                self.ptime = 0.0;
                self.flpops = 0;
                self.mflops = 0.0;
            }
        }
        self.seconds += comm.wall_time();
    }
}
