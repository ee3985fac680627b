//! Group configuration and backing selection.
//!
//! `GroupConfig` carries the transport knobs. `Backing` says how this process
//! participates and is normally read from the environment at startup:
//!
//! | variable      | meaning                                        |
//! |---------------|------------------------------------------------|
//! | `TALLY_SIZE`  | number of participants (absent or 1: single)   |
//! | `TALLY_RANK`  | this participant's rank (0 hosts)              |
//! | `TALLY_ADDR`  | coordinator address, e.g. `10.0.0.1:7400`      |

use std::env;
use std::net::SocketAddr;
use std::time::Duration;

use tracing::info;

use crate::comm::Communicator;
use crate::error::GroupError;
use crate::group::CoordinatedGroup;
use crate::single::SingleProcess;

/// Environment variable holding the group size.
pub const ENV_SIZE: &str = "TALLY_SIZE";
/// Environment variable holding this participant's rank.
pub const ENV_RANK: &str = "TALLY_RANK";
/// Environment variable holding the coordinator address.
pub const ENV_ADDR: &str = "TALLY_ADDR";

/// Transport configuration for coordinated groups.
#[derive(Clone, Debug)]
pub struct GroupConfig {
    /// Deadline attached to every collective RPC.
    collective_deadline: Duration,
    /// How long a participant keeps trying to reach the coordinator.
    connect_timeout: Duration,
    /// Pause between connection attempts.
    connect_retry_interval: Duration,
    /// Worker threads of the transport's runtime.
    worker_threads: usize,
}

impl GroupConfig {
    /// Default configuration.
    pub fn new() -> Self {
        Self {
            collective_deadline: Duration::from_secs(60 * 60),
            connect_timeout: Duration::from_secs(30),
            connect_retry_interval: Duration::from_millis(100),
            worker_threads: 2,
        }
    }

    /// Set the collective RPC deadline.
    pub fn with_collective_deadline(mut self, deadline: Duration) -> Self {
        self.collective_deadline = deadline;
        self
    }

    /// Set how long to keep trying to reach the coordinator.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the pause between connection attempts.
    pub fn with_connect_retry_interval(mut self, interval: Duration) -> Self {
        self.connect_retry_interval = interval;
        self
    }

    /// Set the number of runtime worker threads.
    pub fn with_worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads.max(1);
        self
    }

    /// Collective RPC deadline.
    pub fn collective_deadline(&self) -> Duration {
        self.collective_deadline
    }

    /// Connection timeout.
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Pause between connection attempts.
    pub fn connect_retry_interval(&self) -> Duration {
        self.connect_retry_interval
    }

    /// Runtime worker threads.
    pub fn worker_threads(&self) -> usize {
        self.worker_threads
    }

    pub(crate) fn build_runtime(&self) -> Result<tokio::runtime::Runtime, GroupError> {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(self.worker_threads)
            .thread_name("tally-group")
            .enable_all()
            .build()
            .map_err(|e| GroupError::Transport(format!("failed to start runtime: {e}")))
    }
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// How this process takes part in the group.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Backing {
    /// The group is this process alone.
    Single,
    /// Rank 0: hosts the coordinator at `addr`.
    Host { addr: SocketAddr, size: usize },
    /// Rank 1.. : connects to the coordinator at `addr`.
    Member { addr: SocketAddr, rank: usize, size: usize },
}

impl Backing {
    /// Read the backing from `TALLY_SIZE`, `TALLY_RANK` and `TALLY_ADDR`.
    pub fn from_env() -> Result<Self, GroupError> {
        Self::from_vars(
            env::var(ENV_SIZE).ok().as_deref(),
            env::var(ENV_RANK).ok().as_deref(),
            env::var(ENV_ADDR).ok().as_deref(),
        )
    }

    /// Interpret raw variable values (see [`from_env`](Self::from_env)).
    pub fn from_vars(
        size: Option<&str>,
        rank: Option<&str>,
        addr: Option<&str>,
    ) -> Result<Self, GroupError> {
        let size = match size {
            None => return Ok(Self::Single),
            Some(s) => parse_var::<usize>(ENV_SIZE, s)?,
        };
        if size == 0 {
            return Err(GroupError::InvalidConfig(format!("{ENV_SIZE} must be positive")));
        }
        if size == 1 {
            return Ok(Self::Single);
        }

        let rank = match rank {
            Some(r) => parse_var::<usize>(ENV_RANK, r)?,
            None => {
                return Err(GroupError::InvalidConfig(format!(
                    "{ENV_RANK} is required when {ENV_SIZE} is {size}"
                )))
            }
        };
        if rank >= size {
            return Err(GroupError::InvalidConfig(format!(
                "{ENV_RANK}={rank} is out of range for {ENV_SIZE}={size}"
            )));
        }
        let addr = match addr {
            Some(a) => parse_var::<SocketAddr>(ENV_ADDR, a)?,
            None => {
                return Err(GroupError::InvalidConfig(format!(
                    "{ENV_ADDR} is required when {ENV_SIZE} is {size}"
                )))
            }
        };

        Ok(if rank == 0 {
            Self::Host { addr, size }
        } else {
            Self::Member { addr, rank, size }
        })
    }

    /// Build the communicator for this backing.
    pub fn build(self, config: GroupConfig) -> Result<Box<dyn Communicator>, GroupError> {
        info!("starting communicator: {self:?}");
        Ok(match self {
            Self::Single => Box::new(SingleProcess::new()),
            Self::Host { addr, size } => Box::new(CoordinatedGroup::host(addr, size, config)?),
            Self::Member { addr, rank, size } => {
                Box::new(CoordinatedGroup::connect(addr, rank, size, config)?)
            }
        })
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, GroupError>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| GroupError::InvalidConfig(format!("{name}={value:?}: {e}")))
}
