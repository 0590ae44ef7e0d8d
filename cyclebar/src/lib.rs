//! # Cycle barrier
//!
//! A named barrier shared by several OS processes, used to keep independent
//! simulators in lockstep one clock cycle at a time.
//!
//! Every participant opens the same URI. Exactly one of them is the
//! [`Role::Leader`]: it creates the shared state and removes it on close. The
//! others are [`Role::Follower`]s and only attach; a follower that shows up
//! before its leader gets [`BarrierError::NotFound`] and is expected to retry.
//!
//! Each cycle, every participant calls [`Barrier::wait`]. The call blocks on a
//! process-shared condition variable until all participants have arrived and
//! then returns the cycle count of the completed round, identical for all of
//! them. Counts start at 1 and grow by exactly one per round. A round token
//! (the generation) keeps a fast participant from slipping through a round it
//! has not finished waiting for.
//!
//! The shared state lives in a file-backed mapping at the URI path. The leader
//! builds it in a private staging file and publishes it with a no-replace
//! link, so followers never see it half-initialized and two racing leaders
//! cannot both succeed. The state carries an owner stamp (pid and start time)
//! so that state orphaned by a crashed run is recognised and replaced rather
//! than mistaken for a live barrier.
//!
//! ```no_run
//! use cyclebar::{Barrier, Role};
//!
//! let mut barrier = Barrier::open("/dev/shm/sim_barrier", Role::Leader, 2).unwrap();
//! for _ in 0..100 {
//!     let cycle = barrier.wait().unwrap();
//!     // advance the simulation for `cycle`
//!     # let _ = cycle;
//! }
//! barrier.close().unwrap();
//! ```

#[cfg(not(unix))]
compile_error!("cyclebar needs a unix target (pthread and mmap)");

pub mod barrier;
pub mod error;
mod liveness;
pub mod role;
mod shm;
mod state;
mod sync;
pub mod uri;

pub use barrier::{inspect, reclaim, Barrier, Occupancy};
pub use error::{BarrierError, Result};
pub use role::Role;
pub use uri::BarrierUri;
