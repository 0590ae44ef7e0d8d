//! Layout of the barrier state shared by every participant.
//!
//! The struct is `repr(C)` and holds no pointers, because each process maps
//! the region at a different address. Fields that never change after the
//! leader publishes the region are atomics only so they can be written
//! through a shared reference during initialization.

use std::cell::UnsafeCell;
use std::io;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering};

use crate::liveness::OwnerStamp;
use crate::sync::{Deadline, ProcessCondvar, ProcessMutex, Wake};

pub(crate) const LAYOUT_MAGIC: u64 = u64::from_le_bytes(*b"CYCBAR\0\x01");
pub(crate) const LAYOUT_VERSION: u32 = 1;

const CACHE_LINE_SIZE: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Status {
    Open,
    /// The leader closed the barrier.
    Closed,
    /// A participant died while holding the lock.
    Broken,
    /// Stale state a new leader has claimed and is removing.
    Reclaimed,
}

impl Status {
    fn from_raw(raw: u32) -> Self {
        match raw {
            0 => Status::Open,
            1 => Status::Closed,
            3 => Status::Reclaimed,
            _ => Status::Broken,
        }
    }

    fn raw(self) -> u32 {
        match self {
            Status::Open => 0,
            Status::Closed => 1,
            Status::Broken => 2,
            Status::Reclaimed => 3,
        }
    }
}

/// Counters guarded by the shared mutex.
#[repr(C)]
#[derive(Debug, Default)]
pub(crate) struct Rounds {
    /// Participants waiting in the current round.
    pub arrived: u32,
    /// Live handles attached to this barrier.
    pub attached: u32,
    /// Round token, bumped when a round completes.
    pub generation: u64,
}

#[repr(C, align(64))]
pub(crate) struct SharedState {
    magic: AtomicU64,
    version: AtomicU32,
    participant_count: AtomicU32,
    leader_pid: AtomicI32,
    status: AtomicU32,
    leader_start_time: AtomicU64,

    lock: ProcessMutex,
    cond: ProcessCondvar,
    rounds: UnsafeCell<Rounds>,

    // Written under `lock`, read lock-free by `cycle()`.
    cycle_count: AtomicU64,
}

const _: () = assert!(std::mem::align_of::<SharedState>() == CACHE_LINE_SIZE);

impl SharedState {
    pub const SIZE: usize = std::mem::size_of::<SharedState>();

    /// Fills in zeroed memory. The magic is stored last, so a reader that
    /// sees it also sees everything else.
    ///
    /// # Safety
    /// `self` must live in freshly zeroed memory that no other process has
    /// mapped yet.
    pub unsafe fn init(&self, participant_count: u32, owner: OwnerStamp) -> io::Result<()> {
        self.lock.init()?;
        self.cond.init()?;
        *self.rounds.get() = Rounds {
            arrived: 0,
            attached: 1,
            generation: 0,
        };
        self.cycle_count.store(0, Ordering::Relaxed);
        self.participant_count
            .store(participant_count, Ordering::Relaxed);
        self.leader_pid.store(owner.pid, Ordering::Relaxed);
        self.leader_start_time
            .store(owner.start_time, Ordering::Relaxed);
        self.status.store(Status::Open.raw(), Ordering::Relaxed);
        self.version.store(LAYOUT_VERSION, Ordering::Relaxed);
        self.magic.store(LAYOUT_MAGIC, Ordering::Release);
        Ok(())
    }

    /// Checks the header. Returns a human readable reason on mismatch.
    pub fn validate(&self) -> Result<(), String> {
        let magic = self.magic.load(Ordering::Acquire);
        if magic != LAYOUT_MAGIC {
            return Err(format!("bad magic {:#018x}", magic));
        }
        let version = self.version.load(Ordering::Relaxed);
        if version != LAYOUT_VERSION {
            return Err(format!(
                "layout version {} (expected {})",
                version, LAYOUT_VERSION
            ));
        }
        if self.participant_count() == 0 {
            return Err("participant count is zero".to_string());
        }
        Ok(())
    }

    pub fn participant_count(&self) -> u32 {
        self.participant_count.load(Ordering::Relaxed)
    }

    pub fn owner(&self) -> OwnerStamp {
        OwnerStamp {
            pid: self.leader_pid.load(Ordering::Relaxed),
            start_time: self.leader_start_time.load(Ordering::Relaxed),
        }
    }

    pub fn status(&self) -> Status {
        Status::from_raw(self.status.load(Ordering::Acquire))
    }

    pub fn set_status(&self, status: Status) {
        self.status.store(status.raw(), Ordering::Release);
    }

    /// A barrier is live while it is open and its leader is still running.
    pub fn is_live(&self) -> bool {
        self.status() == Status::Open && self.owner().is_alive()
    }

    /// Hands stale state to `claimer` for removal. Caller must hold the lock,
    /// which makes the claim exclusive.
    pub fn claim(&self, claimer: OwnerStamp) {
        self.leader_pid.store(claimer.pid, Ordering::Relaxed);
        self.leader_start_time
            .store(claimer.start_time, Ordering::Relaxed);
        self.set_status(Status::Reclaimed);
    }

    pub fn cycle(&self) -> u64 {
        self.cycle_count.load(Ordering::Acquire)
    }

    /// Completes a round. Caller must hold the lock.
    pub fn advance_cycle(&self) -> u64 {
        self.cycle_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn notify_all(&self) {
        self.cond.broadcast();
    }

    #[cfg(test)]
    pub fn leader_pid_for_test(&self) -> &AtomicI32 {
        &self.leader_pid
    }

    pub fn lock(&self) -> io::Result<RoundsGuard<'_>> {
        let wake = self.lock.lock()?;
        Ok(RoundsGuard {
            state: self,
            owner_died: wake == Wake::OwnerDied,
        })
    }
}

/// Holds the shared mutex; gives access to [`Rounds`].
pub(crate) struct RoundsGuard<'a> {
    state: &'a SharedState,
    owner_died: bool,
}

impl RoundsGuard<'_> {
    /// Set when some acquisition found the previous holder dead.
    pub fn owner_died(&self) -> bool {
        self.owner_died
    }

    /// Sleeps on the condvar until signaled or `deadline`.
    pub fn wait(&mut self, deadline: Option<&Deadline>) -> io::Result<Wake> {
        let wake = self.state.cond.wait(&self.state.lock, deadline)?;
        if wake == Wake::OwnerDied {
            self.owner_died = true;
        }
        Ok(wake)
    }
}

impl Deref for RoundsGuard<'_> {
    type Target = Rounds;

    fn deref(&self) -> &Rounds {
        unsafe { &*self.state.rounds.get() }
    }
}

impl DerefMut for RoundsGuard<'_> {
    fn deref_mut(&mut self) -> &mut Rounds {
        unsafe { &mut *self.state.rounds.get() }
    }
}

impl Drop for RoundsGuard<'_> {
    fn drop(&mut self) {
        self.state.lock.unlock();
    }
}
