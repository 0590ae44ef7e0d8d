use std::fs;
use std::io;
use std::time::{Duration, Instant};

use log::{debug, trace, warn};

use crate::error::{BarrierError, Result};
use crate::liveness::OwnerStamp;
use crate::role::Role;
use crate::shm::{file_id_of, SharedRegion};
use crate::state::{SharedState, Status};
use crate::sync::{Deadline, Wake};
use crate::uri::BarrierUri;

/// How often a blocked follower checks that its leader is still running.
const LIVENESS_POLL: Duration = Duration::from_millis(250);

/// What currently sits at a barrier URI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Occupancy {
    Absent,
    /// Open barrier whose leader is still running.
    Live { participant_count: u32 },
    /// Left behind by a leader that closed or died.
    Stale,
}

/// Looks at the URI without attaching to it.
///
/// Fails with [`BarrierError::Corrupt`] if the file there is not a barrier of
/// this layout, so a mistyped URI never leads to someone else's file being
/// deleted.
pub fn inspect(uri: &BarrierUri) -> Result<Occupancy> {
    let region = match SharedRegion::open(uri.path()) {
        Ok(region) => region,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Occupancy::Absent),
        Err(e) => return Err(open_error(uri, e)),
    };
    let state = region.state();
    validate(uri, state)?;
    if state.is_live() {
        Ok(Occupancy::Live {
            participant_count: state.participant_count(),
        })
    } else {
        Ok(Occupancy::Stale)
    }
}

/// Removes stale state at `uri`, leaving live barriers alone.
///
/// Returns what was found. When that is [`Occupancy::Stale`] the backing file
/// has been removed.
pub fn reclaim(uri: &str) -> Result<Occupancy> {
    let uri = BarrierUri::parse(uri)?;
    let found = inspect(&uri)?;
    if found == Occupancy::Stale {
        remove_stale(&uri)?;
    }
    Ok(found)
}

/// One participant's handle on a named, process-shared cycle barrier.
///
/// Every participant opens the barrier once, calls [`Barrier::wait`] once per
/// cycle, and closes it at the end. A round completes when all
/// `participant_count` participants have arrived; every waiter of that round
/// gets the same, newly incremented cycle count. The first round returns 1.
pub struct Barrier {
    uri: BarrierUri,
    role: Role,
    participant_count: u32,
    region: Option<SharedRegion>,
    timeout: Option<Duration>,
}

impl Barrier {
    /// Opens the barrier at `uri`.
    ///
    /// # Parameters
    ///
    /// - `uri`: path of the shared backing file, optionally `file://` prefixed
    /// - `role`: [`Role::Leader`] creates the barrier, [`Role::Follower`] attaches
    /// - `participant_count`: processes expected at every round
    ///
    /// # Returns
    ///
    /// - `Ok`: an attached handle
    /// - `Err(NotFound)`: a follower arrived before its leader; retry later
    /// - `Err(AlreadyExists)`: a leader found another live barrier at `uri`
    /// - `Err(MismatchedParticipantCount)`: a follower disagrees with the leader
    pub fn open(uri: &str, role: Role, participant_count: u32) -> Result<Self> {
        let uri = BarrierUri::parse(uri)?;
        if participant_count == 0 {
            return Err(BarrierError::InvalidArgument(format!(
                "barrier {} needs at least one participant",
                uri
            )));
        }
        let region = match role {
            Role::Leader => create(&uri, participant_count)?,
            Role::Follower => attach(&uri, participant_count)?,
        };
        debug!(
            "opened barrier {} as {} for {} participants",
            uri, role, participant_count
        );
        Ok(Self {
            uri,
            role,
            participant_count,
            region: Some(region),
            timeout: None,
        })
    }

    /// Sets the bound used by [`Barrier::wait`]. `None` waits forever.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Blocks until every participant has arrived, then returns the cycle
    /// count of the completed round. Honors the handle's timeout, if any.
    ///
    /// A follower whose leader exits without closing fails with
    /// [`BarrierError::BarrierClosed`] instead of waiting forever.
    pub fn wait(&self) -> Result<u64> {
        self.wait_inner(self.timeout)
    }

    /// Like [`Barrier::wait`] with an explicit bound. On expiry the caller's
    /// arrival is withdrawn and [`BarrierError::BarrierTimeout`] is returned.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<u64> {
        self.wait_inner(Some(timeout))
    }

    fn wait_inner(&self, timeout: Option<Duration>) -> Result<u64> {
        let state = self.state()?;
        let start = Instant::now();
        let mut rounds = state.lock().map_err(|e| self.io(e))?;
        if rounds.owner_died() {
            return Err(self.break_barrier(state));
        }
        if state.status() != Status::Open {
            return Err(self.closed());
        }

        rounds.arrived += 1;
        if rounds.arrived >= self.participant_count {
            rounds.arrived = 0;
            rounds.generation = rounds.generation.wrapping_add(1);
            let cycle = state.advance_cycle();
            state.notify_all();
            trace!("barrier {} released cycle {}", self.uri, cycle);
            return Ok(cycle);
        }

        let generation = rounds.generation;
        loop {
            let slice = match timeout {
                Some(t) => t.saturating_sub(start.elapsed()).min(LIVENESS_POLL),
                None => LIVENESS_POLL,
            };
            let deadline = Deadline::after(slice);
            let wake = rounds.wait(Some(&deadline)).map_err(|e| self.io(e))?;
            if wake == Wake::OwnerDied {
                return Err(self.break_barrier(state));
            }
            // released, possibly at the same moment the deadline passed
            if rounds.generation != generation {
                return Ok(state.cycle());
            }
            if state.status() != Status::Open {
                rounds.arrived = rounds.arrived.saturating_sub(1);
                return Err(self.closed());
            }
            if wake != Wake::TimedOut {
                continue;
            }
            let waited = start.elapsed();
            if timeout.is_some_and(|t| waited >= t) {
                rounds.arrived = rounds.arrived.saturating_sub(1);
                return Err(BarrierError::BarrierTimeout {
                    uri: self.uri.to_string(),
                    cycle: state.cycle() + 1,
                    waited,
                });
            }
            if !self.role.is_leader() && !state.owner().is_alive() {
                warn!(
                    "barrier {}: leader {} exited without closing",
                    self.uri,
                    state.owner().pid
                );
                rounds.arrived = rounds.arrived.saturating_sub(1);
                state.set_status(Status::Closed);
                state.notify_all();
                return Err(self.closed());
            }
        }
    }

    /// Current cycle count, without waiting.
    pub fn cycle(&self) -> Result<u64> {
        Ok(self.state()?.cycle())
    }

    /// Deregisters this participant.
    ///
    /// A leader also marks the barrier closed, wakes every waiter (they fail
    /// with [`BarrierError::BarrierClosed`]) and removes the URI so the next
    /// run starts fresh. Followers that are still attached keep their mapping
    /// until they close. Closing twice is a no-op.
    pub fn close(&mut self) -> Result<()> {
        let region = match self.region.take() {
            Some(region) => region,
            None => return Ok(()),
        };
        let state = region.state();
        let mut rounds = state.lock().map_err(|e| self.io(e))?;
        if rounds.owner_died() {
            warn!("barrier {}: a participant died holding the lock", self.uri);
            state.set_status(Status::Broken);
            state.notify_all();
        }
        rounds.attached = rounds.attached.saturating_sub(1);
        let remaining = rounds.attached;
        if self.role.is_leader() && state.status() == Status::Open {
            state.set_status(Status::Closed);
            state.notify_all();
        }

        // only remove the path if it still names our barrier; holding the
        // lock keeps a stale-state claimer from interleaving
        if self.role.is_leader() {
            match file_id_of(self.uri.path()) {
                Ok(id) if id == region.file_id() => remove_if_present(&self.uri)?,
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(self.io(e)),
            }
        }
        drop(rounds);
        debug!(
            "closed barrier {} as {} at cycle {} ({} still attached)",
            self.uri,
            self.role,
            state.cycle(),
            remaining
        );
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.region.is_none()
    }

    pub fn uri(&self) -> &BarrierUri {
        &self.uri
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn participant_count(&self) -> u32 {
        self.participant_count
    }

    fn state(&self) -> Result<&SharedState> {
        match &self.region {
            Some(region) => Ok(region.state()),
            None => Err(self.closed()),
        }
    }

    fn break_barrier(&self, state: &SharedState) -> BarrierError {
        warn!("barrier {}: a participant died holding the lock", self.uri);
        state.set_status(Status::Broken);
        state.notify_all();
        self.closed()
    }

    fn closed(&self) -> BarrierError {
        BarrierError::BarrierClosed {
            uri: self.uri.to_string(),
        }
    }

    fn io(&self, e: io::Error) -> BarrierError {
        BarrierError::io(self.uri.as_str(), e)
    }
}

impl Drop for Barrier {
    fn drop(&mut self) {
        if self.region.is_none() {
            return;
        }
        warn!(
            "{}",
            BarrierError::ResourceLeak {
                uri: self.uri.to_string()
            }
        );
        if let Err(e) = self.close() {
            warn!("closing leaked barrier failed: {}", e);
        }
    }
}

fn create(uri: &BarrierUri, participant_count: u32) -> Result<SharedRegion> {
    match inspect(uri)? {
        Occupancy::Live {
            participant_count: existing,
        } => {
            return Err(BarrierError::AlreadyExists {
                uri: uri.to_string(),
                existing,
                requested: participant_count,
            })
        }
        Occupancy::Stale => remove_stale(uri)?,
        Occupancy::Absent => {}
    }

    let owner = OwnerStamp::current();
    let staging = uri.staging_path(owner.pid as u32);
    // leftover of an earlier process that had our pid and crashed mid-open
    let _ = fs::remove_file(&staging);
    let region = SharedRegion::create(&staging).map_err(|e| BarrierError::io(uri.as_str(), e))?;
    let published = unsafe { region.state().init(participant_count, owner) }
        .and_then(|_| fs::hard_link(&staging, uri.path()));
    let _ = fs::remove_file(&staging);

    match published {
        Ok(()) => Ok(region),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            // another leader published first
            let existing = SharedRegion::open(uri.path())
                .map(|r| r.state().participant_count())
                .unwrap_or(0);
            Err(BarrierError::AlreadyExists {
                uri: uri.to_string(),
                existing,
                requested: participant_count,
            })
        }
        Err(e) => Err(BarrierError::io(uri.as_str(), e)),
    }
}

/// Claims the stale state at `uri` under its own lock and removes it.
///
/// At most one caller wins the claim on a given file. Everyone else leaves the
/// path alone and goes on to publish, where the no-replace link decides the
/// single winner.
fn remove_stale(uri: &BarrierUri) -> Result<()> {
    let region = match SharedRegion::open(uri.path()) {
        Ok(region) => region,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(open_error(uri, e)),
    };
    let state = region.state();
    validate(uri, state)?;
    {
        let rounds = state
            .lock()
            .map_err(|e| BarrierError::io(uri.as_str(), e))?;
        if rounds.owner_died() {
            state.set_status(Status::Broken);
            state.notify_all();
        }
        if state.is_live() {
            // someone already published a fresh barrier here
            return Ok(());
        }
        if state.status() == Status::Reclaimed && state.owner().is_alive() {
            debug!("stale barrier {} is being removed by {}", uri, state.owner().pid);
            return Ok(());
        }
        state.claim(OwnerStamp::current());
        state.notify_all();
    }

    warn!("removing stale barrier {}", uri);
    match file_id_of(uri.path()) {
        Ok(id) if id == region.file_id() => remove_if_present(uri),
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(BarrierError::io(uri.as_str(), e)),
    }
}

fn attach(uri: &BarrierUri, participant_count: u32) -> Result<SharedRegion> {
    let region = SharedRegion::open(uri.path()).map_err(|e| open_error(uri, e))?;
    let state = region.state();
    validate(uri, state)?;
    if !state.owner().is_alive() {
        debug!("barrier {} is stale: leader {} is gone", uri, state.owner().pid);
        return Err(not_found(uri));
    }

    let mut rounds = state
        .lock()
        .map_err(|e| BarrierError::io(uri.as_str(), e))?;
    if rounds.owner_died() {
        warn!("barrier {}: a participant died holding the lock", uri);
        state.set_status(Status::Broken);
        state.notify_all();
    }
    if state.status() != Status::Open {
        debug!("barrier {} is no longer open", uri);
        return Err(not_found(uri));
    }
    let expected = state.participant_count();
    if expected != participant_count {
        return Err(BarrierError::MismatchedParticipantCount {
            uri: uri.to_string(),
            expected,
            supplied: participant_count,
        });
    }
    rounds.attached += 1;
    drop(rounds);
    Ok(region)
}

fn validate(uri: &BarrierUri, state: &SharedState) -> Result<()> {
    state.validate().map_err(|reason| BarrierError::Corrupt {
        uri: uri.to_string(),
        reason,
    })
}

fn open_error(uri: &BarrierUri, e: io::Error) -> BarrierError {
    match e.kind() {
        io::ErrorKind::NotFound => not_found(uri),
        io::ErrorKind::InvalidData => BarrierError::Corrupt {
            uri: uri.to_string(),
            reason: e.to_string(),
        },
        _ => BarrierError::io(uri.as_str(), e),
    }
}

fn not_found(uri: &BarrierUri) -> BarrierError {
    BarrierError::NotFound {
        uri: uri.to_string(),
    }
}

fn remove_if_present(uri: &BarrierUri) -> Result<()> {
    match fs::remove_file(uri.path()) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(BarrierError::io(uri.as_str(), e)),
    }
}
