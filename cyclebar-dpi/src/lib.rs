//! # cyclebar-dpi
//!
//! Adapter between a simulation kernel's native-call mechanism and
//! [`cyclebar`]. A simulator process holds at most one barrier, so the bridge
//! is a single owned [`Bridge`] value with an explicit open/close lifecycle.
//! With the `ffi` feature, a process-global `Bridge` is exported through a C
//! ABI that SystemVerilog can import over DPI-C (see `include/cyclebar_dpi.h`).

#[cfg(feature = "ffi")]
pub mod ffi;

use std::time::Duration;

use cyclebar::{Barrier, BarrierError, Role};
use log::info;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("a barrier is already open at {uri}")]
    AlreadyOpen { uri: String },

    #[error("no barrier is open")]
    NotOpen,

    #[error("null pointer passed for {0}")]
    NullPointer(&'static str),

    #[error(transparent)]
    Barrier(#[from] BarrierError),
}

impl BridgeError {
    /// Stable status code handed back across the C ABI. Zero is success.
    pub fn code(&self) -> i32 {
        match self {
            BridgeError::AlreadyOpen { .. } => -1,
            BridgeError::NotOpen => -2,
            BridgeError::NullPointer(_) => -3,
            BridgeError::Barrier(e) => match e {
                BarrierError::NotFound { .. } => -10,
                BarrierError::AlreadyExists { .. } => -11,
                BarrierError::MismatchedParticipantCount { .. } => -12,
                BarrierError::BarrierClosed { .. } => -13,
                BarrierError::BarrierTimeout { .. } => -14,
                BarrierError::ResourceLeak { .. } => -15,
                BarrierError::InvalidArgument(_) => -16,
                BarrierError::InvalidUri(_) => -17,
                BarrierError::Corrupt { .. } => -18,
                BarrierError::Io { .. } => -19,
            },
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, BridgeError::Barrier(e) if e.is_retryable())
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;

/// The one barrier handle of a simulation process.
///
/// Calls are expected from a single thread, one at a time. Opening twice is an
/// error; closing twice, or closing before opening, is a no-op. Dropping an
/// open bridge closes its barrier.
#[derive(Default)]
pub struct Bridge {
    barrier: Option<Barrier>,
    timeout: Option<Duration>,
}

impl Bridge {
    pub const fn new() -> Self {
        Self {
            barrier: None,
            timeout: None,
        }
    }

    pub fn open(&mut self, uri: &str, is_leader: bool, num_procs: u32) -> Result<()> {
        if let Some(b) = &self.barrier {
            return Err(BridgeError::AlreadyOpen {
                uri: b.uri().to_string(),
            });
        }
        let barrier =
            Barrier::open(uri, Role::from_flag(is_leader), num_procs)?.with_timeout(self.timeout);
        info!(
            "barrier sync enabled: uri={}, role={}, procs={}",
            barrier.uri(),
            barrier.role(),
            num_procs
        );
        self.barrier = Some(barrier);
        Ok(())
    }

    /// Blocks until every participant reached this cycle; returns its count.
    pub fn wait(&mut self) -> Result<u64> {
        Ok(self.barrier()?.wait()?)
    }

    /// Current cycle count, without waiting.
    pub fn cycle(&self) -> Result<u64> {
        Ok(self.barrier()?.cycle()?)
    }

    pub fn close(&mut self) -> Result<()> {
        match self.barrier.take() {
            Some(mut b) => Ok(b.close()?),
            None => Ok(()),
        }
    }

    /// Bound for every subsequent wait; `None` waits forever. Applies to an
    /// already open barrier too.
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
        if let Some(b) = self.barrier.as_mut() {
            b.set_timeout(timeout);
        }
    }

    pub fn is_open(&self) -> bool {
        self.barrier.is_some()
    }

    pub fn uri(&self) -> Option<&str> {
        self.barrier.as_ref().map(|b| b.uri().as_str())
    }

    pub fn participant_count(&self) -> Option<u32> {
        self.barrier.as_ref().map(|b| b.participant_count())
    }

    fn barrier(&self) -> Result<&Barrier> {
        self.barrier.as_ref().ok_or(BridgeError::NotOpen)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uri_in(dir: &tempfile::TempDir, name: &str) -> String {
        dir.path().join(name).to_str().unwrap().to_string()
    }

    #[test]
    fn test_lifecycle() {
        let dir = tempfile::Builder::new()
            .prefix("bridge_test")
            .tempdir()
            .unwrap();
        let uri = uri_in(&dir, "b");
        let mut bridge = Bridge::new();
        assert!(matches!(bridge.wait(), Err(BridgeError::NotOpen)));
        assert!(matches!(bridge.cycle(), Err(BridgeError::NotOpen)));
        bridge.close().unwrap();

        bridge.open(&uri, true, 1).unwrap();
        assert!(bridge.is_open());
        assert_eq!(bridge.participant_count(), Some(1));
        assert_eq!(bridge.uri(), Some(uri.as_str()));
        match bridge.open(&uri, true, 1) {
            Err(e @ BridgeError::AlreadyOpen { .. }) => assert_eq!(e.code(), -1),
            other => panic!("unexpected: {:?}", other),
        }

        assert_eq!(bridge.wait().unwrap(), 1);
        assert_eq!(bridge.wait().unwrap(), 2);
        assert_eq!(bridge.cycle().unwrap(), 2);

        bridge.close().unwrap();
        bridge.close().unwrap();
        assert!(!bridge.is_open());
        assert!(!dir.path().join("b").exists());
    }

    #[test]
    fn test_follower_flag_and_error_codes() {
        let dir = tempfile::Builder::new()
            .prefix("bridge_test")
            .tempdir()
            .unwrap();
        let uri = uri_in(&dir, "f");
        let mut follower = Bridge::new();
        let err = follower.open(&uri, false, 2).err().unwrap();
        assert!(err.is_retryable());
        assert_eq!(err.code(), -10);
        assert!(!follower.is_open());

        let mut leader = Bridge::new();
        leader.open(&uri, true, 2).unwrap();
        let err = follower.open(&uri, false, 5).err().unwrap();
        assert_eq!(err.code(), -12);
        assert!(!err.is_retryable());
        follower.open(&uri, false, 2).unwrap();

        follower.close().unwrap();
        leader.close().unwrap();
    }

    #[test]
    fn test_timeout_applies_to_open_barrier() {
        let dir = tempfile::Builder::new()
            .prefix("bridge_test")
            .tempdir()
            .unwrap();
        let uri = uri_in(&dir, "t");
        let mut bridge = Bridge::new();
        bridge.open(&uri, true, 2).unwrap();
        bridge.set_timeout(Some(Duration::from_millis(50)));
        let err = bridge.wait().err().unwrap();
        assert_eq!(err.code(), -14);
        bridge.close().unwrap();
    }
}
