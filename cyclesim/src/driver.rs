use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use cyclebar_dpi::{Bridge, BridgeError};
use log::{debug, info, trace, warn};
use serde::Serialize;
use thiserror::Error;

use crate::config::DriverConfig;
use crate::model::ClockedModel;

#[derive(Error, Debug)]
pub enum DriverError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("barrier {uri} failed at cycle {cycle}: {source}")]
    Barrier {
        uri: String,
        cycle: u64,
        #[source]
        source: BridgeError,
    },

    #[error("barrier {uri} returned cycle {observed}, expected {expected}")]
    CycleDivergence {
        uri: String,
        expected: u64,
        observed: u64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    MaxCycles,
    Finished,
    Interrupted,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub cycles: u64,
    /// Simulated time reached, in ps.
    pub sim_time: u64,
    pub stop_reason: StopReason,
    pub barrier_uri: Option<String>,
    pub barrier_leader: bool,
    /// Wall time spent blocked at the barrier.
    pub barrier_wait_seconds: f64,
    pub run_seconds: f64,
}

/// Fails unless the barrier handed back the cycle this process is on.
pub fn check_cycle(uri: &str, expected: u64, observed: u64) -> Result<(), DriverError> {
    if observed != expected {
        return Err(DriverError::CycleDivergence {
            uri: uri.to_string(),
            expected,
            observed,
        });
    }
    Ok(())
}

/// Steps a [`ClockedModel`] cycle by cycle, meeting the other simulators at
/// the barrier before every rising edge.
///
/// The driver owns its [`Bridge`]; the barrier is closed when `run` returns,
/// whatever the outcome, and by the bridge's drop if the model panics.
pub struct Driver<M> {
    model: M,
    config: DriverConfig,
    bridge: Bridge,
    stop: Arc<AtomicBool>,
    cycle: u64,
    sim_time: u64,
}

impl<M: ClockedModel> Driver<M> {
    pub fn new(model: M, config: DriverConfig) -> Self {
        Self {
            model,
            config,
            bridge: Bridge::new(),
            stop: Arc::new(AtomicBool::new(false)),
            cycle: 0,
            sim_time: 0,
        }
    }

    /// Setting the flag ends the run before the next cycle starts.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    pub fn run(&mut self) -> Result<RunSummary, DriverError> {
        if let Err(e) = self.open_barrier() {
            self.model.finalize();
            return Err(e);
        }
        if let Some(delay) = self.config.start_delay {
            info!("delaying start by {:?}", delay);
            thread::sleep(delay);
        }
        let res = self.run_cycles();
        let closed = self.close_barrier();
        self.model.finalize();
        let summary = res?;
        closed?;
        Ok(summary)
    }

    fn uri(&self) -> String {
        self.config
            .barrier
            .as_ref()
            .map_or_else(String::new, |b| b.uri.clone())
    }

    fn open_barrier(&mut self) -> Result<(), DriverError> {
        let Some(settings) = &self.config.barrier else {
            info!("no barrier_uri given, running unsynchronized");
            return Ok(());
        };
        let retry = &self.config.retry;
        self.bridge.set_timeout(settings.timeout);
        let mut attempt = 0;
        loop {
            match self
                .bridge
                .open(&settings.uri, settings.leader, settings.procs)
            {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() && attempt + 1 < retry.attempts => {
                    let delay = retry.backoff(attempt);
                    debug!(
                        "barrier {} not ready ({}), retrying in {:?}",
                        settings.uri, e, delay
                    );
                    thread::sleep(delay);
                    attempt += 1;
                }
                Err(source) => {
                    return Err(DriverError::Barrier {
                        uri: settings.uri.clone(),
                        cycle: 0,
                        source,
                    })
                }
            }
        }
    }

    fn close_barrier(&mut self) -> Result<(), DriverError> {
        if !self.bridge.is_open() {
            return Ok(());
        }
        let uri = self.uri();
        self.bridge.close().map_err(|source| DriverError::Barrier {
            uri,
            cycle: self.cycle,
            source,
        })
    }

    fn run_cycles(&mut self) -> Result<RunSummary, DriverError> {
        let start = Instant::now();
        let mut waited = Duration::ZERO;
        let uri = self.uri();
        let (rise, fall) = self.config.half_periods;

        self.model.set_clock(false);
        self.model.eval();

        let stop_reason = loop {
            if self.model.finished() {
                info!("model finished at cycle {}", self.cycle);
                break StopReason::Finished;
            }
            if self.stop.load(Ordering::Relaxed) {
                warn!("interrupted at cycle {}", self.cycle);
                break StopReason::Interrupted;
            }
            if self.config.max_cycles > 0 && self.cycle >= self.config.max_cycles {
                info!("reached max_cycles={}", self.config.max_cycles);
                break StopReason::MaxCycles;
            }

            self.model.eval();

            if self.bridge.is_open() {
                let expected = self.cycle + 1;
                let t = Instant::now();
                let observed = self.bridge.wait().map_err(|source| DriverError::Barrier {
                    uri: uri.clone(),
                    cycle: expected,
                    source,
                })?;
                waited += t.elapsed();
                check_cycle(&uri, expected, observed)?;
                trace!("cycle {} released", observed);
            }

            self.sim_time += rise;
            self.model.set_clock(true);
            self.model.eval();
            self.sim_time += fall;
            self.model.set_clock(false);
            self.model.eval();
            self.cycle += 1;
        };

        Ok(RunSummary {
            cycles: self.cycle,
            sim_time: self.sim_time,
            stop_reason,
            barrier_uri: self.config.barrier.as_ref().map(|b| b.uri.clone()),
            barrier_leader: self.config.barrier.as_ref().is_some_and(|b| b.leader),
            barrier_wait_seconds: waited.as_secs_f64(),
            run_seconds: start.elapsed().as_secs_f64(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BarrierSettings, RetryPolicy};
    use crate::model::CounterModel;
    use cyclebar::{Barrier, BarrierError, Role};

    fn synced(uri: &str, leader: bool, procs: u32, max_cycles: u64) -> DriverConfig {
        DriverConfig {
            barrier: Some(BarrierSettings {
                uri: uri.to_string(),
                leader,
                procs,
                timeout: Some(Duration::from_secs(10)),
            }),
            max_cycles,
            half_periods: (5_000, 5_000),
            start_delay: None,
            retry: RetryPolicy {
                attempts: 200,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(20),
            },
        }
    }

    #[test]
    fn test_check_cycle() {
        check_cycle("/dev/shm/b", 3, 3).unwrap();
        match check_cycle("/dev/shm/b", 3, 5) {
            Err(DriverError::CycleDivergence {
                uri,
                expected,
                observed,
            }) => {
                assert_eq!(uri, "/dev/shm/b");
                assert_eq!((expected, observed), (3, 5));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_unsynchronized_max_cycles() {
        let mut driver = Driver::new(CounterModel::new(0), DriverConfig::unsynchronized(25));
        let summary = driver.run().unwrap();
        assert_eq!(summary.cycles, 25);
        assert_eq!(summary.stop_reason, StopReason::MaxCycles);
        assert_eq!(summary.sim_time, 25 * 10_000);
        assert_eq!(summary.barrier_uri, None);
        assert_eq!(driver.model().count(), 25);
        assert!(driver.model().is_finalized());
    }

    #[test]
    fn test_start_delay_before_first_cycle() {
        let mut config = DriverConfig::unsynchronized(3);
        config.start_delay = Some(Duration::from_millis(100));
        let start = Instant::now();
        let summary = Driver::new(CounterModel::new(0), config).run().unwrap();
        assert!(start.elapsed() >= Duration::from_millis(100));
        assert!(summary.run_seconds < 0.1);
        assert_eq!(summary.cycles, 3);
    }

    #[test]
    fn test_model_finish_and_interrupt() {
        let mut driver = Driver::new(CounterModel::new(7), DriverConfig::unsynchronized(0));
        let summary = driver.run().unwrap();
        assert_eq!(summary.stop_reason, StopReason::Finished);
        assert_eq!(summary.cycles, 7);

        let mut driver = Driver::new(CounterModel::new(0), DriverConfig::unsynchronized(0));
        driver.stop_flag().store(true, Ordering::Relaxed);
        let summary = driver.run().unwrap();
        assert_eq!(summary.stop_reason, StopReason::Interrupted);
        assert_eq!(summary.cycles, 0);
    }

    #[test]
    fn test_two_drivers_in_lockstep() {
        let dir = tempfile::Builder::new()
            .prefix("driver_test")
            .tempdir()
            .unwrap();
        let uri = dir.path().join("lockstep").to_str().unwrap().to_string();

        // the follower starts first and has to retry until the leader is up
        let follower = {
            let uri = uri.clone();
            thread::spawn(move || {
                Driver::new(CounterModel::new(0), synced(&uri, false, 2, 50)).run()
            })
        };
        thread::sleep(Duration::from_millis(20));
        let leader = {
            let uri = uri.clone();
            thread::spawn(move || {
                Driver::new(CounterModel::new(0), synced(&uri, true, 2, 50)).run()
            })
        };

        let leader = leader.join().unwrap().unwrap();
        let follower = follower.join().unwrap().unwrap();
        assert_eq!(leader.cycles, 50);
        assert_eq!(follower.cycles, 50);
        assert!(leader.barrier_leader);
        assert!(!follower.barrier_leader);
        assert!(!dir.path().join("lockstep").exists());
    }

    #[test]
    fn test_divergence_is_fatal() {
        let dir = tempfile::Builder::new()
            .prefix("driver_test")
            .tempdir()
            .unwrap();
        let uri = dir.path().join("ahead").to_str().unwrap().to_string();
        let mut leader = Barrier::open(&uri, Role::Leader, 1).unwrap();
        assert_eq!(leader.wait().unwrap(), 1);

        let mut driver = Driver::new(CounterModel::new(0), synced(&uri, false, 1, 10));
        match driver.run() {
            Err(DriverError::CycleDivergence {
                expected, observed, ..
            }) => assert_eq!((expected, observed), (1, 2)),
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(driver.cycle(), 0);
        leader.close().unwrap();
    }

    #[test]
    fn test_open_gives_up_after_retries() {
        let dir = tempfile::Builder::new()
            .prefix("driver_test")
            .tempdir()
            .unwrap();
        let uri = dir.path().join("nobody").to_str().unwrap().to_string();
        let mut config = synced(&uri, false, 2, 10);
        config.retry.attempts = 3;
        let mut driver = Driver::new(CounterModel::new(0), config);
        match driver.run() {
            Err(DriverError::Barrier {
                cycle: 0,
                source: BridgeError::Barrier(BarrierError::NotFound { .. }),
                ..
            }) => {}
            other => panic!("unexpected: {:?}", other),
        }
        assert!(driver.model().is_finalized());
    }

    #[test]
    fn test_timeout_names_uri_and_cycle() {
        let dir = tempfile::Builder::new()
            .prefix("driver_test")
            .tempdir()
            .unwrap();
        let uri = dir.path().join("alone").to_str().unwrap().to_string();
        let mut config = synced(&uri, true, 2, 10);
        config.barrier.as_mut().unwrap().timeout = Some(Duration::from_millis(50));
        let err = Driver::new(CounterModel::new(0), config).run().err().unwrap();
        let msg = err.to_string();
        assert!(msg.contains(&uri), "{}", msg);
        assert!(msg.contains("cycle 1"), "{}", msg);
        // the leader's close on the error path removed the barrier
        assert!(!dir.path().join("alone").exists());
    }
}
