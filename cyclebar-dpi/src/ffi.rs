//! C ABI over a process-global [`Bridge`].
//!
//! Every function returns 0 on success and a negative [`BridgeError::code`]
//! on failure; the error itself is logged. 64-bit cycle counts are written to
//! an `svBitVecVal[2]` (two 32-bit words, bits 31:0 first).

use std::ffi::{c_char, c_int, c_longlong, CStr};
use std::sync::Once;
use std::time::Duration;

use cyclebar::BarrierError;
use log::{error, warn};
use parking_lot::{const_mutex, Mutex};

use crate::{Bridge, BridgeError, Result};

/// `svBitVecVal` from svdpi.h.
pub type SvBitVecVal = u32;

static BRIDGE: Mutex<Bridge> = const_mutex(Bridge::new());
static EXIT_HOOK: Once = Once::new();

fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .try_init();
}

extern "C" fn close_at_exit() {
    let Some(mut bridge) = BRIDGE.try_lock() else {
        return;
    };
    if let Some(uri) = bridge.uri().map(str::to_string) {
        warn!("{}", BarrierError::ResourceLeak { uri });
        if let Err(e) = bridge.close() {
            warn!("closing barrier at exit failed: {}", e);
        }
    }
}

fn report(what: &str, res: Result<()>) -> c_int {
    match res {
        Ok(()) => 0,
        Err(e) => {
            error!("{}: {}", what, e);
            e.code()
        }
    }
}

unsafe fn write_cycle(out: *mut SvBitVecVal, cycle: u64) -> Result<()> {
    if out.is_null() {
        return Err(BridgeError::NullPointer("cycle_out"));
    }
    out.write(cycle as u32);
    out.add(1).write((cycle >> 32) as u32);
    Ok(())
}

unsafe fn open_impl(uri: *const c_char, is_leader: c_int, num_procs: c_int) -> Result<()> {
    if uri.is_null() {
        return Err(BridgeError::NullPointer("uri"));
    }
    let raw = CStr::from_ptr(uri);
    let uri = raw
        .to_str()
        .map_err(|_| BarrierError::InvalidUri(raw.to_string_lossy().into_owned()))?;
    let num_procs = u32::try_from(num_procs).map_err(|_| {
        BarrierError::InvalidArgument(format!("participant count {} is negative", num_procs))
    })?;
    BRIDGE.lock().open(uri, is_leader != 0, num_procs)
}

/// Opens the process's barrier.
///
/// \param uri Path of the shared barrier file.
/// \param is_leader Non-zero in exactly one participant, which creates the barrier.
/// \param num_procs Number of participating processes.
/// \return 0 on success; -10 means the leader has not created it yet (retryable).
///
/// # Safety
/// `uri` must be null or point to a NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn cyclebar_dpi_open(
    uri: *const c_char,
    is_leader: c_int,
    num_procs: c_int,
) -> c_int {
    init_logging();
    let res = open_impl(uri, is_leader, num_procs);
    if res.is_ok() {
        EXIT_HOOK.call_once(|| {
            if unsafe { libc::atexit(close_at_exit) } != 0 {
                warn!("could not register the barrier exit hook");
            }
        });
    }
    report("cyclebar_dpi_open", res)
}

/// Waits at the barrier; call once per clock cycle.
///
/// # Safety
/// `cycle_out` must be null or point to two writable 32-bit words.
#[no_mangle]
pub unsafe extern "C" fn cyclebar_dpi_wait(cycle_out: *mut SvBitVecVal) -> c_int {
    let res = BRIDGE
        .lock()
        .wait()
        .and_then(|cycle| unsafe { write_cycle(cycle_out, cycle) });
    report("cyclebar_dpi_wait", res)
}

/// Reads the synchronized cycle count without waiting.
///
/// # Safety
/// Same as [`cyclebar_dpi_wait`].
#[no_mangle]
pub unsafe extern "C" fn cyclebar_dpi_get_cycle(cycle_out: *mut SvBitVecVal) -> c_int {
    let res = BRIDGE
        .lock()
        .cycle()
        .and_then(|cycle| unsafe { write_cycle(cycle_out, cycle) });
    report("cyclebar_dpi_get_cycle", res)
}

/// Closes the barrier. Closing when nothing is open is a no-op.
#[no_mangle]
pub extern "C" fn cyclebar_dpi_close() -> c_int {
    report("cyclebar_dpi_close", BRIDGE.lock().close())
}

/// 1 if a barrier is open in this process, 0 otherwise.
#[no_mangle]
pub extern "C" fn cyclebar_dpi_ready() -> c_int {
    BRIDGE.lock().is_open() as c_int
}

/// Participant count of the open barrier, 0 if none is open.
#[no_mangle]
pub extern "C" fn cyclebar_dpi_get_num_procs() -> c_int {
    BRIDGE
        .lock()
        .participant_count()
        .map_or(0, |n| c_int::try_from(n).unwrap_or(c_int::MAX))
}

/// Bounds every later wait to `ms` milliseconds; `ms <= 0` waits forever.
#[no_mangle]
pub extern "C" fn cyclebar_dpi_set_timeout_ms(ms: c_longlong) -> c_int {
    let timeout = (ms > 0).then(|| Duration::from_millis(ms as u64));
    BRIDGE.lock().set_timeout(timeout);
    0
}
