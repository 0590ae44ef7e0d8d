//! Owner stamps used to tell a live barrier from one orphaned by a crash.
//!
//! A pid alone is not enough because pids get recycled, so the stamp also
//! records the process start time from `/proc/<pid>/stat` where available.

use std::fs;
use std::io;

/// Identity of the process that created a barrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct OwnerStamp {
    pub pid: i32,
    /// Start time in clock ticks since boot, 0 when unknown.
    pub start_time: u64,
}

impl OwnerStamp {
    pub fn current() -> Self {
        let pid = std::process::id() as i32;
        let start_time = match read_proc_stat(pid) {
            Ok(ProcStat { start_time, .. }) => start_time,
            Err(_) => 0,
        };
        Self { pid, start_time }
    }

    pub fn is_alive(&self) -> bool {
        if self.pid <= 0 {
            return false;
        }
        match read_proc_stat(self.pid) {
            Ok(stat) => {
                !stat.is_zombie() && (self.start_time == 0 || stat.start_time == self.start_time)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound && proc_available() => false,
            Err(_) => signal_probe(self.pid),
        }
    }
}

struct ProcStat {
    state: char,
    start_time: u64,
}

impl ProcStat {
    fn is_zombie(&self) -> bool {
        matches!(self.state, 'Z' | 'X' | 'x')
    }
}

fn read_proc_stat(pid: i32) -> io::Result<ProcStat> {
    let content = fs::read_to_string(format!("/proc/{}/stat", pid))?;
    parse_proc_stat(&content)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "malformed /proc stat line"))
}

// The command name is parenthesised and may itself contain spaces or parens,
// so fields are counted from the last ')'. State is field 3, starttime is 22.
fn parse_proc_stat(content: &str) -> Option<ProcStat> {
    let rest = &content[content.rfind(')')? + 1..];
    let mut fields = rest.split_whitespace();
    let state = fields.next()?.chars().next()?;
    let start_time = fields.nth(18)?.parse().ok()?;
    Some(ProcStat { state, start_time })
}

fn proc_available() -> bool {
    fs::metadata("/proc/self/stat").is_ok()
}

fn signal_probe(pid: i32) -> bool {
    let r = unsafe { libc::kill(pid, 0) };
    r == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}
