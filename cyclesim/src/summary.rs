use std::fs;
use std::io;
use std::path::Path;

use chrono::{DateTime, Utc};
use log::info;
use serde_json::json;

use crate::config::SimCli;
use crate::driver::RunSummary;

/// Writes the run summary as pretty JSON, creating parent directories.
pub fn write_summary(
    path: &str,
    cli: &SimCli,
    summary: &RunSummary,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> io::Result<()> {
    let duration_secs = (end - start).num_milliseconds() as f64 / 1000.0;
    let output_json = json!({
        "cli": cli,
        "command": std::env::args().collect::<Vec<_>>().join(" "),
        "pid": std::process::id(),
        "timestamps": {
            "start": start.to_rfc3339(),
            "end": end.to_rfc3339(),
            "duration_seconds": duration_secs
        },
        "run": summary,
    });

    info!("Dumping run summary to {}", path);
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    fs::write(path, serde_json::to_string_pretty(&output_json)?)
}
