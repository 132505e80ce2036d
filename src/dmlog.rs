//! Operational log of degree-minutes evaluations, for offline tuning.
//!
//! One CSV file per day; every evaluation of the degree-minutes control
//! loop is appended whether or not a register write resulted. Log I/O
//! failures are reported through `log` and never interrupt control.

use chrono::Local;
use log::warn;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

const HEADER: &str = "time,state,f_target,f_compressor,t_condenser_out,dm_previous,dm_computed,written\n";

/// One evaluation of the degree-minutes loop.
#[derive(Debug)]
pub struct DmLogEntry<'a> {
    pub state: &'a str,
    pub f_target: f64,
    pub f_compressor: f64,
    pub t_condenser_out: f64,
    pub previous: f64,
    pub computed: f64,
    pub written: bool,
}

/// Append-only CSV writer keyed by wall-clock day.
#[derive(Debug, Clone)]
pub struct DmLog {
    dir: Option<PathBuf>,
}

impl DmLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: Some(dir.into()),
        }
    }

    /// A log that drops every entry (one-shot CLI commands).
    pub fn disabled() -> Self {
        Self { dir: None }
    }

    pub fn append(&self, entry: &DmLogEntry<'_>) {
        let Some(dir) = &self.dir else {
            return;
        };
        let now = Local::now();
        let path = dir.join(format!("dm_{}.csv", now.format("%Y-%m-%d")));
        let fresh = !path.exists();
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .and_then(|mut file| {
                if fresh {
                    file.write_all(HEADER.as_bytes())?;
                }
                let row = format!(
                    "{},{},{:.1},{:.1},{:.1},{:.1},{:.1},{}\n",
                    now.format("%H:%M:%S"),
                    entry.state,
                    entry.f_target,
                    entry.f_compressor,
                    entry.t_condenser_out,
                    entry.previous,
                    entry.computed,
                    if entry.written { 1 } else { 0 },
                );
                file.write_all(row.as_bytes())
            });
        if let Err(err) = result {
            warn!("cannot append degree-minutes log {}: {err}", path.display());
        }
    }
}
