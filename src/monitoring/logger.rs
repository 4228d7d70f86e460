use anyhow::Result;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use crate::pipeline::refresh::CycleReport;

const HEADER: &str = "timestamp,status,fetched,selected,generated,reused,deferred,failed,duration_ms";

/// Appends one row per refresh cycle.
pub struct CsvLogger {
    log_path: String,
}

impl CsvLogger {
    pub fn new(log_path: String) -> Result<Self> {
        // Create CSV file with headers if it doesn't exist
        if !Path::new(&log_path).exists() {
            if let Some(parent) = Path::new(&log_path).parent() {
                if !parent.as_os_str().is_empty() {
                    fs::create_dir_all(parent)?;
                }
            }

            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .open(&log_path)?;

            writeln!(file, "{}", HEADER)?;
        }

        Ok(Self { log_path })
    }

    pub fn log_cycle(&self, report: &CycleReport) -> Result<()> {
        let mut file = OpenOptions::new()
            .append(true)
            .open(&self.log_path)?;

        writeln!(
            file,
            "{},{},{},{},{},{},{},{},{}",
            report.started_at.to_rfc3339(),
            report.status,
            report.markets_fetched,
            report.markets_selected,
            report.generated,
            report.reused,
            report.deferred,
            report.failures.len(),
            report.duration.as_millis()
        )?;

        Ok(())
    }
}
