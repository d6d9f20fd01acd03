// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! CPU tick reader backed by `/proc/stat`
//!
//! Only the aggregate `cpu` line is used:
//!
//! ```text
//! cpu  user nice system idle iowait irq softirq steal guest guest_nice
//! ```
//!
//! `guest` and `guest_nice` are already folded into `user` and `nice` by the kernel, so the total
//! is the sum of the first eight columns. Idle time includes `iowait`.

use crate::cpu::{CpuStats, CpuStatsReader};
use std::fs;
use std::io;
use std::path::PathBuf;
use tracing::debug;

const PROC_STAT_PATH: &str = "/proc/stat";
const ACCOUNTED_COLUMNS: usize = 8;
const IDLE_COLUMN: usize = 3;
const IOWAIT_COLUMN: usize = 4;

pub struct ProcStatReader {
    path: PathBuf,
}

impl ProcStatReader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Default for ProcStatReader {
    fn default() -> Self {
        Self::new(PROC_STAT_PATH)
    }
}

impl CpuStatsReader for ProcStatReader {
    fn read(&self) -> Option<CpuStats> {
        match fs::read_to_string(&self.path).and_then(|contents| parse_proc_stat(&contents)) {
            Ok(stats) => Some(stats),
            Err(e) => {
                debug!("Could not read CPU ticks from {}: {}", self.path.display(), e);
                None
            }
        }
    }
}

/// Parses the aggregate `cpu` line of a `/proc/stat` document.
pub fn parse_proc_stat(contents: &str) -> Result<CpuStats, io::Error> {
    let line = contents
        .lines()
        .find(|line| line.split_whitespace().next() == Some("cpu"))
        .ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "Aggregate cpu line not found")
        })?;

    let columns = line
        .split_whitespace()
        .skip(1)
        .take(ACCOUNTED_COLUMNS)
        .map(|value| {
            value.parse::<u64>().map_err(|e| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("Failed to parse cpu column {value:?}: {e}"),
                )
            })
        })
        .collect::<Result<Vec<u64>, io::Error>>()?;

    if columns.len() <= IDLE_COLUMN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Expected at least 4 cpu columns, got {}", columns.len()),
        ));
    }

    let idle = columns[IDLE_COLUMN] + columns.get(IOWAIT_COLUMN).copied().unwrap_or(0);
    let total = columns.iter().sum();

    Ok(CpuStats { idle, total })
}
