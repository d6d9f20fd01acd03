// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Append-only CSV sinks for detection events and per-interval performance rows.

use crate::errors::RsuError;
use chrono::Local;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

pub const EVENT_LOG_HEADER: &str = "Time,Event_Type,Vehicle_ID,Speed,Details";
pub const PERF_LOG_HEADER: &str = "Time,CPU_Usage,In_Rate,Bandwidth_Mbps,Decode_Rate,Decode_Error_Rate,Process_Rate,Drop_Rate,Queue_Len,Emerg_Rate,Control_Rate";

const EVENT_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";
const PERF_TIME_FORMAT: &str = "%H:%M:%S";

#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    pub event_type: String,
    pub subject: String,
    pub speed: f64,
    pub details: String,
}

impl EventRecord {
    pub fn new(
        event_type: impl Into<String>,
        subject: impl Into<String>,
        speed: f64,
        details: impl Into<String>,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            subject: subject.into(),
            speed,
            details: details.into(),
        }
    }

    fn to_csv_line(&self, timestamp: &str) -> String {
        format!(
            "{},{},{},{:.2},{}\n",
            timestamp,
            sanitize_field(&self.event_type),
            sanitize_field(&self.subject),
            self.speed,
            sanitize_field(&self.details)
        )
    }
}

/// Destination for [`EventRecord`]s. Implementations must be safe to share across workers.
pub trait EventSink: Send + Sync {
    fn record(&self, event: &EventRecord) -> io::Result<()>;

    fn flush(&self) -> io::Result<()> {
        Ok(())
    }
}

pub type SharedEventSink = Arc<dyn EventSink>;

/// Keeps each record on a single CSV row.
fn sanitize_field(raw: &str) -> String {
    raw.chars()
        .map(|c| match c {
            ',' => ';',
            '\r' | '\n' => ' ',
            other => other,
        })
        .collect()
}

/// Longest time an event record may sit in the write buffer.
const EVENT_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

fn lock<T>(file: &Mutex<T>) -> io::Result<MutexGuard<'_, T>> {
    file.lock()
        .map_err(|_| io::Error::other("log file lock poisoned"))
}

#[derive(Debug)]
struct BufferedFile {
    writer: BufWriter<File>,
    last_flush: Instant,
}

/// Event CSV, appended across restarts. The header is written only into an empty file.
///
/// Records are buffered so workers do not issue a write per event. The buffer is written out by
/// the first record arriving a second or more after the previous write-out, by
/// [`EventSink::flush`], and on drop.
#[derive(Debug)]
pub struct EventLog {
    path: PathBuf,
    file: Mutex<BufferedFile>,
}

impl EventLog {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, RsuError> {
        let path = path.as_ref().to_path_buf();
        let sink_error = |source| RsuError::LogSink {
            path: path.clone(),
            source,
        };

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(sink_error)?;
        let len = file.metadata().map_err(sink_error)?.len();
        if len == 0 {
            writeln!(file, "{EVENT_LOG_HEADER}").map_err(sink_error)?;
        }

        Ok(Self {
            path,
            file: Mutex::new(BufferedFile {
                writer: BufWriter::new(file),
                last_flush: Instant::now(),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl EventSink for EventLog {
    fn record(&self, event: &EventRecord) -> io::Result<()> {
        let timestamp = Local::now().format(EVENT_TIME_FORMAT).to_string();
        let line = event.to_csv_line(&timestamp);
        let mut file = lock(&self.file)?;
        file.writer.write_all(line.as_bytes())?;
        if file.last_flush.elapsed() >= EVENT_FLUSH_INTERVAL {
            file.writer.flush()?;
            file.last_flush = Instant::now();
        }
        Ok(())
    }

    fn flush(&self) -> io::Result<()> {
        let mut file = lock(&self.file)?;
        file.writer.flush()?;
        file.last_flush = Instant::now();
        Ok(())
    }
}

/// One row of the performance log. Rates are per second over the last interval.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PerfRow {
    pub cpu_usage: Option<f64>,
    pub in_rate: u64,
    pub bandwidth_mbps: Option<f64>,
    pub decode_rate: u64,
    pub decode_error_rate: u64,
    pub process_rate: u64,
    pub drop_rate: u64,
    pub queue_len: usize,
    pub emergency_rate: u64,
    pub control_rate: u64,
}

impl PerfRow {
    fn to_csv_line(&self, timestamp: &str) -> String {
        format!(
            "{},{},{},{},{},{},{},{},{},{},{}\n",
            timestamp,
            format_optional(self.cpu_usage),
            self.in_rate,
            format_optional(self.bandwidth_mbps),
            self.decode_rate,
            self.decode_error_rate,
            self.process_rate,
            self.drop_rate,
            self.queue_len,
            self.emergency_rate,
            self.control_rate
        )
    }
}

fn format_optional(value: Option<f64>) -> String {
    match value {
        Some(value) => format!("{value:.2}"),
        None => "NA".to_string(),
    }
}

/// Performance CSV, truncated at startup.
#[derive(Debug)]
pub struct PerformanceLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl PerformanceLog {
    pub fn create(path: impl AsRef<Path>) -> Result<Self, RsuError> {
        let path = path.as_ref().to_path_buf();
        let mut file = File::create(&path)
            .and_then(|mut file| writeln!(file, "{PERF_LOG_HEADER}").map(|()| file))
            .map_err(|source| RsuError::LogSink {
                path: path.clone(),
                source,
            })?;
        file.flush().map_err(|source| RsuError::LogSink {
            path: path.clone(),
            source,
        })?;

        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, row: &PerfRow) -> io::Result<()> {
        let timestamp = Local::now().format(PERF_TIME_FORMAT).to_string();
        let line = row.to_csv_line(&timestamp);
        lock(&self.file)?.write_all(line.as_bytes())
    }

    pub fn flush(&self) -> io::Result<()> {
        lock(&self.file)?.flush()
    }
}
