// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! RSU configuration.
//!
//! Values are layered with figment, lowest priority first:
//!
//! 1. built-in defaults ([`RsuConfig::default`])
//! 2. an optional YAML file: `RSU_CONFIG_FILE`, or `rsu.yaml` in the working directory if present
//! 3. `RSU_*` environment variables, e.g. `RSU_QUEUE_CAPACITY=5000`

use crate::admission::AdmissionPolicy;
use crate::errors::RsuError;
use crate::feedback::FeedbackSettings;
use crate::listener::{ListenerConfig, DEFAULT_MAX_DATAGRAM_SIZE};
use crate::worker::ProcessingSettings;
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::env;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::level_filters::LevelFilter;

pub const ENV_PREFIX: &str = "RSU_";
pub const CONFIG_FILE_ENV: &str = "RSU_CONFIG_FILE";
pub const DEFAULT_CONFIG_FILE: &str = "rsu.yaml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RsuConfig {
    /// Host the telemetry socket binds to
    pub listen_host: String,
    /// Telemetry UDP port, 0 for an ephemeral port
    pub listen_port: u16,
    /// Downstream traffic controller, `ip:port`
    pub control_addr: String,
    pub status_host: String,
    pub status_port: u16,
    pub queue_capacity: usize,
    pub worker_count: usize,
    /// Synthetic per-message workload, 0 disables it
    pub compute_intensity: u32,
    pub load_warn: f64,
    pub load_crit: f64,
    pub warn_drop_probability: f64,
    pub crit_drop_probability: f64,
    pub poi_x: f64,
    pub poi_y: f64,
    pub roi_radius: f64,
    pub day_speed_threshold: f64,
    pub night_speed_threshold: f64,
    pub feedback_interval_ms: u64,
    pub control_spacing_ms: u64,
    pub report_interval_ms: u64,
    /// Upper bound on how long workers may drain the queue at shutdown
    pub drain_timeout_ms: u64,
    pub max_datagram_size: usize,
    /// Count payload bytes for the bandwidth column
    pub count_bytes: bool,
    pub event_log_path: PathBuf,
    pub perf_log_path: PathBuf,
    /// Log level (e.g., trace, debug, info, warn, error, off)
    pub log_level: String,
}

impl Default for RsuConfig {
    fn default() -> Self {
        Self {
            listen_host: "0.0.0.0".to_string(),
            listen_port: 9999,
            control_addr: "127.0.0.1:8888".to_string(),
            status_host: "0.0.0.0".to_string(),
            status_port: 8080,
            queue_capacity: 20_000,
            worker_count: 8,
            compute_intensity: 0,
            load_warn: 0.6,
            load_crit: 0.9,
            warn_drop_probability: 0.5,
            crit_drop_probability: 0.9,
            poi_x: 0.0,
            poi_y: 0.0,
            roi_radius: 1000.0,
            day_speed_threshold: 5.0,
            night_speed_threshold: 15.0,
            feedback_interval_ms: 1_000,
            control_spacing_ms: 100,
            report_interval_ms: 1_000,
            drain_timeout_ms: 2_000,
            max_datagram_size: DEFAULT_MAX_DATAGRAM_SIZE,
            count_bytes: true,
            event_log_path: PathBuf::from("rsu_events.csv"),
            perf_log_path: PathBuf::from("rsu_perf.csv"),
            log_level: "info".to_string(),
        }
    }
}

impl RsuConfig {
    /// Loads defaults, then `config_file` if given, then `RSU_*` environment variables.
    pub fn load(config_file: Option<&Path>) -> Result<Self, RsuError> {
        let mut figment = Figment::from(Serialized::defaults(RsuConfig::default()));
        if let Some(path) = config_file {
            if !path.is_file() {
                return Err(RsuError::ConfigLoad(format!(
                    "config file {} not found",
                    path.display()
                )));
            }
            figment = figment.merge(Yaml::file(path));
        }
        figment = figment.merge(Env::prefixed(ENV_PREFIX).ignore(&["CONFIG_FILE"]));

        let config: RsuConfig = figment
            .extract()
            .map_err(|e| RsuError::ConfigLoad(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Resolves the config file from `RSU_CONFIG_FILE` or the default location, then loads.
    pub fn from_env() -> Result<Self, RsuError> {
        let config_file = match env::var_os(CONFIG_FILE_ENV) {
            Some(path) => Some(PathBuf::from(path)),
            None => {
                let default = PathBuf::from(DEFAULT_CONFIG_FILE);
                default.is_file().then_some(default)
            }
        };
        Self::load(config_file.as_deref())
    }

    pub fn validate(&self) -> Result<(), RsuError> {
        let invalid = |msg: String| Err(RsuError::InvalidConfig(msg));

        if self.queue_capacity == 0 {
            return invalid("queue_capacity must be greater than 0".to_string());
        }
        if self.worker_count == 0 {
            return invalid("worker_count must be greater than 0".to_string());
        }
        if self.max_datagram_size == 0 || self.max_datagram_size > DEFAULT_MAX_DATAGRAM_SIZE {
            return invalid(format!(
                "max_datagram_size must be in 1..={DEFAULT_MAX_DATAGRAM_SIZE}, got {}",
                self.max_datagram_size
            ));
        }
        for (name, value) in [("load_warn", self.load_warn), ("load_crit", self.load_crit)] {
            if !(value > 0.0 && value <= 1.0) {
                return invalid(format!("{name} must be in (0, 1], got {value}"));
            }
        }
        if self.load_warn >= self.load_crit {
            return invalid(format!(
                "load_warn ({}) must be lower than load_crit ({})",
                self.load_warn, self.load_crit
            ));
        }
        for (name, value) in [
            ("warn_drop_probability", self.warn_drop_probability),
            ("crit_drop_probability", self.crit_drop_probability),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return invalid(format!("{name} must be in [0, 1], got {value}"));
            }
        }
        if !(self.roi_radius > 0.0 && self.roi_radius.is_finite()) {
            return invalid(format!("roi_radius must be positive, got {}", self.roi_radius));
        }
        if !(self.poi_x.is_finite() && self.poi_y.is_finite()) {
            return invalid("poi_x and poi_y must be finite".to_string());
        }
        for (name, value) in [
            ("day_speed_threshold", self.day_speed_threshold),
            ("night_speed_threshold", self.night_speed_threshold),
        ] {
            if !(value >= 0.0 && value.is_finite()) {
                return invalid(format!("{name} must be non-negative, got {value}"));
            }
        }
        for (name, value) in [
            ("feedback_interval_ms", self.feedback_interval_ms),
            ("report_interval_ms", self.report_interval_ms),
            ("drain_timeout_ms", self.drain_timeout_ms),
        ] {
            if value == 0 {
                return invalid(format!("{name} must be greater than 0"));
            }
        }
        if self.log_level.trim().parse::<LevelFilter>().is_err() {
            return invalid(format!("unknown log_level {:?}", self.log_level));
        }
        let control = self.control_socket_addr()?;
        if control.port() == 0 {
            return invalid("control_addr port must be greater than 0".to_string());
        }
        Ok(())
    }

    pub fn control_socket_addr(&self) -> Result<SocketAddr, RsuError> {
        self.control_addr.trim().parse().map_err(|_| {
            RsuError::InvalidConfig(format!(
                "control_addr {:?} is not a valid ip:port address",
                self.control_addr
            ))
        })
    }

    pub fn listener_config(&self) -> ListenerConfig {
        ListenerConfig {
            host: self.listen_host.clone(),
            port: self.listen_port,
            max_datagram_size: self.max_datagram_size,
            count_bytes: self.count_bytes,
        }
    }

    pub fn admission_policy(&self) -> AdmissionPolicy {
        AdmissionPolicy {
            load_warn: self.load_warn,
            load_crit: self.load_crit,
            warn_drop_probability: self.warn_drop_probability,
            crit_drop_probability: self.crit_drop_probability,
        }
    }

    pub fn processing_settings(&self) -> ProcessingSettings {
        ProcessingSettings {
            compute_intensity: self.compute_intensity,
            poi_x: self.poi_x,
            poi_y: self.poi_y,
            roi_radius: self.roi_radius,
            day_speed_threshold: self.day_speed_threshold,
            night_speed_threshold: self.night_speed_threshold,
        }
    }

    pub fn feedback_settings(&self) -> FeedbackSettings {
        FeedbackSettings {
            interval: Duration::from_millis(self.feedback_interval_ms),
            control_spacing: Duration::from_millis(self.control_spacing_ms),
        }
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_millis(self.report_interval_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = RsuConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.listen_port, 9999);
        assert_eq!(config.queue_capacity, 20_000);
        assert_eq!(config.worker_count, 8);
        assert_eq!(
            config.control_socket_addr().unwrap(),
            "127.0.0.1:8888".parse().unwrap()
        );
    }

    #[test]
    fn test_load_defaults_without_file_or_env() {
        figment::Jail::expect_with(|jail| {
            jail.clear_env();
            let config = RsuConfig::load(None).unwrap();
            assert_eq!(config, RsuConfig::default());
            Ok(())
        });
    }

    #[test]
    fn test_yaml_file_overrides_defaults() {
        figment::Jail::expect_with(|jail| {
            jail.clear_env();
            jail.create_file(
                "rsu.yaml",
                r#"
listen_port: 10999
queue_capacity: 500
roi_radius: 250.5
night_speed_threshold: 20
event_log_path: /var/log/rsu/events.csv
"#,
            )?;
            let config = RsuConfig::load(Some(Path::new("rsu.yaml"))).unwrap();
            assert_eq!(config.listen_port, 10999);
            assert_eq!(config.queue_capacity, 500);
            assert_eq!(config.roi_radius, 250.5);
            assert_eq!(config.night_speed_threshold, 20.0);
            assert_eq!(
                config.event_log_path,
                PathBuf::from("/var/log/rsu/events.csv")
            );
            assert_eq!(config.worker_count, 8);
            Ok(())
        });
    }

    #[test]
    fn test_env_overrides_yaml() {
        figment::Jail::expect_with(|jail| {
            jail.clear_env();
            jail.create_file("rsu.yaml", "worker_count: 2\nlog_level: warn\n")?;
            jail.set_env("RSU_WORKER_COUNT", "16");
            jail.set_env("RSU_CONTROL_ADDR", "10.0.0.5:8888");
            jail.set_env("RSU_COUNT_BYTES", "false");
            jail.set_env("RSU_LOAD_WARN", "0.5");

            let config = RsuConfig::load(Some(Path::new("rsu.yaml"))).unwrap();
            assert_eq!(config.worker_count, 16);
            assert_eq!(config.log_level, "warn");
            assert_eq!(config.control_addr, "10.0.0.5:8888");
            assert!(!config.count_bytes);
            assert_eq!(config.load_warn, 0.5);
            Ok(())
        });
    }

    #[test]
    fn test_from_env_uses_config_file_variable() {
        figment::Jail::expect_with(|jail| {
            jail.clear_env();
            jail.create_file("custom.yaml", "status_port: 18080\n")?;
            jail.set_env("RSU_CONFIG_FILE", "custom.yaml");
            let config = RsuConfig::from_env().unwrap();
            assert_eq!(config.status_port, 18080);
            Ok(())
        });
    }

    #[test]
    fn test_from_env_picks_up_default_file() {
        figment::Jail::expect_with(|jail| {
            jail.clear_env();
            jail.create_file(DEFAULT_CONFIG_FILE, "compute_intensity: 200000\n")?;
            let config = RsuConfig::from_env().unwrap();
            assert_eq!(config.compute_intensity, 200_000);
            Ok(())
        });
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        figment::Jail::expect_with(|jail| {
            jail.clear_env();
            jail.set_env("RSU_CONFIG_FILE", "nope.yaml");
            let error = RsuConfig::from_env().unwrap_err();
            assert!(matches!(error, RsuError::ConfigLoad(_)));
            Ok(())
        });
    }

    #[test]
    fn test_malformed_value_is_a_load_error() {
        figment::Jail::expect_with(|jail| {
            jail.clear_env();
            jail.set_env("RSU_QUEUE_CAPACITY", "lots");
            let error = RsuConfig::load(None).unwrap_err();
            assert!(matches!(error, RsuError::ConfigLoad(_)));
            Ok(())
        });
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let cases: Vec<(&str, Box<dyn Fn(&mut RsuConfig)>)> = vec![
            ("queue_capacity", Box::new(|c: &mut RsuConfig| c.queue_capacity = 0)),
            ("worker_count", Box::new(|c: &mut RsuConfig| c.worker_count = 0)),
            ("max_datagram_size", Box::new(|c: &mut RsuConfig| c.max_datagram_size = 0)),
            ("max_datagram_size", Box::new(|c: &mut RsuConfig| c.max_datagram_size = 65_536)),
            ("max_datagram_size", Box::new(|c: &mut RsuConfig| c.max_datagram_size = usize::MAX)),
            ("load_crit", Box::new(|c: &mut RsuConfig| c.load_crit = 1.5)),
            ("load_warn", Box::new(|c: &mut RsuConfig| c.load_warn = 0.0)),
            ("lower than", Box::new(|c: &mut RsuConfig| c.load_warn = 0.95)),
            ("warn_drop_probability", Box::new(|c: &mut RsuConfig| c.warn_drop_probability = -0.1)),
            ("crit_drop_probability", Box::new(|c: &mut RsuConfig| c.crit_drop_probability = 1.1)),
            ("roi_radius", Box::new(|c: &mut RsuConfig| c.roi_radius = 0.0)),
            ("night_speed_threshold", Box::new(|c: &mut RsuConfig| c.night_speed_threshold = -1.0)),
            ("feedback_interval_ms", Box::new(|c: &mut RsuConfig| c.feedback_interval_ms = 0)),
            ("report_interval_ms", Box::new(|c: &mut RsuConfig| c.report_interval_ms = 0)),
            ("log_level", Box::new(|c: &mut RsuConfig| c.log_level = "verbose".to_string())),
            ("control_addr", Box::new(|c: &mut RsuConfig| c.control_addr = "controller:8888".to_string())),
            ("control_addr port", Box::new(|c: &mut RsuConfig| c.control_addr = "127.0.0.1:0".to_string())),
        ];

        for (expected, mutate) in cases {
            let mut config = RsuConfig::default();
            mutate(&mut config);
            let error = config.validate().unwrap_err();
            assert!(
                error.to_string().contains(expected),
                "expected {expected:?} in {error}"
            );
        }
    }

    #[test]
    fn test_oversized_datagram_limit_from_env_is_rejected() {
        figment::Jail::expect_with(|jail| {
            jail.clear_env();
            jail.set_env("RSU_MAX_DATAGRAM_SIZE", "18446744073709551615");
            let error = RsuConfig::load(None).unwrap_err();
            assert!(matches!(error, RsuError::InvalidConfig(_)));
            assert!(error.to_string().contains("max_datagram_size"));
            Ok(())
        });
    }

    #[test]
    fn test_ephemeral_ports_are_allowed() {
        let config = RsuConfig {
            listen_port: 0,
            status_port: 0,
            ..RsuConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_derived_settings() {
        let config = RsuConfig {
            feedback_interval_ms: 250,
            control_spacing_ms: 10,
            load_warn: 0.5,
            ..RsuConfig::default()
        };
        assert_eq!(
            config.feedback_settings().interval,
            Duration::from_millis(250)
        );
        assert_eq!(
            config.feedback_settings().control_spacing,
            Duration::from_millis(10)
        );
        assert_eq!(config.admission_policy().load_warn, 0.5);
        assert_eq!(config.processing_settings().roi_radius, 1000.0);
        assert_eq!(config.listener_config().port, 9999);
        assert_eq!(config.drain_timeout(), Duration::from_secs(2));
    }
}
