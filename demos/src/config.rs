//! TOML configuration for the demo host binary.
//!
//! Typed structs deserialized with `toml::from_str`, every optional knob
//! carrying a `serde(default = "...")` function rather than a bare
//! `Default` derive, so the defaults stay documented at their definition
//! site.

use std::collections::HashMap;

use anyhow::{Context, Result};
use chrono_tz::Tz;
use serde::Deserialize;

use taskkit_core::{BoxedRecurrence, DailyAt, FixedInterval, ScheduleEntry, DEFAULT_TASK_TTL_SECS};

pub fn default_db_path() -> String {
    "./taskkit-demo.sqlite3".to_string()
}

pub fn default_timezone() -> String {
    "UTC".to_string()
}

pub fn default_lease_duration_secs() -> u64 {
    30
}

pub fn default_lease_max_secs() -> u64 {
    3600
}

pub fn default_housekeeping_interval_secs() -> u64 {
    30
}

pub fn default_result_retention_secs() -> u64 {
    3600
}

pub fn default_thread_count() -> usize {
    1
}

pub fn default_task_ttl() -> u64 {
    DEFAULT_TASK_TTL_SECS
}

pub fn default_busy_timeout_ms() -> u64 {
    5_000
}

#[derive(Debug, Deserialize)]
pub struct DemoConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    #[serde(default = "default_lease_duration_secs")]
    pub lease_duration_secs: u64,
    #[serde(default = "default_lease_max_secs")]
    pub lease_max_secs: u64,
    #[serde(default = "default_housekeeping_interval_secs")]
    pub housekeeping_interval_secs: u64,
    #[serde(default = "default_result_retention_secs")]
    pub result_retention_secs: u64,
    #[serde(default)]
    pub groups: Vec<GroupConfig>,
    #[serde(default)]
    pub schedule: Vec<ScheduleEntryConfig>,
}

impl DemoConfig {
    pub fn load(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: DemoConfig = toml::from_str(&content)
            .with_context(|| format!("failed to parse {} as demo config TOML", path.display()))?;
        Ok(config)
    }

    pub fn tz(&self) -> Result<Tz> {
        self.timezone
            .parse()
            .map_err(|_| anyhow::anyhow!("unrecognized timezone {:?}", self.timezone))
    }

    /// `group name -> thread_count`, after applying any `--threads-per-group`
    /// overrides collected from the command line.
    pub fn threads_per_group(&self, overrides: &HashMap<String, usize>) -> HashMap<String, usize> {
        let mut threads: HashMap<String, usize> = self
            .groups
            .iter()
            .map(|g| (g.name.clone(), g.thread_count))
            .collect();
        for (group, count) in overrides {
            threads.insert(group.clone(), *count);
        }
        threads
    }

    pub fn schedule_entries(&self) -> Result<Vec<ScheduleEntry>> {
        self.schedule.iter().map(ScheduleEntryConfig::build).collect()
    }
}

#[derive(Debug, Deserialize)]
pub struct GroupConfig {
    pub name: String,
    #[serde(default = "default_thread_count")]
    pub thread_count: usize,
}

#[derive(Debug, Deserialize)]
pub struct ScheduleEntryConfig {
    pub key: String,
    pub group: String,
    pub name: String,
    /// Raw JSON payload materialized tasks carry; encoded through
    /// `JsonEncoder` the same way the example handlers decode it.
    #[serde(default = "default_schedule_data")]
    pub data: serde_json::Value,
    #[serde(default = "default_task_ttl")]
    pub ttl: u64,
    #[serde(default)]
    pub fire_all_missed: bool,
    pub recurrence: RecurrenceConfig,
}

fn default_schedule_data() -> serde_json::Value {
    serde_json::Value::Null
}

impl ScheduleEntryConfig {
    fn build(&self) -> Result<ScheduleEntry> {
        let data = serde_json::to_vec(&self.data)
            .with_context(|| format!("schedule entry {:?} has non-serializable data", self.key))?;
        let recurrence: BoxedRecurrence = self.recurrence.build()?;
        Ok(
            ScheduleEntry::new(&self.key, &self.group, &self.name, data, self.ttl, recurrence)
                .fire_all_missed(self.fire_all_missed),
        )
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecurrenceConfig {
    FixedInterval {
        period_secs: u64,
    },
    DailyAt {
        hour: u32,
        minute: u32,
        #[serde(default)]
        second: u32,
        #[serde(default)]
        weekdays: Option<Vec<String>>,
    },
}

impl RecurrenceConfig {
    fn build(&self) -> Result<BoxedRecurrence> {
        match self {
            RecurrenceConfig::FixedInterval { period_secs } => {
                Ok(Box::new(FixedInterval { period_secs: *period_secs }))
            }
            RecurrenceConfig::DailyAt { hour, minute, second, weekdays } => {
                let weekdays = match weekdays {
                    None => None,
                    Some(names) => Some(
                        names
                            .iter()
                            .map(|name| {
                                name.parse::<chrono::Weekday>()
                                    .map_err(|_| anyhow::anyhow!("unrecognized weekday {:?}", name))
                            })
                            .collect::<Result<Vec<_>>>()?,
                    ),
                };
                Ok(Box::new(DailyAt {
                    hour: *hour,
                    minute: *minute,
                    second: *second,
                    weekdays,
                }))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_minimal_config() {
        let toml = r#"
            [[groups]]
            name = "math"
            thread_count = 2

            [[schedule]]
            key = "heartbeat"
            group = "math"
            name = "add"
            ttl = 60

            [schedule.recurrence]
            kind = "fixed_interval"
            period_secs = 30
        "#;
        let config: DemoConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.db_path, default_db_path());
        assert_eq!(config.groups.len(), 1);
        let entries = config.schedule_entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].group, "math");
    }

    #[test]
    fn threads_per_group_applies_overrides() {
        let config = DemoConfig {
            db_path: default_db_path(),
            timezone: default_timezone(),
            busy_timeout_ms: default_busy_timeout_ms(),
            lease_duration_secs: default_lease_duration_secs(),
            lease_max_secs: default_lease_max_secs(),
            housekeeping_interval_secs: default_housekeeping_interval_secs(),
            result_retention_secs: default_result_retention_secs(),
            groups: vec![GroupConfig { name: "math".into(), thread_count: 1 }],
            schedule: Vec::new(),
        };
        let mut overrides = HashMap::new();
        overrides.insert("math".to_string(), 4);
        overrides.insert("other".to_string(), 2);
        let threads = config.threads_per_group(&overrides);
        assert_eq!(threads.get("math"), Some(&4));
        assert_eq!(threads.get("other"), Some(&2));
    }
}
