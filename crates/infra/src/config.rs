//! Process configuration read from the environment.

use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use backlog_core::{ConfigError, JobFilter, QueueConfig, WorkerId};

use crate::workers::WorkerConfig;

/// Connection pool size used when `BACKLOG_POOL_SIZE` is unset.
pub const DEFAULT_POOL_SIZE: u32 = 5;

/// Everything a worker process needs to start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSettings {
    pub database_url: String,
    pub pool_size: u32,
    pub worker: WorkerConfig,
    pub queue: QueueConfig,
}

impl WorkerSettings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from an arbitrary key lookup.
    ///
    /// `DATABASE_URL` is required; everything else falls back to defaults.
    /// Present but unparsable values are errors, not defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let database_url = get("DATABASE_URL").ok_or_else(|| ConfigError::missing("DATABASE_URL"))?;

        let mut worker = WorkerConfig::default();
        if let Some(name) = get("BACKLOG_WORKER_NAME") {
            worker.name = WorkerId::new(name.trim());
        }
        worker.filter = JobFilter {
            min_priority: parse(&get, "BACKLOG_MIN_PRIORITY")?,
            max_priority: parse(&get, "BACKLOG_MAX_PRIORITY")?,
            job_types: get("BACKLOG_JOB_TYPES").and_then(|types| {
                let types: Vec<String> = types
                    .split(',')
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(str::to_string)
                    .collect();
                (!types.is_empty()).then_some(types)
            }),
        };
        if let Some(quiet) = parse_flag(&get, "BACKLOG_QUIET")? {
            worker.quiet = quiet;
        }
        if let Some(secs) = parse::<u64>(&get, "BACKLOG_SLEEP_DELAY_SECS")? {
            worker.sleep_delay = Duration::from_secs(secs);
        }
        if let Some(secs) = parse::<u64>(&get, "BACKLOG_IDLE_AFTER_SECS")? {
            worker.idle_after = Duration::from_secs(secs);
        }

        let mut queue = QueueConfig::default();
        if let Some(secs) = parse::<u64>(&get, "BACKLOG_MAX_RUN_TIME_SECS")? {
            if secs == 0 {
                return Err(ConfigError::invalid("BACKLOG_MAX_RUN_TIME_SECS", "must be positive"));
            }
            queue = queue.with_max_run_time(Duration::from_secs(secs));
        }

        if let Some(max_attempts) = parse::<u32>(&get, "BACKLOG_MAX_ATTEMPTS")? {
            if max_attempts == 0 {
                return Err(ConfigError::invalid("BACKLOG_MAX_ATTEMPTS", "must be positive"));
            }
            queue = queue.with_max_attempts(max_attempts);
        }
        if let Some(destroy) = parse_flag(&get, "BACKLOG_DESTROY_SUCCESSFUL_JOBS")? {
            queue = queue.with_destroy_successful_jobs(destroy);
        }
        if let Some(destroy) = parse_flag(&get, "BACKLOG_DESTROY_FAILED_JOBS")? {
            queue = queue.with_destroy_failed_jobs(destroy);
        }

        let pool_size = parse(&get, "BACKLOG_POOL_SIZE")?.unwrap_or(DEFAULT_POOL_SIZE);
        if pool_size == 0 {
            return Err(ConfigError::invalid("BACKLOG_POOL_SIZE", "must be positive"));
        }

        if let (Some(min), Some(max)) = (worker.filter.min_priority, worker.filter.max_priority) {
            if min > max {
                return Err(ConfigError::invalid(
                    "BACKLOG_MIN_PRIORITY",
                    format!("{min} is above BACKLOG_MAX_PRIORITY {max}"),
                ));
            }
        }

        Ok(Self {
            database_url,
            pool_size,
            worker,
            queue,
        })
    }
}

fn parse<T>(get: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    get(key)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|e| ConfigError::invalid(key, format!("{raw:?}: {e}")))
        })
        .transpose()
}

fn parse_flag(get: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<bool>, ConfigError> {
    get(key)
        .map(|raw| match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            other => Err(ConfigError::invalid(key, format!("{other:?} is not a boolean"))),
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashMap;

    fn settings(pairs: &[(&str, &str)]) -> Result<WorkerSettings, ConfigError> {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        WorkerSettings::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn database_url_is_required() {
        assert_eq!(settings(&[]), Err(ConfigError::missing("DATABASE_URL")));
    }

    #[test]
    fn defaults_apply() {
        let s = settings(&[("DATABASE_URL", "postgres://localhost/jobs")]).unwrap();
        assert_eq!(s.pool_size, DEFAULT_POOL_SIZE);
        assert_eq!(s.queue, QueueConfig::default());
        assert_eq!(s.worker.filter, JobFilter::default());
        assert_eq!(s.worker.sleep_delay, Duration::from_secs(5));
        assert_eq!(s.worker.batch_size, 100);
        assert!(!s.worker.quiet);
        assert!(s.worker.name.as_str().starts_with("host:"));
    }

    #[test]
    fn overrides_are_applied() {
        let s = settings(&[
            ("DATABASE_URL", "postgres://db/jobs"),
            ("BACKLOG_POOL_SIZE", "12"),
            ("BACKLOG_WORKER_NAME", "reports-1"),
            ("BACKLOG_MIN_PRIORITY", "-5"),
            ("BACKLOG_MAX_PRIORITY", "10"),
            ("BACKLOG_JOB_TYPES", "Report, Mail,,"),
            ("BACKLOG_QUIET", "yes"),
            ("BACKLOG_SLEEP_DELAY_SECS", "1"),
            ("BACKLOG_IDLE_AFTER_SECS", "30"),
            ("BACKLOG_MAX_RUN_TIME_SECS", "600"),
            ("BACKLOG_MAX_ATTEMPTS", "3"),
            ("BACKLOG_DESTROY_SUCCESSFUL_JOBS", "false"),
            ("BACKLOG_DESTROY_FAILED_JOBS", "0"),
        ])
        .unwrap();

        assert_eq!(s.pool_size, 12);
        assert_eq!(s.worker.name, WorkerId::new("reports-1"));
        assert_eq!(s.worker.filter.min_priority, Some(-5));
        assert_eq!(s.worker.filter.max_priority, Some(10));
        assert_eq!(
            s.worker.filter.job_types,
            Some(vec!["Report".to_string(), "Mail".to_string()])
        );
        assert!(s.worker.quiet);
        assert_eq!(s.worker.sleep_delay, Duration::from_secs(1));
        assert_eq!(s.worker.idle_after, Duration::from_secs(30));
        assert_eq!(s.queue.max_run_time, Duration::from_secs(600));
        assert_eq!(s.queue.retry.max_attempts, 3);
        assert!(!s.queue.destroy_successful_jobs);
        assert!(!s.queue.destroy_failed_jobs);
    }

    #[test]
    fn garbage_is_rejected() {
        let base = ("DATABASE_URL", "postgres://db/jobs");
        assert!(matches!(
            settings(&[base, ("BACKLOG_MAX_ATTEMPTS", "many")]),
            Err(ConfigError::Invalid { .. })
        ));
        assert!(matches!(
            settings(&[base, ("BACKLOG_QUIET", "maybe")]),
            Err(ConfigError::Invalid { .. })
        ));
        assert!(matches!(
            settings(&[base, ("BACKLOG_MAX_RUN_TIME_SECS", "0")]),
            Err(ConfigError::Invalid { .. })
        ));
        assert!(matches!(
            settings(&[base, ("BACKLOG_MIN_PRIORITY", "5"), ("BACKLOG_MAX_PRIORITY", "1")]),
            Err(ConfigError::Invalid { .. })
        ));
    }
}
