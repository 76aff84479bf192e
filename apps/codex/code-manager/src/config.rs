use core_config::{env_or_default, env_parse_or, env_required, ConfigError, FromEnv};
use kafka_worker::TopicSpec;
use std::time::Duration;

/// Topic names used by the service
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TopicNames {
    pub submission_jobs: String,
    pub run_jobs: String,
    pub custom_jobs: String,
    pub submission_results: String,
    pub run_results: String,
    pub custom_results: String,
}

impl Default for TopicNames {
    fn default() -> Self {
        Self {
            submission_jobs: "submission.jobs".to_string(),
            run_jobs: "run.jobs".to_string(),
            custom_jobs: "custom.jobs".to_string(),
            submission_results: "submission.results".to_string(),
            run_results: "run.results".to_string(),
            custom_results: "custom.results".to_string(),
        }
    }
}

impl TopicNames {
    /// Job topics followed by result topics
    pub fn all(&self) -> [&str; 6] {
        [
            &self.submission_jobs,
            &self.run_jobs,
            &self.custom_jobs,
            &self.submission_results,
            &self.run_results,
            &self.custom_results,
        ]
    }
}

impl FromEnv for TopicNames {
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            submission_jobs: env_or_default("SUBMISSION_JOBS_TOPIC", &defaults.submission_jobs),
            run_jobs: env_or_default("RUN_JOBS_TOPIC", &defaults.run_jobs),
            custom_jobs: env_or_default("CUSTOM_JOBS_TOPIC", &defaults.custom_jobs),
            submission_results: env_or_default(
                "SUBMISSION_RESULTS_TOPIC",
                &defaults.submission_results,
            ),
            run_results: env_or_default("RUN_RESULTS_TOPIC", &defaults.run_results),
            custom_results: env_or_default("CUSTOM_RESULTS_TOPIC", &defaults.custom_results),
        })
    }
}

/// Code manager settings
#[derive(Clone, Debug)]
pub struct ServiceConfig {
    pub http_port: u16,
    pub metrics_port: u16,
    pub submission_result_ttl: Duration,
    pub run_result_ttl: Duration,
    pub problem_details_ttl: Duration,
    pub idempotency_ttl: Duration,
    pub problem_service_url: String,
    pub problem_service_timeout: Duration,
    pub topic_partitions: i32,
    pub topic_replication_factor: i32,
    pub topics: TopicNames,
}

impl ServiceConfig {
    /// Settings pointing at `problem_service_url`, everything else at its default
    pub fn new(problem_service_url: impl Into<String>) -> Self {
        Self {
            http_port: 8080,
            metrics_port: 9102,
            submission_result_ttl: Duration::from_secs(300),
            run_result_ttl: Duration::from_secs(300),
            problem_details_ttl: Duration::from_secs(3600),
            idempotency_ttl: Duration::from_secs(86_400),
            problem_service_url: problem_service_url.into(),
            problem_service_timeout: Duration::from_millis(5000),
            topic_partitions: 1,
            topic_replication_factor: 1,
            topics: TopicNames::default(),
        }
    }

    /// Job and result topics plus `dlq_topic`, with the configured layout
    pub fn topic_specs(&self, dlq_topic: &str) -> Vec<TopicSpec> {
        self.topics
            .all()
            .into_iter()
            .chain(std::iter::once(dlq_topic))
            .map(|name| TopicSpec::new(name, self.topic_partitions, self.topic_replication_factor))
            .collect()
    }
}

impl FromEnv for ServiceConfig {
    /// Requires PROBLEM_SERVICE_URL; every other value has a default
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            http_port: env_parse_or("HTTP_PORT", 8080)?,
            metrics_port: env_parse_or("METRICS_PORT", 9102)?,
            submission_result_ttl: Duration::from_secs(env_parse_or(
                "SUBMISSION_DETAILS_CACHE_EXPIRY",
                300,
            )?),
            run_result_ttl: Duration::from_secs(env_parse_or("RUN_CODE_DETAILS_CACHE_EXPIRY", 300)?),
            problem_details_ttl: Duration::from_secs(env_parse_or(
                "PROBLEM_DETAILS_CACHE_EXPIRY",
                3600,
            )?),
            idempotency_ttl: Duration::from_secs(env_parse_or(
                "KAFKA_IDEMPOTENCY_KEY_EXPIRY",
                86_400,
            )?),
            problem_service_url: env_required("PROBLEM_SERVICE_URL")?,
            problem_service_timeout: Duration::from_millis(env_parse_or(
                "PROBLEM_SERVICE_TIMEOUT_MS",
                5000,
            )?),
            topic_partitions: env_parse_or("TOPIC_PARTITIONS", 1)?,
            topic_replication_factor: env_parse_or("TOPIC_REPLICATION_FACTOR", 1)?,
            topics: TopicNames::from_env()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_with_required_url() {
        temp_env::with_vars(
            [
                ("PROBLEM_SERVICE_URL", Some("http://problems:3000")),
                ("HTTP_PORT", None),
                ("KAFKA_IDEMPOTENCY_KEY_EXPIRY", None),
                ("RUN_JOBS_TOPIC", None),
            ],
            || {
                let config = ServiceConfig::from_env().unwrap();
                assert_eq!(config.http_port, 8080);
                assert_eq!(config.metrics_port, 9102);
                assert_eq!(config.idempotency_ttl, Duration::from_secs(86_400));
                assert_eq!(config.problem_details_ttl, Duration::from_secs(3600));
                assert_eq!(config.topics.run_jobs, "run.jobs");
            },
        );
    }

    #[test]
    fn test_missing_problem_service_url() {
        temp_env::with_var_unset("PROBLEM_SERVICE_URL", || {
            let err = ServiceConfig::from_env().unwrap_err();
            assert!(matches!(err, ConfigError::MissingEnvVar(ref key) if key == "PROBLEM_SERVICE_URL"));
        });
    }

    #[test]
    fn test_invalid_number_fails() {
        temp_env::with_vars(
            [
                ("PROBLEM_SERVICE_URL", Some("http://problems:3000")),
                ("SUBMISSION_DETAILS_CACHE_EXPIRY", Some("five minutes")),
            ],
            || {
                let err = ServiceConfig::from_env().unwrap_err();
                assert!(err.to_string().contains("SUBMISSION_DETAILS_CACHE_EXPIRY"));
            },
        );
    }

    #[test]
    fn test_topic_override() {
        temp_env::with_vars(
            [
                ("PROBLEM_SERVICE_URL", Some("http://problems:3000")),
                ("SUBMISSION_JOBS_TOPIC", Some("staging.submission.jobs")),
            ],
            || {
                let config = ServiceConfig::from_env().unwrap();
                assert_eq!(config.topics.submission_jobs, "staging.submission.jobs");
                assert_eq!(config.topics.submission_results, "submission.results");
            },
        );
    }

    #[test]
    fn test_topic_specs_include_dlq() {
        let mut config = ServiceConfig::new("http://problems:3000");
        config.topic_partitions = 3;

        let specs = config.topic_specs("dlq-queue");

        assert_eq!(specs.len(), 7);
        assert_eq!(specs[0].name, "submission.jobs");
        assert_eq!(specs[6].name, "dlq-queue");
        assert!(specs.iter().all(|s| s.partitions == 3 && s.replication_factor == 1));
    }
}
