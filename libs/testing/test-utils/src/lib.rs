//! Shared test utilities
//!
//! - `TestRedis`: Redis container with automatic cleanup (feature: "redis")
//! - `TestDataBuilder`: Deterministic identifiers for submissions, runs and users (always available)
//! - `assertions`: Custom assertion helpers (always available)
//!
//! # Features
//!
//! - `redis`: Enables Redis test infrastructure
//! - `all`: Enables all container test infrastructure
//!
//! # Usage
//!
//! Add `features = ["redis"]` to your dev-dependencies:
//!
//! ```toml
//! [dev-dependencies]
//! test-utils = { workspace = true, features = ["redis"] }
//! ```
//!
//! Then in your tests:
//!
//! ```rust,ignore
//! use test_utils::{TestDataBuilder, TestRedis};
//!
//! #[tokio::test]
//! async fn my_redis_test() {
//!     let redis = TestRedis::new().await;
//!     let manager = redis.connection_manager().await;
//!     let builder = TestDataBuilder::from_test_name("my_redis_test");
//!
//!     let key = format!("submission:normal:{}", builder.submission_id());
//! }
//! ```

use uuid::Uuid;

#[cfg(feature = "redis")]
mod redis;

#[cfg(feature = "redis")]
pub use redis::TestRedis;

/// Builder for test data with deterministic randomization
///
/// This ensures tests are reproducible by using seeded identifiers.
pub struct TestDataBuilder {
    seed: u64,
}

impl TestDataBuilder {
    /// Create a new builder with a seed (for deterministic tests)
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    /// Create from test name (generates seed from test name hash)
    ///
    /// # Example
    ///
    /// ```
    /// use test_utils::TestDataBuilder;
    ///
    /// let builder = TestDataBuilder::from_test_name("test_submit_code");
    /// ```
    pub fn from_test_name(name: &str) -> Self {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        Self::new(hasher.finish())
    }

    fn uuid(&self, salt: u8) -> Uuid {
        let bytes = self.seed.to_le_bytes();
        let mut uuid_bytes = [0u8; 16];
        uuid_bytes[..8].copy_from_slice(&bytes);
        uuid_bytes[8..16].copy_from_slice(&bytes);
        uuid_bytes[15] ^= salt;
        Uuid::from_bytes(uuid_bytes)
    }

    /// Deterministic user ID
    pub fn user_id(&self) -> String {
        self.uuid(0x01).to_string()
    }

    /// Deterministic submission ID
    pub fn submission_id(&self) -> String {
        self.uuid(0x02).to_string()
    }

    /// Deterministic temporary ID for run and custom executions
    pub fn temp_id(&self) -> String {
        self.uuid(0x03).to_string()
    }

    /// Deterministic problem ID
    pub fn problem_id(&self) -> String {
        self.uuid(0x04).to_string()
    }

    /// Unique name scoped to this test
    ///
    /// ```
    /// use test_utils::TestDataBuilder;
    ///
    /// let builder = TestDataBuilder::new(7);
    /// assert_eq!(builder.name("topic", "results"), "test-topic-7-results");
    /// ```
    pub fn name(&self, prefix: &str, suffix: &str) -> String {
        format!("test-{}-{}-{}", prefix, self.seed, suffix)
    }
}

/// Test assertion helpers
pub mod assertions {
    /// Assert that an optional value is Some
    pub fn assert_some<T>(value: Option<T>, context: &str) -> T {
        value.unwrap_or_else(|| panic!("{}: expected Some, got None", context))
    }

    /// Assert that `actual` lies in `[low, high]`
    pub fn assert_within(actual: i64, low: i64, high: i64, context: &str) {
        assert!(
            (low..=high).contains(&actual),
            "{}: expected {} in [{}, {}]",
            context,
            actual,
            low,
            high
        );
    }
}
