use std::env;

/// Test database URL, if one is configured. Store-level integration tests
/// are skipped entirely when `TEST_DATABASE_URL` is unset so the suite
/// stays green on machines without Postgres.
pub fn test_database_url() -> Option<String> {
    env::var("TEST_DATABASE_URL").ok()
}
