use anyhow::{bail, Context, Result};
use chrono::NaiveTime;

/// Application configuration loaded from environment variables (and a `.env`
/// file if present). Defaults match a local development setup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Postgres connection string. Must not carry a TimeZone option; the
    /// archiver always operates in UTC.
    pub db: String,
    pub log_level: String,
    /// Error-sink DSN, handed to the external error reporter when set.
    pub sentry_dsn: Option<String>,

    pub s3_endpoint: String,
    pub s3_region: String,
    pub s3_bucket: String,
    pub s3_disable_ssl: bool,
    pub s3_force_path_style: bool,

    pub aws_access_key_id: String,
    pub aws_secret_access_key: String,

    /// Directory scratch archive files are written to.
    pub temp_dir: String,
    /// Keep scratch files on disk after upload.
    pub keep_files: bool,
    pub upload_to_s3: bool,

    pub archive_messages: bool,
    pub archive_runs: bool,
    /// Days a record stays live before it becomes archivable.
    pub retention_period: i64,
    /// Purge source rows after an archive is catalogued.
    pub delete: bool,
    pub exit_on_completion: bool,
    /// Daily sweep start time, `HH:MM` UTC.
    pub start_time: String,

    /// Whole-org rollup pass timeout, in hours.
    pub rollup_org_timeout: i64,
    /// Single rollup build timeout, in hours.
    pub build_rollup_archive_timeout: i64,

    pub max_concurrent_archivation: usize,
}

impl Config {
    pub fn from_env() -> Result<Config> {
        dotenvy::dotenv().ok(); // load .env if present; ignore if missing

        let config = Config {
            db: env_or("ARCHIVER_DB", "postgres://localhost/archiver_test?sslmode=disable"),
            log_level: env_or("ARCHIVER_LOG_LEVEL", "info"),
            sentry_dsn: std::env::var("ARCHIVER_SENTRY_DSN").ok().filter(|v| !v.is_empty()),

            s3_endpoint: env_or("ARCHIVER_S3_ENDPOINT", "https://s3.amazonaws.com"),
            s3_region: env_or("ARCHIVER_S3_REGION", "us-east-1"),
            s3_bucket: env_or("ARCHIVER_S3_BUCKET", "archiver-test"),
            s3_disable_ssl: env_bool("ARCHIVER_S3_DISABLE_SSL", false)?,
            s3_force_path_style: env_bool("ARCHIVER_S3_FORCE_PATH_STYLE", false)?,

            aws_access_key_id: env_or("AWS_ACCESS_KEY_ID", "missing_aws_access_key_id"),
            aws_secret_access_key: env_or("AWS_SECRET_ACCESS_KEY", "missing_aws_secret_access_key"),

            temp_dir: env_or("ARCHIVER_TEMP_DIR", "/tmp"),
            keep_files: env_bool("ARCHIVER_KEEP_FILES", false)?,
            upload_to_s3: env_bool("ARCHIVER_UPLOAD_TO_S3", true)?,

            archive_messages: env_bool("ARCHIVER_ARCHIVE_MESSAGES", true)?,
            archive_runs: env_bool("ARCHIVER_ARCHIVE_RUNS", true)?,
            retention_period: env_int("ARCHIVER_RETENTION_PERIOD", 90)?,
            delete: env_bool("ARCHIVER_DELETE", false)?,
            exit_on_completion: env_bool("ARCHIVER_EXIT_ON_COMPLETION", false)?,
            start_time: env_or("ARCHIVER_START_TIME", "00:01"),

            rollup_org_timeout: env_int("ARCHIVER_ROLLUP_ORG_TIMEOUT", 3)?,
            build_rollup_archive_timeout: env_int("ARCHIVER_BUILD_ROLLUP_ARCHIVE_TIMEOUT", 1)?,

            max_concurrent_archivation: env_int("ARCHIVER_MAX_CONCURRENT_ARCHIVATION", 2)? as usize,
        };

        config.validate()?;
        Ok(config)
    }

    /// Startup validation; any failure here is fatal.
    pub fn validate(&self) -> Result<()> {
        self.sweep_start_time()?;

        if self.db.contains("TimeZone") {
            bail!("invalid db connection string, do not specify a timezone, archiver always uses UTC");
        }
        if self.delete && !self.upload_to_s3 {
            bail!("refusing to delete source records without uploading archives to S3");
        }
        if self.keep_files && !self.upload_to_s3 {
            bail!("keeping local files while not uploading to S3 would archive nothing");
        }
        if self.max_concurrent_archivation == 0 {
            bail!("max concurrent archivation must be at least 1");
        }
        Ok(())
    }

    /// The configured daily sweep start, parsed from `HH:MM`.
    pub fn sweep_start_time(&self) -> Result<NaiveTime> {
        NaiveTime::parse_from_str(&self.start_time, "%H:%M")
            .with_context(|| format!("invalid start time '{}', format: HH:MM", self.start_time))
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_bool(key: &str, default: bool) -> Result<bool> {
    match std::env::var(key) {
        Ok(v) => v
            .parse::<bool>()
            .with_context(|| format!("'{key}' must be true or false, got '{v}'")),
        Err(_) => Ok(default),
    }
}

fn env_int(key: &str, default: i64) -> Result<i64> {
    match std::env::var(key) {
        Ok(v) => v
            .parse::<i64>()
            .with_context(|| format!("'{key}' must be an integer, got '{v}'")),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_config() -> Config {
        Config {
            db: "postgres://localhost/archiver_test?sslmode=disable".to_string(),
            log_level: "info".to_string(),
            sentry_dsn: None,
            s3_endpoint: "https://s3.amazonaws.com".to_string(),
            s3_region: "us-east-1".to_string(),
            s3_bucket: "archiver-test".to_string(),
            s3_disable_ssl: false,
            s3_force_path_style: false,
            aws_access_key_id: "key".to_string(),
            aws_secret_access_key: "secret".to_string(),
            temp_dir: "/tmp".to_string(),
            keep_files: false,
            upload_to_s3: true,
            archive_messages: true,
            archive_runs: true,
            retention_period: 90,
            delete: false,
            exit_on_completion: false,
            start_time: "00:01".to_string(),
            rollup_org_timeout: 3,
            build_rollup_archive_timeout: 1,
            max_concurrent_archivation: 2,
        }
    }

    #[test]
    fn test_defaults_are_valid() {
        assert!(make_config().validate().is_ok());
    }

    #[test]
    fn test_start_time_must_be_hh_mm() {
        let mut config = make_config();
        config.start_time = "24:61".to_string();
        assert!(config.validate().is_err());

        config.start_time = "midnight".to_string();
        assert!(config.validate().is_err());

        config.start_time = "23:59".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_delete_requires_upload() {
        let mut config = make_config();
        config.delete = true;
        config.upload_to_s3 = false;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_db_url_may_not_pin_timezone() {
        let mut config = make_config();
        config.db = "postgres://localhost/archiver?TimeZone=America/New_York".to_string();
        assert!(config.validate().is_err());
    }
}
