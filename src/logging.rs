use crate::config::AppConfig;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Statement-level chatter from the database and HTTP stacks
const QUIET_DEPENDENCIES: &str = "sqlx=warn,hyper=warn,reqwest=info";

fn rotation(name: &str) -> Rotation {
    match name {
        "minutely" => Rotation::MINUTELY,
        "hourly" => Rotation::HOURLY,
        "daily" => Rotation::DAILY,
        _ => Rotation::NEVER,
    }
}

fn default_directives(config: &AppConfig) -> String {
    format!("{},{}", config.log_level, QUIET_DEPENDENCIES)
}

/// Install the global subscriber. Keep the returned guard alive for the
/// lifetime of the process or buffered file output is lost.
///
/// `RUST_LOG` overrides the configured level. Job logs carry `job_id` as a
/// structured field, so JSON files can be filtered per job.
pub fn init_logging(config: &AppConfig) -> WorkerGuard {
    let appender = RollingFileAppender::new(
        rotation(&config.rotation),
        &config.log_dir,
        &config.log_file,
    );
    let (file_writer, guard) = tracing_appender::non_blocking(appender);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(config)));
    if config.use_json {
        let stdout_layer = fmt::layer().compact().with_target(false);
        let file_layer = fmt::layer()
            .json()
            .with_current_span(false)
            .with_writer(file_writer)
            .with_ansi(false);
        tracing_subscriber::registry()
            .with(filter)
            .with(file_layer)
            .with(stdout_layer)
            .init();
    } else {
        let stdout_layer = fmt::layer().compact().with_target(false);
        let file_layer = fmt::layer()
            .with_target(false)
            .with_writer(file_writer)
            .with_ansi(false);
        tracing_subscriber::registry()
            .with(filter)
            .with(file_layer)
            .with(stdout_layer)
            .init();
    }

    guard
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rotation_names() {
        assert_eq!(rotation("hourly"), Rotation::HOURLY);
        assert_eq!(rotation("daily"), Rotation::DAILY);
        assert_eq!(rotation("never"), Rotation::NEVER);
        assert_eq!(rotation("weekly"), Rotation::NEVER);
    }

    #[test]
    fn test_default_directives_quiet_dependencies() {
        let config = AppConfig::from_yaml(
            r#"
log_level: "debug"
log_dir: "./logs"
log_file: "payflow.log"
use_json: true
rotation: "daily"
destination_ledger: "base"
ledgers:
  - id: "base"
    native_asset: "ETH"
settlement:
  contract_address: "0xsettle"
"#,
        )
        .unwrap();
        let directives = default_directives(&config);
        assert!(directives.starts_with("debug,"));
        assert!(directives.contains("sqlx=warn"));
    }
}
