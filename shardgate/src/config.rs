use proxy::config::Config as ProxyConfig;
use proxy::config::ValidationError;
use serde::Deserialize;
use std::fs::File;

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct MetricsConfig {
    pub statsd_host: String,
    pub statsd_port: u16,
    #[serde(default = "default_prefix")]
    pub prefix: String,
}

fn default_prefix() -> String {
    "shardgate".into()
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// Filter directive, e.g. `info` or `proxy=debug,info`. `RUST_LOG` wins when set.
    #[serde(default = "default_level")]
    pub level: String,
    pub sentry_dsn: Option<String>,
}

fn default_level() -> String {
    "info".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_level(),
            sentry_dsn: None,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct CommonConfig {
    pub metrics: Option<MetricsConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    #[serde(flatten)]
    pub common: CommonConfig,
    pub proxy: ProxyConfig,
}

impl Config {
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let file = File::open(path)?;
        let config: Config = serde_yaml::from_reader(file)?;
        config.proxy.validate()?;

        Ok(config)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("could not load config from file: {0}")]
    LoadError(#[from] std::io::Error),
    #[error("could not parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    ValidationError(#[from] ValidationError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_tmp_file(s: &str) -> tempfile::NamedTempFile {
        let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
        write!(tmp, "{}", s).expect("write yaml");

        tmp
    }

    #[test]
    fn full_config() {
        let yaml = r#"
            metrics:
                statsd_host: 127.0.0.1
                statsd_port: 8125
            logging:
                level: debug
                sentry_dsn: https://key@sentry.example.com/1
            proxy:
                listener:
                    host: 0.0.0.0
                    port: 9799
                shards:
                    - id: shard-a
                      url: http://10.0.0.1:9993
                directory:
                    store:
                        type: memory
                        assignments:
                            - realm: zulip
                              shard: shard-a
            "#;
        let tmp = write_tmp_file(yaml);
        let config = Config::from_file(tmp.path()).expect("load config");

        let metrics = config.common.metrics.expect("metrics config");
        assert_eq!(metrics.statsd_port, 8125);
        assert_eq!(metrics.prefix, "shardgate");
        assert_eq!(config.common.logging.level, "debug");
        assert!(config.common.logging.sentry_dsn.is_some());
        assert_eq!(config.proxy.listener.port, 9799);
        assert_eq!(config.proxy.shards[0].id, "shard-a");
    }

    #[test]
    fn common_sections_are_optional() {
        let yaml = r#"
            proxy:
                shards:
                    - id: shard-a
                      url: http://10.0.0.1:9993
                directory:
                    store:
                        type: memory
                        assignments: []
            "#;
        let tmp = write_tmp_file(yaml);
        let config = Config::from_file(tmp.path()).expect("load config");
        assert!(config.common.metrics.is_none());
        assert_eq!(config.common.logging, LoggingConfig::default());
    }

    #[test]
    fn invalid_config_is_rejected() {
        let yaml = r#"
            proxy:
                shards: []
                directory:
                    store:
                        type: memory
                        assignments: []
            "#;
        let tmp = write_tmp_file(yaml);
        assert!(matches!(
            Config::from_file(tmp.path()),
            Err(ConfigError::ValidationError(ValidationError::NoShards))
        ));

        let tmp = write_tmp_file("proxy: [");
        assert!(matches!(
            Config::from_file(tmp.path()),
            Err(ConfigError::ParseError(_))
        ));

        assert!(matches!(
            Config::from_file(std::path::Path::new("/nonexistent/shardgate.yaml")),
            Err(ConfigError::LoadError(_))
        ));
    }
}
