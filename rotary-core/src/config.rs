//! dispatcher process configs

pub mod cli {
    //! Parse from either cli or env var

    /// the default path to config
    pub static DEFAULT_CONFIG_PATH: &str = "/var/lib/rotary/config.yaml";
    /// default call-record database path
    pub const DEFAULT_DATABASE_URL: &str = "/var/lib/rotary/calls.db";
    /// default rotary id
    pub const DEFAULT_ROTARY_ID: &str = "rotary_id";
    /// default log level. Can use this argument or ROTARY_LOG env var
    pub const DEFAULT_ROTARY_LOG: &str = "info";
    /// tokio worker thread name
    pub static DEFAULT_THREAD_NAME: &str = "rotary-dispatch-worker";

    use std::path::PathBuf;

    pub use clap::Parser;

    #[derive(Parser, Debug, Clone, PartialEq, Eq)]
    #[clap(author, name = "rotary", bin_name = "rotary", about, long_about = None)]
    /// parses from cli & environment var. rotary will load `.env` in the same dir as the binary as well
    pub struct Config {
        /// path to rotary's config
        #[clap(
            short,
            long,
            value_parser,
            env,
            default_value = DEFAULT_CONFIG_PATH
        )]
        pub config_path: PathBuf,
        /// ID of this instance
        #[clap(long, env, value_parser, default_value = DEFAULT_ROTARY_ID)]
        pub rotary_id: String,
        /// set the log level. All valid RUST_LOG arguments are accepted
        #[clap(long, env, value_parser, default_value = DEFAULT_ROTARY_LOG)]
        pub rotary_log: String,
        /// Path to the call database. Use "sqlite::memory:" for an in-mem db
        #[clap(short, env, value_parser, default_value = DEFAULT_DATABASE_URL)]
        pub database_url: String,
        /// Redis URL override; takes precedence over the config file
        #[clap(long, env, value_parser)]
        pub redis_url: Option<String>,
        /// Worker thread name
        #[clap(long, env, value_parser, default_value = DEFAULT_THREAD_NAME)]
        pub thread_name: String,
        /// Number of tokio worker threads; defaults to num logical CPUs
        #[clap(long, env, value_parser)]
        pub threads: Option<usize>,
    }
}

pub mod trace {
    //! tracing configuration

    use std::str::FromStr;

    use anyhow::Result;
    use tracing_subscriber::{
        filter::EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt,
    };

    use crate::env::parse_var_with_err;

    /// Backends chatter below warn on every lease heartbeat; keep them out
    /// of dispatch logs unless the operator raises them explicitly.
    const QUIET_DIRECTIVES: &[&str] = &["redis=warn", "sqlx=warn"];

    /// Output shape for log events, from `LOG_FORMAT`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub enum LogFormat {
        /// Single-line, human-readable (default).
        #[default]
        Standard,
        /// One JSON object per event, for log shippers.
        Json,
        /// Multi-line output for local debugging.
        Pretty,
    }

    /// `LOG_FORMAT` held a value this build does not know.
    #[derive(Debug, thiserror::Error)]
    #[error("unrecognized log format {0:?} (expected standard, json, or pretty)")]
    pub struct UnknownLogFormat(String);

    impl FromStr for LogFormat {
        type Err = UnknownLogFormat;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            match s {
                "" | "standard" => Ok(LogFormat::Standard),
                "json" => Ok(LogFormat::Json),
                "pretty" => Ok(LogFormat::Pretty),
                other => Err(UnknownLogFormat(other.to_owned())),
            }
        }
    }

    /// Configuration for log output
    #[derive(Debug)]
    pub struct Config {
        /// formatting applied to logs
        pub format: LogFormat,
    }

    impl Config {
        /// Make new trace config and install the global subscriber.
        /// Level comes from ROTARY_LOG, shape from LOG_FORMAT.
        pub fn parse(rotary_log: &str) -> Result<Self> {
            let format: LogFormat = parse_var_with_err("LOG_FORMAT", LogFormat::Standard)?;
            let registry = tracing_subscriber::registry().with(level_filter(rotary_log)?);
            match format {
                LogFormat::Json => registry
                    .with(fmt::layer().json().flatten_event(true))
                    .init(),
                LogFormat::Pretty => registry
                    .with(fmt::layer().pretty().with_file(false).with_line_number(false))
                    .init(),
                LogFormat::Standard => registry.with(fmt::layer().with_target(false)).init(),
            }
            Ok(Self { format })
        }
    }

    fn level_filter(rotary_log: &str) -> Result<EnvFilter> {
        let mut filter = EnvFilter::try_new(rotary_log).or_else(|_| EnvFilter::try_new("info"))?;
        for directive in QUIET_DIRECTIVES {
            filter = filter.add_directive(directive.parse()?);
        }
        Ok(filter)
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn log_format_parses_known_values() {
            assert_eq!("standard".parse::<LogFormat>().unwrap(), LogFormat::Standard);
            assert_eq!("".parse::<LogFormat>().unwrap(), LogFormat::Standard);
            assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
            assert_eq!("pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        }

        #[test]
        fn log_format_rejects_unknown_values() {
            let err = "xml".parse::<LogFormat>().unwrap_err();
            assert!(err.to_string().contains("xml"));
        }

        #[test]
        fn quiet_directives_always_parse() {
            let filter = level_filter("debug").unwrap();
            // the directive list is static; a typo should fail loudly here
            assert!(!format!("{filter}").is_empty());
        }
    }
}
