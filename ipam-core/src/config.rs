//! ipam process configs

pub mod cli {
    //! Parse from either cli or env var

    /// Default admin api addr
    pub static DEFAULT_IPAM_ADDR: &str = "0.0.0.0:8000";
    /// tokio worker thread name
    pub static DEFAULT_THREAD_NAME: &str = "ipam-worker";
    /// the default path to config
    pub static DEFAULT_CONFIG_PATH: &str = "/etc/ipam/config.yaml";
    /// default ipam id
    pub const DEFAULT_IPAM_ID: &str = "ipam_id";
    /// default log level. Can use this argument or IPAM_LOG env var
    pub const DEFAULT_IPAM_LOG: &str = "info";
    /// seconds between expired lease sweeps
    pub const DEFAULT_SWEEP_INTERVAL: u64 = 30;
    /// seconds between store health checks
    pub const DEFAULT_MONITOR_INTERVAL: u64 = 5;
    /// bound on a single lease store call
    pub const DEFAULT_STORE_TIMEOUT_MS: u64 = 2_000;
    /// admin api request timeout
    pub const DEFAULT_API_TIMEOUT: u64 = 10;

    use std::{net::SocketAddr, path::PathBuf, time::Duration};

    pub use clap::Parser;

    #[derive(Parser, Debug, Clone, PartialEq, Eq)]
    #[clap(author, name = "ipam", bin_name = "ipam", about, long_about = None)]
    /// parses from cli & environment var. ipam will load `.env` in the same dir as the binary as well
    pub struct Config {
        /// path to ipam's config
        #[clap(
            short,
            long,
            value_parser,
            env,
            default_value = DEFAULT_CONFIG_PATH
        )]
        pub config_path: PathBuf,
        /// the address the admin api listens on
        #[clap(long, env, value_parser, default_value = DEFAULT_IPAM_ADDR)]
        pub ipam_addr: SocketAddr,
        /// number of tokio worker threads, defaults to the number of cores
        #[clap(long, env, value_parser)]
        pub threads: Option<usize>,
        /// Worker thread name
        #[clap(long, env, value_parser, default_value = DEFAULT_THREAD_NAME)]
        pub thread_name: String,
        /// ID of this instance
        #[clap(long, env, value_parser, default_value = DEFAULT_IPAM_ID)]
        pub ipam_id: String,
        /// set the log level. All valid RUST_LOG arguments are accepted
        #[clap(long, env, value_parser, default_value = DEFAULT_IPAM_LOG)]
        pub ipam_log: String,
        /// seconds between expired lease sweeps, 0 disables the sweep
        #[clap(long, env, value_parser, default_value_t = DEFAULT_SWEEP_INTERVAL)]
        pub sweep_interval: u64,
        /// seconds between lease store health checks
        #[clap(long, env, value_parser, default_value_t = DEFAULT_MONITOR_INTERVAL)]
        pub monitor_interval: u64,
        /// lease store call timeout in milliseconds
        #[clap(long, env, value_parser, default_value_t = DEFAULT_STORE_TIMEOUT_MS)]
        pub store_timeout_ms: u64,
        /// admin api request timeout in seconds
        #[clap(long, env, value_parser, default_value_t = DEFAULT_API_TIMEOUT)]
        pub api_timeout: u64,
    }

    impl Config {
        /// expiry sweep period, `None` when disabled
        pub fn sweep_interval(&self) -> Option<Duration> {
            (self.sweep_interval > 0).then(|| Duration::from_secs(self.sweep_interval))
        }

        /// store monitor period
        pub fn monitor_interval(&self) -> Duration {
            Duration::from_secs(self.monitor_interval.max(1))
        }

        /// Create new store timeout as `Duration`
        pub fn store_timeout(&self) -> Duration {
            Duration::from_millis(self.store_timeout_ms)
        }

        /// Create new api timeout as `Duration`
        pub fn api_timeout(&self) -> Duration {
            Duration::from_secs(self.api_timeout)
        }
    }

}

pub mod trace {
    //! tracing configuration
    use anyhow::Result;
    use tracing_subscriber::{
        filter::EnvFilter,
        fmt::{
            self,
            format::{Format, PrettyFields},
        },
        prelude::__tracing_subscriber_SubscriberExt,
        util::SubscriberInitExt,
    };

    use crate::env::parse_var_with_err;

    /// log as "json", "pretty" or "standard" (unstructured)
    static DEFAULT_LOG_FORMAT: &str = "standard";

    /// output format for logs
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum LogFormat {
        /// one json object per line
        Json,
        /// multi-line human readable
        Pretty,
        /// single line human readable
        Standard,
    }

    impl From<&str> for LogFormat {
        fn from(s: &str) -> Self {
            match s {
                "json" => LogFormat::Json,
                "pretty" => LogFormat::Pretty,
                _ => LogFormat::Standard,
            }
        }
    }

    /// Configuration for logging
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct Config {
        /// formatting to apply to logs
        pub log_frmt: LogFormat,
    }

    impl Config {
        /// read `LOG_FORMAT` & install the global subscriber
        pub fn parse(ipam_log: &str) -> Result<Self> {
            let log_frmt: String = parse_var_with_err("LOG_FORMAT", DEFAULT_LOG_FORMAT)?;
            let log_frmt = LogFormat::from(&log_frmt[..]);

            // Log level comes from IPAM_LOG
            let filter = EnvFilter::try_new(ipam_log)
                .or_else(|_| EnvFilter::try_new("info"))?
                .add_directive("hyper=off".parse()?);

            match log_frmt {
                LogFormat::Json => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(fmt::layer().json())
                        .init();
                }
                LogFormat::Pretty => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(
                            fmt::layer()
                                .event_format(
                                    Format::default().pretty().with_source_location(false),
                                )
                                .fmt_fields(PrettyFields::new()),
                        )
                        .init();
                }
                LogFormat::Standard => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(fmt::layer())
                        .init();
                }
            }

            Ok(Self { log_frmt })
        }
    }

}
