use std::path::PathBuf;
use std::sync::Arc;

use clap::{ArgAction, Parser};
use tokio::time::Duration;
use tokio_tungstenite::tungstenite::http::HeaderMap;
use tracing::debug;

use crate::client::{parse_headers, DialerConfig};
use crate::errors::ConfigError;
use crate::report::ReportFormat;
use crate::resolve::AddressOverride;
use crate::utils::parse_duration_string;

/// Command line flags. Most flags can also be supplied through the
/// environment variable named in their help text.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "ws_loadtest",
    version,
    about = "Opens many concurrent WebSocket connections and measures inbound throughput"
)]
pub struct CliArgs {
    /// Target URL (ws:// or wss://)
    #[arg(env = "TARGET_URL")]
    pub url: String,

    /// Number of connections to make
    #[arg(short = 'c', env = "NUM_CONNECTIONS", default_value_t = 50)]
    pub connections: usize,

    /// Ramp-up rate in connections per second (default: same as -c)
    #[arg(short = 'q', env = "RAMP_RATE", default_value_t = 0)]
    pub rate: usize,

    /// Duration of the run, e.g. 10s, 3m, 1h, 1m30s
    #[arg(short = 'z', env = "TEST_DURATION", default_value = "5m")]
    pub duration: String,

    /// Custom header 'Name: value'. Repeat for more headers
    #[arg(short = 'H', value_name = "HEADER")]
    pub headers: Vec<String>,

    /// Allow insecure connections when using TLS
    #[arg(short = 'k', env = "SKIP_TLS_VERIFY")]
    pub insecure: bool,

    /// Data to send on each websocket as one binary message
    #[arg(short = 'd', value_name = "DATA")]
    pub data: Option<String>,

    /// Data to send on each websocket, read from a file (wins over -d)
    #[arg(short = 'D', value_name = "FILE")]
    pub data_file: Option<PathBuf>,

    /// User-Agent header value
    #[arg(short = 'U', value_name = "USER_AGENT")]
    pub user_agent: Option<String>,

    /// Verbose output; repeat (-vv) to also echo received bytes to stdout
    #[arg(short = 'v', action = ArgAction::Count)]
    pub verbose: u8,

    /// Override DNS for one host: host:port:addr[,addr...]
    #[arg(long = "resolve", env = "RESOLVE_TARGET_ADDR", value_name = "SPEC")]
    pub resolve: Option<String>,

    /// Per-dial timeout in seconds
    #[arg(short = 't', env = "DIAL_TIMEOUT_SECS", default_value_t = 20)]
    pub timeout_secs: u64,

    /// Report format
    #[arg(long, value_enum, env = "REPORT_FORMAT", default_value_t = ReportFormat::Text)]
    pub output: ReportFormat,

    /// Serve Prometheus metrics on this port while the run is active
    #[arg(long, env = "METRICS_PORT")]
    pub metrics_port: Option<u16>,
}

/// Main configuration for one run. Immutable once the run starts.
#[derive(Debug, Clone)]
pub struct Config {
    pub target_url: String,
    pub num_connections: usize,
    /// Connections started per ramp interval. 0 means "same as num_connections".
    pub ramp_rate: usize,
    pub ramp_interval: Duration,
    pub test_duration: Duration,
    pub verbosity: u8,
    pub headers: HeaderMap,
    pub user_agent: Option<String>,
    pub payload: Option<Vec<u8>>,
    pub skip_tls_verify: bool,
    pub resolve: Option<String>,
    pub dial_timeout: Duration,
    pub handshake_timeout: Duration,
    pub report_format: ReportFormat,
    pub metrics_port: Option<u16>,
}

impl Config {
    /// A configuration with the command line defaults for `target_url`.
    pub fn new(target_url: impl Into<String>) -> Self {
        Self {
            target_url: target_url.into(),
            num_connections: 50,
            ramp_rate: 0,
            ramp_interval: Duration::from_secs(1),
            test_duration: Duration::from_secs(5 * 60),
            verbosity: 0,
            headers: HeaderMap::new(),
            user_agent: None,
            payload: None,
            skip_tls_verify: false,
            resolve: None,
            dial_timeout: Duration::from_secs(20),
            handshake_timeout: Duration::from_secs(5),
            report_format: ReportFormat::Text,
            metrics_port: None,
        }
    }

    pub fn with_connections(mut self, num_connections: usize) -> Self {
        self.num_connections = num_connections;
        self
    }

    pub fn with_ramp_rate(mut self, ramp_rate: usize) -> Self {
        self.ramp_rate = ramp_rate;
        self
    }

    pub fn with_ramp_interval(mut self, ramp_interval: Duration) -> Self {
        self.ramp_interval = ramp_interval;
        self
    }

    pub fn with_duration(mut self, test_duration: Duration) -> Self {
        self.test_duration = test_duration;
        self
    }

    pub fn with_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    pub fn with_resolve(mut self, spec: impl Into<String>) -> Self {
        self.resolve = Some(spec.into());
        self
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_verbosity(mut self, verbosity: u8) -> Self {
        self.verbosity = verbosity;
        self
    }

    pub fn with_dial_timeout(mut self, dial_timeout: Duration) -> Self {
        self.dial_timeout = dial_timeout;
        self
    }

    /// Builds a configuration from parsed command line flags.
    pub fn from_args(args: CliArgs) -> Result<Self, ConfigError> {
        let test_duration =
            parse_duration_string(&args.duration).map_err(|reason| ConfigError::InvalidDuration {
                value: args.duration.clone(),
                reason,
            })?;

        let headers = parse_headers(&args.headers)?;

        let payload = match (&args.data_file, args.data) {
            (Some(path), _) => Some(std::fs::read(path).map_err(|source| {
                ConfigError::PayloadFile {
                    path: path.clone(),
                    source,
                }
            })?),
            (None, Some(data)) => Some(data.into_bytes()),
            (None, None) => None,
        }
        .filter(|payload| !payload.is_empty());

        let config = Config {
            target_url: args.url,
            num_connections: args.connections,
            ramp_rate: args.rate,
            ramp_interval: Duration::from_secs(1),
            test_duration,
            verbosity: args.verbose,
            headers,
            user_agent: args.user_agent,
            payload,
            skip_tls_verify: args.insecure,
            resolve: args.resolve.filter(|s| !s.trim().is_empty()),
            dial_timeout: Duration::from_secs(args.timeout_secs),
            handshake_timeout: Duration::from_secs(5),
            report_format: args.output,
            metrics_port: args.metrics_port,
        };

        config.normalized()
    }

    /// Validates the configuration and applies defaults: a ramp rate of 0
    /// becomes the connection count.
    pub fn normalized(mut self) -> Result<Self, ConfigError> {
        if self.num_connections == 0 {
            return Err(ConfigError::InvalidValue {
                field: "connections".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.ramp_rate == 0 {
            self.ramp_rate = self.num_connections;
        }
        if self.ramp_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "ramp_interval".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        if self.dial_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "timeout".to_string(),
                message: "must be at least 1 second".to_string(),
            });
        }
        if let Some(ref spec) = self.resolve {
            AddressOverride::parse(spec)?;
        }
        Ok(self)
    }

    /// True when received bytes should be echoed to stdout.
    pub fn very_verbose(&self) -> bool {
        self.verbosity >= 2
    }

    /// Creates the address override for this run, if one is configured.
    pub fn address_override(&self) -> Result<Option<AddressOverride>, ConfigError> {
        self.resolve
            .as_deref()
            .map(AddressOverride::parse)
            .transpose()
    }

    /// Creates a DialerConfig from this Config.
    pub fn to_dialer_config(&self) -> Result<DialerConfig, ConfigError> {
        Ok(DialerConfig {
            skip_tls_verify: self.skip_tls_verify,
            headers: self.headers.clone(),
            user_agent: self.user_agent.clone(),
            dial_timeout: self.dial_timeout,
            handshake_timeout: self.handshake_timeout,
            address_override: self.address_override()?.map(Arc::new),
        })
    }

    /// Logs the configuration summary.
    pub fn log_summary(&self) {
        debug!(
            target_url = %self.target_url,
            connections = self.num_connections,
            ramp_rate = self.ramp_rate,
            duration = ?self.test_duration,
            payload_bytes = self.payload.as_ref().map(Vec::len).unwrap_or(0),
            skip_tls_verify = self.skip_tls_verify,
            resolve = ?self.resolve,
            dial_timeout = ?self.dial_timeout,
            "Starting load test"
        );
        for (name, value) in self.headers.iter() {
            debug!(
                header = %name,
                value = value.to_str().unwrap_or("<non-ASCII or sensitive value>"),
                "Custom header"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_rate_defaults_to_connection_count() {
        let config = Config::new("ws://localhost/")
            .with_connections(7)
            .normalized()
            .unwrap();
        assert_eq!(config.ramp_rate, 7);
    }

    #[test]
    fn explicit_rate_is_kept() {
        let config = Config::new("ws://localhost/")
            .with_connections(7)
            .with_ramp_rate(2)
            .normalized()
            .unwrap();
        assert_eq!(config.ramp_rate, 2);
    }

    #[test]
    fn zero_connections_rejected() {
        let err = Config::new("ws://localhost/")
            .with_connections(0)
            .normalized()
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn bad_resolve_rejected_at_validation() {
        let err = Config::new("ws://localhost/")
            .with_resolve("localhost:notaport:127.0.0.1")
            .normalized()
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidResolve { .. }));
    }

    fn args(extra: &[&str]) -> CliArgs {
        let argv = ["ws_loadtest"]
            .into_iter()
            .chain(extra.iter().copied())
            .chain(["ws://localhost/"]);
        CliArgs::try_parse_from(argv).unwrap()
    }

    #[test]
    fn empty_payload_is_not_sent() {
        let config = Config::from_args(args(&["-d", ""])).unwrap();
        assert!(config.payload.is_none());

        let file = tempfile::NamedTempFile::new().unwrap();
        let path = file.path().to_str().unwrap().to_string();
        let config = Config::from_args(args(&["-D", &path])).unwrap();
        assert!(config.payload.is_none());

        let config = Config::from_args(args(&["-d", "x"])).unwrap();
        assert_eq!(config.payload.as_deref(), Some(&b"x"[..]));
    }

    #[test]
    fn each_dialer_config_gets_a_fresh_override() {
        let config = Config::new("ws://localhost/").with_resolve("localhost:80:127.0.0.1,127.0.0.2");
        let first = config.to_dialer_config().unwrap();
        let second = config.to_dialer_config().unwrap();

        let first = first.address_override.unwrap();
        first.select();
        assert_eq!(first.selections(), 1);
        assert_eq!(second.address_override.unwrap().selections(), 0);
    }
}
