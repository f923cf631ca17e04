use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default stream-server port for a Python-runtime agent.
pub const DEFAULT_PORT_PYTHON: u16 = 5678;
/// Default stream-server port for a JVM-runtime agent.
pub const DEFAULT_PORT_JVM: u16 = 5679;

/// Default lifetime cap on recorded calls.
pub const DEFAULT_MAX_CALLS: u64 = 100_000;
/// Default cap on tracked stack depth.
pub const DEFAULT_MAX_DEPTH: usize = 1_000;

/// What to do with a subscriber whose send queue is full.
///
/// Either way the instrumentor is never blocked; the choice only decides
/// whether a slow subscriber sees gaps or gets cut off.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackpressurePolicy {
    /// Drop the event for that subscriber and count it.
    #[default]
    DropEvents,
    /// Disconnect the subscriber.
    Disconnect,
}

impl BackpressurePolicy {
    /// Returns the policy name as used in telemetry and env configuration.
    pub const fn to_str(self) -> &'static str {
        match self {
            Self::DropEvents => "drop_events",
            Self::Disconnect => "disconnect",
        }
    }
}

/// Gives guidance to the [`Instrumentor`](crate::tracing::Instrumentor).
///
/// Use [`InstrumentorConfig::default`] for the stock engine or
/// [`InstrumentorConfig::from_env`] for the `FLOWTRACE_*` environment
/// surface. A malformed environment value never fails construction: it logs
/// a warning and keeps the default.
#[derive(Clone, Debug, PartialEq)]
#[must_use]
pub struct InstrumentorConfig {
    /// Module-prefix allow-list. Empty means allow all.
    pub includes: Vec<String>,
    /// Module-prefix deny-list, merged with the built-in excludes.
    pub excludes: Vec<String>,
    /// Hard cap on lifetime recorded calls; reaching it disables the engine.
    pub max_calls: u64,
    /// Hard cap on tracked stack depth; deeper frames become placeholders.
    pub max_depth: usize,
    /// Emit 1-in-N among frames that pass all other filters.
    pub sample_rate: u64,
    /// Per (file, definition line) site: stream only the first N calls.
    ///
    /// `None` leaves path-coverage dedup off and streams every call.
    pub coverage_limit: Option<u32>,
    /// Capture argument and return-value previews. Off by default because
    /// rendering arbitrary host values is unsafe.
    pub capture_values: bool,
    /// Stream-server loopback port. 0 binds an ephemeral port, `None`
    /// disables the server entirely.
    pub stream_port: Option<u16>,
    /// Directory the session artifact is written to.
    pub trace_dir: PathBuf,
    /// Also write the per-function performance summary artifact.
    pub write_summary: bool,
    /// Language tag stamped on every event.
    pub language: String,
    /// Slow-subscriber policy of the stream server.
    pub backpressure: BackpressurePolicy,
}

impl Default for InstrumentorConfig {
    fn default() -> Self {
        Self {
            includes: Vec::new(),
            excludes: Vec::new(),
            max_calls: DEFAULT_MAX_CALLS,
            max_depth: DEFAULT_MAX_DEPTH,
            sample_rate: 1,
            coverage_limit: None,
            capture_values: false,
            stream_port: Some(DEFAULT_PORT_PYTHON),
            trace_dir: PathBuf::from("./traces"),
            write_summary: true,
            language: "python".into(),
            backpressure: BackpressurePolicy::default(),
        }
    }
}

impl InstrumentorConfig {
    /// Returns the default config with the stream server disabled.
    pub fn without_server(mut self) -> Self {
        self.stream_port = None;
        self
    }

    /// Sets the module-prefix allow-list.
    pub fn set_includes<I, S>(mut self, includes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.includes = includes.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the module-prefix deny-list.
    pub fn set_excludes<I, S>(mut self, excludes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.excludes = excludes.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the lifetime call cap.
    pub fn set_max_calls(mut self, max_calls: u64) -> Self {
        self.max_calls = max_calls;
        self
    }

    /// Sets the stack-depth cap.
    pub fn set_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Sets the 1-in-N sampling rate. Values below 1 are clamped to 1.
    pub fn set_sample_rate(mut self, sample_rate: u64) -> Self {
        self.sample_rate = sample_rate.max(1);
        self
    }

    /// Sets the path-coverage dedup limit.
    pub fn set_coverage_limit(mut self, limit: Option<u32>) -> Self {
        self.coverage_limit = limit;
        self
    }

    /// Enables argument and return-value preview capture.
    pub fn capture_values(mut self) -> Self {
        self.capture_values = true;
        self
    }

    /// Sets the stream-server port. 0 binds an ephemeral port.
    pub fn set_stream_port(mut self, port: Option<u16>) -> Self {
        self.stream_port = port;
        self
    }

    /// Sets the session artifact directory.
    pub fn set_trace_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.trace_dir = dir.into();
        self
    }

    /// Configures whether the performance summary artifact is written.
    pub fn set_write_summary(mut self, write_summary: bool) -> Self {
        self.write_summary = write_summary;
        self
    }

    /// Sets the language tag and, when the port was not set explicitly,
    /// the runtime's conventional default port.
    pub fn set_language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        if self.stream_port == Some(DEFAULT_PORT_PYTHON) && self.language == "jvm" {
            self.stream_port = Some(DEFAULT_PORT_JVM);
        }
        self
    }

    /// Sets the slow-subscriber policy.
    pub fn set_backpressure(mut self, policy: BackpressurePolicy) -> Self {
        self.backpressure = policy;
        self
    }

    /// Builds the config from the `FLOWTRACE_*` process environment.
    pub fn from_env() -> Self {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    /// Builds the config from an arbitrary variable lookup.
    ///
    /// Factored out of [`Self::from_env`] so parsing is testable without
    /// touching the process environment.
    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(modules) = lookup("FLOWTRACE_MODULES") {
            config.includes = split_csv(&modules);
        }
        if let Some(exclude) = lookup("FLOWTRACE_EXCLUDE") {
            config.excludes = split_csv(&exclude);
        }
        if let Some(dir) = lookup("FLOWTRACE_TRACE_DIR") {
            if !dir.is_empty() {
                config.trace_dir = PathBuf::from(dir);
            }
        }
        if let Some(max_calls) = parse_var(&lookup, "FLOWTRACE_MAX_CALLS") {
            config.max_calls = max_calls;
        }
        if let Some(max_depth) = parse_var(&lookup, "FLOWTRACE_MAX_DEPTH") {
            config.max_depth = max_depth;
        }
        if let Some(rate) = parse_var::<u64>(&lookup, "FLOWTRACE_SAMPLE_RATE") {
            config.sample_rate = rate.max(1);
        }
        if let Some(limit) = parse_var(&lookup, "FLOWTRACE_COVERAGE_LIMIT") {
            config.coverage_limit = Some(limit);
        }
        if let Some(port) = parse_var(&lookup, "FLOWTRACE_SOCKET_PORT") {
            config.stream_port = Some(port);
        }
        if let Some(raw) = lookup("FLOWTRACE_BACKPRESSURE") {
            match raw.trim().to_ascii_lowercase().as_str() {
                "drop" | "drop_events" => config.backpressure = BackpressurePolicy::DropEvents,
                "disconnect" => config.backpressure = BackpressurePolicy::Disconnect,
                other => {
                    log::warn!(
                        "ignoring FLOWTRACE_BACKPRESSURE={other:?}, using {}",
                        config.backpressure.to_str()
                    );
                }
            }
        }
        if let Some(raw) = lookup("FLOWTRACE_CAPTURE_VALUES") {
            config.capture_values = raw.trim() == "1";
        }

        config
    }
}

fn split_csv(raw: &str) -> Vec<String> {
    raw.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect()
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> Option<T> {
    let raw = lookup(name)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            log::warn!("ignoring malformed {name}={raw:?}, using default");
            None
        }
    }
}
