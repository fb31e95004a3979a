use std::{collections::HashMap, fs::read_to_string, path::PathBuf, sync::Arc, time::Duration};

use ahash::AHashMap;
use clap::Parser;
use codec::ValueKind;
use serde::Deserialize;
use url::Url;

use crate::{
    error::CommError,
    port::{InputPort, Operation, OperationKind, OutputPort},
};

/// Per-port transport-layer-security settings.
///
/// Stores are PEM files: the key store carries the certificate chain
/// followed by the private key, the trust store the root certificates.
/// The password fields exist for configuration compatibility only and
/// are ignored with a warning (PEM stores are not password wrapped).
#[derive(Deserialize, Debug, Clone)]
pub struct SslConfig {
    /// Minimum TLS protocol version, "TLSv1.2" or "TLSv1.3".
    #[serde(default = "SslConfig::protocol")]
    pub protocol: String,

    #[serde(default = "SslConfig::store_format")]
    pub key_store_format: String,

    #[serde(default = "SslConfig::store_format")]
    pub trust_store_format: String,

    /// Certificate chain plus private key; mandatory in server mode.
    #[serde(default)]
    pub key_store: Option<PathBuf>,

    #[serde(default)]
    pub key_store_password: Option<String>,

    /// Root certificates; mandatory in client mode.
    #[serde(default)]
    pub trust_store: Option<PathBuf>,

    #[serde(default)]
    pub trust_store_password: Option<String>,
}

impl SslConfig {
    fn protocol() -> String {
        "TLSv1.2".to_string()
    }

    fn store_format() -> String {
        "PEM".to_string()
    }
}

impl Default for SslConfig {
    fn default() -> Self {
        Self {
            protocol: Self::protocol(),
            key_store_format: Self::store_format(),
            trust_store_format: Self::store_format(),
            key_store: None,
            key_store_password: None,
            trust_store: None,
            trust_store_password: None,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct Runtime {
    /// Number of reactor tasks.
    ///
    /// One per hardware thread by default; channels are spread over
    /// them round-robin.
    #[serde(default = "num_cpus::get")]
    pub selector_tasks: usize,

    /// Upper bound on concurrently running message handlers.
    ///
    /// Unset means unbounded, like the cached pool it replaces.
    #[serde(default)]
    pub connections_limit: Option<usize>,

    /// Sweep interval of the polling loop, for transports that cannot
    /// report readiness.
    #[serde(default = "Runtime::polling_interval_ms")]
    pub polling_interval_ms: u64,

    /// Idle lifetime of a pooled outbound channel before eviction.
    #[serde(default = "Runtime::persistent_connection_timeout_ms")]
    pub persistent_connection_timeout_ms: u64,
}

impl Runtime {
    fn polling_interval_ms() -> u64 {
        50
    }

    fn persistent_connection_timeout_ms() -> u64 {
        10_000
    }

    pub fn polling_interval(&self) -> Duration {
        Duration::from_millis(self.polling_interval_ms)
    }

    pub fn persistent_connection_timeout(&self) -> Duration {
        Duration::from_millis(self.persistent_connection_timeout_ms)
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self {
            selector_tasks: num_cpus::get(),
            connections_limit: None,
            polling_interval_ms: Self::polling_interval_ms(),
            persistent_connection_timeout_ms: Self::persistent_connection_timeout_ms(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct OperationConfig {
    pub name: String,

    #[serde(default = "OperationConfig::kind")]
    pub kind: OperationKind,

    #[serde(default)]
    pub request_type: ValueKind,
}

impl OperationConfig {
    fn kind() -> OperationKind {
        OperationKind::RequestResponse
    }
}

fn default_protocol() -> String {
    "wire".to_string()
}

#[derive(Deserialize, Debug, Clone)]
pub struct InputConfig {
    pub name: String,

    /// Listen location, e.g. "socket://0.0.0.0:9010".
    pub location: String,

    #[serde(default = "default_protocol")]
    pub protocol: String,

    #[serde(default)]
    pub ssl: Option<SslConfig>,

    #[serde(default)]
    pub operations: Vec<OperationConfig>,

    /// First-path-segment routing: segment name to output-port name.
    #[serde(default)]
    pub redirections: HashMap<String, String>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct OutputConfig {
    pub name: String,

    pub location: String,

    #[serde(default = "default_protocol")]
    pub protocol: String,

    #[serde(default)]
    pub ssl: Option<SslConfig>,

    /// Whether released channels are cached for reuse.
    #[serde(default = "OutputConfig::persistent")]
    pub persistent: bool,
}

impl OutputConfig {
    fn persistent() -> bool {
        true
    }
}

#[derive(Deserialize, Debug)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Info
    }
}

impl LogLevel {
    pub fn as_level(&self) -> log::Level {
        match *self {
            Self::Error => log::Level::Error,
            Self::Warn => log::Level::Warn,
            Self::Info => log::Level::Info,
            Self::Debug => log::Level::Debug,
            Self::Trace => log::Level::Trace,
        }
    }
}

#[derive(Deserialize, Debug, Default)]
pub struct Log {
    /// An enum representing the available verbosity levels of the logger.
    #[serde(default)]
    pub level: LogLevel,
}

#[derive(Deserialize, Debug, Default)]
pub struct Config {
    #[serde(default)]
    pub log: Log,

    #[serde(default)]
    pub runtime: Runtime,

    #[serde(default)]
    pub inputs: Vec<InputConfig>,

    #[serde(default)]
    pub outputs: Vec<OutputConfig>,
}

#[derive(Parser)]
#[command(
    about = env!("CARGO_PKG_DESCRIPTION"),
    version = env!("CARGO_PKG_VERSION"),
)]
struct Cli {
    /// specify the configuration file path.
    #[arg(long)]
    config: Option<String>,
}

impl Config {
    /// Load command line parameters; if a configuration file path is
    /// specified the configuration is read from it, otherwise the
    /// defaults apply.
    pub fn load() -> anyhow::Result<Self> {
        match Cli::parse().config {
            Some(path) => Self::from_str(&read_to_string(path)?),
            None => Ok(Self::default()),
        }
    }

    pub fn from_str(source: &str) -> anyhow::Result<Self> {
        Ok(serde_json5::from_str(source)?)
    }

    /// Materialise the configured ports, resolving redirection targets
    /// to their output ports.
    pub fn build_ports(
        &self,
    ) -> Result<(Vec<Arc<InputPort>>, AHashMap<String, Arc<OutputPort>>), CommError> {
        let mut outputs = AHashMap::new();
        for output in &self.outputs {
            let location = parse_location(&output.location)?;
            let mut port = OutputPort::new(&output.name, location, &output.protocol)
                .with_persistent(output.persistent);
            if let Some(ssl) = &output.ssl {
                port = port.with_ssl(ssl.clone());
            }
            outputs.insert(output.name.clone(), Arc::new(port));
        }

        let mut inputs = Vec::new();
        for input in &self.inputs {
            let location = parse_location(&input.location)?;
            let mut port = InputPort::new(&input.name, location, &input.protocol);
            if let Some(ssl) = &input.ssl {
                port = port.with_ssl(ssl.clone());
            }

            for operation in &input.operations {
                port = port.with_operation(Operation {
                    name: operation.name.clone(),
                    kind: operation.kind,
                    request_type: operation.request_type,
                });
            }

            for (segment, target) in &input.redirections {
                let output = outputs.get(target).cloned().ok_or_else(|| {
                    CommError::Config(format!(
                        "input {} redirects {segment:?} to unknown output port {target:?}",
                        input.name
                    ))
                })?;
                port = port.with_redirection(segment.clone(), output);
            }

            inputs.push(Arc::new(port));
        }

        Ok((inputs, outputs))
    }
}

pub(crate) fn parse_location(location: &str) -> Result<Url, CommError> {
    Url::parse(location).map_err(|e| CommError::Config(format!("bad location {location:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_a_file() {
        let config = Config::default();
        assert_eq!(config.runtime.polling_interval_ms, 50);
        assert_eq!(config.runtime.persistent_connection_timeout_ms, 10_000);
        assert!(config.inputs.is_empty());
    }

    #[test]
    fn json5_ports_resolve() {
        let config = Config::from_str(
            r#"{
                runtime: { selector_tasks: 2, persistent_connection_timeout_ms: 500 },
                outputs: [{ name: "backend", location: "socket://127.0.0.1:9020" }],
                inputs: [{
                    name: "front",
                    location: "socket://127.0.0.1:9010",
                    operations: [{ name: "echo", kind: "one_way", request_type: "string" }],
                    redirections: { svcA: "backend" },
                }],
            }"#,
        )
        .unwrap();

        let (inputs, outputs) = config.build_ports().unwrap();
        assert_eq!(outputs.len(), 1);
        assert_eq!(inputs.len(), 1);

        let front = &inputs[0];
        assert_eq!(front.operations["echo"].kind, OperationKind::OneWay);
        assert_eq!(front.redirections["svcA"].name, "backend");
    }

    #[test]
    fn unknown_redirection_target_rejected() {
        let config = Config::from_str(
            r#"{
                inputs: [{
                    name: "front",
                    location: "socket://127.0.0.1:9010",
                    redirections: { svcA: "missing" },
                }],
            }"#,
        )
        .unwrap();

        assert!(matches!(
            config.build_ports(),
            Err(CommError::Config(_))
        ));
    }
}
