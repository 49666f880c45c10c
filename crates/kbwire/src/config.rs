//! Connection configuration.
//!
//! Provides connection parameters for establishing connections including
//! authentication, TLS, driver behavior switches and the startup options
//! forwarded to the server.

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use kbwire_core::Error;
use kbwire_core::error::ConfigError;

use crate::types::CodecConfig;

/// Default server port.
pub const DEFAULT_PORT: u16 = 54321;

/// TLS mode for connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SslMode {
    /// Do not use TLS
    #[default]
    Disable,
    /// Require TLS, do not verify the server certificate
    NoVerify,
    /// Require TLS and verify the certificate chain, ignoring the host name
    VerifyCa,
    /// Require TLS and verify both the chain and the host name
    VerifyFull,
}

impl SslMode {
    /// Check if TLS should be negotiated.
    pub const fn should_try_ssl(self) -> bool {
        !matches!(self, SslMode::Disable)
    }

    /// Does this mode validate the certificate chain?
    pub const fn verifies_chain(self) -> bool {
        matches!(self, SslMode::VerifyCa | SslMode::VerifyFull)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            SslMode::Disable => "disable",
            SslMode::NoVerify => "no-verify",
            SslMode::VerifyCa => "verify-ca",
            SslMode::VerifyFull => "verify-full",
        }
    }
}

impl FromStr for SslMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "disable" => Ok(SslMode::Disable),
            "no-verify" | "prefer" | "require" => Ok(SslMode::NoVerify),
            "verify-ca" => Ok(SslMode::VerifyCa),
            "verify-full" => Ok(SslMode::VerifyFull),
            other => Err(config_error(format!("unsupported sslmode {other:?}"))),
        }
    }
}

/// Parse a boolean driver setting.
///
/// Accepts `yes`/`no` along with `true`/`false`, `on`/`off` and `1`/`0`.
#[allow(clippy::result_large_err)]
pub fn parse_bool_setting(key: &str, value: &str) -> Result<bool, Error> {
    match value {
        "yes" | "true" | "on" | "1" => Ok(true),
        "no" | "false" | "off" | "0" => Ok(false),
        _ => Err(config_error(format!(
            "unrecognized value {value:?} for {key}"
        ))),
    }
}

/// Keys the driver consumes itself. They are never sent in the startup packet.
fn is_driver_setting(key: &str) -> bool {
    matches!(
        key,
        "host"
            | "port"
            | "password"
            | "sslmode"
            | "sslcert"
            | "sslkey"
            | "sslrootcert"
            | "fallback_application_name"
            | "connect_timeout"
            | "keepalive"
            | "keepalive_idle"
            | "keepalive_interval"
            | "keepalive_count"
            | "tcp_user_timeout"
            | "get_last_insert_id"
            | "disable_prepared_binary_result"
            | "binary_parameters"
    )
}

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct KbConfig {
    /// Hostname or IP address
    pub host: String,
    /// Port number (default: 54321)
    pub port: u16,
    /// Username for authentication
    pub user: String,
    /// Password for authentication (optional for trust auth)
    pub password: Option<String>,
    /// Database name to connect to
    pub database: String,
    /// Application name reported to the server
    pub application_name: Option<String>,
    /// Connection timeout, also used for the startup handshake
    pub connect_timeout: Duration,
    /// TLS mode
    pub ssl_mode: SslMode,
    /// PEM file of trusted roots (webpki roots when unset)
    pub ssl_root_cert: Option<PathBuf>,
    /// PEM client certificate chain
    pub ssl_cert: Option<PathBuf>,
    /// PEM client private key
    pub ssl_key: Option<PathBuf>,
    /// Append `RETURNING *` to INSERTs and report the first column as the
    /// last insert id
    pub get_last_insert_id: bool,
    /// Receive every prepared-statement column in text format
    pub disable_prepared_binary_result: bool,
    /// Send parameters in binary format, parsing, binding and executing in
    /// one round trip
    pub binary_parameters: bool,
    /// Codec settings shared by every statement on the connection
    pub codec: CodecConfig,
    /// Additional startup parameters
    pub options: HashMap<String, String>,
}

impl Default for KbConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_PORT,
            user: String::new(),
            password: None,
            database: String::new(),
            application_name: None,
            connect_timeout: Duration::from_secs(30),
            ssl_mode: SslMode::default(),
            ssl_root_cert: None,
            ssl_cert: None,
            ssl_key: None,
            get_last_insert_id: false,
            disable_prepared_binary_result: false,
            binary_parameters: false,
            codec: CodecConfig::default(),
            options: HashMap::new(),
        }
    }
}

impl KbConfig {
    /// Create a new configuration with the given connection components.
    pub fn new(
        host: impl Into<String>,
        user: impl Into<String>,
        database: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            user: user.into(),
            database: database.into(),
            ..Default::default()
        }
    }

    /// Set the port.
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the password.
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Set the application name.
    pub fn application_name(mut self, name: impl Into<String>) -> Self {
        self.application_name = Some(name.into());
        self
    }

    /// Set the connection timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the TLS mode.
    pub fn ssl_mode(mut self, mode: SslMode) -> Self {
        self.ssl_mode = mode;
        self
    }

    /// Trust the roots in this PEM file instead of the bundled webpki roots.
    pub fn ssl_root_cert(mut self, path: impl Into<PathBuf>) -> Self {
        self.ssl_root_cert = Some(path.into());
        self
    }

    /// Present a client certificate.
    pub fn ssl_client_cert(mut self, cert: impl Into<PathBuf>, key: impl Into<PathBuf>) -> Self {
        self.ssl_cert = Some(cert.into());
        self.ssl_key = Some(key.into());
        self
    }

    pub fn get_last_insert_id(mut self, enable: bool) -> Self {
        self.get_last_insert_id = enable;
        self
    }

    pub fn disable_prepared_binary_result(mut self, disable: bool) -> Self {
        self.disable_prepared_binary_result = disable;
        self
    }

    pub fn binary_parameters(mut self, enable: bool) -> Self {
        self.binary_parameters = enable;
        self
    }

    /// Set the codec configuration.
    pub fn codec(mut self, codec: CodecConfig) -> Self {
        self.codec = codec;
        self
    }

    /// Set an additional connection option.
    pub fn option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    /// Apply one textual `key=value` setting.
    ///
    /// Driver settings update the matching field; any other key becomes a
    /// startup option. Socket tuning keys (`keepalive*`, `tcp_user_timeout`)
    /// are accepted and ignored.
    #[allow(clippy::result_large_err)]
    pub fn set(mut self, key: &str, value: &str) -> Result<Self, Error> {
        match key {
            "host" => self.host = value.to_string(),
            "port" => {
                self.port = value
                    .parse()
                    .map_err(|_| config_error(format!("invalid port {value:?}")))?;
            }
            "user" => self.user = value.to_string(),
            "password" => self.password = Some(value.to_string()),
            "dbname" | "database" => self.database = value.to_string(),
            "application_name" => self.application_name = Some(value.to_string()),
            "fallback_application_name" => {
                if self.application_name.is_none() {
                    self.application_name = Some(value.to_string());
                }
            }
            "connect_timeout" => {
                let secs: u64 = value
                    .parse()
                    .map_err(|_| config_error(format!("invalid connect_timeout {value:?}")))?;
                self.connect_timeout = Duration::from_secs(secs);
            }
            "sslmode" => self.ssl_mode = value.parse()?,
            "sslrootcert" => self.ssl_root_cert = Some(PathBuf::from(value)),
            "sslcert" => self.ssl_cert = Some(PathBuf::from(value)),
            "sslkey" => self.ssl_key = Some(PathBuf::from(value)),
            "get_last_insert_id" => self.get_last_insert_id = parse_bool_setting(key, value)?,
            "disable_prepared_binary_result" => {
                self.disable_prepared_binary_result = parse_bool_setting(key, value)?;
            }
            "binary_parameters" => self.binary_parameters = parse_bool_setting(key, value)?,
            _ if is_driver_setting(key) => {}
            _ => {
                self.options.insert(key.to_string(), value.to_string());
            }
        }
        Ok(self)
    }

    /// Build the startup parameters to send to the server.
    pub fn startup_params(&self) -> Vec<(String, String)> {
        let mut params = vec![
            ("user".to_string(), self.user.clone()),
            ("database".to_string(), self.database.clone()),
            ("client_encoding".to_string(), "UTF8".to_string()),
        ];

        if let Some(app_name) = &self.application_name {
            params.push(("application_name".to_string(), app_name.clone()));
        }

        let mut extra: Vec<_> = self
            .options
            .iter()
            .filter(|(k, _)| !is_driver_setting(k))
            .map(|(k, v)| {
                let key = if k == "dbname" { "database" } else { k.as_str() };
                (key.to_string(), v.clone())
            })
            .filter(|(k, _)| !params.iter().any(|(p, _)| p == k))
            .collect();
        extra.sort();
        params.extend(extra);

        params
    }

    /// Get the socket address string for connection.
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn config_error(message: String) -> Error {
    Error::Config(ConfigError {
        message,
        source: None,
    })
}
