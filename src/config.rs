// SPDX-License-Identifier: Apache-2.0 WITH LLVM-exception

//! YAML configuration: loading, environment overrides, defaults, and
//! validation.
//!
//! Precedence is environment variables over file values over compiled-in
//! defaults. Validation guarantees that exactly one authorization mode is
//! configured per side, that the Workload API socket is a usable UDS
//! path, and that every timeout is positive. The same loader backs the
//! library entry points and the CLI `validate` command, so a config file
//! means the same thing everywhere.

use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::authorizer::Authorizer;
use crate::error::{Error, Result};
use crate::id::{SpiffeId, TrustDomain};
use crate::workload_client::normalize_socket_path;

/// Environment variable naming the Workload API socket (first priority).
pub const ENV_SPIFFE_ENDPOINT_SOCKET: &str = "SPIFFE_ENDPOINT_SOCKET";
/// Fallback environment variable for the Workload API socket.
pub const ENV_SPIRE_AGENT_SOCKET: &str = "SPIRE_AGENT_SOCKET";
/// Overrides `server.listen_addr`.
pub const ENV_HTTP_ADDRESS: &str = "HTTP_ADDRESS";
/// Enables or disables the HTTPS server (`"1"`/`"true"` enable).
pub const ENV_HTTP_ENABLED: &str = "HTTP_ENABLED";
/// Overrides the server-side authorization policy.
pub const ENV_AUTH_POLICY: &str = "AUTH_POLICY";
/// SPIFFE ID(s) for the `specific-id` and `one-of` policies, comma-separated.
pub const ENV_ALLOWED_CLIENT_ID: &str = "ALLOWED_CLIENT_ID";
/// Trust domain for the `trust-domain` policy.
pub const ENV_AUTH_TRUST_DOMAIN: &str = "AUTH_TRUST_DOMAIN";

#[cfg(feature = "insecure-dev")]
const DEV_DEFAULT_SOCKET: &str = "/tmp/spire-agent/public/api.sock";

const DEFAULT_INITIAL_FETCH_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_READ_HEADER_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(120);
const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Validated view of the YAML configuration.
#[derive(Clone, Debug)]
pub struct Config {
    /// Workload API connection settings.
    pub spire: SpireSettings,
    /// Server-side settings, present when the `server` section exists.
    pub server: Option<ServerSettings>,
    /// Client-side settings, present when the `client` section exists.
    pub client: Option<ClientSettings>,
    /// HTTP timeouts applied by the façade.
    pub timeouts: HttpTimeouts,
}

/// Where and how to reach the local Workload API.
#[derive(Clone, Debug)]
pub struct SpireSettings {
    /// UDS path of the agent socket, `unix://` prefix already stripped.
    pub workload_socket: String,
    /// Window for the blocking initial SVID fetch.
    pub initial_fetch_timeout: Duration,
}

/// Validated server-side settings.
#[derive(Clone, Debug)]
pub struct ServerSettings {
    /// Address the HTTPS listener binds, e.g. `":8443"` or `"0.0.0.0:8443"`.
    pub listen_addr: String,
    /// Whether the HTTPS server runs at all.
    pub enabled: bool,
    /// Policy applied to connecting clients.
    pub authorizer: Authorizer,
}

/// Validated client-side settings.
#[derive(Clone, Debug)]
pub struct ClientSettings {
    /// Policy applied to the server the client connects to.
    pub authorizer: Authorizer,
}

/// Timeouts for the façade's HTTP plumbing.
#[derive(Clone, Debug)]
pub struct HttpTimeouts {
    /// Reading request headers. Default 10 s.
    pub read_header: Duration,
    /// Writing responses. Default 30 s.
    pub write: Duration,
    /// Idle keep-alive connections. Default 120 s.
    pub idle: Duration,
    /// Shutdown drain. Default 5 s.
    pub drain: Duration,
}

impl Default for HttpTimeouts {
    fn default() -> Self {
        Self {
            read_header: DEFAULT_READ_HEADER_TIMEOUT,
            write: DEFAULT_WRITE_TIMEOUT,
            idle: DEFAULT_IDLE_TIMEOUT,
            drain: DEFAULT_DRAIN_TIMEOUT,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    spire: Option<RawSpire>,
    server: Option<RawServer>,
    client: Option<RawClient>,
}

#[derive(Debug, Default, Deserialize)]
struct RawSpire {
    workload_socket: Option<String>,
    initial_fetch_timeout: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawServer {
    listen_addr: Option<String>,
    enabled: Option<bool>,
    allowed_client_spiffe_id: Option<String>,
    allowed_client_trust_domain: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawClient {
    expected_server_spiffe_id: Option<String>,
    expected_server_trust_domain: Option<String>,
}

#[derive(Debug, Default)]
struct EnvOverrides {
    socket: Option<String>,
    http_address: Option<String>,
    http_enabled: Option<bool>,
    auth_policy: Option<String>,
    allowed_client_id: Option<String>,
    auth_trust_domain: Option<String>,
}

impl EnvOverrides {
    fn from_process() -> Self {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());
        Self {
            socket: var(ENV_SPIFFE_ENDPOINT_SOCKET).or_else(|| var(ENV_SPIRE_AGENT_SOCKET)),
            http_address: var(ENV_HTTP_ADDRESS),
            http_enabled: var(ENV_HTTP_ENABLED).map(|v| parse_bool(&v)),
            auth_policy: var(ENV_AUTH_POLICY),
            allowed_client_id: var(ENV_ALLOWED_CLIENT_ID),
            auth_trust_domain: var(ENV_AUTH_TRUST_DOMAIN),
        }
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

impl Config {
    /// Loads, overrides, defaults, and validates the file at `path`.
    ///
    /// # Errors
    ///
    /// I/O errors reading the file, [`Error::InvalidConfig`] for parse and
    /// validation failures, [`Error::MissingRequiredField`] for absent
    /// required fields.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let yaml = std::fs::read_to_string(path)?;
        Self::from_yaml_with(&yaml, EnvOverrides::from_process())
    }

    /// Parses and validates an in-memory YAML document, applying process
    /// environment overrides.
    ///
    /// # Errors
    ///
    /// Same as [`Config::load`].
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Self::from_yaml_with(yaml, EnvOverrides::from_process())
    }

    fn from_yaml_with(yaml: &str, env: EnvOverrides) -> Result<Self> {
        let value: serde_yaml::Value = serde_yaml::from_str(yaml)
            .map_err(|e| Error::invalid_config(format!("YAML parse failed: {e}")))?;
        check_unknown_keys(&value)?;
        let raw: RawConfig = serde_yaml::from_value(value)
            .map_err(|e| Error::invalid_config(format!("YAML decode failed: {e}")))?;
        Self::assemble(raw, env)
    }

    fn assemble(raw: RawConfig, env: EnvOverrides) -> Result<Self> {
        let spire = raw.spire.unwrap_or_default();
        let socket = env
            .socket
            .clone()
            .or(spire.workload_socket)
            .or_else(default_socket)
            .ok_or(Error::MissingRequiredField("spire.workload_socket"))?;
        let socket = validate_socket(&socket)?;

        let initial_fetch_timeout = match spire.initial_fetch_timeout {
            Some(text) => parse_duration(&text)?,
            None => DEFAULT_INITIAL_FETCH_TIMEOUT,
        };
        if initial_fetch_timeout.is_zero() {
            return Err(Error::invalid_config("spire.initial_fetch_timeout must be > 0"));
        }

        let server = build_server(raw.server, &env)?;
        let client = build_client(raw.client)?;

        Ok(Self {
            spire: SpireSettings { workload_socket: socket, initial_fetch_timeout },
            server,
            client,
            timeouts: HttpTimeouts::default(),
        })
    }
}

fn default_socket() -> Option<String> {
    #[cfg(feature = "insecure-dev")]
    {
        Some(DEV_DEFAULT_SOCKET.to_owned())
    }
    #[cfg(not(feature = "insecure-dev"))]
    {
        None
    }
}

fn validate_socket(address: &str) -> Result<String> {
    if address.starts_with("tcp://") {
        // Kernel-credential attestation is meaningless over TCP; refuse
        // instead of silently weakening the trust model.
        return Err(Error::invalid_config(
            "tcp:// workload API endpoints are not supported, use a unix socket path",
        ));
    }
    let path = normalize_socket_path(address);
    if path.is_empty() {
        return Err(Error::MissingRequiredField("spire.workload_socket"));
    }
    if !path.starts_with('/') && !path.starts_with('@') {
        return Err(Error::invalid_config(format!(
            "spire.workload_socket {path:?} must be absolute or @-abstract"
        )));
    }
    Ok(path.to_owned())
}

fn build_server(raw: Option<RawServer>, env: &EnvOverrides) -> Result<Option<ServerSettings>> {
    let env_touches_server =
        env.http_address.is_some() || env.http_enabled.is_some() || env.auth_policy.is_some();
    let Some(raw) = raw.or_else(|| env_touches_server.then(RawServer::default)) else {
        return Ok(None);
    };

    let listen_addr = env
        .http_address
        .clone()
        .or(raw.listen_addr)
        .ok_or(Error::MissingRequiredField("server.listen_addr"))?;
    if listen_addr.is_empty() {
        return Err(Error::invalid_config("server.listen_addr must not be empty"));
    }

    let authorizer = match &env.auth_policy {
        Some(policy) => authorizer_from_env(policy, env)?,
        None => authorizer_from_pair(
            "server.allowed_client_spiffe_id",
            raw.allowed_client_spiffe_id.as_deref(),
            "server.allowed_client_trust_domain",
            raw.allowed_client_trust_domain.as_deref(),
        )?,
    };

    Ok(Some(ServerSettings {
        listen_addr,
        enabled: env.http_enabled.unwrap_or(raw.enabled.unwrap_or(true)),
        authorizer,
    }))
}

fn build_client(raw: Option<RawClient>) -> Result<Option<ClientSettings>> {
    let Some(raw) = raw else { return Ok(None) };
    let authorizer = authorizer_from_pair(
        "client.expected_server_spiffe_id",
        raw.expected_server_spiffe_id.as_deref(),
        "client.expected_server_trust_domain",
        raw.expected_server_trust_domain.as_deref(),
    )?;
    Ok(Some(ClientSettings { authorizer }))
}

/// Exactly one of the id/trust-domain pair must be set.
fn authorizer_from_pair(
    id_field: &'static str,
    id: Option<&str>,
    td_field: &'static str,
    td: Option<&str>,
) -> Result<Authorizer> {
    match (id, td) {
        (Some(_), Some(_)) => Err(Error::invalid_config(format!(
            "{id_field} and {td_field} are mutually exclusive"
        ))),
        (Some(id), None) => Ok(Authorizer::specific(SpiffeId::parse(id)?)),
        (None, Some(td)) => Ok(Authorizer::member_of(TrustDomain::new(td)?)),
        (None, None) => Err(Error::invalid_config(format!(
            "exactly one of {id_field} or {td_field} must be set"
        ))),
    }
}

fn authorizer_from_env(policy: &str, env: &EnvOverrides) -> Result<Authorizer> {
    match policy {
        "specific-id" => {
            let id = env
                .allowed_client_id
                .as_deref()
                .and_then(|ids| ids.split(',').next())
                .ok_or(Error::MissingRequiredField(ENV_ALLOWED_CLIENT_ID))?;
            Ok(Authorizer::specific(SpiffeId::parse(id.trim())?))
        }
        "one-of" => {
            let ids = env
                .allowed_client_id
                .as_deref()
                .ok_or(Error::MissingRequiredField(ENV_ALLOWED_CLIENT_ID))?
                .split(',')
                .map(|id| SpiffeId::parse(id.trim()))
                .collect::<Result<Vec<_>>>()?;
            Authorizer::one_of(ids)
        }
        "trust-domain" => {
            let td = env
                .auth_trust_domain
                .as_deref()
                .ok_or(Error::MissingRequiredField(ENV_AUTH_TRUST_DOMAIN))?;
            Ok(Authorizer::member_of(TrustDomain::new(td)?))
        }
        "any" => any_authorizer(),
        other => Err(Error::invalid_config(format!(
            "{ENV_AUTH_POLICY} {other:?} is not one of any, trust-domain, specific-id, one-of"
        ))),
    }
}

#[cfg(feature = "insecure-dev")]
fn any_authorizer() -> Result<Authorizer> {
    Ok(Authorizer::any())
}

#[cfg(not(feature = "insecure-dev"))]
fn any_authorizer() -> Result<Authorizer> {
    Err(Error::invalid_config("auth policy \"any\" is not available in production builds"))
}

/// Parses durations with `ms|s|m|h` suffixes, e.g. `"30s"`, `"500ms"`.
///
/// # Errors
///
/// [`Error::InvalidConfig`] for anything else.
pub fn parse_duration(text: &str) -> Result<Duration> {
    let text = text.trim();
    let split = text
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| Error::invalid_config(format!("duration {text:?} is missing a unit")))?;
    let (digits, unit) = text.split_at(split);
    let value: u64 = digits
        .parse()
        .map_err(|_| Error::invalid_config(format!("duration {text:?} has no numeric value")))?;
    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 3600)),
        _ => Err(Error::invalid_config(format!(
            "duration {text:?} has unknown unit {unit:?} (expected ms, s, m, or h)"
        ))),
    }
}

fn check_unknown_keys(value: &serde_yaml::Value) -> Result<()> {
    let known: &[(&str, &[&str])] = &[
        ("spire", &["workload_socket", "initial_fetch_timeout"]),
        (
            "server",
            &["listen_addr", "enabled", "allowed_client_spiffe_id", "allowed_client_trust_domain"],
        ),
        ("client", &["expected_server_spiffe_id", "expected_server_trust_domain"]),
    ];
    let Some(top) = value.as_mapping() else { return Ok(()) };
    let sections: BTreeSet<&str> = known.iter().map(|(k, _)| *k).collect();
    for (key, section_value) in top {
        let Some(key) = key.as_str() else {
            return unknown_key(&format!("{key:?}"));
        };
        if !sections.contains(key) {
            return unknown_key(key);
        }
        let fields = known.iter().find(|(k, _)| *k == key).map(|(_, f)| *f).unwrap_or(&[]);
        if let Some(mapping) = section_value.as_mapping() {
            for (field, _) in mapping {
                match field.as_str() {
                    Some(name) if fields.contains(&name) => {}
                    Some(name) => return unknown_key(&format!("{key}.{name}")),
                    None => return unknown_key(&format!("{key}.{field:?}")),
                }
            }
        }
    }
    Ok(())
}

#[cfg(feature = "insecure-dev")]
fn unknown_key(key: &str) -> Result<()> {
    tracing::warn!(key, "ignoring unknown configuration key");
    Ok(())
}

#[cfg(not(feature = "insecure-dev"))]
fn unknown_key(key: &str) -> Result<()> {
    Err(Error::invalid_config(format!("unknown configuration key {key:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
spire:
  workload_socket: unix:///tmp/spire-agent/public/api.sock
  initial_fetch_timeout: 30s
server:
  listen_addr: ":8443"
  allowed_client_trust_domain: "example.org"
client:
  expected_server_spiffe_id: "spiffe://example.org/server"
"#;

    #[test]
    fn parses_the_documented_schema() {
        let config = Config::from_yaml_with(FULL, EnvOverrides::default()).unwrap();
        assert_eq!(config.spire.workload_socket, "/tmp/spire-agent/public/api.sock");
        assert_eq!(config.spire.initial_fetch_timeout, Duration::from_secs(30));

        let server = config.server.unwrap();
        assert_eq!(server.listen_addr, ":8443");
        assert!(server.enabled);
        assert_eq!(
            server.authorizer,
            Authorizer::member_of(TrustDomain::new("example.org").unwrap())
        );

        let client = config.client.unwrap();
        assert_eq!(
            client.authorizer,
            Authorizer::specific(SpiffeId::parse("spiffe://example.org/server").unwrap())
        );
    }

    #[test]
    fn duration_suffixes() {
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert!(parse_duration("30").is_err());
        assert!(parse_duration("s").is_err());
        assert!(parse_duration("10d").is_err());
    }

    #[test]
    fn both_policies_on_one_side_are_rejected() {
        let yaml = r#"
spire:
  workload_socket: /run/agent.sock
server:
  listen_addr: ":8443"
  allowed_client_spiffe_id: "spiffe://example.org/client"
  allowed_client_trust_domain: "example.org"
"#;
        let err = Config::from_yaml_with(yaml, EnvOverrides::default()).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn neither_policy_is_rejected() {
        let yaml = r#"
spire:
  workload_socket: /run/agent.sock
client: {}
"#;
        let err = Config::from_yaml_with(yaml, EnvOverrides::default()).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn tcp_endpoints_are_refused() {
        let yaml = "spire:\n  workload_socket: tcp://127.0.0.1:9000\n";
        let err = Config::from_yaml_with(yaml, EnvOverrides::default()).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn env_socket_beats_file() {
        let env = EnvOverrides {
            socket: Some("unix:///run/override.sock".into()),
            ..EnvOverrides::default()
        };
        let config = Config::from_yaml_with(FULL, env).unwrap();
        assert_eq!(config.spire.workload_socket, "/run/override.sock");
    }

    #[test]
    fn env_auth_policy_overrides_file() {
        let env = EnvOverrides {
            auth_policy: Some("one-of".into()),
            allowed_client_id: Some(
                "spiffe://example.org/a, spiffe://example.org/b".into(),
            ),
            ..EnvOverrides::default()
        };
        let config = Config::from_yaml_with(FULL, env).unwrap();
        let server = config.server.unwrap();
        assert!(matches!(server.authorizer, Authorizer::OneOf(ref ids) if ids.len() == 2));
    }

    #[test]
    fn env_can_disable_the_server() {
        let env = EnvOverrides { http_enabled: Some(false), ..EnvOverrides::default() };
        let config = Config::from_yaml_with(FULL, env).unwrap();
        assert!(!config.server.unwrap().enabled);
    }

    #[cfg(not(feature = "insecure-dev"))]
    #[test]
    fn unknown_keys_are_rejected_in_production() {
        let yaml = "spire:\n  workload_socket: /run/agent.sock\n  surprise: 1\n";
        let err = Config::from_yaml_with(yaml, EnvOverrides::default()).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[cfg(not(feature = "insecure-dev"))]
    #[test]
    fn any_policy_is_unavailable_in_production() {
        let env = EnvOverrides { auth_policy: Some("any".into()), ..EnvOverrides::default() };
        let err = Config::from_yaml_with(FULL, env).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn missing_socket_is_a_missing_field() {
        let yaml = "client:\n  expected_server_trust_domain: example.org\n";
        let result = Config::from_yaml_with(yaml, EnvOverrides::default());
        #[cfg(feature = "insecure-dev")]
        assert!(result.is_ok());
        #[cfg(not(feature = "insecure-dev"))]
        assert!(matches!(result, Err(Error::MissingRequiredField(_))));
    }
}
