use std::{
    fs,
    net::{Ipv4Addr, Ipv6Addr},
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
#[cfg(not(target_os = "linux"))]
use directories::ProjectDirs;
use serde::Deserialize;

use crate::edgetun::tunnel::transport::parse_transport;

#[derive(Debug, Clone)]
pub struct ResolvedConfigPath {
    pub path: PathBuf,
    pub source: ConfigPathSource,
}

#[derive(Debug, Clone, Copy)]
pub enum ConfigPathSource {
    Flag,
    Env,
    Cwd,
    Default,
}

impl std::fmt::Display for ConfigPathSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigPathSource::Flag => write!(f, "flag"),
            ConfigPathSource::Env => write!(f, "env"),
            ConfigPathSource::Cwd => write!(f, "cwd"),
            ConfigPathSource::Default => write!(f, "default"),
        }
    }
}

pub fn resolve_config_path(
    explicit_flag_path: Option<PathBuf>,
) -> anyhow::Result<ResolvedConfigPath> {
    if let Some(p) = explicit_flag_path {
        let p = normalize_explicit_path(&p)?;
        return Ok(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Flag,
        });
    }

    // clap maps EDGETUN_CONFIG into the flag already; this covers callers that bypass the CLI.
    if let Some(p) = std::env::var_os("EDGETUN_CONFIG") {
        if !p.is_empty() {
            let p = normalize_explicit_path(Path::new(&p))?;
            return Ok(ResolvedConfigPath {
                path: p,
                source: ConfigPathSource::Env,
            });
        }
    }

    if let Ok(p) = discover_config_path(Path::new(".")) {
        return Ok(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Cwd,
        });
    }

    Ok(ResolvedConfigPath {
        path: default_config_path()?,
        source: ConfigPathSource::Default,
    })
}

fn normalize_explicit_path(p: &Path) -> anyhow::Result<PathBuf> {
    if p.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }

    if let Ok(m) = fs::metadata(p) {
        if m.is_dir() {
            if let Ok(discovered) = discover_config_path(p) {
                return Ok(discovered);
            }
            return Ok(p.join("edgetun.toml"));
        }
        return Ok(p.to_path_buf());
    }

    // Non-existent path: default to .toml if no extension.
    let mut out = p.to_path_buf();
    if out.extension().is_none() {
        out.set_extension("toml");
    }
    Ok(out)
}

fn discover_config_path(dir: &Path) -> anyhow::Result<PathBuf> {
    for c in ["edgetun.toml", "edgetun.yaml", "edgetun.yml"] {
        let p = dir.join(c);
        if fs::metadata(&p).is_ok_and(|m| m.is_file()) {
            return Ok(p);
        }
    }
    anyhow::bail!("config: no edgetun.* found")
}

fn default_config_path() -> anyhow::Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        Ok(PathBuf::from("/etc/edgetun/edgetun.toml"))
    }

    #[cfg(not(target_os = "linux"))]
    {
        let proj = ProjectDirs::from("io", "edgetun", "edgetun")
            .context("config: resolve user config dir")?;
        Ok(proj.config_dir().join("edgetun.toml"))
    }
}

/// Writes the default template when `path` does not exist yet. Returns
/// whether a file was created.
pub fn ensure_config_file(path: &Path) -> anyhow::Result<bool> {
    if path.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }

    match fs::metadata(path) {
        Ok(m) => {
            if m.is_file() {
                return Ok(false);
            }
            anyhow::bail!(
                "config: {} exists but is not a regular file",
                path.display()
            );
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err).with_context(|| format!("config: stat {}", path.display())),
    }

    let tmpl = template_for_path(path)?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("config: mkdir {}", parent.display()))?;
        }
    }

    let mut f = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .with_context(|| format!("config: create {}", path.display()))?;
    use std::io::Write;
    f.write_all(tmpl.as_bytes())
        .with_context(|| format!("config: write {}", path.display()))?;
    Ok(true)
}

fn config_ext(path: &Path) -> String {
    path.extension()
        .and_then(|s| s.to_str())
        .unwrap_or("")
        .to_ascii_lowercase()
}

fn template_for_path(path: &Path) -> anyhow::Result<&'static str> {
    match config_ext(path).as_str() {
        "toml" => Ok(DEFAULT_CONFIG_TEMPLATE_TOML),
        "yaml" | "yml" => Ok(DEFAULT_CONFIG_TEMPLATE_YAML),
        _ => anyhow::bail!(
            "config: unsupported config extension {:?} (expected .toml or .yaml/.yml)",
            path.extension()
        ),
    }
}

pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let data = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let s = String::from_utf8_lossy(&data);

    let ext = config_ext(path);
    let fc: FileConfig = match ext.as_str() {
        "toml" => toml::from_str(&s).with_context(|| format!("parse toml {}", path.display()))?,
        "yaml" | "yml" => {
            serde_yaml::from_str(&s).with_context(|| format!("parse yaml {}", path.display()))?
        }
        _ => anyhow::bail!("config: unsupported config extension {}", ext),
    };

    Config::from_file_config(fc)
}

#[derive(Debug, Clone)]
pub struct Config {
    pub admin_addr: String,
    pub logging: LoggingConfig,
    pub client: Option<ClientConfig>,
    pub edge: Option<EdgeConfig>,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub add_source: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "json".into(),
            output: "stderr".into(),
            add_source: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// `ws` | `wss` | `quic` | `tcp`.
    pub transport: String,
    pub url: String,
    pub server_addr: String,
    pub cdn_ip: String,
    pub cdn_port: u16,
    pub server_name: String,
    pub insecure_skip_verify: bool,
    pub pool_size: usize,
    pub retry_interval: Duration,
    pub dial_timeout: Duration,
    pub tunnels: Vec<TunnelConfig>,
}

#[derive(Debug, Clone)]
pub struct TunnelConfig {
    pub listen: String,
    pub remote: String,
    /// `tcp` | `udp`.
    pub protocol: String,
    /// UDP session idle timeout.
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct EdgeConfig {
    pub max_dial_retries: usize,
    pub retry_delay: Duration,
    pub dial_timeout: Duration,
    pub endpoints: Vec<EdgeEndpointConfig>,
    pub egress: EgressConfig,
}

#[derive(Debug, Clone)]
pub struct EdgeEndpointConfig {
    pub listen_addr: String,
    pub transport: String,
    pub quic: QuicServerConfig,
}

#[derive(Debug, Clone, Default)]
pub struct QuicServerConfig {
    pub cert_file: String,
    pub key_file: String,
}

#[derive(Debug, Clone, Default)]
pub struct EgressConfig {
    pub proxy4: bool,
    pub proxy6: bool,
    pub bind_v4: Option<Ipv4Addr>,
    pub bind_v6: Option<Ipv6Addr>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    #[serde(default)]
    admin_addr: String,

    logging: Option<FileLogging>,

    client: Option<FileClient>,

    edge: Option<FileEdge>,
}

#[derive(Debug, Deserialize)]
struct FileLogging {
    level: Option<String>,
    format: Option<String>,
    output: Option<String>,
    #[serde(default)]
    add_source: bool,
}

#[derive(Debug, Deserialize)]
struct FileClient {
    transport: Option<String>,
    url: Option<String>,
    server_addr: Option<String>,
    cdn_ip: Option<String>,
    cdn_port: Option<u16>,
    server_name: Option<String>,
    #[serde(default)]
    insecure_skip_verify: bool,
    pool_size: Option<i64>,
    retry_interval_ms: Option<i64>,
    dial_timeout_ms: Option<i64>,
    #[serde(default)]
    tunnels: Vec<FileTunnel>,
}

#[derive(Debug, Deserialize)]
struct FileTunnel {
    listen: String,
    remote: String,
    protocol: Option<String>,
    timeout: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct FileEdge {
    max_dial_retries: Option<i64>,
    retry_delay_ms: Option<i64>,
    dial_timeout_ms: Option<i64>,
    #[serde(default)]
    endpoints: Vec<FileEdgeEndpoint>,
    egress: Option<FileEgress>,
}

#[derive(Debug, Deserialize)]
struct FileEdgeEndpoint {
    listen_addr: String,
    transport: Option<String>,
    quic: Option<FileQuicServer>,
}

#[derive(Debug, Deserialize)]
struct FileQuicServer {
    cert_file: Option<String>,
    key_file: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FileEgress {
    #[serde(default)]
    proxy4: bool,
    #[serde(default)]
    proxy6: bool,
    bind_v4: Option<String>,
    bind_v6: Option<String>,
}

fn trimmed(s: &Option<String>) -> String {
    s.as_deref().unwrap_or_default().trim().to_string()
}

fn millis(v: Option<i64>, default_ms: u64) -> Duration {
    match v {
        Some(ms) if ms > 0 => Duration::from_millis(ms as u64),
        _ => Duration::from_millis(default_ms),
    }
}

impl Config {
    fn from_file_config(fc: FileConfig) -> anyhow::Result<Config> {
        let mut cfg = Config {
            admin_addr: fc.admin_addr.trim().to_string(),
            logging: LoggingConfig::default(),
            client: None,
            edge: None,
        };

        // --- Logging ---
        if let Some(l) = &fc.logging {
            let level = trimmed(&l.level);
            if !level.is_empty() {
                cfg.logging.level = level;
            }
            let format = trimmed(&l.format);
            if !format.is_empty() {
                cfg.logging.format = format;
            }
            let output = trimmed(&l.output);
            if !output.is_empty() {
                cfg.logging.output = output;
            }
            cfg.logging.add_source = l.add_source;
        }

        if let Some(c) = &fc.client {
            cfg.client = Some(ClientConfig::from_file(c)?);
        }
        if let Some(e) = &fc.edge {
            cfg.edge = Some(EdgeConfig::from_file(e)?);
        }

        if cfg.client.is_none() && cfg.edge.is_none() {
            anyhow::bail!("config: nothing to run (configure [client] and/or [edge])");
        }
        Ok(cfg)
    }
}

impl ClientConfig {
    fn from_file(c: &FileClient) -> anyhow::Result<Self> {
        let cdn_port = c.cdn_port.filter(|p| *p != 0).unwrap_or(443);
        let transport = match trimmed(&c.transport).to_ascii_lowercase() {
            t if t.is_empty() => {
                if cdn_port == 80 {
                    "ws".to_string()
                } else {
                    "wss".to_string()
                }
            }
            t => t,
        };

        let url = trimmed(&c.url);
        let server_addr = trimmed(&c.server_addr);
        match transport.as_str() {
            "ws" | "wss" => {
                if url.is_empty() {
                    anyhow::bail!("config: client.url is required for transport {transport}");
                }
            }
            "quic" | "tcp" => {
                if server_addr.is_empty() {
                    anyhow::bail!(
                        "config: client.server_addr is required for transport {transport}"
                    );
                }
            }
            other => anyhow::bail!(
                "config: client.transport {other:?} (expected ws|wss|quic|tcp)"
            ),
        }

        let mut tunnels = Vec::with_capacity(c.tunnels.len());
        for (i, t) in c.tunnels.iter().enumerate() {
            let listen = t.listen.trim().to_string();
            let remote = t.remote.trim().to_string();
            if listen.is_empty() {
                anyhow::bail!("config: client.tunnels[{i}] missing listen");
            }
            if remote.is_empty() {
                anyhow::bail!("config: client.tunnels[{i}] missing remote");
            }
            let protocol = match trimmed(&t.protocol).to_ascii_lowercase() {
                p if p.is_empty() => "tcp".to_string(),
                p if p == "tcp" || p == "udp" => p,
                p => anyhow::bail!("config: client.tunnels[{i}] protocol {p:?} (expected tcp|udp)"),
            };
            let secs = t.timeout.unwrap_or(0);
            tunnels.push(TunnelConfig {
                listen,
                remote,
                protocol,
                timeout: Duration::from_secs(if secs < 1 { 30 } else { secs as u64 }),
            });
        }

        Ok(Self {
            transport,
            url,
            server_addr,
            cdn_ip: trimmed(&c.cdn_ip),
            cdn_port,
            server_name: trimmed(&c.server_name),
            insecure_skip_verify: c.insecure_skip_verify,
            pool_size: c.pool_size.map(|n| n.max(0) as usize).unwrap_or(30),
            retry_interval: millis(c.retry_interval_ms, 500),
            dial_timeout: millis(c.dial_timeout_ms, 5000),
            tunnels,
        })
    }
}

impl EdgeConfig {
    fn from_file(e: &FileEdge) -> anyhow::Result<Self> {
        let mut endpoints = Vec::with_capacity(e.endpoints.len());
        for (i, ep) in e.endpoints.iter().enumerate() {
            let listen_addr = ep.listen_addr.trim().to_string();
            if listen_addr.is_empty() {
                anyhow::bail!("config: edge.endpoints[{i}] missing listen_addr");
            }
            let transport = parse_transport(ep.transport.as_deref().unwrap_or_default())
                .with_context(|| format!("config: edge.endpoints[{i}]"))?;
            endpoints.push(EdgeEndpointConfig {
                listen_addr,
                transport,
                quic: QuicServerConfig {
                    cert_file: ep.quic.as_ref().map(|q| trimmed(&q.cert_file)).unwrap_or_default(),
                    key_file: ep.quic.as_ref().map(|q| trimmed(&q.key_file)).unwrap_or_default(),
                },
            });
        }

        let mut egress = EgressConfig::default();
        if let Some(g) = &e.egress {
            egress.proxy4 = g.proxy4;
            egress.proxy6 = g.proxy6;
            let v4 = trimmed(&g.bind_v4);
            if !v4.is_empty() {
                egress.bind_v4 = Some(
                    v4.parse()
                        .with_context(|| format!("config: edge.egress.bind_v4 {v4:?}"))?,
                );
            }
            let v6 = trimmed(&g.bind_v6);
            if !v6.is_empty() {
                egress.bind_v6 = Some(
                    v6.parse()
                        .with_context(|| format!("config: edge.egress.bind_v6 {v6:?}"))?,
                );
            }
        }

        Ok(Self {
            max_dial_retries: match e.max_dial_retries {
                Some(n) if n > 0 => n as usize,
                _ => 3,
            },
            retry_delay: millis(e.retry_delay_ms, 100),
            dial_timeout: millis(e.dial_timeout_ms, 5000),
            endpoints,
            egress,
        })
    }
}

const DEFAULT_CONFIG_TEMPLATE_TOML: &str = r#"# edgetun configuration (auto-generated)
#
# This file was created because edgetun could not find a configuration file at
# the resolved config path. It starts an edge endpoint that accepts tunnel
# streams over yamux/TCP and dials their destinations directly.
#
# To run the client role, add a [client] table pointing at an edge and list
# the local listeners under [[client.tunnels]].

admin_addr = ":8080"

[edge]
max_dial_retries = 3
retry_delay_ms = 100
dial_timeout_ms = 5000

[[edge.endpoints]]
listen_addr = ":7000"
transport = "tcp" # tcp | quic | ws

[logging]
level = "info"
format = "json"
output = "stderr"
add_source = false
"#;

const DEFAULT_CONFIG_TEMPLATE_YAML: &str = r#"# edgetun configuration (auto-generated)
#
# This file was created because edgetun could not find a configuration file at
# the resolved config path. It starts an edge endpoint that accepts tunnel
# streams over yamux/TCP and dials their destinations directly.
#
# To run the client role, add a client section pointing at an edge and list
# the local listeners under client.tunnels.

admin_addr: ":8080"

edge:
  max_dial_retries: 3
  retry_delay_ms: 100
  dial_timeout_ms: 5000
  endpoints:
    - listen_addr: ":7000"
      transport: "tcp" # tcp | quic | ws

logging:
  level: "info"
  format: "json"
  output: "stderr"
  add_source: false
"#;
