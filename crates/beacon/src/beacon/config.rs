use std::{
    fs,
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use directories::ProjectDirs;
use serde::Deserialize;

use crate::beacon::protocol::status::{PlayerSample, StatusTemplate};

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
    let explicit = explicit_flag_path
        .map(|p| (p, ConfigPathSource::Flag))
        .or_else(|| {
            std::env::var_os("BEACON_CONFIG")
                .filter(|v| !v.is_empty())
                .map(|v| (PathBuf::from(v), ConfigPathSource::Env))
        });

    if let Some((path, source)) = explicit {
        return Ok(ResolvedConfigPath {
            path: normalize_explicit_path(&path)?,
            source,
        });
    }

    if let Some(path) = discover_config_path(Path::new(".")) {
        return Ok(ResolvedConfigPath {
            path,
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

    match fs::metadata(p) {
        Ok(m) if m.is_dir() => {
            Ok(discover_config_path(p).unwrap_or_else(|| p.join("beacon.toml")))
        }
        Ok(_) => Ok(p.to_path_buf()),
        Err(_) => {
            // Not created yet: pin the extension so the template writer
            // knows which format to emit.
            let mut out = p.to_path_buf();
            if out.extension().is_none() {
                out.set_extension("toml");
            }
            Ok(out)
        }
    }
}

/// Looks for a beacon config in `dir`, preferring TOML over YAML.
fn discover_config_path(dir: &Path) -> Option<PathBuf> {
    ["beacon.toml", "beacon.yaml", "beacon.yml"]
        .into_iter()
        .map(|name| dir.join(name))
        .find(|p| p.is_file())
        .inspect(|p| tracing::debug!(path = %p.display(), "config: discovered config file"))
}

fn default_config_path() -> anyhow::Result<PathBuf> {
    let proj =
        ProjectDirs::from("org", "beacon", "beacon").context("config: resolve user config dir")?;
    Ok(proj.config_dir().join("beacon.toml"))
}

/// Writes the commented default config if nothing exists at `path` yet.
/// Returns whether a file was created.
pub fn ensure_config_file(path: &Path) -> anyhow::Result<bool> {
    if path.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }

    match fs::metadata(path) {
        Ok(m) if m.is_file() => return Ok(false),
        Ok(_) => anyhow::bail!("config: {} exists but is not a regular file", path.display()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err).with_context(|| format!("config: stat {}", path.display())),
    }

    let template = default_config_template_for_path(path)?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("config: mkdir {}", parent.display()))?;
    }

    // create_new keeps a concurrent writer from clobbering the file.
    fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .and_then(|mut f| {
            use std::io::Write;
            f.write_all(template.as_bytes())
        })
        .with_context(|| format!("config: create {}", path.display()))?;
    Ok(true)
}

fn default_config_template_for_path(path: &Path) -> anyhow::Result<&'static str> {
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    match ext.as_str() {
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

    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    parse_config(&s, &ext).with_context(|| format!("parse {}", path.display()))
}

fn parse_config(s: &str, ext: &str) -> anyhow::Result<Config> {
    let fc: FileConfig = match ext {
        "toml" => toml::from_str(s).context("parse toml")?,
        "yaml" | "yml" => serde_yaml::from_str(s).context("parse yaml")?,
        _ => anyhow::bail!("config: unsupported config extension {ext}"),
    };
    Config::from_file_config(fc)
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Bind addresses, validated at load time.
    pub listeners: Vec<SocketAddr>,
    pub gateway_workers: usize,
    pub timeouts: Timeouts,
    pub logging: LoggingConfig,
    pub servers: Vec<ServerConfig>,
}

#[derive(Debug, Clone)]
pub struct Timeouts {
    /// Deadline for the gateway's single handshake read.
    pub handshake_timeout: Duration,
    /// Deadline for server-worker reads (status request, login start, ping).
    pub request_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub add_source: bool,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub hostname: String,
    pub upstream: String,
    pub instances: usize,
    pub dial_timeout: Duration,
    pub online_status: StatusTemplate,
    pub offline_status: StatusTemplate,
}

#[derive(Debug, Deserialize)]
struct FileConfig {
    listener: Option<StringOrVec>,
    listeners: Option<StringOrVec>,

    #[serde(default)]
    gateway_workers: i64,

    timeouts: Option<FileTimeouts>,

    logging: Option<FileLogging>,

    #[serde(default)]
    servers: Vec<FileServer>,
}

#[derive(Debug, Deserialize)]
struct FileTimeouts {
    handshake_timeout_ms: Option<i64>,
    request_timeout_ms: Option<i64>,
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
struct FileServer {
    hostname: Option<String>,
    domain: Option<String>,

    upstream: Option<String>,
    proxy_to: Option<String>,

    instances: Option<i64>,

    dial_timeout: Option<String>,
    dial_timeout_ms: Option<i64>,

    online_status: Option<FileStatus>,
    offline_status: Option<FileStatus>,
}

#[derive(Debug, Deserialize, Default, Clone)]
struct FileStatus {
    version_name: Option<String>,
    protocol: Option<i64>,
    max_players: Option<i64>,
    players_online: Option<i64>,
    description: Option<String>,
    favicon: Option<String>,
    #[serde(default)]
    sample: Vec<FileSampleEntry>,
}

#[derive(Debug, Deserialize, Clone)]
struct FileSampleEntry {
    name: String,
    #[serde(alias = "id")]
    uuid: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(untagged)]
enum StringOrVec {
    One(String),
    Many(Vec<String>),
}

impl StringOrVec {
    fn into_vec(self) -> Vec<String> {
        match self {
            StringOrVec::One(s) => vec![s],
            StringOrVec::Many(v) => v,
        }
    }
}

const DEFAULT_LISTEN_ADDR: &str = ":25565";
const DEFAULT_GATEWAY_WORKERS: usize = 4;
const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(500);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(5000);
const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_millis(5000);

impl Config {
    fn from_file_config(fc: FileConfig) -> anyhow::Result<Config> {
        let mut raw_listeners: Vec<String> = Vec::new();
        if let Some(l) = fc.listeners {
            raw_listeners.extend(l.into_vec());
        }
        if raw_listeners.is_empty() {
            if let Some(l) = fc.listener {
                raw_listeners.extend(l.into_vec());
            }
        }
        raw_listeners.retain(|s| !s.trim().is_empty());
        if raw_listeners.is_empty() {
            raw_listeners.push(DEFAULT_LISTEN_ADDR.to_string());
        }
        let mut listeners = Vec::with_capacity(raw_listeners.len());
        for l in &raw_listeners {
            listeners.push(parse_bind_addr(l)?);
        }

        let gateway_workers = if fc.gateway_workers > 0 {
            fc.gateway_workers as usize
        } else {
            DEFAULT_GATEWAY_WORKERS
        };

        let timeouts = Timeouts {
            handshake_timeout: fc
                .timeouts
                .as_ref()
                .and_then(|t| t.handshake_timeout_ms)
                .filter(|ms| *ms > 0)
                .map(|ms| Duration::from_millis(ms as u64))
                .unwrap_or(DEFAULT_HANDSHAKE_TIMEOUT),
            request_timeout: fc
                .timeouts
                .as_ref()
                .and_then(|t| t.request_timeout_ms)
                .filter(|ms| *ms > 0)
                .map(|ms| Duration::from_millis(ms as u64))
                .unwrap_or(DEFAULT_REQUEST_TIMEOUT),
        };

        let mut logging = LoggingConfig {
            level: "info".into(),
            format: "text".into(),
            output: "stderr".into(),
            add_source: false,
        };
        if let Some(l) = &fc.logging {
            if let Some(level) = &l.level {
                if !level.trim().is_empty() {
                    logging.level = level.trim().to_string();
                }
            }
            if let Some(fmt) = &l.format {
                if !fmt.trim().is_empty() {
                    logging.format = fmt.trim().to_string();
                }
            }
            if let Some(out) = &l.output {
                if !out.trim().is_empty() {
                    logging.output = out.trim().to_string();
                }
            }
            logging.add_source = l.add_source;
        }

        let mut servers = Vec::with_capacity(fc.servers.len());
        for (i, srv) in fc.servers.into_iter().enumerate() {
            servers.push(
                ServerConfig::from_file_server(srv)
                    .with_context(|| format!("config: servers[{i}]"))?,
            );
        }

        Ok(Config {
            listeners,
            gateway_workers,
            timeouts,
            logging,
            servers,
        })
    }
}

impl ServerConfig {
    fn from_file_server(file: FileServer) -> anyhow::Result<ServerConfig> {
        let hostname = file
            .hostname
            .or(file.domain)
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        if hostname.is_empty() {
            anyhow::bail!("missing hostname");
        }

        let upstream = file
            .upstream
            .or(file.proxy_to)
            .unwrap_or_default()
            .trim()
            .to_string();
        if upstream.is_empty() {
            anyhow::bail!("missing upstream");
        }

        let instances = match file.instances {
            Some(n) if n >= 1 => n as usize,
            Some(n) => anyhow::bail!("instances must be >= 1 (got {n})"),
            None => 1,
        };

        let dial_timeout =
            parse_duration_field(file.dial_timeout.as_deref(), file.dial_timeout_ms)
                .context("invalid dial_timeout")?
                .unwrap_or(DEFAULT_DIAL_TIMEOUT);

        let online_status = status_template(file.online_status.unwrap_or_default(), "");
        let offline_status = status_template(
            file.offline_status.unwrap_or_default(),
            "Server is offline.",
        );

        Ok(ServerConfig {
            hostname,
            upstream,
            instances,
            dial_timeout,
            online_status,
            offline_status,
        })
    }
}

fn status_template(file: FileStatus, default_description: &str) -> StatusTemplate {
    StatusTemplate {
        version_name: file.version_name.unwrap_or_else(|| "1.20.4".into()),
        protocol_number: file.protocol.map(|p| p as i32).unwrap_or(765),
        max_players: file.max_players.map(|p| p as i32).unwrap_or(0),
        players_online: file.players_online.map(|p| p as i32).unwrap_or(0),
        description: file
            .description
            .unwrap_or_else(|| default_description.to_string()),
        favicon: file.favicon.filter(|f| !f.trim().is_empty()),
        sample: file
            .sample
            .into_iter()
            .map(|s| PlayerSample {
                name: s.name,
                id: s.uuid.unwrap_or_default(),
            })
            .collect(),
    }
}

/// Parses a bind address, accepting the common `":PORT"` shorthand for
/// "all interfaces". Rejecting junk here keeps bind failures out of the
/// serving path entirely.
fn parse_bind_addr(raw: &str) -> anyhow::Result<SocketAddr> {
    let raw = raw.trim();
    let full = if raw.starts_with(':') {
        format!("0.0.0.0{raw}")
    } else {
        raw.to_string()
    };
    full.parse()
        .with_context(|| format!("config: invalid listen address {raw:?}"))
}

/// Accepts either a humantime string ("500ms", "5s") or a millisecond count.
fn parse_duration_field(
    text: Option<&str>,
    ms: Option<i64>,
) -> anyhow::Result<Option<Duration>> {
    if let Some(s) = text {
        let s = s.trim();
        if !s.is_empty() {
            return Ok(Some(humantime::parse_duration(s)?));
        }
    }
    if let Some(ms) = ms {
        if ms < 0 {
            anyhow::bail!("negative duration");
        }
        return Ok(Some(Duration::from_millis(ms as u64)));
    }
    Ok(None)
}

const DEFAULT_CONFIG_TEMPLATE_TOML: &str = r#"# Beacon configuration (auto-generated)
#
# This file was created because Beacon could not find a configuration file at
# the resolved config path. It routes one hostname to a local server; edit the
# entries below to match your setup.

# One or more bind addresses, all feeding the same proxy pipeline.
listeners = [":25565"]

# Workers that parse handshakes and route connections.
gateway_workers = 4

[timeouts]
handshake_timeout_ms = 500
request_timeout_ms = 5000

[logging]
level = "info"
format = "text" # text | json
output = "stderr" # stderr | stdout | discard | <file path>
add_source = false

[[servers]]
hostname = "localhost"
upstream = "127.0.0.1:25560"
instances = 1
dial_timeout = "5s"

[servers.offline_status]
version_name = "1.20.4"
protocol = 765
max_players = 0
players_online = 0
description = "Server is offline."
"#;

const DEFAULT_CONFIG_TEMPLATE_YAML: &str = r#"# Beacon configuration (auto-generated)
#
# This file was created because Beacon could not find a configuration file at
# the resolved config path. It routes one hostname to a local server; edit the
# entries below to match your setup.

listeners:
  - ":25565"

gateway_workers: 4

timeouts:
  handshake_timeout_ms: 500
  request_timeout_ms: 5000

logging:
  level: "info"
  format: "text" # text | json
  output: "stderr" # stderr | stdout | discard | <file path>
  add_source: false

servers:
  - hostname: "localhost"
    upstream: "127.0.0.1:25560"
    instances: 1
    dial_timeout: "5s"
    offline_status:
      version_name: "1.20.4"
      protocol: 765
      max_players: 0
      players_online: 0
      description: "Server is offline."
"#;
