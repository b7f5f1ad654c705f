use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use base64::Engine;
#[cfg(not(target_os = "linux"))]
use directories::ProjectDirs;
use serde::Deserialize;

use crate::holepunch::portforward::direct::DEFAULT_DIAL_TIMEOUT;

pub const CONFIG_ENV: &str = "HOLEPUNCH_CONFIG";
pub const HOSTKEY_ENV: &str = "SSH_HOSTKEY";
pub const CLIENT_PUBKEY_ENV: &str = "CLIENT_PUBKEY";

#[derive(Debug, Clone)]
pub struct ResolvedConfigPath {
    pub path: PathBuf,
    pub source: ConfigPathSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
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

impl ConfigPathSource {
    /// Paths the operator named explicitly must exist; discovered ones may not.
    fn is_explicit(self) -> bool {
        matches!(self, ConfigPathSource::Flag | ConfigPathSource::Env)
    }
}

pub fn resolve_config_path(explicit_flag_path: Option<PathBuf>) -> anyhow::Result<ResolvedConfigPath> {
    if let Some(p) = explicit_flag_path {
        return Ok(ResolvedConfigPath {
            path: normalize_explicit_path(&p)?,
            source: ConfigPathSource::Flag,
        });
    }

    // clap already maps HOLEPUNCH_CONFIG into the flag, but keep the precedence
    // visible for callers that build the path themselves.
    if let Some(p) = std::env::var_os(CONFIG_ENV) {
        if !p.is_empty() {
            return Ok(ResolvedConfigPath {
                path: normalize_explicit_path(Path::new(&p))?,
                source: ConfigPathSource::Env,
            });
        }
    }

    if let Some(p) = discover_config_path(Path::new(".")) {
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

    if fs::metadata(p).is_ok_and(|m| m.is_dir()) {
        return Ok(discover_config_path(p).unwrap_or_else(|| p.join("holepunch.toml")));
    }
    Ok(p.to_path_buf())
}

fn discover_config_path(dir: &Path) -> Option<PathBuf> {
    ["holepunch.toml", "holepunch.yaml", "holepunch.yml"]
        .into_iter()
        .map(|c| dir.join(c))
        .find(|p| fs::metadata(p).is_ok_and(|m| m.is_file()))
}

fn default_config_path() -> anyhow::Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        return Ok(PathBuf::from("/etc/holepunch/holepunch.toml"));
    }

    #[cfg(not(target_os = "linux"))]
    {
        let proj = ProjectDirs::from("dev", "holepunch", "holepunch")
            .context("config: resolve user config dir")?;
        Ok(proj.config_dir().join("holepunch.toml"))
    }
}

/// Loads the resolved config. A discovered path that does not exist yields the
/// built-in defaults; an explicitly requested one is an error.
pub fn load_resolved(resolved: &ResolvedConfigPath) -> anyhow::Result<Option<Config>> {
    match fs::metadata(&resolved.path) {
        Ok(_) => load_config(&resolved.path).map(Some),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound && !resolved.source.is_explicit() => Ok(None),
        Err(err) => Err(err).with_context(|| format!("config: stat {}", resolved.path.display())),
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

    let fc: FileConfig = match ext.as_str() {
        "toml" => toml::from_str(&s).with_context(|| format!("parse toml {}", path.display()))?,
        "yaml" | "yml" => serde_yaml::from_str(&s).with_context(|| format!("parse yaml {}", path.display()))?,
        _ => anyhow::bail!("config: unsupported config extension {:?} (expected .toml or .yaml/.yml)", ext),
    };

    Config::from_file_config(fc)
}

#[derive(Debug, Clone)]
pub struct Config {
    pub ssh: SshConfig,
    pub http: HttpConfig,
    pub admin_addr: String,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone)]
pub struct SshConfig {
    pub username: String,
    pub host_key_file: String,
    pub client_pubkey: String,
    /// Empty disables SSH over raw TCP.
    pub tcp_listen: String,
    pub websocket: bool,
    /// Zero disables the timeout.
    pub inactivity_timeout: Duration,
    pub keepalive_interval: Duration,
    pub auth_rejection_time: Duration,
    pub direct_dial_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub listen_addr: String,
    pub ssh_path: String,
    pub reverse_proxy: bool,
    pub disallowed_ports: Vec<u16>,
    /// Keep-alive period for sockets accepted by the HTTP listener and by the
    /// SSH-over-TCP listener. Zero leaves keep-alive off.
    pub tcp_keepalive: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub add_source: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            ssh: SshConfig {
                username: "hp".into(),
                host_key_file: String::new(),
                client_pubkey: String::new(),
                tcp_listen: String::new(),
                websocket: false,
                inactivity_timeout: Duration::ZERO,
                keepalive_interval: Duration::from_secs(15),
                auth_rejection_time: Duration::from_secs(1),
                direct_dial_timeout: DEFAULT_DIAL_TIMEOUT,
            },
            http: HttpConfig {
                listen_addr: ":80".into(),
                ssh_path: "/_ssh".into(),
                reverse_proxy: false,
                disallowed_ports: vec![22, 80, 443, 8080],
                tcp_keepalive: Duration::from_secs(15),
            },
            admin_addr: String::new(),
            logging: LoggingConfig {
                level: "info".into(),
                format: "text".into(),
                output: "stderr".into(),
                add_source: false,
            },
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    ssh: Option<FileSsh>,
    http: Option<FileHttp>,
    #[serde(default)]
    admin_addr: String,
    logging: Option<FileLogging>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileSsh {
    username: Option<String>,
    host_key_file: Option<String>,
    client_pubkey: Option<String>,
    tcp_listen: Option<String>,
    #[serde(default)]
    websocket: bool,
    inactivity_timeout_ms: Option<i64>,
    keepalive_interval_ms: Option<i64>,
    auth_rejection_time_ms: Option<i64>,
    direct_dial_timeout_ms: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileHttp {
    listen_addr: Option<String>,
    ssh_path: Option<String>,
    #[serde(default)]
    reverse_proxy: bool,
    disallowed_ports: Option<Vec<u16>>,
    tcp_keepalive_ms: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileLogging {
    level: Option<String>,
    format: Option<String>,
    output: Option<String>,
    #[serde(default)]
    add_source: bool,
}

fn millis(v: Option<i64>, default: Duration) -> Duration {
    v.map(|ms| Duration::from_millis(ms.max(0) as u64)).unwrap_or(default)
}

fn trimmed(v: Option<String>, default: &str) -> String {
    match v {
        Some(s) if !s.trim().is_empty() => s.trim().to_string(),
        _ => default.to_string(),
    }
}

impl Config {
    fn from_file_config(fc: FileConfig) -> anyhow::Result<Config> {
        let mut cfg = Config::default();
        cfg.admin_addr = fc.admin_addr.trim().to_string();

        if let Some(s) = fc.ssh {
            let d = &cfg.ssh;
            cfg.ssh = SshConfig {
                username: trimmed(s.username, &d.username),
                host_key_file: trimmed(s.host_key_file, ""),
                client_pubkey: trimmed(s.client_pubkey, ""),
                tcp_listen: trimmed(s.tcp_listen, ""),
                websocket: s.websocket,
                inactivity_timeout: millis(s.inactivity_timeout_ms, d.inactivity_timeout),
                keepalive_interval: millis(s.keepalive_interval_ms, d.keepalive_interval),
                auth_rejection_time: millis(s.auth_rejection_time_ms, d.auth_rejection_time),
                direct_dial_timeout: millis(s.direct_dial_timeout_ms, d.direct_dial_timeout),
            };
        }

        if let Some(h) = fc.http {
            let d = &cfg.http;
            cfg.http = HttpConfig {
                listen_addr: trimmed(h.listen_addr, &d.listen_addr),
                ssh_path: trimmed(h.ssh_path, &d.ssh_path),
                reverse_proxy: h.reverse_proxy,
                disallowed_ports: h.disallowed_ports.unwrap_or_else(|| d.disallowed_ports.clone()),
                tcp_keepalive: millis(h.tcp_keepalive_ms, d.tcp_keepalive),
            };
        }

        if !cfg.http.ssh_path.starts_with('/') {
            anyhow::bail!("config: http.ssh_path must start with '/', got {:?}", cfg.http.ssh_path);
        }
        if cfg.ssh.username.is_empty() {
            anyhow::bail!("config: ssh.username must not be empty");
        }

        if let Some(l) = fc.logging {
            let d = &cfg.logging;
            cfg.logging = LoggingConfig {
                level: trimmed(l.level, &d.level).to_ascii_lowercase(),
                format: trimmed(l.format, &d.format).to_ascii_lowercase(),
                output: trimmed(l.output, &d.output),
                add_source: l.add_source,
            };
        }

        Ok(cfg)
    }
}

/// Command-line switches layered over the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub sshd_tcp: Option<String>,
    pub sshd_websocket: bool,
    pub http_reverse_proxy: bool,
}

impl Overrides {
    pub fn apply(&self, cfg: &mut Config) {
        if let Some(addr) = self.sshd_tcp.as_deref().map(str::trim).filter(|a| !a.is_empty()) {
            cfg.ssh.tcp_listen = addr.to_string();
        }
        if self.sshd_websocket {
            cfg.ssh.websocket = true;
        }
        if self.http_reverse_proxy {
            cfg.http.reverse_proxy = true;
        }
    }
}

/// Host private key and authorized client key, as text.
#[derive(Debug, Clone)]
pub struct KeyMaterial {
    pub host_key: String,
    pub client_pubkey: String,
}

impl SshConfig {
    pub fn load_keys(&self) -> anyhow::Result<KeyMaterial> {
        self.load_keys_with(|name| std::env::var(name).ok())
    }

    fn load_keys_with(&self, env: impl Fn(&str) -> Option<String>) -> anyhow::Result<KeyMaterial> {
        let host_key = if !self.host_key_file.is_empty() {
            fs::read_to_string(&self.host_key_file)
                .with_context(|| format!("config: read ssh.host_key_file {}", self.host_key_file))?
        } else {
            let encoded = env(HOSTKEY_ENV)
                .filter(|v| !v.trim().is_empty())
                .with_context(|| format!("config: no host key (set ssh.host_key_file or {HOSTKEY_ENV})"))?;
            let raw = base64::engine::general_purpose::STANDARD
                .decode(encoded.trim())
                .with_context(|| format!("config: decode {HOSTKEY_ENV} as base64"))?;
            String::from_utf8(raw).with_context(|| format!("config: {HOSTKEY_ENV} is not text"))?
        };

        let client_pubkey = if !self.client_pubkey.is_empty() {
            self.client_pubkey.clone()
        } else {
            env(CLIENT_PUBKEY_ENV)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .with_context(|| format!("config: no client key (set ssh.client_pubkey or {CLIENT_PUBKEY_ENV})"))?
        };

        Ok(KeyMaterial { host_key, client_pubkey })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(name: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        p.push(format!("holepunch_cfg_test_{name}_{}_{}", std::process::id(), now));
        std::fs::create_dir_all(&p).expect("mkdir");
        p
    }

    #[test]
    fn toml_sections_override_defaults() {
        let dir = temp_dir("toml");
        let cfg_path = dir.join("holepunch.toml");

        let toml = r#"
admin_addr = ":9090"

[ssh]
username = "tunnel"
tcp_listen = ":2222"
websocket = true
keepalive_interval_ms = 5000

[http]
listen_addr = "127.0.0.1:8000"
reverse_proxy = true
disallowed_ports = [22]

[logging]
level = "DEBUG"
format = "json"
"#;

        std::fs::write(&cfg_path, toml).expect("write");
        let cfg = load_config(&cfg_path).expect("load_config");
        assert_eq!(cfg.admin_addr, ":9090");
        assert_eq!(cfg.ssh.username, "tunnel");
        assert_eq!(cfg.ssh.tcp_listen, ":2222");
        assert!(cfg.ssh.websocket);
        assert_eq!(cfg.ssh.keepalive_interval, Duration::from_secs(5));
        assert_eq!(cfg.ssh.direct_dial_timeout, Duration::from_secs(10));
        assert_eq!(cfg.http.listen_addr, "127.0.0.1:8000");
        assert_eq!(cfg.http.ssh_path, "/_ssh");
        assert_eq!(cfg.http.disallowed_ports, vec![22]);
        assert_eq!(cfg.logging.level, "debug");
        assert_eq!(cfg.logging.format, "json");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn yaml_is_accepted() {
        let dir = temp_dir("yaml");
        let cfg_path = dir.join("holepunch.yaml");

        let yaml = r#"
ssh:
  websocket: true
http:
  ssh_path: "/tunnel"
"#;

        std::fs::write(&cfg_path, yaml).expect("write");
        let cfg = load_config(&cfg_path).expect("load_config");
        assert!(cfg.ssh.websocket);
        assert_eq!(cfg.ssh.username, "hp");
        assert_eq!(cfg.http.ssh_path, "/tunnel");
        assert_eq!(cfg.http.disallowed_ports, vec![22, 80, 443, 8080]);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let dir = temp_dir("unknown");
        let cfg_path = dir.join("holepunch.toml");
        std::fs::write(&cfg_path, "[ssh]\nport = 22\n").expect("write");

        let err = load_config(&cfg_path).unwrap_err();
        assert!(format!("{err:#}").contains("port"), "{err:#}");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_discovered_file_means_defaults_but_explicit_is_an_error() {
        let dir = temp_dir("missing");
        let path = dir.join("holepunch.toml");

        let discovered = ResolvedConfigPath {
            path: path.clone(),
            source: ConfigPathSource::Default,
        };
        assert!(load_resolved(&discovered).expect("defaults").is_none());

        let explicit = ResolvedConfigPath {
            path,
            source: ConfigPathSource::Flag,
        };
        assert!(load_resolved(&explicit).is_err());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn explicit_directory_discovers_config() {
        let dir = temp_dir("dir");
        std::fs::write(dir.join("holepunch.yml"), "admin_addr: \":1\"\n").expect("write");
        assert_eq!(normalize_explicit_path(&dir).unwrap(), dir.join("holepunch.yml"));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn overrides_win_over_file() {
        let mut cfg = Config::default();
        Overrides {
            sshd_tcp: Some(" :2022 ".into()),
            sshd_websocket: true,
            http_reverse_proxy: true,
        }
        .apply(&mut cfg);
        assert_eq!(cfg.ssh.tcp_listen, ":2022");
        assert!(cfg.ssh.websocket);
        assert!(cfg.http.reverse_proxy);
    }

    #[test]
    fn keys_come_from_env_when_not_configured() {
        let ssh = Config::default().ssh;
        let encoded = base64::engine::general_purpose::STANDARD.encode("PRIVATE KEY TEXT");

        let keys = ssh
            .load_keys_with(|name| match name {
                HOSTKEY_ENV => Some(encoded.clone()),
                CLIENT_PUBKEY_ENV => Some("ssh-ed25519 AAAA test\n".into()),
                _ => None,
            })
            .expect("keys");
        assert_eq!(keys.host_key, "PRIVATE KEY TEXT");
        assert_eq!(keys.client_pubkey, "ssh-ed25519 AAAA test");

        let err = ssh.load_keys_with(|_| None).unwrap_err();
        assert!(err.to_string().contains(HOSTKEY_ENV));
    }

    #[test]
    fn host_key_file_takes_precedence() {
        let dir = temp_dir("hostkey");
        let key_path = dir.join("host_key");
        std::fs::write(&key_path, "FROM FILE").expect("write");

        let mut ssh = Config::default().ssh;
        ssh.host_key_file = key_path.display().to_string();
        ssh.client_pubkey = "ssh-ed25519 BBBB".into();

        let keys = ssh.load_keys_with(|_| Some("ignored".into())).expect("keys");
        assert_eq!(keys.host_key, "FROM FILE");
        assert_eq!(keys.client_pubkey, "ssh-ed25519 BBBB");

        let _ = std::fs::remove_dir_all(&dir);
    }
}
