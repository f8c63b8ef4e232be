use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::acl::SubnetFilter;
use crate::error::{Result, TftpError};

/// Server configuration, immutable for the duration of a serving period.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Directory served to clients; must exist and be both readable and
    /// writable (reads serve RRQs, writes store WRQs).
    pub root_dir: PathBuf,

    /// Directory receiving the rotating `tftplog` file; must exist and be
    /// writable.
    pub log_dir: PathBuf,

    /// When true, any client may start a transfer. When false, only clients
    /// inside the `client_ip`/`client_mask` subnet are served.
    pub any_client: bool,

    /// Permitted subnet address, used when `any_client` is false.
    pub client_ip: String,

    /// Permitted subnet mask: a prefix length ("16") or dotted quad.
    pub client_mask: String,

    /// Specific IPv4 address to bind; empty string means every interface.
    pub listen_addr: String,

    /// UDP port to listen on. 69 is the registered TFTP port; 0 asks the
    /// OS for an ephemeral port.
    pub listen_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("/var/lib/petrel/tftproot"),
            log_dir: PathBuf::from("/var/log/petrel"),
            any_client: true,
            client_ip: "192.168.0.0".to_string(),
            client_mask: "16".to_string(),
            listen_addr: String::new(),
            listen_port: 69,
        }
    }
}

impl ServerConfig {
    /// The specific address to bind, or `None` for all interfaces.
    /// `"0.0.0.0"` is normalized to "all interfaces".
    pub fn listen_ip(&self) -> Result<Option<Ipv4Addr>> {
        if self.listen_addr.is_empty() {
            return Ok(None);
        }
        let addr: Ipv4Addr = self.listen_addr.parse().map_err(|_| {
            TftpError::Config(format!("invalid listen_addr '{}'", self.listen_addr))
        })?;
        if addr == Ipv4Addr::UNSPECIFIED {
            return Ok(None);
        }
        Ok(Some(addr))
    }

    /// The socket address the engine binds for a serving period.
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        let ip = self.listen_ip()?.unwrap_or(Ipv4Addr::UNSPECIFIED);
        Ok(SocketAddr::V4(SocketAddrV4::new(ip, self.listen_port)))
    }

    /// The subnet filter to apply to new transfers, or `None` when any
    /// client is allowed.
    pub fn subnet_filter(&self) -> Result<Option<SubnetFilter>> {
        if self.any_client {
            return Ok(None);
        }
        SubnetFilter::new(&self.client_ip, &self.client_mask).map(Some)
    }
}

pub fn load_config(path: &Path) -> Result<ServerConfig> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        TftpError::Config(format!("cannot read config file {}: {}", path.display(), e))
    })?;
    let config: ServerConfig = toml::from_str(&contents).map_err(|e| {
        TftpError::Config(format!("invalid config file {}: {}", path.display(), e))
    })?;
    Ok(config)
}

pub fn write_config(path: &Path, config: &ServerConfig) -> Result<()> {
    let contents = toml::to_string_pretty(config)
        .map_err(|e| TftpError::Config(format!("failed to serialize config: {}", e)))?;
    std::fs::write(path, contents)?;
    Ok(())
}

pub fn write_default_config(path: &Path) -> Result<()> {
    write_config(path, &ServerConfig::default())
}

/// Validate a configuration before handing it to the engine.
pub fn validate_config(config: &ServerConfig) -> Result<()> {
    if !config.root_dir.is_absolute() {
        return Err(TftpError::Config(
            "root_dir must be an absolute path".to_string(),
        ));
    }
    require_directory(&config.root_dir, "root_dir")?;
    if std::fs::read_dir(&config.root_dir).is_err() {
        return Err(TftpError::Config("root_dir is not readable".to_string()));
    }
    require_writable(&config.root_dir, "root_dir")?;

    if !config.log_dir.is_absolute() {
        return Err(TftpError::Config(
            "log_dir must be an absolute path".to_string(),
        ));
    }
    require_directory(&config.log_dir, "log_dir")?;
    require_writable(&config.log_dir, "log_dir")?;

    // Fail on a bad subnet or listen address now, not mid-serve.
    config.subnet_filter()?;
    config.listen_ip()?;
    Ok(())
}

fn require_directory(path: &Path, what: &str) -> Result<()> {
    match std::fs::metadata(path) {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => Err(TftpError::Config(format!("{what} must be a directory"))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(TftpError::Config(format!(
            "{what} does not exist; create it or adjust config"
        ))),
        Err(e) => Err(TftpError::Io(e)),
    }
}

fn require_writable(path: &Path, what: &str) -> Result<()> {
    let probe = path.join(".petrel-write-probe");
    match std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&probe)
    {
        Ok(_) => {
            let _ = std::fs::remove_file(&probe);
            Ok(())
        }
        Err(e) => Err(TftpError::Config(format!("{what} is not writable: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn dirs() -> (TempDir, TempDir) {
        (
            TempDir::new().expect("tmp root"),
            TempDir::new().expect("tmp log"),
        )
    }

    fn valid_config(root: &TempDir, log: &TempDir) -> ServerConfig {
        ServerConfig {
            root_dir: root.path().to_path_buf(),
            log_dir: log.path().to_path_buf(),
            ..ServerConfig::default()
        }
    }

    #[test]
    fn parses_minimal_toml() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let (root, log) = dirs();
        let toml = format!(
            r#"
root_dir = "{}"
log_dir = "{}"
listen_port = 6969
"#,
            root.path().display(),
            log.path().display()
        );
        let config: ServerConfig = toml::from_str(&toml)?;
        assert_eq!(config.listen_port, 6969);
        assert!(config.any_client);
        validate_config(&config)?;
        Ok(())
    }

    #[test]
    fn roundtrips_through_file() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let (root, log) = dirs();
        let config = valid_config(&root, &log);
        let path = log.path().join("tftpd.toml");
        write_config(&path, &config)?;
        let loaded = load_config(&path)?;
        assert_eq!(loaded.root_dir, config.root_dir);
        assert_eq!(loaded.listen_port, config.listen_port);
        Ok(())
    }

    #[test]
    fn rejects_relative_root_dir() {
        let (_, log) = dirs();
        let config = ServerConfig {
            root_dir: PathBuf::from("relative/path"),
            log_dir: log.path().to_path_buf(),
            ..ServerConfig::default()
        };
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("root_dir must be an absolute path"));
    }

    #[test]
    fn rejects_missing_root_dir() {
        let (_, log) = dirs();
        let config = ServerConfig {
            root_dir: PathBuf::from("/nonexistent/petrel-tftp"),
            log_dir: log.path().to_path_buf(),
            ..ServerConfig::default()
        };
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("root_dir does not exist"));
    }

    #[test]
    fn rejects_bad_subnet_when_restricted() {
        let (root, log) = dirs();
        let config = ServerConfig {
            any_client: false,
            client_mask: "64".to_string(),
            ..valid_config(&root, &log)
        };
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn accepts_subnet_when_any_client() {
        let (root, log) = dirs();
        let config = ServerConfig {
            any_client: true,
            client_mask: "garbage".to_string(),
            ..valid_config(&root, &log)
        };
        // The subnet is never consulted when any client is allowed.
        validate_config(&config).expect("config should validate");
    }

    #[test]
    fn rejects_bad_listen_addr() {
        let (root, log) = dirs();
        let config = ServerConfig {
            listen_addr: "example.com".to_string(),
            ..valid_config(&root, &log)
        };
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn normalizes_unspecified_listen_addr() {
        let (root, log) = dirs();
        let mut config = valid_config(&root, &log);
        config.listen_addr = "0.0.0.0".to_string();
        assert_eq!(config.listen_ip().unwrap(), None);
        config.listen_addr = String::new();
        assert_eq!(config.listen_ip().unwrap(), None);
        config.listen_addr = "127.0.0.1".to_string();
        assert_eq!(config.listen_ip().unwrap(), Some(Ipv4Addr::LOCALHOST));
    }
}
