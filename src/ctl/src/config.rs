use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, ErrorKind};
use std::path::PathBuf;

const CONFIG_FILE: &str = ".quayrc";

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    pub host: Option<String>,
    pub port: Option<u16>,
}

impl Config {
    /// Get the path to the config file (~/.quayrc)
    pub fn path() -> io::Result<PathBuf> {
        dirs::home_dir()
            .map(|h| h.join(CONFIG_FILE))
            .ok_or_else(|| io::Error::new(ErrorKind::NotFound, "Could not find home directory"))
    }

    /// Load config from ~/.quayrc
    pub fn load() -> io::Result<Self> {
        let path = Self::path()?;
        if !path.exists() {
            return Ok(Config::default());
        }

        let content = fs::read_to_string(&path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> io::Result<Self> {
        toml::from_str(content).map_err(|e| io::Error::new(ErrorKind::InvalidData, e.to_string()))
    }

    /// Save config to ~/.quayrc
    pub fn save(&self) -> io::Result<()> {
        let path = Self::path()?;
        let content = toml::to_string_pretty(self)
            .map_err(|e| io::Error::new(ErrorKind::InvalidData, e.to_string()))?;
        fs::write(&path, content)
    }

    /// Environment wins over the file, the file over the defaults.
    pub fn resolve(&self, env_host: Option<String>, env_port: Option<String>) -> Result<(String, u16), String> {
        let host = env_host
            .or_else(|| self.host.clone())
            .unwrap_or_else(|| crate::DEFAULT_HOST.to_string());
        let port = match env_port {
            Some(p) => p
                .parse::<u16>()
                .map_err(|e| format!("Invalid port number '{}': {}", p, e))?,
            None => self.port.unwrap_or(crate::DEFAULT_PORT),
        };
        Ok((host, port))
    }
}
