//! Resolver file handling
//!
//! While the tunnel is up the host resolver file is owned by the gateway. The
//! pristine file is copied aside once, on the first up edge, and copied back on
//! the down edge.

use std::io;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Default resolver file
pub const RESOLV_CONF: &str = "/etc/resolv.conf";

/// Suffix of the pristine copy kept while the tunnel is up
pub const BACKUP_SUFFIX: &str = ".ovpnsave";

/// Resolver contents pushed by the tunnel
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvConf {
    /// Search domains
    pub domains: Vec<String>,
    /// Name server addresses
    pub nameservers: Vec<String>,
}

impl ResolvConf {
    /// Render in `resolv.conf(5)` syntax
    ///
    /// A single domain becomes a `domain` directive, several become one
    /// `search` directive.
    pub fn render(&self) -> String {
        let mut out = String::new();
        match self.domains.len() {
            0 => {}
            1 => out.push_str(&format!("domain {}\n", self.domains[0])),
            _ => out.push_str(&format!("search {}\n", self.domains.join(" "))),
        }
        for ns in &self.nameservers {
            out.push_str(&format!("nameserver {}\n", ns));
        }
        out
    }
}

/// Address on the first line of `content` that starts with `nameserver`
pub fn first_nameserver(content: &str) -> Option<&str> {
    content
        .lines()
        .find(|line| line.starts_with("nameserver"))
        .and_then(|line| line.split_whitespace().nth(1))
}

/// The host resolver file and its backup
#[derive(Debug, Clone)]
pub struct ResolverFile {
    path: PathBuf,
    backup: PathBuf,
}

impl Default for ResolverFile {
    fn default() -> Self {
        Self::new(RESOLV_CONF)
    }
}

impl ResolverFile {
    /// Manage the resolver file at `path`; the backup sits next to it
    pub fn new(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let mut backup = path.clone().into_os_string();
        backup.push(BACKUP_SUFFIX);
        Self {
            path,
            backup: PathBuf::from(backup),
        }
    }

    /// Path of the live resolver file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of the backup
    pub fn backup_path(&self) -> &Path {
        &self.backup
    }

    /// Whether a backup currently exists
    pub async fn has_backup(&self) -> bool {
        tokio::fs::try_exists(&self.backup).await.unwrap_or(false)
    }

    /// Copy the live file aside unless a backup already exists
    ///
    /// Returns `true` if a backup was written by this call.
    pub async fn backup_once(&self) -> Result<bool> {
        if self.has_backup().await {
            log::debug!("Resolver backup {:?} already present", self.backup);
            return Ok(false);
        }

        let content = match tokio::fs::read(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                log::warn!("No resolver file at {:?}, nothing to back up", self.path);
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };

        tokio::fs::write(&self.backup, content).await.map_err(|e| {
            Error::Resolver(format!("failed to write backup {:?}: {}", self.backup, e))
        })?;
        log::info!("Backed up {:?} to {:?}", self.path, self.backup);
        Ok(true)
    }

    /// Overwrite the live file
    pub async fn write(&self, conf: &ResolvConf) -> Result<()> {
        tokio::fs::write(&self.path, conf.render())
            .await
            .map_err(|e| Error::Resolver(format!("failed to update {:?}: {}", self.path, e)))
    }

    /// Copy the backup over the live file
    ///
    /// Returns the restored content, or `None` when there was no backup.
    pub async fn restore(&self) -> Result<Option<String>> {
        let content = match tokio::fs::read_to_string(&self.backup).await {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        tokio::fs::write(&self.path, &content)
            .await
            .map_err(|e| Error::Resolver(format!("failed to restore {:?}: {}", self.path, e)))?;
        log::info!("Restored {:?} from {:?}", self.path, self.backup);
        Ok(Some(content))
    }

    /// Delete the backup if present
    pub async fn remove_backup(&self) -> Result<()> {
        match tokio::fs::remove_file(&self.backup).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Resolver(format!(
                "failed to remove {:?}: {}",
                self.backup, e
            ))),
        }
    }
}
