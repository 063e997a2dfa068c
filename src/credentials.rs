use crate::paths::AppPaths;
use crate::{EngineError, Result};
use serde::{Deserialize, Serialize};

/// A site login resolved from the store at job run time. The engine passes
/// these values to the downloader as flags and never writes them into job
/// rows, logs, or history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub name: String,
    pub username: String,
    pub password: String,
}

/// File-backed credential collaborator. Jobs reference entries by name; the
/// orchestrator calls [`lookup`] when it starts a job that carries a
/// credential reference.
///
/// [`lookup`]: CredentialStore::lookup
#[derive(Debug, Clone)]
pub struct CredentialStore {
    paths: AppPaths,
}

impl CredentialStore {
    pub fn new(paths: AppPaths) -> Self {
        Self { paths }
    }

    fn load(&self) -> Result<Vec<Credential>> {
        let path = self.paths.credentials_path();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let bytes = std::fs::read(&path)?;
        let parsed: Vec<Credential> = serde_json::from_slice(&bytes).map_err(|e| {
            EngineError::InvalidRequest(format!(
                "failed to parse credential store at {}: {e}",
                path.to_string_lossy()
            ))
        })?;
        Ok(parsed)
    }

    fn save(&self, entries: &[Credential]) -> Result<()> {
        let path = self.paths.credentials_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(entries)?;
        std::fs::write(&path, format!("{json}\n"))?;
        restrict_permissions(&path)?;
        Ok(())
    }

    pub fn lookup(&self, reference: &str) -> Result<Option<Credential>> {
        let entries = self.load()?;
        Ok(entries.into_iter().find(|c| c.name == reference))
    }

    pub fn list_names(&self) -> Result<Vec<String>> {
        Ok(self.load()?.into_iter().map(|c| c.name).collect())
    }

    /// Inserts or replaces the entry with the same name.
    pub fn store(&self, credential: Credential) -> Result<()> {
        if credential.name.trim().is_empty() {
            return Err(EngineError::InvalidRequest(
                "credential name must not be empty".to_string(),
            ));
        }
        let mut entries = self.load()?;
        entries.retain(|c| c.name != credential.name);
        entries.push(credential);
        self.save(&entries)
    }

    pub fn remove(&self, reference: &str) -> Result<()> {
        let mut entries = self.load()?;
        entries.retain(|c| c.name != reference);
        self.save(&entries)
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &std::path::Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &std::path::Path) -> std::io::Result<()> {
    Ok(())
}
