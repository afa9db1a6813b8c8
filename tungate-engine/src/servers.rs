//! Tunnel server records
//!
//! A server record holds a tunnel client config template, the credentials and
//! a list of endpoints. Each endpoint is a set of template variables with a
//! mandatory `name`; selecting an endpoint renders the template with its
//! variables substituted for `{{key}}` placeholders.

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::store::write_atomic;

/// Template variables of one endpoint; `name` identifies it
pub type Endpoint = BTreeMap<String, String>;

/// A tunnel server record
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    pub name: String,
    #[serde(default)]
    pub template: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
}

impl Server {
    /// Find an endpoint by name
    pub fn endpoint(&self, name: &str) -> Option<&Endpoint> {
        self.endpoints
            .iter()
            .find(|e| e.get("name").map(String::as_str) == Some(name))
    }

    /// Drop endpoints with an empty or already used name
    pub fn normalize(&mut self) {
        let mut seen = HashSet::new();
        self.endpoints.retain(|endpoint| match endpoint.get("name") {
            Some(name) if !name.is_empty() => seen.insert(name.clone()),
            _ => false,
        });
    }

    /// Render the client config for `endpoint`
    pub fn render_config(&self, endpoint: &str) -> Result<String> {
        let vars = self.endpoint(endpoint).ok_or_else(|| Error::EndpointNotFound {
            server: self.name.clone(),
            endpoint: endpoint.to_string(),
        })?;
        Ok(render_template(&self.template, vars))
    }

    /// Contents of the `--auth-user-pass` file
    pub fn auth_file(&self) -> String {
        format!("{}\n{}\n", self.username, self.password)
    }
}

/// Replace every `{{key}}` in `template` with its value from `vars`
pub fn render_template(template: &str, vars: &BTreeMap<String, String>) -> String {
    vars.iter().fold(template.to_string(), |out, (key, value)| {
        out.replace(&format!("{{{{{}}}}}", key), value)
    })
}

/// Server records persisted as a JSON array
pub struct ServerStore {
    path: PathBuf,
    servers: Mutex<Vec<Server>>,
}

impl ServerStore {
    /// Open the store at `path`; a missing file is an empty store
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let servers = match std::fs::read_to_string(&path) {
            Ok(content) if content.trim().is_empty() => Vec::new(),
            Ok(content) => serde_json::from_str(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            servers: Mutex::new(servers),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn list(&self) -> Vec<Server> {
        self.lock().clone()
    }

    pub fn get(&self, name: &str) -> Result<Server> {
        self.lock()
            .iter()
            .find(|s| s.name == name)
            .cloned()
            .ok_or_else(|| Error::ServerNotFound(name.to_string()))
    }

    /// Insert or replace a record by name
    pub fn save(&self, mut server: Server) -> Result<Server> {
        if server.name.is_empty() {
            return Err(Error::InvalidRequest("server name is required".into()));
        }
        server.normalize();

        let mut servers = self.lock();
        let mut updated = servers.clone();
        match updated.iter_mut().find(|s| s.name == server.name) {
            Some(existing) => *existing = server.clone(),
            None => updated.push(server.clone()),
        }
        self.persist(&updated)?;
        *servers = updated;

        log::info!("Saved server {}", server.name);
        Ok(server)
    }

    pub fn delete(&self, name: &str) -> Result<()> {
        let mut servers = self.lock();
        let updated: Vec<Server> = servers.iter().filter(|s| s.name != name).cloned().collect();
        if updated.len() == servers.len() {
            return Err(Error::ServerNotFound(name.to_string()));
        }
        self.persist(&updated)?;
        *servers = updated;

        log::info!("Deleted server {}", name);
        Ok(())
    }

    fn persist(&self, servers: &[Server]) -> Result<()> {
        let document = serde_json::to_vec_pretty(servers)?;
        write_atomic(&self.path, &document, Some(0o600))
            .map_err(|e| Error::Persistence(format!("failed to write {:?}: {}", self.path, e)))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Server>> {
        match self.servers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(pairs: &[(&str, &str)]) -> Endpoint {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn corp() -> Server {
        Server {
            name: "corp".into(),
            template: "remote {{host}} {{port}}\nproto udp\n".into(),
            username: "alice".into(),
            password: "secret".into(),
            endpoints: vec![
                endpoint(&[("name", "eu"), ("host", "eu.vpn.example"), ("port", "1194")]),
                endpoint(&[("name", "us"), ("host", "us.vpn.example"), ("port", "443")]),
            ],
        }
    }

    #[test]
    fn test_render_config() {
        let server = corp();
        assert_eq!(
            server.render_config("us").unwrap(),
            "remote us.vpn.example 443\nproto udp\n"
        );
        assert_eq!(server.auth_file(), "alice\nsecret\n");
    }

    #[test]
    fn test_render_unknown_endpoint() {
        let err = corp().render_config("asia").unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_normalize_drops_empty_and_duplicate_names() {
        let mut server = corp();
        server.endpoints.push(endpoint(&[("name", ""), ("host", "x")]));
        server.endpoints.push(endpoint(&[("host", "nameless")]));
        server.endpoints.push(endpoint(&[("name", "eu"), ("host", "dup")]));
        server.normalize();

        let names: Vec<&str> = server
            .endpoints
            .iter()
            .map(|e| e["name"].as_str())
            .collect();
        assert_eq!(names, vec!["eu", "us"]);
        assert_eq!(server.endpoint("eu").unwrap()["host"], "eu.vpn.example");
    }

    #[test]
    fn test_store_crud() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("servers.json");

        let store = ServerStore::open(&path).unwrap();
        assert!(store.list().is_empty());
        assert!(store.get("corp").unwrap_err().is_not_found());

        store.save(corp()).unwrap();
        let mut changed = corp();
        changed.username = "bob".into();
        store.save(changed).unwrap();

        let reopened = ServerStore::open(&path).unwrap();
        assert_eq!(reopened.list().len(), 1);
        assert_eq!(reopened.get("corp").unwrap().username, "bob");

        reopened.delete("corp").unwrap();
        assert!(reopened.delete("corp").unwrap_err().is_not_found());
        assert!(ServerStore::open(&path).unwrap().list().is_empty());
    }

    #[test]
    fn test_save_requires_name() {
        let dir = tempfile::tempdir().unwrap();
        let store = ServerStore::open(dir.path().join("servers.json")).unwrap();
        assert!(matches!(
            store.save(Server::default()),
            Err(Error::InvalidRequest(_))
        ));
    }
}
