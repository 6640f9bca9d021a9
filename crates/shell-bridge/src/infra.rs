use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, RegistryError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    Basic,
    Kerberos,
    LocalShell,
}

#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct Credentials {
    #[serde(default)]
    pub domain: Option<String>,
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(domain: Option<String>, username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            domain: domain.filter(|d| !d.trim().is_empty()),
            username: username.into(),
            password: password.into(),
        }
    }

    /// `DOMAIN\user` when a domain is known, otherwise the bare user name.
    pub fn principal(&self) -> String {
        match &self.domain {
            Some(domain) => format!("{domain}\\{}", self.username),
            None => self.username.clone(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("domain", &self.domain)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// One configured remote management target.
#[derive(Debug, Clone, Deserialize)]
pub struct InfrastructureDescriptor {
    pub id: String,
    pub label: String,
    #[serde(default)]
    pub version: String,
    pub server: String,
    pub connection_uri: String,
    #[serde(default = "default_configuration_name")]
    pub configuration_name: String,
    pub auth: AuthMode,
    #[serde(default)]
    pub bootstrap_script: Option<PathBuf>,
    /// Service account the pooled sessions authenticate as.
    #[serde(default)]
    pub credentials: Option<Credentials>,
}

fn default_configuration_name() -> String {
    "Microsoft.Exchange".to_string()
}

/// Public projection of a descriptor; never carries credentials or endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InfrastructureSummary {
    pub id: String,
    pub label: String,
    pub version: String,
    pub server: String,
    pub auth: AuthMode,
    pub is_default: bool,
}

/// Read-only table of infrastructures, loaded once at startup.
#[derive(Debug, Clone)]
pub struct InfrastructureRegistry {
    descriptors: Vec<Arc<InfrastructureDescriptor>>,
}

impl InfrastructureRegistry {
    pub fn new(descriptors: Vec<InfrastructureDescriptor>) -> Result<Self, RegistryError> {
        if descriptors.is_empty() {
            return Err(RegistryError::Empty);
        }
        let mut seen = HashSet::new();
        for descriptor in &descriptors {
            if !seen.insert(descriptor.id.as_str()) {
                return Err(RegistryError::DuplicateId(descriptor.id.clone()));
            }
            if descriptor.auth == AuthMode::LocalShell && descriptor.bootstrap_script.is_none() {
                return Err(RegistryError::MissingBootstrapScript(descriptor.id.clone()));
            }
        }
        Ok(Self {
            descriptors: descriptors.into_iter().map(Arc::new).collect(),
        })
    }

    /// Resolve a selector; empty or absent selects the first configured infrastructure.
    pub fn resolve(&self, id: Option<&str>) -> Result<Arc<InfrastructureDescriptor>, BridgeError> {
        match id.map(str::trim).filter(|id| !id.is_empty()) {
            None => Ok(Arc::clone(self.default_descriptor())),
            Some(id) => self
                .descriptors
                .iter()
                .find(|d| d.id == id)
                .cloned()
                .ok_or_else(|| BridgeError::UnknownInfrastructure(id.to_string())),
        }
    }

    pub fn default_descriptor(&self) -> &Arc<InfrastructureDescriptor> {
        // non-empty by construction
        &self.descriptors[0]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<InfrastructureDescriptor>> {
        self.descriptors.iter()
    }

    pub fn summaries(&self) -> Vec<InfrastructureSummary> {
        self.descriptors
            .iter()
            .enumerate()
            .map(|(position, d)| InfrastructureSummary {
                id: d.id.clone(),
                label: d.label.clone(),
                version: d.version.clone(),
                server: d.server.clone(),
                auth: d.auth,
                is_default: position == 0,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

#[cfg(test)]
pub(crate) fn descriptor(id: &str) -> InfrastructureDescriptor {
    InfrastructureDescriptor {
        id: id.to_string(),
        label: format!("{id} label"),
        version: "2019".into(),
        server: format!("{id}.mail.local"),
        connection_uri: format!("http://{id}.mail.local/shell"),
        configuration_name: default_configuration_name(),
        auth: AuthMode::Basic,
        bootstrap_script: None,
        credentials: Some(Credentials::new(Some("CORP".into()), "svc", "secret")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_selector_resolves_to_first_entry() {
        let registry =
            InfrastructureRegistry::new(vec![descriptor("eu"), descriptor("us")]).unwrap();
        assert_eq!(registry.resolve(None).unwrap().id, "eu");
        assert_eq!(registry.resolve(Some("")).unwrap().id, "eu");
        assert_eq!(registry.resolve(Some("  ")).unwrap().id, "eu");
        assert_eq!(registry.resolve(Some("us")).unwrap().id, "us");
    }

    #[test]
    fn unknown_selector_fails() {
        let registry = InfrastructureRegistry::new(vec![descriptor("eu")]).unwrap();
        let err = registry.resolve(Some("apac")).unwrap_err();
        assert!(matches!(err, BridgeError::UnknownInfrastructure(id) if id == "apac"));
    }

    #[test]
    fn rejects_invalid_tables() {
        assert_eq!(
            InfrastructureRegistry::new(Vec::new()).unwrap_err(),
            RegistryError::Empty
        );
        assert_eq!(
            InfrastructureRegistry::new(vec![descriptor("eu"), descriptor("eu")]).unwrap_err(),
            RegistryError::DuplicateId("eu".into())
        );
        let mut local = descriptor("lab");
        local.auth = AuthMode::LocalShell;
        assert_eq!(
            InfrastructureRegistry::new(vec![local]).unwrap_err(),
            RegistryError::MissingBootstrapScript("lab".into())
        );
    }

    #[test]
    fn summaries_hide_credentials_and_flag_default() {
        let registry =
            InfrastructureRegistry::new(vec![descriptor("eu"), descriptor("us")]).unwrap();
        let summaries = registry.summaries();
        assert!(summaries[0].is_default);
        assert!(!summaries[1].is_default);
        let json = serde_json::to_string(&summaries).unwrap();
        assert!(!json.contains("secret"));
        assert!(!json.contains("connection_uri"));
    }

    #[test]
    fn credentials_debug_is_redacted() {
        let creds = Credentials::new(Some("CORP".into()), "alice", "hunter2");
        assert_eq!(creds.principal(), "CORP\\alice");
        assert!(!format!("{creds:?}").contains("hunter2"));
    }
}
