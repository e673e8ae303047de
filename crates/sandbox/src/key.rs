use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::SandboxError;

/// Language runtime baked into a sandbox image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    Node,
}

impl Language {
    pub const ALL: [Language; 2] = [Language::Python, Language::Node];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Python => "python",
            Self::Node => "node",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Language {
    type Err = SandboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "python" | "python3" | "py" => Ok(Self::Python),
            "node" | "nodejs" | "javascript" | "js" => Ok(Self::Node),
            other => Err(SandboxError::InvalidConfig(format!(
                "unsupported language: {other}"
            ))),
        }
    }
}

/// Container isolation technology.
///
/// Both variants run OCI containers; they differ in the OCI runtime the
/// container is started under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Backend {
    /// Namespace isolation on the shared host kernel.
    #[serde(rename = "runc", alias = "standard", alias = "docker")]
    Standard,
    /// User-space kernel emulation (gVisor).
    #[serde(rename = "runsc", alias = "gvisor")]
    Gvisor,
}

impl Backend {
    /// Comparison order.
    pub const ALL: [Backend; 2] = [Backend::Standard, Backend::Gvisor];

    /// Tag used for metrics labeling.
    pub fn as_str(&self) -> &'static str {
        self.oci_runtime()
    }

    /// Name of the OCI runtime registered with the container daemon.
    pub fn oci_runtime(&self) -> &'static str {
        match self {
            Self::Standard => "runc",
            Self::Gvisor => "runsc",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Backend {
    type Err = SandboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "runc" | "standard" | "docker" => Ok(Self::Standard),
            "runsc" | "gvisor" => Ok(Self::Gvisor),
            other => Err(SandboxError::InvalidConfig(format!(
                "unsupported sandbox backend: {other}"
            ))),
        }
    }
}

/// Identifies one independent container pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PoolKey {
    pub language: Language,
    pub backend: Backend,
}

impl PoolKey {
    pub fn new(language: Language, backend: Backend) -> Self {
        Self { language, backend }
    }

    /// Every (language, backend) pair.
    pub fn all() -> impl Iterator<Item = PoolKey> {
        Language::ALL
            .into_iter()
            .flat_map(|language| Backend::ALL.into_iter().map(move |b| PoolKey::new(language, b)))
    }
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.language, self.backend)
    }
}

impl Serialize for PoolKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl FromStr for PoolKey {
    type Err = SandboxError;

    /// Parses `language/backend`, e.g. `python/runsc`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (language, backend) = s.split_once('/').ok_or_else(|| {
            SandboxError::InvalidConfig(format!("pool key must be language/backend: {s}"))
        })?;
        Ok(Self::new(language.parse()?, backend.parse()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn language_aliases() {
        assert_eq!("python3".parse::<Language>().unwrap(), Language::Python);
        assert_eq!("JavaScript".parse::<Language>().unwrap(), Language::Node);
        assert_eq!(" node ".parse::<Language>().unwrap(), Language::Node);
    }

    #[test]
    fn language_rejects_unknown() {
        let err = "cobol".parse::<Language>().unwrap_err();
        assert!(err.to_string().contains("cobol"), "got: {err}");
    }

    #[test]
    fn backend_aliases() {
        assert_eq!("runc".parse::<Backend>().unwrap(), Backend::Standard);
        assert_eq!("standard".parse::<Backend>().unwrap(), Backend::Standard);
        assert_eq!("gVisor".parse::<Backend>().unwrap(), Backend::Gvisor);
        assert!("kata".parse::<Backend>().is_err());
    }

    #[test]
    fn backend_display_is_oci_runtime() {
        assert_eq!(Backend::Standard.to_string(), "runc");
        assert_eq!(Backend::Gvisor.to_string(), "runsc");
    }

    #[test]
    fn backend_serde_uses_runtime_tags() {
        let json = serde_json::to_string(&Backend::Gvisor).unwrap();
        assert_eq!(json, "\"runsc\"");
        let parsed: Backend = serde_json::from_str("\"standard\"").unwrap();
        assert_eq!(parsed, Backend::Standard);
    }

    #[test]
    fn pool_key_round_trips_through_display() {
        let key = PoolKey::new(Language::Node, Backend::Gvisor);
        assert_eq!(key.to_string(), "node/runsc");
        assert_eq!("node/runsc".parse::<PoolKey>().unwrap(), key);
        assert!("node".parse::<PoolKey>().is_err());
    }

    #[test]
    fn all_keys_cover_every_pair() {
        let keys: Vec<_> = PoolKey::all().collect();
        assert_eq!(keys.len(), 4);
        assert_eq!(keys[0], PoolKey::new(Language::Python, Backend::Standard));
        assert_eq!(keys[3], PoolKey::new(Language::Node, Backend::Gvisor));
    }

    #[test]
    fn pool_key_serializes_as_label() {
        let key = PoolKey::new(Language::Python, Backend::Standard);
        assert_eq!(serde_json::to_string(&key).unwrap(), "\"python/runc\"");
    }
}
