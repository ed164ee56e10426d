//! Global object references of the form `gid://vreg/<Model>/<id>`.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use uuid::Uuid;

const PREFIX: &str = "gid://vreg/";

/// A reference to a persisted object that can cross process boundaries
/// (request headers, admin payloads) without leaking table layout.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct GlobalId {
    model: String,
    id: String,
}

impl GlobalId {
    pub fn new(model: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            id: id.into(),
        }
    }

    /// Reference to an upstream row.
    pub fn upstream(id: Uuid) -> Self {
        Self::new("Upstream", id.to_string())
    }

    /// Reference to a project (local package storage).
    pub fn project(id: impl Into<String>) -> Self {
        Self::new("Project", id)
    }

    pub fn parse(s: &str) -> crate::Result<Self> {
        let rest = s
            .strip_prefix(PREFIX)
            .ok_or_else(|| crate::Error::InvalidGlobalId(format!("missing {PREFIX} prefix")))?;
        let (model, id) = rest
            .split_once('/')
            .ok_or_else(|| crate::Error::InvalidGlobalId("expected <Model>/<id>".to_string()))?;

        if model.is_empty() || !model.chars().all(|c| c.is_ascii_alphanumeric() || c == ':') {
            return Err(crate::Error::InvalidGlobalId(format!(
                "invalid model name: {model}"
            )));
        }
        if id.is_empty() || id.contains('/') {
            return Err(crate::Error::InvalidGlobalId(format!("invalid id: {id}")));
        }

        Ok(Self::new(model, id))
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Interpret the id as a UUID when the model matches.
    pub fn uuid_for(&self, model: &str) -> crate::Result<Uuid> {
        if self.model != model {
            return Err(crate::Error::InvalidGlobalId(format!(
                "expected {model}, got {}",
                self.model
            )));
        }
        Uuid::parse_str(&self.id)
            .map_err(|e| crate::Error::InvalidGlobalId(format!("invalid uuid: {e}")))
    }
}

impl fmt::Display for GlobalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{PREFIX}{}/{}", self.model, self.id)
    }
}

impl fmt::Debug for GlobalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GlobalId({self})")
    }
}

impl Serialize for GlobalId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for GlobalId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let gid = GlobalId::parse("gid://vreg/Project/42").unwrap();
        assert_eq!(gid.model(), "Project");
        assert_eq!(gid.id(), "42");
        assert_eq!(gid.to_string(), "gid://vreg/Project/42");
    }

    #[test]
    fn test_upstream_uuid() {
        let id = Uuid::new_v4();
        let gid = GlobalId::parse(&GlobalId::upstream(id).to_string()).unwrap();
        assert_eq!(gid.uuid_for("Upstream").unwrap(), id);
        assert!(gid.uuid_for("Project").is_err());
    }

    #[test]
    fn test_rejects_malformed() {
        assert!(GlobalId::parse("gid://other/Project/1").is_err());
        assert!(GlobalId::parse("gid://vreg/Project").is_err());
        assert!(GlobalId::parse("gid://vreg//1").is_err());
        assert!(GlobalId::parse("gid://vreg/Project/1/2").is_err());
    }
}
