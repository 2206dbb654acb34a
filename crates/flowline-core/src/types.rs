use serde::{Deserialize, Serialize};
use std::fmt;

/// Fully qualified reference to a launchable workflow version.
///
/// Format: `{project}:{domain}:{name}:{version}`. All four parts are required
/// and none may contain a `:`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Identifier {
    pub project: String,
    pub domain: String,
    pub name: String,
    pub version: String,
}

impl Identifier {
    pub fn new(project: &str, domain: &str, name: &str, version: &str) -> Self {
        Self {
            project: project.to_string(),
            domain: domain.to_string(),
            name: name.to_string(),
            version: version.to_string(),
        }
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.project, self.domain, self.name, self.version
        )
    }
}
