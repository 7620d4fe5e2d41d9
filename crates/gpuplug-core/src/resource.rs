//! Resource names and the rules that map devices onto them

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Prefix applied to resource names given without one
pub const DEFAULT_RESOURCE_PREFIX: &str = "nvidia.com";

const MAX_NAME_LEN: usize = 63;

/// Orchestrator-visible resource name, always `<prefix>/<name>`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceName(String);

impl ResourceName {
    /// Parse a resource name, adding the default prefix when missing
    pub fn new(name: &str) -> Result<Self, crate::PluginError> {
        let full = if name.contains('/') {
            name.to_string()
        } else {
            format!("{}/{}", DEFAULT_RESOURCE_PREFIX, name)
        };

        let (prefix, short) = full
            .split_once('/')
            .ok_or_else(|| invalid_name(name, "missing '/'"))?;

        if prefix.is_empty() {
            return Err(invalid_name(name, "empty prefix"));
        }
        if short.is_empty() || short.len() > MAX_NAME_LEN {
            return Err(invalid_name(name, "name must be 1-63 characters"));
        }
        if !short
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        {
            return Err(invalid_name(name, "invalid character"));
        }
        let starts_ok = short.chars().next().is_some_and(|c| c.is_ascii_alphanumeric());
        let ends_ok = short.chars().last().is_some_and(|c| c.is_ascii_alphanumeric());
        if !starts_ok || !ends_ok {
            return Err(invalid_name(name, "must start and end with an alphanumeric"));
        }

        Ok(Self(full))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Split into `(prefix, name)`
    pub fn split(&self) -> (&str, &str) {
        self.0.split_once('/').unwrap_or(("", self.0.as_str()))
    }
}

fn invalid_name(name: &str, reason: &str) -> crate::PluginError {
    crate::PluginError::Config(format!("invalid resource name {:?}: {}", name, reason))
}

impl std::fmt::Display for ResourceName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ResourceName {
    type Err = crate::PluginError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for ResourceName {
    type Error = crate::PluginError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl From<ResourceName> for String {
    fn from(name: ResourceName) -> Self {
        name.0
    }
}

/// Case-insensitive glob pattern where `*` matches any run of characters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourcePattern(String);

impl ResourcePattern {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self(pattern.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Check whether `value` matches this pattern
    pub fn matches(&self, value: &str) -> bool {
        let pattern: Vec<char> = self.0.to_lowercase().chars().collect();
        let value: Vec<char> = value.to_lowercase().chars().collect();

        // Greedy wildcard match with single-star backtracking
        let (mut p, mut v) = (0, 0);
        let mut star: Option<(usize, usize)> = None;
        while v < value.len() {
            if p < pattern.len() && pattern[p] == '*' {
                star = Some((p, v));
                p += 1;
            } else if p < pattern.len() && pattern[p] == value[v] {
                p += 1;
                v += 1;
            } else if let Some((sp, sv)) = star {
                p = sp + 1;
                v = sv + 1;
                star = Some((sp, sv + 1));
            } else {
                return false;
            }
        }
        pattern[p..].iter().all(|&c| c == '*')
    }
}

/// A single matching rule: devices matching `pattern` go to `name`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub pattern: ResourcePattern,
    pub name: ResourceName,
}

/// Ordered matching rules for whole GPUs and for partitions
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Resources {
    /// Rules matched against the GPU product name
    pub gpus: Vec<Resource>,
    /// Rules matched against the partition profile name
    pub mig: Vec<Resource>,
}

impl Resources {
    /// Append a whole-GPU rule
    pub fn add_gpu_resource(&mut self, pattern: &str, name: &str) -> crate::PluginResult<()> {
        self.gpus.push(Resource {
            pattern: ResourcePattern::new(pattern),
            name: ResourceName::new(name)?,
        });
        Ok(())
    }

    /// Append a partition rule
    pub fn add_mig_resource(&mut self, pattern: &str, name: &str) -> crate::PluginResult<()> {
        self.mig.push(Resource {
            pattern: ResourcePattern::new(pattern),
            name: ResourceName::new(name)?,
        });
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.gpus.is_empty() && self.mig.is_empty()
    }

    /// First GPU rule matching `product_name`
    pub fn match_gpu(&self, product_name: &str) -> Option<&ResourceName> {
        first_match(&self.gpus, product_name)
    }

    /// First partition rule matching `profile`
    pub fn match_mig(&self, profile: &str) -> Option<&ResourceName> {
        first_match(&self.mig, profile)
    }
}

fn first_match<'a>(rules: &'a [Resource], value: &str) -> Option<&'a ResourceName> {
    rules
        .iter()
        .find(|r| r.pattern.matches(value))
        .map(|r| &r.name)
}
