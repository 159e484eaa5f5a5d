//! Computation plugin image references
//!
//! Grammar: `[registry[:port]/]path[:tag][@sha256:<64 hex>]`

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{FlameError, FlameResult};

const DIGEST_PREFIX: &str = "sha256:";
const MAX_TAG_LEN: usize = 128;

/// Reference to a computation plugin container image (identity + version)
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ImageRef {
    repository: String,
    tag: Option<String>,
    digest: Option<String>,
}

impl ImageRef {
    /// Parse and validate an image reference
    pub fn parse(raw: &str) -> FlameResult<Self> {
        let invalid = |why: &str| FlameError::Validation(format!("image ref {raw:?}: {why}"));

        if raw.is_empty() {
            return Err(invalid("empty"));
        }
        if raw.chars().any(char::is_whitespace) {
            return Err(invalid("contains whitespace"));
        }

        let (name, digest) = match raw.split_once('@') {
            Some((name, digest)) => {
                let hex = digest
                    .strip_prefix(DIGEST_PREFIX)
                    .ok_or_else(|| invalid("digest must start with sha256:"))?;
                if hex.len() != 64 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
                    return Err(invalid("digest must be 64 hex characters"));
                }
                (name, Some(digest.to_ascii_lowercase()))
            }
            None => (raw, None),
        };

        // A ':' after the last '/' separates the tag; earlier ones belong to a registry port.
        let last_slash = name.rfind('/').map(|i| i + 1).unwrap_or(0);
        let (repository, tag) = match name[last_slash..].rfind(':') {
            Some(i) => {
                let split = last_slash + i;
                (&name[..split], Some(&name[split + 1..]))
            }
            None => (name, None),
        };

        if let Some(tag) = tag {
            let tag_ok = !tag.is_empty()
                && tag.len() <= MAX_TAG_LEN
                && tag
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
            if !tag_ok {
                return Err(invalid("malformed tag"));
            }
        }

        if repository.is_empty() {
            return Err(invalid("missing repository"));
        }
        let mut components = repository.split('/').peekable();
        let mut first = true;
        while let Some(component) = components.next() {
            let is_registry = first && components.peek().is_some() && looks_like_registry(component);
            first = false;
            if is_registry {
                continue;
            }
            let component_ok = !component.is_empty()
                && component
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-'))
                && component.starts_with(|c: char| c.is_ascii_alphanumeric());
            if !component_ok {
                return Err(invalid("repository components must be lowercase [a-z0-9._-]"));
            }
        }

        Ok(ImageRef {
            repository: repository.to_string(),
            tag: tag.map(str::to_string),
            digest,
        })
    }

    /// Repository path, including any registry host
    pub fn repository(&self) -> &str {
        &self.repository
    }

    /// Final path component, used to look up the plugin manifest
    pub fn name(&self) -> &str {
        self.repository.rsplit('/').next().unwrap_or(&self.repository)
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn digest(&self) -> Option<&str> {
        self.digest.as_deref()
    }

    /// Pinned version: digest if present, else tag, else `latest`
    pub fn version(&self) -> &str {
        self.digest
            .as_deref()
            .or(self.tag.as_deref())
            .unwrap_or("latest")
    }
}

fn looks_like_registry(component: &str) -> bool {
    component.contains('.') || component.contains(':') || component == "localhost"
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{tag}")?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}

impl FromStr for ImageRef {
    type Err = FlameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ImageRef::parse(s)
    }
}

impl Serialize for ImageRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ImageRef {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        ImageRef::parse(&raw).map_err(serde::de::Error::custom)
    }
}
