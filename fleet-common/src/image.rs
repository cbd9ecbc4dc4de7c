//! Parsing of `"name"` / `"name:tag"` image references.
//!
//! A service's `imageName` is either `"name"` or
//! `"name:tag"`; the tag defaults to `latest`. The repo half may itself
//! contain colons only as part of a registry port (`host:5000/repo`), so
//! the tag is taken from the *last* colon, and only when it comes after
//! the last slash (otherwise it's a registry port, not a tag).

use std::fmt;

/// A parsed `repo[:tag]` image reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageRef {
    pub repo: String,
    pub tag: String,
}

impl ImageRef {
    pub const DEFAULT_TAG: &'static str = "latest";

    /// Parse `"name"` or `"name:tag"` into a repo/tag pair.
    pub fn parse(raw: &str) -> Result<Self, ImageParseError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(ImageParseError::Empty);
        }

        let last_slash = raw.rfind('/');
        let last_colon = raw.rfind(':');

        let tag_starts_after_slash = match (last_colon, last_slash) {
            (Some(c), Some(s)) => c > s,
            (Some(_), None) => true,
            (None, _) => false,
        };

        if tag_starts_after_slash {
            if let Some(colon) = last_colon {
                let repo = &raw[..colon];
                let tag = &raw[colon + 1..];
                if repo.is_empty() || tag.is_empty() {
                    return Err(ImageParseError::Malformed(raw.to_string()));
                }
                return Ok(Self {
                    repo: repo.to_string(),
                    tag: tag.to_string(),
                });
            }
        }

        Ok(Self {
            repo: raw.to_string(),
            tag: Self::DEFAULT_TAG.to_string(),
        })
    }

    /// Render back to `"repo:tag"` wire form.
    pub fn with_tag(&self, tag: &str) -> String {
        format!("{}:{}", self.repo, tag)
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.repo, self.tag)
    }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ImageParseError {
    #[error("image reference is empty")]
    Empty,
    #[error("malformed image reference: '{0}'")]
    Malformed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_name_with_default_tag() {
        let img = ImageRef::parse("nginx").unwrap();
        assert_eq!(img.repo, "nginx");
        assert_eq!(img.tag, "latest");
    }

    #[test]
    fn parses_name_with_tag() {
        let img = ImageRef::parse("nginx:1.1").unwrap();
        assert_eq!(img.repo, "nginx");
        assert_eq!(img.tag, "1.1");
    }

    #[test]
    fn parses_namespaced_repo_with_tag() {
        let img = ImageRef::parse("myorg/myapp:v2.3.4").unwrap();
        assert_eq!(img.repo, "myorg/myapp");
        assert_eq!(img.tag, "v2.3.4");
    }

    #[test]
    fn treats_registry_port_as_not_a_tag() {
        let img = ImageRef::parse("registry.example.com:5000/myapp").unwrap();
        assert_eq!(img.repo, "registry.example.com:5000/myapp");
        assert_eq!(img.tag, "latest");
    }

    #[test]
    fn parses_registry_port_with_explicit_tag() {
        let img = ImageRef::parse("registry.example.com:5000/myapp:2.0").unwrap();
        assert_eq!(img.repo, "registry.example.com:5000/myapp");
        assert_eq!(img.tag, "2.0");
    }

    #[test]
    fn rejects_empty_string() {
        assert_eq!(ImageRef::parse("").unwrap_err(), ImageParseError::Empty);
        assert_eq!(ImageRef::parse("   ").unwrap_err(), ImageParseError::Empty);
    }

    #[test]
    fn rejects_trailing_colon() {
        assert!(matches!(
            ImageRef::parse("nginx:"),
            Err(ImageParseError::Malformed(_))
        ));
    }

    #[test]
    fn display_round_trips() {
        let img = ImageRef::parse("nginx:1.1").unwrap();
        assert_eq!(img.to_string(), "nginx:1.1");
    }

    #[test]
    fn with_tag_rewrites_only_the_tag() {
        let img = ImageRef::parse("myorg/myapp:v1").unwrap();
        assert_eq!(img.with_tag("v2"), "myorg/myapp:v2");
    }
}
