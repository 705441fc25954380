use serde::Deserialize;
use std::fmt;

/// Untagged image location, e.g. `registry.example.com/acme/app`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
#[serde(try_from = "String")]
pub struct ImageUrl {
    pub registry: String,
    pub repository: String,
}

#[derive(Debug)]
pub enum ParseError {
    MissingRegistry,
    MissingRepository,
    InvalidFormat(String),
    DigestNotAllowed,
    TagNotAllowed(String),
}

impl std::error::Error for ParseError {}
impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::DigestNotAllowed => write!(f, "digest references are not allowed"),
            ParseError::MissingRegistry => write!(f, "registry is missing"),
            ParseError::MissingRepository => write!(f, "repository is missing"),
            ParseError::InvalidFormat(image) => write!(f, "invalid image format: {}", image),
            ParseError::TagNotAllowed(image) => write!(
                f,
                "image {} must not carry a tag, tags are derived from its versions",
                image
            ),
        }
    }
}

impl fmt::Display for ImageUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)
    }
}

impl TryFrom<String> for ImageUrl {
    type Error = ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl ImageUrl {
    pub fn parse(s: &str) -> Result<Self, ParseError> {
        // digest references are not supported
        if s.contains('@') {
            return Err(ParseError::DigestNotAllowed);
        }

        // A colon after the last slash is a tag, before it a registry port
        if let Some(pos) = s.rfind(':') {
            let last_slash = s.rfind('/').unwrap_or(0);
            if pos > last_slash {
                return Err(ParseError::TagNotAllowed(s.to_string()));
            }
        }

        // Split into registry and repository by the first slash
        let Some((registry, repository)) = s.split_once('/') else {
            return Err(ParseError::InvalidFormat(s.to_string()));
        };

        if registry.is_empty() {
            return Err(ParseError::MissingRegistry);
        }
        if repository.is_empty() {
            return Err(ParseError::MissingRepository);
        }

        Ok(Self {
            registry: registry.to_string(),
            repository: repository.to_string(),
        })
    }

    /// Full reference for one tag, e.g. `registry.example.com/acme/app:v3`.
    pub fn with_tag(&self, tag: &str) -> String {
        format!("{}:{}", self, tag)
    }
}
