use crate::credentials::Credentials;
use crate::dockerfile::Dockerfile;
use crate::image_reference::ImageUrl;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VersionKind {
    Current,
    Previous,
}

impl fmt::Display for VersionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionKind::Current => write!(f, "current"),
            VersionKind::Previous => write!(f, "previous"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ImageError {
    #[error("{kind} version of {image} is unavailable: {reason}")]
    BaseVersionUnavailable {
        image: String,
        kind: VersionKind,
        reason: String,
    },

    #[error("version of {image} has no main tag")]
    Untagged { image: String },

    #[error("failed to build {tag} from {dockerfile}: {diagnostic}")]
    Build {
        dockerfile: String,
        tag: String,
        diagnostic: String,
    },

    #[error("failed to push {image}:{tag}: {diagnostic}")]
    Push {
        image: String,
        tag: String,
        diagnostic: String,
    },

    #[error("failed to list tags of {image}: {diagnostic}")]
    TagLookup { image: String, diagnostic: String },
}

/// Failure reported by the external build tool or registry.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` exited with {status}: {stderr}")]
    Failed {
        command: String,
        status: ExitStatus,
        stderr: String,
    },

    #[error("`{command}` timed out after {timeout:?}")]
    TimedOut { command: String, timeout: Duration },

    #[error("`{command}` was cancelled")]
    Cancelled { command: String },

    #[error("registry request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected registry response: {0}")]
    Protocol(String),
}

/// A buildable, pushable image: where it lives, how it is built and which tags it carries.
#[derive(Debug, Clone)]
pub struct ImageReference {
    dockerfile: Arc<Dockerfile>,
    image_url: ImageUrl,
    credentials: Arc<Credentials>,
    main_tag: Option<String>,
    alias_tags: Vec<String>,
}

impl ImageReference {
    pub fn new(
        dockerfile: Arc<Dockerfile>,
        image_url: ImageUrl,
        credentials: Arc<Credentials>,
    ) -> Self {
        Self {
            dockerfile,
            image_url,
            credentials,
            main_tag: None,
            alias_tags: Vec::new(),
        }
    }

    /// Same image under other tags. Aliases equal to the main tag and repeated aliases are dropped.
    pub fn with_tags<I, S>(&self, main_tag: impl Into<String>, alias_tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let main_tag = main_tag.into();
        let mut aliases: Vec<String> = Vec::new();
        for alias in alias_tags.into_iter().map(Into::into) {
            if alias != main_tag && !aliases.contains(&alias) {
                aliases.push(alias);
            }
        }

        Self {
            dockerfile: Arc::clone(&self.dockerfile),
            image_url: self.image_url.clone(),
            credentials: Arc::clone(&self.credentials),
            main_tag: Some(main_tag),
            alias_tags: aliases,
        }
    }

    pub fn dockerfile(&self) -> &Arc<Dockerfile> {
        &self.dockerfile
    }

    pub fn image_url(&self) -> &ImageUrl {
        &self.image_url
    }

    pub fn credentials(&self) -> &Arc<Credentials> {
        &self.credentials
    }

    pub fn main_tag(&self) -> Option<&str> {
        self.main_tag.as_deref()
    }

    pub fn alias_tags(&self) -> &[String] {
        &self.alias_tags
    }

    /// Main tag first, then aliases in order.
    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.main_tag
            .as_deref()
            .into_iter()
            .chain(self.alias_tags.iter().map(String::as_str))
    }

    pub fn main_tag_or_err(&self) -> Result<&str, ImageError> {
        self.main_tag().ok_or_else(|| ImageError::Untagged {
            image: self.image_url.to_string(),
        })
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.main_tag {
            Some(tag) => write!(f, "{}", self.image_url.with_tag(tag)),
            None => write!(f, "{}", self.image_url),
        }
    }
}

/// Executes builds and pushes for an image reference.
#[async_trait]
pub trait ImageBuilder: Send + Sync {
    /// Builds the reference's dockerfile and tags the result with every tag of the reference.
    async fn build(
        &self,
        image: &ImageReference,
        build_args: &BTreeMap<String, String>,
    ) -> Result<(), ToolError>;

    async fn push(&self, image_url: &ImageUrl, tag: &str) -> Result<(), ToolError>;
}

/// Lists the tags that currently exist for an image.
#[async_trait]
pub trait TagSource: Send + Sync {
    async fn tags(&self, image_url: &ImageUrl, credentials: &Credentials)
    -> Result<Vec<String>, ToolError>;
}

impl fmt::Debug for dyn TagSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TagSource")
    }
}

/// Anything that can serve as a base image: it resolves its own versions.
#[async_trait]
pub trait VersionedImage: Send + Sync + fmt::Debug {
    fn reference(&self) -> &ImageReference;

    async fn version(&self, kind: VersionKind) -> Result<Arc<dyn VersionedImage>, ImageError>;

    /// The version the next build produces.
    async fn new_version(&self) -> Result<Arc<dyn VersionedImage>, ImageError>;

    async fn current_version(&self) -> Result<Arc<dyn VersionedImage>, ImageError> {
        self.version(VersionKind::Current).await
    }

    async fn previous_version(&self) -> Result<Arc<dyn VersionedImage>, ImageError> {
        self.version(VersionKind::Previous).await
    }

    /// Builds `new_version` with all of its tags and returns it.
    async fn build(
        &self,
        builder: &dyn ImageBuilder,
        build_args: &BTreeMap<String, String>,
    ) -> Result<Arc<dyn VersionedImage>, ImageError> {
        let version = self.new_version().await?;
        build_version(version, builder, build_args).await
    }

    async fn push(&self, builder: &dyn ImageBuilder, tag: &str) -> Result<(), ImageError> {
        let image_url = self.reference().image_url();
        info!("Pushing {}", image_url.with_tag(tag));
        builder
            .push(image_url, tag)
            .await
            .map_err(|e| ImageError::Push {
                image: image_url.to_string(),
                tag: tag.to_string(),
                diagnostic: e.to_string(),
            })
    }

    /// Pushes every tag of the current version, main tag first.
    async fn push_all(&self, builder: &dyn ImageBuilder) -> Result<Vec<String>, ImageError> {
        let version = self.current_version().await?;
        let tags: Vec<String> = version.reference().tags().map(str::to_owned).collect();
        if tags.is_empty() {
            return Err(ImageError::Untagged {
                image: self.reference().image_url().to_string(),
            });
        }
        for tag in &tags {
            self.push(builder, tag).await?;
        }
        Ok(tags)
    }
}

/// Builds `version` under every one of its tags.
pub async fn build_version(
    version: Arc<dyn VersionedImage>,
    builder: &dyn ImageBuilder,
    build_args: &BTreeMap<String, String>,
) -> Result<Arc<dyn VersionedImage>, ImageError> {
    let reference = version.reference();
    let tag = reference.main_tag_or_err()?;

    info!(
        "Building {} from {}",
        reference,
        reference.dockerfile().name()
    );
    builder
        .build(reference, build_args)
        .await
        .map_err(|e| ImageError::Build {
            dockerfile: reference.dockerfile().name().to_string(),
            tag: reference.image_url().with_tag(tag),
            diagnostic: e.to_string(),
        })?;
    info!("Successfully built {}", reference);

    Ok(version)
}
