use crate::image::{
    ImageBuilder, ImageError, ImageReference, TagSource, VersionKind, VersionedImage, build_version,
};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::debug;

static TIMESTAMP_TAG_FORMAT: &str = "%Y%m%d%H%M%S";
pub static LATEST_TAG: &str = "latest";

pub fn timestamp_tag(time: DateTime<Utc>) -> String {
    time.format(TIMESTAMP_TAG_FORMAT).to_string()
}

pub fn parse_timestamp_tag(tag: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(tag, TIMESTAMP_TAG_FORMAT).ok()
}

/// Root image versioned by UTC build timestamps. The newest timestamp tag
/// found in its tag sources is the current version, the one before it the
/// previous version. Once this image has been built, the built version is
/// current whether or not the tag sources list it yet.
#[derive(Debug)]
pub struct TimestampedImage {
    reference: ImageReference,
    tag_sources: Vec<Arc<dyn TagSource>>,
    timestamp_tags: OnceCell<Vec<String>>,
    current_version: OnceCell<Arc<dyn VersionedImage>>,
    previous_version: OnceCell<Arc<dyn VersionedImage>>,
    new_version: OnceCell<Arc<dyn VersionedImage>>,
    built_version: OnceCell<Arc<dyn VersionedImage>>,
    previous_before_built: OnceCell<Arc<dyn VersionedImage>>,
}

impl TimestampedImage {
    pub fn new(reference: ImageReference, tag_sources: Vec<Arc<dyn TagSource>>) -> Self {
        Self {
            reference,
            tag_sources,
            timestamp_tags: OnceCell::new(),
            current_version: OnceCell::new(),
            previous_version: OnceCell::new(),
            new_version: OnceCell::new(),
            built_version: OnceCell::new(),
            previous_before_built: OnceCell::new(),
        }
    }

    fn duplicate_with_tags(
        &self,
        main_tag: String,
        alias_tags: &[&str],
    ) -> Arc<dyn VersionedImage> {
        Arc::new(Self::new(
            self.reference.with_tags(main_tag, alias_tags.iter().copied()),
            self.tag_sources.clone(),
        ))
    }

    /// Timestamp tags from every source, newest first, without duplicates.
    async fn timestamp_tags(&self) -> Result<&[String], ImageError> {
        let tags = self
            .timestamp_tags
            .get_or_try_init(|| async {
                let mut found = BTreeSet::new();
                for source in &self.tag_sources {
                    let tags = source
                        .tags(self.reference.image_url(), self.reference.credentials())
                        .await
                        .map_err(|e| ImageError::TagLookup {
                            image: self.reference.image_url().to_string(),
                            diagnostic: e.to_string(),
                        })?;
                    found.extend(
                        tags.into_iter()
                            .filter_map(|tag| parse_timestamp_tag(&tag).map(|time| (time, tag))),
                    );
                }
                debug!(
                    "Found {} timestamp tags for {}",
                    found.len(),
                    self.reference.image_url()
                );
                Ok::<_, ImageError>(found.into_iter().rev().map(|(_, tag)| tag).collect())
            })
            .await?;
        Ok(tags.as_slice())
    }

    async fn derive(&self, kind: VersionKind) -> Result<Arc<dyn VersionedImage>, ImageError> {
        let tags = self.timestamp_tags().await?;
        let unavailable = |reason: String| ImageError::BaseVersionUnavailable {
            image: self.reference.image_url().to_string(),
            kind,
            reason,
        };

        match kind {
            VersionKind::Current => {
                let tag = tags
                    .first()
                    .ok_or_else(|| unavailable("no timestamp tags found".to_string()))?;
                Ok(self.duplicate_with_tags(tag.clone(), &[LATEST_TAG]))
            }
            VersionKind::Previous => {
                let tag = tags.get(1).ok_or_else(|| match tags.first() {
                    Some(only) => unavailable(format!("{} is the only timestamp tag", only)),
                    None => unavailable("no timestamp tags found".to_string()),
                })?;
                Ok(self.duplicate_with_tags(tag.clone(), &[]))
            }
        }
    }

    /// Newest known timestamp tag other than the built one.
    async fn previous_of(&self, built: &str) -> Result<Arc<dyn VersionedImage>, ImageError> {
        let tags = self.timestamp_tags().await?;
        let tag = tags.iter().find(|tag| tag.as_str() != built).ok_or_else(|| {
            ImageError::BaseVersionUnavailable {
                image: self.reference.image_url().to_string(),
                kind: VersionKind::Previous,
                reason: format!("{} is the only timestamp tag", built),
            }
        })?;
        Ok(self.duplicate_with_tags(tag.clone(), &[]))
    }
}

#[async_trait]
impl VersionedImage for TimestampedImage {
    fn reference(&self) -> &ImageReference {
        &self.reference
    }

    async fn version(&self, kind: VersionKind) -> Result<Arc<dyn VersionedImage>, ImageError> {
        if let Some(built) = self.built_version.get() {
            return match kind {
                VersionKind::Current => Ok(Arc::clone(built)),
                VersionKind::Previous => {
                    let built_tag = built.reference().main_tag_or_err()?;
                    self.previous_before_built
                        .get_or_try_init(|| self.previous_of(built_tag))
                        .await
                        .map(Arc::clone)
                }
            };
        }

        let cell = match kind {
            VersionKind::Current => &self.current_version,
            VersionKind::Previous => &self.previous_version,
        };
        cell.get_or_try_init(|| self.derive(kind))
            .await
            .map(Arc::clone)
    }

    async fn new_version(&self) -> Result<Arc<dyn VersionedImage>, ImageError> {
        self.new_version
            .get_or_try_init(|| async {
                Ok::<_, ImageError>(
                    self.duplicate_with_tags(timestamp_tag(Utc::now()), &[LATEST_TAG]),
                )
            })
            .await
            .map(Arc::clone)
    }

    async fn build(
        &self,
        builder: &dyn ImageBuilder,
        build_args: &BTreeMap<String, String>,
    ) -> Result<Arc<dyn VersionedImage>, ImageError> {
        let version = self.new_version().await?;
        let built = build_version(version, builder, build_args).await?;
        if self.built_version.set(Arc::clone(&built)).is_err() {
            debug!("{} was already built", built.reference());
        }
        Ok(built)
    }
}
