use crate::dockerfile::Dockerfile;
use crate::image::{ImageError, ImageReference, VersionKind, VersionedImage};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::debug;

pub static ASSETS_TAG_SUFFIX: &str = "-assets";

/// Appends `suffix` to `tag`. Already annotated tags are annotated again.
pub fn annotate_tag(tag: &str, suffix: &str) -> String {
    format!("{}{}", tag, suffix)
}

/// An image without a version of its own. Every version is the base image's
/// version of the same kind with each tag annotated, so a dependent image is
/// never ahead of its base.
#[derive(Debug)]
pub struct DependentImage {
    base_image: Arc<dyn VersionedImage>,
    reference: ImageReference,
    suffix: String,
    current_version: OnceCell<Arc<dyn VersionedImage>>,
    previous_version: OnceCell<Arc<dyn VersionedImage>>,
}

impl DependentImage {
    /// Lives next to the base image: same image URL, same credentials.
    pub fn new(base_image: Arc<dyn VersionedImage>, dockerfile: Arc<Dockerfile>) -> Self {
        let base = base_image.reference();
        let reference = ImageReference::new(
            dockerfile,
            base.image_url().clone(),
            Arc::clone(base.credentials()),
        );
        Self::with_reference(base_image, reference, ASSETS_TAG_SUFFIX.to_string())
    }

    pub fn with_suffix(self, suffix: impl Into<String>) -> Self {
        Self::with_reference(self.base_image, self.reference, suffix.into())
    }

    fn with_reference(
        base_image: Arc<dyn VersionedImage>,
        reference: ImageReference,
        suffix: String,
    ) -> Self {
        Self {
            base_image,
            reference,
            suffix,
            current_version: OnceCell::new(),
            previous_version: OnceCell::new(),
        }
    }

    pub fn base_image(&self) -> &Arc<dyn VersionedImage> {
        &self.base_image
    }

    pub fn suffix(&self) -> &str {
        &self.suffix
    }

    pub fn annotate(&self, tag: &str) -> String {
        annotate_tag(tag, &self.suffix)
    }

    fn cached(&self, kind: VersionKind) -> &OnceCell<Arc<dyn VersionedImage>> {
        match kind {
            VersionKind::Current => &self.current_version,
            VersionKind::Previous => &self.previous_version,
        }
    }

    async fn derive(&self, kind: VersionKind) -> Result<Arc<dyn VersionedImage>, ImageError> {
        let base_version = self.base_image.version(kind).await?;
        let base = base_version.reference();

        let main_tag = self.annotate(base.main_tag_or_err()?);
        let alias_tags: Vec<String> = base.alias_tags().iter().map(|t| self.annotate(t)).collect();
        debug!(
            "Derived {} version {} of {} from base {}",
            kind, main_tag, self.reference, base
        );

        // The derived version still tracks the original base, not base_version.
        Ok(Arc::new(Self::with_reference(
            Arc::clone(&self.base_image),
            self.reference.with_tags(main_tag, alias_tags),
            self.suffix.clone(),
        )))
    }
}

#[async_trait]
impl VersionedImage for DependentImage {
    fn reference(&self) -> &ImageReference {
        &self.reference
    }

    async fn version(&self, kind: VersionKind) -> Result<Arc<dyn VersionedImage>, ImageError> {
        self.cached(kind)
            .get_or_try_init(|| self.derive(kind))
            .await
            .map(Arc::clone)
    }

    async fn new_version(&self) -> Result<Arc<dyn VersionedImage>, ImageError> {
        self.current_version().await
    }
}
