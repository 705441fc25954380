use crate::credentials::{Credentials, SecretString};
use crate::dockerfile::Dockerfile;
use crate::image::{
    ImageBuilder, ImageError, ImageReference, TagSource, ToolError, VersionKind, VersionedImage,
};
use crate::image_reference::ImageUrl;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub fn reference(url: &str) -> ImageReference {
    ImageReference::new(
        Arc::new(Dockerfile::new("Dockerfile", ".").from("alpine")),
        ImageUrl::parse(url).unwrap(),
        Arc::new(Credentials::new("deploy", SecretString::new("s3cr3t"))),
    )
}

/// Root image with fixed versions that counts how often it is asked for one.
#[derive(Debug)]
pub struct StaticImage {
    reference: ImageReference,
    current: ImageReference,
    previous: ImageReference,
    calls: AtomicUsize,
    failure: Mutex<Option<ImageError>>,
}

impl StaticImage {
    pub fn new(
        current: &str,
        current_aliases: &[&str],
        previous: &str,
        previous_aliases: &[&str],
    ) -> Self {
        let base = reference("registry.example.com/acme/app");
        Self {
            current: base.with_tags(current, current_aliases.iter().copied()),
            previous: base.with_tags(previous, previous_aliases.iter().copied()),
            reference: base,
            calls: AtomicUsize::new(0),
            failure: Mutex::new(None),
        }
    }

    pub fn failing(error: ImageError) -> Self {
        let image = Self::new("unused", &[], "unused", &[]);
        *image.failure.lock().unwrap() = Some(error);
        image
    }

    pub fn recover(&self) {
        self.failure.lock().unwrap().take();
    }

    pub fn version_calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn resolved(&self, reference: ImageReference) -> Self {
        Self {
            reference,
            current: self.current.clone(),
            previous: self.previous.clone(),
            calls: AtomicUsize::new(0),
            failure: Mutex::new(None),
        }
    }
}

#[async_trait]
impl VersionedImage for StaticImage {
    fn reference(&self) -> &ImageReference {
        &self.reference
    }

    async fn version(&self, kind: VersionKind) -> Result<Arc<dyn VersionedImage>, ImageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.failure.lock().unwrap().clone() {
            return Err(error);
        }
        let reference = match kind {
            VersionKind::Current => self.current.clone(),
            VersionKind::Previous => self.previous.clone(),
        };
        Ok(Arc::new(self.resolved(reference)))
    }

    async fn new_version(&self) -> Result<Arc<dyn VersionedImage>, ImageError> {
        self.version(VersionKind::Current).await
    }
}

/// Image builder that records what it was asked to do.
#[derive(Default)]
pub struct RecordingBuilder {
    builds: Mutex<Vec<(String, Vec<String>, BTreeMap<String, String>)>>,
    pushes: Mutex<Vec<String>>,
    failure: Option<String>,
}

impl RecordingBuilder {
    pub fn failing(message: &str) -> Self {
        Self {
            failure: Some(message.to_string()),
            ..Default::default()
        }
    }

    /// Tags of every build, in call order.
    pub fn builds(&self) -> Vec<Vec<String>> {
        self.builds
            .lock()
            .unwrap()
            .iter()
            .map(|(_, tags, _)| tags.clone())
            .collect()
    }

    pub fn build_dockerfiles(&self) -> Vec<String> {
        self.builds
            .lock()
            .unwrap()
            .iter()
            .map(|(dockerfile, _, _)| dockerfile.clone())
            .collect()
    }

    pub fn build_args(&self) -> Vec<BTreeMap<String, String>> {
        self.builds
            .lock()
            .unwrap()
            .iter()
            .map(|(_, _, args)| args.clone())
            .collect()
    }

    pub fn pushes(&self) -> Vec<String> {
        self.pushes.lock().unwrap().clone()
    }

    fn check_failure(&self) -> Result<(), ToolError> {
        match &self.failure {
            Some(message) => Err(ToolError::Spawn {
                program: "docker".to_string(),
                source: io::Error::other(message.clone()),
            }),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ImageBuilder for RecordingBuilder {
    async fn build(
        &self,
        image: &ImageReference,
        build_args: &BTreeMap<String, String>,
    ) -> Result<(), ToolError> {
        self.check_failure()?;
        self.builds.lock().unwrap().push((
            image.dockerfile().name().to_string(),
            image.tags().map(str::to_owned).collect(),
            build_args.clone(),
        ));
        Ok(())
    }

    async fn push(&self, image_url: &ImageUrl, tag: &str) -> Result<(), ToolError> {
        self.check_failure()?;
        self.pushes.lock().unwrap().push(image_url.with_tag(tag));
        Ok(())
    }
}

/// Tag source with a fixed tag list.
pub struct StaticTags(pub Vec<String>);

impl StaticTags {
    pub fn of(tags: &[&str]) -> Self {
        Self(tags.iter().map(|t| t.to_string()).collect())
    }
}

#[async_trait]
impl TagSource for StaticTags {
    async fn tags(
        &self,
        _image_url: &ImageUrl,
        _credentials: &Credentials,
    ) -> Result<Vec<String>, ToolError> {
        Ok(self.0.clone())
    }
}
