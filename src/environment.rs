use crate::config::{Config, DockerConfig, EnvironmentConfig, KubernetesConfig, TagSourceKind};
use crate::dependent_image::DependentImage;
use crate::dockerfile::Dockerfile;
use crate::image::{ImageReference, TagSource, VersionedImage};
use crate::timestamped_image::TimestampedImage;
use anyhow::{Context, Result, anyhow};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

static DEVELOPMENT: &str = "development";
pub static APP_IMAGE: &str = "app";
pub static ASSETS_IMAGE: &str = "assets";

/// Where timestamp tags of root images are looked up.
#[derive(Clone)]
pub struct TagSources {
    pub local: Arc<dyn TagSource>,
    pub registry: Arc<dyn TagSource>,
}

impl TagSources {
    fn select(&self, kinds: &[TagSourceKind]) -> Vec<Arc<dyn TagSource>> {
        kinds
            .iter()
            .map(|kind| match kind {
                TagSourceKind::Local => Arc::clone(&self.local),
                TagSourceKind::Registry => Arc::clone(&self.registry),
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct NamedImage {
    pub name: String,
    pub image: Arc<dyn VersionedImage>,
}

/// Images of one environment in build order: the base image, then every image depending on it.
#[derive(Debug)]
pub struct DockerSpec {
    base_image: Arc<dyn VersionedImage>,
    images: Vec<NamedImage>,
    build_args: BTreeMap<String, String>,
}

impl DockerSpec {
    pub fn new(base_image: Arc<dyn VersionedImage>) -> Self {
        Self {
            images: vec![NamedImage {
                name: APP_IMAGE.to_string(),
                image: Arc::clone(&base_image),
            }],
            base_image,
            build_args: BTreeMap::new(),
        }
    }

    pub fn base_image(&self) -> &Arc<dyn VersionedImage> {
        &self.base_image
    }

    pub fn build_arg(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.build_args.insert(key.into(), value.into());
        self
    }

    pub fn build_args(&self) -> &BTreeMap<String, String> {
        &self.build_args
    }

    /// Registers an image built after the ones already registered.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        image: Arc<dyn VersionedImage>,
    ) -> &mut Self {
        self.images.push(NamedImage {
            name: name.into(),
            image,
        });
        self
    }

    /// Registers a dependent image tracking the base image's versions.
    pub fn assets(&mut self, dockerfile: Arc<Dockerfile>, suffix: &str) -> Arc<DependentImage> {
        let assets = Arc::new(
            DependentImage::new(Arc::clone(&self.base_image), dockerfile).with_suffix(suffix),
        );
        self.register(ASSETS_IMAGE, assets.clone());
        assets
    }

    pub fn images(&self) -> &[NamedImage] {
        &self.images
    }

    pub fn image(&self, name: &str) -> Option<&Arc<dyn VersionedImage>> {
        self.images
            .iter()
            .find(|named| named.name == name)
            .map(|named| &named.image)
    }
}

#[derive(Debug)]
pub struct Environment {
    name: String,
    app_name: String,
    docker: DockerSpec,
    kubernetes: Option<KubernetesConfig>,
}

impl Environment {
    pub fn new(name: impl Into<String>, app_name: impl Into<String>, docker: DockerSpec) -> Self {
        Self {
            name: name.into(),
            app_name: app_name.into(),
            docker,
            kubernetes: None,
        }
    }

    pub fn with_kubernetes(mut self, kubernetes: KubernetesConfig) -> Self {
        self.kubernetes = Some(kubernetes);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    pub fn is_development(&self) -> bool {
        self.name == DEVELOPMENT
    }

    pub fn docker(&self) -> &DockerSpec {
        &self.docker
    }

    pub fn kubernetes(&self) -> Option<&KubernetesConfig> {
        self.kubernetes.as_ref()
    }
}

/// All environments of an application as loaded from its config file.
pub struct Definition {
    app_name: String,
    base_dir: PathBuf,
    environments: BTreeMap<String, EnvironmentConfig>,
    tag_sources: TagSources,
}

impl Definition {
    pub fn new(config: Config, tag_sources: TagSources) -> Self {
        Self {
            app_name: config.app,
            base_dir: config.base_dir,
            environments: config.environments,
            tag_sources,
        }
    }

    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    pub fn environment_names(&self) -> impl Iterator<Item = &str> {
        self.environments.keys().map(String::as_str)
    }

    /// Builds the named environment, loading its Dockerfiles.
    pub fn environment(&self, name: &str) -> Result<Environment> {
        let config = self.environments.get(name).ok_or_else(|| {
            anyhow!(
                "Unknown environment {}, known environments: {}",
                name,
                self.environment_names().collect::<Vec<_>>().join(", ")
            )
        })?;
        info!("Configuring environment {} of {}", name, self.app_name);

        let docker = self
            .docker_spec(&config.docker)
            .with_context(|| format!("Failed to configure docker for environment {}", name))?;

        let environment = Environment::new(name, &self.app_name, docker);
        Ok(match &config.kubernetes {
            Some(kubernetes) => environment.with_kubernetes(kubernetes.clone()),
            None => environment,
        })
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        self.base_dir.join(path)
    }

    fn docker_spec(&self, config: &DockerConfig) -> Result<DockerSpec> {
        let context = self.resolve(&config.context);
        let dockerfile = Arc::new(Dockerfile::load(self.resolve(&config.dockerfile), &context)?);
        let reference = ImageReference::new(
            dockerfile,
            config.image.clone(),
            Arc::new(config.credentials.clone()),
        );
        let base_image =
            TimestampedImage::new(reference, self.tag_sources.select(&config.tag_sources));

        let mut spec = DockerSpec::new(Arc::new(base_image));
        for (key, value) in &config.build_args {
            spec.build_arg(key, value);
        }

        if let Some(assets) = &config.assets {
            let dockerfile = Dockerfile::load(self.resolve(&assets.dockerfile), &context)?;
            debug!("Registering assets image built from {}", dockerfile.name());
            spec.assets(Arc::new(dockerfile), &assets.suffix);
        }

        Ok(spec)
    }
}
