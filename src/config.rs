use crate::credentials::Credentials;
use crate::dependent_image::ASSETS_TAG_SUFFIX;
use crate::image_reference::ImageUrl;
use anyhow::{Context, Result, bail};
use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::{env, fs, path::Path, path::PathBuf};
use tracing::info;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub app: String,
    pub environments: BTreeMap<String, EnvironmentConfig>,
    #[serde(default)]
    pub tls: Tls,
    /// Directory of the config file, relative paths are resolved against it.
    #[serde(skip)]
    pub base_dir: PathBuf,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tls {
    #[serde(default)]
    pub ca_certificate_paths: Vec<PathBuf>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentConfig {
    pub docker: DockerConfig,
    #[serde(default)]
    pub kubernetes: Option<KubernetesConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DockerConfig {
    pub image: ImageUrl,
    #[serde(default)]
    pub credentials: Credentials,
    #[serde(default = "default_dockerfile")]
    pub dockerfile: PathBuf,
    #[serde(default = "default_context")]
    pub context: PathBuf,
    #[serde(default = "default_tag_sources")]
    pub tag_sources: Vec<TagSourceKind>,
    #[serde(default)]
    pub build_args: BTreeMap<String, String>,
    #[serde(default)]
    pub assets: Option<AssetsConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TagSourceKind {
    Local,
    Registry,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetsConfig {
    pub dockerfile: PathBuf,
    #[serde(default = "default_assets_suffix")]
    pub suffix: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesConfig {
    pub namespace: String,
    #[serde(default)]
    pub kind: WorkloadKind,
    #[serde(alias = "deployment")]
    pub workload: String,
    pub container: String,
    #[serde(default)]
    pub assets_container: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub enum WorkloadKind {
    #[default]
    Deployment,
    StatefulSet,
    DaemonSet,
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkloadKind::Deployment => write!(f, "Deployment"),
            WorkloadKind::StatefulSet => write!(f, "StatefulSet"),
            WorkloadKind::DaemonSet => write!(f, "DaemonSet"),
        }
    }
}

fn default_dockerfile() -> PathBuf {
    PathBuf::from("Dockerfile")
}

fn default_context() -> PathBuf {
    PathBuf::from(".")
}

fn default_tag_sources() -> Vec<TagSourceKind> {
    vec![TagSourceKind::Local]
}

fn default_assets_suffix() -> String {
    ASSETS_TAG_SUFFIX.to_string()
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    info!("Loading config from file {}", path.as_ref().display());
    let yaml_str = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

    let expanded = expand_env_vars(&yaml_str)?;

    let mut config: Config = serde_yaml_ng::from_str(&expanded)
        .context("Failed to parse YAML config after environment variable expansion")?;
    config.base_dir = path
        .as_ref()
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default();

    Ok(config)
}

/// Replaces `${VAR}` placeholders with environment variables values.
/// Returns an error naming every missing env var.
fn expand_env_vars(input: &str) -> Result<String> {
    let re =
        Regex::new(r"\$\{([^}]+)}").context("Invalid regex pattern for env var substitution")?;

    let mut missing = Vec::new();
    let result = re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        env::var(var_name).unwrap_or_else(|_| {
            missing.push(var_name.to_string());
            String::new()
        })
    });

    if !missing.is_empty() {
        bail!("Missing environment variable: {}", missing.join(", "));
    }

    Ok(result.into_owned())
}
