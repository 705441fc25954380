use crate::config::{KubernetesConfig, WorkloadKind};
use crate::environment::{APP_IMAGE, ASSETS_IMAGE, Environment};
use anyhow::{Context, bail};
use chrono::Utc;
use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::core::v1::PodSpec;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::fmt::Debug;
use tracing::{debug, info};

static KUBESHIP_ROLLOUT_ANNOTATION: &str = "kubeship/rolledOutAt";
static KUBESHIP_FIELD_MANAGER: &str = "kubeship";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerImage {
    pub container: String,
    pub image: String,
}

pub async fn create_client() -> anyhow::Result<Client> {
    info!("Initializing K8s client");
    let client = Client::try_default().await?;
    let api_server_info = client.apiserver_version().await?;
    info!(
        "Connected to Kubernetes API server with version {}.{}",
        api_server_info.major, api_server_info.minor
    );
    Ok(client)
}

pub trait Workload
where
    Self: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + Send
        + Sync
        + DeserializeOwned
        + 'static,
{
    fn kind_name() -> &'static str {
        std::any::type_name::<Self>()
            .rsplit("::")
            .next()
            .unwrap_or("workload")
    }
    fn pod_spec(&self) -> Option<&PodSpec>;

    fn container_names(&self) -> Vec<String> {
        self.pod_spec()
            .map(|ps| ps.containers.iter().map(|c| c.name.clone()).collect())
            .unwrap_or_default()
    }

    /// Points the given containers at new images.
    /// Containers missing from the workload are an error.
    async fn patch_images(
        api: &Api<Self>,
        resource_name: &str,
        images: &[ContainerImage],
    ) -> anyhow::Result<()> {
        let k8s_resource_kind = Self::kind_name();
        let workload = api
            .get(resource_name)
            .await
            .with_context(|| format!("Failed to get {} {}", k8s_resource_kind, resource_name))?;

        let known = workload.container_names();
        if let Some(missing) = images.iter().find(|i| !known.contains(&i.container)) {
            bail!(
                "{} {} has no container {}, known containers: {}",
                k8s_resource_kind,
                resource_name,
                missing.container,
                known.join(", ")
            );
        }

        let patch = image_patch(images);
        debug!(
            "Patching {} {} with patch {:?}",
            k8s_resource_kind, resource_name, patch
        );
        api.patch(
            resource_name,
            &PatchParams::apply(KUBESHIP_FIELD_MANAGER),
            &Patch::Strategic(&patch),
        )
        .await
        .with_context(|| {
            format!(
                "Failed to patch {} {} to roll out new images",
                k8s_resource_kind, resource_name
            )
        })?;
        Ok(())
    }
}

impl Workload for Deployment {
    fn pod_spec(&self) -> Option<&PodSpec> {
        self.spec.as_ref().and_then(|s| s.template.spec.as_ref())
    }
}

impl Workload for StatefulSet {
    fn pod_spec(&self) -> Option<&PodSpec> {
        self.spec.as_ref().and_then(|s| s.template.spec.as_ref())
    }
}

impl Workload for DaemonSet {
    fn pod_spec(&self) -> Option<&PodSpec> {
        self.spec.as_ref().and_then(|s| s.template.spec.as_ref())
    }
}

/// Strategic merge patch: containers are merged by name, only their image changes.
fn image_patch(images: &[ContainerImage]) -> Value {
    let containers: Vec<Value> = images
        .iter()
        .map(|i| json!({ "name": i.container, "image": i.image }))
        .collect();

    json!({
        "spec": {
            "template": {
                "metadata": {
                    "annotations": {
                        KUBESHIP_ROLLOUT_ANNOTATION: Utc::now().to_rfc3339(),
                    }
                },
                "spec": {
                    "containers": containers,
                }
            }
        }
    })
}

/// Current version of every image the environment's workload runs.
pub async fn container_images(environment: &Environment) -> anyhow::Result<Vec<ContainerImage>> {
    let kubernetes = kubernetes_config(environment)?;
    let docker = environment.docker();

    let mut targets = vec![(kubernetes.container.clone(), APP_IMAGE)];
    if let Some(assets_container) = &kubernetes.assets_container {
        targets.push((assets_container.clone(), ASSETS_IMAGE));
    }

    let mut images = Vec::new();
    for (container, image_name) in targets {
        let image = docker.image(image_name).with_context(|| {
            format!(
                "Container {} needs the {} image, which environment {} does not define",
                container,
                image_name,
                environment.name()
            )
        })?;
        let current = image.current_version().await?;
        images.push(ContainerImage {
            container,
            image: current.reference().to_string(),
        });
    }
    Ok(images)
}

fn kubernetes_config(environment: &Environment) -> anyhow::Result<&KubernetesConfig> {
    environment.kubernetes().with_context(|| {
        format!(
            "Environment {} has no kubernetes configuration",
            environment.name()
        )
    })
}

pub async fn run(client: Client, environment: &Environment) -> anyhow::Result<()> {
    let kubernetes = kubernetes_config(environment)?;
    let images = container_images(environment).await?;

    for image in &images {
        info!(
            "Rolling out {} in container {} of {} {}",
            image.image, image.container, kubernetes.kind, kubernetes.workload
        );
    }

    match kubernetes.kind {
        WorkloadKind::Deployment => {
            let api: Api<Deployment> = Api::namespaced(client, &kubernetes.namespace);
            Deployment::patch_images(&api, &kubernetes.workload, &images).await?
        }
        WorkloadKind::StatefulSet => {
            let api: Api<StatefulSet> = Api::namespaced(client, &kubernetes.namespace);
            StatefulSet::patch_images(&api, &kubernetes.workload, &images).await?
        }
        WorkloadKind::DaemonSet => {
            let api: Api<DaemonSet> = Api::namespaced(client, &kubernetes.namespace);
            DaemonSet::patch_images(&api, &kubernetes.workload, &images).await?
        }
    }

    info!(
        "Successfully rolled out {} {}",
        kubernetes.kind, kubernetes.workload
    );
    Ok(())
}
