use crate::environment::{Environment, NamedImage};
use crate::image::{ImageBuilder, VersionedImage};
use anyhow::{Context, bail};
use std::collections::BTreeMap;
use tracing::info;

/// Every image of the environment in build order, or only the named one.
pub fn selected_images(
    environment: &Environment,
    only: Option<&str>,
) -> anyhow::Result<Vec<NamedImage>> {
    let images = environment.docker().images();
    let Some(name) = only else {
        return Ok(images.to_vec());
    };

    let selected: Vec<NamedImage> = images.iter().filter(|n| n.name == name).cloned().collect();
    if selected.is_empty() {
        bail!(
            "Environment {} has no image named {}",
            environment.name(),
            name
        );
    }
    Ok(selected)
}

pub async fn build(
    images: &[NamedImage],
    builder: &dyn ImageBuilder,
    build_args: &BTreeMap<String, String>,
) -> anyhow::Result<()> {
    for named in images {
        let built = named
            .image
            .build(builder, build_args)
            .await
            .with_context(|| format!("Failed to build the {} image", named.name))?;
        info!("Built {} image {}", named.name, built.reference());
    }
    Ok(())
}

pub async fn push(images: &[NamedImage], builder: &dyn ImageBuilder) -> anyhow::Result<()> {
    for named in images {
        let pushed = named
            .image
            .push_all(builder)
            .await
            .with_context(|| format!("Failed to push the {} image", named.name))?;
        info!("Pushed {} image tags {}", named.name, pushed.join(", "));
    }
    Ok(())
}

/// Current, previous and next version of every image, one line each.
pub async fn versions(environment: &Environment) -> Vec<String> {
    let mut lines = vec![format!("{} ({})", environment.app_name(), environment.name())];
    for named in environment.docker().images() {
        lines.push(format!("  {}:", named.name));
        let versions = [
            ("current", named.image.current_version().await),
            ("previous", named.image.previous_version().await),
            ("new", named.image.new_version().await),
        ];
        for (label, version) in versions {
            lines.push(match version {
                Ok(version) => format!("    {:<8} {}", label, describe(version.as_ref())),
                Err(e) => format!("    {:<8} unavailable: {}", label, e),
            });
        }
    }
    lines
}

fn describe(version: &dyn VersionedImage) -> String {
    let reference = version.reference();
    if reference.alias_tags().is_empty() {
        reference.to_string()
    } else {
        format!("{} (also {})", reference, reference.alias_tags().join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dockerfile::Dockerfile;
    use crate::environment::DockerSpec;
    use crate::image::{ImageError, TagSource, VersionKind};
    use crate::testing::{RecordingBuilder, StaticImage, StaticTags, reference};
    use crate::timestamped_image::TimestampedImage;
    use std::sync::Arc;

    fn environment_on(base: StaticImage) -> Environment {
        let base: Arc<dyn VersionedImage> = Arc::new(base);
        let mut docker = DockerSpec::new(base);
        docker.assets(Arc::new(Dockerfile::new("assets", ".").from("nginx")), "-assets");
        Environment::new("production", "shop", docker)
    }

    fn environment() -> Environment {
        environment_on(StaticImage::new("v3", &["latest"], "v2", &[]))
    }

    #[test]
    fn test_selected_images() {
        let environment = environment();

        let all = selected_images(&environment, None).unwrap();
        assert_eq!(all.len(), 2);

        let assets = selected_images(&environment, Some("assets")).unwrap();
        assert_eq!(assets.len(), 1);
        assert_eq!(assets[0].name, "assets");

        let err = selected_images(&environment, Some("worker")).unwrap_err();
        assert_eq!(err.to_string(), "Environment production has no image named worker");
    }

    #[tokio::test]
    async fn test_build_builds_base_then_assets() {
        let environment = environment();
        let builder = RecordingBuilder::default();
        let images = selected_images(&environment, None).unwrap();

        build(&images, &builder, &BTreeMap::new()).await.unwrap();

        assert_eq!(
            builder.builds(),
            vec![
                vec!["v3".to_string(), "latest".to_string()],
                vec!["v3-assets".to_string(), "latest-assets".to_string()],
            ]
        );
    }

    #[tokio::test]
    async fn test_build_tags_assets_with_the_built_base_version() {
        let base: Arc<dyn VersionedImage> = Arc::new(TimestampedImage::new(
            reference("registry.example.com/acme/app"),
            vec![Arc::new(StaticTags::of(&["20240101000000"])) as Arc<dyn TagSource>],
        ));
        let mut docker = DockerSpec::new(base);
        docker.assets(
            Arc::new(Dockerfile::new("assets", ".").from("nginx")),
            "-assets",
        );
        let environment = Environment::new("production", "shop", docker);
        let builder = RecordingBuilder::default();
        let images = selected_images(&environment, None).unwrap();

        build(&images, &builder, &BTreeMap::new()).await.unwrap();

        let builds = builder.builds();
        assert_eq!(builds.len(), 2);
        let app_tag = &builds[0][0];
        assert_ne!(app_tag, "20240101000000");
        assert_eq!(builds[0][1], "latest");
        assert_eq!(
            builds[1],
            vec![format!("{}-assets", app_tag), "latest-assets".to_string()]
        );
    }

    #[tokio::test]
    async fn test_build_stops_at_first_failure() {
        let environment = environment();
        let builder = RecordingBuilder::failing("daemon not running");
        let images = selected_images(&environment, None).unwrap();

        let err = build(&images, &builder, &BTreeMap::new()).await.unwrap_err();

        assert_eq!(err.to_string(), "Failed to build the app image");
        assert!(builder.builds().is_empty());
    }

    #[tokio::test]
    async fn test_push_pushes_every_image() {
        let environment = environment();
        let builder = RecordingBuilder::default();
        let images = selected_images(&environment, None).unwrap();

        push(&images, &builder).await.unwrap();

        assert_eq!(
            builder.pushes(),
            vec![
                "registry.example.com/acme/app:v3".to_string(),
                "registry.example.com/acme/app:latest".to_string(),
                "registry.example.com/acme/app:v3-assets".to_string(),
                "registry.example.com/acme/app:latest-assets".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_versions_lists_every_image() {
        let environment = environment();

        let lines = versions(&environment).await;

        assert_eq!(
            lines,
            vec![
                "shop (production)",
                "  app:",
                "    current  registry.example.com/acme/app:v3 (also latest)",
                "    previous registry.example.com/acme/app:v2",
                "    new      registry.example.com/acme/app:v3 (also latest)",
                "  assets:",
                "    current  registry.example.com/acme/app:v3-assets (also latest-assets)",
                "    previous registry.example.com/acme/app:v2-assets",
                "    new      registry.example.com/acme/app:v3-assets (also latest-assets)",
            ]
        );
    }

    #[tokio::test]
    async fn test_versions_reports_unavailable_base() {
        let environment = environment_on(StaticImage::failing(
            ImageError::BaseVersionUnavailable {
                image: "registry.example.com/acme/app".to_string(),
                kind: VersionKind::Current,
                reason: "no timestamp tags found".to_string(),
            },
        ));

        let lines = versions(&environment).await;

        assert_eq!(
            lines[2],
            concat!(
                "    current  unavailable: current version of registry.example.com/acme/app ",
                "is unavailable: no timestamp tags found"
            )
        );
        assert!(lines[6].starts_with("    current  unavailable"));
    }
}
