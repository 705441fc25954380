//! Per-environment Docker image builds and Kubernetes rollouts.
//!
//! Root images are versioned by timestamp tags. Dependent images (such as an
//! assets image built on top of the application image) carry no version of
//! their own: every version is the base image's version with annotated tags.

pub mod commands;
pub mod config;
pub mod credentials;
pub mod dependent_image;
pub mod docker_cli;
pub mod dockerfile;
pub mod environment;
pub mod image;
pub mod image_reference;
pub mod oci_registry;
pub mod rollout;
#[cfg(test)]
mod testing;
pub mod timestamped_image;

pub use dependent_image::DependentImage;
pub use environment::{Definition, Environment};
pub use image::{ImageBuilder, ImageError, ImageReference, VersionKind, VersionedImage};
pub use timestamped_image::TimestampedImage;
