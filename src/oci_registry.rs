use crate::credentials::Credentials;
use crate::image::{TagSource, ToolError};
use crate::image_reference::ImageUrl;
use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::Regex;
use reqwest::header::{ACCEPT, LINK};
use reqwest::{Certificate, Client, Response};
use serde::Deserialize;
use std::fs;
use std::path::PathBuf;
use tracing::{debug, info};

pub fn create_client(ca_certificate_paths: &[PathBuf]) -> Result<Client> {
    info!("Initializing OCI Registry HTTP client");
    // System certificates are loaded automatically with rustls-tls-native-roots
    let mut client_builder = Client::builder();

    for file_path in ca_certificate_paths {
        let file_content = fs::read(file_path)
            .with_context(|| format!("Failed to read file {}", file_path.display()))?;
        let cert = Certificate::from_pem(&file_content).context("Failed to parse certificate")?;
        client_builder = client_builder.add_root_certificate(cert);
    }

    client_builder.build().context("Failed to build HTTP client")
}

#[derive(Debug, Deserialize)]
struct TagList {
    // registries answer `null` for repositories without tags
    tags: Option<Vec<String>>,
}

/// Tags pushed to the remote registry, read from the distribution API.
pub struct RegistryTags {
    client: Client,
}

impl RegistryTags {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn fetch_tag_page(
        &self,
        url: &str,
        image_url: &ImageUrl,
        credentials: &Credentials,
    ) -> Result<Response, ToolError> {
        debug!("Fetching tag list from URL {}", url);
        let mut request = self.client.get(url).header(ACCEPT, "application/json");
        if let Some((username, password)) = credentials.basic_auth() {
            request = request.basic_auth(username, Some(password));
        }
        let response = request.send().await?;

        if !response.status().is_success() {
            return Err(ToolError::Protocol(format!(
                "registry {} returned error status {} while listing tags",
                image_url.registry,
                response.status()
            )));
        }
        Ok(response)
    }
}

fn tags_list_url(image_url: &ImageUrl) -> String {
    format!(
        "https://{}/v2/{}/tags/list",
        image_url.registry, image_url.repository
    )
}

/// Resolves the `rel="next"` target of a pagination `Link` header against the registry.
fn next_page_url(image_url: &ImageUrl, link_header: &str) -> Option<String> {
    let re = Regex::new(r#"<([^>]+)>\s*;\s*rel="?next"?"#).ok()?;
    let target = re.captures(link_header)?.get(1)?.as_str();
    if target.starts_with("http://") || target.starts_with("https://") {
        Some(target.to_string())
    } else {
        Some(format!("https://{}{}", image_url.registry, target))
    }
}

#[async_trait]
impl TagSource for RegistryTags {
    async fn tags(
        &self,
        image_url: &ImageUrl,
        credentials: &Credentials,
    ) -> Result<Vec<String>, ToolError> {
        let mut tags = Vec::new();
        let mut next = Some(tags_list_url(image_url));

        while let Some(url) = next.take() {
            let response = self.fetch_tag_page(&url, image_url, credentials).await?;
            next = response
                .headers()
                .get(LINK)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| next_page_url(image_url, value));

            let page: TagList = response.json().await.map_err(|e| {
                ToolError::Protocol(format!("invalid tag list from {}: {}", url, e))
            })?;
            tags.extend(page.tags.unwrap_or_default());
        }

        info!("Found {} tags for {} in registry", tags.len(), image_url);
        Ok(tags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url() -> ImageUrl {
        ImageUrl::parse("registry.example.com/acme/app").unwrap()
    }

    #[test]
    fn test_tags_list_url() {
        assert_eq!(
            tags_list_url(&url()),
            "https://registry.example.com/v2/acme/app/tags/list"
        );
    }

    #[test]
    fn test_next_page_url_relative() {
        let link = r#"</v2/acme/app/tags/list?last=20240101000000&n=100>; rel="next""#;
        assert_eq!(
            next_page_url(&url(), link).as_deref(),
            Some("https://registry.example.com/v2/acme/app/tags/list?last=20240101000000&n=100")
        );
    }

    #[test]
    fn test_next_page_url_absolute() {
        let link = r#"<https://mirror.example.com/v2/acme/app/tags/list?last=a>; rel="next""#;
        assert_eq!(
            next_page_url(&url(), link).as_deref(),
            Some("https://mirror.example.com/v2/acme/app/tags/list?last=a")
        );
    }

    #[test]
    fn test_next_page_url_missing() {
        assert_eq!(next_page_url(&url(), r#"</v2/acme/app/tags/list>; rel="prev""#), None);
    }

    #[test]
    fn test_tag_list_accepts_null_tags() {
        let page: TagList = serde_json::from_str(r#"{"name":"acme/app","tags":null}"#).unwrap();
        assert!(page.tags.is_none());

        let body = r#"{"name":"acme/app","tags":["20240101000000","latest"]}"#;
        let page: TagList = serde_json::from_str(body).unwrap();
        assert_eq!(page.tags.unwrap(), vec!["20240101000000", "latest"]);
    }

    #[test]
    fn test_create_client_with_missing_certificate_fails() {
        let result = create_client(&[PathBuf::from("/nonexistent/ca.pem")]);
        assert!(result.is_err());
    }
}
