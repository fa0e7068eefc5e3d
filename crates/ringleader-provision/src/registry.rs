//! Runtime image version lookup
//!
//! Asks the image registry (Docker Registry HTTP API v2) for the tags of
//! the cluster runtime image. Consumed only by the boot-config builder.

use crate::error::{ProvisionError, Result};
use serde::Deserialize;

/// Repository of the cluster runtime image.
pub const RUNTIME_IMAGE: &str = "ringleader/cassandra";

#[derive(Debug, Deserialize)]
struct TagList {
    tags: Vec<String>,
}

/// Newest tag of the runtime image. The registry returns tags in push
/// order, so the last entry wins.
pub async fn latest_runtime_version(registry: &str) -> Result<String> {
    let url = format!("https://{registry}/v2/{RUNTIME_IMAGE}/tags/list");
    tracing::debug!(%url, "fetching runtime image tags");

    let response = reqwest::get(&url)
        .await
        .map_err(|e| ProvisionError::Registry(e.to_string()))?;
    if !response.status().is_success() {
        return Err(ProvisionError::Registry(format!(
            "{url} returned {}",
            response.status()
        )));
    }

    let tag_list: TagList = response
        .json()
        .await
        .map_err(|e| ProvisionError::Registry(e.to_string()))?;
    tag_list
        .tags
        .last()
        .cloned()
        .ok_or_else(|| ProvisionError::Registry(format!("no tags published for {RUNTIME_IMAGE}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_list_parses_registry_response() {
        let body = r#"{"name":"ringleader/cassandra","tags":["3.11.0","4.1.3","4.1.4"]}"#;
        let tag_list: TagList = serde_json::from_str(body).unwrap();
        assert_eq!(tag_list.tags.last().map(String::as_str), Some("4.1.4"));
    }
}
