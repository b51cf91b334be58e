/*!
Vector store adapter (Qdrant HTTP API).

Capture requests a server-side snapshot per collection, downloads it, then
deletes the transient server-side snapshot. Deletion runs even when the
download fails so snapshot storage never leaks on the source server.

Restore uploads the snapshot file through the upload endpoint, which creates
or replaces the collection. The `recover` endpoint is a documented fallback
used only when the server reports the upload endpoint as unavailable.
*/

use super::{Cardinality, StoreAdapter};
use crate::config::VectorConfig;
use crate::metadata::{StoreKind, StoreManifest, UnitRecord};
use crate::{Result, VaultError};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Deserialize)]
struct CollectionsResponse {
    result: CollectionsResult,
}

#[derive(Deserialize)]
struct CollectionsResult {
    collections: Vec<CollectionDescriptor>,
}

#[derive(Deserialize)]
struct CollectionDescriptor {
    name: String,
}

#[derive(Deserialize)]
struct CollectionInfoResponse {
    result: CollectionInfo,
}

#[derive(Deserialize)]
struct CollectionInfo {
    #[serde(default)]
    points_count: u64,
}

#[derive(Deserialize)]
struct SnapshotResponse {
    result: SnapshotDescriptor,
}

#[derive(Deserialize)]
struct SnapshotDescriptor {
    name: String,
}

/// Qdrant-backed implementation of [`StoreAdapter`].
pub struct VectorAdapter {
    config: VectorConfig,
    client: Client,
}

impl VectorAdapter {
    pub fn new(config: VectorConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(300))
            .build()?;
        Ok(Self { config, client })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.url.trim_end_matches('/'), path)
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.api_key {
            Some(key) => builder.header("api-key", key),
            None => builder,
        }
    }

    /// Non-success responses surface as service errors; the capture and
    /// restore loops attribute them to the failing unit themselves.
    fn status_error(context: &str, status: StatusCode, body: &str) -> VaultError {
        VaultError::Service(format!(
            "vector store request for {context} failed: {status}: {}",
            body.trim()
        ))
    }

    async fn expect_success(
        &self,
        response: reqwest::Response,
        context: &str,
    ) -> Result<reqwest::Response> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(Self::status_error(context, status, &body))
        }
    }

    async fn list_collections(&self) -> Result<Vec<String>> {
        let response = self
            .request(self.client.get(self.url("collections")))
            .send()
            .await?;
        let response = self.expect_success(response, "collections").await?;
        let parsed: CollectionsResponse = response.json().await?;
        Ok(parsed
            .result
            .collections
            .into_iter()
            .map(|c| c.name)
            .collect())
    }

    async fn points_count(&self, collection: &str) -> Result<u64> {
        let response = self
            .request(self.client.get(self.url(&format!("collections/{collection}"))))
            .send()
            .await?;
        let response = self.expect_success(response, collection).await?;
        let parsed: CollectionInfoResponse = response.json().await?;
        Ok(parsed.result.points_count)
    }

    async fn create_snapshot(&self, collection: &str) -> Result<String> {
        let response = self
            .request(
                self.client
                    .post(self.url(&format!("collections/{collection}/snapshots"))),
            )
            .send()
            .await?;
        let response = self.expect_success(response, collection).await?;
        let parsed: SnapshotResponse = response.json().await?;
        Ok(parsed.result.name)
    }

    async fn download_snapshot(
        &self,
        collection: &str,
        snapshot: &str,
        dest: &Path,
    ) -> Result<()> {
        let response = self
            .request(self.client.get(self.url(&format!(
                "collections/{collection}/snapshots/{snapshot}"
            ))))
            .send()
            .await?;
        let response = self.expect_success(response, collection).await?;
        let bytes = response.bytes().await?;
        fs::write(dest, &bytes)?;
        Ok(())
    }

    async fn delete_snapshot(&self, collection: &str, snapshot: &str) -> Result<()> {
        let response = self
            .request(self.client.delete(self.url(&format!(
                "collections/{collection}/snapshots/{snapshot}"
            ))))
            .send()
            .await?;
        self.expect_success(response, collection).await?;
        Ok(())
    }

    /// Snapshot one collection to `dest`, cleaning up the server-side
    /// snapshot regardless of the download outcome.
    async fn capture_collection(&self, collection: &str, dest: &Path) -> Result<()> {
        let snapshot = self.create_snapshot(collection).await?;
        let download = self.download_snapshot(collection, &snapshot, dest).await;
        if let Err(e) = self.delete_snapshot(collection, &snapshot).await {
            warn!(collection, error = %e, "failed to delete server-side snapshot");
        }
        download
    }

    /// Primary restore path: multipart upload, creates or replaces the
    /// collection.
    async fn upload_snapshot(&self, collection: &str, file: &Path) -> Result<StatusCode> {
        let bytes = fs::read(file)?;
        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(format!("{collection}.snapshot"));
        let form = reqwest::multipart::Form::new().part("snapshot", part);
        let response = self
            .request(self.client.post(self.url(&format!(
                "collections/{collection}/snapshots/upload?priority=snapshot"
            ))))
            .multipart(form)
            .send()
            .await?;
        Ok(response.status())
    }

    /// Fallback restore path, used only when the upload endpoint is reported
    /// unavailable by the server.
    async fn recover_snapshot(&self, collection: &str, file: &Path) -> Result<()> {
        let location = format!("file://{}", file.display());
        let response = self
            .request(self.client.put(self.url(&format!(
                "collections/{collection}/snapshots/recover"
            ))))
            .json(&serde_json::json!({ "location": location }))
            .send()
            .await?;
        if response.status().is_success() {
            Ok(())
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(VaultError::restore(
                collection,
                format!("snapshot recover failed: {status}: {}", body.trim()),
            ))
        }
    }
}

#[async_trait]
impl StoreAdapter for VectorAdapter {
    fn kind(&self) -> StoreKind {
        StoreKind::Vector
    }

    async fn discover(&self) -> Result<Vec<String>> {
        self.list_collections().await
    }

    async fn capture(&self, dest: &Path) -> Result<StoreManifest> {
        fs::create_dir_all(dest)?;
        let collections = self.list_collections().await?;
        info!(count = collections.len(), "capturing vector collections");

        let mut manifest = StoreManifest::new(StoreKind::Vector);
        for collection in collections {
            let file_name = format!("{collection}.snapshot");
            let file = dest.join(&file_name);
            match self.capture_collection(&collection, &file).await {
                Ok(()) => {
                    debug!(collection, "collection snapshot captured");
                    manifest.push(UnitRecord::captured(
                        &collection,
                        vec![format!("{}/{file_name}", StoreKind::Vector.dir_name())],
                    ));
                }
                Err(e) => {
                    warn!(collection, error = %e, "collection capture failed");
                    manifest.push(UnitRecord::failed(&collection, e.to_string()));
                }
            }
        }
        Ok(manifest)
    }

    async fn restore(&self, src: &Path, manifest: &StoreManifest) -> Result<()> {
        for unit in manifest.captured_units() {
            let file = unit
                .files
                .first()
                .map(|f| src.join(f))
                .ok_or_else(|| VaultError::restore(&unit.name, "manifest lists no files"))?;

            let status = self.upload_snapshot(&unit.name, &file).await?;
            if status.is_success() {
                info!(collection = %unit.name, "collection restored from snapshot");
                continue;
            }
            if status == StatusCode::NOT_FOUND || status == StatusCode::NOT_IMPLEMENTED {
                // Server without the upload endpoint; fall back once.
                warn!(collection = %unit.name, %status, "upload endpoint unavailable, trying recover");
                self.recover_snapshot(&unit.name, &file).await?;
                info!(collection = %unit.name, "collection restored via recover endpoint");
                continue;
            }
            return Err(VaultError::restore(
                &unit.name,
                format!("snapshot upload failed with {status}"),
            ));
        }
        Ok(())
    }

    async fn is_empty(&self) -> Result<bool> {
        let collections = self.list_collections().await?;
        for collection in &collections {
            if self.points_count(collection).await? > 0 {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn probe(&self) -> Result<()> {
        self.list_collections().await.map(|_| ())
    }

    async fn cardinality(&self) -> Result<Vec<Cardinality>> {
        let mut counts = Vec::new();
        for collection in self.list_collections().await? {
            let points = self.points_count(&collection).await?;
            counts.push(Cardinality::new(collection, "points", points));
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_failures_are_service_errors() {
        let err = VectorAdapter::status_error(
            "memories",
            StatusCode::BAD_GATEWAY,
            "upstream unavailable",
        );
        assert!(matches!(err, VaultError::Service(_)));
        assert!(err.to_string().contains("memories"));
        assert!(err.to_string().contains("502"));
    }
}
