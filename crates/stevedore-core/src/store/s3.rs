use std::path::Path;

use async_trait::async_trait;
use aws_sdk_s3::config::{BehaviorVersion, Region};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

use super::{ArtifactKey, ArtifactMetadata, ArtifactStore};
use crate::error::{Error, Result};

/// Part size for multipart uploads; objects above one part go multipart.
const PART_SIZE: u64 = 8 * 1024 * 1024;

/// Connection settings for an S3-compatible store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct S3Config {
    pub bucket: String,
    /// Key prefix inside the bucket; empty means none.
    pub prefix: String,
    pub region: Option<String>,
    /// For MinIO and friends.
    pub endpoint_url: Option<String>,
    pub force_path_style: bool,
}

/// Single-bucket S3 store. Artifact keys become object keys under the
/// configured prefix.
#[derive(Debug)]
pub struct S3Store {
    client: Client,
    bucket: String,
    prefix: String,
}

impl S3Store {
    /// Connect using ambient AWS configuration plus the overrides in
    /// `config`.
    pub async fn connect(config: &S3Config) -> Result<Self> {
        if config.bucket.is_empty() {
            return Err(Error::Validation("s3 store has no bucket".into()));
        }

        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = &config.region {
            loader = loader.region(Region::new(region.clone()));
        }
        if let Some(endpoint) = &config.endpoint_url {
            loader = loader.endpoint_url(endpoint.clone());
        }
        let sdk_config = loader.load().await;

        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(config.force_path_style)
            .build();

        Ok(Self {
            client: Client::from_conf(s3_config),
            bucket: config.bucket.clone(),
            prefix: config.prefix.trim_matches('/').to_string(),
        })
    }

    fn object_key(&self, key: &ArtifactKey) -> String {
        self.prefixed(&key.to_string())
    }

    fn prefixed(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}/{key}", self.prefix)
        }
    }

    fn strip_prefix<'a>(&self, object_key: &'a str) -> &'a str {
        if self.prefix.is_empty() {
            object_key
        } else {
            object_key
                .strip_prefix(&self.prefix)
                .map(|rest| rest.trim_start_matches('/'))
                .unwrap_or(object_key)
        }
    }

    async fn upload_multipart(&self, object_key: &str, src: &Path, size: u64) -> Result<()> {
        let created = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(object_key)
            .send()
            .await
            .map_err(|e| Error::Artifact(format!("creating multipart upload: {e}")))?;

        let upload_id = created
            .upload_id()
            .ok_or_else(|| Error::Artifact("multipart upload has no id".into()))?
            .to_string();

        match self
            .upload_parts(object_key, &upload_id, src, size)
            .await
        {
            Ok(parts) => {
                self.client
                    .complete_multipart_upload()
                    .bucket(&self.bucket)
                    .key(object_key)
                    .upload_id(&upload_id)
                    .multipart_upload(
                        CompletedMultipartUpload::builder()
                            .set_parts(Some(parts))
                            .build(),
                    )
                    .send()
                    .await
                    .map_err(|e| Error::Artifact(format!("completing multipart upload: {e}")))?;
                Ok(())
            }
            Err(e) => {
                // Leave the key absent rather than partial.
                if let Err(abort_err) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(object_key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    warn!(object_key, error = %abort_err, "failed to abort multipart upload");
                }
                Err(e)
            }
        }
    }

    async fn upload_parts(
        &self,
        object_key: &str,
        upload_id: &str,
        src: &Path,
        size: u64,
    ) -> Result<Vec<CompletedPart>> {
        let mut file = tokio::fs::File::open(src)
            .await
            .map_err(|e| Error::Artifact(format!("opening '{}': {e}", src.display())))?;

        let mut parts = Vec::new();
        let mut remaining = size;
        let mut part_number: i32 = 1;

        while remaining > 0 {
            let chunk_len = remaining.min(PART_SIZE) as usize;
            let mut buf = vec![0u8; chunk_len];
            file.read_exact(&mut buf)
                .await
                .map_err(|e| Error::Artifact(format!("reading '{}': {e}", src.display())))?;

            let uploaded = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(object_key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(buf))
                .send()
                .await
                .map_err(|e| Error::Artifact(format!("uploading part {part_number}: {e}")))?;

            parts.push(
                CompletedPart::builder()
                    .part_number(part_number)
                    .set_e_tag(uploaded.e_tag().map(String::from))
                    .build(),
            );

            remaining -= chunk_len as u64;
            part_number += 1;
        }

        Ok(parts)
    }
}

#[async_trait]
impl ArtifactStore for S3Store {
    async fn upload(&self, key: &ArtifactKey, src: &Path) -> Result<()> {
        let object_key = self.object_key(key);
        let size = tokio::fs::metadata(src)
            .await
            .map_err(|e| Error::Artifact(format!("stat '{}': {e}", src.display())))?
            .len();

        if size > PART_SIZE {
            debug!(%key, size, "multipart upload");
            return self.upload_multipart(&object_key, src, size).await;
        }

        let body = ByteStream::from_path(src)
            .await
            .map_err(|e| Error::Artifact(format!("reading '{}': {e}", src.display())))?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&object_key)
            .body(body)
            .send()
            .await
            .map_err(|e| Error::Artifact(format!("uploading '{key}': {e}")))?;

        debug!(%key, size, "artifact uploaded");
        Ok(())
    }

    async fn download(&self, key: &ArtifactKey, dest: &Path) -> Result<()> {
        let object_key = self.object_key(key);
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&object_key)
            .send()
            .await
            .map_err(|e| {
                let not_found = e
                    .as_service_error()
                    .is_some_and(|se| se.is_no_such_key());
                if not_found {
                    Error::Artifact(format!("artifact '{key}' not found"))
                } else {
                    Error::Artifact(format!("downloading '{key}': {e}"))
                }
            })?;

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::Artifact(format!("creating '{}': {e}", parent.display())))?;
        }

        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|e| Error::Artifact(format!("creating '{}': {e}", dest.display())))?;

        let mut body = response.body;
        while let Some(chunk) = body
            .try_next()
            .await
            .map_err(|e| Error::Artifact(format!("streaming '{key}': {e}")))?
        {
            file.write_all(&chunk)
                .await
                .map_err(|e| Error::Artifact(format!("writing '{}': {e}", dest.display())))?;
        }
        file.flush()
            .await
            .map_err(|e| Error::Artifact(format!("flushing '{}': {e}", dest.display())))?;

        Ok(())
    }

    async fn delete(&self, key: &ArtifactKey) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(self.object_key(key))
            .send()
            .await
            .map_err(|e| Error::Artifact(format!("deleting '{key}': {e}")))?;
        Ok(())
    }

    async fn exists(&self, key: &ArtifactKey) -> Result<bool> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(self.object_key(key))
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                if e.as_service_error().is_some_and(|se| se.is_not_found()) {
                    Ok(false)
                } else {
                    Err(Error::Artifact(format!("probing '{key}': {e}")))
                }
            }
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ArtifactMetadata>> {
        let mut results = Vec::new();
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(self.prefixed(prefix))
            .into_paginator()
            .send();

        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| Error::Artifact(format!("listing '{prefix}': {e}")))?;
            for object in page.contents() {
                let Some(object_key) = object.key() else {
                    continue;
                };
                let modified = object.last_modified().and_then(|ts| {
                    chrono::DateTime::from_timestamp(ts.secs(), ts.subsec_nanos())
                });
                results.push(ArtifactMetadata {
                    key: self.strip_prefix(object_key).to_string(),
                    size: object.size().unwrap_or(0).max(0) as u64,
                    modified,
                });
            }
        }

        results.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(results)
    }
}
