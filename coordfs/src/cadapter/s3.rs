//! S3 适配器：基于 aws-sdk-s3 的实现，支持大对象的分段上传、基础重试与校验。

use super::{BackendAddr, BackendError, ObjectMeta, ObjectStream, PutResponse, StorageBackend};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::Client;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use log::{debug, warn};
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::Semaphore;
use tokio::time::{Duration, sleep};

/// S3 后端配置选项
#[derive(Debug, Clone)]
pub struct S3Config {
    /// 分段大小（字节），建议 8-64MiB；不超过该大小的对象走单次 PUT
    pub part_size: usize,
    /// 最大并发分段上传数
    pub max_concurrency: usize,
    /// 最大重试次数
    pub max_retries: u32,
    /// 初始重试延迟（毫秒）
    pub initial_retry_delay_ms: u64,
    pub region: Option<String>,
    /// 自建 S3 兼容服务（如 MinIO）的地址
    pub endpoint: Option<String>,
    pub force_path_style: bool,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            part_size: 8 * 1024 * 1024, // 8MB
            max_concurrency: 8,
            max_retries: 3,
            initial_retry_delay_ms: 100,
            region: None,
            endpoint: None,
            force_path_style: true,
        }
    }
}

pub struct S3Backend {
    client: Client,
    bucket: String,
    config: S3Config,
}

impl S3Backend {
    pub async fn new(bucket: impl Into<String>, config: S3Config) -> Result<Self, BackendError> {
        let mut loader = aws_config::defaults(BehaviorVersion::latest()).credentials_provider(
            aws_config::environment::EnvironmentVariableCredentialsProvider::new(),
        );
        if let Some(region) = &config.region {
            loader = loader.region(aws_config::Region::new(region.clone()));
        }
        if let Some(endpoint) = &config.endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        let conf = loader.load().await;
        let s3_conf = aws_sdk_s3::config::Builder::from(&conf)
            .force_path_style(config.force_path_style)
            .build();
        Ok(Self::with_client(Client::from_conf(s3_conf), bucket, config))
    }

    pub fn with_client(client: Client, bucket: impl Into<String>, config: S3Config) -> Self {
        Self {
            client,
            bucket: bucket.into(),
            config,
        }
    }

    fn object<'a>(&self, addr: &'a BackendAddr) -> Result<(&'a str, &'a str), BackendError> {
        match addr {
            BackendAddr::S3 { bucket, key } => Ok((bucket, key)),
            other => Err(BackendError::InvalidAddress {
                backend: format!("s3://{}", self.bucket),
                addr: other.to_string(),
            }),
        }
    }

    fn md5_base64(data: &[u8]) -> String {
        let sum = md5::compute(data);
        B64.encode(sum.0)
    }

    async fn execute_with_retry<T, F, Fut, E>(
        &self,
        operation: F,
        operation_name: &'static str,
    ) -> Result<T, BackendError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut attempt = 0;
        let max_retries = self.config.max_retries;
        loop {
            attempt += 1;
            match operation().await {
                Ok(result) => return Ok(result),
                Err(e) => {
                    if attempt > max_retries {
                        return Err(BackendError::S3(format!(
                            "{operation_name} failed after {max_retries} attempts: {e}"
                        )));
                    }
                    let delay_ms = self.config.initial_retry_delay_ms * 2u64.pow(attempt - 1);
                    debug!("{operation_name} attempt {attempt} failed: {e}; retrying in {delay_ms}ms");
                    sleep(Duration::from_millis(delay_ms)).await;
                }
            }
        }
    }

    async fn put_single(&self, bucket: &str, key: &str, source: &Path) -> Result<Option<String>, BackendError> {
        let data = tokio::fs::read(source).await?;
        let checksum = Self::md5_base64(&data);
        let operation = || async {
            self.client
                .put_object()
                .bucket(bucket)
                .key(key)
                .body(data.clone().into())
                .content_md5(checksum.clone())
                .send()
                .await
        };
        let resp = self.execute_with_retry(operation, "put_object").await?;
        Ok(resp.e_tag().map(str::to_string))
    }

    #[allow(clippy::too_many_arguments)]
    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: i32,
        source: &Path,
        offset: u64,
        len: usize,
        semaphore: Arc<Semaphore>,
    ) -> Result<(i32, Option<String>), BackendError> {
        let _permit = semaphore
            .acquire()
            .await
            .map_err(|e| BackendError::S3(e.to_string()))?;
        let mut file = tokio::fs::File::open(source).await?;
        file.seek(std::io::SeekFrom::Start(offset)).await?;
        let mut data = vec![0u8; len];
        file.read_exact(&mut data).await?;
        let checksum = Self::md5_base64(&data);

        let operation = || async {
            self.client
                .upload_part()
                .bucket(bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .content_md5(checksum.clone())
                .body(data.clone().into())
                .send()
                .await
        };
        self.execute_with_retry(operation, "upload_part")
            .await
            .map(|resp| (part_number, resp.e_tag().map(|s| s.to_string())))
    }

    async fn put_multipart(
        &self,
        bucket: &str,
        key: &str,
        source: &Path,
        size: u64,
    ) -> Result<Option<String>, BackendError> {
        let create = self
            .execute_with_retry(
                || {
                    self.client
                        .create_multipart_upload()
                        .bucket(bucket)
                        .key(key)
                        .send()
                },
                "create_multipart_upload",
            )
            .await?;
        let upload_id = create
            .upload_id()
            .ok_or_else(|| BackendError::S3(format!("no upload id returned for {key}")))?
            .to_string();
        let sem = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));

        // 并发上传各分片，每个分片自行从源文件读取对应区间
        let part_size = self.config.part_size as u64;
        let mut parts = Vec::new();
        let mut offset = 0u64;
        let mut part_number = 1i32;
        while offset < size {
            let len = part_size.min(size - offset) as usize;
            parts.push(self.upload_part(
                bucket,
                key,
                &upload_id,
                part_number,
                source,
                offset,
                len,
                sem.clone(),
            ));
            offset += len as u64;
            part_number += 1;
        }

        let results = match futures::future::try_join_all(parts).await {
            Ok(v) => v,
            Err(e) => {
                if let Err(abort) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    warn!("failed to abort multipart upload {upload_id} for {key}: {abort}");
                }
                return Err(e);
            }
        };

        let completed_parts = results
            .into_iter()
            .map(|(pn, etag)| {
                aws_sdk_s3::types::CompletedPart::builder()
                    .part_number(pn)
                    .set_e_tag(etag)
                    .build()
            })
            .collect::<Vec<_>>();
        let completed = aws_sdk_s3::types::CompletedMultipartUpload::builder()
            .set_parts(Some(completed_parts))
            .build();

        let resp = self
            .client
            .complete_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(&upload_id)
            .multipart_upload(completed)
            .send()
            .await
            .map_err(|e| BackendError::S3(e.to_string()))?;
        Ok(resp.e_tag().map(str::to_string))
    }

    async fn delete_prefix(&self, bucket: &str, prefix: &str) -> Result<usize, BackendError> {
        let mut deleted = 0;
        let mut token: Option<String> = None;
        loop {
            let resp = self
                .client
                .list_objects_v2()
                .bucket(bucket)
                .prefix(prefix)
                .set_continuation_token(token.clone())
                .send()
                .await
                .map_err(|e| BackendError::S3(e.to_string()))?;
            for object in resp.contents() {
                if let Some(key) = object.key() {
                    self.client
                        .delete_object()
                        .bucket(bucket)
                        .key(key)
                        .send()
                        .await
                        .map_err(|e| BackendError::S3(e.to_string()))?;
                    deleted += 1;
                }
            }
            match resp.next_continuation_token() {
                Some(next) => token = Some(next.to_string()),
                None => break,
            }
        }
        Ok(deleted)
    }
}

#[async_trait]
impl StorageBackend for S3Backend {
    fn name(&self) -> &str {
        &self.bucket
    }

    async fn exists(&self, addr: &BackendAddr) -> Result<bool, BackendError> {
        match self.head(addr).await {
            Ok(_) => Ok(true),
            Err(BackendError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn head(&self, addr: &BackendAddr) -> Result<ObjectMeta, BackendError> {
        let (bucket, key) = self.object(addr)?;
        match self.client.head_object().bucket(bucket).key(key).send().await {
            Ok(resp) => Ok(ObjectMeta {
                size: resp.content_length().unwrap_or_default().max(0) as u64,
                last_modified: resp
                    .last_modified()
                    .and_then(|t| t.to_millis().ok())
                    .unwrap_or_default(),
            }),
            Err(e) if e.as_service_error().is_some_and(|s| s.is_not_found()) => {
                Err(BackendError::NotFound(addr.to_string()))
            }
            Err(e) => Err(BackendError::S3(e.to_string())),
        }
    }

    async fn get(&self, addr: &BackendAddr) -> Result<ObjectStream, BackendError> {
        let (bucket, key) = self.object(addr)?;
        match self.client.get_object().bucket(bucket).key(key).send().await {
            Ok(resp) => Ok(Box::pin(resp.body.into_async_read())),
            Err(e) if e.as_service_error().is_some_and(|s| s.is_no_such_key()) => {
                Err(BackendError::NotFound(addr.to_string()))
            }
            Err(e) => Err(BackendError::S3(e.to_string())),
        }
    }

    async fn put(&self, addr: &BackendAddr, source: &Path) -> Result<PutResponse, BackendError> {
        let (bucket, key) = self.object(addr)?;
        let size = tokio::fs::metadata(source).await?.len();
        // 小对象直接 put_object；大对象走 multipart。
        let etag = if size <= self.config.part_size as u64 {
            self.put_single(bucket, key, source).await?
        } else {
            self.put_multipart(bucket, key, source, size).await?
        };
        let meta = self.head(addr).await?;
        Ok(PutResponse {
            size: meta.size,
            last_modified: meta.last_modified,
            etag,
        })
    }

    async fn delete(&self, addr: &BackendAddr, recursive: bool) -> Result<bool, BackendError> {
        let (bucket, key) = self.object(addr)?;
        let mut deleted = false;
        if recursive {
            deleted = self.delete_prefix(bucket, &format!("{key}/")).await? > 0;
        }
        if self.exists(addr).await? {
            self.client
                .delete_object()
                .bucket(bucket)
                .key(key)
                .send()
                .await
                .map_err(|e| BackendError::S3(e.to_string()))?;
            deleted = true;
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Needs an S3-compatible endpoint (e.g. MinIO) in COORDFS_S3_ENDPOINT and
    // credentials in the usual AWS_* variables.
    #[tokio::test]
    #[ignore]
    async fn test_s3_backend() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let endpoint = std::env::var("COORDFS_S3_ENDPOINT")?;
        let config = S3Config {
            endpoint: Some(endpoint),
            region: Some("us-east-1".into()),
            ..S3Config::default()
        };
        let backend = S3Backend::new("coordfs-test", config).await?;
        let tmp = tempfile::tempdir()?;
        let source = tmp.path().join("obj");
        tokio::fs::write(&source, b"hello").await?;

        let addr = BackendAddr::S3 {
            bucket: "coordfs-test".into(),
            key: "docs/a/obj".into(),
        };
        let resp = backend.put(&addr, &source).await?;
        assert_eq!(resp.size, 5);
        let mut body = Vec::new();
        backend.get(&addr).await?.read_to_end(&mut body).await?;
        assert_eq!(body, b"hello");

        let dir = BackendAddr::S3 {
            bucket: "coordfs-test".into(),
            key: "docs".into(),
        };
        assert!(backend.delete(&dir, true).await?);
        assert!(!backend.exists(&addr).await?);
        Ok(())
    }

    #[test]
    fn checksum_is_base64_md5() {
        assert_eq!(S3Backend::md5_base64(b""), "1B2M2Y8AsgTpgAmY7PhCfg==");
    }
}
