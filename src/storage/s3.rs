//! S3-compatible `ObjectStorage` backend (also used against MinIO).

use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;

use crate::config::MinioConfig;
use crate::error::prelude::*;

use super::ObjectStorage;

pub struct S3ObjectStorage {
    client: Client,
    bucket: String,
}

impl S3ObjectStorage {
    pub async fn connect(config: &MinioConfig) -> Result<Self> {
        let shared_config = aws_config::from_env()
            .endpoint_url(&config.endpoint)
            .load()
            .await;
        let client = Client::new(&shared_config);
        Ok(Self {
            client,
            bucket: config.bucket.clone(),
        })
    }
}

#[async_trait]
impl ObjectStorage for S3ObjectStorage {
    async fn get_stream(&self, key: &str) -> Result<Vec<u8>> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .with_context(|| format!("couldn't get object {key}"))?;
        let bytes = output
            .body
            .collect()
            .await
            .with_context(|| format!("couldn't read object body for {key}"))?;
        Ok(bytes.into_bytes().to_vec())
    }

    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(bytes))
            .send()
            .await
            .with_context(|| format!("couldn't put object {key}"))?;
        Ok(())
    }

    async fn put_multipart(&self, key: &str, parts: Vec<Vec<u8>>) -> Result<()> {
        let create = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .with_context(|| format!("couldn't start multipart upload for {key}"))?;
        let upload_id = create
            .upload_id()
            .context("multipart upload response missing upload id")?;

        let mut completed = Vec::with_capacity(parts.len());
        for (i, part) in parts.into_iter().enumerate() {
            let part_number = i as i32 + 1;
            let uploaded = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(part))
                .send()
                .await
                .with_context(|| format!("couldn't upload part {part_number} for {key}"))?;
            completed.push(
                aws_sdk_s3::types::CompletedPart::builder()
                    .part_number(part_number)
                    .set_e_tag(uploaded.e_tag().map(str::to_string))
                    .build(),
            );
        }

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                aws_sdk_s3::types::CompletedMultipartUpload::builder()
                    .set_parts(Some(completed))
                    .build(),
            )
            .send()
            .await
            .with_context(|| format!("couldn't complete multipart upload for {key}"))?;

        Ok(())
    }
}
