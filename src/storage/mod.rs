//! `ObjectStorage`: the object-storage capability boundary. Sources live at
//! `submissions/{submission_id}/source.code`; data packs at
//! `problems/{problem_id}/versions/{version}/data-pack.tar.zst`.

pub mod inmemory;
#[cfg(feature = "s3")]
pub mod s3;

use async_trait::async_trait;

use crate::error::prelude::*;

#[async_trait]
pub trait ObjectStorage: Send + Sync {
    async fn get_stream(&self, key: &str) -> Result<Vec<u8>>;
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<()>;
    /// Multipart upload; the in-memory/test implementation just concatenates
    /// `parts`, production backends stream each part directly.
    async fn put_multipart(&self, key: &str, parts: Vec<Vec<u8>>) -> Result<()>;
}

pub fn source_key(submission_id: &str) -> String {
    format!("submissions/{submission_id}/source.code")
}

pub fn data_pack_key(problem_id: i64, version: u32) -> String {
    format!("problems/{problem_id}/versions/{version}/data-pack.tar.zst")
}
