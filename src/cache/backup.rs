use std::path::PathBuf;

use async_trait::async_trait;

use crate::error::{AppError, AppErrorKind, IntoAppError};

/// Object-storage collaborator used only for cache backup. The real
/// implementation lives with the deployment; the crate ships a
/// directory-backed store for local runs and tests.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), AppError>;
    async fn get(&self, key: &str) -> Result<Vec<u8>, AppError>;
    async fn exists(&self, key: &str) -> Result<bool, AppError>;
}

/// Flat-file object store: one file per key under a root directory.
pub struct DirObjectStore {
    root: PathBuf,
}

impl DirObjectStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        // keys are content-addressed uids, never path fragments
        self.root.join(key.replace(['/', '\\'], "_"))
    }
}

#[async_trait]
impl ObjectStore for DirObjectStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), AppError> {
        tokio::fs::create_dir_all(&self.root).await.into_app_err(
            "failed to create object store root",
            AppErrorKind::Storage,
            &[],
        )?;
        tokio::fs::write(self.path_for(key), bytes)
            .await
            .into_app_err(
                "failed to write backup object",
                AppErrorKind::Storage,
                &[&format!("KEY: {key}")],
            )
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, AppError> {
        tokio::fs::read(self.path_for(key)).await.into_app_err(
            "failed to read backup object",
            AppErrorKind::Storage,
            &[&format!("KEY: {key}")],
        )
    }

    async fn exists(&self, key: &str) -> Result<bool, AppError> {
        tokio::fs::try_exists(self.path_for(key))
            .await
            .into_app_err(
                "failed to stat backup object",
                AppErrorKind::Storage,
                &[&format!("KEY: {key}")],
            )
    }
}
