//! `AccountStore`: the pool's only persistence dependency. §9 requires atomic
//! write-temp-then-rename saves serialized through a single writer — the teacher's own
//! `auth.rs::save_auth_file` writes the target path directly, which this deliberately
//! does not copy (see DESIGN.md).

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::account::PoolSnapshot;

#[derive(Debug, Error)]
pub enum AccountsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<AccountsError> for switchboard_core::GatewayError {
    fn from(err: AccountsError) -> Self {
        switchboard_core::GatewayError::NetworkTransient { message: err.to_string() }
    }
}

#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn load(&self) -> Result<PoolSnapshot, AccountsError>;
    async fn save(&self, snapshot: &PoolSnapshot) -> Result<(), AccountsError>;
}

/// Writes to `<dir>/.accounts.tmp.<pid>` then renames onto the real path, so readers never
/// observe a half-written file. A `tokio::sync::Mutex` serializes saves; a save that arrives
/// while another is in flight simply waits its turn rather than racing the rename.
pub struct JsonFileAccountStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileAccountStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), write_lock: Mutex::new(()) }
    }

    fn tmp_path(&self) -> PathBuf {
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        dir.join(format!(".accounts.tmp.{}", std::process::id()))
    }
}

#[async_trait]
impl AccountStore for JsonFileAccountStore {
    async fn load(&self) -> Result<PoolSnapshot, AccountsError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => Ok(serde_json::from_str(&contents)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(PoolSnapshot::default()),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, snapshot: &PoolSnapshot) -> Result<(), AccountsError> {
        let _guard = self.write_lock.lock().await;

        if let Some(dir) = self.path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }

        let tmp = self.tmp_path();
        let json = serde_json::to_string_pretty(snapshot)?;
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}
