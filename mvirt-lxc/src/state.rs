//! Local record of containers the lifecycle has touched.
//!
//! The identity is recorded right after the remote create succeeds, so a
//! later failure still leaves enough behind to clean up or import the
//! container.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::StateError;
use crate::types::{ContainerIdentity, NetworkSpec, Status};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerKind {
    Container,
    Template,
    Clone,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerRecord {
    pub identity: ContainerIdentity,
    pub kind: ContainerKind,
    /// `false` once the container is known to be deleted.
    pub present: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub networks: Vec<NetworkSpec>,
}

impl ContainerRecord {
    pub fn new(identity: ContainerIdentity, kind: ContainerKind) -> Self {
        Self {
            identity,
            kind,
            present: true,
            status: None,
            networks: Vec::new(),
        }
    }
}

#[async_trait]
pub trait StateRecorder: Send + Sync {
    /// Insert or replace the record of `record.identity`.
    async fn record(&self, record: &ContainerRecord) -> Result<(), StateError>;

    /// Mark a container as deleted. Unknown identities are ignored.
    async fn mark_absent(&self, identity: &ContainerIdentity) -> Result<(), StateError>;
}

/// Records nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRecorder;

#[async_trait]
impl StateRecorder for NoopRecorder {
    async fn record(&self, _record: &ContainerRecord) -> Result<(), StateError> {
        Ok(())
    }

    async fn mark_absent(&self, _identity: &ContainerIdentity) -> Result<(), StateError> {
        Ok(())
    }
}

/// JSON file keyed by `node/id`, rewritten on every change.
pub struct FileStateRecorder {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileStateRecorder {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All records, empty if the file does not exist yet.
    pub async fn load(&self) -> Result<BTreeMap<String, ContainerRecord>, StateError> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(source) => return Err(self.io_error(source)),
        };
        if contents.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        serde_json::from_str(&contents).map_err(|source| StateError::Corrupt {
            path: self.path.display().to_string(),
            source,
        })
    }

    pub async fn get(
        &self,
        identity: &ContainerIdentity,
    ) -> Result<Option<ContainerRecord>, StateError> {
        Ok(self.load().await?.remove(&identity.to_string()))
    }

    async fn store(&self, records: &BTreeMap<String, ContainerRecord>) -> Result<(), StateError> {
        let json = serde_json::to_string_pretty(records).map_err(|source| StateError::Corrupt {
            path: self.path.display().to_string(),
            source,
        })?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| self.io_error(e))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| self.io_error(e))
    }

    fn io_error(&self, source: std::io::Error) -> StateError {
        StateError::Io {
            path: self.path.display().to_string(),
            source,
        }
    }
}

#[async_trait]
impl StateRecorder for FileStateRecorder {
    async fn record(&self, record: &ContainerRecord) -> Result<(), StateError> {
        let _guard = self.lock.lock().await;
        let mut records = self.load().await?;
        records.insert(record.identity.to_string(), record.clone());
        self.store(&records).await
    }

    async fn mark_absent(&self, identity: &ContainerIdentity) -> Result<(), StateError> {
        let _guard = self.lock.lock().await;
        let mut records = self.load().await?;
        let Some(record) = records.get_mut(&identity.to_string()) else {
            return Ok(());
        };
        record.present = false;
        self.store(&records).await
    }
}
