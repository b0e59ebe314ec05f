//! Write-ahead log of pending uploads
//!
//! Every committed transaction produces a `DbMeta` naming its CARs. Before
//! those CARs and the meta reach the remote gateway, the meta is recorded
//! in the WAL so a restart can finish the upload. Entries leave the WAL only
//! after their CARs are durably stored.
//!
//! - `operations`: CARs to upload, then publish the meta
//! - `noLoaderOps`: CARs to upload, no meta publish (compaction output)
//! - `fileOperations`: standalone file blocks to upload

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

use crate::envelope::Envelope;
use crate::gateway::{Gateway, GatewayError};
use crate::meta::DbMeta;
use ember_core::Cid;

/// A pending file upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileOperation {
    /// File block CID
    pub cid: Cid,
    /// Stored unencrypted when true
    #[serde(default)]
    pub public: bool,
}

/// Persisted WAL record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalState {
    /// Metas whose CARs must be uploaded before the meta is published
    #[serde(default)]
    pub operations: Vec<DbMeta>,
    /// Metas whose CARs must be uploaded without publishing
    #[serde(default, rename = "noLoaderOps")]
    pub no_loader_ops: Vec<DbMeta>,
    /// Standalone files to upload
    #[serde(default, rename = "fileOperations")]
    pub file_operations: Vec<FileOperation>,
}

impl WalState {
    /// True when nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
            && self.no_loader_ops.is_empty()
            && self.file_operations.is_empty()
    }

    /// Number of pending entries.
    pub fn len(&self) -> usize {
        self.operations.len() + self.no_loader_ops.len() + self.file_operations.len()
    }
}

/// Destination of WAL processing.
#[async_trait]
pub trait WalSink: Send + Sync {
    /// Durably store the CAR `cid` remotely.
    async fn flush_car(&self, cid: &Cid) -> Result<(), GatewayError>;

    /// Durably store the file block `cid` remotely.
    async fn flush_file(&self, op: &FileOperation) -> Result<(), GatewayError>;

    /// Publish a meta once its CARs are stored.
    async fn publish_meta(&self, meta: &DbMeta) -> Result<(), GatewayError>;
}

/// WAL record persisted through a gateway.
pub struct WriteAheadLog {
    gateway: Arc<dyn Gateway>,
    url: Url,
    state: Mutex<WalState>,
    processing: Mutex<bool>,
}

impl WriteAheadLog {
    /// Load the WAL stored at `url`; a missing record is an empty WAL.
    pub async fn load(gateway: Arc<dyn Gateway>, url: Url) -> Result<Self, GatewayError> {
        let state = match gateway.get(&url).await {
            Ok(envelope) => envelope.into_wal()?,
            Err(e) if e.is_not_found() => WalState::default(),
            Err(e) => return Err(e),
        };
        debug!(target: "ember::loader", url = %url, pending = state.len(), "WAL loaded");
        Ok(Self {
            gateway,
            url,
            state: Mutex::new(state),
            processing: Mutex::new(false),
        })
    }

    /// Snapshot of the pending entries.
    pub fn state(&self) -> WalState {
        self.state.lock().clone()
    }

    /// Record a meta whose CARs still need uploading.
    pub async fn enqueue(&self, meta: DbMeta, no_loader: bool) -> Result<(), GatewayError> {
        {
            let mut state = self.state.lock();
            if no_loader {
                state.no_loader_ops.push(meta);
            } else {
                state.operations.push(meta);
            }
        }
        self.save().await
    }

    /// Record a file that still needs uploading.
    pub async fn enqueue_file(&self, cid: Cid, public: bool) -> Result<(), GatewayError> {
        self.state
            .lock()
            .file_operations
            .push(FileOperation { cid, public });
        self.save().await
    }

    async fn save(&self) -> Result<(), GatewayError> {
        let state = self.state();
        self.gateway.put(&self.url, Envelope::Wal(state)).await
    }

    /// Upload everything pending, oldest first.
    ///
    /// Returns the number of entries removed. Stops at the first failure and
    /// leaves that entry and everything after it in the WAL. A call made
    /// while another is running returns `Ok(0)`.
    pub async fn process(&self, sink: &dyn WalSink) -> Result<usize, GatewayError> {
        {
            let mut processing = self.processing.lock();
            if *processing {
                return Ok(0);
            }
            *processing = true;
        }
        let result = self.process_inner(sink).await;
        *self.processing.lock() = false;
        if let Err(e) = &result {
            warn!(target: "ember::loader", error = %e, "WAL processing stopped");
        }
        result
    }

    async fn process_inner(&self, sink: &dyn WalSink) -> Result<usize, GatewayError> {
        let mut done = 0;

        loop {
            let Some(meta) = self.peek(|s| s.no_loader_ops.first().cloned()) else {
                break;
            };
            for car in &meta.cars {
                sink.flush_car(car).await?;
            }
            self.remove_first(|s| &mut s.no_loader_ops);
            self.save().await?;
            done += 1;
        }

        loop {
            let Some(meta) = self.peek(|s| s.operations.first().cloned()) else {
                break;
            };
            for car in &meta.cars {
                sink.flush_car(car).await?;
            }
            sink.publish_meta(&meta).await?;
            self.remove_first(|s| &mut s.operations);
            self.save().await?;
            done += 1;
        }

        loop {
            let Some(op) = self.peek(|s| s.file_operations.first().cloned()) else {
                break;
            };
            sink.flush_file(&op).await?;
            self.remove_first(|s| &mut s.file_operations);
            self.save().await?;
            done += 1;
        }

        debug!(target: "ember::loader", processed = done, "WAL drained");
        Ok(done)
    }

    fn peek<T>(&self, f: impl FnOnce(&WalState) -> Option<T>) -> Option<T> {
        let state = self.state.lock();
        f(&state)
    }

    fn remove_first<T>(&self, list: impl FnOnce(&mut WalState) -> &mut Vec<T>) {
        let mut state = self.state.lock();
        let list = list(&mut state);
        if !list.is_empty() {
            list.remove(0);
        }
    }
}

impl std::fmt::Debug for WriteAheadLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteAheadLog")
            .field("url", &self.url)
            .field("pending", &self.state.lock().len())
            .finish()
    }
}
