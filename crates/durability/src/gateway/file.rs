//! File-system gateway
//!
//! `file://` URLs map to paths; each key is one file holding the encoded
//! envelope. Writes go to a temporary sibling and are renamed into place.

use std::io::ErrorKind;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::fs;
use tracing::debug;
use url::Url;

use super::{accepted_types, Gateway, GatewayError, GatewayResult, Subscription};
use crate::envelope::Envelope;

/// Gateway storing one file per key.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileGateway;

impl FileGateway {
    /// Create a file gateway
    pub fn new() -> Self {
        Self
    }
}

fn to_path(url: &Url) -> GatewayResult<PathBuf> {
    if url.scheme() != "file" {
        return Err(GatewayError::InvalidUrl(format!(
            "{} is not a file url",
            url
        )));
    }
    url.to_file_path()
        .map_err(|_| GatewayError::InvalidUrl(url.to_string()))
}

#[async_trait]
impl Gateway for FileGateway {
    async fn start(&self, url: &Url) -> GatewayResult<Url> {
        let path = to_path(url)?;
        fs::create_dir_all(&path).await?;
        debug!(target: "ember::gateway", path = %path.display(), "File gateway started");
        Ok(url.clone())
    }

    async fn close(&self, _url: &Url) -> GatewayResult<()> {
        Ok(())
    }

    async fn delete(&self, url: &Url) -> GatewayResult<()> {
        match fs::remove_file(to_path(url)?).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn destroy(&self, url: &Url) -> GatewayResult<()> {
        let path = to_path(url)?;
        let result = match fs::metadata(&path).await {
            Ok(meta) if meta.is_dir() => fs::remove_dir_all(&path).await,
            Ok(_) => fs::remove_file(&path).await,
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        };
        result?;
        debug!(target: "ember::gateway", path = %path.display(), "Destroyed");
        Ok(())
    }

    async fn put(&self, url: &Url, envelope: Envelope) -> GatewayResult<()> {
        let path = to_path(url)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let bytes = envelope.encode()?;
        let temp = path.with_extension("tmp");
        fs::write(&temp, &bytes).await?;
        if let Err(e) = fs::rename(&temp, &path).await {
            let _ = fs::remove_file(&temp).await;
            return Err(e.into());
        }
        debug!(target: "ember::gateway", path = %path.display(), bytes = bytes.len(), "put");
        Ok(())
    }

    async fn get(&self, url: &Url) -> GatewayResult<Envelope> {
        let path = to_path(url)?;
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(GatewayError::NotFound(path.display().to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Envelope::decode(&bytes, &accepted_types(url))?)
    }

    async fn subscribe(&self, _url: &Url) -> GatewayResult<Subscription> {
        Err(GatewayError::Unsupported(
            "file gateway has no subscriptions".into(),
        ))
    }
}
