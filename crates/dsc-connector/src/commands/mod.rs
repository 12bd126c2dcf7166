//! Command implementations
//!
//! Each subcommand has its own module with a `run` function.

pub mod cancel;
pub mod refresh;
pub mod run;
pub mod status;

use crate::config::ConnectorConfig;
use crate::error::{ConnectorError, Result};
use dsc_transfer::{RecoveryManager, SqliteTransferStore, TransferObserver};
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::Arc;

/// Open the state database and wrap it in a recovery manager.
pub(crate) async fn open_manager(
    config: &ConnectorConfig,
    observer: Arc<dyn TransferObserver>,
) -> Result<(SqliteTransferStore, Arc<RecoveryManager>)> {
    let store =
        SqliteTransferStore::connect(&config.database_url, config.database_max_connections)
            .await?;
    let manager = Arc::new(RecoveryManager::new(Arc::new(store.clone()), observer));
    Ok((store, manager))
}

pub(crate) async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = tokio::fs::read(path)
        .await
        .map_err(|source| ConnectorError::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;
    serde_json::from_slice(&raw).map_err(|source| ConnectorError::InvalidJson {
        path: path.to_path_buf(),
        source,
    })
}
