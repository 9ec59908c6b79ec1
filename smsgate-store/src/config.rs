use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::{
    Result, StoreError,
    backends::{MemoryStore, SqliteStore},
    r#trait::StoreHandles,
};

/// Which backend holds the queue.
///
/// # Examples
///
/// SQLite database on disk:
/// ```ron
/// Gateway (
///     store: Sqlite(
///         path: "/var/lib/smsgate/queue.db",
///     ),
/// )
/// ```
///
/// Volatile in-memory store for development:
/// ```ron
/// Gateway (
///     store: Memory,
/// )
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub enum StoreConfig {
    Sqlite {
        #[serde(default = "default_path")]
        path: PathBuf,
    },
    Memory,
}

fn default_path() -> PathBuf {
    PathBuf::from("/var/lib/smsgate/queue.db")
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::Sqlite {
            path: default_path(),
        }
    }
}

impl StoreConfig {
    /// Database location for file-backed stores.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::Sqlite { path } => Some(path),
            Self::Memory => None,
        }
    }

    /// Open the configured backend and hand out its three store roles.
    ///
    /// # Errors
    /// Returns an error if the database directory cannot be created or the
    /// database cannot be opened.
    pub async fn open(self) -> Result<StoreHandles> {
        match self {
            Self::Sqlite { path } => {
                if let Some(parent) = path.parent()
                    && !parent.as_os_str().is_empty()
                {
                    tokio::fs::create_dir_all(parent).await.map_err(|e| {
                        StoreError::Configuration(format!("{}: {e}", parent.display()))
                    })?;
                }
                Ok(StoreHandles::from_backend(
                    SqliteStore::open(&path).await?,
                ))
            }
            Self::Memory => Ok(StoreHandles::from_backend(MemoryStore::new())),
        }
    }
}
