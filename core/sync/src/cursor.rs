//! Persistent pull cursor.

use std::sync::Arc;
use tracing::{debug, info};

use fitsync_common::Result;
use fitsync_storage::KeyValueStore;

use crate::changeset::Cursor;

/// Key under which the cursor is stored.
pub const CURSOR_KEY: &str = "last_pulled_at";

/// The "last successfully pulled" marker.
///
/// Advanced only after an inbound change set has been fully applied.
#[derive(Clone)]
pub struct SyncCursor {
    store: Arc<dyn KeyValueStore>,
}

impl SyncCursor {
    /// Wrap a key/value store.
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Stored cursor, or `None` before the first successful pull.
    pub async fn get(&self) -> Result<Option<Cursor>> {
        let value = self.store.get(CURSOR_KEY).await?;
        Ok(value.filter(|v| !v.trim().is_empty()).map(Cursor::new))
    }

    /// Persist a new cursor.
    pub async fn set(&self, cursor: &Cursor) -> Result<()> {
        self.store.set(CURSOR_KEY, cursor.as_str()).await?;
        debug!("Cursor advanced to {}", cursor);
        Ok(())
    }

    /// Forget the cursor so the next pull is a full resynchronization.
    pub async fn reset(&self) -> Result<()> {
        self.store.remove(CURSOR_KEY).await?;
        info!("Sync cursor reset");
        Ok(())
    }
}
