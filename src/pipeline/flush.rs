//! Timer-driven and shutdown flushes of the shared cache

use super::shared::SharedCache;
use crate::store::{StoreConnector, StoreError};
use crate::throttle::LogThrottle;

/// Write pending rows to the store
///
/// Without `force` nothing happens until a cache trigger fired; with `force`
/// any pending row is written (final flush at shutdown). Returns the number
/// of rows written.
pub fn flush_pending(
    cache: &SharedCache,
    connector: &dyn StoreConnector,
    force: bool,
    throttle: &mut LogThrottle,
) -> Result<usize, StoreError> {
    if force {
        if cache.is_empty() {
            return Ok(0);
        }
    } else if !cache.is_ready_for_flush() {
        return Ok(0);
    }

    let mut store = match connector.connect() {
        Ok(store) => store,
        Err(e) => {
            crate::throttled_error!(
                throttle,
                "❌ Can't connect to the database for flush ({} rows pending): {}",
                cache.len(),
                e
            );
            return Err(e);
        }
    };

    let written = if force {
        cache.flush(store.as_mut())?
    } else {
        cache.flush_if_ready(store.as_mut())?
    };

    if written > 0 {
        log::debug!("📊 Flush complete: {} rows -> {}", written, connector.describe());
    }
    Ok(written)
}
