use std::sync::Arc;

use tracing::{debug, error, instrument, warn};

use crate::catalog::ManifestCatalog;
use crate::checkpoint::StoreId;
use crate::error::ErrorCode;
use crate::region::{
    ApplyState, RegionId, RegionLocalState, apply_state_key, decode_state,
    region_local_state_key,
};
use crate::result::{FastAddPeerResult, FastAddPeerStatus};
use crate::temp_store::{BuildError, TempPageStoreCache};

/// Maps a region to the store whose checkpoints hold its latest state.
pub trait StoreResolver: Send + Sync {
    fn owning_store(&self, region_id: RegionId) -> Option<StoreId>;
}

impl<F> StoreResolver for F
where
    F: Fn(RegionId) -> Option<StoreId> + Send + Sync,
{
    fn owning_store(&self, region_id: RegionId) -> Option<StoreId> {
        self(region_id)
    }
}

/// Status a restore reports when materializing a checkpoint fails.
///
/// Only data that is not visible yet asks the caller to wait; every other
/// failure, transient or not, fails this attempt.
pub fn classify_build_error(err: &BuildError) -> FastAddPeerStatus {
    let code = err.code();
    match code {
        ErrorCode::DataNotVisible | ErrorCode::CatalogUnavailable => {
            debug!(error = %err, %code, "checkpoint data not visible yet");
            FastAddPeerStatus::WaitForData
        }
        _ if code.is_transient() => {
            warn!(error = %err, %code, "checkpoint build failed, a later attempt may succeed");
            FastAddPeerStatus::Failed
        }
        _ => {
            error!(error = %err, %code, "checkpoint unusable for restore");
            FastAddPeerStatus::Failed
        }
    }
}

/// Recovers a region's apply state and local state from the newest
/// published checkpoint of its owning store.
pub struct RegionRestorer {
    resolver: Arc<dyn StoreResolver>,
    catalog: ManifestCatalog,
    cache: Arc<TempPageStoreCache>,
}

impl RegionRestorer {
    pub fn new(
        resolver: Arc<dyn StoreResolver>,
        catalog: ManifestCatalog,
        cache: Arc<TempPageStoreCache>,
    ) -> Self {
        Self {
            resolver,
            catalog,
            cache,
        }
    }

    /// Run one restore. Every outcome, including remote failures, is
    /// reported through the returned status.
    #[instrument(skip(self))]
    pub fn restore(&self, region_id: RegionId) -> FastAddPeerResult {
        let Some(store_id) = self.resolver.owning_store(region_id) else {
            debug!("no owning store known for region");
            return FastAddPeerResult::with_status(FastAddPeerStatus::NoSuitableCheckpoint);
        };

        let manifests = match self.catalog.list_manifests(store_id) {
            Ok(manifests) => manifests,
            Err(err) => {
                warn!(store_id, error = %err, code = %err.code(), "manifest listing failed");
                return FastAddPeerResult::with_status(FastAddPeerStatus::WaitForData);
            }
        };
        let Some(key) = manifests.latest_manifest_key() else {
            debug!(store_id, "no checkpoint published yet");
            return FastAddPeerResult::with_status(FastAddPeerStatus::WaitForData);
        };

        let view = match self.cache.get_or_build(&key) {
            Ok(view) => view,
            Err(err) => return FastAddPeerResult::with_status(classify_build_error(&err)),
        };

        let apply_page = view.read(&apply_state_key(region_id));
        let local_page = view.read(&region_local_state_key(region_id));
        let (Some(apply_page), Some(local_page)) = (apply_page, local_page) else {
            debug!(%key, "region state absent from checkpoint");
            return FastAddPeerResult::with_status(FastAddPeerStatus::NoSuitableCheckpoint);
        };

        let apply = decode_state::<ApplyState>(&apply_page.data);
        let local = decode_state::<RegionLocalState>(&local_page.data);
        match (apply, local) {
            (Ok(_), Ok(local)) if local.region.id == region_id => {
                debug!(%key, "region state recovered");
                FastAddPeerResult::ok(apply_page.data.to_vec(), local_page.data.to_vec())
            }
            (Ok(_), Ok(local)) => {
                warn!(%key, found = local.region.id, "local state belongs to another region");
                FastAddPeerResult::with_status(FastAddPeerStatus::BadData)
            }
            (Err(err), _) | (_, Err(err)) => {
                warn!(%key, error = %err, "region state could not be decoded");
                FastAddPeerResult::with_status(FastAddPeerStatus::BadData)
            }
        }
    }
}

impl std::fmt::Debug for RegionRestorer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegionRestorer")
            .field("catalog", &self.catalog)
            .finish()
    }
}
