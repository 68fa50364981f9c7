use crate::{AdmissionStore, AtomicBackend, DistributedStore, LocalStore, StoreContext};
use crate::{StoreError, StoreResult};
use sluice_core::{Datastore, LimiterSettings};
use std::sync::Arc;

/// Create the admission store selected by `settings.datastore`.
///
/// A distributed store needs the shared `backend` its peers use. Must be
/// called inside a Tokio runtime.
pub fn create_store(
    settings: &LimiterSettings,
    backend: Option<Arc<dyn AtomicBackend>>,
    context: StoreContext,
) -> StoreResult<Arc<dyn AdmissionStore>> {
    match settings.datastore {
        Datastore::Local => {
            if backend.is_some() {
                tracing::debug!(
                    limiter_id = %settings.id,
                    "Ignoring shared backend for a local limiter"
                );
            }
            Ok(Arc::new(LocalStore::new(settings, context)))
        }
        Datastore::Distributed => {
            let backend = backend.ok_or_else(|| {
                StoreError::ConfigError(
                    "distributed datastore requires a shared backend".to_string(),
                )
            })?;
            Ok(Arc::new(DistributedStore::new(settings, backend, context)))
        }
    }
}
