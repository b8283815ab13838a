//! Process-wide provider schema cache
//!
//! Downstream code treats schema lookups as cheap in-memory reads. The bulk
//! preload makes that true: it takes the writer lock before fanning out, so
//! concurrent readers block until the whole batch is loaded, and no schema
//! is fetched twice.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::addrs;
use crate::config::Config;
use crate::context::Context;
use crate::provider::{GetSchemaResponse, ProviderFactories};
use crate::state::State;
use crate::types::Diagnostics;

pub struct SchemaCache {
    factories: ProviderFactories,
    schemas: RwLock<HashMap<addrs::Provider, Arc<GetSchemaResponse>>>,
}

impl SchemaCache {
    pub fn new(factories: ProviderFactories) -> Self {
        Self {
            factories,
            schemas: RwLock::new(HashMap::new()),
        }
    }

    pub fn factories(&self) -> &ProviderFactories {
        &self.factories
    }

    /// The schema response for one provider, fetching on first use. Failures
    /// produce a synthetic response carrying diagnostics; the entry is still
    /// recorded so later lookups do not retry.
    pub async fn schema(
        &self,
        ctx: &Context,
        provider: &addrs::Provider,
    ) -> Arc<GetSchemaResponse> {
        if let Some(found) = self.schemas.read().await.get(provider) {
            return found.clone();
        }

        let mut guard = self.schemas.write().await;
        // Another task may have loaded it while we waited for the lock.
        if let Some(found) = guard.get(provider) {
            return found.clone();
        }

        let response = Arc::new(self.fetch(ctx, provider).await);
        guard.insert(provider.clone(), response.clone());
        response
    }

    /// Loads every schema a config+state pair can need. The writer lock is
    /// taken up front and held across the whole batch: fetches run in
    /// parallel, results are drained sequentially by the lock holder.
    pub async fn preload(&self, ctx: &Context, config: &Config, state: &State) -> Diagnostics {
        let mut needed = config.provider_fqns();
        for fqn in state.provider_fqns() {
            if !needed.contains(&fqn) {
                needed.push(fqn);
            }
        }

        let mut guard = self.schemas.write().await;
        let missing: Vec<addrs::Provider> = needed
            .into_iter()
            .filter(|p| !guard.contains_key(p))
            .collect();

        tracing::debug!("preloading {} provider schemas", missing.len());

        let fetches = missing.iter().map(|p| self.fetch(ctx, p));
        let results = futures::future::join_all(fetches).await;

        let mut diagnostics = Diagnostics::new();
        for (provider, response) in missing.into_iter().zip(results) {
            diagnostics.extend(response.diagnostics.iter().cloned());
            guard.insert(provider, Arc::new(response));
        }
        diagnostics
    }

    async fn fetch(&self, ctx: &Context, provider: &addrs::Provider) -> GetSchemaResponse {
        let Some(factory) = self.factories.get(provider) else {
            return GetSchemaResponse::synthetic_error(
                provider,
                format!("no provider factory registered for {}", provider),
            );
        };

        let handle = match factory() {
            Ok(handle) => handle,
            Err(err) => {
                return GetSchemaResponse::synthetic_error(
                    provider,
                    format!("provider factory failed: {}", err),
                );
            }
        };

        let response = handle.get_schema(ctx.clone()).await;
        if let Some(err) = handle.close(ctx.clone()).await.error {
            tracing::warn!("provider {} failed to close after schema fetch: {}", provider, err);
        }
        response
    }
}
