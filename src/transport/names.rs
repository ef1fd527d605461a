use futures::future::join_all;
use log::{debug, warn};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex as TokioMutex;

use crate::models::is_placeholder_name;
use crate::transport::rest::ChatApi;

/// Display-name lookups against the user directory, cached per session.
/// Misses are cached too so an unknown id is only asked about once.
#[derive(Clone)]
pub struct NameResolver {
    api: Arc<dyn ChatApi>,
    cache: Arc<TokioMutex<HashMap<String, Option<String>>>>,
}

impl NameResolver {
    pub fn new(api: Arc<dyn ChatApi>) -> Self {
        NameResolver {
            api,
            cache: Arc::new(TokioMutex::new(HashMap::new())),
        }
    }

    pub async fn cached(&self, user_id: &str) -> Option<String> {
        self.cache.lock().await.get(user_id).cloned().flatten()
    }

    /// Resolve one id. Lookup failures are not cached so a later call can
    /// try again.
    pub async fn resolve(&self, user_id: &str) -> Option<String> {
        if let Some(hit) = self.cache.lock().await.get(user_id) {
            return hit.clone();
        }

        match self.api.lookup_name(user_id).await {
            Ok(name) => {
                let name = name.filter(|n| !is_placeholder_name(n, user_id));
                debug!("Resolved {} -> {:?}", user_id, name);
                self.cache.lock().await.insert(user_id.to_string(), name.clone());
                name
            }
            Err(e) => {
                warn!("Name lookup for {} failed: {}", user_id, e);
                None
            }
        }
    }

    /// Resolve many ids in parallel. Each distinct uncached id costs exactly
    /// one lookup.
    pub async fn resolve_many<I, S>(&self, user_ids: I) -> HashMap<String, String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut seen = HashSet::new();
        let distinct: Vec<String> = user_ids
            .into_iter()
            .map(|id| id.as_ref().to_string())
            .filter(|id| !id.is_empty() && seen.insert(id.clone()))
            .collect();

        let lookups = distinct.iter().map(|id| async move {
            let name = self.resolve(id).await;
            (id.clone(), name)
        });

        join_all(lookups)
            .await
            .into_iter()
            .filter_map(|(id, name)| name.map(|n| (id, n)))
            .collect()
    }
}
