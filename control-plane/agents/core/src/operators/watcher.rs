//! Generic list-and-watch cache over a custom resource type.
//!
//! The cache holds the latest known copy of every resource, emits
//! `new|mod|del` events to its subscribers, silently restarts a watch which
//! failed or went idle for too long, and makes every write wait until its own
//! event has come back through the watch, so a caller reading right after a
//! write sees it.

use futures::StreamExt;
use kube::{
    api::{ListParams, Patch, PatchParams, PostParams},
    Api, Resource, ResourceExt,
};
use kube_runtime::watcher;
use serde::{de::DeserializeOwned, Serialize};
use snafu::{ResultExt, Snafu};
use std::{collections::HashMap, fmt::Debug, sync::Arc, time::Duration};
use tokio::sync::{broadcast, watch as stop_watch, RwLock};

/// Errors from cache operations
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[allow(missing_docs)]
pub(crate) enum CacheError {
    #[snafu(display("Kubernetes api error"))]
    Kube { source: kube::Error },
}

/// Timings of the cache
#[derive(Clone, Debug)]
pub(crate) struct CacheParams {
    /// initial back-off after a failed list or watch, doubled per retry
    pub(crate) restart_delay: Duration,
    /// a watch with no traffic for this long is assumed dead and re-created
    pub(crate) idle_timeout: Duration,
    /// how long a write waits for its own event to come back
    pub(crate) event_timeout: Duration,
}

impl Default for CacheParams {
    fn default() -> Self {
        Self {
            restart_delay: Duration::from_secs(1),
            idle_timeout: Duration::from_secs(300),
            event_timeout: Duration::from_secs(5),
        }
    }
}

/// A change to one custom resource
#[derive(Clone, Debug)]
pub(crate) enum CrEvent<K> {
    New(K),
    Mod(K),
    Del(K),
}

impl<K: ResourceExt> CrEvent<K> {
    /// Name of the resource the event refers to
    pub(crate) fn name(&self) -> String {
        match self {
            CrEvent::New(k) | CrEvent::Mod(k) | CrEvent::Del(k) => k.name(),
        }
    }
}

/// List-and-watch cache over the custom resource `K`
pub(crate) struct CustomResourceCache<K> {
    api: Api<K>,
    params: CacheParams,
    cache: Arc<RwLock<HashMap<String, K>>>,
    events: broadcast::Sender<CrEvent<K>>,
    stop: stop_watch::Sender<bool>,
}

impl<K> CustomResourceCache<K>
where
    K: Resource<DynamicType = ()>
        + Clone
        + DeserializeOwned
        + Serialize
        + Debug
        + Send
        + Sync
        + 'static,
{
    pub(crate) fn new(api: Api<K>, params: CacheParams) -> Self {
        let (events, _) = broadcast::channel(256);
        let (stop, _) = stop_watch::channel(false);
        Self {
            api,
            params,
            cache: Default::default(),
            events,
            stop,
        }
    }

    /// Subscribe to resource events; the receiver gets everything emitted
    /// from this point on
    pub(crate) fn subscribe(&self) -> broadcast::Receiver<CrEvent<K>> {
        self.events.subscribe()
    }

    /// Returns once the first list has completed and the watch is running.
    /// List failures back off exponentially until one succeeds.
    pub(crate) async fn start(&self) {
        let mut delay = self.params.restart_delay;
        let initial = loop {
            match self.api.list(&ListParams::default()).await {
                Ok(list) => break list,
                Err(error) => {
                    tracing::warn!(
                        "Failed to list resources: {}. Retrying in {:?}...",
                        error,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(Duration::from_secs(60));
                }
            }
        };
        {
            let mut cache = self.cache.write().await;
            for resource in initial {
                let name = resource.name();
                cache.insert(name, resource.clone());
                let _ = self.events.send(CrEvent::New(resource));
            }
        }
        self.spawn_watch();
    }

    /// Tear the watch down; no further events are emitted
    pub(crate) fn stop(&self) {
        let _ = self.stop.send(true);
    }

    fn spawn_watch(&self) {
        let api = self.api.clone();
        let cache = self.cache.clone();
        let events = self.events.clone();
        let params = self.params.clone();
        let mut stopped = self.stop.subscribe();
        tokio::spawn(async move {
            loop {
                if *stopped.borrow() {
                    break;
                }
                let stream = watcher(api.clone(), ListParams::default());
                futures::pin_mut!(stream);
                loop {
                    let next = tokio::select! {
                        next = tokio::time::timeout(params.idle_timeout, stream.next()) => next,
                        _ = stopped.changed() => break,
                    };
                    match next {
                        // silence for too long: assume a black-holed
                        // connection and start over
                        Err(_) => {
                            tracing::debug!("Watch idle for {:?}, restarting", params.idle_timeout);
                            break;
                        }
                        Ok(None) => break,
                        Ok(Some(Err(error))) => {
                            tracing::warn!("Watch failed: {}. Restarting...", error);
                            tokio::time::sleep(params.restart_delay).await;
                            break;
                        }
                        Ok(Some(Ok(event))) => {
                            Self::handle(&cache, &events, event).await;
                        }
                    }
                }
            }
        });
    }

    async fn handle(
        cache: &Arc<RwLock<HashMap<String, K>>>,
        events: &broadcast::Sender<CrEvent<K>>,
        event: watcher::Event<K>,
    ) {
        match event {
            watcher::Event::Applied(resource) => {
                let name = resource.name();
                let mut cache = cache.write().await;
                match cache.get(&name) {
                    None => {
                        cache.insert(name, resource.clone());
                        let _ = events.send(CrEvent::New(resource));
                    }
                    Some(current) => {
                        if stale_generation(current, &resource) {
                            return;
                        }
                        cache.insert(name, resource.clone());
                        let _ = events.send(CrEvent::Mod(resource));
                    }
                }
            }
            watcher::Event::Deleted(resource) => {
                cache.write().await.remove(&resource.name());
                let _ = events.send(CrEvent::Del(resource));
            }
            watcher::Event::Restarted(resources) => {
                let mut cache = cache.write().await;
                let fresh: HashMap<String, K> = resources
                    .into_iter()
                    .map(|resource| (resource.name(), resource))
                    .collect();
                let gone: Vec<String> = cache
                    .keys()
                    .filter(|name| !fresh.contains_key(*name))
                    .cloned()
                    .collect();
                for name in gone {
                    if let Some(resource) = cache.remove(&name) {
                        let _ = events.send(CrEvent::Del(resource));
                    }
                }
                for (name, resource) in fresh {
                    match cache.get(&name) {
                        None => {
                            cache.insert(name, resource.clone());
                            let _ = events.send(CrEvent::New(resource));
                        }
                        Some(current) => {
                            if stale_generation(current, &resource) {
                                continue;
                            }
                            if current.resource_version() != resource.resource_version() {
                                cache.insert(name, resource.clone());
                                let _ = events.send(CrEvent::Mod(resource));
                            }
                        }
                    }
                }
            }
        }
    }

    /// Get a resource from the cache
    pub(crate) async fn get(&self, name: &str) -> Option<K> {
        self.cache.read().await.get(name).cloned()
    }

    /// All cached resources
    pub(crate) async fn list(&self) -> Vec<K> {
        self.cache.read().await.values().cloned().collect()
    }

    /// Wait for an event about `name`, with the configured timeout; a timeout
    /// is logged but not an error, the watch will catch up eventually
    async fn wait_own_event(&self, mut receiver: broadcast::Receiver<CrEvent<K>>, name: &str) {
        let result = tokio::time::timeout(self.params.event_timeout, async {
            loop {
                match receiver.recv().await {
                    Ok(event) if event.name() == name => break,
                    Ok(_) => continue,
                    Err(_) => break,
                }
            }
        })
        .await;
        if result.is_err() {
            tracing::warn!(
                "Did not observe our own write to '{}' within {:?}",
                name,
                self.params.event_timeout
            );
        }
    }

    /// Create the resource and wait until the watch reflects it
    pub(crate) async fn create(&self, resource: &K) -> Result<(), CacheError> {
        let receiver = self.subscribe();
        let name = resource.name();
        self.api
            .create(&PostParams::default(), resource)
            .await
            .context(KubeSnafu)?;
        self.wait_own_event(receiver, &name).await;
        Ok(())
    }

    /// Read-modify-replace of the whole resource, retried once on conflict
    pub(crate) async fn update<F: Fn(&mut K)>(
        &self,
        name: &str,
        mutate: F,
    ) -> Result<(), CacheError> {
        let receiver = self.subscribe();
        for attempt in 0..2 {
            let mut resource = self.api.get(name).await.context(KubeSnafu)?;
            mutate(&mut resource);
            match self
                .api
                .replace(name, &PostParams::default(), &resource)
                .await
            {
                Ok(_) => {
                    self.wait_own_event(receiver, name).await;
                    return Ok(());
                }
                Err(error) if attempt == 0 && is_conflict(&error) => {
                    tracing::debug!("Conflict updating '{}', retrying once", name);
                    continue;
                }
                Err(error) => return Err(CacheError::Kube { source: error }),
            }
        }
        unreachable!("the second attempt either returned or errored")
    }

    /// Merge-patch the status subresource and wait for the event
    pub(crate) async fn update_status<S: Serialize>(
        &self,
        name: &str,
        status: &S,
    ) -> Result<(), CacheError> {
        let receiver = self.subscribe();
        let patch = serde_json::json!({ "status": status });
        self.api
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .context(KubeSnafu)?;
        self.wait_own_event(receiver, name).await;
        Ok(())
    }

    /// Delete the resource; deleting something already gone is a success
    pub(crate) async fn delete(&self, name: &str) -> Result<(), CacheError> {
        let receiver = self.subscribe();
        match self.api.delete(name, &Default::default()).await {
            Ok(_) => {
                self.wait_own_event(receiver, name).await;
                Ok(())
            }
            Err(error) if is_not_found(&error) => Ok(()),
            Err(error) => Err(CacheError::Kube { source: error }),
        }
    }

    /// Add a finalizer to the resource, unless it is already there
    pub(crate) async fn add_finalizer(&self, name: &str, finalizer: &str) -> Result<(), CacheError> {
        let resource = self.api.get(name).await.context(KubeSnafu)?;
        if resource.finalizers().iter().any(|f| f == finalizer) {
            return Ok(());
        }
        let mut finalizers = resource.finalizers().to_vec();
        finalizers.push(finalizer.to_string());
        self.patch_finalizers(name, finalizers).await
    }

    /// Remove a finalizer from the resource, if it is there
    pub(crate) async fn remove_finalizer(
        &self,
        name: &str,
        finalizer: &str,
    ) -> Result<(), CacheError> {
        let resource = self.api.get(name).await.context(KubeSnafu)?;
        if !resource.finalizers().iter().any(|f| f == finalizer) {
            return Ok(());
        }
        let finalizers: Vec<String> = resource
            .finalizers()
            .iter()
            .filter(|f| f.as_str() != finalizer)
            .cloned()
            .collect();
        self.patch_finalizers(name, finalizers).await
    }

    async fn patch_finalizers(
        &self,
        name: &str,
        finalizers: Vec<String>,
    ) -> Result<(), CacheError> {
        let receiver = self.subscribe();
        let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
        self.api
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .context(KubeSnafu)?;
        self.wait_own_event(receiver, name).await;
        Ok(())
    }
}

/// A strictly older generation is a stale echo of something already seen
fn stale_generation<K: Resource>(current: &K, incoming: &K) -> bool {
    match (current.meta().generation, incoming.meta().generation) {
        (Some(current), Some(incoming)) => incoming < current,
        _ => false,
    }
}

fn is_conflict(error: &kube::Error) -> bool {
    matches!(error, kube::Error::Api(response) if response.code == 409)
}

fn is_not_found(error: &kube::Error) -> bool {
    matches!(error, kube::Error::Api(response) if response.code == 404)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operators::crd::MayastorNode;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn node(generation: Option<i64>) -> MayastorNode {
        MayastorNode {
            metadata: ObjectMeta {
                name: Some("node-1".to_string()),
                generation,
                ..Default::default()
            },
            spec: crate::operators::crd::MayastorNodeSpec {
                grpc_endpoint: "10.1.0.1:10124".to_string(),
            },
            status: None,
        }
    }

    #[test]
    fn only_strictly_older_generations_are_stale() {
        assert!(stale_generation(&node(Some(3)), &node(Some(2))));
        assert!(!stale_generation(&node(Some(3)), &node(Some(3))));
        assert!(!stale_generation(&node(Some(3)), &node(Some(4))));
        // status-only updates carry no generation bump and must pass
        assert!(!stale_generation(&node(None), &node(None)));
    }
}
