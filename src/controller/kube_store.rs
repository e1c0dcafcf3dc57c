//! [`Store`] implementation backed by the Kubernetes API server

use std::fmt::Debug;

use async_trait::async_trait;
use futures::{StreamExt, future};
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use k8s_openapi::api::storage::v1::StorageClass;
use kube::api::{ListParams, Patch, PatchParams, PostParams};
use kube::core::Selector;
use kube::runtime::watcher::{self, Config as WatcherConfig, Event};
use kube::runtime::WatchStreamExt;
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::controller::error::{Error, Result};
use crate::controller::store::{ObjectKey, Store, WatchEvent, WatchStream};
use crate::crd::{VolumeReplication, VolumeReplicationClass, VolumeReplicationGroup};

/// Direct (uncached) access to the API server
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
    /// Restricts watches to one namespace when set
    namespace: Option<String>,
}

impl KubeStore {
    pub fn new(client: Client, namespace: Option<String>) -> Self {
        Self { client, namespace }
    }

    /// Helper to create a namespaced or cluster-wide API based on scope.
    fn scoped_api<K>(&self) -> Api<K>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        match self.namespace.as_deref() {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }

    fn watch<K>(&self, api: Api<K>) -> WatchStream<K>
    where
        K: Resource + Clone + DeserializeOwned + Debug + Send + 'static,
        K::DynamicType: Default,
    {
        let kind = K::kind(&K::DynamicType::default()).to_string();
        watcher::watcher(api, WatcherConfig::default().any_semantic())
            .default_backoff()
            .filter_map(move |event| {
                future::ready(match event {
                    Ok(Event::Apply(obj)) | Ok(Event::InitApply(obj)) => {
                        Some(WatchEvent::Applied(obj))
                    }
                    Ok(Event::Delete(obj)) => Some(WatchEvent::Deleted(obj)),
                    Ok(Event::Init) => Some(WatchEvent::Restarted),
                    Ok(Event::InitDone) => Some(WatchEvent::Relisted),
                    Err(e) => {
                        warn!(kind = %kind, error = %e, "Watch error, stream will retry");
                        None
                    }
                })
            })
            .boxed()
    }
}

/// Map a 409 response onto the conflict variant so callers need not inspect
/// HTTP codes
fn conflict_aware(err: kube::Error, what: &str) -> Error {
    match &err {
        kube::Error::Api(resp) if resp.code == 409 => Error::Conflict(format!("{}: {}", what, resp.message)),
        _ => Error::KubeError(err),
    }
}

#[async_trait]
impl Store for KubeStore {
    async fn get_group(&self, key: &ObjectKey) -> Result<Option<VolumeReplicationGroup>> {
        let api: Api<VolumeReplicationGroup> = Api::namespaced(self.client.clone(), &key.namespace);
        Ok(api.get_opt(&key.name).await?)
    }

    async fn list_groups(&self, namespace: &str) -> Result<Vec<VolumeReplicationGroup>> {
        let api: Api<VolumeReplicationGroup> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn list_claims(
        &self,
        namespace: &str,
        selector: &Selector,
    ) -> Result<Vec<PersistentVolumeClaim>> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        let params = ListParams::default().labels_from(selector);
        let claims = api.list(&params).await?.items;
        debug!(namespace, selector = %selector, count = claims.len(), "Listed PersistentVolumeClaims");
        Ok(claims)
    }

    async fn list_replication_classes(
        &self,
        selector: &Selector,
    ) -> Result<Vec<VolumeReplicationClass>> {
        let api: Api<VolumeReplicationClass> = Api::all(self.client.clone());
        let params = ListParams::default().labels_from(selector);
        Ok(api.list(&params).await?.items)
    }

    async fn get_storage_class(&self, name: &str) -> Result<StorageClass> {
        let api: Api<StorageClass> = Api::all(self.client.clone());
        api.get_opt(name)
            .await?
            .ok_or_else(|| Error::NotFound(format!("StorageClass {}", name)))
    }

    async fn update_group(
        &self,
        group: &VolumeReplicationGroup,
    ) -> Result<VolumeReplicationGroup> {
        let ns = group.namespace().unwrap_or_default();
        let name = group.name_any();
        let api: Api<VolumeReplicationGroup> = Api::namespaced(self.client.clone(), &ns);

        // replace carries metadata.resourceVersion, so a concurrent edit fails with 409
        api.replace(&name, &PostParams::default(), group)
            .await
            .map_err(|e| conflict_aware(e, &format!("VolumeReplicationGroup {}/{}", ns, name)))
    }

    async fn update_group_status(
        &self,
        group: &VolumeReplicationGroup,
    ) -> Result<VolumeReplicationGroup> {
        let ns = group.namespace().unwrap_or_default();
        let name = group.name_any();
        let api: Api<VolumeReplicationGroup> = Api::namespaced(self.client.clone(), &ns);

        let patch = serde_json::json!({
            "metadata": {
                "resourceVersion": group.resource_version(),
            },
            "status": group.status,
        });

        api.patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| conflict_aware(e, &format!("VolumeReplicationGroup {}/{} status", ns, name)))
    }

    fn watch_groups(&self) -> WatchStream<VolumeReplicationGroup> {
        self.watch(self.scoped_api())
    }

    fn watch_claims(&self) -> WatchStream<PersistentVolumeClaim> {
        self.watch(self.scoped_api())
    }

    fn watch_volume_replications(&self) -> WatchStream<VolumeReplication> {
        self.watch(self.scoped_api())
    }
}
