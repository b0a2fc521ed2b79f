//! Kubernetes API list/watch source.

use std::fmt::Debug;

use ::kube::api::{Api, ListParams, WatchEvent as ApiWatchEvent, WatchParams};
use ::kube::{Resource, ResourceExt};
use async_trait::async_trait;
use futures::StreamExt;
use serde::de::DeserializeOwned;

use super::{EventStream, ListWatch, Snapshot, WatchError, WatchEvent};
use crate::cache::{Version, Versioned};
use crate::key::ResourceKey;

/// Server-side watch timeout; the stream ends after this and is relisted.
const WATCH_TIMEOUT_SECS: u32 = 290;

/// HTTP status the API server uses for an expired resource version.
const STATUS_GONE: u16 = 410;

/// Lists and watches one resource type through an [`Api`] handle.
pub struct KubeListWatch<K> {
    api: Api<K>,
    label_selector: Option<String>,
}

impl<K> KubeListWatch<K> {
    pub fn new(api: Api<K>) -> Self {
        Self {
            api,
            label_selector: None,
        }
    }

    /// Restrict the watched collection with a label selector.
    pub fn with_label_selector(mut self, selector: impl Into<String>) -> Self {
        self.label_selector = Some(selector.into());
        self
    }

    fn list_params(&self) -> ListParams {
        match &self.label_selector {
            Some(selector) => ListParams::default().labels(selector),
            None => ListParams::default(),
        }
    }

    fn watch_params(&self) -> WatchParams {
        let params = WatchParams::default().timeout(WATCH_TIMEOUT_SECS);
        match &self.label_selector {
            Some(selector) => params.labels(selector),
            None => params,
        }
    }
}

/// Parse an API server resource version into a comparable token.
fn parse_version(key: &str, raw: Option<&str>) -> Result<Version, WatchError> {
    let raw = raw.ok_or_else(|| WatchError::InvalidVersion {
        key: key.to_string(),
        reason: "missing resourceVersion".to_string(),
    })?;
    raw.parse().map_err(|e| WatchError::InvalidVersion {
        key: key.to_string(),
        reason: format!("'{raw}': {e}"),
    })
}

fn versioned<K: Resource>(object: K) -> Result<Versioned<K>, WatchError> {
    let key = ResourceKey::from_resource(&object);
    let version = parse_version(&key.to_string(), object.resource_version().as_deref())?;
    Ok(Versioned::new(key, version, object))
}

fn convert<K: Resource>(event: ApiWatchEvent<K>) -> Result<WatchEvent<K>, WatchError> {
    match event {
        ApiWatchEvent::Added(object) => versioned(object).map(WatchEvent::Added),
        ApiWatchEvent::Modified(object) => versioned(object).map(WatchEvent::Modified),
        ApiWatchEvent::Deleted(object) => {
            let item = versioned(object)?;
            Ok(WatchEvent::Deleted {
                key: item.key,
                version: item.version,
            })
        }
        ApiWatchEvent::Bookmark(bookmark) => {
            parse_version("bookmark", Some(bookmark.metadata.resource_version.as_str()))
                .map(WatchEvent::Bookmark)
        }
        ApiWatchEvent::Error(response) if response.code == STATUS_GONE => Err(WatchError::Gone),
        ApiWatchEvent::Error(response) => Err(WatchError::Stream(format!(
            "{} ({}): {}",
            response.reason, response.code, response.message
        ))),
    }
}

#[async_trait]
impl<K> ListWatch for KubeListWatch<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    type Object = K;

    async fn list(&self) -> Result<Snapshot<K>, WatchError> {
        let list = self.api.list(&self.list_params()).await?;
        let version = parse_version("list", list.metadata.resource_version.as_deref())?;
        let items = list
            .items
            .into_iter()
            .map(versioned)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Snapshot { items, version })
    }

    async fn watch(&self, from: Version) -> Result<EventStream<K>, WatchError> {
        let stream = self
            .api
            .watch(&self.watch_params(), &from.to_string())
            .await?;
        Ok(stream
            .map(|event| event.map_err(WatchError::Api).and_then(convert))
            .boxed())
    }
}
