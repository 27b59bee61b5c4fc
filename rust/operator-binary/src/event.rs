use std::{fmt, sync::Arc};

use stackable_operator::{
    k8s_openapi::api::core::v1::Service,
    kube::{runtime::watcher, ResourceExt},
};

use crate::service::source_of;

/// Which cluster an event was observed on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, strum::Display, strum::IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum Origin {
    Hosted,
    Infra,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceKey {
    pub namespace: String,
    pub name: String,
}

impl ServiceKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn from_service(service: &Service) -> Option<Self> {
        Some(Self::new(
            service.namespace()?,
            service.metadata.name.clone()?,
        ))
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// A Service observed by one of the watch sources, tagged with where it was seen.
#[derive(Clone, Debug)]
pub struct ServiceEvent {
    pub origin: Origin,
    pub service: Arc<Service>,
}

impl ServiceEvent {
    pub fn new(origin: Origin, service: impl Into<Arc<Service>>) -> Self {
        Self {
            origin,
            service: service.into(),
        }
    }

    /// Translates a raw watcher event. Only events carrying an object produce a [`ServiceEvent`].
    pub fn from_watch(origin: Origin, event: watcher::Event<Service>) -> Option<Self> {
        match event {
            watcher::Event::Apply(service)
            | watcher::Event::InitApply(service)
            | watcher::Event::Delete(service) => Some(Self::new(origin, service)),
            watcher::Event::Init | watcher::Event::InitDone => None,
        }
    }

    pub fn request(&self) -> Option<SyncRequest> {
        let key = ServiceKey::from_service(&self.service)?;
        Some(match self.origin {
            Origin::Hosted => SyncRequest::hosted(key),
            Origin::Infra => SyncRequest::infra(key, source_of(&self.service)),
        })
    }
}

/// A unit of work for the reconciler.
///
/// `key` names the Service on the `origin` cluster. For infra requests, `source` carries the
/// hosted Service the mirror pointed at when it was last observed, so the pair can still be
/// resolved after the mirror is gone.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SyncRequest {
    pub origin: Origin,
    pub key: ServiceKey,
    pub source: Option<ServiceKey>,
}

impl SyncRequest {
    pub fn hosted(key: ServiceKey) -> Self {
        Self {
            origin: Origin::Hosted,
            key,
            source: None,
        }
    }

    pub fn infra(key: ServiceKey, source: Option<ServiceKey>) -> Self {
        Self {
            origin: Origin::Infra,
            key,
            source,
        }
    }
}

impl fmt::Display for SyncRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} Service {}", self.origin, self.key)
    }
}
