//! Keeps every hosted LoadBalancer [`Service`] paired with exactly one mirror Service in the
//! agent's namespace on the infra cluster, and copies the address the infra load balancer assigns
//! to the mirror back into the hosted Service's status.
//!
//! Requests arrive from two independent watch sources and may be delivered in any interleaving.
//! Every reconcile reads fresh state from both API servers and every transition is idempotent, so
//! repeated or reordered requests converge to the same result.
use std::sync::Arc;

use snafu::{ResultExt, Snafu};
use stackable_operator::{
    k8s_openapi::api::core::v1::Service, kube::ResourceExt,
    logging::controller::ReconcilerError,
};
use strum::EnumDiscriminants;
use tracing::{debug, info, warn};

use crate::{
    client::{self, ClusterNameLookup, ServiceApi},
    context,
    event::{Origin, ServiceKey, SyncRequest},
    filter::{is_annotated_mirror, is_load_balancer, is_reconcilable},
    service::{self, build_mirror_service, ingress, is_mirror_of, source_of, with_ingress},
};

pub const CONTROLLER_NAME: &str = "svc-lb-sync";

pub struct Ctx {
    /// Namespace the agent runs in; all mirrors live here.
    pub namespace: String,
    pub infra: Arc<dyn ServiceApi>,
    pub hosted: Arc<dyn ServiceApi>,
    pub clusters: Arc<dyn ClusterNameLookup>,
}

#[derive(Snafu, Debug, EnumDiscriminants)]
#[strum_discriminants(derive(strum::IntoStaticStr))]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    #[snafu(display("failed to get mirror Service {mirror}"))]
    GetMirror {
        source: client::Error,
        mirror: ServiceKey,
    },
    #[snafu(display("failed to list mirror Services in namespace {namespace}"))]
    ListMirrors {
        source: client::Error,
        namespace: String,
    },
    #[snafu(display("failed to get hosted Service {hosted}"))]
    GetHosted {
        source: client::Error,
        hosted: ServiceKey,
    },
    #[snafu(display("failed to resolve the generated cluster name"))]
    ResolveClusterName { source: context::Error },
    #[snafu(display("failed to build mirror for hosted Service {hosted}"))]
    BuildMirror {
        source: service::Error,
        hosted: ServiceKey,
    },
    #[snafu(display("failed to create mirror for hosted Service {hosted}"))]
    CreateMirror {
        source: client::Error,
        hosted: ServiceKey,
    },
    #[snafu(display("failed to delete mirror Service {mirror}"))]
    DeleteMirror {
        source: client::Error,
        mirror: ServiceKey,
    },
    #[snafu(display("failed to update status of hosted Service {hosted}"))]
    UpdateHostedStatus {
        source: client::Error,
        hosted: ServiceKey,
    },
}
type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Whether retrying the request can succeed without someone changing the hosted Service.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Error::BuildMirror { .. })
    }
}

impl ReconcilerError for Error {
    fn category(&self) -> &'static str {
        ErrorDiscriminants::from(self).into()
    }
}

/// What a reconcile did.
#[derive(Clone, Debug, PartialEq, Eq, strum::IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum SyncAction {
    /// Neither side exists.
    Noop,
    /// The infra Service is a LoadBalancer the agent did not create.
    Unmanaged,
    CreatedMirror { mirror: ServiceKey },
    /// A mirror appeared between listing and creating.
    MirrorExists,
    DeletedMirror { mirrors: Vec<ServiceKey> },
    PropagatedStatus,
    /// The hosted Service already reports an address; it is left alone.
    StatusAlreadySet,
    /// The infra load balancer has not assigned an address to the mirror yet.
    AwaitingIngress,
}

/// Both halves of a pair as they currently exist.
#[derive(Debug, Default)]
struct ServicePair {
    hosted: Option<Service>,
    mirror: Option<Service>,
    /// Further mirrors pointing at the same hosted Service. Younger LoadBalancers and annotated
    /// Services whose type was changed both end up here.
    duplicates: Vec<Service>,
}

impl ServicePair {
    fn is_empty(&self) -> bool {
        self.hosted.is_none() && self.mirror.is_none() && self.duplicates.is_empty()
    }
}

pub async fn reconcile(request: &SyncRequest, ctx: &Ctx) -> Result<SyncAction> {
    debug!(%request, "starting reconcile");
    let mut pair = match request.origin {
        Origin::Hosted => resolve_from_hosted(&request.key, ctx).await?,
        Origin::Infra => match resolve_from_infra(&request.key, ctx).await? {
            Some(pair) => pair,
            None => return Ok(SyncAction::Unmanaged),
        },
    };
    if let (Origin::Infra, Some(source)) = (request.origin, &request.source) {
        // The mirror is gone, but the event told us which hosted Service it belonged to.
        if pair.is_empty() {
            pair = resolve_from_hosted(source, ctx).await?;
        }
    }

    let action = match pair {
        ServicePair {
            mirror: None,
            hosted: None,
            duplicates,
        } => {
            if duplicates.is_empty() {
                SyncAction::Noop
            } else {
                delete_mirrors(duplicates, ctx).await?
            }
        }
        ServicePair {
            mirror: None,
            hosted: Some(hosted),
            duplicates,
        } => {
            if !duplicates.is_empty() {
                delete_mirrors(duplicates, ctx).await?;
            }
            create_mirror(&hosted, ctx).await?
        }
        ServicePair {
            mirror: Some(mirror),
            hosted: None,
            duplicates,
        } => delete_mirrors(std::iter::once(mirror).chain(duplicates), ctx).await?,
        ServicePair {
            mirror: Some(mirror),
            hosted: Some(hosted),
            duplicates,
        } => {
            if !duplicates.is_empty() {
                delete_mirrors(duplicates, ctx).await?;
            }
            propagate_status(&mirror, &hosted, ctx).await?
        }
    };
    debug!(%request, ?action, "finished reconcile");
    Ok(action)
}

/// Resolves the pair of a mirror. `None` if the infra Service is not one of ours.
async fn resolve_from_infra(mirror_key: &ServiceKey, ctx: &Ctx) -> Result<Option<ServicePair>> {
    let Some(mirror) = ctx.infra.get(mirror_key).await.context(GetMirrorSnafu {
        mirror: mirror_key.clone(),
    })?
    else {
        return Ok(Some(ServicePair::default()));
    };
    let source = match source_of(&mirror) {
        Some(source) if is_annotated_mirror(&mirror) => source,
        _ if is_reconcilable(&mirror) => {
            debug!(mirror = %mirror_key, "LoadBalancer Service carries no source annotations, ignoring");
            return Ok(None);
        }
        _ => return Ok(Some(ServicePair::default())),
    };
    if !is_load_balancer(&mirror) {
        // The mirror's type was changed, so the scan files it under duplicates.
        return resolve_from_hosted(&source, ctx).await.map(Some);
    }
    let hosted = get_hosted(&source, ctx).await?;
    Ok(Some(ServicePair {
        hosted,
        mirror: Some(mirror),
        duplicates: Vec::new(),
    }))
}

/// Resolves the pair of a hosted Service by scanning the mirrors' source annotations.
async fn resolve_from_hosted(hosted_key: &ServiceKey, ctx: &Ctx) -> Result<ServicePair> {
    let hosted = get_hosted(hosted_key, ctx).await?;
    let mut mirrors: Vec<Service> = ctx
        .infra
        .list(&ctx.namespace)
        .await
        .context(ListMirrorsSnafu {
            namespace: &ctx.namespace,
        })?
        .into_iter()
        .filter(|svc| is_annotated_mirror(svc) && is_mirror_of(svc, hosted_key))
        .collect();
    mirrors.sort_by_key(|svc| {
        (
            svc.metadata.creation_timestamp.as_ref().map(|time| time.0),
            svc.name_any(),
        )
    });
    let (live, stale): (Vec<_>, Vec<_>) = mirrors.into_iter().partition(is_load_balancer);
    let mut live = live.into_iter();
    Ok(ServicePair {
        hosted,
        mirror: live.next(),
        duplicates: live.chain(stale).collect(),
    })
}

/// A hosted Service that stopped being a LoadBalancer counts as gone.
async fn get_hosted(hosted_key: &ServiceKey, ctx: &Ctx) -> Result<Option<Service>> {
    let hosted = ctx.hosted.get(hosted_key).await.context(GetHostedSnafu {
        hosted: hosted_key.clone(),
    })?;
    Ok(hosted.filter(is_reconcilable))
}

async fn create_mirror(hosted: &Service, ctx: &Ctx) -> Result<SyncAction> {
    let hosted_key = ServiceKey::new(hosted.namespace().unwrap_or_default(), hosted.name_any());
    let cluster_name = ctx
        .clusters
        .cluster_name(&ctx.namespace)
        .await
        .context(ResolveClusterNameSnafu)?;
    let mirror = build_mirror_service(hosted, &ctx.namespace, &cluster_name).context(
        BuildMirrorSnafu {
            hosted: hosted_key.clone(),
        },
    )?;
    match ctx.infra.create(&mirror).await {
        Ok(created) => {
            let mirror = ServiceKey::new(&ctx.namespace, created.name_any());
            info!(hosted = %hosted_key, %mirror, "created mirror Service");
            Ok(SyncAction::CreatedMirror { mirror })
        }
        Err(client::Error::AlreadyExists { target }) => {
            debug!(hosted = %hosted_key, mirror = %target, "mirror Service already exists");
            Ok(SyncAction::MirrorExists)
        }
        Err(source) => Err(Error::CreateMirror {
            source,
            hosted: hosted_key,
        }),
    }
}

async fn delete_mirrors(
    mirrors: impl IntoIterator<Item = Service>,
    ctx: &Ctx,
) -> Result<SyncAction> {
    let mut deleted = Vec::new();
    for mirror in mirrors {
        let key = ServiceKey::new(&ctx.namespace, mirror.name_any());
        ctx.infra.delete(&key).await.context(DeleteMirrorSnafu {
            mirror: key.clone(),
        })?;
        info!(mirror = %key, source = ?source_of(&mirror), "deleted mirror Service");
        deleted.push(key);
    }
    Ok(SyncAction::DeletedMirror { mirrors: deleted })
}

async fn propagate_status(mirror: &Service, hosted: &Service, ctx: &Ctx) -> Result<SyncAction> {
    if !ingress(hosted).is_empty() {
        return Ok(SyncAction::StatusAlreadySet);
    }
    let mirror_ingress = ingress(mirror);
    if mirror_ingress.is_empty() {
        return Ok(SyncAction::AwaitingIngress);
    }

    let hosted_key = ServiceKey::new(hosted.namespace().unwrap_or_default(), hosted.name_any());
    let updated = with_ingress(hosted, mirror_ingress);
    match ctx.hosted.update_status(&updated).await {
        Ok(_) => {
            info!(hosted = %hosted_key, mirror = %mirror.name_any(), "propagated load balancer ingress");
            Ok(SyncAction::PropagatedStatus)
        }
        Err(source) => {
            if matches!(source, client::Error::NotFound { .. }) {
                warn!(hosted = %hosted_key, "hosted Service vanished during status update");
            }
            Err(Error::UpdateHostedStatus {
                source,
                hosted: hosted_key,
            })
        }
    }
}
