use std::collections::BTreeMap;

use snafu::{OptionExt, ResultExt, Snafu};
use stackable_operator::{
    builder::meta::ObjectMetaBuilder,
    k8s_openapi::{
        api::core::v1::{LoadBalancerIngress, Service, ServicePort, ServiceSpec},
        apimachinery::pkg::util::intstr::IntOrString,
    },
    kube::ResourceExt,
    kvp::{Annotation, AnnotationError},
};

use crate::{
    conventions::{
        CLUSTER_NAME_LABEL, LOAD_BALANCER_SERVICE_TYPE, SOURCE_NAMESPACE_ANNOTATION,
        SOURCE_NAME_ANNOTATION,
    },
    event::ServiceKey,
};

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("object defines no namespace"))]
    ObjectHasNoNamespace,
    #[snafu(display("hosted Service {hosted} defines no ports"))]
    NoPorts { hosted: ServiceKey },
    #[snafu(display("port [{port_name}] of hosted Service {hosted} has no nodePort"))]
    NoNodePort {
        port_name: String,
        hosted: ServiceKey,
    },
    #[snafu(display("failed to build source annotations for hosted Service {hosted}"))]
    AnnotationBuild {
        source: AnnotationError,
        hosted: ServiceKey,
    },
}

/// Builds the infra cluster mirror of a hosted LoadBalancer [`Service`].
///
/// The mirror gets a server-generated name prefixed with the hosted name, records the hosted
/// identity in its source annotations and selects the Pods of the hosted cluster. Only the first
/// port is mirrored; its target is the nodePort the hosted cluster allocated, since that is where
/// the hosted cluster's worker Pods accept the traffic.
pub fn build_mirror_service(
    hosted: &Service,
    namespace: &str,
    cluster_name: &str,
) -> Result<Service, Error> {
    let hosted_key = ServiceKey::new(
        hosted.namespace().context(ObjectHasNoNamespaceSnafu)?,
        hosted.name_any(),
    );
    let port = hosted
        .spec
        .as_ref()
        .and_then(|spec| spec.ports.as_ref())
        .and_then(|ports| ports.first())
        .context(NoPortsSnafu {
            hosted: hosted_key.clone(),
        })?;
    let node_port = port.node_port.context(NoNodePortSnafu {
        port_name: port.name.clone().unwrap_or_default(),
        hosted: hosted_key.clone(),
    })?;

    let mut metadata = ObjectMetaBuilder::new();
    metadata
        .generate_name(format!("{name}-", name = hosted_key.name))
        .namespace(namespace);
    for (key, value) in [
        (SOURCE_NAME_ANNOTATION, &hosted_key.name),
        (SOURCE_NAMESPACE_ANNOTATION, &hosted_key.namespace),
    ] {
        metadata.with_annotation(Annotation::try_from((key, value.as_str())).context(
            AnnotationBuildSnafu {
                hosted: hosted_key.clone(),
            },
        )?);
    }

    Ok(Service {
        metadata: metadata.build(),
        spec: Some(ServiceSpec {
            type_: Some(LOAD_BALANCER_SERVICE_TYPE.to_string()),
            selector: Some(BTreeMap::from([(
                CLUSTER_NAME_LABEL.to_string(),
                cluster_name.to_string(),
            )])),
            ports: Some(vec![ServicePort {
                name: port.name.clone(),
                protocol: port.protocol.clone(),
                app_protocol: port.app_protocol.clone(),
                port: port.port,
                target_port: Some(IntOrString::Int(node_port)),
                ..ServicePort::default()
            }]),
            ..ServiceSpec::default()
        }),
        status: None,
    })
}

/// The hosted Service a mirror points back to, if it carries both source annotations.
pub fn source_of(mirror: &Service) -> Option<ServiceKey> {
    let annotations = mirror.metadata.annotations.as_ref()?;
    Some(ServiceKey::new(
        annotations.get(SOURCE_NAMESPACE_ANNOTATION)?.as_str(),
        annotations.get(SOURCE_NAME_ANNOTATION)?.as_str(),
    ))
}

pub fn is_mirror_of(mirror: &Service, hosted: &ServiceKey) -> bool {
    source_of(mirror).as_ref() == Some(hosted)
}

pub fn ingress(service: &Service) -> &[LoadBalancerIngress] {
    service
        .status
        .as_ref()
        .and_then(|status| status.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.as_deref())
        .unwrap_or_default()
}

/// Returns a copy of `service` whose load balancer ingress is replaced by `ingress`.
pub fn with_ingress(service: &Service, ingress: &[LoadBalancerIngress]) -> Service {
    let mut updated = service.clone();
    updated
        .status
        .get_or_insert_with(Default::default)
        .load_balancer
        .get_or_insert_with(Default::default)
        .ingress = Some(ingress.to_vec());
    updated
}
