use stackable_operator::{k8s_openapi::api::core::v1::Service, kube::ResourceExt};

use crate::{
    conventions::{EXCLUDED_SERVICE_NAME, LOAD_BALANCER_SERVICE_TYPE},
    service::source_of,
};

/// Whether a Service, observed on either cluster, takes part in mirroring at all.
///
/// Applied uniformly to create, update, delete and resync events of both watch sources.
pub fn is_reconcilable(service: &Service) -> bool {
    is_load_balancer(service) && service.name_any() != EXCLUDED_SERVICE_NAME
}

/// Whether an infra cluster Service carries both source annotations, whatever its type.
///
/// A mirror whose type was edited away from LoadBalancer stays ours, so it can be cleaned up.
pub fn is_annotated_mirror(service: &Service) -> bool {
    service.name_any() != EXCLUDED_SERVICE_NAME && source_of(service).is_some()
}

pub fn is_load_balancer(service: &Service) -> bool {
    service
        .spec
        .as_ref()
        .and_then(|spec| spec.type_.as_deref())
        == Some(LOAD_BALANCER_SERVICE_TYPE)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use std::collections::BTreeMap;

    use stackable_operator::k8s_openapi::{
        api::core::v1::ServiceSpec, apimachinery::pkg::apis::meta::v1::ObjectMeta,
    };

    use super::*;
    use crate::conventions::{SOURCE_NAMESPACE_ANNOTATION, SOURCE_NAME_ANNOTATION};

    fn service(name: &str, type_: Option<&str>) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("kube-system".to_string()),
                ..ObjectMeta::default()
            },
            spec: Some(ServiceSpec {
                type_: type_.map(str::to_string),
                ..ServiceSpec::default()
            }),
            status: None,
        }
    }

    #[rstest]
    #[case("web", Some("LoadBalancer"), true)]
    #[case("web", Some("ClusterIP"), false)]
    #[case("web", Some("NodePort"), false)]
    #[case("web", None, false)]
    #[case("kube-apiserver", Some("LoadBalancer"), false)]
    #[case("kube-apiserver", Some("ClusterIP"), false)]
    fn filters_by_type_and_name(
        #[case] name: &str,
        #[case] type_: Option<&str>,
        #[case] expected: bool,
    ) {
        assert_eq!(is_reconcilable(&service(name, type_)), expected);
    }

    #[test]
    fn service_without_spec_is_rejected() {
        let mut svc = service("web", Some("LoadBalancer"));
        svc.spec = None;
        assert!(!is_reconcilable(&svc));
    }

    #[rstest]
    #[case("web-x7k2p", &[SOURCE_NAME_ANNOTATION, SOURCE_NAMESPACE_ANNOTATION], true)]
    #[case("web-x7k2p", &[SOURCE_NAME_ANNOTATION], false)]
    #[case("web-x7k2p", &[], false)]
    #[case("kube-apiserver", &[SOURCE_NAME_ANNOTATION, SOURCE_NAMESPACE_ANNOTATION], false)]
    fn annotated_mirrors_regardless_of_type(
        #[case] name: &str,
        #[case] annotations: &[&str],
        #[case] expected: bool,
    ) {
        let mut svc = service(name, Some("ClusterIP"));
        svc.metadata.annotations = Some(
            annotations
                .iter()
                .map(|key| (key.to_string(), "web".to_string()))
                .collect::<BTreeMap<_, _>>(),
        );
        assert_eq!(is_annotated_mirror(&svc), expected);
    }
}
