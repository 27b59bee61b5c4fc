//! Resolves what the agent needs to know about its surroundings: the namespace it runs in, how
//! to reach the hosted cluster and the generated name of the cluster it serves.
use std::env::VarError;

use snafu::{ensure, OptionExt, ResultExt, Snafu};
use stackable_operator::{
    k8s_openapi::api::core::v1::Secret,
    kube::{
        self,
        api::{Api, ListParams},
        config::{KubeConfigOptions, Kubeconfig, KubeconfigError},
        core::{ApiResource, DynamicObject, GroupVersionKind},
        Client, Config, ResourceExt,
    },
};
use tracing::debug;

use crate::conventions::{
    CLUSTER_API_GROUP, CLUSTER_API_VERSION, CLUSTER_KIND, KUBECONFIG_SECRET_KEY,
    KUBECONFIG_SECRET_NAME, POD_NAMESPACE_ENV,
};

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("environment variable {POD_NAMESPACE_ENV} is not set"))]
    NamespaceNotSet { source: VarError },
    #[snafu(display("environment variable {POD_NAMESPACE_ENV} is empty"))]
    NamespaceEmpty,
    #[snafu(display("failed to get Secret {namespace}/{KUBECONFIG_SECRET_NAME}"))]
    GetKubeconfigSecret {
        source: kube::Error,
        namespace: String,
    },
    #[snafu(display("Secret {namespace}/{KUBECONFIG_SECRET_NAME} does not exist yet"))]
    KubeconfigSecretNotFound { namespace: String },
    #[snafu(display("Secret {secret} has no key [{KUBECONFIG_SECRET_KEY}]"))]
    KubeconfigKeyMissing { secret: String },
    #[snafu(display("kubeconfig in Secret {secret} is not valid UTF-8"))]
    KubeconfigNotUtf8 {
        source: std::string::FromUtf8Error,
        secret: String,
    },
    #[snafu(display("failed to parse kubeconfig in Secret {secret}"))]
    ParseKubeconfig {
        source: KubeconfigError,
        secret: String,
    },
    #[snafu(display("failed to build client configuration from hosted kubeconfig"))]
    LoadKubeconfig { source: KubeconfigError },
    #[snafu(display("failed to list {CLUSTER_KIND} objects in namespace {namespace}"))]
    ListClusters {
        source: kube::Error,
        namespace: String,
    },
    #[snafu(display("no {CLUSTER_KIND} object found in namespace {namespace}"))]
    NoCluster { namespace: String },
    #[snafu(display(
        "found {count} {CLUSTER_KIND} objects in namespace {namespace}, expected exactly one: {names:?}",
        count = names.len()
    ))]
    AmbiguousCluster {
        namespace: String,
        names: Vec<String>,
    },
}
type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Whether the error means the surroundings have not been (fully) provisioned yet, as
    /// opposed to an API failure or an ambiguous setup.
    pub fn is_not_ready(&self) -> bool {
        matches!(
            self,
            Error::KubeconfigSecretNotFound { .. }
                | Error::KubeconfigKeyMissing { .. }
                | Error::KubeconfigNotUtf8 { .. }
                | Error::ParseKubeconfig { .. }
                | Error::NoCluster { .. }
        )
    }
}

/// The namespace the agent runs in, taken from the downward API.
pub fn current_namespace() -> Result<String> {
    namespace_from(std::env::var(POD_NAMESPACE_ENV))
}

fn namespace_from(value: Result<String, VarError>) -> Result<String> {
    let namespace = value.context(NamespaceNotSetSnafu)?;
    ensure!(!namespace.trim().is_empty(), NamespaceEmptySnafu);
    Ok(namespace.trim().to_string())
}

/// Builds the client configuration for the hosted cluster from the `admin-kubeconfig` Secret.
pub async fn load_hosted_config(infra: &Client, namespace: &str) -> Result<Config> {
    let secrets: Api<Secret> = Api::namespaced(infra.clone(), namespace);
    let secret = secrets
        .get_opt(KUBECONFIG_SECRET_NAME)
        .await
        .context(GetKubeconfigSecretSnafu { namespace })?
        .context(KubeconfigSecretNotFoundSnafu { namespace })?;
    let kubeconfig = kubeconfig_from_secret(&secret)?;
    debug!(
        secret.namespace = namespace,
        secret.name = KUBECONFIG_SECRET_NAME,
        "loaded hosted cluster kubeconfig"
    );
    Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .context(LoadKubeconfigSnafu)
}

pub fn kubeconfig_from_secret(secret: &Secret) -> Result<Kubeconfig> {
    let secret_name = format!(
        "{}/{}",
        secret.namespace().unwrap_or_default(),
        secret.name_any()
    );
    let raw = secret
        .data
        .as_ref()
        .and_then(|data| data.get(KUBECONFIG_SECRET_KEY))
        .context(KubeconfigKeyMissingSnafu {
            secret: &secret_name,
        })?;
    let yaml = String::from_utf8(raw.0.clone()).context(KubeconfigNotUtf8Snafu {
        secret: &secret_name,
    })?;
    Kubeconfig::from_yaml(&yaml).context(ParseKubeconfigSnafu {
        secret: &secret_name,
    })
}

/// The generated name of the single Cluster API `Cluster` in `namespace`.
pub async fn cluster_gen_name(infra: &Client, namespace: &str) -> Result<String> {
    let resource = ApiResource::from_gvk(&GroupVersionKind::gvk(
        CLUSTER_API_GROUP,
        CLUSTER_API_VERSION,
        CLUSTER_KIND,
    ));
    let clusters: Api<DynamicObject> = Api::namespaced_with(infra.clone(), namespace, &resource);
    let names = clusters
        .list(&ListParams::default())
        .await
        .context(ListClustersSnafu { namespace })?
        .items
        .iter()
        .map(ResourceExt::name_any)
        .collect();
    single_cluster_name(namespace, names)
}

fn single_cluster_name(namespace: &str, mut names: Vec<String>) -> Result<String> {
    match names.len() {
        0 => NoClusterSnafu { namespace }.fail(),
        1 => Ok(names.remove(0)),
        _ => {
            names.sort();
            AmbiguousClusterSnafu { namespace, names }.fail()
        }
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;
    use rstest::rstest;

    use super::*;

    const KUBECONFIG: &str = indoc! {"
        apiVersion: v1
        kind: Config
        clusters:
          - name: hosted
            cluster:
              server: https://hosted-apiserver.infra-a.svc:6443
              insecure-skip-tls-verify: true
        users:
          - name: admin
            user:
              token: secret-token
        contexts:
          - name: admin@hosted
            context:
              cluster: hosted
              user: admin
        current-context: admin@hosted
    "};

    fn secret(data: Option<(&str, &[u8])>) -> Secret {
        let mut secret: Secret = serde_yaml::from_str(indoc! {"
            apiVersion: v1
            kind: Secret
            metadata:
              name: admin-kubeconfig
              namespace: infra-a
        "})
        .expect("illegal test input");
        if let Some((key, value)) = data {
            secret.data = Some(
                [(
                    key.to_string(),
                    stackable_operator::k8s_openapi::ByteString(value.to_vec()),
                )]
                .into(),
            );
        }
        secret
    }

    #[rstest]
    #[case(Ok("infra-a".to_string()), Some("infra-a"))]
    #[case(Ok(" infra-a\n".to_string()), Some("infra-a"))]
    #[case(Ok("".to_string()), None)]
    #[case(Err(VarError::NotPresent), None)]
    fn namespace_from_environment(
        #[case] value: Result<String, VarError>,
        #[case] expected: Option<&str>,
    ) {
        assert_eq!(namespace_from(value).ok().as_deref(), expected);
    }

    #[test]
    fn kubeconfig_is_read_from_secret() {
        let kubeconfig =
            kubeconfig_from_secret(&secret(Some(("kubeconfig", KUBECONFIG.as_bytes())))).unwrap();
        assert_eq!(kubeconfig.current_context.as_deref(), Some("admin@hosted"));
        assert_eq!(kubeconfig.clusters.len(), 1);
    }

    #[test]
    fn secret_without_kubeconfig_key_is_not_ready() {
        let err = kubeconfig_from_secret(&secret(Some(("value", KUBECONFIG.as_bytes()))))
            .unwrap_err();
        assert!(err.is_not_ready(), "{err}");
        assert_eq!(
            err.to_string(),
            "Secret infra-a/admin-kubeconfig has no key [kubeconfig]"
        );

        let err = kubeconfig_from_secret(&secret(None)).unwrap_err();
        assert!(matches!(err, Error::KubeconfigKeyMissing { .. }));
    }

    #[test]
    fn unparseable_kubeconfig_is_rejected() {
        let err = kubeconfig_from_secret(&secret(Some(("kubeconfig", &b"clusters: ["[..])))).unwrap_err();
        assert!(matches!(err, Error::ParseKubeconfig { .. }), "{err}");

        let err =
            kubeconfig_from_secret(&secret(Some(("kubeconfig", &[0xff, 0xfe][..])))).unwrap_err();
        assert!(matches!(err, Error::KubeconfigNotUtf8 { .. }), "{err}");
    }

    #[test]
    fn single_cluster_is_picked() {
        assert_eq!(
            single_cluster_name("infra-a", vec!["infra-a-cluster".to_string()]).unwrap(),
            "infra-a-cluster"
        );
    }

    #[test]
    fn missing_cluster_is_not_ready() {
        let err = single_cluster_name("infra-a", vec![]).unwrap_err();
        assert!(err.is_not_ready());
        assert_eq!(
            err.to_string(),
            "no Cluster object found in namespace infra-a"
        );
    }

    #[test]
    fn multiple_clusters_are_ambiguous() {
        let err = single_cluster_name("infra-a", vec!["b".to_string(), "a".to_string()])
            .unwrap_err();
        assert!(!err.is_not_ready());
        assert_eq!(
            err.to_string(),
            r#"found 2 Cluster objects in namespace infra-a, expected exactly one: ["a", "b"]"#
        );
    }
}
