//! Well-known names shared between the agent and the two clusters it bridges.

/// Environment variable holding the namespace the agent runs in.
pub const POD_NAMESPACE_ENV: &str = "POD_NAMESPACE";
/// Environment variable holding the agent's Pod name, used as leader election identity.
pub const POD_NAME_ENV: &str = "POD_NAME";

/// Secret in the agent's namespace holding credentials for the hosted cluster.
pub const KUBECONFIG_SECRET_NAME: &str = "admin-kubeconfig";
pub const KUBECONFIG_SECRET_KEY: &str = "kubeconfig";

// Back-references from a mirror Service to the hosted Service it was created for.
// Set on creation and never changed afterwards.
pub const SOURCE_NAME_ANNOTATION: &str = "dana.io/source-svc-name";
pub const SOURCE_NAMESPACE_ANNOTATION: &str = "dana.io/source-svc-namespace";

/// Label carried by the Pods implementing the hosted cluster, used as the mirror selector.
pub const CLUSTER_NAME_LABEL: &str = "cluster.x-k8s.io/cluster-name";

/// The infra cluster's own API server Service is never treated as a hosted or mirror Service.
pub const EXCLUDED_SERVICE_NAME: &str = "kube-apiserver";

pub const LOAD_BALANCER_SERVICE_TYPE: &str = "LoadBalancer";

pub const CLUSTER_API_GROUP: &str = "cluster.x-k8s.io";
pub const CLUSTER_API_VERSION: &str = "v1beta1";
pub const CLUSTER_KIND: &str = "Cluster";

pub const LEADER_ELECTION_LEASE_NAME: &str = "d058e662.dana.io";
