//! Seams between the reconciler and the two API servers.
//!
//! The reconciler only talks to the clusters through [`ServiceApi`] and [`ClusterNameLookup`],
//! so it can be exercised against in-memory clusters in tests.
use async_trait::async_trait;
use serde_json::json;
use snafu::{OptionExt, ResultExt, Snafu};
use stackable_operator::{
    k8s_openapi::api::core::v1::Service,
    kube::{
        self,
        api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams},
        Client, ResourceExt,
    },
};

#[cfg(test)]
use mockall::automock;

use crate::{context, event::ServiceKey};

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("failed to {verb} Service {target}"))]
    Request {
        source: kube::Error,
        verb: &'static str,
        target: String,
    },
    #[snafu(display("Service {target} already exists"))]
    AlreadyExists { target: String },
    #[snafu(display("Service {target} does not exist"))]
    NotFound { target: String },
    #[snafu(display("Service to {verb} defines no namespace"))]
    ObjectHasNoNamespace { verb: &'static str },
}
type Result<T, E = Error> = std::result::Result<T, E>;

/// Service operations against one cluster.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ServiceApi: Send + Sync {
    /// Fetch a Service, `None` if it does not exist.
    async fn get(&self, key: &ServiceKey) -> Result<Option<Service>>;

    async fn list(&self, namespace: &str) -> Result<Vec<Service>>;

    /// Create a Service, honouring `metadata.generateName`. Fails with
    /// [`Error::AlreadyExists`] if the name is taken.
    async fn create(&self, service: &Service) -> Result<Service>;

    /// Delete a Service. Deleting a Service that does not exist succeeds.
    async fn delete(&self, key: &ServiceKey) -> Result<()>;

    /// Write the status of `service`, guarded by its resourceVersion if it has one.
    async fn update_status(&self, service: &Service) -> Result<Service>;
}

/// Resolves the generated name of the cluster the mirrors select.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterNameLookup: Send + Sync {
    async fn cluster_name(&self, namespace: &str) -> Result<String, context::Error>;
}

fn has_status(error: &kube::Error, code: u16) -> bool {
    matches!(error, kube::Error::Api(response) if response.code == code)
}

pub struct KubeServiceApi {
    client: Client,
}

impl KubeServiceApi {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<Service> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl ServiceApi for KubeServiceApi {
    async fn get(&self, key: &ServiceKey) -> Result<Option<Service>> {
        self.api(&key.namespace)
            .get_opt(&key.name)
            .await
            .context(RequestSnafu {
                verb: "get",
                target: key.to_string(),
            })
    }

    async fn list(&self, namespace: &str) -> Result<Vec<Service>> {
        Ok(self
            .api(namespace)
            .list(&ListParams::default())
            .await
            .context(RequestSnafu {
                verb: "list",
                target: format!("{namespace}/*"),
            })?
            .items)
    }

    async fn create(&self, service: &Service) -> Result<Service> {
        let namespace = service
            .namespace()
            .context(ObjectHasNoNamespaceSnafu { verb: "create" })?;
        let target = match (&service.metadata.name, &service.metadata.generate_name) {
            (Some(name), _) => format!("{namespace}/{name}"),
            (None, Some(prefix)) => format!("{namespace}/{prefix}*"),
            (None, None) => format!("{namespace}/<unnamed>"),
        };
        match self
            .api(&namespace)
            .create(&PostParams::default(), service)
            .await
        {
            Ok(created) => Ok(created),
            Err(err) if has_status(&err, 409) => AlreadyExistsSnafu { target }.fail(),
            Err(err) => Err(err).context(RequestSnafu {
                verb: "create",
                target,
            }),
        }
    }

    async fn delete(&self, key: &ServiceKey) -> Result<()> {
        match self
            .api(&key.namespace)
            .delete(&key.name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(err) if has_status(&err, 404) => Ok(()),
            Err(err) => Err(err).context(RequestSnafu {
                verb: "delete",
                target: key.to_string(),
            }),
        }
    }

    async fn update_status(&self, service: &Service) -> Result<Service> {
        let namespace = service
            .namespace()
            .context(ObjectHasNoNamespaceSnafu {
                verb: "update status of",
            })?;
        let name = service.name_any();
        let target = format!("{namespace}/{name}");

        let mut patch = json!({ "status": service.status });
        if let Some(resource_version) = &service.metadata.resource_version {
            patch["metadata"] = json!({ "resourceVersion": resource_version });
        }

        match self
            .api(&namespace)
            .patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            Ok(updated) => Ok(updated),
            Err(err) if has_status(&err, 404) => NotFoundSnafu { target }.fail(),
            Err(err) => Err(err).context(RequestSnafu {
                verb: "update status of",
                target,
            }),
        }
    }
}

pub struct KubeClusterNameLookup {
    client: Client,
}

impl KubeClusterNameLookup {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ClusterNameLookup for KubeClusterNameLookup {
    async fn cluster_name(&self, namespace: &str) -> Result<String, context::Error> {
        context::cluster_gen_name(&self.client, namespace).await
    }
}


#[cfg(test)]
mod tests {
    use axum::http::{Method, Request, Response, StatusCode};
    use indoc::indoc;
    use serde_json::Value;
    use stackable_operator::{
        k8s_openapi::api::core::v1::LoadBalancerIngress, kube::client::Body,
    };
    use tower_test::mock::{self, Handle};

    use super::*;
    use crate::service::with_ingress;

    type ApiServer = Handle<Request<Body>, Response<Body>>;

    fn kube_service_api() -> (KubeServiceApi, ApiServer) {
        let (service, handle) = mock::pair::<Request<Body>, Response<Body>>();
        (
            KubeServiceApi::new(Client::new(service, "default")),
            handle,
        )
    }

    fn respond(status: StatusCode, body: &Value) -> Response<Body> {
        Response::builder()
            .status(status)
            .body(Body::from(serde_json::to_vec(body).unwrap()))
            .unwrap()
    }

    fn failure(code: StatusCode, reason: &str) -> Response<Body> {
        respond(
            code,
            &json!({
                "kind": "Status",
                "apiVersion": "v1",
                "metadata": {},
                "status": "Failure",
                "message": reason,
                "reason": reason,
                "code": code.as_u16(),
            }),
        )
    }

    /// Answers the next request with `response` and hands back what was asked.
    async fn answer(mut server: ApiServer, response: Response<Body>) -> (Method, String, Value) {
        let (request, send) = server.next_request().await.expect("no request was sent");
        let method = request.method().clone();
        let path = request.uri().path().to_string();
        let bytes = request.into_body().collect_bytes().await.unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        send.send_response(response);
        (method, path, body)
    }

    fn service(yaml: &str) -> Service {
        serde_yaml::from_str(yaml).expect("illegal test input")
    }

    fn mirror() -> Service {
        service(indoc! {"
            apiVersion: v1
            kind: Service
            metadata:
              generateName: web-
              namespace: infra-a
              annotations:
                dana.io/source-svc-name: web
                dana.io/source-svc-namespace: app
            spec:
              type: LoadBalancer
        "})
    }

    fn hosted_web() -> Service {
        service(indoc! {"
            apiVersion: v1
            kind: Service
            metadata:
              name: web
              namespace: app
              resourceVersion: '7'
            spec:
              type: LoadBalancer
        "})
    }

    #[tokio::test]
    async fn create_posts_to_namespace() {
        let (api, server) = kube_service_api();
        let mut created = mirror();
        created.metadata.name = Some("web-x7k2p".to_string());
        let server = tokio::spawn(answer(
            server,
            respond(StatusCode::CREATED, &serde_json::to_value(&created).unwrap()),
        ));

        let result = api.create(&mirror()).await.unwrap();

        let (method, path, body) = server.await.unwrap();
        assert_eq!(method, Method::POST);
        assert_eq!(path, "/api/v1/namespaces/infra-a/services");
        assert_eq!(body["metadata"]["generateName"], "web-");
        assert_eq!(result.name_any(), "web-x7k2p");
    }

    #[tokio::test]
    async fn create_conflict_is_already_exists() {
        let (api, server) = kube_service_api();
        let server = tokio::spawn(answer(
            server,
            failure(StatusCode::CONFLICT, "AlreadyExists"),
        ));

        let err = api.create(&mirror()).await.unwrap_err();

        server.await.unwrap();
        assert!(
            matches!(&err, Error::AlreadyExists { target } if target == "infra-a/web-*"),
            "unexpected error: {err:?}"
        );
    }

    #[tokio::test]
    async fn create_failure_is_a_request_error() {
        let (api, server) = kube_service_api();
        let server = tokio::spawn(answer(
            server,
            failure(StatusCode::FORBIDDEN, "Forbidden"),
        ));

        let err = api.create(&mirror()).await.unwrap_err();

        server.await.unwrap();
        assert!(
            matches!(err, Error::Request { verb: "create", .. }),
            "unexpected error: {err:?}"
        );
    }

    #[tokio::test]
    async fn deleting_missing_service_succeeds() {
        let (api, server) = kube_service_api();
        let server = tokio::spawn(answer(
            server,
            failure(StatusCode::NOT_FOUND, "NotFound"),
        ));

        api.delete(&ServiceKey::new("infra-a", "web-x7k2p"))
            .await
            .unwrap();

        let (method, path, _) = server.await.unwrap();
        assert_eq!(method, Method::DELETE);
        assert_eq!(path, "/api/v1/namespaces/infra-a/services/web-x7k2p");
    }

    #[tokio::test]
    async fn delete_failure_is_a_request_error() {
        let (api, server) = kube_service_api();
        let server = tokio::spawn(answer(
            server,
            failure(StatusCode::INTERNAL_SERVER_ERROR, "InternalError"),
        ));

        let err = api
            .delete(&ServiceKey::new("infra-a", "web-x7k2p"))
            .await
            .unwrap_err();

        server.await.unwrap();
        assert!(
            matches!(err, Error::Request { verb: "delete", .. }),
            "unexpected error: {err:?}"
        );
    }

    #[tokio::test]
    async fn status_is_merge_patched_with_resource_version() {
        let (api, server) = kube_service_api();
        let ingress = vec![LoadBalancerIngress {
            ip: Some("203.0.113.10".to_string()),
            ..LoadBalancerIngress::default()
        }];
        let updated = with_ingress(&hosted_web(), &ingress);
        let server = tokio::spawn(answer(
            server,
            respond(StatusCode::OK, &serde_json::to_value(&updated).unwrap()),
        ));

        api.update_status(&updated).await.unwrap();

        let (method, path, body) = server.await.unwrap();
        assert_eq!(method, Method::PATCH);
        assert_eq!(path, "/api/v1/namespaces/app/services/web/status");
        assert_eq!(
            body,
            json!({
                "status": { "loadBalancer": { "ingress": [{ "ip": "203.0.113.10" }] } },
                "metadata": { "resourceVersion": "7" },
            })
        );
    }

    #[tokio::test]
    async fn status_update_of_missing_service_is_not_found() {
        let (api, server) = kube_service_api();
        let server = tokio::spawn(answer(
            server,
            failure(StatusCode::NOT_FOUND, "NotFound"),
        ));

        let err = api.update_status(&hosted_web()).await.unwrap_err();

        server.await.unwrap();
        assert!(
            matches!(&err, Error::NotFound { target } if target == "app/web"),
            "unexpected error: {err:?}"
        );
    }

    #[tokio::test]
    async fn get_of_missing_service_is_none() {
        let (api, server) = kube_service_api();
        let server = tokio::spawn(answer(
            server,
            failure(StatusCode::NOT_FOUND, "NotFound"),
        ));

        let found = api.get(&ServiceKey::new("app", "web")).await.unwrap();

        let (method, path, _) = server.await.unwrap();
        assert_eq!(method, Method::GET);
        assert_eq!(path, "/api/v1/namespaces/app/services/web");
        assert!(found.is_none());
    }
}
