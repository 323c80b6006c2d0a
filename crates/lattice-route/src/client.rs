//! Kubernetes API seams of the route controller
//!
//! [`ObjectStore`] reads the objects a route depends on and
//! [`RouteStatusWriter`] writes back to the route. Both are traits so the
//! controller can run against mocks in tests.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Endpoints, Service};
use kube::api::{Api, Patch, PatchParams};
use kube::Client;

#[cfg(test)]
use mockall::automock;

use lattice_common::crd::{Gateway, GatewayClass, HttpRoute, HttpRouteStatus, ServiceImport};
use lattice_common::{Error, FIELD_MANAGER};

/// Read access to the objects a route depends on
///
/// `get_*` return `Ok(None)` when the object does not exist.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Get a Gateway
    async fn get_gateway(&self, name: &str, namespace: &str) -> Result<Option<Gateway>, Error>;

    /// Get a cluster-scoped GatewayClass
    async fn get_gateway_class(&self, name: &str) -> Result<Option<GatewayClass>, Error>;

    /// Get a core Service
    async fn get_service(&self, name: &str, namespace: &str) -> Result<Option<Service>, Error>;

    /// Get a multi-cluster ServiceImport
    async fn get_service_import(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<ServiceImport>, Error>;

    /// Get the Endpoints of a Service
    async fn get_endpoints(&self, name: &str, namespace: &str) -> Result<Option<Endpoints>, Error>;
}

/// Write access to HTTPRoutes
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RouteStatusWriter: Send + Sync {
    /// Merge annotations into a route's metadata
    async fn patch_route_annotations(
        &self,
        name: &str,
        namespace: &str,
        annotations: BTreeMap<String, String>,
    ) -> Result<(), Error>;

    /// Replace a route's status
    async fn patch_route_status(
        &self,
        name: &str,
        namespace: &str,
        status: &HttpRouteStatus,
    ) -> Result<(), Error>;

    /// Add a finalizer if missing
    async fn add_route_finalizer(
        &self,
        name: &str,
        namespace: &str,
        finalizer: &str,
    ) -> Result<(), Error>;

    /// Remove a finalizer if present
    async fn remove_route_finalizer(
        &self,
        name: &str,
        namespace: &str,
        finalizer: &str,
    ) -> Result<(), Error>;
}

/// [`ObjectStore`] and [`RouteStatusWriter`] backed by the API server
#[derive(Clone)]
pub struct KubeRouteClient {
    client: Client,
}

impl KubeRouteClient {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn routes(&self, namespace: &str) -> Api<HttpRoute> {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn patch_finalizers(
        &self,
        name: &str,
        namespace: &str,
        finalizers: Vec<String>,
    ) -> Result<(), Error> {
        let patch = serde_json::json!({
            "metadata": {
                "finalizers": finalizers
            }
        });

        self.routes(namespace)
            .patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;

        Ok(())
    }
}

#[async_trait]
impl ObjectStore for KubeRouteClient {
    async fn get_gateway(&self, name: &str, namespace: &str) -> Result<Option<Gateway>, Error> {
        let api: Api<Gateway> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn get_gateway_class(&self, name: &str) -> Result<Option<GatewayClass>, Error> {
        let api: Api<GatewayClass> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn get_service(&self, name: &str, namespace: &str) -> Result<Option<Service>, Error> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn get_service_import(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<ServiceImport>, Error> {
        let api: Api<ServiceImport> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn get_endpoints(&self, name: &str, namespace: &str) -> Result<Option<Endpoints>, Error> {
        let api: Api<Endpoints> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }
}

#[async_trait]
impl RouteStatusWriter for KubeRouteClient {
    async fn patch_route_annotations(
        &self,
        name: &str,
        namespace: &str,
        annotations: BTreeMap<String, String>,
    ) -> Result<(), Error> {
        let patch = serde_json::json!({
            "metadata": {
                "annotations": annotations
            }
        });

        self.routes(namespace)
            .patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;

        Ok(())
    }

    async fn patch_route_status(
        &self,
        name: &str,
        namespace: &str,
        status: &HttpRouteStatus,
    ) -> Result<(), Error> {
        let status_patch = serde_json::json!({ "status": status });

        self.routes(namespace)
            .patch_status(
                name,
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&status_patch),
            )
            .await?;

        Ok(())
    }

    async fn add_route_finalizer(
        &self,
        name: &str,
        namespace: &str,
        finalizer: &str,
    ) -> Result<(), Error> {
        let route = self.routes(namespace).get(name).await?;
        let mut finalizers = route.metadata.finalizers.unwrap_or_default();

        if finalizers.iter().any(|f| f == finalizer) {
            return Ok(());
        }

        finalizers.push(finalizer.to_string());
        self.patch_finalizers(name, namespace, finalizers).await
    }

    async fn remove_route_finalizer(
        &self,
        name: &str,
        namespace: &str,
        finalizer: &str,
    ) -> Result<(), Error> {
        let Some(route) = self.routes(namespace).get_opt(name).await? else {
            return Ok(());
        };
        let current = route.metadata.finalizers.unwrap_or_default();
        if !current.iter().any(|f| f == finalizer) {
            return Ok(());
        }

        let finalizers: Vec<String> = current.into_iter().filter(|f| f != finalizer).collect();
        self.patch_finalizers(name, namespace, finalizers).await
    }
}
