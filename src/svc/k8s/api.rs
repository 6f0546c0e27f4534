//! # Orchestration api module
//!
//! This module provide the subset of the kubernetes api the console lifecycle
//! relies on, behind a trait so that workflows can be exercised without a
//! cluster.

use std::fmt::{self, Display, Formatter};

use async_trait::async_trait;
use k8s_openapi::api::{
    apps::v1::Deployment,
    core::v1::{PersistentVolumeClaim, Secret, Service},
};
use kube::{
    api::{DeleteParams, ListParams, PostParams, PropagationPolicy},
    Api, Client,
};
#[cfg(test)]
use mockall::automock;
use tracing::debug;

use crate::svc::{
    crd::{cluster::DatabaseCluster, task::ConsoleTask},
    k8s::resource,
};

// -----------------------------------------------------------------------------
// Kind enumeration

/// kinds of resources deleted on console teardown
#[derive(PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Copy, Debug)]
pub enum Kind {
    VolumeClaim,
    Service,
    Deployment,
}

impl Display for Kind {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Self::VolumeClaim => write!(f, "PersistentVolumeClaim"),
            Self::Service => write!(f, "Service"),
            Self::Deployment => write!(f, "Deployment"),
        }
    }
}

// -----------------------------------------------------------------------------
// Cascade enumeration

#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum Cascade {
    /// let the api server pick the propagation policy of the kind
    Default,
    /// dependents are removed before the owner disappears
    Foreground,
}

impl From<Cascade> for DeleteParams {
    fn from(cascade: Cascade) -> Self {
        match cascade {
            Cascade::Default => DeleteParams::default(),
            Cascade::Foreground => DeleteParams {
                propagation_policy: Some(PropagationPolicy::Foreground),
                ..Default::default()
            },
        }
    }
}

// -----------------------------------------------------------------------------
// Orchestrator trait

/// kubernetes operations consumed by the console lifecycle
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Orchestrator: Send + Sync {
    async fn get_cluster(&self, namespace: &str, name: &str)
        -> Result<DatabaseCluster, kube::Error>;

    /// replace the cluster record, the write is conditional on its resource
    /// version so a concurrent modification yields a 409
    async fn replace_cluster(&self, cluster: &DatabaseCluster)
        -> Result<DatabaseCluster, kube::Error>;

    async fn get_volume_claim(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PersistentVolumeClaim>, kube::Error>;

    async fn create_volume_claim(
        &self,
        namespace: &str,
        claim: &PersistentVolumeClaim,
    ) -> Result<PersistentVolumeClaim, kube::Error>;

    async fn create_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> Result<Deployment, kube::Error>;

    async fn get_deployment(&self, namespace: &str, name: &str)
        -> Result<Deployment, kube::Error>;

    async fn create_service(&self, namespace: &str, service: &Service)
        -> Result<Service, kube::Error>;

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Service, kube::Error>;

    async fn list_secrets(&self, namespace: &str, selector: &str)
        -> Result<Vec<Secret>, kube::Error>;

    async fn delete(
        &self,
        kind: Kind,
        namespace: &str,
        name: &str,
        cascade: Cascade,
    ) -> Result<(), kube::Error>;

    async fn delete_task(&self, namespace: &str, name: &str) -> Result<(), kube::Error>;

    /// persist the status of the modified task, computed against the origin
    async fn patch_task_status(
        &self,
        origin: &ConsoleTask,
        modified: &ConsoleTask,
    ) -> Result<(), kube::Error>;
}

// -----------------------------------------------------------------------------
// KubeOrchestrator structure

/// [`Orchestrator`] backed by a kubernetes client
#[derive(Clone)]
pub struct KubeOrchestrator {
    client: Client,
}

impl From<Client> for KubeOrchestrator {
    fn from(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Orchestrator for KubeOrchestrator {
    async fn get_cluster(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<DatabaseCluster, kube::Error> {
        debug!(namespace = namespace, name = name, "Execute a request to retrieve cluster");
        Api::<DatabaseCluster>::namespaced(self.client.to_owned(), namespace)
            .get(name)
            .await
    }

    async fn replace_cluster(
        &self,
        cluster: &DatabaseCluster,
    ) -> Result<DatabaseCluster, kube::Error> {
        let (namespace, name) = resource::namespaced_name(cluster);

        debug!(
            namespace = &namespace,
            name = &name,
            version = cluster.metadata.resource_version.as_deref().unwrap_or("<none>"),
            "Execute a request to replace cluster",
        );

        Api::<DatabaseCluster>::namespaced(self.client.to_owned(), &namespace)
            .replace(&name, &PostParams::default(), cluster)
            .await
    }

    async fn get_volume_claim(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PersistentVolumeClaim>, kube::Error> {
        debug!(namespace = namespace, name = name, "Execute a request to retrieve volume claim");
        Api::<PersistentVolumeClaim>::namespaced(self.client.to_owned(), namespace)
            .get_opt(name)
            .await
    }

    async fn create_volume_claim(
        &self,
        namespace: &str,
        claim: &PersistentVolumeClaim,
    ) -> Result<PersistentVolumeClaim, kube::Error> {
        debug!(namespace = namespace, "Execute a request to create volume claim");
        Api::namespaced(self.client.to_owned(), namespace)
            .create(&PostParams::default(), claim)
            .await
    }

    async fn create_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> Result<Deployment, kube::Error> {
        debug!(namespace = namespace, "Execute a request to create deployment");
        Api::namespaced(self.client.to_owned(), namespace)
            .create(&PostParams::default(), deployment)
            .await
    }

    async fn get_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Deployment, kube::Error> {
        Api::<Deployment>::namespaced(self.client.to_owned(), namespace)
            .get(name)
            .await
    }

    async fn create_service(
        &self,
        namespace: &str,
        service: &Service,
    ) -> Result<Service, kube::Error> {
        debug!(namespace = namespace, "Execute a request to create service");
        Api::namespaced(self.client.to_owned(), namespace)
            .create(&PostParams::default(), service)
            .await
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Service, kube::Error> {
        Api::<Service>::namespaced(self.client.to_owned(), namespace)
            .get(name)
            .await
    }

    async fn list_secrets(
        &self,
        namespace: &str,
        selector: &str,
    ) -> Result<Vec<Secret>, kube::Error> {
        debug!(namespace = namespace, selector = selector, "Execute a request to list secrets");
        let list = Api::<Secret>::namespaced(self.client.to_owned(), namespace)
            .list(&ListParams::default().labels(selector))
            .await?;

        Ok(list.items)
    }

    async fn delete(
        &self,
        kind: Kind,
        namespace: &str,
        name: &str,
        cascade: Cascade,
    ) -> Result<(), kube::Error> {
        let params = DeleteParams::from(cascade);
        let client = self.client.to_owned();

        debug!(
            kind = kind.to_string(),
            namespace = namespace,
            name = name,
            cascade = ?cascade,
            "Execute a request to delete resource",
        );

        match kind {
            Kind::VolumeClaim => {
                Api::<PersistentVolumeClaim>::namespaced(client, namespace)
                    .delete(name, &params)
                    .await?;
            }
            Kind::Service => {
                Api::<Service>::namespaced(client, namespace)
                    .delete(name, &params)
                    .await?;
            }
            Kind::Deployment => {
                Api::<Deployment>::namespaced(client, namespace)
                    .delete(name, &params)
                    .await?;
            }
        }

        Ok(())
    }

    async fn delete_task(&self, namespace: &str, name: &str) -> Result<(), kube::Error> {
        debug!(namespace = namespace, name = name, "Execute a request to delete task");
        Api::<ConsoleTask>::namespaced(self.client.to_owned(), namespace)
            .delete(name, &DeleteParams::default())
            .await?;

        Ok(())
    }

    async fn patch_task_status(
        &self,
        origin: &ConsoleTask,
        modified: &ConsoleTask,
    ) -> Result<(), kube::Error> {
        let patch = resource::diff(origin, modified).map_err(kube::Error::SerdeError)?;

        resource::patch_status(self.client.to_owned(), modified.to_owned(), patch).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn foreground_cascade_sets_propagation_policy() {
        let params = DeleteParams::from(Cascade::Foreground);
        assert!(matches!(
            params.propagation_policy,
            Some(PropagationPolicy::Foreground)
        ));

        let params = DeleteParams::from(Cascade::Default);
        assert!(params.propagation_policy.is_none());
    }

    #[test]
    fn kinds_are_displayed_as_kubernetes_kinds() {
        assert_eq!(Kind::VolumeClaim.to_string(), "PersistentVolumeClaim");
        assert_eq!(Kind::Service.to_string(), "Service");
        assert_eq!(Kind::Deployment.to_string(), "Deployment");
    }
}
