//! # Lifecycle module
//!
//! This module provide the creation and the removal of the console attached
//! to a database cluster, and the glue between a console task and these
//! workflows.
//!
//! Creation goes forward without rollback: resources created before a failure
//! are left in place. Removal aborts if the cluster record cannot be updated,
//! then deletes each resource independently.

use std::{
    fmt::{self, Display, Formatter},
    sync::Arc,
};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::svc::{
    cfg::Configuration,
    console::{
        bootstrap::{self, Bootstrapper},
        event::{EventBus, EventKind, Header, LifecycleEvent},
        readiness, storage,
        template::{self, ProvisioningFields, Renderer},
        AdminInstance, SetupCredential,
    },
    crd::{
        cluster::DatabaseCluster,
        task::{ConsoleTask, StorageSpec, TaskAction},
    },
    k8s::{
        api::{Cascade, Kind, Orchestrator},
        resource,
    },
};

// -----------------------------------------------------------------------------
// ConfigError enumeration

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("failed to update cluster '{0}/{1}', it has been modified concurrently, {2}")]
    Conflict(String, String, kube::Error),
    #[error("failed to find cluster '{0}/{1}', {2}")]
    Missing(String, String, kube::Error),
    #[error("failed to update cluster '{0}/{1}', {2}")]
    Update(String, String, kube::Error),
}

impl ConfigError {
    fn from_kube(namespace: &str, name: &str, err: kube::Error) -> Self {
        let (namespace, name) = (namespace.to_string(), name.to_string());

        if resource::is_conflict(&err) {
            Self::Conflict(namespace, name, err)
        } else if resource::is_not_found(&err) {
            Self::Missing(namespace, name, err)
        } else {
            Self::Update(namespace, name, err)
        }
    }
}

// -----------------------------------------------------------------------------
// ProvisioningError enumeration

#[derive(thiserror::Error, Debug)]
pub enum ProvisioningError {
    #[error("failed to provision storage, {0}")]
    Storage(storage::Error),
    #[error("failed to render resource, {0}")]
    Render(template::Error),
    #[error("failed to create {0} '{1}/{2}', {3}")]
    Create(Kind, String, String, kube::Error),
}

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("{0}")]
    Config(ConfigError),
    #[error("{0}")]
    Provisioning(ProvisioningError),
    #[error("failed to wait for console readiness, {0}")]
    Readiness(readiness::Error),
    #[error("failed to bootstrap console credentials, {0}")]
    Bootstrap(bootstrap::Error),
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Self::Config(err)
    }
}

impl From<ProvisioningError> for Error {
    fn from(err: ProvisioningError) -> Self {
        Self::Provisioning(err)
    }
}

// -----------------------------------------------------------------------------
// TeardownWarning structure

/// failed deletion of a console resource, reported but not fatal
#[derive(PartialEq, Eq, Clone, Debug)]
pub struct TeardownWarning {
    pub kind: Kind,
    pub name: String,
    pub message: String,
}

impl Display for TeardownWarning {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "failed to delete {} '{}', {}", self.kind, self.name, self.message)
    }
}

// -----------------------------------------------------------------------------
// Lifecycle structure

#[derive(Clone)]
pub struct Lifecycle {
    api: Arc<dyn Orchestrator>,
    renderer: Arc<dyn Renderer>,
    bootstrapper: Bootstrapper,
    events: Arc<dyn EventBus>,
    config: Arc<Configuration>,
}

impl Lifecycle {
    pub fn new(
        api: Arc<dyn Orchestrator>,
        renderer: Arc<dyn Renderer>,
        bootstrapper: Bootstrapper,
        events: Arc<dyn EventBus>,
        config: Arc<Configuration>,
    ) -> Self {
        Self {
            api,
            renderer,
            bootstrapper,
            events,
            config,
        }
    }

    pub fn api(&self) -> Arc<dyn Orchestrator> {
        self.api.to_owned()
    }

    fn fields(
        &self,
        cluster: &DatabaseCluster,
        instance: &AdminInstance,
        credential: &SetupCredential,
    ) -> ProvisioningFields {
        let console = &self.config.console;

        ProvisioningFields {
            name: Some(instance.name()),
            cluster_name: Some(instance.cluster().to_string()),
            image_prefix: Some(console.image_prefix.to_owned()),
            image_name: Some(console.image_name.to_owned()),
            image_tag: Some(cluster.spec.image_tag.to_owned()),
            disable_security_context: console.disable_security_context,
            port: Some(console.port.to_owned()),
            service_port: Some(console.service_port.to_owned()),
            init_user: Some(credential.username.to_owned()),
            init_pass: Some(credential.password.to_owned()),
            volume_claim_name: Some(instance.name()),
        }
    }

    /// persists the admin-enabled flag, the write fails on concurrent
    /// modification of the cluster
    async fn update_flag(
        &self,
        cluster: &mut DatabaseCluster,
        enabled: bool,
    ) -> Result<(), ConfigError> {
        let (namespace, name) = resource::namespaced_name(cluster);

        cluster.set_admin_enabled(enabled);
        *cluster = self
            .api
            .replace_cluster(cluster)
            .await
            .map_err(|err| ConfigError::from_kube(&namespace, &name, err))?;

        debug!(namespace = &namespace, name = &name, enabled = enabled, "Updated admin flag of cluster");
        Ok(())
    }

    #[cfg_attr(feature = "trace", tracing::instrument(skip(self, cluster)))]
    /// flags the cluster then creates the volume claim, the deployment and
    /// the service of its console
    pub async fn add(
        &self,
        cluster: &mut DatabaseCluster,
        storage: &StorageSpec,
    ) -> Result<AdminInstance, Error> {
        let instance = AdminInstance::from(&*cluster);
        let name = instance.name();
        let namespace = instance.namespace().to_string();

        self.update_flag(cluster, true).await?;

        let spec = storage.with_defaults(&self.config.storage);
        storage::ensure_volume(&*self.api, &name, cluster, &namespace, &spec)
            .await
            .map_err(ProvisioningError::Storage)?;

        let credential = SetupCredential::generate();
        let fields = self.fields(cluster, &instance, &credential);

        let deployment = self
            .renderer
            .deployment(&fields)
            .map_err(ProvisioningError::Render)?;

        self.api
            .create_deployment(&namespace, &deployment)
            .await
            .map_err(|err| {
                ProvisioningError::Create(Kind::Deployment, namespace.to_owned(), name.to_owned(), err)
            })?;

        let service = self
            .renderer
            .service(&fields)
            .map_err(ProvisioningError::Render)?;

        self.api
            .create_service(&namespace, &service)
            .await
            .map_err(|err| {
                ProvisioningError::Create(Kind::Service, namespace.to_owned(), name.to_owned(), err)
            })?;

        info!(namespace = &namespace, name = &name, "Created console of cluster");
        Ok(instance)
    }

    #[cfg_attr(feature = "trace", tracing::instrument(skip(self, cluster)))]
    /// clears the flag of the cluster then deletes the volume claim, the
    /// service and the deployment of its console. Failed deletions are
    /// returned as warnings.
    pub async fn delete(&self, cluster: &mut DatabaseCluster) -> Result<Vec<TeardownWarning>, Error> {
        let instance = AdminInstance::from(&*cluster);
        let name = instance.name();
        let namespace = instance.namespace();

        self.update_flag(cluster, false).await?;

        let mut warnings = vec![];
        let resources = [
            (Kind::VolumeClaim, Cascade::Foreground),
            (Kind::Service, Cascade::Default),
            (Kind::Deployment, Cascade::Foreground),
        ];

        for (kind, cascade) in resources {
            match self.api.delete(kind, namespace, &name, cascade).await {
                Ok(()) => {
                    info!(kind = kind.to_string(), namespace = namespace, name = &name, "Deleted console resource");
                }
                Err(err) if resource::is_not_found(&err) => {
                    debug!(kind = kind.to_string(), namespace = namespace, name = &name, "Console resource is already deleted");
                }
                Err(err) => {
                    let warning = TeardownWarning {
                        kind,
                        name: name.to_owned(),
                        message: err.to_string(),
                    };

                    warn!(namespace = namespace, warning = warning.to_string(), "Could not delete console resource");
                    warnings.push(warning);
                }
            }
        }

        Ok(warnings)
    }

    /// waits for the console deployment of the cluster to be ready
    pub async fn wait_ready(
        &self,
        cluster: &DatabaseCluster,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        let instance = AdminInstance::from(cluster);

        readiness::wait(
            &*self.api,
            instance.namespace(),
            &instance.name(),
            self.config.readiness.timeout(),
            self.config.readiness.interval(),
            cancel,
        )
        .await
        .map_err(Error::Readiness)
    }

    pub async fn bootstrap(&self, cluster: &DatabaseCluster) -> Result<(), Error> {
        self.bootstrapper.sync(cluster).await.map_err(Error::Bootstrap)
    }

    /// publishes the lifecycle event, failures are only logged
    async fn publish(&self, kind: EventKind, cluster: &DatabaseCluster, actor: &str) {
        let (namespace, name) = resource::namespaced_name(cluster);
        let event = LifecycleEvent::new(kind, Header::new(&name, &namespace, actor));

        if let Err(err) = self.events.publish(&event).await {
            warn!(
                namespace = &namespace,
                name = &name,
                event = kind.to_string(),
                error = err.to_string(),
                "Could not publish lifecycle event",
            );
        }
    }

    #[cfg_attr(feature = "trace", tracing::instrument(skip(self, task, cancel)))]
    /// runs the action of the task, removes the task and, on creation, waits
    /// for the console to be ready before bootstrapping its credentials.
    /// Only the action itself may fail, later failures are logged.
    pub async fn handle(&self, task: &ConsoleTask, cancel: &CancellationToken) -> Result<(), Error> {
        let (namespace, task_name) = resource::namespaced_name(task);
        let actor = task.actor();

        let mut cluster = self
            .api
            .get_cluster(&namespace, &task.spec.cluster)
            .await
            .map_err(|err| {
                ConfigError::Missing(namespace.to_owned(), task.spec.cluster.to_owned(), err)
            })?;

        match task.spec.action {
            TaskAction::Add => {
                self.add(&mut cluster, &task.spec.storage).await?;
                self.publish(EventKind::ConsoleCreated, &cluster, &actor).await;
            }
            TaskAction::Delete => {
                let warnings = self.delete(&mut cluster).await?;
                if !warnings.is_empty() {
                    warn!(
                        namespace = &namespace,
                        name = &task.spec.cluster,
                        warnings = warnings.len(),
                        "Console of cluster deleted with warnings",
                    );
                }

                self.publish(EventKind::ConsoleDeleted, &cluster, &actor).await;
            }
        }

        if let Err(err) = self.api.delete_task(&namespace, &task_name).await {
            warn!(
                namespace = &namespace,
                name = &task_name,
                error = err.to_string(),
                "Could not delete completed task",
            );
        }

        if task.spec.action == TaskAction::Add {
            if let Err(err) = self.wait_ready(&cluster, cancel).await {
                error!(
                    namespace = &namespace,
                    name = &task.spec.cluster,
                    error = err.to_string(),
                    "Console of cluster did not become ready",
                );
                return Ok(());
            }

            if let Err(err) = self.bootstrap(&cluster).await {
                error!(
                    namespace = &namespace,
                    name = &task.spec.cluster,
                    error = err.to_string(),
                    "Could not bootstrap console credentials",
                );
            }
        }

        Ok(())
    }
}
