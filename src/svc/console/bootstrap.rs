//! # Bootstrap module
//!
//! This module provide the synchronisation of the cluster's credentials into
//! its console. The setup account is locked down first, then every eligible
//! credential secret of the cluster becomes a login with a saved connection.

use std::{
    fmt::{self, Debug, Formatter},
    sync::Arc,
};

use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;
use tracing::{debug, info, warn};

use crate::svc::{
    console::query::{self, Endpoint, QueryHandleFactory, LOCKDOWN},
    crd::cluster::{is_system_account, DatabaseCluster},
    k8s::api::Orchestrator,
};

// -----------------------------------------------------------------------------
// Constants

pub const KEY_USERNAME: &str = "username";
pub const KEY_PASSWORD: &str = "password";

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to obtain a handle on the console, {0}")]
    Handle(query::Error),
    #[error("failed to lock down the setup account of the console, {0}")]
    Lockdown(query::Error),
    #[error("failed to resolve database endpoint of cluster '{0}/{1}', {2}")]
    Endpoint(String, String, kube::Error),
    #[error("failed to list credential secrets, {0}")]
    ListSecrets(kube::Error),
    #[error("failed to synchronise credential of user '{username}', {source}")]
    CredentialSync {
        username: String,
        source: query::Error,
    },
}

// -----------------------------------------------------------------------------
// Credential structure

/// database credential read from a secret
#[derive(PartialEq, Eq, Clone)]
pub struct Credential {
    pub username: String,
    pub password: String,
}

impl Debug for Credential {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl Credential {
    /// reads the credential of the secret, none if a field is missing or is
    /// not valid utf-8
    pub fn from_secret(secret: &Secret) -> Option<Self> {
        let data = secret.data.as_ref()?;
        let field = |key: &str| {
            data.get(key)
                .and_then(|value| String::from_utf8(value.0.to_owned()).ok())
        };

        Some(Self {
            username: field(KEY_USERNAME)?,
            password: field(KEY_PASSWORD)?,
        })
    }
}

/// returns the name a credential secret of the cluster must have
pub fn secret_name(cluster: &str, username: &str) -> String {
    format!("{cluster}-{username}-secret")
}

/// returns the credential of the secret if it has to be mirrored in the
/// console of the cluster
pub fn eligible(cluster: &str, secret: &Secret) -> Option<Credential> {
    let name = secret.name_any();
    let credential = match Credential::from_secret(secret) {
        Some(credential) => credential,
        None => {
            debug!(secret = &name, "Skip secret without username or password");
            return None;
        }
    };

    if name != secret_name(cluster, &credential.username) {
        debug!(secret = &name, cluster = cluster, "Skip secret not following the naming convention");
        return None;
    }

    if is_system_account(&credential.username) {
        debug!(secret = &name, username = &credential.username, "Skip system account");
        return None;
    }

    Some(credential)
}

// -----------------------------------------------------------------------------
// Bootstrapper structure

#[derive(Clone)]
pub struct Bootstrapper {
    api: Arc<dyn Orchestrator>,
    consoles: Arc<dyn QueryHandleFactory>,
}

impl Bootstrapper {
    pub fn new(api: Arc<dyn Orchestrator>, consoles: Arc<dyn QueryHandleFactory>) -> Self {
        Self { api, consoles }
    }

    /// resolves the endpoint of the cluster from its service. A service
    /// without port only skips saved connections.
    async fn endpoint(&self, cluster: &DatabaseCluster) -> Result<Option<Endpoint>, Error> {
        let name = cluster.name_any();
        let namespace = cluster.namespace().unwrap_or_default();

        let service = self
            .api
            .get_service(&namespace, &name)
            .await
            .map_err(|err| Error::Endpoint(namespace.to_owned(), name.to_owned(), err))?;

        let endpoint = Endpoint::from_service(&service, cluster);
        if endpoint.is_none() {
            warn!(
                namespace = &namespace,
                name = &name,
                "Service of cluster exposes no port, skip saved connections",
            );
        }

        Ok(endpoint)
    }

    #[cfg_attr(feature = "trace", tracing::instrument(skip(self, cluster)))]
    /// locks down the setup account of the console and mirrors the cluster's
    /// credentials into it. The first failing credential aborts the sync.
    pub async fn sync(&self, cluster: &DatabaseCluster) -> Result<(), Error> {
        let name = cluster.name_any();
        let namespace = cluster.namespace().unwrap_or_default();

        let handle = match self.consoles.obtain(cluster).await.map_err(Error::Handle)? {
            Some(handle) => handle,
            None => {
                debug!(namespace = &namespace, name = &name, "Cluster has no console, nothing to synchronise");
                return Ok(());
            }
        };

        handle.execute(LOCKDOWN).await.map_err(Error::Lockdown)?;
        info!(namespace = &namespace, name = &name, "Locked down setup account of console");

        let endpoint = self.endpoint(cluster).await?;
        let secrets = self
            .api
            .list_secrets(&namespace, &cluster.selector())
            .await
            .map_err(Error::ListSecrets)?;

        for secret in &secrets {
            let credential = match eligible(&name, secret) {
                Some(credential) => credential,
                None => continue,
            };

            let username = credential.username.to_owned();
            let fail = |source: query::Error| Error::CredentialSync {
                username: username.to_owned(),
                source,
            };

            handle
                .set_login_password(&credential.username, &credential.password)
                .await
                .map_err(fail)?;

            if let Some(endpoint) = &endpoint {
                handle
                    .set_saved_connection(&credential.username, endpoint)
                    .await
                    .map_err(fail)?;
            }

            info!(
                namespace = &namespace,
                name = &name,
                username = &credential.username,
                "Synchronised credential into console",
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use k8s_openapi::{
        api::core::v1::{Service, ServicePort, ServiceSpec},
        ByteString,
    };
    use kube::{api::ObjectMeta, core::ErrorResponse};
    use mockall::{predicate, Sequence};

    use super::*;
    use crate::svc::{
        console::query::{MockQueryHandle, MockQueryHandleFactory},
        crd::cluster::tests::cluster,
        k8s::api::MockOrchestrator,
    };

    fn secret(name: &str, username: Option<&str>, password: Option<&str>) -> Secret {
        let mut data = BTreeMap::new();
        if let Some(username) = username {
            data.insert(KEY_USERNAME.to_string(), ByteString(username.as_bytes().to_vec()));
        }
        if let Some(password) = password {
            data.insert(KEY_PASSWORD.to_string(), ByteString(password.as_bytes().to_vec()));
        }

        Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            data: Some(data),
            ..Default::default()
        }
    }

    fn service() -> Service {
        Service {
            spec: Some(ServiceSpec {
                cluster_ip: Some("10.0.0.12".to_string()),
                ports: Some(vec![ServicePort {
                    name: Some("postgres".to_string()),
                    port: 5432,
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn failure() -> query::Error {
        query::Error::Failed("database is locked".to_string())
    }

    fn bootstrapper(api: MockOrchestrator, handle: Option<MockQueryHandle>) -> Bootstrapper {
        let mut consoles = MockQueryHandleFactory::new();
        consoles.expect_obtain().return_once(move |_| {
            Ok(handle.map(|handle| Box::new(handle) as Box<dyn query::QueryHandle>))
        });

        Bootstrapper::new(Arc::new(api), Arc::new(consoles))
    }

    #[test]
    fn eligibility_follows_naming_and_reserved_accounts() {
        assert!(eligible("acme", &secret("acme-alice-secret", Some("alice"), Some("pw"))).is_some());
        assert!(eligible("mycluster", &secret("other-admin-secret", Some("admin"), Some("pw"))).is_none());
        assert!(eligible("acme", &secret("acme-postgres-secret", Some("postgres"), Some("pw"))).is_none());
        assert!(eligible("acme", &secret("acme-bob-secret", Some("bob"), None)).is_none());
        assert!(eligible("acme", &secret("acme-bob-secret", None, Some("pw"))).is_none());
    }

    #[test]
    fn credential_debug_is_redacted() {
        let credential = Credential::from_secret(&secret("acme-alice-secret", Some("alice"), Some("s3cr3t")))
            .expect("credential to be read");

        assert!(!format!("{credential:?}").contains("s3cr3t"));
    }

    #[tokio::test]
    async fn cluster_without_console_is_a_no_op() {
        let bootstrapper = bootstrapper(MockOrchestrator::new(), None);

        assert!(bootstrapper.sync(&cluster("acme", "ns1")).await.is_ok());
    }

    #[tokio::test]
    async fn lockdown_precedes_the_credential_sync() {
        let mut seq = Sequence::new();
        let mut handle = MockQueryHandle::new();

        handle
            .expect_execute()
            .with(predicate::eq(LOCKDOWN))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(String::new()));
        handle
            .expect_set_login_password()
            .with(predicate::eq("alice"), predicate::eq("s3cr3t"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        handle
            .expect_set_saved_connection()
            .with(
                predicate::eq("alice"),
                predicate::function(|endpoint: &Endpoint| endpoint.host == "10.0.0.12"),
            )
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));

        let mut api = MockOrchestrator::new();
        api.expect_get_service().returning(|_, _| Ok(service()));
        api.expect_list_secrets()
            .with(predicate::eq("ns1"), predicate::eq("console-operator.io/cluster=acme"))
            .returning(|_, _| {
                Ok(vec![
                    secret("acme-alice-secret", Some("alice"), Some("s3cr3t")),
                    secret("other-admin-secret", Some("admin"), Some("pw")),
                    secret("acme-postgres-secret", Some("postgres"), Some("pw")),
                ])
            });

        let result = bootstrapper(api, Some(handle))
            .sync(&cluster("acme", "ns1"))
            .await;

        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn failed_lockdown_stops_everything() {
        let mut handle = MockQueryHandle::new();
        handle.expect_execute().returning(|_| Err(failure()));
        handle.expect_set_login_password().never();
        handle.expect_set_saved_connection().never();

        let result = bootstrapper(MockOrchestrator::new(), Some(handle))
            .sync(&cluster("acme", "ns1"))
            .await;

        assert!(matches!(result, Err(Error::Lockdown(_))));
    }

    #[tokio::test]
    async fn mismatched_names_and_system_accounts_are_never_synchronised() {
        let mut handle = MockQueryHandle::new();
        handle.expect_execute().returning(|_| Ok(String::new()));
        handle.expect_set_login_password().never();
        handle.expect_set_saved_connection().never();

        let mut api = MockOrchestrator::new();
        api.expect_get_service().returning(|_, _| Ok(service()));
        api.expect_list_secrets().returning(|_, _| {
            Ok(vec![
                secret("other-admin-secret", Some("admin"), Some("pw")),
                secret("mycluster-postgres-secret", Some("postgres"), Some("pw")),
            ])
        });

        let result = bootstrapper(api, Some(handle))
            .sync(&cluster("mycluster", "ns1"))
            .await;

        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn first_credential_failure_aborts_the_sync() {
        let mut handle = MockQueryHandle::new();
        handle.expect_execute().returning(|_| Ok(String::new()));
        handle
            .expect_set_login_password()
            .with(predicate::eq("alice"), predicate::always())
            .times(1)
            .returning(|_, _| Err(failure()));
        handle
            .expect_set_login_password()
            .with(predicate::eq("bob"), predicate::always())
            .never();
        handle.expect_set_saved_connection().never();

        let mut api = MockOrchestrator::new();
        api.expect_get_service().returning(|_, _| Ok(service()));
        api.expect_list_secrets().returning(|_, _| {
            Ok(vec![
                secret("acme-alice-secret", Some("alice"), Some("pw")),
                secret("acme-bob-secret", Some("bob"), Some("pw")),
            ])
        });

        let result = bootstrapper(api, Some(handle))
            .sync(&cluster("acme", "ns1"))
            .await;

        assert!(matches!(
            result,
            Err(Error::CredentialSync { ref username, .. }) if username == "alice"
        ));
    }

    #[tokio::test]
    async fn service_without_port_skips_saved_connections() {
        let mut handle = MockQueryHandle::new();
        handle.expect_execute().returning(|_| Ok(String::new()));
        handle
            .expect_set_login_password()
            .times(1)
            .returning(|_, _| Ok(()));
        handle.expect_set_saved_connection().never();

        let mut api = MockOrchestrator::new();
        api.expect_get_service()
            .returning(|_, _| Ok(Service::default()));
        api.expect_list_secrets()
            .returning(|_, _| Ok(vec![secret("acme-alice-secret", Some("alice"), Some("pw"))]));

        let result = bootstrapper(api, Some(handle))
            .sync(&cluster("acme", "ns1"))
            .await;

        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn unreachable_endpoint_aborts_the_sync() {
        let mut handle = MockQueryHandle::new();
        handle
            .expect_execute()
            .with(predicate::eq(LOCKDOWN))
            .times(1)
            .returning(|_| Ok(String::new()));
        handle.expect_set_login_password().never();
        handle.expect_set_saved_connection().never();

        let mut api = MockOrchestrator::new();
        api.expect_get_service()
            .with(predicate::eq("ns1"), predicate::eq("acme"))
            .returning(|_, _| {
                Err(kube::Error::Api(ErrorResponse {
                    status: "Failure".to_string(),
                    message: "not found".to_string(),
                    reason: "NotFound".to_string(),
                    code: 404,
                }))
            });
        api.expect_list_secrets().never();

        let result = bootstrapper(api, Some(handle))
            .sync(&cluster("acme", "ns1"))
            .await;

        assert!(matches!(
            result,
            Err(Error::Endpoint(ref namespace, ref name, _)) if namespace == "ns1" && name == "acme"
        ));
    }
}
