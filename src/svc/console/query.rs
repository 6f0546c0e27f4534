//! # Query module
//!
//! This module provide the execution of statements against the console's
//! internal database, and the statements used to bootstrap its logins and
//! saved connections.

use async_trait::async_trait;
use base64::{
    engine::general_purpose::{STANDARD, STANDARD_NO_PAD},
    Engine,
};
use hmac::{Hmac, Mac};
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::{
    api::{AttachParams, ListParams},
    Api, Client, ResourceExt,
};
#[cfg(test)]
use mockall::automock;
use rand::RngCore;
use sha2::Sha512;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, trace};

use crate::svc::{
    console::{instance_name, template::CONTAINER_NAME, LABEL_CONSOLE},
    crd::cluster::DatabaseCluster,
};

// -----------------------------------------------------------------------------
// Constants

/// location of the console's internal database inside its container
pub const DATABASE_PATH: &str = "/var/lib/pgadmin/pgadmin4.db";

pub const PASSWORD_ROUNDS: u32 = 25_000;
pub const PASSWORD_SALT_LEN: usize = 16;
pub const PASSWORD_HASH_LEN: usize = 64;

pub const DEFAULT_GROUP: &str = "Servers";
pub const DEFAULT_SSL_MODE: &str = "prefer";

/// port name carried by the database service
pub const DATABASE_PORT_NAME: &str = "postgres";

/// deactivates the setup account and truncates its hash so that it can
/// never authenticate again
pub const LOCKDOWN: &str =
    "UPDATE user SET active = 0, password = substr(password, 1, 50) WHERE id = 1;";

pub const SELECT_SALT: &str = "SELECT value FROM keys WHERE name = 'SECURITY_PASSWORD_SALT';";

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to list console pods of instance '{0}/{1}', {2}")]
    ListPods(String, String, kube::Error),
    #[error("failed to find a running console pod for instance '{0}/{1}'")]
    NoPod(String, String),
    #[error("failed to execute statement in pod '{0}/{1}', {2}")]
    Exec(String, String, kube::Error),
    #[error("failed to read statement output, {0}")]
    Read(std::io::Error),
    #[error("failed to execute statement, {0}")]
    Failed(String),
    #[error("failed to retrieve the password salt of the console")]
    MissingSalt,
    #[error("failed to initialise password hasher, {0}")]
    Hasher(String),
}

// -----------------------------------------------------------------------------
// Endpoint structure

/// network location saved in the console for a database cluster
#[derive(PartialEq, Eq, Clone, Debug)]
pub struct Endpoint {
    pub name: String,
    pub group: String,
    pub host: String,
    pub port: i32,
    pub maintenance_db: String,
    pub ssl_mode: String,
}

impl Endpoint {
    /// resolve the endpoint of the cluster from its service, connections land
    /// on the cluster's database. Returns none if the service exposes no port.
    pub fn from_service(service: &Service, cluster: &DatabaseCluster) -> Option<Self> {
        let spec = service.spec.as_ref()?;
        let ports = spec.ports.as_ref()?;
        let port = ports
            .iter()
            .find(|port| port.name.as_deref() == Some(DATABASE_PORT_NAME))
            .or_else(|| ports.first())?;

        let host = match spec.cluster_ip.as_deref() {
            Some(ip) if !ip.is_empty() && ip != "None" => ip.to_string(),
            _ => format!(
                "{}.{}.svc",
                service.name_any(),
                service.namespace().unwrap_or_default()
            ),
        };

        Some(Self {
            name: cluster.name_any(),
            group: DEFAULT_GROUP.to_string(),
            host,
            port: port.port,
            maintenance_db: cluster.spec.database.to_owned(),
            ssl_mode: DEFAULT_SSL_MODE.to_string(),
        })
    }
}

// -----------------------------------------------------------------------------
// Statements

/// escape a value to be embedded in a single quoted sql string
pub fn escape(value: &str) -> String {
    value.replace('\'', "''")
}

/// returns the pbkdf2 hash of the password in the format expected by the
/// console, the password being first signed using the console's salt
pub fn hash_password(salt: &str, password: &str) -> Result<String, Error> {
    let mut mac = Hmac::<Sha512>::new_from_slice(salt.as_bytes())
        .map_err(|err| Error::Hasher(err.to_string()))?;
    mac.update(password.as_bytes());
    let signed = STANDARD.encode(mac.finalize().into_bytes());

    let mut nonce = [0u8; PASSWORD_SALT_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);

    let mut hash = [0u8; PASSWORD_HASH_LEN];
    pbkdf2::pbkdf2_hmac::<Sha512>(signed.as_bytes(), &nonce, PASSWORD_ROUNDS, &mut hash);

    Ok(format!(
        "$pbkdf2-sha512${PASSWORD_ROUNDS}${}${}",
        adapted_base64(&nonce),
        adapted_base64(&hash)
    ))
}

/// unpadded base64 using '.' in place of '+'
fn adapted_base64(bytes: &[u8]) -> String {
    STANDARD_NO_PAD.encode(bytes).replace('+', ".")
}

/// upsert the login and grant it the user role
pub fn login_statement(username: &str, hash: &str) -> String {
    let username = escape(username);
    let hash = escape(hash);

    format!(
        "BEGIN;\
         UPDATE user SET password = '{hash}', active = 1 WHERE email = '{username}';\
         INSERT INTO user (email, username, password, active, auth_source) \
         SELECT '{username}', '{username}', '{hash}', 1, 'internal' \
         WHERE NOT EXISTS (SELECT 1 FROM user WHERE email = '{username}');\
         INSERT OR IGNORE INTO roles_users (user_id, role_id) \
         SELECT u.id, r.id FROM user u, role r WHERE u.email = '{username}' AND r.name = 'User';\
         COMMIT;"
    )
}

/// replace the saved connection of the login to the endpoint
pub fn connection_statement(username: &str, endpoint: &Endpoint) -> String {
    let username = escape(username);
    let name = escape(&endpoint.name);
    let group = escape(&endpoint.group);
    let host = escape(&endpoint.host);
    let database = escape(&endpoint.maintenance_db);
    let ssl_mode = escape(&endpoint.ssl_mode);
    let port = endpoint.port;

    format!(
        "BEGIN;\
         INSERT INTO servergroup (user_id, name) \
         SELECT u.id, '{group}' FROM user u WHERE u.email = '{username}' \
         AND NOT EXISTS (SELECT 1 FROM servergroup g WHERE g.user_id = u.id AND g.name = '{group}');\
         DELETE FROM server WHERE name = '{name}' \
         AND user_id = (SELECT id FROM user WHERE email = '{username}');\
         INSERT INTO server (user_id, servergroup_id, name, host, port, maintenance_db, username, ssl_mode, comment) \
         SELECT u.id, g.id, '{name}', '{host}', {port}, '{database}', '{username}', '{ssl_mode}', 'managed by {}' \
         FROM user u JOIN servergroup g ON g.user_id = u.id AND g.name = '{group}' \
         WHERE u.email = '{username}';\
         COMMIT;",
        env!("CARGO_PKG_NAME")
    )
}

// -----------------------------------------------------------------------------
// QueryHandle trait

/// handle on the internal database of a console
#[cfg_attr(test, automock)]
#[async_trait]
pub trait QueryHandle: Send + Sync {
    /// execute the statement and returns its standard output
    async fn execute(&self, statement: &str) -> Result<String, Error>;

    async fn set_login_password(&self, username: &str, password: &str) -> Result<(), Error> {
        let salt = self.execute(SELECT_SALT).await?;
        let salt = salt.trim();
        if salt.is_empty() {
            return Err(Error::MissingSalt);
        }

        let hash = hash_password(salt, password)?;

        self.execute(&login_statement(username, &hash)).await?;
        Ok(())
    }

    async fn set_saved_connection(&self, username: &str, endpoint: &Endpoint) -> Result<(), Error> {
        self.execute(&connection_statement(username, endpoint)).await?;
        Ok(())
    }
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait QueryHandleFactory: Send + Sync {
    /// returns a handle on the console of the cluster, none if the cluster
    /// has no console
    async fn obtain(&self, cluster: &DatabaseCluster)
        -> Result<Option<Box<dyn QueryHandle>>, Error>;
}

// -----------------------------------------------------------------------------
// PodQueryHandle structure

/// [`QueryHandle`] executing statements through the sqlite client of a
/// running console pod
#[derive(Clone)]
pub struct PodQueryHandle {
    client: Client,
    namespace: String,
    pod: String,
}

impl PodQueryHandle {
    pub fn new(client: Client, namespace: String, pod: String) -> Self {
        Self {
            client,
            namespace,
            pod,
        }
    }
}

#[async_trait]
impl QueryHandle for PodQueryHandle {
    async fn execute(&self, statement: &str) -> Result<String, Error> {
        let command = vec![
            "sqlite3".to_string(),
            DATABASE_PATH.to_string(),
            statement.to_string(),
        ];

        let params = AttachParams::default()
            .container(CONTAINER_NAME)
            .stdin(false)
            .stdout(true)
            .stderr(true);

        trace!(namespace = &self.namespace, pod = &self.pod, "Execute statement in console pod");

        let mut attached = Api::<Pod>::namespaced(self.client.to_owned(), &self.namespace)
            .exec(&self.pod, command, &params)
            .await
            .map_err(|err| Error::Exec(self.namespace.to_owned(), self.pod.to_owned(), err))?;

        // both pipes are read at once, a full one would block the command
        let (stdout, stderr) = (attached.stdout(), attached.stderr());
        let (stdout, stderr) = tokio::try_join!(drain(stdout), drain(stderr))?;

        let status = match attached.take_status() {
            Some(status) => status.await,
            None => None,
        };

        attached
            .join()
            .await
            .map_err(|err| Error::Failed(err.to_string()))?;

        match status.and_then(|status| status.status) {
            Some(status) if status == "Success" => Ok(stdout),
            _ => Err(Error::Failed(stderr.trim().to_string())),
        }
    }
}

/// reads the stream to its end, an absent stream reads as empty
async fn drain<R>(stream: Option<R>) -> Result<String, Error>
where
    R: AsyncRead + Unpin,
{
    let mut buf = String::new();
    if let Some(mut reader) = stream {
        reader.read_to_string(&mut buf).await.map_err(Error::Read)?;
    }

    Ok(buf)
}

// -----------------------------------------------------------------------------
// PodQueryHandleFactory structure

#[derive(Clone)]
pub struct PodQueryHandleFactory {
    client: Client,
}

impl From<Client> for PodQueryHandleFactory {
    fn from(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl QueryHandleFactory for PodQueryHandleFactory {
    async fn obtain(
        &self,
        cluster: &DatabaseCluster,
    ) -> Result<Option<Box<dyn QueryHandle>>, Error> {
        if !cluster.admin_enabled() {
            return Ok(None);
        }

        let namespace = cluster.namespace().unwrap_or_default();
        let instance = instance_name(&cluster.name_any());
        let params = ListParams::default()
            .labels(&format!("{LABEL_CONSOLE}={instance}"))
            .fields("status.phase=Running");

        let pods = Api::<Pod>::namespaced(self.client.to_owned(), &namespace)
            .list(&params)
            .await
            .map_err(|err| Error::ListPods(namespace.to_owned(), instance.to_owned(), err))?;

        let pod = pods
            .items
            .first()
            .map(|pod| pod.name_any())
            .ok_or_else(|| Error::NoPod(namespace.to_owned(), instance.to_owned()))?;

        debug!(namespace = &namespace, pod = &pod, "Obtained handle on console pod");

        Ok(Some(Box::new(PodQueryHandle::new(
            self.client.to_owned(),
            namespace,
            pod,
        ))))
    }
}
