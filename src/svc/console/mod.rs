//! # Console module
//!
//! This module provide the provisioning and teardown of the administrative
//! console attached to a database cluster, and the bootstrap of its
//! credentials.
//!
//! Every kubernetes resource of a console (deployment, service and volume
//! claim) is named after its [`AdminInstance`].

use std::fmt::{self, Debug, Formatter};

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine};
use kube::ResourceExt;
use rand::{rngs::SmallRng, RngCore, SeedableRng};

use crate::svc::crd::cluster::DatabaseCluster;

pub mod bootstrap;
pub mod event;
pub mod lifecycle;
pub mod query;
pub mod readiness;
pub mod storage;
pub mod template;

// -----------------------------------------------------------------------------
// Constants

/// label carried by every resource of a console, valued with the instance name
pub const LABEL_CONSOLE: &str = "console-operator.io/console";

/// account the console is initialised with, locked down right after
pub const SETUP_USERNAME: &str = "consolesetup";

/// number of random bytes of the setup password
pub const SETUP_PASSWORD_LEN: usize = 20;

// -----------------------------------------------------------------------------
// AdminInstance structure

/// logical identity of the console attached to a cluster
#[derive(PartialEq, Eq, Clone, Debug)]
pub struct AdminInstance {
    cluster: String,
    namespace: String,
}

impl AdminInstance {
    pub fn new(cluster: &str, namespace: &str) -> Self {
        Self {
            cluster: cluster.to_string(),
            namespace: namespace.to_string(),
        }
    }

    /// name shared by the deployment, the service and the volume claim
    pub fn name(&self) -> String {
        instance_name(&self.cluster)
    }

    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }
}

impl From<&DatabaseCluster> for AdminInstance {
    fn from(cluster: &DatabaseCluster) -> Self {
        Self {
            cluster: cluster.name_any(),
            namespace: cluster.namespace().unwrap_or_default(),
        }
    }
}

pub fn instance_name(cluster: &str) -> String {
    format!("{cluster}-admin")
}

// -----------------------------------------------------------------------------
// SetupCredential structure

/// one-time credential the console is initialised with.
///
/// The password comes from a non-cryptographic generator. This is acceptable
/// only because the account is deactivated and its hash corrupted by the
/// credential bootstrap before the console is handed to anyone.
#[derive(Clone)]
pub struct SetupCredential {
    pub username: String,
    pub password: String,
}

impl SetupCredential {
    pub fn generate() -> Self {
        let mut rng = SmallRng::from_entropy();
        let mut buf = [0u8; SETUP_PASSWORD_LEN];

        rng.fill_bytes(&mut buf);

        Self {
            username: SETUP_USERNAME.to_string(),
            password: STANDARD_NO_PAD.encode(buf),
        }
    }
}

impl Debug for SetupCredential {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("SetupCredential")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}
