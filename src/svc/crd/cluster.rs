//! # DatabaseCluster custom resource
//!
//! This module provide the database cluster custom resource. The operator only
//! reads it and flips the admin-enabled label, the cluster itself is managed
//! elsewhere.

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// -----------------------------------------------------------------------------
// Constants

/// label holding whether a console is attached to the cluster
pub const LABEL_ADMIN_ENABLED: &str = "console-operator.io/admin-enabled";

/// label carried by resources owned by a cluster, e.g. credential secrets
pub const LABEL_CLUSTER: &str = "console-operator.io/cluster";

pub const DEFAULT_DATABASE: &str = "postgres";

/// database accounts used by the platform itself, never mirrored in the console
pub const SYSTEM_ACCOUNTS: [&str; 4] = ["crunchyadm", "pgbouncer", "postgres", "primaryuser"];

// -----------------------------------------------------------------------------
// Spec structure

#[derive(CustomResource, JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
#[kube(group = "console-operator.io")]
#[kube(version = "v1")]
#[kube(kind = "DatabaseCluster")]
#[kube(singular = "databasecluster")]
#[kube(plural = "databaseclusters")]
#[kube(shortname = "dbc")]
#[kube(namespaced)]
#[kube(derive = "PartialEq")]
#[kube(
    printcolumn = r#"{"name":"image", "type":"string", "description":"Image tag", "jsonPath":".spec.imageTag"}"#
)]
#[kube(
    printcolumn = r#"{"name":"admin", "type":"string", "description":"Console attached", "jsonPath":".metadata.labels.console-operator\\.io/admin-enabled"}"#
)]
pub struct Spec {
    #[serde(rename = "imageTag")]
    pub image_tag: String,
    /// database saved connections of the console open first
    #[serde(rename = "database", default = "default_database")]
    pub database: String,
}

fn default_database() -> String {
    DEFAULT_DATABASE.to_string()
}

// -----------------------------------------------------------------------------
// DatabaseCluster implementation

impl DatabaseCluster {
    /// returns if the cluster record claims to have a console attached
    pub fn admin_enabled(&self) -> bool {
        self.labels()
            .get(LABEL_ADMIN_ENABLED)
            .map(|value| value == "true")
            .unwrap_or(false)
    }

    pub fn set_admin_enabled(&mut self, enabled: bool) {
        self.labels_mut()
            .insert(LABEL_ADMIN_ENABLED.to_string(), enabled.to_string());
    }

    /// label selector matching resources owned by this cluster
    pub fn selector(&self) -> String {
        format!("{}={}", LABEL_CLUSTER, self.name_any())
    }
}

/// returns if the given database user is reserved to the platform
pub fn is_system_account(username: &str) -> bool {
    SYSTEM_ACCOUNTS.contains(&username)
}
