//! # Lifecycle event module
//!
//! This module provide the events published when a console is created or
//! deleted, and the bus they are published on.

use std::{
    collections::BTreeMap,
    fmt::{self, Display, Formatter},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::ObjectReference;
use kube::{Client, Resource};
#[cfg(test)]
use mockall::automock;

use crate::svc::{
    crd::cluster::DatabaseCluster,
    k8s::recorder::{self, Level},
};

// -----------------------------------------------------------------------------
// Constants

pub const TOPIC: &str = "console-lifecycle";

/// annotation carrying the topic on recorded events
pub const ANNOTATION_TOPIC: &str = "console-operator.io/topic";

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to publish event '{0}' on topic '{1}', {2}")]
    Publish(EventKind, &'static str, kube::Error),
}

// -----------------------------------------------------------------------------
// Header structure

#[derive(PartialEq, Eq, Clone, Debug)]
pub struct Header {
    pub cluster_name: String,
    pub namespace: String,
    pub actor: String,
    pub timestamp: DateTime<Utc>,
}

impl Header {
    pub fn new(cluster_name: &str, namespace: &str, actor: &str) -> Self {
        Self {
            cluster_name: cluster_name.to_string(),
            namespace: namespace.to_string(),
            actor: actor.to_string(),
            timestamp: Utc::now(),
        }
    }
}

// -----------------------------------------------------------------------------
// EventKind enumeration

#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum EventKind {
    ConsoleCreated,
    ConsoleDeleted,
}

impl Display for EventKind {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Self::ConsoleCreated => write!(f, "ConsoleCreated"),
            Self::ConsoleDeleted => write!(f, "ConsoleDeleted"),
        }
    }
}

// -----------------------------------------------------------------------------
// LifecycleEvent enumeration

#[derive(PartialEq, Eq, Clone, Debug)]
pub enum LifecycleEvent {
    ConsoleCreated(Header),
    ConsoleDeleted(Header),
}

impl LifecycleEvent {
    pub fn new(kind: EventKind, header: Header) -> Self {
        match kind {
            EventKind::ConsoleCreated => Self::ConsoleCreated(header),
            EventKind::ConsoleDeleted => Self::ConsoleDeleted(header),
        }
    }

    pub fn kind(&self) -> EventKind {
        match self {
            Self::ConsoleCreated(_) => EventKind::ConsoleCreated,
            Self::ConsoleDeleted(_) => EventKind::ConsoleDeleted,
        }
    }

    pub fn header(&self) -> &Header {
        match self {
            Self::ConsoleCreated(header) | Self::ConsoleDeleted(header) => header,
        }
    }

    pub fn topic(&self) -> &'static str {
        TOPIC
    }

    pub fn message(&self) -> String {
        let header = self.header();
        let verb = match self {
            Self::ConsoleCreated(_) => "created",
            Self::ConsoleDeleted(_) => "deleted",
        };

        format!(
            "console of cluster '{}/{}' {verb} by '{}' at {}",
            header.namespace,
            header.cluster_name,
            header.actor,
            header.timestamp.to_rfc3339()
        )
    }
}

// -----------------------------------------------------------------------------
// EventBus trait

#[cfg_attr(test, automock)]
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, event: &LifecycleEvent) -> Result<(), Error>;
}

// -----------------------------------------------------------------------------
// KubeEventBus structure

/// [`EventBus`] recording lifecycle events as kubernetes events involving
/// the database cluster
#[derive(Clone)]
pub struct KubeEventBus {
    client: Client,
}

impl From<Client> for KubeEventBus {
    fn from(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl EventBus for KubeEventBus {
    async fn publish(&self, event: &LifecycleEvent) -> Result<(), Error> {
        let header = event.header();
        let involved = ObjectReference {
            api_version: Some(DatabaseCluster::api_version(&()).to_string()),
            kind: Some(DatabaseCluster::kind(&()).to_string()),
            name: Some(header.cluster_name.to_owned()),
            namespace: Some(header.namespace.to_owned()),
            ..Default::default()
        };

        let annotations = BTreeMap::from([(ANNOTATION_TOPIC.to_string(), event.topic().to_string())]);

        recorder::record_reference(
            self.client.to_owned(),
            involved,
            &Level::Normal,
            &event.kind(),
            &event.message(),
            annotations,
        )
        .await
        .map_err(|err| Error::Publish(event.kind(), TOPIC, err))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_to_their_variant() {
        let header = Header::new("acme", "ns1", "admin");

        let created = LifecycleEvent::new(EventKind::ConsoleCreated, header.to_owned());
        let deleted = LifecycleEvent::new(EventKind::ConsoleDeleted, header.to_owned());

        assert_eq!(created, LifecycleEvent::ConsoleCreated(header.to_owned()));
        assert_eq!(deleted, LifecycleEvent::ConsoleDeleted(header.to_owned()));
        assert_eq!(created.kind(), EventKind::ConsoleCreated);
        assert_eq!(deleted.kind(), EventKind::ConsoleDeleted);
        assert_eq!(created.topic(), "console-lifecycle");
    }

    #[test]
    fn message_names_cluster_and_actor() {
        let event = LifecycleEvent::new(
            EventKind::ConsoleDeleted,
            Header::new("acme", "ns1", "admin"),
        );

        let message = event.message();
        assert!(message.contains("ns1/acme"));
        assert!(message.contains("deleted by 'admin'"));
    }
}
