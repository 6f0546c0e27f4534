//! # Event recorder module
//!
//! This module records core/v1 events against kubernetes objects, either
//! from the object itself or from a reference to it
//!
//! See <https://kubernetes.io/docs/reference/kubernetes-api/cluster-resources/event-v1/>

use std::{
    collections::BTreeMap,
    fmt::{self, Debug, Display, Formatter},
};

use chrono::Utc;
use k8s_openapi::api::core::v1::{Event, ObjectReference};
use kube::{api::PostParams, Api, Client, Resource};
use tracing::debug;

use crate::svc::k8s::resource;

pub mod event;

// -----------------------------------------------------------------------------
// Level enumeration

/// type of a recorded event
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum Level {
    Warning,
    Normal,
}

impl Display for Level {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Self::Warning => write!(f, "Warning"),
            Self::Normal => write!(f, "Normal"),
        }
    }
}

// -----------------------------------------------------------------------------
// Helper methods

#[cfg_attr(feature = "trace", tracing::instrument(skip(client)))]
/// record an event for the given object
pub async fn record<T, U>(
    client: Client,
    obj: &T,
    kind: &Level,
    action: &U,
    message: &str,
    annotations: BTreeMap<String, String>,
) -> Result<Event, kube::Error>
where
    T: Resource<DynamicType = ()> + Debug,
    U: ToString + Debug,
{
    record_reference(
        client,
        resource::object_reference(obj),
        kind,
        action,
        message,
        annotations,
    )
    .await
}

#[cfg_attr(feature = "trace", tracing::instrument(skip(client)))]
/// record an event for the referenced object
pub async fn record_reference<U>(
    client: Client,
    involved: ObjectReference,
    kind: &Level,
    action: &U,
    message: &str,
    annotations: BTreeMap<String, String>,
) -> Result<Event, kube::Error>
where
    U: ToString + Debug,
{
    let namespace = involved
        .namespace
        .to_owned()
        .unwrap_or_else(|| "default".to_string());

    debug!(
        action = action.to_string(),
        namespace = &namespace,
        name = involved.name.as_deref().unwrap_or("<none>"),
        message = message,
        "Create event for resource",
    );

    let event = event::new(involved, kind, action, message, annotations, Utc::now());

    Api::<Event>::namespaced(client, &namespace)
        .create(&PostParams::default(), &event)
        .await
}

/// shortcut for the [`record`] method with the 'Warning' [`Level`]
pub async fn warning<T, U>(
    client: Client,
    obj: &T,
    action: &U,
    message: &str,
) -> Result<Event, kube::Error>
where
    T: Resource<DynamicType = ()> + Debug,
    U: ToString + Debug,
{
    record(client, obj, &Level::Warning, action, message, BTreeMap::new()).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_is_displayed_as_the_event_type() {
        assert_eq!(Level::Normal.to_string(), "Normal");
        assert_eq!(Level::Warning.to_string(), "Warning");
    }
}
