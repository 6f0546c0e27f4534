//! # Event module
//!
//! This module provide helpers to interact with the kubernetes core/v1/event
//! api

use std::{collections::BTreeMap, fmt::Debug};

use chrono::{DateTime, Utc};
use k8s_openapi::{
    api::core::v1::{Event, EventSource, ObjectReference},
    apimachinery::pkg::apis::meta::v1::{MicroTime, Time},
};
use kube::api::ObjectMeta;

use crate::svc::k8s::recorder::Level;

// -----------------------------------------------------------------------------
// constants

pub const COMPONENT: &str = env!("CARGO_PKG_NAME");

// -----------------------------------------------------------------------------
// Helper functions

/// create a new event about the involved object from the given parameters
pub fn new<U>(
    involved: ObjectReference,
    kind: &Level,
    action: &U,
    message: &str,
    annotations: BTreeMap<String, String>,
    now: DateTime<Utc>,
) -> Event
where
    U: ToString + Debug,
{
    Event {
        metadata: ObjectMeta {
            namespace: involved.namespace.to_owned(),
            name: Some(format!(
                "{}-{}-{}",
                involved.name.as_deref().unwrap_or("unknown"),
                action.to_string().to_lowercase(),
                now.timestamp_millis()
            )),
            annotations: if annotations.is_empty() {
                None
            } else {
                Some(annotations)
            },
            ..Default::default()
        },
        type_: Some(kind.to_string()),
        action: Some(action.to_string()),
        count: Some(1),
        event_time: Some(MicroTime(now)),
        first_timestamp: Some(Time(now)),
        involved_object: involved,
        last_timestamp: Some(Time(now)),
        message: Some(message.to_string()),
        reason: Some(action.to_string()),
        reporting_component: Some(COMPONENT.to_string()),
        reporting_instance: Some(format!(
            "{}/{}",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION")
        )),
        series: None,
        source: Some(source()),
        ..Default::default()
    }
}

/// returns the source of this operator
pub fn source() -> EventSource {
    let host = hostname::get()
        .ok()
        .map(|host| host.to_string_lossy().to_string());

    EventSource {
        component: Some(COMPONENT.to_string()),
        host,
    }
}
