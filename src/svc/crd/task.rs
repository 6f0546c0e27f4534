//! # ConsoleTask custom resource
//!
//! This module provide the task custom resource used to request the creation
//! or the removal of a console next to a database cluster.

use std::{
    collections::BTreeMap,
    fmt::{self, Display, Formatter},
    sync::Arc,
};

use async_trait::async_trait;
use kube::{
    runtime::{controller::Action, watcher, Controller},
    Api, CustomResource, ResourceExt,
};
#[cfg(feature = "metrics")]
use once_cell::sync::Lazy;
#[cfg(feature = "metrics")]
use prometheus::{opts, register_counter_vec, CounterVec};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::svc::{
    cfg,
    console::lifecycle::Lifecycle,
    k8s::{self, recorder, resource, Context, ControllerBuilder},
};

// -----------------------------------------------------------------------------
// Telemetry

#[cfg(feature = "metrics")]
static TASK_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        opts!("console_operator_task_total", "number of processed console tasks"),
        &["action", "outcome"]
    )
    .expect("metrics 'console_operator_task_total' to not be already registered")
});

// -----------------------------------------------------------------------------
// Constants

/// label naming the user who requested the task
pub const LABEL_USER: &str = "console-operator.io/user";

pub const UNKNOWN_ACTOR: &str = "<unknown>";

// -----------------------------------------------------------------------------
// TaskAction enumeration

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Debug)]
pub enum TaskAction {
    #[serde(rename = "add")]
    Add,
    #[serde(rename = "delete")]
    Delete,
}

impl Display for TaskAction {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Self::Add => write!(f, "add"),
            Self::Delete => write!(f, "delete"),
        }
    }
}

// -----------------------------------------------------------------------------
// StorageSpec structure

/// volume claim parameters, unset fields fall back to the configuration
#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub struct StorageSpec {
    #[serde(rename = "size", default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    #[serde(rename = "accessMode", default, skip_serializing_if = "Option::is_none")]
    pub access_mode: Option<String>,
    #[serde(rename = "storageClass", default, skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,
    #[serde(rename = "matchLabels", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub match_labels: BTreeMap<String, String>,
}

impl StorageSpec {
    /// fills unset fields with the operator defaults
    pub fn with_defaults(&self, defaults: &cfg::Storage) -> Self {
        Self {
            size: self.size.to_owned().or_else(|| Some(defaults.size.to_owned())),
            access_mode: self
                .access_mode
                .to_owned()
                .or_else(|| Some(defaults.access_mode.to_owned())),
            storage_class: self
                .storage_class
                .to_owned()
                .or_else(|| defaults.storage_class.to_owned()),
            match_labels: self.match_labels.to_owned(),
        }
    }
}

// -----------------------------------------------------------------------------
// Spec structure

#[derive(CustomResource, JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
#[kube(group = "console-operator.io")]
#[kube(version = "v1")]
#[kube(kind = "ConsoleTask")]
#[kube(singular = "consoletask")]
#[kube(plural = "consoletasks")]
#[kube(shortname = "ct")]
#[kube(status = "Status")]
#[kube(namespaced)]
#[kube(derive = "PartialEq")]
#[kube(
    printcolumn = r#"{"name":"action", "type":"string", "description":"Action", "jsonPath":".spec.action"}"#
)]
#[kube(
    printcolumn = r#"{"name":"cluster", "type":"string", "description":"Cluster", "jsonPath":".spec.cluster"}"#
)]
#[kube(
    printcolumn = r#"{"name":"phase", "type":"string", "description":"Phase", "jsonPath":".status.phase"}"#
)]
pub struct Spec {
    #[serde(rename = "action")]
    pub action: TaskAction,
    #[serde(rename = "cluster")]
    pub cluster: String,
    #[serde(rename = "storage", default)]
    pub storage: StorageSpec,
}

// -----------------------------------------------------------------------------
// Status structure

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Debug, Default)]
pub enum Phase {
    #[default]
    Pending,
    Failed,
}

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
pub struct Status {
    #[serde(rename = "phase")]
    pub phase: Phase,
    #[serde(rename = "message", default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

// -----------------------------------------------------------------------------
// ConsoleTask implementation

impl ConsoleTask {
    /// returns the user who requested the task
    pub fn actor(&self) -> String {
        self.labels()
            .get(LABEL_USER)
            .cloned()
            .unwrap_or_else(|| UNKNOWN_ACTOR.to_string())
    }

    pub fn failed(&self) -> bool {
        self.status
            .as_ref()
            .map(|status| status.phase == Phase::Failed)
            .unwrap_or(false)
    }

    pub fn set_failed(&mut self, message: String) {
        let status = self.status.get_or_insert_with(Status::default);

        status.phase = Phase::Failed;
        status.message = Some(message);
    }
}

// -----------------------------------------------------------------------------
// TaskEvent enumeration

/// reasons of the events recorded on tasks
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum TaskEvent {
    ConsoleTaskFailed,
}

impl Display for TaskEvent {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Self::ConsoleTaskFailed => write!(f, "ConsoleTaskFailed"),
        }
    }
}

// -----------------------------------------------------------------------------
// ReconcilerError enumeration

#[derive(thiserror::Error, Debug)]
pub enum ReconcilerError {
    #[error("failed to update status of task, {0}")]
    Status(kube::Error),
    #[error("failed to record event on task, {0}")]
    Event(kube::Error),
}

// -----------------------------------------------------------------------------
// helpers

#[cfg_attr(feature = "trace", tracing::instrument(skip(lifecycle, task, cancel)))]
/// runs the task and, on failure, persists the failed phase. Returns the
/// failed task along with the failure message.
pub async fn process(
    lifecycle: &Lifecycle,
    task: &ConsoleTask,
    cancel: &CancellationToken,
) -> Result<Option<(ConsoleTask, String)>, ReconcilerError> {
    let (namespace, name) = resource::namespaced_name(task);

    if task.failed() {
        debug!(namespace = &namespace, name = &name, "Skip failed task");
        return Ok(None);
    }

    let result = lifecycle.handle(task, cancel).await;

    #[cfg(feature = "metrics")]
    TASK_TOTAL
        .with_label_values(&[
            &task.spec.action.to_string(),
            if result.is_ok() { "success" } else { "failure" },
        ])
        .inc();

    let err = match result {
        Ok(()) => {
            info!(
                namespace = &namespace,
                name = &name,
                action = task.spec.action.to_string(),
                cluster = &task.spec.cluster,
                "Processed console task",
            );
            return Ok(None);
        }
        Err(err) => err,
    };

    let message = err.to_string();
    error!(
        namespace = &namespace,
        name = &name,
        action = task.spec.action.to_string(),
        cluster = &task.spec.cluster,
        error = &message,
        "Failed to process console task",
    );

    let mut modified = task.to_owned();
    modified.set_failed(message.to_owned());

    lifecycle
        .api()
        .patch_task_status(task, &modified)
        .await
        .map_err(ReconcilerError::Status)?;

    Ok(Some((modified, message)))
}

// -----------------------------------------------------------------------------
// Reconciler structure

#[derive(Clone, Default, Debug)]
pub struct Reconciler {}

impl ControllerBuilder<ConsoleTask> for Reconciler {
    fn build(&self, ctx: Context) -> Controller<ConsoleTask> {
        let api = match &ctx.config.operator.namespace {
            Some(namespace) => Api::namespaced(ctx.kube, namespace),
            None => Api::all(ctx.kube),
        };

        Controller::new(api, watcher::Config::default())
    }
}

#[async_trait]
impl k8s::Reconciler<ConsoleTask> for Reconciler {
    type Error = ReconcilerError;

    async fn upsert(ctx: Arc<Context>, origin: Arc<ConsoleTask>) -> Result<Action, ReconcilerError> {
        if let Some((modified, message)) = process(&ctx.lifecycle, &origin, &ctx.cancel).await? {
            recorder::warning(ctx.kube.to_owned(), &modified, &TaskEvent::ConsoleTaskFailed, &message)
                .await
                .map_err(ReconcilerError::Event)?;
        }

        // failed tasks are not retried, a new task has to be created
        Ok(Action::await_change())
    }

    async fn delete(_ctx: Arc<Context>, origin: Arc<ConsoleTask>) -> Result<Action, ReconcilerError> {
        let (namespace, name) = resource::namespaced_name(&*origin);

        debug!(namespace = &namespace, name = &name, "Ignore deleted task");
        Ok(Action::await_change())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use kube::api::ObjectMeta;
    use mockall::predicate;

    use super::*;
    use crate::svc::{
        console::{
            event::MockEventBus,
            lifecycle::tests::{api_error, lifecycle},
        },
        k8s::api::MockOrchestrator,
    };

    pub(crate) fn task(name: &str, action: TaskAction, cluster: &str) -> ConsoleTask {
        ConsoleTask {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("ns1".to_string()),
                labels: Some(BTreeMap::from([(LABEL_USER.to_string(), "admin".to_string())])),
                ..Default::default()
            },
            spec: Spec {
                action,
                cluster: cluster.to_string(),
                storage: StorageSpec::default(),
            },
            status: None,
        }
    }

    #[test]
    fn storage_defaults_only_fill_gaps() {
        let defaults = cfg::Storage {
            size: "1Gi".to_string(),
            access_mode: "ReadWriteOnce".to_string(),
            storage_class: Some("standard".to_string()),
        };

        let spec = StorageSpec {
            size: Some("5Gi".to_string()),
            ..Default::default()
        }
        .with_defaults(&defaults);

        assert_eq!(spec.size.as_deref(), Some("5Gi"));
        assert_eq!(spec.access_mode.as_deref(), Some("ReadWriteOnce"));
        assert_eq!(spec.storage_class.as_deref(), Some("standard"));
    }

    #[test]
    fn actor_falls_back_when_label_is_missing() {
        let mut task = task("t", TaskAction::Add, "acme");
        assert_eq!(task.actor(), "admin");

        task.metadata.labels = None;
        assert_eq!(task.actor(), UNKNOWN_ACTOR);
    }

    #[test]
    fn failed_tasks_are_flagged() {
        let mut task = task("t", TaskAction::Delete, "acme");
        assert!(!task.failed());

        task.set_failed("boom".to_string());
        assert!(task.failed());
        assert_eq!(
            task.status.and_then(|status| status.message).as_deref(),
            Some("boom")
        );
    }

    #[tokio::test]
    async fn failed_tasks_are_skipped() {
        let mut api = MockOrchestrator::new();
        api.expect_get_cluster().never();
        api.expect_patch_task_status().never();

        let lifecycle = lifecycle(api, MockEventBus::new());
        let mut task = task("t", TaskAction::Add, "acme");
        task.set_failed("boom".to_string());

        let outcome = process(&lifecycle, &task, &CancellationToken::new())
            .await
            .expect("skipping a failed task to succeed");

        assert!(outcome.is_none());
    }

    #[tokio::test]
    async fn task_failure_is_persisted_in_status() {
        let mut api = MockOrchestrator::new();
        api.expect_get_cluster()
            .with(predicate::eq("ns1"), predicate::eq("acme"))
            .times(1)
            .returning(|_, _| Err(api_error(404)));
        api.expect_delete_task().never();
        api.expect_patch_task_status()
            .with(
                predicate::function(|origin: &ConsoleTask| !origin.failed()),
                predicate::function(|modified: &ConsoleTask| modified.failed()),
            )
            .times(1)
            .returning(|_, _| Ok(()));

        let lifecycle = lifecycle(api, MockEventBus::new());

        let (modified, message) = process(
            &lifecycle,
            &task("t", TaskAction::Delete, "acme"),
            &CancellationToken::new(),
        )
        .await
        .expect("processing to succeed")
        .expect("task to be marked as failed");

        assert!(modified.failed());
        assert!(message.contains("acme"));
        assert_eq!(
            modified.status.and_then(|status| status.message),
            Some(message)
        );
    }

    #[tokio::test]
    async fn status_update_failure_is_an_error() {
        let mut api = MockOrchestrator::new();
        api.expect_get_cluster()
            .returning(|_, _| Err(api_error(404)));
        api.expect_patch_task_status()
            .times(1)
            .returning(|_, _| Err(api_error(500)));

        let lifecycle = lifecycle(api, MockEventBus::new());
        let result = process(
            &lifecycle,
            &task("t", TaskAction::Add, "acme"),
            &CancellationToken::new(),
        )
        .await;

        assert!(matches!(result, Err(ReconcilerError::Status(_))));
    }
}
