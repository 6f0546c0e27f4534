//! # Readiness module
//!
//! This module provide a bounded and cancellable wait on the readiness of a
//! deployment.

use std::{future::Future, time::Duration};

use k8s_openapi::api::apps::v1::Deployment;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::svc::k8s::api::Orchestrator;

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("deployment '{0}/{1}' is not ready after {2:?}")]
    Timeout(String, String, Duration),
    #[error("wait on deployment '{0}/{1}' has been cancelled")]
    Cancelled(String, String),
}

// -----------------------------------------------------------------------------
// helpers

/// returns if every desired replica of the deployment reports ready
pub fn is_ready(deployment: &Deployment) -> bool {
    let desired = deployment
        .spec
        .as_ref()
        .and_then(|spec| spec.replicas)
        .unwrap_or(1);

    let ready = deployment
        .status
        .as_ref()
        .and_then(|status| status.ready_replicas)
        .unwrap_or(0);

    ready == desired
}

#[cfg_attr(feature = "trace", tracing::instrument(skip(api, cancel)))]
/// polls the deployment every `interval` until it is ready, the `timeout`
/// elapses or the token is cancelled. Failed fetches are logged and do not
/// stop the wait.
pub async fn wait(
    api: &dyn Orchestrator,
    namespace: &str,
    name: &str,
    timeout: Duration,
    interval: Duration,
    cancel: &CancellationToken,
) -> Result<(), Error> {
    until_ready(
        || api.get_deployment(namespace, name),
        namespace,
        name,
        timeout,
        interval,
        cancel,
    )
    .await
}

/// the deadline and the token also bound an in-flight fetch
async fn until_ready<F, Fut>(
    fetch: F,
    namespace: &str,
    name: &str,
    timeout: Duration,
    interval: Duration,
    cancel: &CancellationToken,
) -> Result<(), Error>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<Deployment, kube::Error>>,
{
    let poll = async {
        let mut ticker = interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            match fetch().await {
                Ok(deployment) if is_ready(&deployment) => {
                    debug!(namespace = namespace, name = name, "Deployment is ready");
                    return;
                }
                Ok(_) => {
                    debug!(namespace = namespace, name = name, "Deployment is not ready yet");
                }
                Err(err) => {
                    warn!(
                        namespace = namespace,
                        name = name,
                        error = err.to_string(),
                        "Could not retrieve deployment status",
                    );
                }
            }
        }
    };

    tokio::select! {
        biased;

        _ = cancel.cancelled() => {
            Err(Error::Cancelled(namespace.to_string(), name.to_string()))
        }
        _ = poll => Ok(()),
        _ = sleep(timeout) => {
            Err(Error::Timeout(namespace.to_string(), name.to_string(), timeout))
        }
    }
}
