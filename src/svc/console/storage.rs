//! # Storage module
//!
//! This module provide the idempotent provisioning of the volume claim
//! holding the console's data.

use std::collections::BTreeMap;

use k8s_openapi::{
    api::core::v1::{PersistentVolumeClaim, PersistentVolumeClaimSpec, ResourceRequirements},
    apimachinery::pkg::{
        api::resource::Quantity,
        apis::meta::v1::{LabelSelector, ObjectMeta},
    },
};
use kube::ResourceExt;
use tracing::{debug, info};

use crate::svc::{
    cfg,
    console::LABEL_CONSOLE,
    crd::{cluster::DatabaseCluster, cluster::LABEL_CLUSTER, task::StorageSpec},
    k8s::{api::Orchestrator, resource},
};

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to retrieve volume claim '{0}/{1}', {2}")]
    Get(String, String, kube::Error),
    #[error("failed to create volume claim '{0}/{1}', {2}")]
    Create(String, String, kube::Error),
}

// -----------------------------------------------------------------------------
// helpers

/// returns the volume claim to create for the console of the given cluster
pub fn volume_claim(name: &str, owner: &DatabaseCluster, spec: &StorageSpec) -> PersistentVolumeClaim {
    let labels = BTreeMap::from([
        (LABEL_CLUSTER.to_string(), owner.name_any()),
        (LABEL_CONSOLE.to_string(), name.to_string()),
    ]);

    let size = spec
        .size
        .to_owned()
        .unwrap_or_else(|| cfg::DEFAULT_STORAGE_SIZE.to_string());

    let access_mode = spec
        .access_mode
        .to_owned()
        .unwrap_or_else(|| cfg::DEFAULT_STORAGE_ACCESS_MODE.to_string());

    let selector = if spec.match_labels.is_empty() {
        None
    } else {
        Some(LabelSelector {
            match_labels: Some(spec.match_labels.to_owned()),
            ..Default::default()
        })
    };

    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: owner.namespace(),
            labels: Some(labels),
            owner_references: resource::owner_reference(owner).map(|owner| vec![owner]),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec![access_mode]),
            resources: Some(ResourceRequirements {
                requests: Some(BTreeMap::from([("storage".to_string(), Quantity(size))])),
                ..Default::default()
            }),
            storage_class_name: spec.storage_class.to_owned(),
            selector,
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg_attr(feature = "trace", tracing::instrument(skip(api, owner)))]
/// ensures a volume claim named `name` exists in `namespace`, returns whether
/// it had to be created. An existing claim is left untouched.
pub async fn ensure_volume(
    api: &dyn Orchestrator,
    name: &str,
    owner: &DatabaseCluster,
    namespace: &str,
    spec: &StorageSpec,
) -> Result<bool, Error> {
    let found = api
        .get_volume_claim(namespace, name)
        .await
        .map_err(|err| Error::Get(namespace.to_string(), name.to_string(), err))?;

    if found.is_some() {
        debug!(
            namespace = namespace,
            name = name,
            "Volume claim already exists, nothing to do",
        );
        return Ok(false);
    }

    let claim = volume_claim(name, owner, spec);

    match api.create_volume_claim(namespace, &claim).await {
        Ok(_) => {
            info!(namespace = namespace, name = name, "Created volume claim");
            Ok(true)
        }
        // lost a race against another creation of the same claim
        Err(err) if resource::is_conflict(&err) => {
            debug!(
                namespace = namespace,
                name = name,
                "Volume claim was created concurrently, nothing to do",
            );
            Ok(false)
        }
        Err(err) => Err(Error::Create(namespace.to_string(), name.to_string(), err)),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    };

    use kube::core::ErrorResponse;

    use super::*;
    use crate::svc::{crd::cluster::tests::cluster, k8s::api::MockOrchestrator};

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "error".to_string(),
            reason: "Reason".to_string(),
            code,
        })
    }

    #[test]
    fn claim_is_owned_and_labelled_by_the_cluster() {
        let owner = cluster("acme", "ns1");
        let spec = StorageSpec {
            size: Some("2Gi".to_string()),
            access_mode: Some("ReadWriteMany".to_string()),
            storage_class: Some("fast".to_string()),
            match_labels: BTreeMap::from([("tier".to_string(), "ssd".to_string())]),
        };

        let claim = volume_claim("acme-admin", &owner, &spec);
        let labels = claim.metadata.labels.expect("labels to be set");
        let owners = claim.metadata.owner_references.expect("owner to be set");
        let spec = claim.spec.expect("spec to be set");

        assert_eq!(labels.get(LABEL_CLUSTER).map(String::as_str), Some("acme"));
        assert_eq!(labels.get(LABEL_CONSOLE).map(String::as_str), Some("acme-admin"));
        assert_eq!(owners[0].uid, "acme-uid");
        assert_eq!(spec.access_modes, Some(vec!["ReadWriteMany".to_string()]));
        assert_eq!(spec.storage_class_name.as_deref(), Some("fast"));
        assert_eq!(
            spec.resources
                .and_then(|r| r.requests)
                .and_then(|r| r.get("storage").cloned()),
            Some(Quantity("2Gi".to_string()))
        );
        assert!(spec.selector.is_some());
    }

    #[tokio::test]
    async fn ensure_volume_twice_creates_at_most_one_claim() {
        let store: Arc<Mutex<Option<PersistentVolumeClaim>>> = Arc::new(Mutex::new(None));
        let creations = Arc::new(AtomicUsize::new(0));
        let mut api = MockOrchestrator::new();

        let reader = store.clone();
        api.expect_get_volume_claim()
            .returning(move |_, _| Ok(reader.lock().unwrap().clone()));

        let writer = store.clone();
        let counter = creations.clone();
        api.expect_create_volume_claim().returning(move |_, claim| {
            counter.fetch_add(1, Ordering::SeqCst);
            *writer.lock().unwrap() = Some(claim.clone());
            Ok(claim.clone())
        });

        let owner = cluster("acme", "ns1");
        let spec = StorageSpec::default();

        let first = ensure_volume(&api, "acme-admin", &owner, "ns1", &spec).await;
        let second = ensure_volume(&api, "acme-admin", &owner, "ns1", &spec).await;

        assert!(matches!(first, Ok(true)));
        assert!(matches!(second, Ok(false)));
        assert_eq!(creations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_creation_is_not_an_error() {
        let mut api = MockOrchestrator::new();
        api.expect_get_volume_claim().returning(|_, _| Ok(None));
        api.expect_create_volume_claim()
            .returning(|_, _| Err(api_error(409)));

        let result = ensure_volume(
            &api,
            "acme-admin",
            &cluster("acme", "ns1"),
            "ns1",
            &StorageSpec::default(),
        )
        .await;

        assert!(matches!(result, Ok(false)));
    }

    #[tokio::test]
    async fn creation_failure_is_surfaced() {
        let mut api = MockOrchestrator::new();
        api.expect_get_volume_claim().returning(|_, _| Ok(None));
        api.expect_create_volume_claim()
            .returning(|_, _| Err(api_error(403)));

        let result = ensure_volume(
            &api,
            "acme-admin",
            &cluster("acme", "ns1"),
            "ns1",
            &StorageSpec::default(),
        )
        .await;

        assert!(matches!(result, Err(Error::Create(_, _, _))));
    }
}
