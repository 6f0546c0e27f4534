//! # Console module
//!
//! This module provides commands to run the later steps of a console creation
//! by hand, namely the readiness wait and the credential bootstrap

use std::{path::PathBuf, sync::Arc};

use async_trait::async_trait;
use clap::Subcommand;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    cmd::{self, Executor},
    svc::{
        cfg::Configuration,
        console::{lifecycle, template},
        k8s::client,
    },
};

// -----------------------------------------------------------------------------
// ConsoleError enum

#[derive(thiserror::Error, Debug)]
pub enum ConsoleError {
    #[error("failed to create kubernetes client, {0}")]
    Client(client::Error),
    #[error("failed to load console templates, {0}")]
    Template(template::Error),
    #[error("failed to retrieve cluster '{0}/{1}', {2}")]
    Cluster(String, String, kube::Error),
    #[error("{0}")]
    Lifecycle(lifecycle::Error),
}

// -----------------------------------------------------------------------------
// Console enum

#[derive(Subcommand, Clone, Debug)]
pub enum Console {
    /// Synchronize the credentials of the cluster users into its console
    #[clap(name = "bootstrap", aliases = &["b"])]
    Bootstrap {
        #[clap(name = "cluster")]
        cluster: String,
        #[clap(short = 'n', long = "namespace", default_value = "default")]
        namespace: String,
    },
    /// Wait for the console of the cluster to be ready
    #[clap(name = "wait", aliases = &["w"])]
    Wait {
        #[clap(name = "cluster")]
        cluster: String,
        #[clap(short = 'n', long = "namespace", default_value = "default")]
        namespace: String,
    },
}

#[async_trait]
impl Executor for Console {
    type Error = ConsoleError;

    #[cfg_attr(feature = "trace", tracing::instrument(skip(config)))]
    async fn execute(
        &self,
        kubeconfig: Option<PathBuf>,
        config: Arc<Configuration>,
    ) -> Result<(), Self::Error> {
        let (name, namespace) = match self {
            Self::Bootstrap { cluster, namespace } | Self::Wait { cluster, namespace } => {
                (cluster, namespace)
            }
        };

        let kube = client::try_new(kubeconfig)
            .await
            .map_err(ConsoleError::Client)?;

        let lifecycle = cmd::lifecycle(kube, config).map_err(ConsoleError::Template)?;
        let cluster = lifecycle
            .api()
            .get_cluster(namespace, name)
            .await
            .map_err(|err| ConsoleError::Cluster(namespace.to_owned(), name.to_owned(), err))?;

        match self {
            Self::Bootstrap { .. } => {
                lifecycle
                    .bootstrap(&cluster)
                    .await
                    .map_err(ConsoleError::Lifecycle)?;

                info!(namespace = namespace, name = name, "Console credentials are synchronized");
            }
            Self::Wait { .. } => {
                let cancel = CancellationToken::new();
                let token = cancel.to_owned();
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        warn!("Received termination signal, abort the wait");
                        token.cancel();
                    }
                });

                lifecycle
                    .wait_ready(&cluster, &cancel)
                    .await
                    .map_err(ConsoleError::Lifecycle)?;

                info!(namespace = namespace, name = name, "Console is ready");
            }
        }

        Ok(())
    }
}
