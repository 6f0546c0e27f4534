//! # Command module
//!
//! This module provide command line interface structures and helpers
use std::{io, net::SocketAddr, path::PathBuf, process::abort, sync::Arc};

use async_trait::async_trait;
use clap::{ArgAction, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::{
    cmd::{console::ConsoleError, crd::CustomResourceDefinitionError},
    svc::{
        cfg::Configuration,
        console::{
            bootstrap::Bootstrapper,
            event::KubeEventBus,
            lifecycle::Lifecycle,
            query::PodQueryHandleFactory,
            template::{self, Renderer, TemplateRenderer, TypedRenderer},
        },
        crd::task,
        k8s::{api::KubeOrchestrator, client, Context, Watcher},
        telemetry,
    },
};

pub mod console;
pub mod crd;

// -----------------------------------------------------------------------------
// Executor trait

#[async_trait]
pub trait Executor {
    type Error;

    async fn execute(
        &self,
        kubeconfig: Option<PathBuf>,
        config: Arc<Configuration>,
    ) -> Result<(), Self::Error>;
}

// -----------------------------------------------------------------------------
// Error enum

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to execute command '{0}', {1}")]
    Execution(String, Arc<Error>),
    #[error("failed to execute command, {0}")]
    CustomResourceDefinition(CustomResourceDefinitionError),
    #[error("failed to execute command, {0}")]
    Console(ConsoleError),
    #[error("failed to run daemon, {0}")]
    Daemon(DaemonError),
}

// -----------------------------------------------------------------------------
// Command enum

#[derive(Subcommand, Clone, Debug)]
pub enum Command {
    /// Interact with custom resource definition
    #[clap(name = "custom-resource-definition", aliases = &["crd"], subcommand)]
    CustomResourceDefinition(crd::CustomResourceDefinition),
    /// Interact with the console of a database cluster
    #[clap(name = "console", subcommand)]
    Console(console::Console),
}

#[async_trait]
impl Executor for Command {
    type Error = Error;

    #[cfg_attr(feature = "trace", tracing::instrument(skip(config)))]
    async fn execute(
        &self,
        kubeconfig: Option<PathBuf>,
        config: Arc<Configuration>,
    ) -> Result<(), Self::Error> {
        match self {
            Self::CustomResourceDefinition(crd) => crd
                .execute(kubeconfig, config)
                .await
                .map_err(Error::CustomResourceDefinition)
                .map_err(|err| {
                    Error::Execution("custom-resource-definition".into(), Arc::new(err))
                }),
            Self::Console(console) => console
                .execute(kubeconfig, config)
                .await
                .map_err(Error::Console)
                .map_err(|err| Error::Execution("console".into(), Arc::new(err))),
        }
    }
}

// -----------------------------------------------------------------------------
// Args struct

#[derive(Parser, Clone, Debug)]
#[clap(author, version, about = env!("CARGO_PKG_DESCRIPTION"))]
pub struct Args {
    /// Increase log verbosity
    #[clap(short = 'v', global = true, action = ArgAction::Count)]
    pub verbosity: u8,
    /// Specify location of kubeconfig
    #[clap(short = 'k', long = "kubeconfig", global = true)]
    pub kubeconfig: Option<PathBuf>,
    /// Specify location of configuration
    #[clap(short = 'c', long = "config", global = true)]
    pub config: Option<PathBuf>,
    /// Check if configuration is healthy
    #[clap(short = 't', long = "check", global = true)]
    pub check: bool,
    #[clap(subcommand)]
    pub command: Option<Command>,
}

// -----------------------------------------------------------------------------
// DaemonError enum

#[derive(thiserror::Error, Debug)]
pub enum DaemonError {
    #[error("failed to handle termination signal, {0}")]
    SigTerm(io::Error),
    #[error("failed to create kubernetes client, {0}")]
    Client(client::Error),
    #[error("failed to load console templates, {0}")]
    Template(template::Error),
}

// -----------------------------------------------------------------------------
// helpers

#[cfg_attr(feature = "trace", tracing::instrument(skip(kube)))]
/// wires the console lifecycle on top of the kubernetes client, templates
/// are read from `console.templates` if set
pub fn lifecycle(
    kube: kube::Client,
    config: Arc<Configuration>,
) -> Result<Lifecycle, template::Error> {
    let console = &config.console;
    let renderer: Arc<dyn Renderer> = match &console.templates {
        Some(directory) => Arc::new(TemplateRenderer::try_new(
            directory,
            console.image_override.to_owned(),
            config.operator.debug,
        )?),
        None => Arc::new(TypedRenderer::new(
            console.image_override.to_owned(),
            config.operator.debug,
        )),
    };

    let api = Arc::new(KubeOrchestrator::from(kube.to_owned()));
    let bootstrapper = Bootstrapper::new(
        api.to_owned(),
        Arc::new(PodQueryHandleFactory::from(kube.to_owned())),
    );

    Ok(Lifecycle::new(
        api,
        renderer,
        bootstrapper,
        Arc::new(KubeEventBus::from(kube)),
        config,
    ))
}

// -----------------------------------------------------------------------------
// daemon function

pub async fn daemon(
    kubeconfig: Option<PathBuf>,
    config: Arc<Configuration>,
) -> Result<(), DaemonError> {
    // -------------------------------------------------------------------------
    // Create a new kubernetes client from path if defined, or via the
    // environment or defaults locations
    let kube = client::try_new(kubeconfig)
        .await
        .map_err(DaemonError::Client)?;

    // -------------------------------------------------------------------------
    // Create context to give to each reconciler
    let lifecycle =
        Arc::new(lifecycle(kube.to_owned(), config.to_owned()).map_err(DaemonError::Template)?);

    let cancel = CancellationToken::new();
    let ctx = Context::new(kube, lifecycle, config.to_owned(), cancel.to_owned());

    // -------------------------------------------------------------------------
    // Create reconcilers and the telemetry server
    let addr: SocketAddr = config.operator.listen;
    let token = cancel.to_owned();
    let handles = vec![
        tokio::spawn(async move {
            let reconciler = task::Reconciler::default();

            info!("Start to listen for events of console task custom resource");
            reconciler.watch(ctx).await;

            error!("Stop to listen for events of console task custom resource");
            abort();
        }),
        tokio::spawn(async move {
            if let Err(err) = telemetry::serve(addr, token).await {
                error!(error = err.to_string(), "Could not serve telemetry");
                abort();
            }
        }),
    ];

    // -------------------------------------------------------------------------
    // Wait for termination signal
    tokio::signal::ctrl_c()
        .await
        .map_err(DaemonError::SigTerm)?;

    // -------------------------------------------------------------------------
    // Cancel readiness waits and the telemetry server, then reconcilers
    info!("Received termination signal, shutting down");
    cancel.cancel();
    handles.iter().for_each(|handle| handle.abort());

    for handle in handles {
        if let Err(err) = handle.await {
            if !err.is_cancelled() {
                error!(error = err.to_string(), "Could not wait for the task to complete");
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn command_line_is_consistent() {
        Args::command().debug_assert();
    }

    #[test]
    fn verbosity_is_counted() {
        let args = Args::try_parse_from(["console-operator", "-vvv", "-t"])
            .expect("arguments to parse");

        assert_eq!(args.verbosity, 3);
        assert!(args.check);
        assert!(args.command.is_none());
    }

    #[test]
    fn console_subcommands_are_parsed() {
        let args = Args::try_parse_from(["console-operator", "console", "wait", "acme", "-n", "ns1"])
            .expect("arguments to parse");

        match args.command {
            Some(Command::Console(console::Console::Wait { cluster, namespace })) => {
                assert_eq!(cluster, "acme");
                assert_eq!(namespace, "ns1");
            }
            command => panic!("unexpected command {command:?}"),
        }
    }
}
