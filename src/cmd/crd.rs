//! # Custom resource definition module
//!
//! This module provides custom resource module command line interface function
//! implementation

use std::{error::Error, path::PathBuf, str::FromStr, sync::Arc};

use async_trait::async_trait;
use clap::Subcommand;
use kube::CustomResourceExt;

use crate::{
    cmd::Executor,
    svc::{
        cfg::Configuration,
        crd::{cluster::DatabaseCluster, task::ConsoleTask},
    },
};

// -----------------------------------------------------------------------------
// CustomResource enum

#[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Debug)]
pub enum CustomResource {
    DatabaseCluster,
    ConsoleTask,
}

impl FromStr for CustomResource {
    type Err = Box<dyn Error + Send + Sync>;

    #[cfg_attr(feature = "trace", tracing::instrument)]
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "cluster" | "databasecluster" => Ok(Self::DatabaseCluster),
            "task" | "consoletask" => Ok(Self::ConsoleTask),
            _ => Err(format!(
                "failed to parse '{s}', available options are 'cluster' or 'task'"
            )
            .into()),
        }
    }
}

// -----------------------------------------------------------------------------
// CustomResourceDefinitionError enum

#[derive(thiserror::Error, Debug)]
pub enum CustomResourceDefinitionError {
    #[error("failed to serialize custom resource definition, {0}")]
    Serialize(serde_yaml::Error),
}

// -----------------------------------------------------------------------------
// CustomResourceDefinition enum

#[derive(Subcommand, Clone, Debug)]
pub enum CustomResourceDefinition {
    /// View custom resource definition
    #[clap(name = "view", aliases = &["v"])]
    View {
        #[clap(name = "custom-resource")]
        custom_resource: Option<CustomResource>,
    },
}

#[async_trait]
impl Executor for CustomResourceDefinition {
    type Error = CustomResourceDefinitionError;

    #[cfg_attr(feature = "trace", tracing::instrument(skip(_kubeconfig, _config)))]
    async fn execute(
        &self,
        _kubeconfig: Option<PathBuf>,
        _config: Arc<Configuration>,
    ) -> Result<(), Self::Error> {
        match self {
            Self::View { custom_resource } => {
                print!("{}", view(custom_resource)?);
                Ok(())
            }
        }
    }
}

// -----------------------------------------------------------------------------
// view function

#[cfg_attr(feature = "trace", tracing::instrument)]
/// returns the yaml documents of the requested definitions, all of them if
/// none is given
pub fn view(
    custom_resource: &Option<CustomResource>,
) -> Result<String, CustomResourceDefinitionError> {
    let crds = match custom_resource {
        Some(CustomResource::DatabaseCluster) => vec![DatabaseCluster::crd()],
        Some(CustomResource::ConsoleTask) => vec![ConsoleTask::crd()],
        None => vec![DatabaseCluster::crd(), ConsoleTask::crd()],
    };

    let documents = crds
        .iter()
        .map(serde_yaml::to_string)
        .collect::<Result<Vec<_>, _>>()
        .map_err(CustomResourceDefinitionError::Serialize)?;

    Ok(documents.join("---\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn custom_resources_are_parsed_case_insensitively() {
        assert_eq!(
            CustomResource::from_str("Cluster").expect("cluster to parse"),
            CustomResource::DatabaseCluster
        );
        assert_eq!(
            CustomResource::from_str("consoletask").expect("task to parse"),
            CustomResource::ConsoleTask
        );
        assert!(CustomResource::from_str("postgresql").is_err());
    }

    #[test]
    fn view_prints_every_definition_by_default() {
        let all = view(&None).expect("definitions to serialize");
        assert!(all.contains("databaseclusters.console-operator.io"));
        assert!(all.contains("consoletasks.console-operator.io"));

        let task = view(&Some(CustomResource::ConsoleTask)).expect("definition to serialize");
        assert!(!task.contains("databaseclusters"));
    }
}
