//! # Template module
//!
//! This module provide the rendering of the console's deployment and service.
//! The [`TypedRenderer`] builds the objects directly, the [`TemplateRenderer`]
//! renders json templates provided by the operator's administrator.

use std::{
    collections::BTreeMap,
    fmt::{self, Display, Formatter},
    num::ParseIntError,
    path::{Path, PathBuf},
};

use k8s_openapi::{
    api::{
        apps::v1::{Deployment, DeploymentSpec},
        core::v1::{
            Container, ContainerPort, EnvVar, PersistentVolumeClaimVolumeSource,
            PodSecurityContext, PodSpec, PodTemplateSpec, Probe, Service, ServicePort,
            ServiceSpec, TCPSocketAction, Volume, VolumeMount,
        },
    },
    apimachinery::pkg::{
        apis::meta::v1::{LabelSelector, ObjectMeta},
        util::intstr::IntOrString,
    },
};
use minijinja::{AutoEscape, Environment, UndefinedBehavior};
use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;

use crate::svc::{console::LABEL_CONSOLE, crd::cluster::LABEL_CLUSTER};

// -----------------------------------------------------------------------------
// Constants

pub const CONTAINER_NAME: &str = "console";
pub const VOLUME_NAME: &str = "console-data";
pub const DATA_PATH: &str = "/var/lib/pgadmin";
pub const ENV_SETUP_EMAIL: &str = "PGADMIN_SETUP_EMAIL";
pub const ENV_SETUP_PASSWORD: &str = "PGADMIN_SETUP_PASSWORD";
pub const ENV_SERVER_PORT: &str = "SERVER_PORT";

/// group owning the console's data volume
pub const FS_GROUP: i64 = 2;

const REDACTED: &str = "<redacted>";

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to render {0} template, field '{1}' is missing")]
    MissingField(Template, &'static str),
    #[error("failed to parse port '{0}', {1}")]
    InvalidPort(String, ParseIntError),
    #[error("failed to read {0} template at '{1:?}', {2}")]
    Read(Template, PathBuf, std::io::Error),
    #[error("failed to render {0} template, {1}")]
    Render(Template, minijinja::Error),
    #[error("failed to decode rendered {0} template, {1}")]
    Decode(Template, serde_json::Error),
}

// -----------------------------------------------------------------------------
// Template enumeration

#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum Template {
    Deployment,
    Service,
}

impl Template {
    pub fn file_name(&self) -> &'static str {
        match self {
            Self::Deployment => "deployment.json.j2",
            Self::Service => "service.json.j2",
        }
    }
}

impl Display for Template {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Self::Deployment => write!(f, "deployment"),
            Self::Service => write!(f, "service"),
        }
    }
}

// -----------------------------------------------------------------------------
// ProvisioningFields structure

/// values substituted in the console's templates, consumed once on creation.
///
/// Unset fields are absent from the template context, so that a template
/// referencing them fails to render.
#[derive(Serialize, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct ProvisioningFields {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_prefix: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_tag: Option<String>,
    pub disable_security_context: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_port: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub init_user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub init_pass: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume_claim_name: Option<String>,
}

impl fmt::Debug for ProvisioningFields {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProvisioningFields")
            .field("name", &self.name)
            .field("cluster_name", &self.cluster_name)
            .field("image_prefix", &self.image_prefix)
            .field("image_name", &self.image_name)
            .field("image_tag", &self.image_tag)
            .field("disable_security_context", &self.disable_security_context)
            .field("port", &self.port)
            .field("service_port", &self.service_port)
            .field("init_user", &self.init_user)
            .field("init_pass", &self.init_pass.as_ref().map(|_| REDACTED))
            .field("volume_claim_name", &self.volume_claim_name)
            .finish()
    }
}

fn required<'a>(
    template: Template,
    value: &'a Option<String>,
    field: &'static str,
) -> Result<&'a str, Error> {
    value
        .as_deref()
        .ok_or(Error::MissingField(template, field))
}

fn parse_port(port: &str) -> Result<i32, Error> {
    port.parse()
        .map_err(|err| Error::InvalidPort(port.to_string(), err))
}

// -----------------------------------------------------------------------------
// Renderer trait

pub trait Renderer: Send + Sync {
    fn deployment(&self, fields: &ProvisioningFields) -> Result<Deployment, Error>;

    fn service(&self, fields: &ProvisioningFields) -> Result<Service, Error>;
}

/// replaces the image of the first container of the deployment
pub fn override_image(deployment: &mut Deployment, image: &str) {
    if let Some(container) = deployment
        .spec
        .as_mut()
        .and_then(|spec| spec.template.spec.as_mut())
        .and_then(|spec| spec.containers.first_mut())
    {
        container.image = Some(image.to_string());
    }
}

/// writes the rendered document to the logs, setup password excluded
fn trace_document<T: Serialize>(template: Template, document: &T) {
    let mut value = match serde_json::to_value(document) {
        Ok(value) => value,
        Err(err) => {
            debug!(template = template.to_string(), error = err.to_string(), "Could not serialize rendered document");
            return;
        }
    };

    redact(&mut value);
    debug!(
        template = template.to_string(),
        document = value.to_string(),
        "Rendered document",
    );
}

fn redact(value: &mut serde_json::Value) {
    match value {
        serde_json::Value::Object(map) => {
            if map.get("name").and_then(|name| name.as_str()) == Some(ENV_SETUP_PASSWORD) {
                if let Some(secret) = map.get_mut("value") {
                    *secret = serde_json::Value::String(REDACTED.to_string());
                }
            }

            map.values_mut().for_each(redact);
        }
        serde_json::Value::Array(items) => items.iter_mut().for_each(redact),
        _ => {}
    }
}

// -----------------------------------------------------------------------------
// TypedRenderer structure

#[derive(Clone, Debug)]
pub struct TypedRenderer {
    image_override: Option<String>,
    debug: bool,
}

impl TypedRenderer {
    pub fn new(image_override: Option<String>, debug: bool) -> Self {
        Self {
            image_override,
            debug,
        }
    }
}

impl Renderer for TypedRenderer {
    fn deployment(&self, fields: &ProvisioningFields) -> Result<Deployment, Error> {
        let t = Template::Deployment;
        let name = required(t, &fields.name, "name")?;
        let cluster = required(t, &fields.cluster_name, "clusterName")?;
        let prefix = required(t, &fields.image_prefix, "imagePrefix")?;
        let image_name = required(t, &fields.image_name, "imageName")?;
        let tag = required(t, &fields.image_tag, "imageTag")?;
        let port = required(t, &fields.port, "port")?;
        let user = required(t, &fields.init_user, "initUser")?;
        let pass = required(t, &fields.init_pass, "initPass")?;
        let claim = required(t, &fields.volume_claim_name, "volumeClaimName")?;
        let container_port = parse_port(port)?;

        let labels = BTreeMap::from([
            (LABEL_CLUSTER.to_string(), cluster.to_string()),
            (LABEL_CONSOLE.to_string(), name.to_string()),
        ]);

        let env = [
            (ENV_SETUP_EMAIL, user),
            (ENV_SETUP_PASSWORD, pass),
            (ENV_SERVER_PORT, port),
        ]
        .into_iter()
        .map(|(name, value)| EnvVar {
            name: name.to_string(),
            value: Some(value.to_string()),
            value_from: None,
        })
        .collect();

        let container = Container {
            name: CONTAINER_NAME.to_string(),
            image: Some(format!("{prefix}/{image_name}:{tag}")),
            ports: Some(vec![ContainerPort {
                name: Some(CONTAINER_NAME.to_string()),
                container_port,
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            env: Some(env),
            volume_mounts: Some(vec![VolumeMount {
                name: VOLUME_NAME.to_string(),
                mount_path: DATA_PATH.to_string(),
                ..Default::default()
            }]),
            readiness_probe: Some(Probe {
                tcp_socket: Some(TCPSocketAction {
                    port: IntOrString::Int(container_port),
                    host: None,
                }),
                initial_delay_seconds: Some(5),
                period_seconds: Some(5),
                ..Default::default()
            }),
            ..Default::default()
        };

        let security_context = if fields.disable_security_context {
            None
        } else {
            Some(PodSecurityContext {
                fs_group: Some(FS_GROUP),
                ..Default::default()
            })
        };

        let mut deployment = Deployment {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(labels.to_owned()),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                replicas: Some(1),
                selector: LabelSelector {
                    match_labels: Some(BTreeMap::from([(
                        LABEL_CONSOLE.to_string(),
                        name.to_string(),
                    )])),
                    ..Default::default()
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(labels),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        containers: vec![container],
                        security_context,
                        volumes: Some(vec![Volume {
                            name: VOLUME_NAME.to_string(),
                            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                                claim_name: claim.to_string(),
                                read_only: None,
                            }),
                            ..Default::default()
                        }]),
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        };

        if let Some(image) = &self.image_override {
            override_image(&mut deployment, image);
        }

        if self.debug {
            trace_document(t, &deployment);
        }

        Ok(deployment)
    }

    fn service(&self, fields: &ProvisioningFields) -> Result<Service, Error> {
        let t = Template::Service;
        let name = required(t, &fields.name, "name")?;
        let cluster = required(t, &fields.cluster_name, "clusterName")?;
        let port = parse_port(required(t, &fields.port, "port")?)?;
        let service_port = match &fields.service_port {
            Some(service_port) => parse_port(service_port)?,
            None => port,
        };

        let service = Service {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(BTreeMap::from([
                    (LABEL_CLUSTER.to_string(), cluster.to_string()),
                    (LABEL_CONSOLE.to_string(), name.to_string()),
                ])),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                type_: Some("ClusterIP".to_string()),
                selector: Some(BTreeMap::from([(
                    LABEL_CONSOLE.to_string(),
                    name.to_string(),
                )])),
                ports: Some(vec![ServicePort {
                    name: Some(CONTAINER_NAME.to_string()),
                    port: service_port,
                    target_port: Some(IntOrString::Int(port)),
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };

        if self.debug {
            trace_document(t, &service);
        }

        Ok(service)
    }
}

// -----------------------------------------------------------------------------
// TemplateRenderer structure

/// renders the json templates found in a directory, read once on creation
#[derive(Clone, Debug)]
pub struct TemplateRenderer {
    deployment: String,
    service: String,
    image_override: Option<String>,
    debug: bool,
}

impl TemplateRenderer {
    pub fn try_new(
        directory: &Path,
        image_override: Option<String>,
        debug: bool,
    ) -> Result<Self, Error> {
        let read = |template: Template| {
            let path = directory.join(template.file_name());
            std::fs::read_to_string(&path).map_err(|err| Error::Read(template, path, err))
        };

        Ok(Self {
            deployment: read(Template::Deployment)?,
            service: read(Template::Service)?,
            image_override,
            debug,
        })
    }

    /// renders the template, printed values are json encoded so that they
    /// cannot escape their string literal
    fn render<T>(&self, template: Template, fields: &ProvisioningFields) -> Result<T, Error>
    where
        T: DeserializeOwned,
    {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        env.set_auto_escape_callback(|_| AutoEscape::Json);

        let source = match template {
            Template::Deployment => &self.deployment,
            Template::Service => &self.service,
        };

        let rendered = env
            .render_str(source, fields)
            .map_err(|err| Error::Render(template, err))?;

        serde_json::from_str(&rendered).map_err(|err| Error::Decode(template, err))
    }
}

/// points every volume claim of the pod at the given claim
fn bind_volume_claims(deployment: &mut Deployment, claim: &str) {
    let volumes = deployment
        .spec
        .as_mut()
        .and_then(|spec| spec.template.spec.as_mut())
        .and_then(|spec| spec.volumes.as_mut());

    for volume in volumes.into_iter().flatten() {
        if let Some(source) = volume.persistent_volume_claim.as_mut() {
            source.claim_name = claim.to_string();
        }
    }
}

impl Renderer for TemplateRenderer {
    fn deployment(&self, fields: &ProvisioningFields) -> Result<Deployment, Error> {
        let t = Template::Deployment;
        let mut deployment: Deployment = self.render(t, fields)?;

        // resources are only ever named after the admin instance
        deployment.metadata.name = Some(required(t, &fields.name, "name")?.to_string());
        bind_volume_claims(
            &mut deployment,
            required(t, &fields.volume_claim_name, "volumeClaimName")?,
        );

        if let Some(image) = &self.image_override {
            override_image(&mut deployment, image);
        }

        if self.debug {
            trace_document(t, &deployment);
        }

        Ok(deployment)
    }

    fn service(&self, fields: &ProvisioningFields) -> Result<Service, Error> {
        let t = Template::Service;
        let mut service: Service = self.render(t, fields)?;

        service.metadata.name = Some(required(t, &fields.name, "name")?.to_string());

        if self.debug {
            trace_document(t, &service);
        }

        Ok(service)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEPLOYMENT: &str = r#"{
  "apiVersion": "apps/v1",
  "kind": "Deployment",
  "metadata": { "name": {{ name }}, "labels": { "console-operator.io/cluster": {{ clusterName }} } },
  "spec": {
    "replicas": 1,
    "selector": { "matchLabels": { "console-operator.io/console": {{ name }} } },
    "template": {
      "metadata": { "labels": { "console-operator.io/console": {{ name }} } },
      "spec": {
        {% if not disableSecurityContext %}"securityContext": { "fsGroup": 2 },{% endif %}
        "containers": [{
          "name": "console",
          "image": {{ imagePrefix ~ "/" ~ imageName ~ ":" ~ imageTag }},
          "env": [
            { "name": "PGADMIN_SETUP_EMAIL", "value": {{ initUser }} },
            { "name": "PGADMIN_SETUP_PASSWORD", "value": {{ initPass }} }
          ]
        }],
        "volumes": [{ "name": "console-data", "persistentVolumeClaim": { "claimName": {{ volumeClaimName }} } }]
      }
    }
  }
}"#;

    const SERVICE: &str = r#"{
  "apiVersion": "v1",
  "kind": "Service",
  "metadata": { "name": {{ name }} },
  "spec": { "ports": [{ "name": "console", "port": {{ servicePort|int }}, "targetPort": {{ port|int }} }] }
}"#;

    fn fields() -> ProvisioningFields {
        ProvisioningFields {
            name: Some("acme-admin".to_string()),
            cluster_name: Some("acme".to_string()),
            image_prefix: Some("example.org/crunchydata".to_string()),
            image_name: Some("crunchy-pgadmin4".to_string()),
            image_tag: Some("centos8-13.1-4.6.0".to_string()),
            disable_security_context: false,
            port: Some("5050".to_string()),
            service_port: Some("5050".to_string()),
            init_user: Some("consolesetup".to_string()),
            init_pass: Some("s3cr3t".to_string()),
            volume_claim_name: Some("acme-admin".to_string()),
        }
    }

    fn template_renderer(image_override: Option<String>) -> TemplateRenderer {
        TemplateRenderer {
            deployment: DEPLOYMENT.to_string(),
            service: SERVICE.to_string(),
            image_override,
            debug: true,
        }
    }

    fn first_container(deployment: &Deployment) -> &Container {
        &deployment
            .spec
            .as_ref()
            .and_then(|spec| spec.template.spec.as_ref())
            .expect("pod spec to be set")
            .containers[0]
    }

    #[test]
    fn typed_deployment_carries_the_provisioning_fields() {
        let renderer = TypedRenderer::new(None, false);
        let deployment = renderer.deployment(&fields()).expect("deployment to render");

        assert_eq!(deployment.metadata.name.as_deref(), Some("acme-admin"));

        let container = first_container(&deployment);
        assert_eq!(
            container.image.as_deref(),
            Some("example.org/crunchydata/crunchy-pgadmin4:centos8-13.1-4.6.0")
        );

        let env = container.env.as_ref().expect("env to be set");
        assert!(env
            .iter()
            .any(|var| var.name == ENV_SETUP_PASSWORD && var.value.as_deref() == Some("s3cr3t")));

        let pod = deployment
            .spec
            .and_then(|spec| spec.template.spec)
            .expect("pod spec to be set");
        assert_eq!(pod.security_context.and_then(|ctx| ctx.fs_group), Some(FS_GROUP));
        assert_eq!(
            pod.volumes
                .and_then(|volumes| volumes.into_iter().next())
                .and_then(|volume| volume.persistent_volume_claim)
                .map(|claim| claim.claim_name)
                .as_deref(),
            Some("acme-admin")
        );
    }

    #[test]
    fn typed_deployment_honours_security_toggle_and_override() {
        let renderer = TypedRenderer::new(
            Some("example.org/custom:1".to_string()),
            false,
        );

        let mut fields = fields();
        fields.disable_security_context = true;

        let deployment = renderer.deployment(&fields).expect("deployment to render");
        assert_eq!(first_container(&deployment).image.as_deref(), Some("example.org/custom:1"));
        assert!(deployment
            .spec
            .and_then(|spec| spec.template.spec)
            .and_then(|pod| pod.security_context)
            .is_none());
    }

    #[test]
    fn typed_rendering_fails_on_missing_field_or_bad_port() {
        let renderer = TypedRenderer::new(None, false);

        let mut missing = fields();
        missing.init_pass = None;
        assert!(matches!(
            renderer.deployment(&missing),
            Err(Error::MissingField(Template::Deployment, "initPass"))
        ));

        let mut invalid = fields();
        invalid.port = Some("http".to_string());
        assert!(matches!(renderer.service(&invalid), Err(Error::InvalidPort(_, _))));
    }

    #[test]
    fn typed_service_targets_the_console_port() {
        let renderer = TypedRenderer::new(None, false);
        let mut fields = fields();
        fields.service_port = Some("80".to_string());

        let port = renderer
            .service(&fields)
            .expect("service to render")
            .spec
            .and_then(|spec| spec.ports)
            .and_then(|ports| ports.into_iter().next())
            .expect("port to be set");

        assert_eq!(port.port, 80);
        assert_eq!(port.target_port, Some(IntOrString::Int(5050)));
    }

    #[test]
    fn templates_render_and_apply_the_override() {
        let renderer = template_renderer(Some("example.org/custom:1".to_string()));

        let deployment = renderer.deployment(&fields()).expect("deployment to render");
        assert_eq!(deployment.metadata.name.as_deref(), Some("acme-admin"));
        assert_eq!(first_container(&deployment).image.as_deref(), Some("example.org/custom:1"));

        let service = renderer.service(&fields()).expect("service to render");
        assert_eq!(service.metadata.name.as_deref(), Some("acme-admin"));
    }

    #[test]
    fn templates_fail_on_undefined_field() {
        let renderer = template_renderer(None);
        let mut fields = fields();
        fields.volume_claim_name = None;

        assert!(matches!(
            renderer.deployment(&fields),
            Err(Error::Render(Template::Deployment, _))
        ));
    }

    #[test]
    fn setup_password_is_redacted_from_documents() {
        let mut value = serde_json::json!({
            "env": [
                { "name": ENV_SETUP_PASSWORD, "value": "s3cr3t" },
                { "name": ENV_SETUP_EMAIL, "value": "consolesetup" }
            ]
        });

        redact(&mut value);

        let rendered = value.to_string();
        assert!(!rendered.contains("s3cr3t"));
        assert!(rendered.contains("consolesetup"));
        assert!(!format!("{:?}", fields()).contains("s3cr3t"));
    }

    #[test]
    fn shipped_templates_match_the_typed_rendering() {
        let directory = Path::new(env!("CARGO_MANIFEST_DIR")).join("templates");
        let renderer = TemplateRenderer::try_new(&directory, None, false)
            .expect("shipped templates to be readable");
        let typed = TypedRenderer::new(None, false);

        let deployment = renderer.deployment(&fields()).expect("deployment to render");
        assert_eq!(
            first_container(&deployment).image,
            first_container(&typed.deployment(&fields()).expect("deployment to render")).image
        );

        let service = renderer.service(&fields()).expect("service to render");
        assert_eq!(
            service.spec.and_then(|spec| spec.type_).as_deref(),
            Some("ClusterIP")
        );

        assert!(matches!(
            TemplateRenderer::try_new(&directory.join("missing"), None, false),
            Err(Error::Read(Template::Deployment, _, _))
        ));
    }

    #[test]
    fn quotes_in_fields_cannot_inject_document_fields() {
        let directory = Path::new(env!("CARGO_MANIFEST_DIR")).join("templates");
        let renderer = TemplateRenderer::try_new(&directory, None, false)
            .expect("shipped templates to be readable");

        let mut fields = fields();
        fields.image_tag = Some(
            r#"1", "imagePullPolicy": "Never", "command": ["sh","-c","evil"], "x": ""#.to_string(),
        );

        let deployment = renderer.deployment(&fields).expect("deployment to render");
        let container = first_container(&deployment);

        assert!(container.command.is_none());
        assert!(container.image_pull_policy.is_none());
        assert_eq!(
            container.image.as_deref(),
            Some(r#"example.org/crunchydata/crunchy-pgadmin4:1", "imagePullPolicy": "Never", "command": ["sh","-c","evil"], "x": ""#)
        );
    }

    #[test]
    fn template_resources_are_named_after_the_instance() {
        let renderer = TemplateRenderer {
            deployment: DEPLOYMENT
                .replace("\"name\": {{ name }}", "\"name\": \"hardcoded\"")
                .replace("{{ volumeClaimName }}", "\"other-claim\""),
            service: SERVICE.replace("{{ name }}", "\"hardcoded\""),
            image_override: None,
            debug: false,
        };

        let deployment = renderer.deployment(&fields()).expect("deployment to render");
        assert_eq!(deployment.metadata.name.as_deref(), Some("acme-admin"));
        assert_eq!(
            deployment
                .spec
                .and_then(|spec| spec.template.spec)
                .and_then(|pod| pod.volumes)
                .and_then(|volumes| volumes.into_iter().next())
                .and_then(|volume| volume.persistent_volume_claim)
                .map(|claim| claim.claim_name)
                .as_deref(),
            Some("acme-admin")
        );

        let service = renderer.service(&fields()).expect("service to render");
        assert_eq!(service.metadata.name.as_deref(), Some("acme-admin"));
    }

    #[test]
    fn templates_honour_the_configured_image_name() {
        let renderer = template_renderer(None);
        let mut fields = fields();
        fields.image_name = Some("console".to_string());

        let deployment = renderer.deployment(&fields).expect("deployment to render");
        assert_eq!(
            first_container(&deployment).image.as_deref(),
            Some("example.org/crunchydata/console:centos8-13.1-4.6.0")
        );
    }
}
