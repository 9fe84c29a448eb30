use std::collections::HashMap;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, RemoveContainerOptions,
    StartContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, PortBinding, RestartPolicy, RestartPolicyNameEnum};
use bollard::network::InspectNetworkOptions;
use bollard::Docker;
use futures_util::stream::StreamExt;
use log::debug;

use super::{ContainerApi, ContainerDetail, CreateOptions};
use crate::error::{Error, Result};

/// Production [`ContainerApi`] over the local daemon socket.
pub struct DockerApi {
    cli: Docker,
}

impl DockerApi {
    /// Connect to the local daemon using default settings. This handles the
    /// unix socket on Linux.
    pub fn connect() -> Result<Self> {
        let cli = Docker::connect_with_local_defaults()?;
        Ok(DockerApi { cli })
    }
}

fn is_not_found(err: &bollard::errors::Error) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

fn is_image_missing(err: &bollard::errors::Error) -> bool {
    // The daemon reports a missing image as a specific 404 on create; any
    // other failure mode is surfaced untouched.
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            message,
        } if message.contains("No such image")
    )
}

#[async_trait]
impl ContainerApi for DockerApi {
    async fn inspect(&self, name: &str) -> Result<Option<ContainerDetail>> {
        let detail = match self.cli.inspect_container(name, None).await {
            Ok(detail) => detail,
            Err(e) if is_not_found(&e) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let config = detail.config.unwrap_or_default();
        let state = detail.state.unwrap_or_default();
        Ok(Some(ContainerDetail {
            id: detail.id.unwrap_or_else(|| name.to_string()),
            image: config.image.unwrap_or_default(),
            command: config.cmd.unwrap_or_default(),
            env: config.env.unwrap_or_default(),
            running: state.running.unwrap_or(false),
            restarting: state.restarting.unwrap_or(false),
        }))
    }

    async fn create(&self, name: &str, opts: CreateOptions) -> Result<String> {
        let mut exposed_ports: HashMap<String, HashMap<(), ()>> = HashMap::new();
        let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
        for binding in &opts.port_bindings {
            let container_port = format!("{}/tcp", binding.container_port);
            exposed_ports.insert(container_port.clone(), HashMap::new());
            port_bindings.insert(
                container_port,
                Some(vec![PortBinding {
                    host_ip: Some(binding.host_ip.clone()),
                    host_port: Some(binding.host_port.to_string()),
                }]),
            );
        }

        let restart_policy = opts.restart_always.then(|| RestartPolicy {
            name: Some(RestartPolicyNameEnum::ALWAYS),
            maximum_retry_count: None,
        });

        let config = Config {
            image: Some(opts.image),
            cmd: Some(opts.command),
            env: Some(opts.env),
            labels: Some(opts.labels),
            open_stdin: Some(opts.open_stdin),
            exposed_ports: Some(exposed_ports),
            host_config: Some(HostConfig {
                binds: Some(opts.binds),
                network_mode: opts.network_mode,
                port_bindings: Some(port_bindings),
                privileged: Some(opts.privileged),
                restart_policy,
                tmpfs: Some(opts.tmpfs),
                ..Default::default()
            }),
            ..Default::default()
        };

        let created = self
            .cli
            .create_container(
                Some(CreateContainerOptions {
                    name: name.to_string(),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(|e| {
                if is_image_missing(&e) {
                    Error::ImageMissing(e.to_string())
                } else {
                    Error::from(e)
                }
            })?;

        Ok(created.id)
    }

    async fn start(&self, id: &str) -> Result<()> {
        self.cli
            .start_container(id, None::<StartContainerOptions<String>>)
            .await?;
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<()> {
        match self
            .cli
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force: true,
                    v: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_by_label(&self, labels: &HashMap<String, String>) -> Result<Vec<String>> {
        let filters = HashMap::from([(
            "label".to_string(),
            labels.iter().map(|(k, v)| format!("{k}={v}")).collect(),
        )]);
        let containers = self
            .cli
            .list_containers(Some(ListContainersOptions::<String> {
                filters,
                ..Default::default()
            }))
            .await?;
        Ok(containers.into_iter().filter_map(|c| c.id).collect())
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        let mut stream = self.cli.create_image(
            Some(CreateImageOptions::<String> {
                from_image: image.to_string(),
                ..Default::default()
            }),
            None,
            None,
        );
        while let Some(progress) = stream.next().await {
            let progress = progress?;
            if let Some(status) = progress.status {
                debug!("pull {image}: {status}");
            }
        }
        Ok(())
    }

    async fn bridge_subnet(&self) -> Result<String> {
        let bridge = self
            .cli
            .inspect_network("bridge", None::<InspectNetworkOptions<String>>)
            .await?;
        bridge
            .ipam
            .and_then(|ipam| ipam.config)
            .and_then(|configs| configs.into_iter().next())
            .and_then(|config| config.subnet)
            .ok_or_else(|| Error::other("no subnet configured on the bridge network"))
    }

    async fn node_name(&self) -> Result<String> {
        let info = self.cli.info().await?;
        info.name
            .ok_or_else(|| Error::other("daemon reported no node name"))
    }
}
