//! Per-tick projection of the membership view onto local containers.
//!
//! Holds the last applied cluster state and only reconfigures when the slot
//! assignment visible to this node actually changed. The managed agent is
//! attempted every tick regardless, because it depends on the server being
//! up rather than on membership.

use std::collections::HashMap;
use std::sync::Arc;

use log::info;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::product::{ProductApi, StackDeployer};
use crate::runtime::{ContainerSpec, Driver};
use crate::store::{Credentials, Member, SERVER_PORT};
use crate::tunnel::{self, TunnelOp};

pub const COORDINATION: &str = "zk";
pub const STORAGE: &str = "redis";
pub const SERVER: &str = "cattle";
pub const AGENT: &str = "agent";
/// Name of the agent container the managed product itself maintains.
const AGENT_RUNNING_CHECK: &str = "cattle-agent";

#[derive(Debug, Clone, Default, PartialEq)]
struct ClusterState {
    /// One ip per slot, empty string for open slots.
    cluster: Vec<String>,
    by_index: HashMap<i32, Member>,
    index: i32,
}

pub struct ClusterService {
    cfg: Arc<Config>,
    driver: Driver,
    product: Arc<dyn ProductApi>,
    deployer: Arc<dyn StackDeployer>,
    state: ClusterState,
    launched_stack: bool,
}

impl ClusterService {
    pub fn new(
        cfg: Arc<Config>,
        driver: Driver,
        product: Arc<dyn ProductApi>,
        deployer: Arc<dyn StackDeployer>,
    ) -> Self {
        ClusterService {
            cfg,
            driver,
            product,
            deployer,
            state: ClusterState::default(),
            launched_stack: false,
        }
    }

    pub async fn update(
        &mut self,
        leader: bool,
        by_index: HashMap<i32, Member>,
        credentials: Option<Credentials>,
    ) -> Result<()> {
        let mut next = ClusterState {
            cluster: Vec::with_capacity(self.cfg.cluster_size as usize),
            by_index,
            index: 0,
        };
        let mut assigned = 0;
        for i in 1..=self.cfg.cluster_size {
            match next.by_index.get(&i) {
                Some(member) => {
                    if member.uuid == self.cfg.uuid {
                        next.index = i;
                    }
                    assigned += 1;
                    next.cluster.push(member.ip.clone());
                }
                None => next.cluster.push(String::new()),
            }
        }

        if next.index != self.state.index || next.cluster != self.state.cluster {
            info!(
                "cluster changed, index={}, members=[{}]",
                next.index,
                next.cluster.join(", ")
            );
            self.configure(&next).await?;
            self.state = next;

            if assigned > self.cfg.cluster_size / 2 {
                self.launch_server().await?;
            }
        }

        if let Err(e) = self.launch_agent(leader, credentials).await {
            info!("can not launch agent right now: {e}");
        }

        Ok(())
    }

    /// Apply the tunnel plan, then the local sidecars once this node holds a
    /// slot.
    async fn configure(&self, next: &ClusterState) -> Result<()> {
        for op in tunnel::plan(&self.cfg, next.index, &next.by_index) {
            match op {
                TunnelOp::Ensure(spec) => self.driver.launch(spec).await?,
                TunnelOp::Remove(name) => self.driver.delete(&name).await?,
            }
        }

        if next.index <= 0 {
            return Ok(());
        }

        for service in [COORDINATION, STORAGE] {
            self.driver
                .launch(ContainerSpec {
                    command: vec![service.to_string()],
                    env: HashMap::from([
                        ("INDEX".to_string(), next.index.to_string()),
                        (
                            "CLUSTER_SIZE".to_string(),
                            self.cfg.cluster_size.to_string(),
                        ),
                    ]),
                    ..ContainerSpec::named(service)
                })
                .await?;
        }

        Ok(())
    }

    /// The managed server sees every peer's coordination and storage
    /// endpoints at fixed local ports, courtesy of the tunnels.
    async fn launch_server(&self) -> Result<()> {
        self.driver
            .launch(ContainerSpec {
                command: vec![SERVER.to_string()],
                restart_always: true,
                env: HashMap::from([
                    ("CATTLE_HOST_API_PROXY_MODE".to_string(), "ha".to_string()),
                    ("CATTLE_MODULE_PROFILE_REDIS".to_string(), "true".to_string()),
                    ("CATTLE_REDIS_HOSTS".to_string(), self.cfg.redis_hosts()),
                    (
                        "CATTLE_MODULE_PROFILE_ZOOKEEPER".to_string(),
                        "true".to_string(),
                    ),
                    (
                        "CATTLE_ZOOKEEPER_CONNECTION_STRING".to_string(),
                        self.cfg.zk_hosts(),
                    ),
                    ("CATTLE_DB_CATTLE_DATABASE".to_string(), "mysql".to_string()),
                    (
                        "CATTLE_DB_CATTLE_MYSQL_HOST".to_string(),
                        self.cfg.db_host.clone(),
                    ),
                    (
                        "CATTLE_DB_CATTLE_MYSQL_PORT".to_string(),
                        self.cfg.db_port.to_string(),
                    ),
                    (
                        "CATTLE_DB_CATTLE_USERNAME".to_string(),
                        self.cfg.db_user.clone(),
                    ),
                    (
                        "CATTLE_DB_CATTLE_PASSWORD".to_string(),
                        self.cfg.db_password.clone(),
                    ),
                    (
                        "CATTLE_DB_CATTLE_MYSQL_NAME".to_string(),
                        self.cfg.db_name.clone(),
                    ),
                ]),
                ..ContainerSpec::named(SERVER)
            })
            .await
    }

    async fn launch_agent(
        &mut self,
        leader: bool,
        credentials: Option<Credentials>,
    ) -> Result<()> {
        let creds = credentials
            .ok_or_else(|| Error::not_ready("waiting for server to create service API key"))?;

        let bridge = self.driver.bridge_gateway_ip().await?;
        let ping_url = format!("http://{bridge}:{SERVER_PORT}/ping");
        if !self.product.ping(&ping_url).await {
            return Err(Error::not_ready("server not available"));
        }

        let base = format!("http://{bridge}:{SERVER_PORT}/v1");
        let project = self.product.ensure_project_and_token(&creds, &base).await?;
        self.product
            .ensure_certificate(&creds, &base, &project.id)
            .await?;
        let agent_image = self.product.agent_image(&creds, &base).await?;

        let token_url = format!("{base}/scripts/{}", project.registration_token);
        self.driver
            .launch(ContainerSpec {
                image: Some(agent_image),
                privileged: true,
                networking: true,
                volumes: HashMap::from([(
                    self.cfg.docker_socket.clone(),
                    "/var/run/docker.sock".to_string(),
                )]),
                command: vec![token_url],
                env: HashMap::from([
                    ("CATTLE_SCRIPT_DEBUG".to_string(), "true".to_string()),
                    ("CATTLE_AGENT_IP".to_string(), self.cfg.cluster_ip.clone()),
                    ("CATTLE_URL_OVERRIDE".to_string(), base.clone()),
                ]),
                check_running: Some(AGENT_RUNNING_CHECK.to_string()),
                ..ContainerSpec::named(AGENT)
            })
            .await?;

        if leader && !self.launched_stack {
            self.product
                .wait_for_hosts_active(&creds, &base, self.cfg.cluster_size)
                .await?;
            self.deployer.deploy(&creds, &project.url).await?;
            self.launched_stack = true;
        }

        Ok(())
    }
}
