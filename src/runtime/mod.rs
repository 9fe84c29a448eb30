use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use async_trait::async_trait;
use log::info;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::store::{lookup_port, SERVER_PORT, SERVICE_PORTS};

pub mod docker;
pub use docker::DockerApi;

#[cfg(test)]
pub mod fake;

/// Mount point for the shared config directory inside every child.
pub const CONFIG_DIR_DEST: &str = "/var/lib/cattle/etc";

/// Label present on every container this manager owns.
pub const OWNED_LABEL: &str = "io.cattle.ha.container";
/// Label naming the service a container implements.
pub const SERVICE_LABEL: &str = "io.cattle.ha.service.name";
/// Label carried by tunnel containers, naming their (service, slot) pair.
pub const TUNNEL_LABEL: &str = "io.cattle.ha.service.tunnel";
/// Label telling the network plugin to wire the parent.
pub const NETWORK_LABEL: &str = "io.cattle.container.network";

pub const PARENT: &str = "parent";

/// What the daemon reports about an existing container.
#[derive(Debug, Clone, Default)]
pub struct ContainerDetail {
    pub id: String,
    pub image: String,
    pub command: Vec<String>,
    /// KEY=VALUE pairs as the daemon stores them.
    pub env: Vec<String>,
    pub running: bool,
    pub restarting: bool,
}

/// Host-port binding in neutral form.
#[derive(Debug, Clone, PartialEq)]
pub struct PortBinding {
    pub host_ip: String,
    pub host_port: i32,
    pub container_port: i32,
}

/// Everything needed to create a container, already resolved.
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    pub image: String,
    pub command: Vec<String>,
    pub env: Vec<String>,
    pub labels: HashMap<String, String>,
    pub open_stdin: bool,
    pub privileged: bool,
    pub restart_always: bool,
    pub network_mode: Option<String>,
    pub port_bindings: Vec<PortBinding>,
    pub binds: Vec<String>,
    pub tmpfs: HashMap<String, String>,
}

/// The capability set the manager needs from a container daemon. Implemented
/// by the production client and by an in-memory fake for tests.
#[async_trait]
pub trait ContainerApi: Send + Sync {
    /// Inspect by name or id; a missing container is `None`, not an error.
    async fn inspect(&self, name: &str) -> Result<Option<ContainerDetail>>;
    /// Create and return the new container id. A missing image surfaces as
    /// [`Error::ImageMissing`].
    async fn create(&self, name: &str, opts: CreateOptions) -> Result<String>;
    async fn start(&self, id: &str) -> Result<()>;
    /// Force-remove with volumes; removing a missing container succeeds.
    async fn remove(&self, id: &str) -> Result<()>;
    async fn list_by_label(&self, labels: &HashMap<String, String>) -> Result<Vec<String>>;
    async fn pull_image(&self, image: &str) -> Result<()>;
    /// CIDR subnet of the default bridge network.
    async fn bridge_subnet(&self) -> Result<String>;
    /// The daemon's node name.
    async fn node_name(&self) -> Result<String>;
}

/// Desired shape of one managed container.
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    pub name: String,
    /// Falls back to the manager's own image when absent.
    pub image: Option<String>,
    pub command: Vec<String>,
    pub env: HashMap<String, String>,
    pub labels: HashMap<String, String>,
    /// Containers matching these labels are swept before creation.
    pub delete_labeled: HashMap<String, String>,
    /// True for containers with their own network namespace; everything else
    /// joins the parent's.
    pub networking: bool,
    /// Binding strings: `host:container/tcp` or `hostip:host:container/tcp`.
    /// A `BRIDGE` host ip resolves to the bridge gateway.
    pub ports: Vec<String>,
    pub restart_always: bool,
    pub open_stdin: bool,
    pub privileged: bool,
    pub volumes: HashMap<String, String>,
    /// Skip creation entirely when this (unprefixed) container already runs.
    pub check_running: Option<String>,
}

impl ContainerSpec {
    pub fn named(name: &str) -> Self {
        ContainerSpec {
            name: name.to_string(),
            ..ContainerSpec::default()
        }
    }
}

/// Idempotent launcher on top of a [`ContainerApi`].
#[derive(Clone)]
pub struct Driver {
    api: Arc<dyn ContainerApi>,
    prefix: String,
    image: String,
    config_dir: String,
    default_env: HashMap<String, String>,
    ports: HashMap<String, i32>,
}

impl Driver {
    pub fn new(api: Arc<dyn ContainerApi>, cfg: &Config) -> Self {
        Driver {
            api,
            prefix: cfg.container_prefix.clone(),
            image: cfg.image.clone(),
            config_dir: cfg.config_path.clone(),
            default_env: cfg.container_env.clone(),
            ports: cfg.ports.clone(),
        }
    }

    pub fn api(&self) -> &Arc<dyn ContainerApi> {
        &self.api
    }

    pub fn prefixed(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    /// Ensure a container exists, runs, and matches the spec. Containers that
    /// share the parent's network namespace get the parent ensured first.
    pub async fn launch(&self, spec: ContainerSpec) -> Result<()> {
        if !spec.networking {
            self.ensure(self.parent_spec()).await?;
        }
        self.ensure(spec).await
    }

    /// Remove by unprefixed name, force, with volumes. Not-found is success.
    pub async fn delete(&self, name: &str) -> Result<()> {
        self.api.remove(&self.prefixed(name)).await
    }

    /// Gateway of the default bridge network: its subnet's network address
    /// plus one.
    pub async fn bridge_gateway_ip(&self) -> Result<Ipv4Addr> {
        let subnet = self.api.bridge_subnet().await?;
        bridge_gateway(&subnet)
    }

    pub async fn node_name(&self) -> Result<String> {
        self.api.node_name().await
    }

    async fn ensure(&self, spec: ContainerSpec) -> Result<()> {
        let name = self.prefixed(&spec.name);

        if let Some(existing) = self.api.inspect(&name).await? {
            if !needs_recreate(&spec, &existing) {
                return Ok(());
            }
            info!("deleting container {}", existing.id);
            self.api.remove(&existing.id).await?;
        }

        if !spec.delete_labeled.is_empty() {
            for id in self.api.list_by_label(&spec.delete_labeled).await? {
                info!("deleting container {id}");
                self.api.remove(&id).await?;
            }
        }

        if let Some(reference) = &spec.check_running {
            if let Some(check) = self.api.inspect(reference).await? {
                if check.running && !check.restarting {
                    return Ok(());
                }
            }
        }

        let opts = self.build_options(&spec).await?;
        let image = opts.image.clone();

        info!("creating container {name}");
        let id = match self.api.create(&name, opts.clone()).await {
            Ok(id) => id,
            Err(Error::ImageMissing(_)) => {
                info!("pulling image {image}");
                self.api.pull_image(&image).await?;
                self.api.create(&name, opts).await?
            }
            Err(e) => return Err(e),
        };

        self.api.start(&id).await
    }

    async fn build_options(&self, spec: &ContainerSpec) -> Result<CreateOptions> {
        let mut labels = HashMap::from([
            (OWNED_LABEL.to_string(), "true".to_string()),
            (SERVICE_LABEL.to_string(), spec.name.clone()),
        ]);
        labels.extend(spec.labels.clone());

        let mut volumes = spec.volumes.clone();
        if !self.config_dir.is_empty() {
            volumes.insert(self.config_dir.clone(), CONFIG_DIR_DEST.to_string());
        }

        let mut opts = CreateOptions {
            image: spec.image.clone().unwrap_or_else(|| self.image.clone()),
            command: spec.command.clone(),
            env: to_env(&[&self.default_env, &spec.env]),
            labels,
            open_stdin: spec.open_stdin,
            privileged: spec.privileged,
            restart_always: spec.restart_always,
            network_mode: None,
            port_bindings: Vec::new(),
            binds: volumes
                .iter()
                .map(|(host, dest)| format!("{host}:{dest}"))
                .collect(),
            tmpfs: HashMap::from([
                ("/var/lib/zookeeper".to_string(), "mode=0777".to_string()),
                ("/key".to_string(), "mode=0777".to_string()),
            ]),
        };

        if spec.networking {
            for port in &spec.ports {
                opts.port_bindings.push(self.parse_port(port).await?);
            }
        } else {
            opts.network_mode = Some(format!("container:{}", self.prefixed(PARENT)));
        }

        Ok(opts)
    }

    async fn parse_port(&self, spec: &str) -> Result<PortBinding> {
        let spec = spec.strip_suffix("/tcp").unwrap_or(spec);
        let parts: Vec<&str> = spec.split(':').collect();
        let parse = |s: &str| {
            s.parse::<i32>()
                .map_err(|_| Error::other(format!("bad port binding {spec}")))
        };
        match parts.as_slice() {
            [host, container] => Ok(PortBinding {
                host_ip: "0.0.0.0".to_string(),
                host_port: parse(host)?,
                container_port: parse(container)?,
            }),
            [ip, host, container] => {
                let host_ip = if *ip == "BRIDGE" {
                    self.bridge_gateway_ip().await?.to_string()
                } else {
                    (*ip).to_string()
                };
                Ok(PortBinding {
                    host_ip,
                    host_port: parse(host)?,
                    container_port: parse(container)?,
                })
            }
            _ => Err(Error::other(format!("bad port binding {spec}"))),
        }
    }

    /// The one container per node that owns the shared network namespace and
    /// publishes the managed product's ports on the host. Creating it anew
    /// invalidates every container attached to its namespace, so the create
    /// path sweeps all owned containers, stale tunnels included.
    pub fn parent_spec(&self) -> ContainerSpec {
        let mut ports = vec![format!("{SERVER_PORT}:8080/tcp")];
        for service in SERVICE_PORTS {
            let public = lookup_port(&self.ports, service);
            ports.push(format!("{}:{}/tcp", public, public + 10000));
        }

        ContainerSpec {
            name: PARENT.to_string(),
            command: vec![PARENT.to_string()],
            networking: true,
            ports,
            labels: HashMap::from([(NETWORK_LABEL.to_string(), "true".to_string())]),
            delete_labeled: HashMap::from([(OWNED_LABEL.to_string(), "true".to_string())]),
            open_stdin: true,
            restart_always: true,
            ..ContainerSpec::default()
        }
    }

    /// Image and env of the container this process runs in, when it runs in
    /// one. Children inherit both.
    pub async fn self_image_and_env(
        api: &dyn ContainerApi,
    ) -> Option<(String, HashMap<String, String>)> {
        let cgroup = std::fs::read_to_string("/proc/self/cgroup").ok()?;
        let id = container_id_from_cgroup(&cgroup)?;
        let detail = api.inspect(&id).await.ok()??;
        Some((detail.image, parse_env(&detail.env)))
    }
}

fn bridge_gateway(subnet: &str) -> Result<Ipv4Addr> {
    let network = subnet
        .split('/')
        .next()
        .and_then(|s| s.parse::<Ipv4Addr>().ok())
        .ok_or_else(|| Error::other(format!("bad bridge subnet {subnet}")))?;
    Ok(Ipv4Addr::from(u32::from(network) + 1))
}

/// Whether a running container no longer matches its spec: command drift, a
/// missing or changed env pair, or a non-running state all force a
/// delete-and-recreate.
fn needs_recreate(spec: &ContainerSpec, existing: &ContainerDetail) -> bool {
    let mut changed = false;

    if existing.command != spec.command {
        info!(
            "container {} command is different {:?} != {:?}",
            spec.name, existing.command, spec.command
        );
        changed = true;
    }

    for (key, value) in &spec.env {
        let pair = format!("{key}={value}");
        if !existing.env.iter().any(|e| *e == pair) {
            info!("container {} is missing env {pair}", spec.name);
            changed = true;
        }
    }

    if !existing.running || existing.restarting {
        info!("container {} is not running", spec.name);
        changed = true;
    }

    changed
}

/// Merge env maps into the daemon's KEY=VALUE form, later maps winning.
pub fn to_env(maps: &[&HashMap<String, String>]) -> Vec<String> {
    let mut merged: HashMap<&str, &str> = HashMap::new();
    for map in maps {
        for (k, v) in map.iter() {
            merged.insert(k.as_str(), v.as_str());
        }
    }
    let mut env: Vec<String> = merged.iter().map(|(k, v)| format!("{k}={v}")).collect();
    env.sort();
    env
}

pub fn parse_env(env: &[String]) -> HashMap<String, String> {
    env.iter()
        .map(|entry| match entry.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (entry.clone(), String::new()),
        })
        .collect()
}

/// Strip the inherited env of the path and of database credentials before it
/// flows into children.
pub fn filter_inherited_env(env: &mut HashMap<String, String>) {
    env.retain(|key, _| key != "PATH" && !key.contains("CATTLE_DB"));
}

/// Container id of this process, from the cgroup file. Handles both the
/// plain `.../docker/<id>` and the systemd `docker-<id>.scope` layouts.
pub fn container_id_from_cgroup(contents: &str) -> Option<String> {
    for line in contents.lines() {
        if let Some((_, rest)) = line.rsplit_once("docker/") {
            let id: String = rest
                .chars()
                .take_while(|c| c.is_ascii_alphanumeric())
                .collect();
            if !id.is_empty() {
                return Some(id);
            }
        }
        if let Some(start) = line.find("docker-") {
            if let Some(end) = line[start..].find(".scope") {
                let id = &line[start + "docker-".len()..start + end];
                if !id.is_empty() && id.chars().all(|c| c.is_ascii_alphanumeric()) {
                    return Some(id.to_string());
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::fake::FakeApi;
    use super::*;
    use crate::config::Config;

    fn test_config() -> Config {
        let mut cfg = Config::default();
        cfg.container_prefix = "test-ha-".to_string();
        cfg.image = "cattle/manager:test".to_string();
        cfg.cluster_size = 3;
        cfg.container_env
            .insert("CATTLE_HA_CONTAINER".to_string(), "true".to_string());
        cfg
    }

    fn driver(api: Arc<FakeApi>) -> Driver {
        Driver::new(api, &test_config())
    }

    fn simple_spec(name: &str) -> ContainerSpec {
        ContainerSpec {
            command: vec![name.to_string()],
            ..ContainerSpec::named(name)
        }
    }

    #[tokio::test]
    async fn launch_ensures_parent_first() {
        let api = Arc::new(FakeApi::default());
        driver(api.clone()).launch(simple_spec("zk")).await.unwrap();

        assert!(api.container("test-ha-parent").is_some());
        let zk = api.container("test-ha-zk").unwrap();
        assert_eq!(
            zk.opts.network_mode.as_deref(),
            Some("container:test-ha-parent")
        );
        assert!(zk.running);
    }

    #[tokio::test]
    async fn matching_container_is_left_alone() {
        let api = Arc::new(FakeApi::default());
        let d = driver(api.clone());
        d.launch(simple_spec("zk")).await.unwrap();
        let creates = api.create_count();

        d.launch(simple_spec("zk")).await.unwrap();
        assert_eq!(api.create_count(), creates);
        assert_eq!(api.remove_count(), 0);
    }

    #[tokio::test]
    async fn added_env_forces_recreate() {
        let api = Arc::new(FakeApi::default());
        let d = driver(api.clone());
        d.launch(simple_spec("zk")).await.unwrap();

        let mut spec = simple_spec("zk");
        spec.env.insert("INDEX".to_string(), "2".to_string());
        d.launch(spec).await.unwrap();

        assert_eq!(api.remove_count(), 1);
        let zk = api.container("test-ha-zk").unwrap();
        assert!(zk.opts.env.contains(&"INDEX=2".to_string()));
    }

    #[tokio::test]
    async fn command_drift_forces_recreate() {
        let api = Arc::new(FakeApi::default());
        let d = driver(api.clone());
        d.launch(simple_spec("zk")).await.unwrap();

        let mut spec = simple_spec("zk");
        spec.command = vec!["zk".to_string(), "--verbose".to_string()];
        d.launch(spec).await.unwrap();
        assert_eq!(api.remove_count(), 1);
    }

    #[tokio::test]
    async fn stopped_container_is_recreated() {
        let api = Arc::new(FakeApi::default());
        let d = driver(api.clone());
        d.launch(simple_spec("zk")).await.unwrap();

        api.stop("test-ha-zk");
        d.launch(simple_spec("zk")).await.unwrap();
        assert_eq!(api.remove_count(), 1);
        assert!(api.container("test-ha-zk").unwrap().running);
    }

    #[tokio::test]
    async fn fresh_parent_sweeps_owned_containers() {
        let api = Arc::new(FakeApi::default());
        api.seed(
            "test-ha-tunnel-redis-2",
            CreateOptions {
                labels: HashMap::from([
                    (OWNED_LABEL.to_string(), "true".to_string()),
                    (TUNNEL_LABEL.to_string(), "redis-2".to_string()),
                ]),
                ..CreateOptions::default()
            },
        );
        api.seed("bystander", CreateOptions::default());

        let d = driver(api.clone());
        d.launch(d.parent_spec()).await.unwrap();

        assert!(api.container("test-ha-tunnel-redis-2").is_none());
        assert!(api.container("bystander").is_some());
        assert!(api.container("test-ha-parent").is_some());
    }

    #[tokio::test]
    async fn check_running_skips_creation() {
        let api = Arc::new(FakeApi::default());
        api.seed("cattle-agent", CreateOptions::default());

        let d = driver(api.clone());
        let mut spec = simple_spec("agent");
        spec.networking = true;
        spec.check_running = Some("cattle-agent".to_string());
        d.launch(spec).await.unwrap();

        assert!(api.container("test-ha-agent").is_none());
    }

    #[tokio::test]
    async fn missing_image_is_pulled_then_retried() {
        let api = Arc::new(FakeApi::default());
        api.mark_image_missing("cattle/manager:test");

        let mut spec = simple_spec("zk");
        spec.networking = true; // keep the parent out of the way
        driver(api.clone()).launch(spec).await.unwrap();

        assert_eq!(api.pulled(), vec!["cattle/manager:test".to_string()]);
        assert!(api.container("test-ha-zk").unwrap().running);
    }

    #[tokio::test]
    async fn parent_publishes_service_ports() {
        let api = Arc::new(FakeApi::default());
        let d = driver(api.clone());
        d.launch(simple_spec("zk")).await.unwrap();

        let parent = api.container("test-ha-parent").unwrap();
        assert!(parent.opts.port_bindings.contains(&PortBinding {
            host_ip: "0.0.0.0".to_string(),
            host_port: 18080,
            container_port: 8080,
        }));
        assert!(parent.opts.port_bindings.contains(&PortBinding {
            host_ip: "0.0.0.0".to_string(),
            host_port: 2181,
            container_port: 12181,
        }));
    }

    #[tokio::test]
    async fn bridge_gateway_is_network_plus_one() {
        let api = Arc::new(FakeApi::default());
        let ip = driver(api).bridge_gateway_ip().await.unwrap();
        assert_eq!(ip, Ipv4Addr::new(172, 17, 0, 1));
        assert_eq!(
            bridge_gateway("10.42.0.0/16").unwrap(),
            Ipv4Addr::new(10, 42, 0, 1)
        );
        assert!(bridge_gateway("garbage").is_err());
    }

    #[test]
    fn env_round_trip_and_merge() {
        let base = HashMap::from([("A".to_string(), "1".to_string())]);
        let extra = HashMap::from([
            ("A".to_string(), "2".to_string()),
            ("B".to_string(), "3".to_string()),
        ]);
        let env = to_env(&[&base, &extra]);
        assert_eq!(env, vec!["A=2".to_string(), "B=3".to_string()]);

        let parsed = parse_env(&env);
        assert_eq!(parsed["A"], "2");
        assert_eq!(parse_env(&["NOVALUE".to_string()])["NOVALUE"], "");
    }

    #[test]
    fn inherited_env_is_scrubbed() {
        let mut env = HashMap::from([
            ("PATH".to_string(), "/usr/bin".to_string()),
            ("CATTLE_DB_CATTLE_PASSWORD".to_string(), "secret".to_string()),
            ("CATTLE_HA_CLUSTER_SIZE".to_string(), "3".to_string()),
        ]);
        filter_inherited_env(&mut env);
        assert_eq!(env.len(), 1);
        assert!(env.contains_key("CATTLE_HA_CLUSTER_SIZE"));
    }

    #[test]
    fn container_id_from_both_cgroup_layouts() {
        let plain = "12:pids:/docker/0123abcd0123abcd\n";
        assert_eq!(
            container_id_from_cgroup(plain).as_deref(),
            Some("0123abcd0123abcd")
        );

        let systemd = "0::/system.slice/docker-deadbeef1234.scope\n";
        assert_eq!(
            container_id_from_cgroup(systemd).as_deref(),
            Some("deadbeef1234")
        );

        assert_eq!(container_id_from_cgroup("0::/init.scope\n"), None);
    }
}
