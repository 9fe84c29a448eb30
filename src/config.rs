use std::collections::HashMap;
use std::path::Path;

use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crypto;
use crate::runtime::{self, ContainerApi, Driver};
use crate::store::{REDIS_PORT, ZK_CLIENT_PORT};

const PORT_ENV_PREFIX: &str = "CATTLE_HA_PORT_";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Image for child containers that do not name their own.
    pub image: String,
    /// This node's ip as peers reach it.
    pub cluster_ip: String,
    /// Number of ordinal slots the cluster is sized for.
    pub cluster_size: i32,
    /// Namespace for every container this manager owns.
    pub container_prefix: String,
    pub docker_socket: String,

    pub config_path: String,
    pub cert_path: String,
    pub key_path: String,
    pub cert_chain_path: String,
    pub encryption_key_path: String,
    pub host_registration_url: String,
    pub swarm_enabled: bool,
    pub http_enabled: bool,

    pub db_host: String,
    pub db_port: i32,
    pub db_name: String,
    pub db_user: String,
    pub db_password: String,

    /// Stable identity, generated once per process invocation.
    pub uuid: String,
    /// Public port overrides by service name.
    pub ports: HashMap<String, i32>,
    /// Env shared with every child container.
    pub container_env: HashMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            image: "cattle/manager:dev".into(),
            cluster_ip: String::new(),
            cluster_size: 3,
            container_prefix: "cattle-ha-".into(),
            docker_socket: "/var/run/docker.sock".into(),
            config_path: String::new(),
            cert_path: String::new(),
            key_path: String::new(),
            cert_chain_path: String::new(),
            encryption_key_path: String::new(),
            host_registration_url: String::new(),
            swarm_enabled: false,
            http_enabled: false,
            db_host: "localhost".into(),
            db_port: 3306,
            db_name: "cattle".into(),
            db_user: "cattle".into(),
            db_password: "cattle".into(),
            uuid: Uuid::new_v4().to_string(),
            ports: HashMap::new(),
            container_env: HashMap::new(),
        }
    }
}

impl Config {
    pub async fn load(api: &dyn ContainerApi) -> anyhow::Result<Config> {
        let mut config: Config = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file("cattle-ha.toml"))
            .merge(Json::file("cattle-ha.json"))
            .merge(Env::prefixed("CATTLE_HA_"))
            .merge(Env::prefixed("CATTLE_DB_CATTLE_").map(|key| {
                match key.as_str().to_ascii_lowercase().as_str() {
                    "mysql_host" => "db_host".into(),
                    "mysql_port" => "db_port".into(),
                    "mysql_name" => "db_name".into(),
                    "username" => "db_user".into(),
                    "password" => "db_password".into(),
                    other => other.to_string().into(),
                }
            }))
            .extract()
            .map_err(|e| anyhow::anyhow!("failed to load configuration: {e}"))?;

        config.load_ports(std::env::vars())?;
        config.seed_from_own_container(api).await;
        config.validate()?;
        config.decrypt_db_password()?;

        Ok(config)
    }

    /// Map `CATTLE_HA_PORT_<SERVICE>` variables onto service names:
    /// trailing uppercase-underscore becomes lowercase-dash.
    fn load_ports(&mut self, vars: impl Iterator<Item = (String, String)>) -> anyhow::Result<()> {
        for (key, value) in vars {
            let Some(service) = key.strip_prefix(PORT_ENV_PREFIX) else {
                continue;
            };
            let service = service.to_ascii_lowercase().replace('_', "-");
            let port = value
                .parse::<i32>()
                .map_err(|_| anyhow::anyhow!("failed to read {key}={value} as an integer"))?;
            self.ports.insert(service, port);
        }
        Ok(())
    }

    /// When running inside a container, children inherit this process's
    /// image and env. The inherited env drops the path and every database
    /// credential; those are provided directly where needed and must not
    /// leak.
    async fn seed_from_own_container(&mut self, api: &dyn ContainerApi) {
        if let Some((image, env)) = Driver::self_image_and_env(api).await {
            if std::env::var_os("CATTLE_HA_IMAGE").is_none() {
                self.image = image;
            }
            self.container_env = env;
            runtime::filter_inherited_env(&mut self.container_env);
        }

        if !self.container_env.contains_key("CATTLE_HA_ENCRYPTION_KEY_PATH") {
            self.container_env.insert(
                "CATTLE_HA_ENCRYPTION_KEY_PATH".into(),
                self.encryption_key_path.clone(),
            );
        }
        self.container_env
            .insert("CATTLE_HA_CONTAINER".into(), "true".into());
    }

    fn validate(&mut self) -> anyhow::Result<()> {
        if self.cluster_size < 1 {
            anyhow::bail!("CATTLE_HA_CLUSTER_SIZE must be at least 1");
        }
        if self.cluster_size == 1 && self.cluster_ip.is_empty() {
            self.cluster_ip = "127.0.0.1".into();
        }
        if self.cluster_ip.is_empty() {
            anyhow::bail!("CATTLE_HA_CLUSTER_IP must be set");
        }
        Ok(())
    }

    /// The DB password may be AES encrypted with a key file under the config
    /// directory. No key file means the password is plain text.
    fn decrypt_db_password(&mut self) -> anyhow::Result<()> {
        if self.encryption_key_path.is_empty() {
            return Ok(());
        }
        let key_file = Path::new(&self.config_path).join(&self.encryption_key_path);
        let key = match std::fs::read_to_string(&key_file) {
            Ok(key) => key,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(anyhow::anyhow!("failed to read {key_file:?}: {e}")),
        };
        self.db_password = crypto::decrypt(&self.db_password, &key)?;
        Ok(())
    }

    /// Static zookeeper connection string: every slot's client port is a
    /// fixed local port behind the tunnels.
    pub fn zk_hosts(&self) -> String {
        (0..self.cluster_size)
            .map(|i| format!("localhost:{}", ZK_CLIENT_PORT + i))
            .collect::<Vec<_>>()
            .join(",")
    }

    pub fn redis_hosts(&self) -> String {
        (0..self.cluster_size)
            .map(|i| format!("localhost:{}", REDIS_PORT + i))
            .collect::<Vec<_>>()
            .join(",")
    }
}
