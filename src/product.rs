//! Thin adapter over the managed product's REST API, plus the stack
//! deployer. The manager only needs a handful of operations from the
//! product: a liveness ping, the HA project and its registration token, the
//! load-balancer certificate, the agent image setting, and the active host
//! count. Anything richer belongs to the product's own client.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::info;
use serde_json::{json, Value};
use tokio::process::Command;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::store::Credentials;

/// Handle on the HA project once it exists.
#[derive(Debug, Clone)]
pub struct ProjectAccess {
    pub id: String,
    /// API URL scoped to the project, handed to the stack deployer.
    pub url: String,
    pub registration_token: String,
}

#[async_trait]
pub trait ProductApi: Send + Sync {
    /// Whether the server at `url` answers its health ping.
    async fn ping(&self, url: &str) -> bool;

    /// Find or create the HA project and its registration token. Fails with
    /// NotReady while the server has HA disabled or the token is still
    /// transitioning.
    async fn ensure_project_and_token(
        &self,
        creds: &Credentials,
        base: &str,
    ) -> Result<ProjectAccess>;

    /// Reuse the load-balancer certificate when the server has one, else
    /// upload the PEM material from the configured paths.
    async fn ensure_certificate(
        &self,
        creds: &Credentials,
        base: &str,
        project_id: &str,
    ) -> Result<()>;

    /// The agent image the server expects its hosts to run.
    async fn agent_image(&self, creds: &Credentials, base: &str) -> Result<String>;

    /// Block until `count` hosts are active, bounded.
    async fn wait_for_hosts_active(
        &self,
        creds: &Credentials,
        base: &str,
        count: i32,
    ) -> Result<()>;
}

#[async_trait]
pub trait StackDeployer: Send + Sync {
    async fn deploy(&self, creds: &Credentials, project_url: &str) -> Result<()>;
}

const PROJECT_UUID_BASE: &str = "system-ha-";
const SYSTEM_SSL: &str = "system-ssl";
const AGENT_IMAGE_SETTING: &str = "bootstrap.required.image";

pub struct HttpProductApi {
    cfg: Arc<Config>,
    client: reqwest::Client,
}

impl HttpProductApi {
    pub fn new(cfg: Arc<Config>) -> Self {
        HttpProductApi {
            cfg,
            client: reqwest::Client::new(),
        }
    }

    async fn get(&self, creds: &Credentials, url: &str) -> Result<Value> {
        let value = self
            .client
            .get(url)
            .basic_auth(&creds.access_key, Some(&creds.secret_key))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(value)
    }

    async fn post(&self, creds: &Credentials, url: &str, body: Value) -> Result<Value> {
        let value = self
            .client
            .post(url)
            .basic_auth(&creds.access_key, Some(&creds.secret_key))
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(value)
    }

    async fn find_project(&self, creds: &Credentials, base: &str) -> Result<Option<Value>> {
        let url = format!(
            "{base}/projects?uuid_like={PROJECT_UUID_BASE}%25&removed_null=true"
        );
        let listing = self.get(creds, &url).await?;
        Ok(first_of(&listing).cloned())
    }

    async fn find_or_create_project(&self, creds: &Credentials, base: &str) -> Result<Value> {
        if let Some(project) = self.find_project(creds, base).await? {
            return Ok(project);
        }

        let uuid = format!("{PROJECT_UUID_BASE}{}", uuid::Uuid::new_v4().simple());
        info!("creating HA project {uuid}");
        self.post(
            creds,
            &format!("{base}/projects"),
            json!({
                "uuid": uuid,
                "name": "System HA",
                "description": "Management components",
                "allowSystemRole": true,
            }),
        )
        .await
    }

    async fn find_or_create_token(
        &self,
        creds: &Credentials,
        base: &str,
        project_id: &str,
    ) -> Result<String> {
        let url = format!(
            "{base}/registrationtokens?accountId={project_id}&removed_null=1"
        );
        let listing = self.get(creds, &url).await?;
        let mut token = match first_of(&listing) {
            Some(token) => token.clone(),
            None => {
                self.post(
                    creds,
                    &format!("{base}/registrationtokens"),
                    json!({ "accountId": project_id }),
                )
                .await?
            }
        };

        // Freshly created tokens transition through activation.
        for _ in 0..40 {
            if str_field(&token, "transitioning") != "yes" {
                break;
            }
            tokio::time::sleep(Duration::from_millis(150)).await;
            let id = str_field(&token, "id");
            token = self
                .get(creds, &format!("{base}/registrationtokens/{id}"))
                .await?;
        }

        if str_field(&token, "state") != "active" {
            return Err(Error::not_ready(format!(
                "registration token is not active, in state [{}]",
                str_field(&token, "state")
            )));
        }
        Ok(str_field(&token, "token"))
    }
}

#[async_trait]
impl ProductApi for HttpProductApi {
    async fn ping(&self, url: &str) -> bool {
        match self.client.get(url).send().await {
            Ok(resp) => matches!(resp.text().await, Ok(body) if body.trim() == "pong"),
            Err(_) => false,
        }
    }

    async fn ensure_project_and_token(
        &self,
        creds: &Credentials,
        base: &str,
    ) -> Result<ProjectAccess> {
        let setting = self
            .get(creds, &format!("{base}/settings/ha.enabled"))
            .await?;
        if str_field(&setting, "activeValue") != "true" {
            return Err(Error::not_ready(format!(
                "HA is not enabled, ha.enabled={}",
                str_field(&setting, "activeValue")
            )));
        }

        let project = self.find_or_create_project(creds, base).await?;
        let project_id = str_field(&project, "id");
        let registration_token = self
            .find_or_create_token(creds, base, &project_id)
            .await?;

        Ok(ProjectAccess {
            url: format!("{base}/projects/{project_id}/schemas"),
            id: project_id,
            registration_token,
        })
    }

    async fn ensure_certificate(
        &self,
        creds: &Credentials,
        base: &str,
        project_id: &str,
    ) -> Result<()> {
        let url = format!(
            "{base}/certificates?name={SYSTEM_SSL}&accountId={project_id}&removed_null=1"
        );
        let listing = self.get(creds, &url).await?;
        if let Some(cert) = first_of(&listing) {
            return save_chain(&self.cfg, &str_field(cert, "certChain"));
        }

        // No certificate on the server yet; upload the provided material.
        // Generating TLS material is a separate concern handled outside the
        // manager.
        let read = |rel: &str| -> Result<String> {
            let path = Path::new(&self.cfg.config_path).join(rel);
            std::fs::read_to_string(&path).map_err(|_| {
                Error::not_ready(format!("certificate material not present at {path:?}"))
            })
        };
        let cert = read(&self.cfg.cert_path)?;
        let key = read(&self.cfg.key_path)?;
        let chain = read(&self.cfg.cert_chain_path)?;

        info!("uploading {SYSTEM_SSL} certificate");
        self.post(
            creds,
            &format!("{base}/certificates"),
            json!({
                "accountId": project_id,
                "name": SYSTEM_SSL,
                "description": "Certificate used for main load balancer",
                "cert": cert,
                "key": key,
                "certChain": chain,
            }),
        )
        .await?;
        save_chain(&self.cfg, &chain)
    }

    async fn agent_image(&self, creds: &Credentials, base: &str) -> Result<String> {
        let url = format!("{base}/settings?name={AGENT_IMAGE_SETTING}");
        let listing = self.get(creds, &url).await?;
        let image = data_of(&listing)
            .iter()
            .find(|s| str_field(s, "name") == AGENT_IMAGE_SETTING)
            .map(|s| str_field(s, "activeValue"))
            .unwrap_or_default();
        if image.is_empty() {
            return Err(Error::other(format!(
                "failed to find setting {AGENT_IMAGE_SETTING} to determine agent image"
            )));
        }
        Ok(image)
    }

    async fn wait_for_hosts_active(
        &self,
        creds: &Credentials,
        base: &str,
        count: i32,
    ) -> Result<()> {
        let url = format!("{base}/hosts?state=active");
        for _ in 0..30 {
            let listing = self.get(creds, &url).await?;
            if data_of(&listing).len() >= count as usize {
                return Ok(());
            }
            info!("waiting for {count} host(s) to be active");
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
        Err(Error::not_ready(format!(
            "timeout waiting for {count} host(s) to be active"
        )))
    }
}

/// Persist the certificate chain under the config directory so the managed
/// containers can trust it; append when the file exists without it.
fn save_chain(cfg: &Config, chain: &str) -> Result<()> {
    if chain.is_empty() || cfg.cert_chain_path.is_empty() {
        return Ok(());
    }
    std::fs::create_dir_all(&cfg.config_path)?;
    let path = Path::new(&cfg.config_path).join(&cfg.cert_chain_path);
    match std::fs::read_to_string(&path) {
        Err(_) => Ok(std::fs::write(&path, chain)?),
        Ok(existing) if existing.contains(chain) => Ok(()),
        Ok(mut existing) => {
            existing.push('\n');
            existing.push_str(chain);
            Ok(std::fs::write(&path, existing)?)
        }
    }
}

fn data_of(listing: &Value) -> Vec<Value> {
    listing
        .get("data")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

fn first_of(listing: &Value) -> Option<&Value> {
    listing.get("data").and_then(Value::as_array)?.first()
}

fn str_field(value: &Value, field: &str) -> String {
    value
        .get(field)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// Deploys the management stack by shelling out to the compose binary with a
/// clean environment. Invoked once per leader process lifetime.
pub struct ComposeDeployer {
    cfg: Arc<Config>,
}

impl ComposeDeployer {
    pub fn new(cfg: Arc<Config>) -> Self {
        ComposeDeployer { cfg }
    }
}

#[async_trait]
impl StackDeployer for ComposeDeployer {
    async fn deploy(&self, creds: &Credentials, project_url: &str) -> Result<()> {
        info!("deploying management stack");
        let status = Command::new("cattle-compose")
            .args([
                "-p",
                "management",
                "-f",
                "compose/docker-compose.yml",
                "up",
                "-d",
                "-u",
                "-c",
            ])
            .env_clear()
            .env("CATTLE_URL", project_url)
            .env("CATTLE_ACCESS_KEY", &creds.access_key)
            .env("CATTLE_SECRET_KEY", &creds.secret_key)
            .env("HA_IMAGE", &self.cfg.image)
            .env("SWARM_ENABLED", self.cfg.swarm_enabled.to_string())
            .env("HTTP_ENABLED", self.cfg.http_enabled.to_string())
            .env(
                "HOST_REGISTRATION_URL",
                &self.cfg.host_registration_url,
            )
            .status()
            .await?;

        if !status.success() {
            return Err(Error::other(format!(
                "stack deployment exited with {status}"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listing_helpers_tolerate_shapes() {
        let listing = json!({ "data": [ { "id": "1a", "state": "active" } ] });
        assert_eq!(data_of(&listing).len(), 1);
        assert_eq!(str_field(first_of(&listing).unwrap(), "id"), "1a");

        let empty = json!({ "data": [] });
        assert!(first_of(&empty).is_none());
        assert!(first_of(&json!({})).is_none());
        assert_eq!(str_field(&json!({}), "missing"), "");
    }
}
