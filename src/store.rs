//! Cluster membership table.
//!
//! One MySQL table, one row per live node. The table is a coordination
//! blackboard: nodes heartbeat their own row, the leader writes index
//! assignments, and any node may delete a row it has seen go stale. No
//! cross-row atomicity is needed because the leader is the only writer of
//! `assigned_index` and the allocator tolerates repeated execution.

use std::collections::HashMap;

use log::debug;
use serde::{Deserialize, Serialize};
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions};
use sqlx::Row;

use crate::config::Config;
use crate::error::{Error, Result};

pub const SWARM: &str = "swarm";
pub const PP_HTTP: &str = "pp-http";
pub const PP_HTTPS: &str = "pp-https";
pub const HTTP: &str = "http";
pub const HTTPS: &str = "https";
pub const REDIS: &str = "redis";
pub const ZK_QUORUM: &str = "zk-quorum";
pub const ZK_LEADER: &str = "zk-leader";
pub const ZK_CLIENT: &str = "zk-client";

pub const REDIS_PORT: i32 = 6379;
pub const ZK_QUORUM_PORT: i32 = 2888;
pub const ZK_LEADER_PORT: i32 = 3888;
pub const ZK_CLIENT_PORT: i32 = 2181;
pub const SERVER_PORT: i32 = 18080;

/// Services carried over per-index tunnels.
pub const SERVICE_PORTS: &[&str] = &[REDIS, ZK_QUORUM, ZK_LEADER, ZK_CLIENT];

pub fn default_port(service: &str) -> i32 {
    match service {
        SWARM => 2376,
        PP_HTTP => 81,
        PP_HTTPS => 444,
        HTTP => 80,
        HTTPS => 443,
        REDIS => REDIS_PORT,
        ZK_QUORUM => ZK_QUORUM_PORT,
        ZK_LEADER => ZK_LEADER_PORT,
        ZK_CLIENT => ZK_CLIENT_PORT,
        _ => 0,
    }
}

pub fn lookup_port(ports: &HashMap<String, i32>, service: &str) -> i32 {
    ports
        .get(service)
        .copied()
        .unwrap_or_else(|| default_port(service))
}

/// One row of the cluster table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Member {
    pub id: i64,
    pub name: String,
    pub uuid: String,
    pub ip: String,
    pub ports: HashMap<String, i32>,
    pub requested_index: i32,
    pub assigned_index: i32,
    pub heartbeat: i64,
}

impl Member {
    pub fn port_by_service(&self, service: &str) -> i32 {
        lookup_port(&self.ports, service)
    }
}

/// Service-account credential pair read from the managed product's tables.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub access_key: String,
    pub secret_key: String,
}

#[derive(Clone)]
pub struct Store {
    pool: MySqlPool,
}

impl Store {
    pub async fn connect(cfg: &Config) -> Result<Store> {
        let opts = MySqlConnectOptions::new()
            .host(&cfg.db_host)
            .port(cfg.db_port as u16)
            .username(&cfg.db_user)
            .password(&cfg.db_password)
            .database(&cfg.db_name);
        let pool = MySqlPoolOptions::new()
            .max_connections(4)
            .connect_with(opts)
            .await?;
        Ok(Store { pool })
    }

    /// Create the cluster table when it does not exist yet. Idempotent.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS `cluster` (\
             `id` bigint(20) NOT NULL AUTO_INCREMENT,\
             `name` varchar(256) DEFAULT NULL,\
             `heartbeat` bigint(20) DEFAULT 0 NOT NULL,\
             `uuid` varchar(128) NOT NULL,\
             `ip_address` varchar(128) NOT NULL,\
             `requested_index` int(11) NOT NULL,\
             `assigned_index` int(11) DEFAULT 0 NOT NULL,\
             `ports` varchar(1024),\
             PRIMARY KEY (id)\
             ) ENGINE=InnoDB DEFAULT CHARSET=utf8;",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Bump the heartbeat for an existing row, or insert the row on first
    /// contact. `requested_index` is written only here, at first insert.
    pub async fn checkin(&self, member: &Member, heartbeat: i64) -> Result<()> {
        let updated = sqlx::query("UPDATE cluster SET heartbeat = ? WHERE uuid = ?")
            .bind(heartbeat)
            .bind(&member.uuid)
            .execute(&self.pool)
            .await?
            .rows_affected();

        if updated == 0 {
            debug!("first checkin for {}", member.uuid);
            sqlx::query(
                "INSERT INTO cluster(name, uuid, ip_address, requested_index) \
                 VALUES (?, ?, ?, ?)",
            )
            .bind(&member.name)
            .bind(&member.uuid)
            .bind(&member.ip)
            .bind(member.requested_index)
            .execute(&self.pool)
            .await?;
        }

        Ok(())
    }

    /// All rows, ordered by id ascending.
    pub async fn members(&self) -> Result<Vec<Member>> {
        let rows = sqlx::query(
            "SELECT id, name, heartbeat, uuid, assigned_index, requested_index, \
             ports, ip_address FROM cluster ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut result = Vec::with_capacity(rows.len());
        for row in rows {
            result.push(Member {
                id: row.try_get("id")?,
                name: row.try_get::<Option<String>, _>("name")?.unwrap_or_default(),
                heartbeat: row.try_get("heartbeat")?,
                uuid: row.try_get("uuid")?,
                assigned_index: row.try_get("assigned_index")?,
                requested_index: row.try_get("requested_index")?,
                ports: parse_ports(row.try_get::<Option<String>, _>("ports")?)?,
                ip: row.try_get("ip_address")?,
            });
        }
        Ok(result)
    }

    /// Remove a member row. A missing uuid is not an error.
    pub async fn delete(&self, uuid: &str) -> Result<()> {
        sqlx::query("DELETE FROM cluster WHERE uuid = ?")
            .bind(uuid)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Persist index assignments and clear the corresponding requests. Each
    /// row update is atomic on its own; a partial batch surfaces as a store
    /// error and the allocator re-runs next tick.
    pub async fn save_index(&self, by_index: &HashMap<i32, Member>) -> Result<()> {
        for (index, member) in by_index {
            sqlx::query(
                "UPDATE cluster SET assigned_index = ?, requested_index = ? WHERE id = ?",
            )
            .bind(index)
            .bind(0)
            .bind(member.id)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    /// Service-account API keys written by the managed server once it is up.
    pub async fn api_credentials(&self) -> Result<Credentials> {
        let row = sqlx::query(
            "SELECT public_value, secret_value FROM credential c \
             JOIN account a ON (c.account_id = a.id) \
             WHERE c.state = ? AND a.state = ? AND a.uuid = ?",
        )
        .bind("active")
        .bind("active")
        .bind("machineServiceAccount")
        .fetch_optional(&self.pool)
        .await?;

        let row = row.ok_or_else(|| Error::not_ready("waiting for service account API keys"))?;
        let access_key: Option<String> = row.try_get("public_value")?;
        let secret_key: Option<String> = row.try_get("secret_value")?;
        match (access_key, secret_key) {
            (Some(a), Some(s)) if !a.is_empty() && !s.is_empty() => Ok(Credentials {
                access_key: a,
                secret_key: s,
            }),
            _ => Err(Error::not_ready("waiting for service account API keys")),
        }
    }
}

fn parse_ports(raw: Option<String>) -> Result<HashMap<String, i32>> {
    match raw {
        Some(s) if !s.is_empty() => Ok(serde_json::from_str(&s)?),
        _ => Ok(HashMap::new()),
    }
}
