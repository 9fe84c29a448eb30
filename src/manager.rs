//! The reconciliation core.
//!
//! Two independent tasks per node: the reconciler loop and the heartbeat
//! loop. They share no in-memory state; the store is the only coordination
//! point. A failed heartbeat ends the process on purpose so peers prune this
//! node instead of trusting a half-alive one.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use log::{error, info, warn};
use tokio::time;

use crate::alloc;
use crate::config::Config;
use crate::elect;
use crate::error::{Error, Result};
use crate::product::{ComposeDeployer, HttpProductApi};
use crate::runtime::{parse_env, Driver, PARENT};
use crate::service::ClusterService;
use crate::store::{Member, Store};
use crate::view::SupervisorView;

const INTERVAL: Duration = Duration::from_secs(5);
const MAX_MISSED: u32 = 2;

pub struct Manager {
    me: Member,
    cfg: Arc<Config>,
    store: Store,
    services: ClusterService,
}

impl Manager {
    pub async fn new(cfg: Arc<Config>, store: Store, driver: Driver) -> anyhow::Result<Manager> {
        let name = driver
            .node_name()
            .await
            .context("failed to read the daemon node name")?;
        let requested_index = requested_index(&driver).await?;
        if requested_index > 0 {
            info!("requesting previous index {requested_index}");
        }

        let me = Member {
            name,
            uuid: cfg.uuid.clone(),
            ip: cfg.cluster_ip.clone(),
            ports: cfg.ports.clone(),
            requested_index,
            ..Member::default()
        };

        let product = Arc::new(HttpProductApi::new(cfg.clone()));
        let deployer = Arc::new(ComposeDeployer::new(cfg.clone()));
        let services = ClusterService::new(cfg.clone(), driver, product, deployer);

        Ok(Manager {
            me,
            cfg,
            store,
            services,
        })
    }

    pub async fn start(mut self) -> anyhow::Result<()> {
        self.store
            .checkin(&self.me, 0)
            .await
            .context("failed to do cluster check in")?;

        let mut heartbeat = tokio::spawn(heartbeat_loop(self.store.clone(), self.me.clone()));

        tokio::select! {
            err = &mut heartbeat => match err {
                Ok(e) => Err(anyhow::Error::new(e).context("failed to update heartbeat")),
                Err(e) => Err(anyhow::anyhow!("heartbeat task died: {e}")),
            },
            res = self.run() => res,
        }
    }

    async fn run(&mut self) -> anyhow::Result<()> {
        let mut view = SupervisorView::new(MAX_MISSED);
        let mut leader = false;
        let mut ticker = time::interval(INTERVAL);
        loop {
            ticker.tick().await;
            if let Err(e) = self.tick(&mut view, &mut leader).await {
                if e.is_not_ready() {
                    info!("waiting: {e}");
                } else {
                    warn!("reconciliation failed, retrying next tick: {e}");
                }
            }
        }
    }

    /// One reconciliation pass: refresh the view, prune, elect, allocate
    /// when leading, then project the assignment onto local containers.
    async fn tick(&mut self, view: &mut SupervisorView, leader: &mut bool) -> Result<()> {
        view.begin_tick();
        view.observe(self.store.members().await?);

        for uuid in view.expired() {
            let name = view.get(&uuid).map(|m| m.name.clone()).unwrap_or_default();
            match self.store.delete(&uuid).await {
                Ok(()) => {
                    info!("forgetting cluster member {name} ({uuid})");
                    view.forget(&uuid);
                }
                Err(e) => error!("failed to delete member {uuid}: {e}"),
            }
        }

        let now_leader = elect::is_leader(view.members(), &self.me.uuid);
        if now_leader != *leader {
            info!("currently leader: {now_leader}");
            *leader = now_leader;
        }

        if now_leader {
            let allocation = alloc::assign(view.members(), self.cfg.cluster_size);
            if allocation.changed {
                self.store.save_index(&allocation.by_index).await?;
                // Project intent from committed assignments: re-read the
                // store on the next tick before touching containers.
                return Ok(());
            }
        }

        let credentials = match self.store.api_credentials().await {
            Ok(creds) => Some(creds),
            Err(Error::NotReady(msg)) => {
                info!("{msg}");
                None
            }
            Err(e) => return Err(e),
        };

        self.services
            .update(now_leader, view.assigned_by_index(), credentials)
            .await
    }
}

/// Counts up forever; returns only on a store failure, which the caller
/// treats as fatal.
async fn heartbeat_loop(store: Store, me: Member) -> Error {
    let mut ticker = time::interval(INTERVAL);
    let mut beat: i64 = 1;
    loop {
        ticker.tick().await;
        if let Err(e) = store.checkin(&me, beat).await {
            return e;
        }
        beat += 1;
    }
}

/// A node that held a slot before a restart finds it in the env of its own
/// parent container and asks for it back.
async fn requested_index(driver: &Driver) -> Result<i32> {
    let Some(parent) = driver.api().inspect(&driver.prefixed(PARENT)).await? else {
        return Ok(0);
    };
    let env = parse_env(&parent.env);
    Ok(env
        .get("INDEX")
        .and_then(|value| value.parse::<i32>().ok())
        .filter(|index| *index > 0)
        .unwrap_or(0))
}
