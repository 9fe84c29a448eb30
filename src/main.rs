//! HA cluster manager daemon entry point.
//!
//! Every node of the cluster runs this same binary. Nodes meet each other
//! through a shared membership table, elect the smallest row id as leader,
//! and converge the local container set on whatever the current slot
//! assignment asks for.

use std::sync::Arc;

use anyhow::Context;
use log::info;
use tokio::signal;

mod alloc;
mod config;
mod crypto;
mod elect;
mod error;
mod manager;
mod product;
mod runtime;
mod service;
mod store;
mod tunnel;
mod view;

use config::Config;
use manager::Manager;
use runtime::{ContainerApi, DockerApi, Driver};
use store::Store;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let api: Arc<dyn ContainerApi> =
        Arc::new(DockerApi::connect().context("failed to connect to the container daemon")?);

    let cfg = Arc::new(Config::load(api.as_ref()).await?);
    info!(
        "starting cluster manager, uuid={}, cluster size={}",
        cfg.uuid, cfg.cluster_size
    );

    let store = Store::connect(&cfg)
        .await
        .context("failed to open the cluster store")?;
    store
        .migrate()
        .await
        .context("failed to create the cluster table")?;

    let driver = Driver::new(api, &cfg);
    let manager = Manager::new(cfg, store, driver).await?;

    tokio::select! {
        res = manager.start() => res,
        _ = signal::ctrl_c() => {
            info!("received ctrl-c, shutting down");
            Ok(())
        }
    }
}
