//! In-memory daemon double for tests.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{ContainerApi, ContainerDetail, CreateOptions};
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct FakeContainer {
    pub opts: CreateOptions,
    pub running: bool,
    pub restarting: bool,
}

#[derive(Default)]
pub struct FakeApi {
    containers: Mutex<HashMap<String, FakeContainer>>,
    missing_images: Mutex<HashSet<String>>,
    pulled: Mutex<Vec<String>>,
    creates: Mutex<u32>,
    removes: Mutex<u32>,
}

impl FakeApi {
    /// Pre-populate a running container, as if something else created it.
    pub fn seed(&self, name: &str, opts: CreateOptions) {
        self.containers.lock().unwrap().insert(
            name.to_string(),
            FakeContainer {
                opts,
                running: true,
                restarting: false,
            },
        );
    }

    pub fn stop(&self, name: &str) {
        if let Some(c) = self.containers.lock().unwrap().get_mut(name) {
            c.running = false;
        }
    }

    pub fn mark_image_missing(&self, image: &str) {
        self.missing_images.lock().unwrap().insert(image.to_string());
    }

    pub fn container(&self, name: &str) -> Option<FakeContainer> {
        self.containers.lock().unwrap().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.containers.lock().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn pulled(&self) -> Vec<String> {
        self.pulled.lock().unwrap().clone()
    }

    pub fn create_count(&self) -> u32 {
        *self.creates.lock().unwrap()
    }

    pub fn remove_count(&self) -> u32 {
        *self.removes.lock().unwrap()
    }
}

#[async_trait]
impl ContainerApi for FakeApi {
    async fn inspect(&self, name: &str) -> Result<Option<ContainerDetail>> {
        Ok(self.containers.lock().unwrap().get(name).map(|c| ContainerDetail {
            id: name.to_string(),
            image: c.opts.image.clone(),
            command: c.opts.command.clone(),
            env: c.opts.env.clone(),
            running: c.running,
            restarting: c.restarting,
        }))
    }

    async fn create(&self, name: &str, opts: CreateOptions) -> Result<String> {
        if self.missing_images.lock().unwrap().contains(&opts.image) {
            return Err(Error::ImageMissing(opts.image));
        }
        *self.creates.lock().unwrap() += 1;
        self.containers.lock().unwrap().insert(
            name.to_string(),
            FakeContainer {
                opts,
                running: false,
                restarting: false,
            },
        );
        Ok(name.to_string())
    }

    async fn start(&self, id: &str) -> Result<()> {
        match self.containers.lock().unwrap().get_mut(id) {
            Some(c) => {
                c.running = true;
                Ok(())
            }
            None => Err(Error::other(format!("no such container {id}"))),
        }
    }

    async fn remove(&self, id: &str) -> Result<()> {
        if self.containers.lock().unwrap().remove(id).is_some() {
            *self.removes.lock().unwrap() += 1;
        }
        Ok(())
    }

    async fn list_by_label(&self, labels: &HashMap<String, String>) -> Result<Vec<String>> {
        let mut ids: Vec<String> = self
            .containers
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, c)| {
                labels
                    .iter()
                    .all(|(k, v)| c.opts.labels.get(k).map(String::as_str) == Some(v.as_str()))
            })
            .map(|(name, _)| name.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        self.pulled.lock().unwrap().push(image.to_string());
        self.missing_images.lock().unwrap().remove(image);
        Ok(())
    }

    async fn bridge_subnet(&self) -> Result<String> {
        Ok("172.17.0.0/16".to_string())
    }

    async fn node_name(&self) -> Result<String> {
        Ok("fake-node".to_string())
    }
}
