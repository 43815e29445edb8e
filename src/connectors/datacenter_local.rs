//! Simulated cloud provider.
//!
//! Images and instances live in process memory and change state only when
//! polled, which makes every multi-step command deterministic: a resource
//! created now becomes ready (or disappears, when removed) after a fixed
//! number of status polls. Proxies reach the instances through the
//! `cloud-local` transport with a synthetic fingerprint.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{parse_settings, Capabilities, ConnectorProvider};
use crate::error::{PoolError, Result};
use crate::models::{ProxyStatus, Task, TaskKind, TaskUpdate, WAIT_DELAY_MS};
use crate::net::Address;
use crate::tasks::{ProvisionedProxy, TaskCommand, TaskContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceState {
    Pending,
    Ready,
    Removing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    pub id: String,
    pub state: ResourceState,
}

/// Provider API the datacenter commands drive.
#[async_trait]
pub trait DatacenterApi: Send + Sync {
    async fn create_image(&self, region: &str) -> Result<String>;

    /// `None` once the image is gone.
    async fn get_image(&self, image_id: &str) -> Result<Option<ResourceState>>;

    async fn remove_image(&self, image_id: &str) -> Result<()>;

    async fn create_instances(&self, image_id: &str, count: usize) -> Result<Vec<String>>;

    /// Instances that still exist among `ids`.
    async fn get_instances(&self, ids: &[String]) -> Result<Vec<Instance>>;

    async fn remove_instances(&self, ids: &[String]) -> Result<()>;
}

#[derive(Debug)]
struct Resource {
    state: ResourceState,
    polls_left: u32,
}

impl Resource {
    fn new(polls: u32) -> Self {
        Self {
            state: ResourceState::Pending,
            polls_left: polls,
        }
    }

    /// Advance one poll. Returns false when the resource is gone.
    fn poll(&mut self) -> bool {
        if self.polls_left > 0 {
            self.polls_left -= 1;
        }
        if self.polls_left == 0 {
            match self.state {
                ResourceState::Pending => self.state = ResourceState::Ready,
                ResourceState::Removing => return false,
                ResourceState::Ready => {}
            }
        }
        true
    }
}

#[derive(Debug, Default)]
struct LocalState {
    images: HashMap<String, Resource>,
    instances: HashMap<String, Resource>,
    sequence: u64,
}

impl LocalState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.sequence += 1;
        format!("{}-{:06}", prefix, self.sequence)
    }
}

/// In-process implementation of [`DatacenterApi`].
#[derive(Debug)]
pub struct LocalDatacenter {
    state: Mutex<LocalState>,
    boot_polls: u32,
    max_instances: Option<usize>,
}

impl Default for LocalDatacenter {
    fn default() -> Self {
        Self::new(2)
    }
}

impl LocalDatacenter {
    /// Resources change state after `boot_polls` status polls.
    pub fn new(boot_polls: u32) -> Self {
        Self {
            state: Mutex::new(LocalState::default()),
            boot_polls,
            max_instances: None,
        }
    }

    /// Refuse instance creation past `max` live instances.
    pub fn with_quota(mut self, max: usize) -> Self {
        self.max_instances = Some(max);
        self
    }

    pub fn instance_count(&self) -> usize {
        self.state.lock().instances.len()
    }
}

#[async_trait]
impl DatacenterApi for LocalDatacenter {
    async fn create_image(&self, region: &str) -> Result<String> {
        let mut state = self.state.lock();
        let id = state.next_id(&format!("img-{}", region));
        state.images.insert(id.clone(), Resource::new(self.boot_polls));
        Ok(id)
    }

    async fn get_image(&self, image_id: &str) -> Result<Option<ResourceState>> {
        let mut state = self.state.lock();
        let Some(image) = state.images.get_mut(image_id) else {
            return Ok(None);
        };
        if image.poll() {
            Ok(Some(image.state))
        } else {
            state.images.remove(image_id);
            Ok(None)
        }
    }

    async fn remove_image(&self, image_id: &str) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(image) = state.images.get_mut(image_id) {
            image.state = ResourceState::Removing;
            image.polls_left = self.boot_polls;
        }
        Ok(())
    }

    async fn create_instances(&self, image_id: &str, count: usize) -> Result<Vec<String>> {
        let mut state = self.state.lock();
        match state.images.get(image_id).map(|image| image.state) {
            Some(ResourceState::Ready) => {}
            Some(_) => {
                return Err(PoolError::Transient(format!("image {} is not ready", image_id)))
            }
            None => {
                return Err(PoolError::TaskTerminal(format!(
                    "image {} does not exist",
                    image_id
                )))
            }
        }
        if let Some(max) = self.max_instances {
            if state.instances.len() + count > max {
                return Err(PoolError::TaskTerminal(format!(
                    "Instance quota exhausted ({} max)",
                    max
                )));
            }
        }

        let ids: Vec<String> = (0..count).map(|_| state.next_id("i")).collect();
        for id in &ids {
            state.instances.insert(id.clone(), Resource::new(self.boot_polls));
        }
        Ok(ids)
    }

    async fn get_instances(&self, ids: &[String]) -> Result<Vec<Instance>> {
        let mut state = self.state.lock();
        let mut found = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(instance) = state.instances.get_mut(id) else {
                continue;
            };
            if instance.poll() {
                found.push(Instance {
                    id: id.clone(),
                    state: instance.state,
                });
            } else {
                state.instances.remove(id);
            }
        }
        Ok(found)
    }

    async fn remove_instances(&self, ids: &[String]) -> Result<()> {
        let mut state = self.state.lock();
        for id in ids {
            if let Some(instance) = state.instances.get_mut(id) {
                if instance.state != ResourceState::Removing {
                    instance.state = ResourceState::Removing;
                    instance.polls_left = self.boot_polls;
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatacenterLocalConfig {
    pub region: String,
    /// Ingress every instance is reached through, `host:port`
    pub ingress: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DatacenterLocalCredential {
    #[serde(rename = "apiKey")]
    api_key: String,
}

pub struct DatacenterLocalProvider {
    api: Arc<dyn DatacenterApi>,
}

impl DatacenterLocalProvider {
    pub fn new(api: Arc<dyn DatacenterApi>) -> Self {
        Self { api }
    }
}

impl ConnectorProvider for DatacenterLocalProvider {
    fn provider_type(&self) -> &'static str {
        "datacenter-local"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            installable: true,
            uninstallable: true,
            requires_certificate: true,
            ..Capabilities::default()
        }
    }

    fn transport(&self) -> &'static str {
        "cloud-local"
    }

    fn validate_credential(&self, credential: &Value) -> Result<()> {
        let credential: DatacenterLocalCredential = parse_settings(credential, "credential")?;
        if credential.api_key.trim().is_empty() {
            return Err(PoolError::Validation("apiKey must not be empty".to_string()));
        }
        Ok(())
    }

    fn validate_config(&self, config: &Value) -> Result<()> {
        let config: DatacenterLocalConfig = parse_settings(config, "config")?;
        let valid_region = !config.region.is_empty()
            && config
                .region
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-');
        if !valid_region {
            return Err(PoolError::Validation(format!(
                "region '{}' is not a valid region name",
                config.region
            )));
        }
        Address::parse(&config.ingress)?;
        Ok(())
    }

    fn task_steps(&self, kind: TaskKind) -> u32 {
        match kind {
            TaskKind::Install => 2,
            TaskKind::Uninstall => 1,
            TaskKind::CreateProxies => 2,
            TaskKind::RemoveProxies => 2,
        }
    }

    fn build_task_command(&self, task: &Task) -> Result<Box<dyn TaskCommand>> {
        let api = self.api.clone();
        Ok(match task.kind {
            TaskKind::Install => Box::new(InstallImage { api }),
            TaskKind::Uninstall => Box::new(UninstallImage { api }),
            TaskKind::CreateProxies => Box::new(CreateInstances { api }),
            TaskKind::RemoveProxies => Box::new(RemoveInstances { api }),
        })
    }
}

fn task_data<T: DeserializeOwned>(task: &Task) -> Result<T> {
    serde_json::from_value(task.data.clone())
        .map_err(|e| PoolError::TaskTerminal(format!("invalid task data: {}", e)))
}

async fn connector_config(ctx: &TaskContext) -> Result<DatacenterLocalConfig> {
    let connector = ctx.get_connector().await?;
    parse_settings(&connector.config, "connector config")
}

fn unknown_step(task: &Task) -> PoolError {
    PoolError::TaskTerminal(format!("unknown step {} of {}", task.step_current, task.kind))
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImageData {
    #[serde(default)]
    image_id: Option<String>,
}

struct InstallImage {
    api: Arc<dyn DatacenterApi>,
}

#[async_trait]
impl TaskCommand for InstallImage {
    async fn execute(&mut self, ctx: &TaskContext) -> Result<TaskUpdate> {
        let task = ctx.task();
        let config = connector_config(ctx).await?;

        match task.step_current {
            0 => {
                let image_id = self.api.create_image(&config.region).await?;
                info!(connector_id = %ctx.connector_id(), image_id = %image_id, "Image requested");
                let data = serde_json::to_value(ImageData {
                    image_id: Some(image_id),
                })?;
                Ok(TaskUpdate::next_step(task, "Image requested", data, WAIT_DELAY_MS))
            }
            1 => {
                let data: ImageData = task_data(task)?;
                let image_id = data.image_id.clone().ok_or_else(|| unknown_step(task))?;
                match self.api.get_image(&image_id).await? {
                    Some(ResourceState::Ready) => {
                        let config = DatacenterLocalConfig {
                            image_id: Some(image_id),
                            ..config
                        };
                        ctx.update_connector_config(serde_json::to_value(&config)?)
                            .await?;
                        ctx.set_installed(true).await?;
                        Ok(TaskUpdate::finish(task, "Connector installed", Value::Null))
                    }
                    Some(_) => Ok(TaskUpdate::wait(
                        task,
                        "Waiting for image",
                        serde_json::to_value(data)?,
                    )),
                    None => Err(PoolError::TaskTerminal(format!(
                        "image {} disappeared",
                        image_id
                    ))),
                }
            }
            _ => Err(unknown_step(task)),
        }
    }

    async fn cancel(&mut self, ctx: &TaskContext) -> Result<()> {
        let data: ImageData = task_data(ctx.task()).unwrap_or_default();
        if let Some(image_id) = data.image_id {
            debug!(image_id = %image_id, "Removing image of cancelled install");
            self.api.remove_image(&image_id).await?;
        }
        Ok(())
    }
}

struct UninstallImage {
    api: Arc<dyn DatacenterApi>,
}

#[async_trait]
impl TaskCommand for UninstallImage {
    async fn execute(&mut self, ctx: &TaskContext) -> Result<TaskUpdate> {
        let task = ctx.task();
        if !ctx.list_proxies().await?.is_empty() {
            return Err(PoolError::TaskTerminal(
                "Remove all proxies before uninstalling".to_string(),
            ));
        }

        let config = connector_config(ctx).await?;
        if let Some(image_id) = &config.image_id {
            self.api.remove_image(image_id).await?;
        }
        let config = DatacenterLocalConfig {
            image_id: None,
            ..config
        };
        ctx.update_connector_config(serde_json::to_value(&config)?)
            .await?;
        ctx.set_installed(false).await?;
        Ok(TaskUpdate::finish(task, "Connector uninstalled", Value::Null))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstanceRef {
    proxy_id: Uuid,
    instance_id: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstanceData {
    proxy_ids: Vec<Uuid>,
    #[serde(default)]
    instances: Vec<InstanceRef>,
}

impl InstanceData {
    fn instance_ids(&self) -> Vec<String> {
        self.instances.iter().map(|i| i.instance_id.clone()).collect()
    }
}

struct CreateInstances {
    api: Arc<dyn DatacenterApi>,
}

#[async_trait]
impl TaskCommand for CreateInstances {
    async fn execute(&mut self, ctx: &TaskContext) -> Result<TaskUpdate> {
        let task = ctx.task();
        let mut data: InstanceData = task_data(task)?;
        let config = connector_config(ctx).await?;

        match task.step_current {
            0 => {
                let image_id = config.image_id.as_deref().ok_or_else(|| {
                    PoolError::TaskTerminal("Connector is not installed".to_string())
                })?;
                ctx.mark_creating(&data.proxy_ids).await?;
                let instance_ids = self
                    .api
                    .create_instances(image_id, data.proxy_ids.len())
                    .await?;
                data.instances = data
                    .proxy_ids
                    .iter()
                    .zip(instance_ids)
                    .map(|(proxy_id, instance_id)| InstanceRef {
                        proxy_id: *proxy_id,
                        instance_id,
                    })
                    .collect();
                let keys: Vec<(Uuid, String)> = data
                    .instances
                    .iter()
                    .map(|i| (i.proxy_id, i.instance_id.clone()))
                    .collect();
                ctx.assign_keys(&keys).await?;
                info!(
                    connector_id = %ctx.connector_id(),
                    count = data.instances.len(),
                    "Instances requested"
                );
                Ok(TaskUpdate::next_step(
                    task,
                    "Instances requested",
                    serde_json::to_value(&data)?,
                    WAIT_DELAY_MS,
                ))
            }
            1 => {
                let instances = self.api.get_instances(&data.instance_ids()).await?;
                if instances.len() < data.instances.len() {
                    return Err(PoolError::TaskTerminal(format!(
                        "{} instances disappeared while booting",
                        data.instances.len() - instances.len()
                    )));
                }
                let ready = instances
                    .iter()
                    .filter(|i| i.state == ResourceState::Ready)
                    .count();
                if ready < instances.len() {
                    return Ok(TaskUpdate::wait(
                        task,
                        format!("Waiting for instances ({}/{} ready)", ready, instances.len()),
                        serde_json::to_value(&data)?,
                    ));
                }

                let provisioned: Vec<ProvisionedProxy> = data
                    .instances
                    .iter()
                    .map(|instance| ProvisionedProxy {
                        id: instance.proxy_id,
                        key: instance.instance_id.clone(),
                        name: format!("{}-{}", config.region, instance.instance_id),
                        config: json!({ "address": config.ingress }),
                        status: ProxyStatus::Starting,
                    })
                    .collect();
                let count = provisioned.len();
                ctx.report_provisioned(provisioned).await?;
                Ok(TaskUpdate::finish(
                    task,
                    format!("Created {} proxies", count),
                    Value::Null,
                ))
            }
            _ => Err(unknown_step(task)),
        }
    }

    async fn cancel(&mut self, ctx: &TaskContext) -> Result<()> {
        let data: InstanceData = task_data(ctx.task()).unwrap_or_default();
        let ids = data.instance_ids();
        if !ids.is_empty() {
            warn!(count = ids.len(), "Removing instances of cancelled create");
            self.api.remove_instances(&ids).await?;
        }
        Ok(())
    }
}

struct RemoveInstances {
    api: Arc<dyn DatacenterApi>,
}

#[async_trait]
impl TaskCommand for RemoveInstances {
    async fn execute(&mut self, ctx: &TaskContext) -> Result<TaskUpdate> {
        let task = ctx.task();
        let mut data: InstanceData = task_data(task)?;

        match task.step_current {
            0 => {
                ctx.mark_removing(&data.proxy_ids).await?;
                data.instances = ctx
                    .get_proxies(&data.proxy_ids)
                    .await?
                    .into_iter()
                    .filter(|p| !p.key.is_empty())
                    .map(|p| InstanceRef {
                        proxy_id: p.id,
                        instance_id: p.key,
                    })
                    .collect();
                self.api.remove_instances(&data.instance_ids()).await?;
                Ok(TaskUpdate::next_step(
                    task,
                    "Instances removal requested",
                    serde_json::to_value(&data)?,
                    WAIT_DELAY_MS,
                ))
            }
            1 => {
                let remaining = self.api.get_instances(&data.instance_ids()).await?;
                if !remaining.is_empty() {
                    return Ok(TaskUpdate::wait(
                        task,
                        format!("Waiting for {} instances to stop", remaining.len()),
                        serde_json::to_value(&data)?,
                    ));
                }
                let removed = ctx.discard_proxies(&data.proxy_ids).await?;
                Ok(TaskUpdate::finish(
                    task,
                    format!("Removed {} proxies", removed),
                    Value::Null,
                ))
            }
            _ => Err(unknown_step(task)),
        }
    }
}
