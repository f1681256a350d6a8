use std::{collections::BTreeMap, sync::Arc};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use data_model::{Container, EnvSet, EnvSetId, Environment, Machine};
use tracing::warn;

use crate::config::AllocatorKind;

pub mod fair_share;
pub mod minimal;

pub use fair_share::FairShareAllocator;
pub use minimal::MinimalAllocator;

#[derive(Debug, thiserror::Error)]
pub enum AllocatorError {
    #[error("insufficient resources to place {0}")]
    InsufficientResources(String),
    #[error("invalid environment: {0}")]
    InvalidEnvironment(String),
    #[error("rpc to machine {machine} failed: {source}")]
    MachineRpc {
        machine: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("container refers to unknown machine {0}")]
    UnknownMachine(usize),
}

/// Allocate/deallocate RPCs to machine services.
#[async_trait]
pub trait MachineClient: Send + Sync {
    async fn allocate(&self, machine: &Machine, env: &Environment) -> Result<Container>;

    async fn deallocate(&self, machine: &Machine, uuid: &str) -> Result<()>;
}

pub struct HttpMachineClient {
    client: reqwest::Client,
}

impl HttpMachineClient {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpMachineClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MachineClient for HttpMachineClient {
    async fn allocate(&self, machine: &Machine, env: &Environment) -> Result<Container> {
        let resp = self
            .client
            .post(format!("{}/allocate", machine.base_url))
            .json(env)
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow!("allocate returned {}: {}", status, body));
        }
        Ok(resp.json().await?)
    }

    async fn deallocate(&self, machine: &Machine, uuid: &str) -> Result<()> {
        let resp = self
            .client
            .post(format!("{}/deallocate", machine.base_url))
            .form(&[("uuid", uuid)])
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(anyhow!("deallocate of {} returned {}", uuid, resp.status()));
        }
        Ok(())
    }
}

/// Places environment sets onto machines and owns the resulting containers
/// until they are deallocated.
#[async_trait]
pub trait Allocator: Send + Sync {
    /// One container per environment of `set`. Returns the existing
    /// containers while the set is allocated.
    async fn allocate(&self, set: &EnvSet) -> Result<Vec<Container>, AllocatorError>;

    /// One container per environment of an allocated set, spreading calls
    /// over duplicate containers.
    async fn pick(&self, id: &EnvSetId) -> Option<Vec<Container>>;

    /// Releases every container of `id`. A no-op for unknown sets.
    async fn deallocate(&self, id: &EnvSetId) -> Result<(), AllocatorError>;

    async fn env_sets(&self) -> Vec<EnvSetId>;

    /// Containers of `id`, grouped by environment.
    async fn containers(&self, id: &EnvSetId) -> Vec<Vec<Container>>;
}

pub fn new_allocator(
    kind: AllocatorKind,
    machines: Vec<Machine>,
    client: Arc<dyn MachineClient>,
) -> Arc<dyn Allocator> {
    match kind {
        AllocatorKind::Minimal => Arc::new(MinimalAllocator::new(machines, client)),
        AllocatorKind::FairShare => Arc::new(FairShareAllocator::new(machines, client)),
    }
}

pub(crate) type Resources = BTreeMap<String, i64>;

pub(crate) fn fits(free: &Resources, req: &Resources) -> bool {
    req.iter()
        .all(|(name, amount)| free.get(name).copied().unwrap_or(0) >= *amount)
}

pub(crate) fn subtract(free: &mut Resources, req: &Resources) {
    for (name, amount) in req {
        *free.entry(name.clone()).or_default() -= amount;
    }
}

pub(crate) fn add(free: &mut Resources, req: &Resources) {
    for (name, amount) in req {
        *free.entry(name.clone()).or_default() += amount;
    }
}

/// Free resources per machine once `containers` are accounted for.
pub(crate) fn free_capacity<'a>(
    machines: &[Machine],
    containers: impl Iterator<Item = &'a Container>,
) -> Result<Vec<Resources>, AllocatorError> {
    let mut free: Vec<Resources> = machines.iter().map(|m| m.resources.clone()).collect();
    for container in containers {
        let machine = free
            .get_mut(container.machine_idx)
            .ok_or(AllocatorError::UnknownMachine(container.machine_idx))?;
        subtract(machine, &container.environment.requirements);
    }
    Ok(free)
}

pub(crate) async fn create_container(
    client: &dyn MachineClient,
    machines: &[Machine],
    idx: usize,
    env: &Environment,
) -> Result<Container, AllocatorError> {
    let machine = machines.get(idx).ok_or(AllocatorError::UnknownMachine(idx))?;
    let mut container =
        client
            .allocate(machine, env)
            .await
            .map_err(|source| AllocatorError::MachineRpc {
                machine: machine.base_url.clone(),
                source,
            })?;
    container.machine_idx = idx;
    container.environment = env.clone();
    Ok(container)
}

pub(crate) async fn release_container(
    client: &dyn MachineClient,
    machines: &[Machine],
    container: &Container,
) -> Result<(), AllocatorError> {
    let machine = machines
        .get(container.machine_idx)
        .ok_or(AllocatorError::UnknownMachine(container.machine_idx))?;
    client
        .deallocate(machine, &container.uuid)
        .await
        .map_err(|source| AllocatorError::MachineRpc {
            machine: machine.base_url.clone(),
            source,
        })
}

/// Releases containers created by an allocation that is being abandoned.
pub(crate) async fn rollback(
    client: &dyn MachineClient,
    machines: &[Machine],
    containers: &[Container],
) {
    for container in containers {
        if let Err(err) = release_container(client, machines, container).await {
            warn!(uuid = container.uuid, "failed to roll back container: {}", err);
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex;

    use super::*;

    /// Records RPCs and hands out containers with sequential uuids.
    #[derive(Default)]
    pub struct FakeMachineClient {
        next: AtomicUsize,
        pub allocated: Mutex<Vec<(String, Environment)>>,
        pub deallocated: Mutex<Vec<String>>,
        pub fail_deallocate: std::sync::atomic::AtomicBool,
        /// Fail the allocate RPC once this many containers exist.
        pub fail_after: Mutex<Option<usize>>,
    }

    impl FakeMachineClient {
        pub fn allocate_calls(&self) -> usize {
            self.allocated.lock().len()
        }
    }

    #[async_trait]
    impl MachineClient for FakeMachineClient {
        async fn allocate(&self, machine: &Machine, env: &Environment) -> Result<Container> {
            if let Some(limit) = *self.fail_after.lock() {
                if self.allocated.lock().len() >= limit {
                    return Err(anyhow!("machine out of processes"));
                }
            }
            let n = self.next.fetch_add(1, Ordering::SeqCst);
            let uuid = format!("c{}", n);
            self.allocated.lock().push((uuid.clone(), env.clone()));
            Ok(Container {
                uuid: uuid.clone(),
                environment: env.clone(),
                base_url: format!("{}/{}", machine.base_url, uuid),
                machine_idx: 0,
            })
        }

        async fn deallocate(&self, _machine: &Machine, uuid: &str) -> Result<()> {
            self.deallocated.lock().push(uuid.to_string());
            if self.fail_deallocate.load(Ordering::SeqCst) {
                return Err(anyhow!("machine unreachable"));
            }
            Ok(())
        }
    }

    pub fn machine(resources: &[(&str, i64)]) -> Machine {
        Machine {
            base_url: "http://machine".to_string(),
            resources: resources
                .iter()
                .map(|(name, amount)| (name.to_string(), *amount))
                .collect(),
        }
    }

    pub fn env(ref_id: Option<i64>, requirements: &[(&str, i64)]) -> Environment {
        Environment {
            template: "test".to_string(),
            requirements: requirements
                .iter()
                .map(|(name, amount)| (name.to_string(), *amount))
                .collect(),
            ref_id: ref_id.map(data_model::NodeId),
        }
    }

    pub fn env_set(id: i64, environments: Vec<Environment>) -> EnvSet {
        EnvSet {
            id: EnvSetId {
                kind: "query".to_string(),
                ref_id: id,
            },
            environments,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_arithmetic() {
        let mut free: Resources = [("container".to_string(), 2), ("gpu".to_string(), 1)].into();
        let req: Resources = [("container".to_string(), 1), ("gpu".to_string(), 1)].into();
        assert!(fits(&free, &req));
        subtract(&mut free, &req);
        assert!(!fits(&free, &req));
        assert!(fits(&free, &[("container".to_string(), 1)].into()));
        assert!(!fits(&free, &[("tpu".to_string(), 1)].into()));
        add(&mut free, &req);
        assert_eq!(free["gpu"], 1);
    }
}
