use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use data_model::{Container, EnvSet, EnvSetId, Machine};
use metrics::Timer;
use opentelemetry::KeyValue;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::{
    create_container,
    fits,
    free_capacity,
    release_container,
    rollback,
    subtract,
    Allocator,
    AllocatorError,
    MachineClient,
};

/// Greedy placement that co-locates containers of a set and never evicts.
pub struct MinimalAllocator {
    machines: Vec<Machine>,
    client: Arc<dyn MachineClient>,
    /// One container per environment of each set, in environment order.
    sets: Mutex<HashMap<EnvSetId, Vec<Container>>>,
    metrics: metrics::allocator::Metrics,
}

impl MinimalAllocator {
    pub fn new(machines: Vec<Machine>, client: Arc<dyn MachineClient>) -> Self {
        Self {
            machines,
            client,
            sets: Mutex::new(HashMap::new()),
            metrics: metrics::allocator::Metrics::new(),
        }
    }

    /// Machine index for every environment of `set`, or an error if any
    /// environment fits nowhere.
    fn place(
        &self,
        set: &EnvSet,
        sets: &HashMap<EnvSetId, Vec<Container>>,
    ) -> Result<Vec<usize>, AllocatorError> {
        let mut free = free_capacity(
            &self.machines,
            sets.values().flatten(),
        )?;
        let mut hits = vec![0usize; self.machines.len()];
        let mut placement = Vec::with_capacity(set.environments.len());
        for env in &set.environments {
            let best = free
                .iter()
                .enumerate()
                .filter(|(_, free)| fits(free, &env.requirements))
                .max_by_key(|(idx, _)| (hits[*idx], std::cmp::Reverse(*idx)))
                .map(|(idx, _)| idx)
                .ok_or_else(|| {
                    AllocatorError::InsufficientResources(format!(
                        "environment {:?} of {}",
                        env.requirements, set.id
                    ))
                })?;
            subtract(&mut free[best], &env.requirements);
            hits[best] += 1;
            placement.push(best);
        }
        Ok(placement)
    }
}

#[async_trait]
impl Allocator for MinimalAllocator {
    async fn allocate(&self, set: &EnvSet) -> Result<Vec<Container>, AllocatorError> {
        let mut sets = self.sets.lock().await;
        if let Some(containers) = sets.get(&set.id) {
            return Ok(containers.clone());
        }
        let labels = [KeyValue::new("allocator", "minimal")];
        let _timer = Timer::start_with_labels(&self.metrics.allocate_duration, &labels);

        let placement = self.place(set, &sets)?;
        let mut containers = Vec::with_capacity(placement.len());
        for (env, idx) in set.environments.iter().zip(placement) {
            info!(set = %set.id, machine = idx, template = env.template, "allocating container");
            match create_container(self.client.as_ref(), &self.machines, idx, env).await {
                Ok(container) => containers.push(container),
                Err(err) => {
                    rollback(self.client.as_ref(), &self.machines, &containers).await;
                    return Err(err);
                }
            }
        }
        self.metrics
            .allocations
            .add(containers.len() as u64, &labels);
        sets.insert(set.id.clone(), containers.clone());
        Ok(containers)
    }

    async fn pick(&self, id: &EnvSetId) -> Option<Vec<Container>> {
        let sets = self.sets.lock().await;
        sets.get(id).cloned()
    }

    async fn deallocate(&self, id: &EnvSetId) -> Result<(), AllocatorError> {
        let mut sets = self.sets.lock().await;
        let Some(containers) = sets.remove(id) else {
            return Ok(());
        };
        info!(set = %id, containers = containers.len(), "deallocating set");
        let mut result = Ok(());
        for container in &containers {
            if let Err(err) = release_container(self.client.as_ref(), &self.machines, container).await
            {
                warn!(set = %id, uuid = container.uuid, "failed to deallocate container: {}", err);
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }
        self.metrics.deallocations.add(
            containers.len() as u64,
            &[KeyValue::new("allocator", "minimal")],
        );
        result
    }

    async fn env_sets(&self) -> Vec<EnvSetId> {
        let sets = self.sets.lock().await;
        let mut ids: Vec<EnvSetId> = sets.keys().cloned().collect();
        ids.sort();
        ids
    }

    async fn containers(&self, id: &EnvSetId) -> Vec<Vec<Container>> {
        let sets = self.sets.lock().await;
        sets.get(id)
            .map(|containers| {
                containers
                    .iter()
                    .map(|container| vec![container.clone()])
                    .collect()
            })
            .unwrap_or_default()
    }
}
