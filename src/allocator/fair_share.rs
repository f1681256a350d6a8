use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use data_model::{Container, EnvSet, EnvSetId, Machine};
use metrics::Timer;
use opentelemetry::KeyValue;
use rand::seq::SliceRandom;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{
    add,
    create_container,
    fits,
    free_capacity,
    release_container,
    rollback,
    subtract,
    Allocator,
    AllocatorError,
    MachineClient,
    Resources,
};

struct SetState {
    /// Containers of each environment, in environment order.
    containers: Vec<Vec<Container>>,
    /// Round-robin position per environment for `pick`.
    cursors: Vec<usize>,
}

impl SetState {
    fn footprint(&self) -> Resources {
        let mut footprint = Resources::new();
        for container in self.containers.iter().flatten() {
            add(&mut footprint, &container.environment.requirements);
        }
        footprint
    }

    fn first_per_env(&self) -> Vec<Container> {
        self.containers
            .iter()
            .filter_map(|containers| containers.first().cloned())
            .collect()
    }
}

/// Divides machine resources evenly over the active sets. A new set shrinks
/// every larger set down to its share before being placed, then fills all
/// remaining capacity with duplicate containers.
pub struct FairShareAllocator {
    machines: Vec<Machine>,
    client: Arc<dyn MachineClient>,
    sets: Mutex<HashMap<EnvSetId, SetState>>,
    metrics: metrics::allocator::Metrics,
}

fn exceeds(footprint: &Resources, budget: &Resources) -> bool {
    footprint
        .iter()
        .any(|(name, amount)| *amount > budget.get(name).copied().unwrap_or(0))
}

impl FairShareAllocator {
    pub fn new(machines: Vec<Machine>, client: Arc<dyn MachineClient>) -> Self {
        Self {
            machines,
            client,
            sets: Mutex::new(HashMap::new()),
            metrics: metrics::allocator::Metrics::new(),
        }
    }

    fn validate(set: &EnvSet) -> Result<(), AllocatorError> {
        if set.environments.is_empty() {
            return Err(AllocatorError::InvalidEnvironment(format!(
                "{} has no environments",
                set.id
            )));
        }
        for env in &set.environments {
            if env.requirements.is_empty() || env.requirements.values().any(|v| *v <= 0) {
                return Err(AllocatorError::InvalidEnvironment(format!(
                    "{} requires {:?}; requirements must be positive",
                    env.template, env.requirements
                )));
            }
        }
        Ok(())
    }

    /// Per-set share of the total machine resources with `active` sets.
    fn budget(&self, active: usize) -> Resources {
        let mut total = Resources::new();
        for machine in &self.machines {
            add(&mut total, &machine.resources);
        }
        let share = active as i64 + 1;
        total.values_mut().for_each(|amount| *amount /= share);
        total
    }

    /// Picks containers to evict from `state` until it fits `budget`,
    /// keeping at least one container per environment.
    fn choose_evictions(state: &SetState, budget: &Resources) -> Vec<(usize, String)> {
        let mut footprint = state.footprint();
        if !exceeds(&footprint, budget) {
            return Vec::new();
        }
        let mut candidates: Vec<(usize, &Container)> = state
            .containers
            .iter()
            .enumerate()
            .flat_map(|(env_idx, containers)| containers.iter().map(move |c| (env_idx, c)))
            .collect();
        candidates.shuffle(&mut rand::rng());

        let mut remaining: Vec<usize> = state.containers.iter().map(Vec::len).collect();
        let mut evict = Vec::new();
        for (env_idx, container) in candidates {
            if !exceeds(&footprint, budget) {
                break;
            }
            if remaining[env_idx] <= 1 {
                continue;
            }
            remaining[env_idx] -= 1;
            subtract(&mut footprint, &container.environment.requirements);
            evict.push((env_idx, container.uuid.clone()));
        }
        evict
    }

    async fn evict(
        &self,
        sets: &mut HashMap<EnvSetId, SetState>,
        budget: &Resources,
    ) {
        let mut ids: Vec<EnvSetId> = sets.keys().cloned().collect();
        ids.sort();
        for id in ids {
            let Some(state) = sets.get_mut(&id) else {
                continue;
            };
            let evictions = Self::choose_evictions(state, budget);
            for (env_idx, uuid) in evictions {
                let containers = &mut state.containers[env_idx];
                let Some(pos) = containers.iter().position(|c| c.uuid == uuid) else {
                    continue;
                };
                let container = containers.remove(pos);
                info!(set = %id, uuid = container.uuid, "evicting container");
                if let Err(err) =
                    release_container(self.client.as_ref(), &self.machines, &container).await
                {
                    warn!(set = %id, uuid = container.uuid, "failed to evict container: {}", err);
                }
                self.metrics
                    .evictions
                    .add(1, &[KeyValue::new("allocator", "fair_share")]);
            }
        }
    }

    /// Round-robin placement over the environments of `set` until no
    /// environment fits anywhere. Returns `(env_idx, machine_idx)` pairs.
    fn place(
        &self,
        set: &EnvSet,
        sets: &HashMap<EnvSetId, SetState>,
    ) -> Result<Vec<(usize, usize)>, AllocatorError> {
        let mut free = free_capacity(
            &self.machines,
            sets.values().flat_map(|state| state.containers.iter().flatten()),
        )?;
        let mut placement = Vec::new();
        let mut counts = vec![0usize; set.environments.len()];
        loop {
            let mut progress = false;
            for (env_idx, env) in set.environments.iter().enumerate() {
                let Some(machine_idx) = free.iter().position(|f| fits(f, &env.requirements))
                else {
                    continue;
                };
                subtract(&mut free[machine_idx], &env.requirements);
                placement.push((env_idx, machine_idx));
                counts[env_idx] += 1;
                progress = true;
            }
            if !progress {
                break;
            }
        }
        if let Some(env_idx) = counts.iter().position(|count| *count == 0) {
            return Err(AllocatorError::InsufficientResources(format!(
                "environment {:?} of {}",
                set.environments[env_idx].requirements, set.id
            )));
        }
        Ok(placement)
    }
}

#[async_trait]
impl Allocator for FairShareAllocator {
    async fn allocate(&self, set: &EnvSet) -> Result<Vec<Container>, AllocatorError> {
        Self::validate(set)?;
        let mut sets = self.sets.lock().await;
        if let Some(state) = sets.get(&set.id) {
            return Ok(state.first_per_env());
        }
        let labels = [KeyValue::new("allocator", "fair_share")];
        let _timer = Timer::start_with_labels(&self.metrics.allocate_duration, &labels);

        let budget = self.budget(sets.len());
        debug!(set = %set.id, ?budget, "fair share budget");
        self.evict(&mut sets, &budget).await;

        let placement = self.place(set, &sets)?;
        let mut containers: Vec<Vec<Container>> = vec![Vec::new(); set.environments.len()];
        let mut created = Vec::with_capacity(placement.len());
        for (env_idx, machine_idx) in placement {
            let env = &set.environments[env_idx];
            info!(set = %set.id, machine = machine_idx, template = env.template, "allocating container");
            match create_container(self.client.as_ref(), &self.machines, machine_idx, env).await {
                Ok(container) => {
                    created.push(container.clone());
                    containers[env_idx].push(container);
                }
                Err(err) => {
                    rollback(self.client.as_ref(), &self.machines, &created).await;
                    return Err(err);
                }
            }
        }
        self.metrics.allocations.add(created.len() as u64, &labels);

        let state = SetState {
            cursors: vec![0; containers.len()],
            containers,
        };
        let first = state.first_per_env();
        sets.insert(set.id.clone(), state);
        Ok(first)
    }

    async fn pick(&self, id: &EnvSetId) -> Option<Vec<Container>> {
        let mut sets = self.sets.lock().await;
        let state = sets.get_mut(id)?;
        let mut picked = Vec::with_capacity(state.containers.len());
        for (containers, cursor) in state.containers.iter().zip(state.cursors.iter_mut()) {
            if containers.is_empty() {
                return None;
            }
            picked.push(containers[*cursor % containers.len()].clone());
            *cursor += 1;
        }
        Some(picked)
    }

    async fn deallocate(&self, id: &EnvSetId) -> Result<(), AllocatorError> {
        let mut sets = self.sets.lock().await;
        let Some(state) = sets.remove(id) else {
            return Ok(());
        };
        let containers: Vec<Container> = state.containers.into_iter().flatten().collect();
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
            &[KeyValue::new("allocator", "fair_share")],
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
            .map(|state| state.containers.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::allocator::testing::{env, env_set, machine, FakeMachineClient};

    #[tokio::test]
    async fn test_fills_capacity_and_is_idempotent() -> anyhow::Result<()> {
        let client = Arc::new(FakeMachineClient::default());
        let allocator = FairShareAllocator::new(vec![machine(&[("container", 4)])], client.clone());
        let set = env_set(1, vec![env(None, &[("container", 1)])]);

        let first = allocator.allocate(&set).await?;
        assert_eq!(first.len(), 1);
        assert_eq!(allocator.containers(&set.id).await[0].len(), 4);
        assert_eq!(allocator.allocate(&set).await?, first);
        assert_eq!(client.allocate_calls(), 4);
        Ok(())
    }

    #[tokio::test]
    async fn test_new_set_evicts_to_fair_share() -> anyhow::Result<()> {
        let client = Arc::new(FakeMachineClient::default());
        let allocator = FairShareAllocator::new(vec![machine(&[("container", 4)])], client.clone());
        let a = env_set(1, vec![env(None, &[("container", 1)])]);
        let b = env_set(2, vec![env(None, &[("container", 1)])]);
        allocator.allocate(&a).await?;
        allocator.allocate(&b).await?;

        assert_eq!(allocator.containers(&a.id).await[0].len(), 2);
        assert_eq!(allocator.containers(&b.id).await[0].len(), 2);
        assert_eq!(client.deallocated.lock().len(), 2);
        assert_eq!(allocator.env_sets().await, vec![a.id.clone(), b.id.clone()]);
        Ok(())
    }

    #[tokio::test]
    async fn test_eviction_keeps_one_container_per_env() -> anyhow::Result<()> {
        let client = Arc::new(FakeMachineClient::default());
        let allocator = FairShareAllocator::new(vec![machine(&[("container", 3)])], client.clone());
        let a = env_set(
            1,
            vec![env(None, &[("container", 1)]), env(Some(2), &[("container", 1)])],
        );
        allocator.allocate(&a).await?;
        assert_eq!(allocator.containers(&a.id).await.concat().len(), 3);

        // budget is 1 container per set, but `a` keeps one per environment
        let b = env_set(2, vec![env(None, &[("container", 1)])]);
        allocator.allocate(&b).await?;
        let kept = allocator.containers(&a.id).await;
        assert!(kept.iter().all(|containers| containers.len() == 1));
        assert_eq!(allocator.containers(&b.id).await[0].len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_pick_round_robin() -> anyhow::Result<()> {
        let client = Arc::new(FakeMachineClient::default());
        let allocator = FairShareAllocator::new(vec![machine(&[("container", 2)])], client.clone());
        let set = env_set(1, vec![env(None, &[("container", 1)])]);
        allocator.allocate(&set).await?;

        let mut seen = HashSet::new();
        for _ in 0..4 {
            let picked = allocator.pick(&set.id).await.expect("allocated set");
            assert_eq!(picked.len(), 1);
            seen.insert(picked[0].uuid.clone());
        }
        assert_eq!(seen.len(), 2);
        assert!(allocator.pick(&env_set(9, vec![]).id).await.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_rejects_invalid_and_unplaceable_sets() -> anyhow::Result<()> {
        let client = Arc::new(FakeMachineClient::default());
        let allocator = FairShareAllocator::new(vec![machine(&[("container", 1)])], client.clone());

        let empty = env_set(1, vec![env(None, &[])]);
        assert!(matches!(
            allocator.allocate(&empty).await,
            Err(AllocatorError::InvalidEnvironment(_))
        ));
        let negative = env_set(1, vec![env(None, &[("container", -1)])]);
        assert!(matches!(
            allocator.allocate(&negative).await,
            Err(AllocatorError::InvalidEnvironment(_))
        ));

        let gpu = env_set(
            2,
            vec![env(None, &[("container", 1)]), env(Some(3), &[("gpu", 1)])],
        );
        assert!(matches!(
            allocator.allocate(&gpu).await,
            Err(AllocatorError::InsufficientResources(_))
        ));
        assert_eq!(client.allocate_calls(), 0);
        assert!(allocator.env_sets().await.is_empty());
        Ok(())
    }
}
