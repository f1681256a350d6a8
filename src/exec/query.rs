use std::{collections::HashMap, sync::Arc};

use anyhow::anyhow;
use async_trait::async_trait;
use data_model::{
    Container,
    EnvSet,
    EnvSetId,
    Environment,
    ExecOptions,
    NodeId,
    Query,
    Series,
    Slice,
};
use opentelemetry::KeyValue;
use tracing::{debug, error, info};

use super::{ExecContext, Services, SliceRunner};
use crate::{
    allocator::Allocator,
    buffer::{read_all, DataBuffer},
    executors::ExecutorRegistry,
};

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    /// The selector produced no output for the slice. Not a failure; the
    /// caller should try another slice.
    #[error("selector rejected the slice")]
    SelectorReject,
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

/// The shared default environment plus one environment per node whose
/// executor needs its own.
pub fn get_environment_set(query: &Query, registry: &ExecutorRegistry) -> EnvSet {
    let mut environments = vec![Environment::default_env()];
    let mut ids: Vec<&NodeId> = query.nodes.keys().collect();
    ids.sort();
    for id in ids {
        if let Some(env) = registry.environment(&query.nodes[id]) {
            environments.push(env);
        }
    }
    EnvSet {
        id: EnvSetId::query(query.id),
        environments,
    }
}

/// Runs one query over slices of a vector on allocated containers.
pub struct QueryRunner {
    query: Query,
    vector: Vec<Series>,
    opts: ExecOptions,
    allocator: Arc<dyn Allocator>,
    services: Services,
    env_set: EnvSet,
    metrics: metrics::ExecMetrics,
}

impl QueryRunner {
    pub fn new(
        query: Query,
        vector: Vec<Series>,
        opts: ExecOptions,
        allocator: Arc<dyn Allocator>,
        services: Services,
        registry: &ExecutorRegistry,
    ) -> anyhow::Result<Self> {
        query.validate()?;
        let env_set = get_environment_set(&query, registry);
        Ok(Self {
            query,
            vector,
            opts,
            allocator,
            services,
            env_set,
            metrics: metrics::ExecMetrics::new(),
        })
    }

    pub fn env_set(&self) -> &EnvSet {
        &self.env_set
    }

    /// Routes every node to a container, looks up persisted outputs and
    /// resolves the vector's input items for `slice`.
    pub async fn allocate(&self, slice: &Slice) -> anyhow::Result<ExecContext> {
        let allocated = self.allocator.allocate(&self.env_set).await?;
        let containers = self
            .allocator
            .pick(&self.env_set.id)
            .await
            .unwrap_or(allocated);
        let mut default: Option<Container> = None;
        let mut dedicated: HashMap<NodeId, Container> = HashMap::new();
        for container in containers {
            match container.environment.ref_id {
                Some(node_id) => {
                    dedicated.insert(node_id, container);
                }
                None => default = Some(container),
            }
        }
        let default =
            default.ok_or_else(|| anyhow!("no default container for {}", self.env_set.id))?;
        let routes = self
            .query
            .nodes
            .keys()
            .map(|id| {
                let container = dedicated.get(id).unwrap_or(&default).clone();
                (*id, container)
            })
            .collect();

        let mut items = HashMap::new();
        if !self.opts.ignore_items && !self.opts.tuning {
            for node in self.query.nodes.values() {
                if let Some(item) = self
                    .services
                    .store
                    .output_item(node, &self.vector, slice)
                    .await?
                {
                    items.insert(node.id, item);
                }
            }
        }

        let mut inputs = Vec::with_capacity(self.vector.len());
        for series in &self.vector {
            match self.services.store.series_item(series, slice).await? {
                Some(item) => inputs.push(item),
                None => {
                    error!(series = series.name, slice = %slice, "missing input item");
                    return Err(anyhow!(
                        "series {} has no item covering {}",
                        series.name,
                        slice
                    ));
                }
            }
        }

        Ok(ExecContext {
            uuid: uuid::Uuid::new_v4().to_string(),
            nodes: self.query.nodes.clone(),
            routes,
            items,
            vector: self.vector.clone(),
            inputs,
            slice: slice.clone(),
            opts: self.opts.clone(),
        })
    }

    /// Buffers for every output group, after the selector accepted `slice`.
    pub async fn run_buffer(
        &self,
        slice: &Slice,
    ) -> Result<Vec<Vec<Arc<dyn DataBuffer>>>, RunError> {
        let ctx = self.allocate(slice).await?;
        debug!(uuid = ctx.uuid, slice = %slice, "running query");

        let selector = if self.opts.no_selector {
            None
        } else {
            self.opts.selector.or(self.query.selector)
        };
        let outputs = self.run_context(&ctx, selector).await;
        ctx.finish(&self.services).await;
        outputs
    }

    async fn run_context(
        &self,
        ctx: &ExecContext,
        selector: Option<NodeId>,
    ) -> Result<Vec<Vec<Arc<dyn DataBuffer>>>, RunError> {
        if let Some(id) = selector {
            let mut reader = ctx.get_reader(id, &self.services).await?;
            let data = read_all(reader.as_mut()).await;
            reader.close().await;
            let data = data.map_err(|err| anyhow!("selector {} failed: {}", id, err))?;
            if data.is_empty() {
                debug!(slice = %ctx.slice, "selector rejected slice");
                return Err(RunError::SelectorReject);
            }
        }

        let groups = self
            .opts
            .outputs
            .clone()
            .unwrap_or_else(|| self.query.outputs.clone());
        let mut outputs = Vec::with_capacity(groups.len());
        for group in groups {
            let mut buffers = Vec::with_capacity(group.len());
            for parent in &group {
                buffers.push(ctx.parent_buffer(parent, &self.services).await?);
            }
            outputs.push(buffers);
        }
        Ok(outputs)
    }

    /// Releases the containers of this query.
    pub async fn release(&self) -> anyhow::Result<()> {
        info!(set = %self.env_set.id, "releasing query containers");
        self.allocator.deallocate(&self.env_set.id).await?;
        Ok(())
    }
}

#[async_trait]
impl SliceRunner for QueryRunner {
    type Output = Vec<Vec<Arc<dyn DataBuffer>>>;

    async fn run_slice(&self, slice: &Slice) -> Result<Self::Output, RunError> {
        let outcome = self.run_buffer(slice).await;
        let label = match &outcome {
            Ok(_) => "accepted",
            Err(RunError::SelectorReject) => "rejected",
            Err(RunError::Failed(_)) => "failed",
        };
        self.metrics
            .slices
            .add(1, &[KeyValue::new("outcome", label)]);
        outcome
    }
}

#[cfg(test)]
mod tests {
    use data_model::{
        test_objects::tests::{mock_node, mock_query, mock_segment, mock_series},
        Data,
        DataType,
        Parent,
    };

    use super::*;
    use crate::{
        allocator::{
            testing::{machine, FakeMachineClient},
            MinimalAllocator,
        },
        executors::{ExecutorKind, ExecutorMeta, ExecutorRegistry},
        items::ItemStore,
    };

    fn gpu_registry() -> ExecutorRegistry {
        let mut registry = ExecutorRegistry::builtin();
        let mut meta = ExecutorMeta::for_kind(ExecutorKind::FilterDetection);
        meta.environment = Some(Environment {
            template: "gpu".to_string(),
            requirements: [("gpu".to_string(), 1), ("container".to_string(), 1)].into(),
            ref_id: None,
        });
        registry.register(ExecutorKind::FilterDetection, meta);
        registry
    }

    #[test]
    fn test_environment_set() {
        let query = mock_query(vec![
            mock_node(1, "rescale-resample", DataType::Video, vec![Parent::Series(0)]),
            mock_node(2, "filter-detection", DataType::Detection, vec![Parent::Series(1)]),
        ]);
        let set = get_environment_set(&query, &ExecutorRegistry::builtin());
        assert_eq!(set.environments, vec![Environment::default_env()]);
        assert_eq!(set.id, EnvSetId::query(query.id));

        let set = get_environment_set(&query, &gpu_registry());
        assert_eq!(set.environments.len(), 2);
        assert_eq!(set.environments[1].ref_id, Some(NodeId(2)));
    }

    #[tokio::test]
    async fn test_allocate_routes_and_items() -> anyhow::Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let store = Arc::new(ItemStore::for_path(temp_dir.path())?);
        let services = Services::new(store.clone());

        let segment = mock_segment(1, 100);
        let slice = Slice::new(segment.clone(), 0, 10)?;
        let vector = vec![mock_series(1, DataType::Int), mock_series(2, DataType::Detection)];
        store
            .ingest_data(&vector[0], &slice, 1, &serde_json::to_vec(&vec![1; 10])?)
            .await?;
        store
            .ingest_data(&vector[1], &slice, 5, br#"[{"detections":[]},{"detections":[]}]"#)
            .await?;

        let query = mock_query(vec![
            mock_node(1, "rescale-resample", DataType::Int, vec![Parent::Series(0)]),
            mock_node(2, "filter-detection", DataType::Detection, vec![Parent::Series(1)]),
        ]);
        let persisted = store.add_output_item(&query.nodes[&NodeId(1)], &vector, &slice, 1);
        store.write_data(&persisted, &Data::Int(vec![0; 10])).await?;

        let client = Arc::new(FakeMachineClient::default());
        let allocator = Arc::new(MinimalAllocator::new(
            vec![machine(&[("container", 4), ("gpu", 1)])],
            client.clone(),
        ));
        let runner = QueryRunner::new(
            query,
            vector.clone(),
            ExecOptions::default(),
            allocator.clone(),
            services.clone(),
            &gpu_registry(),
        )?;
        let ctx = runner.allocate(&slice).await?;
        assert_eq!(client.allocate_calls(), 2);
        assert_ne!(ctx.routes[&NodeId(1)].uuid, ctx.routes[&NodeId(2)].uuid);
        assert!(ctx.routes[&NodeId(1)].environment.is_default());
        assert_eq!(ctx.items.len(), 1);
        assert!(ctx.items.contains_key(&NodeId(1)));
        assert_eq!(ctx.inputs.len(), 2);

        // a second run reuses the allocated containers
        let again = runner.allocate(&slice).await?;
        assert_eq!(client.allocate_calls(), 2);
        assert_ne!(again.uuid, ctx.uuid);

        let missing = Slice::new(segment, 50, 60)?;
        assert!(runner.allocate(&missing).await.is_err());

        runner.release().await?;
        assert!(allocator.env_sets().await.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_tuning_ignores_items() -> anyhow::Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let store = Arc::new(ItemStore::for_path(temp_dir.path())?);
        let slice = Slice::new(mock_segment(1, 100), 0, 10)?;
        let vector = vec![mock_series(1, DataType::Int)];
        store
            .ingest_data(&vector[0], &slice, 1, &serde_json::to_vec(&vec![1; 10])?)
            .await?;
        let query = mock_query(vec![mock_node(
            1,
            "rescale-resample",
            DataType::Int,
            vec![Parent::Series(0)],
        )]);
        let persisted = store.add_output_item(&query.nodes[&NodeId(1)], &vector, &slice, 1);
        store.write_data(&persisted, &Data::Int(vec![0; 10])).await?;

        let allocator = Arc::new(MinimalAllocator::new(
            vec![machine(&[("container", 1)])],
            Arc::new(FakeMachineClient::default()),
        ));
        let opts = ExecOptions {
            tuning: true,
            ..Default::default()
        };
        let runner = QueryRunner::new(
            query,
            vector,
            opts,
            allocator,
            Services::new(store),
            &ExecutorRegistry::builtin(),
        )?;
        assert!(runner.allocate(&slice).await?.items.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_run_buffer_outputs_series_and_items() -> anyhow::Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let store = Arc::new(ItemStore::for_path(temp_dir.path())?);
        let slice = Slice::new(mock_segment(1, 100), 0, 10)?;
        let vector = vec![mock_series(1, DataType::Int)];
        store
            .ingest_data(&vector[0], &slice, 1, &serde_json::to_vec(&vec![1; 10])?)
            .await?;
        let mut query = mock_query(vec![mock_node(
            1,
            "rescale-resample",
            DataType::Int,
            vec![Parent::Series(0)],
        )]);
        query.selector = Some(NodeId(1));
        let node = query.nodes[&NodeId(1)].clone();

        let allocator = Arc::new(MinimalAllocator::new(
            vec![machine(&[("container", 1)])],
            Arc::new(FakeMachineClient::default()),
        ));
        let runner = QueryRunner::new(
            query,
            vector.clone(),
            ExecOptions::default(),
            allocator,
            Services::new(store.clone()),
            &ExecutorRegistry::builtin(),
        )?;

        // an all-zero selector output rejects the slice
        let persisted = store.add_output_item(&node, &vector, &slice, 1);
        store.write_data(&persisted, &Data::Int(vec![0; 10])).await?;
        assert!(matches!(
            runner.run_slice(&slice).await,
            Err(RunError::SelectorReject)
        ));

        store.write_data(&persisted, &Data::Int(vec![0, 1, 0, 0, 0, 0, 0, 0, 0, 0])).await?;
        let outputs = runner.run_slice(&slice).await?;
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].len(), 2);
        let series = read_all(outputs[0][0].reader().as_mut()).await?;
        assert_eq!(series, Data::Int(vec![1; 10]));
        let node_output = read_all(outputs[0][1].reader().as_mut()).await?;
        assert_eq!(node_output.len(), 10);
        Ok(())
    }
}
