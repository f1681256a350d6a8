use std::{collections::HashMap, net::SocketAddr, sync::Arc};

use anyhow::{anyhow, Result};
use axum_server::Handle;
use dashmap::DashMap;
use data_model::{DataType, Node, NodeId, StatsSample, TimeStats};
use futures::TryStreamExt;
use itertools::Itertools;
use metrics::{create_timed_future, stats::StatsHolder, ExecMetrics};
use opentelemetry::KeyValue;
use tokio::{io::AsyncReadExt, sync::OnceCell};
use tokio_util::io::ReaderStream;
use tracing::{debug, error, info, warn};

use crate::{
    buffer::{read_all, DataBuffer},
    exec::{ExecContext, RunContext, Services},
    executors::{Executor, ExecutorRegistry},
    items::ItemStore,
    service::shutdown_signal,
};

mod routes;

pub use routes::create_routes;

type RunKey = (String, NodeId);

/// Node executors of one worker container and the outputs of the runs in
/// flight.
pub struct ContainerState {
    registry: ExecutorRegistry,
    services: Services,
    executors: DashMap<NodeId, Arc<dyn Executor>>,
    runs: DashMap<RunKey, Arc<OnceCell<Arc<dyn DataBuffer>>>>,
    stats: DashMap<NodeId, Arc<StatsHolder>>,
    metrics: ExecMetrics,
}

impl ContainerState {
    pub fn new(registry: ExecutorRegistry, store: Arc<ItemStore>) -> Self {
        Self {
            registry,
            services: Services::new(store),
            executors: DashMap::new(),
            runs: DashMap::new(),
            stats: DashMap::new(),
            metrics: ExecMetrics::new(),
        }
    }

    fn executor(&self, node: &Node) -> Arc<dyn Executor> {
        self.executors
            .entry(node.id)
            .or_insert_with(|| self.registry.create(node))
            .clone()
    }

    /// The output buffer of `node_id` in the run `ctx`. Concurrent callers
    /// for the same run and node share one computation.
    pub async fn get_buffer(&self, ctx: ExecContext, node_id: NodeId) -> Result<Arc<dyn DataBuffer>> {
        let node = ctx.node(node_id)?.clone();
        let cell = self
            .runs
            .entry((ctx.uuid.clone(), node_id))
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();
        let buf = cell
            .get_or_init(|| self.start(Arc::new(ctx), node))
            .await
            .clone();
        Ok(buf)
    }

    async fn start(&self, ctx: Arc<ExecContext>, node: Node) -> Arc<dyn DataBuffer> {
        info!(uuid = ctx.uuid, node_id = %node.id, kind = node.kind, "starting node");
        let executor = self.executor(&node);
        let labels = [KeyValue::new("kind", node.kind.clone())];
        self.metrics.node_runs.add(1, &labels);

        let buf = executor
            .run(RunContext {
                exec: ctx.clone(),
                node: node.clone(),
                services: self.services.clone(),
            })
            .await;

        let holder = self.stats.entry(node.id).or_default().clone();
        let histogram = self.metrics.node_run_duration.clone();
        let waited = buf.clone();
        let node_id = node.id;
        tokio::spawn(async move {
            let result = create_timed_future(waited.wait(), move |elapsed| {
                holder.add(StatsSample {
                    time: TimeStats {
                        t: elapsed,
                        count: 1,
                    },
                    ..Default::default()
                });
                histogram.record(elapsed.as_secs_f64(), &labels);
            })
            .await;
            if let Err(err) = result {
                warn!(node_id = %node_id, "node output failed: {}", err);
            }
        });

        if self.should_persist(&ctx, &node) {
            let store = self.services.store.clone();
            let buf = buf.clone();
            tokio::spawn(async move {
                if let Err(err) = persist(store, &ctx, &node, buf).await {
                    error!(node_id = %node.id, "failed to persist node output: {:?}", err);
                }
            });
        }
        buf
    }

    fn should_persist(&self, ctx: &ExecContext, node: &Node) -> bool {
        if ctx.opts.no_persist || ctx.opts.tuning || ctx.items.contains_key(&node.id) {
            return false;
        }
        node.data_type != DataType::Video || ctx.opts.persist_video
    }

    /// Forgets the buffers of run `uuid`. Readers already streaming them are
    /// unaffected.
    pub fn finish(&self, uuid: &str) {
        self.runs.retain(|(run, _), _| run != uuid);
        debug!(uuid, active = self.active_runs(), "finished run");
    }

    pub fn active_runs(&self) -> usize {
        self.runs.len()
    }

    pub fn node_stats(&self, node_id: NodeId) -> Option<StatsSample> {
        if let Some(stats) = self.executors.get(&node_id).and_then(|e| e.stats()) {
            return Some(stats);
        }
        self.stats.get(&node_id).map(|holder| holder.get())
    }

    pub fn all_stats(&self) -> HashMap<NodeId, StatsSample> {
        let ids: Vec<NodeId> = self
            .stats
            .iter()
            .map(|e| *e.key())
            .chain(self.executors.iter().map(|e| *e.key()))
            .unique()
            .collect();
        ids.into_iter()
            .filter_map(|id| Some((id, self.node_stats(id)?)))
            .collect()
    }

    pub async fn close(&self) {
        let executors: Vec<Arc<dyn Executor>> =
            self.executors.iter().map(|e| e.value().clone()).collect();
        for executor in executors {
            executor.close().await;
        }
        self.executors.clear();
        self.runs.clear();
    }
}

/// Stores the complete output of `node` as an item of its output series.
async fn persist(
    store: Arc<ItemStore>,
    ctx: &ExecContext,
    node: &Node,
    buf: Arc<dyn DataBuffer>,
) -> Result<()> {
    if let Some(view) = buf.as_video() {
        let view = view.clone();
        let mut item = store.add_output_item(node, &ctx.vector, &ctx.slice, view.freq().await?);
        [item.width, item.height] = view.dims().await?;
        let (mut tx, rx) = tokio::io::duplex(64 * 1024);
        let encode = tokio::spawn(async move { view.read_mp4(&mut tx).await });
        let stream = ReaderStream::new(rx).map_err(anyhow::Error::from);
        store.write_video(&item, Box::pin(stream)).await?;
        encode.await??;
        return Ok(());
    }
    let mut reader = buf.reader();
    let freq = reader.freq().await?;
    let data = read_all(reader.as_mut()).await?;
    let item = store.add_output_item(node, &ctx.vector, &ctx.slice, freq);
    store.write_data(&item, &data).await
}

/// Runs a worker container until its stdin closes or a shutdown signal
/// arrives.
pub async fn run(listen_addr: SocketAddr, state: Arc<ContainerState>) -> Result<()> {
    let handle = Handle::new();
    let (shutdown_tx, _) = tokio::sync::watch::channel(());
    tokio::spawn(shutdown_signal(handle.clone(), shutdown_tx));

    let stdin_handle = handle.clone();
    let stdin_state = state.clone();
    tokio::spawn(async move {
        let mut stdin = tokio::io::stdin();
        let mut buf = [0u8; 1024];
        loop {
            match stdin.read(&mut buf).await {
                Ok(0) => break,
                Ok(_) => continue,
                Err(err) => {
                    warn!("error reading stdin: {:?}", err);
                    break;
                }
            }
        }
        info!("stdin closed, stopping container");
        stdin_state.close().await;
        stdin_handle.shutdown();
    });

    info!("container listening on {}", listen_addr);
    axum_server::bind(listen_addr)
        .handle(handle)
        .serve(create_routes(state).into_make_service())
        .await
        .map_err(|err| anyhow!("container server failed: {}", err))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use data_model::{
        test_objects::tests::{mock_node, mock_segment, mock_series},
        Container,
        Data,
        Environment,
        ExecOptions,
        Parent,
        Slice,
    };

    use super::*;

    struct TestContainer {
        _temp_dir: tempfile::TempDir,
        state: Arc<ContainerState>,
        store: Arc<ItemStore>,
        base_url: String,
    }

    async fn start_container() -> Result<TestContainer> {
        let temp_dir = tempfile::tempdir()?;
        let store = Arc::new(ItemStore::for_path(temp_dir.path())?);
        let state = Arc::new(ContainerState::new(ExecutorRegistry::builtin(), store.clone()));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let base_url = format!("http://{}", listener.local_addr()?);
        let routes = create_routes(state.clone());
        tokio::spawn(async move { axum::serve(listener, routes).await });
        Ok(TestContainer {
            _temp_dir: temp_dir,
            state,
            store,
            base_url,
        })
    }

    async fn resample_context(c: &TestContainer, opts: ExecOptions) -> Result<ExecContext> {
        let slice = Slice::new(mock_segment(1, 100), 0, 20)?;
        let series = mock_series(1, DataType::Int);
        let input = c
            .store
            .ingest_data(&series, &slice, 1, &serde_json::to_vec(&(0..20).collect::<Vec<i64>>())?)
            .await?;
        let mut node = mock_node(7, "rescale-resample", DataType::Int, vec![Parent::Series(0)]);
        node.code = r#"{"freq": 5}"#.to_string();
        let container = Container {
            uuid: "c1".to_string(),
            environment: Environment::default_env(),
            base_url: c.base_url.clone(),
            machine_idx: 0,
        };
        Ok(ExecContext {
            uuid: uuid::Uuid::new_v4().to_string(),
            nodes: HashMap::from([(node.id, node)]),
            routes: HashMap::from([(NodeId(7), container)]),
            items: HashMap::new(),
            vector: vec![series],
            inputs: vec![input],
            slice,
            opts,
        })
    }

    #[tokio::test]
    async fn test_start_dedup_and_finish() -> Result<()> {
        let c = start_container().await?;
        let opts = ExecOptions {
            no_persist: true,
            ..Default::default()
        };
        let ctx = resample_context(&c, opts).await?;
        let services = Services::new(c.store.clone());

        let mut first = ctx.get_reader(NodeId(7), &services).await?;
        let mut second = ctx.get_reader(NodeId(7), &services).await?;
        let expected = Data::Int(vec![0, 5, 10, 15]);
        assert_eq!(read_all(first.as_mut()).await?, expected);
        assert_eq!(read_all(second.as_mut()).await?, expected);
        assert_eq!(c.state.active_runs(), 1);

        let resp = services
            .client
            .post(format!("{}/query/finish", c.base_url))
            .query(&[("uuid", ctx.uuid.as_str())])
            .send()
            .await?;
        assert!(resp.status().is_success());
        assert_eq!(c.state.active_runs(), 0);

        let mut stats = HashMap::new();
        for _ in 0..50 {
            stats = services
                .client
                .post(format!("{}/allstats", c.base_url))
                .send()
                .await?
                .json::<HashMap<NodeId, StatsSample>>()
                .await?;
            if stats.get(&NodeId(7)).is_some_and(|s| s.time.count > 0) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(stats[&NodeId(7)].time.count, 1);

        let resp = services
            .client
            .post(format!("{}/stats", c.base_url))
            .query(&[("node_id", 7)])
            .send()
            .await?;
        assert_eq!(resp.json::<StatsSample>().await?.time.count, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_unknown_node_and_persistence() -> Result<()> {
        let c = start_container().await?;
        let ctx = resample_context(&c, ExecOptions::default()).await?;
        let services = Services::new(c.store.clone());

        let resp = services
            .client
            .post(format!("{}/query/start", c.base_url))
            .query(&[("node_id", 99)])
            .json(&ctx)
            .send()
            .await?;
        assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);

        let mut reader = ctx.get_reader(NodeId(7), &services).await?;
        assert_eq!(read_all(reader.as_mut()).await?.len(), 4);

        let node = &ctx.nodes[&NodeId(7)];
        let mut item = None;
        for _ in 0..50 {
            item = c.store.output_item(node, &ctx.vector, &ctx.slice).await?;
            if item.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let item = item.ok_or_else(|| anyhow!("output was not persisted"))?;
        assert_eq!(item.freq, 5);
        Ok(())
    }

    #[tokio::test]
    async fn test_unknown_executor_streams_error() -> Result<()> {
        let c = start_container().await?;
        let mut ctx = resample_context(&c, ExecOptions::default()).await?;
        if let Some(node) = ctx.nodes.get_mut(&NodeId(7)) {
            node.kind = "yolo".to_string();
        }
        let services = Services::new(c.store.clone());
        let mut reader = ctx.get_reader(NodeId(7), &services).await?;
        assert!(read_all(reader.as_mut()).await.is_err());
        Ok(())
    }
}
