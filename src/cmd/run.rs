use std::{
    collections::{HashMap, VecDeque},
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{anyhow, Result};
use clap::Args;
use data_model::{ExecOptions, Item, NodeId, Query, Series, Slice, StatsSample};
use parking_lot::Mutex;
use rand::Rng;
use serde::Deserialize;
use tokio::{io::AsyncWriteExt, sync::mpsc};
use tracing::{debug, error, info, warn};

use super::item_store;
use crate::{
    allocator::{new_allocator, Allocator, HttpMachineClient},
    buffer::{read_all, DataBuffer},
    config::Config,
    exec::{
        stream::{Callback, Sampler},
        ExecStream,
        QueryRunner,
        Services,
        StreamError,
    },
    executors::ExecutorRegistry,
};

#[derive(Args, Debug)]
pub struct RunArgs {
    /// YAML or JSON file with the query, its vector and run options.
    #[arg(long)]
    pub definition: PathBuf,
    /// Number of slices to compute.
    #[arg(short = 'n', long, default_value_t = 1)]
    pub count: usize,
    #[arg(long, default_value = "outputs")]
    pub output_dir: PathBuf,
    /// Walk the stored slices in order instead of sampling at random.
    #[arg(long)]
    pub sequential: bool,
    /// Overrides `exec.slice_length` from the config.
    #[arg(long)]
    pub slice_length: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct RunDefinition {
    pub query: Query,
    pub vector: Vec<Series>,
    #[serde(default)]
    pub options: ExecOptions,
}

impl RunDefinition {
    pub fn from_path(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|err| anyhow!("unable to read {}: {}", path.display(), err))?;
        Self::parse(&raw)
    }

    /// YAML is a superset of JSON, so both parse here.
    pub fn parse(raw: &str) -> Result<Self> {
        let definition: RunDefinition = serde_yaml::from_str(raw)?;
        if definition.vector.is_empty() {
            return Err(anyhow!("the vector needs at least one series"));
        }
        definition.query.validate()?;
        Ok(definition)
    }
}

/// Samples slices of `length` frames from the stored `items`.
pub fn slice_sampler(items: Vec<Item>, length: usize, sequential: bool) -> Sampler {
    if sequential {
        let mut slices = VecDeque::new();
        for item in &items {
            let mut start = item.slice.start;
            while start < item.slice.end {
                let end = (start + length).min(item.slice.end);
                if let Ok(slice) = Slice::new(item.slice.segment.clone(), start, end) {
                    slices.push_back(slice);
                }
                start = end;
            }
        }
        let slices = Mutex::new(slices);
        return Arc::new(move || slices.lock().pop_front());
    }
    Arc::new(move || {
        if items.is_empty() {
            return None;
        }
        let mut rng = rand::rng();
        let item = &items[rng.random_range(0..items.len())];
        let whole = &item.slice;
        if whole.len() <= length {
            return Some(whole.clone());
        }
        let start = rng.random_range(whole.start..=whole.end - length);
        Slice::new(whole.segment.clone(), start, start + length).ok()
    })
}

pub async fn execute(args: RunArgs, config: Config) -> Result<()> {
    let definition = RunDefinition::from_path(&args.definition)?;
    let store = item_store(&config)?;
    let services = Services::new(store.clone());
    let allocator = new_allocator(
        config.allocator,
        config.machines.clone(),
        Arc::new(HttpMachineClient::new()),
    );
    let registry = ExecutorRegistry::builtin();

    let items = store.list_items(&definition.vector[0]).await?;
    if items.is_empty() {
        return Err(anyhow!(
            "series {} has no stored items to sample",
            definition.vector[0].name
        ));
    }
    let length = args.slice_length.unwrap_or(config.exec.slice_length);
    let sampler = slice_sampler(items, length, args.sequential);

    let node_names: HashMap<NodeId, String> = definition
        .query
        .nodes
        .values()
        .map(|node| (node.id, node.name.clone()))
        .collect();
    let runner = Arc::new(QueryRunner::new(
        definition.query,
        definition.vector,
        definition.options,
        allocator.clone(),
        services.clone(),
        &registry,
    )?);
    tokio::fs::create_dir_all(&args.output_dir).await?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let callback: Callback<Vec<Vec<Arc<dyn DataBuffer>>>> = Arc::new(move |slice, result| {
        let _ = tx.send((slice, result));
    });
    let stream = ExecStream::new(runner.clone(), sampler, config.exec.per_iter, callback);
    stream.get(args.count);

    let mut delivered = 0;
    let mut failures = 0;
    while delivered < args.count {
        let Some((slice, result)) = rx.recv().await else {
            break;
        };
        let slice = slice.map(|s| s.to_string()).unwrap_or_default();
        match result {
            Err(StreamError::Rejected) => {
                debug!(slice, "slice rejected, sampling another");
                continue;
            }
            Ok(groups) => {
                if let Err(err) = write_outputs(&args.output_dir, delivered, groups).await {
                    error!(slice, "failed to write outputs: {:?}", err);
                    failures += 1;
                } else {
                    info!(slice, index = delivered, "wrote outputs");
                }
            }
            Err(err) => {
                error!(slice, "slice failed: {}", err);
                failures += 1;
            }
        }
        delivered += 1;
    }
    stream.close();
    stream.wait().await;

    log_stats(allocator.as_ref(), runner.as_ref(), &services, &node_names).await;
    runner.release().await?;
    if failures > 0 {
        return Err(anyhow!("{} of {} slices failed", failures, args.count));
    }
    Ok(())
}

async fn write_outputs(dir: &Path, index: usize, groups: Vec<Vec<Arc<dyn DataBuffer>>>) -> Result<()> {
    for (g, group) in groups.into_iter().enumerate() {
        for (p, buf) in group.into_iter().enumerate() {
            let name = format!("{index:04}_g{g}_{p}");
            if let Some(view) = buf.as_video() {
                let mut file = tokio::fs::File::create(dir.join(format!("{name}.mp4"))).await?;
                view.read_mp4(&mut file).await?;
                file.flush().await?;
                continue;
            }
            let mut reader = buf.reader();
            let data = read_all(reader.as_mut()).await?;
            tokio::fs::write(dir.join(format!("{name}.json")), data.encode()?).await?;
        }
    }
    Ok(())
}

async fn log_stats(
    allocator: &dyn Allocator,
    runner: &QueryRunner,
    services: &Services,
    node_names: &HashMap<NodeId, String>,
) {
    let containers = allocator.containers(&runner.env_set().id).await;
    for container in containers.into_iter().flatten() {
        let resp = services
            .client
            .post(format!("{}/allstats", container.base_url))
            .send()
            .await;
        let stats = match resp {
            Ok(resp) => resp.json::<HashMap<NodeId, StatsSample>>().await,
            Err(err) => Err(err),
        };
        let stats = match stats {
            Ok(stats) => stats,
            Err(err) => {
                warn!(container = container.uuid, "failed to fetch stats: {}", err);
                continue;
            }
        };
        for (node_id, sample) in stats {
            info!(
                container = container.uuid,
                node = node_names.get(&node_id).map(String::as_str).unwrap_or("?"),
                runs = sample.time.count,
                avg_ms = sample.time.t.as_millis() as u64,
                "node stats"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use data_model::{
        test_objects::tests::{mock_segment, mock_series},
        DataType,
        ItemFormat,
    };

    use super::*;

    fn item(frames: usize) -> Item {
        let segment = mock_segment(1, frames);
        Item {
            key: "series/1/1_0_100.json".to_string(),
            slice: segment.to_slice(),
            series: mock_series(1, DataType::Int),
            format: ItemFormat::Json,
            width: 0,
            height: 0,
            freq: 1,
        }
    }

    #[test]
    fn test_sequential_sampler_exhausts() {
        let sampler = slice_sampler(vec![item(100)], 40, true);
        let slices: Vec<Slice> = std::iter::from_fn(|| sampler()).collect();
        let ranges: Vec<(usize, usize)> = slices.iter().map(|s| (s.start, s.end)).collect();
        assert_eq!(ranges, vec![(0, 40), (40, 80), (80, 100)]);
        assert!(sampler().is_none());
    }

    #[test]
    fn test_random_sampler_stays_in_item() {
        let sampler = slice_sampler(vec![item(100)], 30, false);
        for _ in 0..100 {
            let slice = sampler().unwrap();
            assert_eq!(slice.len(), 30);
            assert!(slice.end <= 100);
        }
        let short = slice_sampler(vec![item(10)], 30, false);
        assert_eq!(short().unwrap().len(), 10);
        assert!(slice_sampler(vec![], 30, false)().is_none());
    }

    #[test]
    fn test_parse_definition() -> Result<()> {
        let definition = RunDefinition::parse(
            r#"
query:
  id: 4
  name: cars
  nodes:
    1:
      id: 1
      name: cars
      type: filter-detection
      data_type: detection
      parents: [s0]
      code: '{"classes": ["car"]}'
      query_id: 4
  outputs: [[s1, n1]]
  selector: 1
vector:
  - id: 10
    timeline: {id: 1, name: main}
    name: video
    data_type: video
  - id: 11
    timeline: {id: 1, name: main}
    name: detections
    data_type: detection
options:
  persist_video: true
"#,
        )?;
        assert_eq!(definition.vector.len(), 2);
        assert_eq!(definition.query.selector, Some(NodeId(1)));
        assert!(definition.options.persist_video);

        assert!(RunDefinition::parse("query: {id: 1, name: q, nodes: {}, outputs: []}\nvector: []").is_err());
        Ok(())
    }
}
