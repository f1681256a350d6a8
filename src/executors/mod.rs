use std::{collections::HashMap, str::FromStr, sync::Arc};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use data_model::{Data, Environment, Node, StatsSample};
use strum::{AsRefStr, Display, EnumIter, EnumString, IntoEnumIterator};
use tracing::{error, warn};

use crate::{
    buffer::{error_buffer, read_multiple, BufferError, DataBuffer, DataReader, DataWriter},
    exec::RunContext,
};

pub mod filter_detection;
pub mod rescale_resample;

pub use filter_detection::FilterDetection;
pub use rescale_resample::RescaleResample;

/// Computes the output of one node. A container keeps one executor per node
/// and calls `run` once per execution of that node.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Starts computing and returns the buffer the output is written to.
    /// Failures are latched in the returned buffer.
    async fn run(&self, ctx: RunContext) -> Arc<dyn DataBuffer>;

    async fn close(&self) {}

    /// Executors running work outside the container report their own stats.
    fn stats(&self) -> Option<StatsSample> {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, AsRefStr, Display, EnumString, EnumIter)]
#[strum(serialize_all = "kebab-case")]
pub enum ExecutorKind {
    RescaleResample,
    FilterDetection,
}

pub type ExecutorFactory = fn(&Node) -> Result<Arc<dyn Executor>>;

#[derive(Clone)]
pub struct ExecutorMeta {
    pub factory: ExecutorFactory,
    /// Environment the node needs for itself. `None` runs it in the shared
    /// default container.
    pub environment: Option<Environment>,
    /// Whether the node accepts `width`/`height` in its configuration.
    pub handle_rescale: bool,
    /// Whether the node accepts `freq` in its configuration.
    pub handle_resample: bool,
}

impl ExecutorMeta {
    pub fn for_kind(kind: ExecutorKind) -> Self {
        match kind {
            ExecutorKind::RescaleResample => Self {
                factory: RescaleResample::create,
                environment: None,
                handle_rescale: true,
                handle_resample: true,
            },
            ExecutorKind::FilterDetection => Self {
                factory: FilterDetection::create,
                environment: None,
                handle_rescale: false,
                handle_resample: false,
            },
        }
    }
}

/// Node type to executor lookup.
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: HashMap<ExecutorKind, ExecutorMeta>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with every built-in executor.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        for kind in ExecutorKind::iter() {
            registry.register(kind, ExecutorMeta::for_kind(kind));
        }
        registry
    }

    pub fn register(&mut self, kind: ExecutorKind, meta: ExecutorMeta) {
        self.executors.insert(kind, meta);
    }

    pub fn get(&self, kind: &str) -> Option<&ExecutorMeta> {
        let kind = ExecutorKind::from_str(kind).ok()?;
        self.executors.get(&kind)
    }

    /// The dedicated environment of `node`, tagged with its id.
    pub fn environment(&self, node: &Node) -> Option<Environment> {
        let mut env = self.get(&node.kind)?.environment.clone()?;
        env.ref_id = Some(node.id);
        Some(env)
    }

    /// Rejects configuration the executor of `node` cannot honor.
    pub fn validate(&self, node: &Node) -> Result<()> {
        let meta = self
            .get(&node.kind)
            .ok_or_else(|| anyhow!("unknown executor type {}", node.kind))?;
        if node.code.trim().is_empty() {
            return Ok(());
        }
        let config: serde_json::Value = serde_json::from_str(&node.code)
            .map_err(|err| anyhow!("node {} has invalid configuration: {}", node.id, err))?;
        let has = |key: &str| config.get(key).is_some_and(|v| !v.is_null());
        if !meta.handle_rescale && (has("width") || has("height")) {
            return Err(anyhow!("{} nodes cannot rescale", node.kind));
        }
        if !meta.handle_resample && has("freq") {
            return Err(anyhow!("{} nodes cannot resample", node.kind));
        }
        Ok(())
    }

    /// Builds the executor for `node`. Nodes that cannot be built get an
    /// executor failing every run with the reason.
    pub fn create(&self, node: &Node) -> Arc<dyn Executor> {
        let created = self.validate(node).and_then(|_| {
            let meta = self
                .get(&node.kind)
                .ok_or_else(|| anyhow!("unknown executor type {}", node.kind))?;
            (meta.factory)(node)
        });
        match created {
            Ok(executor) => executor,
            Err(err) => {
                warn!(node_id = %node.id, kind = node.kind, "cannot create executor: {}", err);
                Arc::new(ErrorExecutor::new(err.to_string()))
            }
        }
    }
}

pub struct ErrorExecutor {
    message: String,
}

impl ErrorExecutor {
    pub fn new(message: String) -> Self {
        Self { message }
    }
}

#[async_trait]
impl Executor for ErrorExecutor {
    async fn run(&self, ctx: RunContext) -> Arc<dyn DataBuffer> {
        error_buffer(ctx.node.data_type, &self.message)
    }
}

/// Readers over every parent of the node, in declaration order.
pub async fn get_parents(ctx: &RunContext) -> Result<Vec<Box<dyn DataReader>>> {
    let mut readers = Vec::with_capacity(ctx.node.parents.len());
    for parent in &ctx.node.parents {
        let buf = ctx.exec.parent_buffer(parent, &ctx.services).await?;
        readers.push(buf.reader());
    }
    Ok(readers)
}

/// Reads `parents` in lock-step at `freq` over `length` base frames and
/// writes `f` of every batch to `writer`. The writer is closed once exactly
/// one record per `freq` frames was written and failed otherwise.
pub async fn per_frame<F>(
    mut parents: Vec<Box<dyn DataReader>>,
    length: usize,
    freq: usize,
    writer: Arc<dyn DataWriter>,
    mut f: F,
) where
    F: FnMut(Vec<Data>) -> Result<Data> + Send,
{
    writer.set_meta(freq);
    let mut written = 0;
    let result = read_multiple(length, freq, &mut parents, |_, batch| {
        let out = f(batch);
        if let Ok(data) = &out {
            written += data.len();
        }
        let writer = writer.clone();
        async move {
            writer.write(out?).await?;
            Ok(())
        }
    })
    .await
    .and_then(|_| {
        let expected = length.div_ceil(freq);
        if written != expected {
            return Err(anyhow!("wrote {} records, expected {}", written, expected));
        }
        Ok(())
    });
    match result {
        Ok(()) => writer.close().await,
        Err(err) => {
            error!("node computation failed: {:?}", err);
            writer.error(BufferError::failed(err)).await;
        }
    }
}


#[cfg(test)]
mod tests {
    use data_model::{test_objects::tests::mock_node, DataType, Parent};

    use super::*;

    #[test]
    fn test_registry_lookup() {
        let registry = ExecutorRegistry::builtin();
        assert!(registry.get("rescale-resample").is_some());
        assert!(registry.get("filter-detection").is_some());
        assert!(registry.get("yolo").is_none());
        assert_eq!(ExecutorKind::FilterDetection.to_string(), "filter-detection");

        let node = mock_node(3, "filter-detection", DataType::Detection, vec![Parent::Series(0)]);
        assert!(registry.environment(&node).is_none());
    }

    #[test]
    fn test_validate_configuration() {
        struct Case {
            description: &'static str,
            kind: &'static str,
            code: &'static str,
            valid: bool,
        }
        let cases = vec![
            Case {
                description: "empty configuration",
                kind: "filter-detection",
                code: "",
                valid: true,
            },
            Case {
                description: "rescale on a rescaling node",
                kind: "rescale-resample",
                code: r#"{"width": 320, "height": 240}"#,
                valid: true,
            },
            Case {
                description: "rescale on a filter",
                kind: "filter-detection",
                code: r#"{"width": 320, "height": 240}"#,
                valid: false,
            },
            Case {
                description: "resample on a filter",
                kind: "filter-detection",
                code: r#"{"freq": 5, "score": 0.5}"#,
                valid: false,
            },
            Case {
                description: "malformed json",
                kind: "filter-detection",
                code: "{score",
                valid: false,
            },
            Case {
                description: "unknown type",
                kind: "yolo",
                code: "",
                valid: false,
            },
        ];
        let registry = ExecutorRegistry::builtin();
        for case in cases {
            let mut node = mock_node(1, case.kind, DataType::Detection, vec![Parent::Series(0)]);
            node.code = case.code.to_string();
            assert_eq!(
                registry.validate(&node).is_ok(),
                case.valid,
                "{}",
                case.description
            );
        }
    }

    #[tokio::test]
    async fn test_unknown_type_fails_runs() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let store = Arc::new(crate::items::ItemStore::for_path(temp_dir.path())?);
        let node = mock_node(1, "yolo", DataType::Class, vec![]);
        let executor = ExecutorRegistry::builtin().create(&node);

        let slice = data_model::Slice::new(data_model::test_objects::tests::mock_segment(1, 10), 0, 10)?;
        let ctx = testing::run_context(store, node, vec![], vec![], slice);
        let buf = executor.run(ctx).await;
        let err = buf.reader().read(1).await.unwrap_err();
        assert!(matches!(err, BufferError::Failed(msg) if msg.contains("yolo")));
        Ok(())
    }
}
