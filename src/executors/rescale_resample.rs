use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use data_model::{DataType, Node};
use serde::Deserialize;
use tracing::debug;

use super::{get_parents, per_frame, Executor};
use crate::{
    buffer::{error_buffer, new_writer, DataBuffer, DataReader},
    exec::RunContext,
};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RescaleResampleConfig {
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    /// Output frequency. Defaults to the parent's.
    #[serde(default)]
    pub freq: Option<usize>,
}

impl RescaleResampleConfig {
    fn dims(&self) -> Result<Option<[u32; 2]>> {
        match (self.width, self.height) {
            (None, None) => Ok(None),
            (Some(w), Some(h)) if w > 0 && h > 0 => Ok(Some([w, h])),
            _ => Err(anyhow!("rescale needs a positive width and height")),
        }
    }
}

/// Changes the sampling frequency of its parent and, for video, the frame
/// dimensions. Video work is pushed into the decoder of the parent.
pub struct RescaleResample {
    config: RescaleResampleConfig,
}

impl RescaleResample {
    pub fn create(node: &Node) -> Result<Arc<dyn Executor>> {
        let config: RescaleResampleConfig = if node.code.trim().is_empty() {
            RescaleResampleConfig::default()
        } else {
            serde_json::from_str(&node.code)?
        };
        config.dims()?;
        if config.freq == Some(0) {
            return Err(anyhow!("freq must be positive"));
        }
        if node.parents.len() != 1 {
            return Err(anyhow!(
                "rescale-resample takes one parent, {} has {}",
                node.id,
                node.parents.len()
            ));
        }
        Ok(Arc::new(Self { config }))
    }

    async fn run_video(
        &self,
        ctx: &RunContext,
        parent: &mut Box<dyn DataReader>,
    ) -> Result<Arc<dyn DataBuffer>> {
        let Some(mut view) = parent.video_view() else {
            return Err(anyhow!("video parent exposes no decoder view"));
        };
        let src_freq = view.freq().await?;
        let freq = self.config.freq.unwrap_or(src_freq);
        if freq % src_freq != 0 {
            return Err(anyhow!(
                "cannot resample video from freq {} to {}",
                src_freq,
                freq
            ));
        }
        view.resample(freq / src_freq);
        if let Some([width, height]) = self.config.dims()? {
            view.rescale(width, height);
        }
        view.set_length(ctx.slice().len().div_ceil(freq));
        debug!(
            node_id = %ctx.node.id,
            src_freq,
            freq,
            "pushing rescale and resample into decoder"
        );
        Ok(Arc::new(view))
    }

    async fn run_data(
        &self,
        ctx: &RunContext,
        mut parents: Vec<Box<dyn DataReader>>,
    ) -> Result<Arc<dyn DataBuffer>> {
        if self.config.dims()?.is_some() {
            return Err(anyhow!("cannot rescale {} data", ctx.node.data_type));
        }
        let freq = match self.config.freq {
            Some(freq) => freq,
            None => parents[0].freq().await?,
        };
        let writer = new_writer(ctx.node.data_type, ctx.services.store.codec());
        let buf = writer.clone().buffer();
        let length = ctx.slice().len();
        tokio::spawn(per_frame(parents, length, freq, writer, |mut batch| {
            batch.pop().ok_or_else(|| anyhow!("empty batch"))
        }));
        Ok(buf)
    }
}

#[async_trait]
impl Executor for RescaleResample {
    async fn run(&self, ctx: RunContext) -> Arc<dyn DataBuffer> {
        let result = async {
            let mut parents = get_parents(&ctx).await?;
            if parents[0].data_type() != ctx.node.data_type {
                return Err(anyhow!(
                    "node {} outputs {} but its parent is {}",
                    ctx.node.id,
                    ctx.node.data_type,
                    parents[0].data_type()
                ));
            }
            if ctx.node.data_type == DataType::Video {
                let mut parent = parents.remove(0);
                self.run_video(&ctx, &mut parent).await
            } else {
                self.run_data(&ctx, parents).await
            }
        }
        .await;
        match result {
            Ok(buf) => buf,
            Err(err) => error_buffer(ctx.node.data_type, err),
        }
    }
}

#[cfg(test)]
mod tests {
    use data_model::{
        test_objects::tests::{mock_node, mock_segment, mock_series},
        Data,
        Parent,
    };

    use super::*;
    use crate::{buffer::read_all, executors::testing::run_context, items::ItemStore};

    #[tokio::test]
    async fn test_resample_data() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let store = Arc::new(ItemStore::for_path(temp_dir.path())?);
        let slice = data_model::Slice::new(mock_segment(1, 100), 0, 20)?;
        let series = mock_series(1, DataType::Int);
        let input = store
            .ingest_data(&series, &slice, 1, &serde_json::to_vec(&(0..20).collect::<Vec<i64>>())?)
            .await?;

        let mut node = mock_node(2, "rescale-resample", DataType::Int, vec![Parent::Series(0)]);
        node.code = r#"{"freq": 5}"#.to_string();
        let executor = RescaleResample::create(&node)?;
        let ctx = run_context(store, node, vec![series], vec![input], slice);

        let buf = executor.run(ctx).await;
        let mut reader = buf.reader();
        assert_eq!(reader.freq().await?, 5);
        assert_eq!(read_all(reader.as_mut()).await?, Data::Int(vec![0, 5, 10, 15]));
        buf.wait().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_rescale_non_video_fails() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let store = Arc::new(ItemStore::for_path(temp_dir.path())?);
        let slice = data_model::Slice::new(mock_segment(1, 100), 0, 10)?;
        let series = mock_series(1, DataType::Int);
        let input = store
            .ingest_data(&series, &slice, 1, &serde_json::to_vec(&vec![1; 10])?)
            .await?;

        let mut node = mock_node(2, "rescale-resample", DataType::Int, vec![Parent::Series(0)]);
        node.code = r#"{"width": 64, "height": 48}"#.to_string();
        let executor = RescaleResample::create(&node)?;
        let ctx = run_context(store, node, vec![series], vec![input], slice);
        assert!(executor.run(ctx).await.wait().await.is_err());
        Ok(())
    }

    #[test]
    fn test_create_rejects_bad_config() {
        struct Case {
            description: &'static str,
            code: &'static str,
            parents: Vec<Parent>,
        }
        let cases = vec![
            Case {
                description: "width without height",
                code: r#"{"width": 64}"#,
                parents: vec![Parent::Series(0)],
            },
            Case {
                description: "zero freq",
                code: r#"{"freq": 0}"#,
                parents: vec![Parent::Series(0)],
            },
            Case {
                description: "two parents",
                code: "",
                parents: vec![Parent::Series(0), Parent::Series(1)],
            },
        ];
        for case in cases {
            let mut node = mock_node(2, "rescale-resample", DataType::Video, case.parents);
            node.code = case.code.to_string();
            assert!(RescaleResample::create(&node).is_err(), "{}", case.description);
        }
    }
}
