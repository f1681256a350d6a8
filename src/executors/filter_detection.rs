use std::{collections::HashSet, sync::Arc};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use data_model::{Data, DataType, DetectionFrame, Node};
use serde::Deserialize;

use super::{get_parents, per_frame, Executor};
use crate::{
    buffer::{error_buffer, new_writer, DataBuffer},
    exec::RunContext,
};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FilterDetectionConfig {
    /// Minimum score to keep a detection.
    #[serde(default)]
    pub score: f64,
    /// Classes to keep. Empty keeps every class.
    #[serde(default)]
    pub classes: Vec<String>,
}

pub struct FilterDetection {
    score: f64,
    classes: HashSet<String>,
}

impl FilterDetection {
    pub fn create(node: &Node) -> Result<Arc<dyn Executor>> {
        let config: FilterDetectionConfig = if node.code.trim().is_empty() {
            FilterDetectionConfig::default()
        } else {
            serde_json::from_str(&node.code)?
        };
        if !matches!(node.data_type, DataType::Detection | DataType::Track) {
            return Err(anyhow!(
                "filter-detection outputs detections, not {}",
                node.data_type
            ));
        }
        if node.parents.len() != 1 {
            return Err(anyhow!("filter-detection takes one parent"));
        }
        Ok(Arc::new(Self {
            score: config.score,
            classes: config.classes.into_iter().collect(),
        }))
    }

    fn filter_frames(&self, frames: Vec<DetectionFrame>) -> Vec<DetectionFrame> {
        frames
            .into_iter()
            .map(|mut frame| {
                frame.detections.retain(|d| {
                    d.score >= self.score && (self.classes.is_empty() || self.classes.contains(&d.class))
                });
                frame
            })
            .collect()
    }

    fn filter(&self, data: Data) -> Result<Data> {
        match data {
            Data::Detection(frames) => Ok(Data::Detection(self.filter_frames(frames))),
            Data::Track(frames) => Ok(Data::Track(self.filter_frames(frames))),
            other => Err(anyhow!("cannot filter {} data", other.data_type())),
        }
    }
}

#[async_trait]
impl Executor for FilterDetection {
    async fn run(&self, ctx: RunContext) -> Arc<dyn DataBuffer> {
        let mut parents = match get_parents(&ctx).await {
            Ok(parents) => parents,
            Err(err) => return error_buffer(ctx.node.data_type, err),
        };
        if parents[0].data_type() != ctx.node.data_type {
            return error_buffer(
                ctx.node.data_type,
                format!(
                    "filter-detection reads {} but its parent is {}",
                    ctx.node.data_type,
                    parents[0].data_type()
                ),
            );
        }
        let freq = match parents[0].freq().await {
            Ok(freq) => freq,
            Err(err) => return error_buffer(ctx.node.data_type, err),
        };

        let writer = new_writer(ctx.node.data_type, ctx.services.store.codec());
        let buf = writer.clone().buffer();
        let filter = Self {
            score: self.score,
            classes: self.classes.clone(),
        };
        tokio::spawn(per_frame(parents, ctx.slice().len(), freq, writer, move |mut batch| {
            let data = batch.pop().ok_or_else(|| anyhow!("empty batch"))?;
            filter.filter(data)
        }));
        buf
    }
}

#[cfg(test)]
mod tests {
    use data_model::{
        test_objects::tests::{mock_node, mock_segment, mock_series},
        Detection,
        Parent,
        Slice,
    };

    use super::*;
    use crate::{buffer::read_all, executors::testing::run_context, items::ItemStore};

    fn detection(class: &str, score: f64) -> Detection {
        Detection {
            right: 10,
            bottom: 10,
            score,
            class: class.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_filters_by_score_and_class() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let store = Arc::new(ItemStore::for_path(temp_dir.path())?);
        let slice = Slice::new(mock_segment(1, 100), 0, 10)?;
        let series = mock_series(1, DataType::Detection);
        let frames = vec![
            DetectionFrame {
                detections: vec![detection("car", 0.9), detection("person", 0.8)],
                canvas_dims: None,
            },
            DetectionFrame {
                detections: vec![detection("car", 0.2)],
                canvas_dims: None,
            },
        ];
        let input = store
            .ingest_data(&series, &slice, 5, &serde_json::to_vec(&frames)?)
            .await?;

        let mut node = mock_node(2, "filter-detection", DataType::Detection, vec![Parent::Series(0)]);
        node.code = r#"{"score": 0.5, "classes": ["car"]}"#.to_string();
        let executor = FilterDetection::create(&node)?;
        let ctx = run_context(store, node, vec![series], vec![input], slice);

        let buf = executor.run(ctx).await;
        let mut reader = buf.reader();
        assert_eq!(reader.freq().await?, 5);
        let Data::Detection(out) = read_all(reader.as_mut()).await? else {
            panic!("expected detections");
        };
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].detections, vec![detection("car", 0.9)]);
        assert!(out[1].detections.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_parent_type_mismatch() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let store = Arc::new(ItemStore::for_path(temp_dir.path())?);
        let slice = Slice::new(mock_segment(1, 100), 0, 10)?;
        let series = mock_series(1, DataType::Int);
        let input = store
            .ingest_data(&series, &slice, 1, &serde_json::to_vec(&vec![1; 10])?)
            .await?;

        let node = mock_node(2, "filter-detection", DataType::Detection, vec![Parent::Series(0)]);
        let executor = FilterDetection::create(&node)?;
        let ctx = run_context(store, node, vec![series], vec![input], slice);
        assert!(executor.run(ctx).await.wait().await.is_err());

        let node = mock_node(3, "filter-detection", DataType::Int, vec![Parent::Series(0)]);
        assert!(FilterDetection::create(&node).is_err());
        Ok(())
    }
}
