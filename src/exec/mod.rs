use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
};

use anyhow::{anyhow, Result};
use data_model::{Container, DataType, ExecOptions, Item, Node, NodeId, Parent, Series, Slice};
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use tokio_util::io::StreamReader;
use tracing::{debug, warn};

use crate::{
    buffer::{DataBuffer, DataReader, SimpleBuffer, VideoView},
    items::ItemStore,
};

pub mod query;
pub mod stream;

pub use query::{get_environment_set, QueryRunner, RunError};
pub use stream::{ExecStream, SliceRunner, StreamError};

/// Process-wide handles shared by coordinator and container code.
#[derive(Clone)]
pub struct Services {
    pub store: Arc<ItemStore>,
    pub client: reqwest::Client,
}

impl Services {
    pub fn new(store: Arc<ItemStore>) -> Self {
        Self {
            store,
            client: reqwest::Client::new(),
        }
    }
}

/// Everything needed to produce the outputs of one query over one slice of a
/// vector. Built by the coordinator for each run and sent to containers as
/// the body of `/query/start`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecContext {
    /// Distinguishes runs so containers can share node outputs within one.
    pub uuid: String,
    pub nodes: HashMap<NodeId, Node>,
    /// Container computing each node.
    pub routes: HashMap<NodeId, Container>,
    /// Node outputs already persisted for this slice.
    #[serde(default)]
    pub items: HashMap<NodeId, Item>,
    pub vector: Vec<Series>,
    /// Stored item covering the slice, per vector series.
    pub inputs: Vec<Item>,
    pub slice: Slice,
    #[serde(default)]
    pub opts: ExecOptions,
}

impl ExecContext {
    pub fn node(&self, id: NodeId) -> Result<&Node> {
        self.nodes
            .get(&id)
            .ok_or_else(|| anyhow!("run {} has no node {}", self.uuid, id))
    }

    /// Output of `id`: the persisted item when there is one, otherwise the
    /// stream from the container the node is routed to.
    pub async fn get_buffer(&self, id: NodeId, services: &Services) -> Result<Arc<dyn DataBuffer>> {
        let node = self.node(id)?;
        if let Some(item) = self.items.get(&id) {
            debug!(node_id = %id, key = item.key, "reading persisted node output");
            return services.store.load(item, &self.slice).await;
        }
        let container = self
            .routes
            .get(&id)
            .ok_or_else(|| anyhow!("node {} is not routed to a container", id))?;
        let resp = services
            .client
            .post(format!("{}/query/start", container.base_url))
            .query(&[("node_id", id.0)])
            .json(self)
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow!(
                "node {} on {} returned {}: {}",
                id,
                container.base_url,
                status,
                body
            ));
        }
        let body = StreamReader::new(Box::pin(
            resp.bytes_stream().map_err(std::io::Error::other),
        ));
        let buf: Arc<dyn DataBuffer> = match node.data_type {
            DataType::Video => Arc::new(
                VideoView::from_reader(
                    body,
                    services.store.codec().clone(),
                    services.store.clone(),
                )
                .await?,
            ),
            data_type => SimpleBuffer::from_reader(data_type, body),
        };
        Ok(buf)
    }

    pub async fn get_reader(&self, id: NodeId, services: &Services) -> Result<Box<dyn DataReader>> {
        Ok(self.get_buffer(id, services).await?.reader())
    }

    /// The slice of vector series `idx`.
    pub async fn input_buffer(&self, idx: usize, services: &Services) -> Result<Arc<dyn DataBuffer>> {
        let item = self
            .inputs
            .get(idx)
            .ok_or_else(|| anyhow!("vector has no series {}", idx))?;
        services.store.load(item, &self.slice).await
    }

    pub async fn parent_buffer(
        &self,
        parent: &Parent,
        services: &Services,
    ) -> Result<Arc<dyn DataBuffer>> {
        match parent {
            Parent::Node(id) => self.get_buffer(*id, services).await,
            Parent::Series(idx) => self.input_buffer(*idx, services).await,
        }
    }

    /// Tells every container computing a node of this run that no new
    /// readers will be requested. Streams already open keep going.
    pub async fn finish(&self, services: &Services) {
        let base_urls: BTreeSet<&str> = self
            .routes
            .iter()
            .filter(|(id, _)| !self.items.contains_key(id))
            .map(|(_, container)| container.base_url.as_str())
            .collect();
        for base_url in base_urls {
            let resp = services
                .client
                .post(format!("{}/query/finish", base_url))
                .query(&[("uuid", self.uuid.as_str())])
                .send()
                .await;
            if let Err(err) = resp.and_then(|resp| resp.error_for_status()) {
                warn!(uuid = self.uuid, base_url, "failed to finish run: {}", err);
            }
        }
    }
}

/// Handed to an executor for one node of one run.
#[derive(Clone)]
pub struct RunContext {
    pub exec: Arc<ExecContext>,
    pub node: Node,
    pub services: Services,
}

impl RunContext {
    pub fn slice(&self) -> &Slice {
        &self.exec.slice
    }
}

#[cfg(test)]
mod tests {
    use data_model::{
        test_objects::tests::{mock_node, mock_segment, mock_series},
        ItemFormat,
    };

    use super::*;
    use crate::buffer::read_all;

    #[tokio::test]
    async fn test_context_reads_persisted_items() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let store = Arc::new(ItemStore::for_path(temp_dir.path())?);
        let services = Services::new(store.clone());

        let segment = mock_segment(1, 100);
        let slice = Slice::new(segment.clone(), 0, 10)?;
        let series = mock_series(1, DataType::Int);
        let input = store.ingest_data(&series, &slice, 1, &serde_json::to_vec(&vec![3; 10])?).await?;

        let node = mock_node(4, "filter-detection", DataType::Int, vec![Parent::Series(0)]);
        let output = store.add_output_item(&node, std::slice::from_ref(&series), &slice, 5);
        store.write_data(&output, &data_model::Data::Int(vec![1, 2])).await?;
        assert_eq!(output.format, ItemFormat::Json);

        let ctx = ExecContext {
            uuid: "run".to_string(),
            nodes: HashMap::from([(node.id, node.clone())]),
            routes: HashMap::new(),
            items: HashMap::from([(node.id, output)]),
            vector: vec![series],
            inputs: vec![input],
            slice,
            opts: ExecOptions::default(),
        };
        let mut reader = ctx.get_reader(node.id, &services).await?;
        assert_eq!(read_all(reader.as_mut()).await?, data_model::Data::Int(vec![1, 2]));

        let buf = ctx.parent_buffer(&Parent::Series(0), &services).await?;
        assert_eq!(read_all(buf.reader().as_mut()).await?.len(), 10);
        assert!(ctx.input_buffer(1, &services).await.is_err());
        assert!(ctx.get_buffer(NodeId(99), &services).await.is_err());

        // contexts cross the wire as JSON
        let decoded: ExecContext = serde_json::from_str(&serde_json::to_string(&ctx)?)?;
        assert_eq!(decoded.items.len(), 1);
        assert_eq!(decoded.nodes[&node.id], node);
        Ok(())
    }
}
