use std::{path::Path, sync::Arc};

use anyhow::{anyhow, Result};
use blob_store::{BlobStorage, BlobStorageConfig};
use bytes::Bytes;
use data_model::{Data, DataType, Item, ItemFormat, Node, Segment, Series, SeriesId, Slice};
use futures::stream::BoxStream;
use sha2::{Digest, Sha256};
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

use crate::{
    buffer::{DataBuffer, SimpleBuffer, VideoView},
    ffmpeg::{Codec, VideoInput},
};

const META_SUFFIX: &str = ".meta.json";

/// Output series of `node` when run over `vector`. Output series are never
/// created explicitly; their ids are derived from the node and the vector so
/// that coordinator and containers agree on them. Derived ids are negative to
/// stay clear of ingested series.
pub fn output_series(node: &Node, vector: &[Series]) -> Series {
    let mut hasher = Sha256::new();
    hasher.update(node.id.0.to_be_bytes());
    for series in vector {
        hasher.update(series.id.0.to_be_bytes());
    }
    let digest = hasher.finalize();
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    let id = -((u64::from_be_bytes(prefix) >> 1) as i64) - 1;
    let names: Vec<&str> = vector.iter().map(|series| series.name.as_str()).collect();
    Series {
        id: SeriesId(id),
        timeline: vector
            .first()
            .map(|series| series.timeline.clone())
            .unwrap_or_default(),
        name: format!("{}[{}]", node.name, names.join(",")),
        data_type: node.data_type,
    }
}

/// Persisted items of every series, stored as a payload plus a JSON sidecar
/// holding the `Item`.
pub struct ItemStore {
    blobs: BlobStorage,
    codec: Codec,
}

impl ItemStore {
    pub fn new(blobs: BlobStorage, codec: Codec) -> Self {
        Self { blobs, codec }
    }

    pub fn for_path(path: &Path) -> Result<Self> {
        let path = path
            .to_str()
            .ok_or_else(|| anyhow!("non-utf8 item store path: {}", path.display()))?;
        let blobs = BlobStorage::new(BlobStorageConfig::new(path))?;
        Ok(Self::new(blobs, Codec::default()))
    }

    pub fn codec(&self) -> &Codec {
        &self.codec
    }

    fn series_prefix(series: &Series) -> String {
        format!("series/{}/", series.id)
    }

    fn item_key(series: &Series, slice: &Slice, format: ItemFormat) -> String {
        format!(
            "{}{}_{}_{}.{}",
            Self::series_prefix(series),
            slice.segment.id,
            slice.start,
            slice.end,
            format
        )
    }

    /// Parses the `{segment}_{start}_{end}` stem of a sidecar key.
    fn parse_range(key: &str) -> Option<(i64, usize, usize)> {
        let name = key.rsplit('/').next()?.strip_suffix(META_SUFFIX)?;
        let stem = name.split('.').next()?;
        let mut parts = stem.split('_');
        let segment = parts.next()?.parse().ok()?;
        let start = parts.next()?.parse().ok()?;
        let end = parts.next()?.parse().ok()?;
        Some((segment, start, end))
    }

    /// Describes a new item of `series` without writing anything.
    pub fn new_item(&self, series: &Series, slice: &Slice, freq: usize) -> Item {
        let format = match series.data_type {
            DataType::Video => ItemFormat::Mp4,
            _ => ItemFormat::Json,
        };
        Item {
            key: Self::item_key(series, slice, format),
            slice: slice.clone(),
            series: series.clone(),
            format,
            width: 0,
            height: 0,
            freq: freq.max(1),
        }
    }

    pub fn add_output_item(
        &self,
        node: &Node,
        vector: &[Series],
        slice: &Slice,
        freq: usize,
    ) -> Item {
        self.new_item(&output_series(node, vector), slice, freq)
    }

    async fn put_meta(&self, item: &Item) -> Result<()> {
        let meta = serde_json::to_vec(item)?;
        self.blobs
            .put_bytes(&format!("{}{}", item.key, META_SUFFIX), meta.into())
            .await
    }

    /// Stores typed records as the payload of `item`.
    pub async fn write_data(&self, item: &Item, data: &Data) -> Result<()> {
        self.blobs
            .put_bytes(&item.key, Bytes::from(data.encode()?))
            .await?;
        self.put_meta(item).await?;
        debug!(key = item.key, records = data.len(), "stored item");
        Ok(())
    }

    /// Stores an encoded MP4 stream as the payload of `item`.
    pub async fn write_video(
        &self,
        item: &Item,
        stream: BoxStream<'static, Result<Bytes>>,
    ) -> Result<()> {
        let put = self.blobs.put(&item.key, stream).await?;
        self.put_meta(item).await?;
        debug!(key = item.key, size_bytes = put.size_bytes, "stored video item");
        Ok(())
    }

    /// The first stored item of `series` whose slice covers `slice`.
    pub async fn series_item(&self, series: &Series, slice: &Slice) -> Result<Option<Item>> {
        let keys = self.blobs.list(&Self::series_prefix(series)).await?;
        for key in keys {
            let Some((segment, start, end)) = Self::parse_range(&key) else {
                continue;
            };
            if segment != slice.segment.id.0 || start > slice.start || end < slice.end {
                continue;
            }
            let item: Item = serde_json::from_slice(&self.blobs.read_bytes(&key).await?)?;
            if item.slice.covers(slice) {
                return Ok(Some(item));
            }
        }
        Ok(None)
    }

    pub async fn output_item(
        &self,
        node: &Node,
        vector: &[Series],
        slice: &Slice,
    ) -> Result<Option<Item>> {
        self.series_item(&output_series(node, vector), slice).await
    }

    /// Items of `series`, in key order.
    pub async fn list_items(&self, series: &Series) -> Result<Vec<Item>> {
        let mut items = Vec::new();
        for key in self.blobs.list(&Self::series_prefix(series)).await? {
            if key.ends_with(META_SUFFIX) {
                items.push(serde_json::from_slice(&self.blobs.read_bytes(&key).await?)?);
            }
        }
        Ok(items)
    }

    /// Opens the part of `item` that overlaps `slice` as a buffer.
    pub async fn load(self: &Arc<Self>, item: &Item, slice: &Slice) -> Result<Arc<dyn DataBuffer>> {
        let (start, end) = item.record_range(slice)?;
        if item.format == ItemFormat::Mp4 {
            let mut view =
                VideoView::from_item(item.clone(), slice.clone(), self.clone(), self.codec.clone());
            view.set_length(end - start);
            return Ok(Arc::new(view));
        }
        let bytes = self.blobs.read_bytes(&item.key).await?;
        let data = Data::decode(item.series.data_type, &bytes)?;
        let buf = SimpleBuffer::new(item.series.data_type);
        buf.set_freq(item.freq);
        buf.push(data.slice(start, end))?;
        buf.finish();
        Ok(buf)
    }

    /// ffmpeg input for a stored video, read in place when the store is a
    /// local directory.
    pub async fn video_input(&self, item: &Item) -> Result<VideoInput> {
        if let Some(path) = self.blobs.local_path(&item.key) {
            if tokio::fs::try_exists(&path).await? {
                return Ok(VideoInput::Path(path));
            }
        }
        Ok(VideoInput::Stream(self.blobs.get(&item.key).await?))
    }

    pub async fn get(&self, key: &str) -> Result<BoxStream<'static, Result<Bytes>>> {
        self.blobs.get(key).await
    }

    /// Stores a video file as a single item covering all of `segment`. The
    /// segment's frame count comes from the probed duration.
    pub async fn ingest_video(
        &self,
        series: &Series,
        mut segment: Segment,
        path: &Path,
    ) -> Result<Item> {
        if series.data_type != DataType::Video {
            return Err(anyhow!("series {} does not hold video", series.name));
        }
        let probe = self.codec.probe(path).await?;
        segment.frames = probe.frames();
        let mut item = self.new_item(series, &segment.to_slice(), 1);
        item.width = probe.width;
        item.height = probe.height;

        let file = tokio::fs::File::open(path).await?;
        let stream = ReaderStream::new(file);
        let stream = futures::TryStreamExt::map_err(stream, anyhow::Error::from);
        self.write_video(&item, Box::pin(stream)).await?;
        info!(
            key = item.key,
            frames = segment.frames,
            width = probe.width,
            height = probe.height,
            "ingested video"
        );
        Ok(item)
    }

    /// Stores JSON-encoded records of `series` covering `slice` at `freq`.
    pub async fn ingest_data(
        &self,
        series: &Series,
        slice: &Slice,
        freq: usize,
        bytes: &[u8],
    ) -> Result<Item> {
        let data = Data::decode(series.data_type, bytes)?;
        let expected = slice.len().div_ceil(freq.max(1));
        if data.len() != expected {
            return Err(anyhow!(
                "{} records cover {} frames at freq {}, got {}",
                expected,
                slice.len(),
                freq,
                data.len()
            ));
        }
        let item = self.new_item(series, slice, freq);
        self.write_data(&item, &data).await?;
        info!(key = item.key, records = data.len(), "ingested data");
        Ok(item)
    }
}

#[cfg(test)]
mod tests {
    use data_model::{
        test_objects::tests::{mock_node, mock_segment, mock_series},
        Parent,
    };

    use super::*;
    use crate::buffer::read_all;

    #[tokio::test]
    async fn test_series_item_lookup() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let store = Arc::new(ItemStore::for_path(temp_dir.path())?);
        let series = mock_series(3, DataType::Int);
        let segment = mock_segment(1, 100);

        let first = Slice::new(segment.clone(), 0, 40)?;
        store
            .ingest_data(&series, &first, 4, br#"[0,1,2,3,4,5,6,7,8,9]"#)
            .await?;
        let second = Slice::new(segment.clone(), 40, 100)?;
        store
            .ingest_data(&series, &second, 4, &serde_json::to_vec(&vec![7; 15])?)
            .await?;

        let item = store
            .series_item(&series, &Slice::new(segment.clone(), 8, 20)?)
            .await?
            .expect("covering item");
        assert_eq!(item.slice, first);
        assert!(store
            .series_item(&series, &Slice::new(segment.clone(), 30, 50)?)
            .await?
            .is_none());
        assert!(store
            .series_item(&series, &Slice::new(mock_segment(2, 100), 0, 10)?)
            .await?
            .is_none());
        assert_eq!(store.list_items(&series).await?.len(), 2);

        let buf = store
            .load(&item, &Slice::new(segment, 8, 20)?)
            .await?;
        let data = read_all(buf.reader().as_mut()).await?;
        assert_eq!(data, Data::Int(vec![2, 3, 4]));
        Ok(())
    }

    #[tokio::test]
    async fn test_ingest_rejects_wrong_length() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let store = ItemStore::for_path(temp_dir.path())?;
        let series = mock_series(3, DataType::Int);
        let slice = Slice::new(mock_segment(1, 100), 0, 10)?;
        assert!(store.ingest_data(&series, &slice, 1, b"[1,2]").await.is_err());
        Ok(())
    }

    #[test]
    fn test_output_series_is_stable() {
        let vector = vec![mock_series(1, DataType::Video)];
        let node = mock_node(5, "filter-detection", DataType::Detection, vec![Parent::Series(0)]);
        let a = output_series(&node, &vector);
        let b = output_series(&node, &vector);
        assert_eq!(a, b);
        assert!(a.id.0 < 0);
        assert_eq!(a.data_type, DataType::Detection);

        let other = mock_node(6, "filter-detection", DataType::Detection, vec![Parent::Series(0)]);
        assert_ne!(output_series(&other, &vector).id, a.id);
    }

    #[test]
    fn test_parse_range() {
        assert_eq!(
            ItemStore::parse_range("series/3/1_0_40.json.meta.json"),
            Some((1, 0, 40))
        );
        assert_eq!(ItemStore::parse_range("series/3/1_0_40.json"), None);
    }
}
