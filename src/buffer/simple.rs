use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use data_model::{Data, DataType, FPS};
use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::watch,
};
use tracing::warn;

use super::{
    codec::{self, Packet, TAG_DATA, TAG_ERROR},
    BufferError,
    DataBuffer,
    DataReader,
    DataWriter,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SimpleMeta {
    freq: usize,
}

struct State {
    data: Data,
    freq: Option<usize>,
    length: Option<usize>,
    done: bool,
    err: Option<BufferError>,
}

/// In-memory buffer of typed records. Records are only appended, so every
/// reader keeps its own cursor into the same list.
pub struct SimpleBuffer {
    data_type: DataType,
    state: watch::Sender<State>,
}

impl SimpleBuffer {
    pub fn new(data_type: DataType) -> Arc<Self> {
        let (state, _) = watch::channel(State {
            data: Data::new(data_type),
            freq: None,
            length: None,
            done: false,
            err: None,
        });
        Arc::new(Self { data_type, state })
    }

    pub fn set_freq(&self, freq: usize) {
        self.state.send_modify(|s| s.freq = Some(freq));
    }

    /// Fixes the record count: later writes are truncated to it and closing
    /// pads up to it.
    pub fn set_length(&self, length: usize) {
        self.state.send_modify(|s| {
            s.data.truncate(length);
            s.length = Some(length);
        });
    }

    pub fn push(&self, data: Data) -> Result<(), BufferError> {
        if data.data_type() != self.data_type {
            return Err(BufferError::Failed(format!(
                "cannot write {} data to a {} buffer",
                data.data_type(),
                self.data_type
            )));
        }
        let mut result = Ok(());
        self.state.send_modify(|s| {
            if s.done || s.err.is_some() {
                result = Err(BufferError::Closed);
                return;
            }
            if let Err(err) = s.data.append(data) {
                result = Err(BufferError::failed(err));
                return;
            }
            if let Some(length) = s.length {
                s.data.truncate(length);
            }
        });
        result
    }

    pub fn finish(&self) {
        self.state.send_modify(|s| {
            if let Some(length) = s.length {
                s.data.ensure_length(length);
            }
            s.done = true;
        });
    }

    pub fn fail(&self, err: BufferError) {
        self.state.send_modify(|s| {
            if s.err.is_none() {
                s.err = Some(err);
            }
        });
    }

    /// Waits until `[pos, pos + wait)` is written or the buffer completes.
    /// Returns the records from `pos` up to at most `max` of them.
    async fn wait_range(
        &self,
        pos: usize,
        wait: usize,
        max: Option<usize>,
    ) -> Result<Data, BufferError> {
        let mut rx = self.state.subscribe();
        let state = rx
            .wait_for(|s| s.err.is_some() || s.done || s.data.len() >= pos + wait)
            .await
            .map_err(|_| BufferError::Closed)?;
        if let Some(err) = &state.err {
            return Err(err.clone());
        }
        let len = state.data.len();
        if pos >= len {
            return Err(BufferError::EndOfStream);
        }
        let end = max.map_or(len, |max| len.min(pos + max));
        Ok(state.data.slice(pos, end))
    }

    async fn read_at(&self, pos: usize, n: usize) -> Result<Data, BufferError> {
        let data = self
            .wait_range(pos, n.max(1), (n > 0).then_some(n))
            .await?;
        if n > 0 && data.len() < n {
            return Err(BufferError::UnexpectedEnd {
                wanted: n,
                available: data.len(),
            });
        }
        Ok(data)
    }

    async fn wait_freq(&self) -> Result<usize, BufferError> {
        let mut rx = self.state.subscribe();
        let state = rx
            .wait_for(|s| s.freq.is_some() || s.err.is_some() || s.done)
            .await
            .map_err(|_| BufferError::Closed)?;
        if let Some(freq) = state.freq {
            return Ok(freq);
        }
        match &state.err {
            Some(err) => Err(err.clone()),
            None => Err(BufferError::Failed(
                "buffer closed before its frequency was set".to_string(),
            )),
        }
    }

    /// Decodes a framed stream into a new buffer. Data is written as packets
    /// arrive; an in-band error packet latches the error.
    pub fn from_reader<R>(data_type: DataType, r: R) -> Arc<Self>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let buf = SimpleBuffer::new(data_type);
        let writer = buf.clone();
        tokio::spawn(async move {
            if let Err(err) = writer.fill_from(r).await {
                warn!(data_type = %data_type, "error decoding buffer stream: {:?}", err);
                writer.fail(BufferError::failed(err));
            }
        });
        buf
    }

    async fn fill_from<R>(&self, mut r: R) -> Result<()>
    where
        R: AsyncRead + Send + Unpin,
    {
        let meta: SimpleMeta = codec::read_meta(&mut r).await?;
        self.set_freq(meta.freq);
        while let Some(packet) = codec::read_packet(&mut r).await? {
            match packet {
                Packet::Data(bytes) => {
                    let data = Data::decode(self.data_type, &bytes)?;
                    self.push(data)?;
                }
                Packet::Error(msg) => {
                    self.fail(BufferError::Failed(msg));
                    return Ok(());
                }
            }
        }
        self.finish();
        Ok(())
    }
}

#[async_trait]
impl DataWriter for SimpleBuffer {
    fn set_meta(&self, freq: usize) {
        self.set_freq(freq);
    }

    async fn write(&self, data: Data) -> Result<(), BufferError> {
        self.push(data)
    }

    async fn close(&self) {
        self.finish();
    }

    async fn error(&self, err: BufferError) {
        self.fail(err);
    }

    fn buffer(self: Arc<Self>) -> Arc<dyn DataBuffer> {
        self
    }
}

#[async_trait]
impl DataBuffer for SimpleBuffer {
    fn data_type(&self) -> DataType {
        self.data_type
    }

    fn reader(&self) -> Box<dyn DataReader> {
        Box::new(SimpleReader {
            buf: self.handle(),
            pos: 0,
            closed: false,
        })
    }

    async fn wait(&self) -> Result<(), BufferError> {
        let mut rx = self.state.subscribe();
        let state = rx
            .wait_for(|s| s.done || s.err.is_some())
            .await
            .map_err(|_| BufferError::Closed)?;
        match &state.err {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    async fn to_writer(&self, w: &mut (dyn AsyncWrite + Send + Unpin)) -> Result<()> {
        let freq = match self.wait_freq().await {
            Ok(freq) => freq,
            Err(err) => {
                codec::write_meta(w, &SimpleMeta { freq: 1 }).await?;
                codec::write_packet(w, TAG_ERROR, err.to_string().as_bytes()).await?;
                return Err(err.into());
            }
        };
        codec::write_meta(w, &SimpleMeta { freq }).await?;
        let mut pos = 0;
        loop {
            match self.wait_range(pos, FPS, Some(FPS)).await {
                Ok(data) => {
                    pos += data.len();
                    codec::write_packet(w, TAG_DATA, &data.encode()?).await?;
                }
                Err(BufferError::EndOfStream) => return Ok(()),
                Err(err) => {
                    codec::write_packet(w, TAG_ERROR, err.to_string().as_bytes()).await?;
                    return Err(err.into());
                }
            }
        }
    }
}

impl SimpleBuffer {
    fn handle(&self) -> Arc<SimpleBuffer> {
        Arc::new(SimpleBuffer {
            data_type: self.data_type,
            state: self.state.clone(),
        })
    }
}

pub struct SimpleReader {
    buf: Arc<SimpleBuffer>,
    pos: usize,
    closed: bool,
}

#[async_trait]
impl DataReader for SimpleReader {
    fn data_type(&self) -> DataType {
        self.buf.data_type
    }

    async fn read(&mut self, n: usize) -> Result<Data, BufferError> {
        if self.closed {
            return Err(BufferError::Closed);
        }
        let data = self.buf.read_at(self.pos, n).await?;
        self.pos += data.len();
        Ok(data)
    }

    async fn peek(&mut self, n: usize) -> Result<Data, BufferError> {
        if self.closed {
            return Err(BufferError::Closed);
        }
        self.buf.wait_range(self.pos, n.max(1), None).await
    }

    async fn freq(&mut self) -> Result<usize, BufferError> {
        self.buf.wait_freq().await
    }

    async fn close(&mut self) {
        self.closed = true;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use data_model::{Detection, DetectionFrame};

    use super::*;

    #[tokio::test]
    async fn test_write_close_read_all() -> Result<()> {
        let buf = SimpleBuffer::new(DataType::Int);
        buf.set_freq(1);
        buf.push(Data::Int(vec![1, 2]))?;
        buf.push(Data::Int(vec![3]))?;
        buf.finish();

        let mut reader = buf.reader();
        assert_eq!(reader.read(0).await?, Data::Int(vec![1, 2, 3]));
        assert_eq!(reader.read(0).await, Err(BufferError::EndOfStream));
        Ok(())
    }

    #[tokio::test]
    async fn test_read_past_close_is_unexpected_end() -> Result<()> {
        let buf = SimpleBuffer::new(DataType::Int);
        buf.push(Data::Int(vec![1, 2, 3]))?;
        buf.finish();

        let mut reader = buf.reader();
        assert_eq!(reader.read(2).await?, Data::Int(vec![1, 2]));
        assert_eq!(
            reader.read(2).await,
            Err(BufferError::UnexpectedEnd {
                wanted: 2,
                available: 1
            })
        );
        // the shortfall does not consume the remaining record
        assert_eq!(reader.read(1).await?, Data::Int(vec![3]));
        assert_eq!(reader.read(1).await, Err(BufferError::EndOfStream));
        Ok(())
    }

    #[tokio::test]
    async fn test_read_blocks_until_written() -> Result<()> {
        let buf = SimpleBuffer::new(DataType::Float);
        let mut reader = buf.reader();
        let pending = tokio::spawn(async move { reader.read(3).await });

        buf.push(Data::Float(vec![1.0]))?;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!pending.is_finished());

        buf.push(Data::Float(vec![2.0, 3.0, 4.0]))?;
        assert_eq!(pending.await?, Ok(Data::Float(vec![1.0, 2.0, 3.0])));
        Ok(())
    }

    #[tokio::test]
    async fn test_readers_have_independent_cursors() -> Result<()> {
        let buf = SimpleBuffer::new(DataType::String);
        buf.push(Data::String(vec!["a".into(), "b".into()]))?;
        buf.finish();

        let mut first = buf.reader();
        let mut second = buf.reader();
        assert_eq!(first.peek(1).await?.len(), 2);
        assert_eq!(first.read(1).await?, Data::String(vec!["a".into()]));
        assert_eq!(second.read(2).await?.len(), 2);
        assert_eq!(first.read(0).await?, Data::String(vec!["b".into()]));
        Ok(())
    }

    #[tokio::test]
    async fn test_set_length_pads_and_truncates() -> Result<()> {
        let padded = SimpleBuffer::new(DataType::Detection);
        padded.set_length(4);
        padded.push(Data::Detection(vec![DetectionFrame {
            detections: vec![Detection::default()],
            canvas_dims: None,
        }]))?;
        padded.finish();
        let data = padded.reader().read(4).await?;
        assert_eq!(data.len(), 4);
        assert_eq!(data.detections().unwrap()[3], DetectionFrame::default());

        let truncated = SimpleBuffer::new(DataType::Int);
        truncated.set_length(2);
        truncated.push(Data::Int(vec![1, 2, 3]))?;
        truncated.finish();
        assert_eq!(truncated.reader().read(0).await?, Data::Int(vec![1, 2]));
        Ok(())
    }

    #[tokio::test]
    async fn test_error_fails_pending_readers() -> Result<()> {
        let buf = SimpleBuffer::new(DataType::Int);
        buf.set_freq(1);
        let mut reader = buf.reader();
        let pending = tokio::spawn(async move { reader.read(5).await });
        buf.fail(BufferError::failed("decoder crashed"));
        assert_eq!(
            pending.await?,
            Err(BufferError::Failed("decoder crashed".to_string()))
        );
        assert!(buf.push(Data::Int(vec![1])).is_err());
        assert!(buf.wait().await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_rejects_wrong_type() {
        let buf = SimpleBuffer::new(DataType::Int);
        assert!(buf.push(Data::Float(vec![1.0])).is_err());
    }

    #[tokio::test]
    async fn test_stream_roundtrip() -> Result<()> {
        let buf = SimpleBuffer::new(DataType::Class);
        buf.set_freq(4);
        buf.push(Data::Class((0..60).collect()))?;
        buf.finish();

        let mut wire = Vec::new();
        buf.to_writer(&mut wire).await?;

        let decoded = SimpleBuffer::from_reader(DataType::Class, std::io::Cursor::new(wire));
        let mut reader = decoded.reader();
        assert_eq!(reader.freq().await?, 4);
        assert_eq!(
            crate::buffer::read_all(reader.as_mut()).await?,
            Data::Class((0..60).collect())
        );
        decoded.wait().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_stream_carries_errors() -> Result<()> {
        let buf = SimpleBuffer::new(DataType::Int);
        buf.set_freq(1);
        buf.push(Data::Int(vec![7]))?;
        buf.fail(BufferError::failed("model failed"));

        let mut wire = Vec::new();
        assert!(buf.to_writer(&mut wire).await.is_err());

        let decoded = SimpleBuffer::from_reader(DataType::Int, std::io::Cursor::new(wire));
        assert_eq!(
            decoded.wait().await,
            Err(BufferError::Failed("model failed".to_string()))
        );
        Ok(())
    }
}
