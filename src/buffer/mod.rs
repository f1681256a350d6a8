use std::{fmt::Display, future::Future, sync::Arc};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use data_model::{Data, DataType, FPS};
use tokio::io::AsyncWrite;
use tracing::debug;

pub mod codec;
pub mod simple;
pub mod video;

pub use simple::SimpleBuffer;
pub use video::{VideoBuffer, VideoView, VideoWriter};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BufferError {
    #[error("end of stream")]
    EndOfStream,
    #[error("unexpected end of stream: wanted {wanted} records, {available} available")]
    UnexpectedEnd { wanted: usize, available: usize },
    #[error("reader closed")]
    Closed,
    #[error("{0}")]
    Failed(String),
}

impl BufferError {
    pub fn failed(err: impl Display) -> Self {
        BufferError::Failed(err.to_string())
    }
}

/// Read side of a buffer. Each reader tracks its own cursor over the shared
/// record list of the buffer it was created from.
#[async_trait]
pub trait DataReader: Send {
    fn data_type(&self) -> DataType;

    /// Consumes exactly `n` records, waiting until they are written. `n == 0`
    /// consumes whatever is available once at least one record is.
    async fn read(&mut self, n: usize) -> Result<Data, BufferError>;

    /// Like `read` but leaves the cursor in place. Returns everything
    /// available from the cursor once `n` records are.
    async fn peek(&mut self, n: usize) -> Result<Data, BufferError>;

    /// Records per `FPS` base frames. Waits for the writer to publish it.
    async fn freq(&mut self) -> Result<usize, BufferError>;

    async fn close(&mut self);

    /// Video readers expose the view they decode so consumers can push
    /// rescale and resample into the decoder.
    fn video_view(&self) -> Option<VideoView> {
        None
    }
}

#[async_trait]
pub trait DataBuffer: Send + Sync {
    fn data_type(&self) -> DataType;

    fn reader(&self) -> Box<dyn DataReader>;

    /// Resolves once the writer closed the buffer or latched an error.
    async fn wait(&self) -> Result<(), BufferError>;

    /// Streams the buffer in the framed wire format until it completes.
    async fn to_writer(&self, w: &mut (dyn AsyncWrite + Send + Unpin)) -> Result<()>;

    fn as_video(&self) -> Option<&VideoView> {
        None
    }
}

/// Write side of a buffer. There is exactly one writer per buffer.
#[async_trait]
pub trait DataWriter: Send + Sync {
    /// Publishes the sampling frequency. Must be called before the first
    /// write.
    fn set_meta(&self, freq: usize);

    async fn write(&self, data: Data) -> Result<(), BufferError>;

    async fn close(&self);

    async fn error(&self, err: BufferError);

    fn buffer(self: Arc<Self>) -> Arc<dyn DataBuffer>;
}

/// A writer for `data_type` records: video gets an encoding writer, all other
/// types an in-memory record buffer.
pub fn new_writer(data_type: DataType, codec: &crate::ffmpeg::Codec) -> Arc<dyn DataWriter> {
    match data_type {
        DataType::Video => Arc::new(VideoWriter::new(codec.clone())),
        _ => SimpleBuffer::new(data_type),
    }
}

/// A buffer that fails every read with `err`.
pub fn error_buffer(data_type: DataType, err: impl Display) -> Arc<dyn DataBuffer> {
    let buf = SimpleBuffer::new(data_type);
    buf.fail(BufferError::failed(err));
    buf
}

pub async fn min_freq(readers: &mut [Box<dyn DataReader>]) -> Result<usize> {
    let mut min = None;
    for reader in readers.iter_mut() {
        let freq = reader.freq().await?;
        min = Some(min.map_or(freq, |m: usize| m.min(freq)));
    }
    min.ok_or_else(|| anyhow!("no readers"))
}

/// Resamples `data`, which covers `length` base frames at `freq`, to
/// `target` by repeating or dropping records.
pub fn adjust_data_freq(data: Data, length: usize, freq: usize, target: usize) -> Data {
    let Some(last) = data.len().checked_sub(1) else {
        return data;
    };
    if freq == target {
        return data;
    }
    let out_len = length.div_ceil(target);
    let mut out = Data::new(data.data_type());
    for i in 0..out_len {
        let idx = (i * target / freq).min(last);
        // types always match
        let _ = out.append(data.slice(idx, idx + 1));
    }
    out
}

/// Reads several buffers in lock-step over `length` base frames, yielding
/// batches adjusted to `target_freq`. Batches never exceed `FPS` base frames.
pub struct MultiReader<'a> {
    readers: &'a mut [Box<dyn DataReader>],
    freqs: Vec<usize>,
    length: usize,
    target_freq: usize,
    per_iter: usize,
    completed: usize,
}

impl<'a> MultiReader<'a> {
    pub async fn new(
        length: usize,
        target_freq: usize,
        readers: &'a mut [Box<dyn DataReader>],
    ) -> Result<Self> {
        if target_freq == 0 {
            return Err(anyhow!("target frequency must be positive"));
        }
        let mut freqs = Vec::with_capacity(readers.len());
        let mut step = target_freq;
        for reader in readers.iter_mut() {
            let freq = reader.freq().await?;
            if freq == 0 {
                return Err(anyhow!("reader reports zero frequency"));
            }
            step = lcm(step, freq);
            freqs.push(freq);
        }
        let per_iter = (FPS / step) * step;
        if per_iter == 0 {
            return Err(anyhow!(
                "reader frequencies {:?} share no common batch within {} frames",
                freqs,
                FPS
            ));
        }
        Ok(Self {
            readers,
            freqs,
            length,
            target_freq,
            per_iter,
            completed: 0,
        })
    }

    /// Next `(frame_offset, batch)`, or `None` once `length` frames were
    /// read.
    pub async fn next(&mut self) -> Result<Option<(usize, Vec<Data>)>> {
        if self.completed >= self.length {
            return Ok(None);
        }

        let mut available = self.per_iter;
        for (reader, freq) in self.readers.iter_mut().zip(&self.freqs) {
            let data = match reader.peek(self.per_iter / freq).await {
                Ok(data) => data,
                Err(BufferError::EndOfStream) => Data::new(reader.data_type()),
                Err(err) => return Err(err.into()),
            };
            available = available.min(data.len() * freq);
        }
        if available == 0 {
            return Err(anyhow!(
                "input ended after {} of {} frames",
                self.completed,
                self.length
            ));
        }
        available = available.div_ceil(self.per_iter) * self.per_iter;
        available = available.min(self.length - self.completed);

        let mut batch = Vec::with_capacity(self.readers.len());
        for (reader, freq) in self.readers.iter_mut().zip(&self.freqs) {
            let data = reader.read(available.div_ceil(*freq)).await?;
            batch.push(adjust_data_freq(data, available, *freq, self.target_freq));
        }
        let offset = self.completed;
        self.completed += available;
        debug!(offset, available, "read lock-step batch");
        Ok(Some((offset, batch)))
    }
}

fn lcm(a: usize, b: usize) -> usize {
    let (mut x, mut y) = (a, b);
    while y != 0 {
        (x, y) = (y, x % y);
    }
    a / x * b
}

pub async fn close_all(readers: &mut [Box<dyn DataReader>]) {
    for reader in readers.iter_mut() {
        reader.close().await;
    }
}

/// Drives a [`MultiReader`] to completion, handing every batch to `callback`.
/// All readers are closed on return.
pub async fn read_multiple<F, Fut>(
    length: usize,
    target_freq: usize,
    readers: &mut [Box<dyn DataReader>],
    mut callback: F,
) -> Result<()>
where
    F: FnMut(usize, Vec<Data>) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let result = async {
        let mut multi = MultiReader::new(length, target_freq, readers).await?;
        while let Some((offset, batch)) = multi.next().await? {
            callback(offset, batch).await?;
        }
        Ok(())
    }
    .await;
    close_all(readers).await;
    result
}

/// Reads every remaining record of `reader`.
pub async fn read_all(reader: &mut dyn DataReader) -> Result<Data, BufferError> {
    let mut all = Data::new(reader.data_type());
    loop {
        match reader.read(0).await {
            Ok(data) => all.append(data).map_err(BufferError::failed)?,
            Err(BufferError::EndOfStream) => return Ok(all),
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    fn int_buffer(freq: usize, values: Vec<i64>) -> Arc<SimpleBuffer> {
        let buf = SimpleBuffer::new(DataType::Int);
        buf.set_freq(freq);
        buf.push(Data::Int(values)).unwrap();
        buf.finish();
        buf
    }

    #[test]
    fn test_adjust_data_freq() {
        struct Case {
            description: &'static str,
            data: Data,
            length: usize,
            freq: usize,
            target: usize,
            expected: Data,
        }
        let cases = vec![
            Case {
                description: "same freq",
                data: Data::Int(vec![1, 2, 3]),
                length: 3,
                freq: 1,
                target: 1,
                expected: Data::Int(vec![1, 2, 3]),
            },
            Case {
                description: "upsample repeats records",
                data: Data::Int(vec![1, 2]),
                length: 8,
                freq: 4,
                target: 2,
                expected: Data::Int(vec![1, 1, 2, 2]),
            },
            Case {
                description: "downsample drops records",
                data: Data::Int(vec![1, 2, 3, 4, 5, 6, 7, 8]),
                length: 8,
                freq: 1,
                target: 4,
                expected: Data::Int(vec![1, 5]),
            },
            Case {
                description: "partial trailing record",
                data: Data::Int(vec![1, 2, 3]),
                length: 9,
                freq: 4,
                target: 1,
                expected: Data::Int(vec![1, 1, 1, 1, 2, 2, 2, 2, 3]),
            },
        ];
        for case in cases {
            assert_eq!(
                adjust_data_freq(case.data, case.length, case.freq, case.target),
                case.expected,
                "{}",
                case.description
            );
        }
    }

    #[tokio::test]
    async fn test_read_multiple_mixed_freqs() -> Result<()> {
        let fine = int_buffer(1, (0..100).collect());
        let coarse = int_buffer(4, (0..25).collect());

        for (target, expected) in [(1, (100, 100)), (4, (25, 25))] {
            let mut readers = vec![fine.reader(), coarse.reader()];
            let batches = Arc::new(Mutex::new(Vec::new()));
            let seen = batches.clone();
            read_multiple(100, target, &mut readers, |offset, batch| {
                let seen = seen.clone();
                async move {
                    seen.lock().unwrap().push((offset, batch));
                    Ok(())
                }
            })
            .await?;

            let batches = batches.lock().unwrap();
            let fine_total: usize = batches.iter().map(|(_, b)| b[0].len()).sum();
            let coarse_total: usize = batches.iter().map(|(_, b)| b[1].len()).sum();
            assert_eq!((fine_total, coarse_total), expected, "target {}", target);
            for (_, batch) in batches.iter() {
                assert!(batch[0].len() * target <= FPS);
            }
            assert_eq!(batches.last().unwrap().0, 96);
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_read_multiple_consumes_each_coarse_record_once() -> Result<()> {
        let fine = int_buffer(1, (0..100).collect());
        let coarse = int_buffer(4, (0..25).collect());
        let mut readers = vec![fine.reader(), coarse.reader()];
        let mut multi = MultiReader::new(100, 4, &mut readers).await?;
        let mut coarse_values = Vec::new();
        while let Some((_, batch)) = multi.next().await? {
            if let Data::Int(values) = &batch[1] {
                coarse_values.extend(values.iter().copied());
            }
        }
        assert_eq!(coarse_values, (0..25).collect::<Vec<_>>());
        Ok(())
    }

    #[tokio::test]
    async fn test_read_multiple_short_input() {
        let short = int_buffer(1, (0..10).collect());
        let mut readers = vec![short.reader()];
        let result = read_multiple(50, 1, &mut readers, |_, _| async { Ok(()) }).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_read_multiple_rejects_unaligned_freqs() {
        let a = int_buffer(13, vec![1, 2]);
        let b = int_buffer(7, vec![1, 2, 3, 4]);
        let mut readers = vec![a.reader(), b.reader()];
        assert!(MultiReader::new(26, 1, &mut readers).await.is_err());
    }

    #[tokio::test]
    async fn test_read_all_and_min_freq() -> Result<()> {
        let a = int_buffer(2, vec![1, 2, 3]);
        let b = int_buffer(5, vec![4]);
        let mut readers = vec![a.reader(), b.reader()];
        assert_eq!(min_freq(&mut readers).await?, 2);
        assert_eq!(
            read_all(readers[0].as_mut()).await?,
            Data::Int(vec![1, 2, 3])
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_error_buffer() {
        let buf = error_buffer(DataType::Class, "no executor for type");
        let err = buf.reader().read(1).await.unwrap_err();
        assert_eq!(err, BufferError::Failed("no executor for type".to_string()));
        assert!(buf.wait().await.is_err());
    }
}
