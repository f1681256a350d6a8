use std::{collections::VecDeque, sync::Arc};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use data_model::{Data, DataType, Image, Item, Slice, FPS};
use futures::{stream::BoxStream, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    process::ChildStdin,
    sync::{self, watch},
    task::JoinHandle,
};
use tracing::{debug, error, warn};

use super::{
    codec::{self, Packet, TAG_DATA, TAG_ERROR},
    BufferError,
    DataBuffer,
    DataReader,
    DataWriter,
};
use crate::{
    ffmpeg::{Codec, DecodeOptions, FrameRange, FrameSource, VecFrames, VideoInput},
    items::ItemStore,
};

/// Decoders may round away a frame or two at the end of a stream; shortfalls
/// up to this many frames are padded by repeating the last frame.
const MAX_PAD_FRAMES: usize = 2;

const COPY_CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct VideoMeta {
    pub freq: usize,
    pub width: u32,
    pub height: u32,
}

struct VideoState {
    bytes: Vec<u8>,
    meta: Option<VideoMeta>,
    done: bool,
    err: Option<BufferError>,
}

/// Accumulates the encoded MP4 bytes of one video output.
pub struct VideoBuffer {
    state: watch::Sender<VideoState>,
}

impl VideoBuffer {
    pub fn new() -> Arc<Self> {
        let (state, _) = watch::channel(VideoState {
            bytes: Vec::new(),
            meta: None,
            done: false,
            err: None,
        });
        Arc::new(Self { state })
    }

    pub fn set_meta(&self, meta: VideoMeta) {
        self.state.send_modify(|s| s.meta = Some(meta));
    }

    pub fn append(&self, chunk: &[u8]) {
        self.state.send_modify(|s| s.bytes.extend_from_slice(chunk));
    }

    pub fn finish(&self) {
        self.state.send_modify(|s| s.done = true);
    }

    pub fn fail(&self, err: BufferError) {
        self.state.send_modify(|s| {
            if s.err.is_none() {
                s.err = Some(err);
            }
        });
    }

    pub async fn meta(&self) -> Result<VideoMeta, BufferError> {
        let mut rx = self.state.subscribe();
        let state = rx
            .wait_for(|s| s.meta.is_some() || s.err.is_some() || s.done)
            .await
            .map_err(|_| BufferError::Closed)?;
        if let Some(meta) = state.meta {
            return Ok(meta);
        }
        match &state.err {
            Some(err) => Err(err.clone()),
            None => Err(BufferError::Failed(
                "video closed before its metadata was set".to_string(),
            )),
        }
    }

    /// Bytes from `pos` on, waiting until there are some. `None` once the
    /// buffer is complete and everything was read.
    async fn read_from(&self, pos: usize) -> Result<Option<Bytes>, BufferError> {
        let mut rx = self.state.subscribe();
        let state = rx
            .wait_for(|s| s.err.is_some() || s.done || s.bytes.len() > pos)
            .await
            .map_err(|_| BufferError::Closed)?;
        if let Some(err) = &state.err {
            return Err(err.clone());
        }
        if state.bytes.len() <= pos {
            return Ok(None);
        }
        let end = state.bytes.len().min(pos + COPY_CHUNK);
        Ok(Some(Bytes::copy_from_slice(&state.bytes[pos..end])))
    }

    /// Whether the finished buffer holds any bytes.
    async fn has_bytes(&self) -> Result<bool, BufferError> {
        let mut rx = self.state.subscribe();
        let state = rx
            .wait_for(|s| s.err.is_some() || s.done || !s.bytes.is_empty())
            .await
            .map_err(|_| BufferError::Closed)?;
        match &state.err {
            Some(err) => Err(err.clone()),
            None => Ok(!state.bytes.is_empty()),
        }
    }

    pub fn stream(self: &Arc<Self>) -> BoxStream<'static, Result<Bytes>> {
        let buf = self.clone();
        futures::stream::unfold((buf, 0), |(buf, pos)| async move {
            match buf.read_from(pos).await {
                Ok(Some(chunk)) => {
                    let next = pos + chunk.len();
                    Some((Ok(chunk), (buf, next)))
                }
                Ok(None) => None,
                Err(err) => Some((Err(anyhow!(err)), (buf, usize::MAX))),
            }
        })
        .boxed()
    }

    pub async fn copy_to(&self, w: &mut (dyn AsyncWrite + Send + Unpin)) -> Result<()> {
        let mut pos = 0;
        while let Some(chunk) = self.read_from(pos).await? {
            w.write_all(&chunk).await?;
            pos += chunk.len();
        }
        Ok(())
    }

    pub async fn wait(&self) -> Result<(), BufferError> {
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
}

struct Encoder {
    stdin: ChildStdin,
    width: u32,
    height: u32,
    copier: JoinHandle<()>,
}

enum EncoderState {
    Idle,
    Running(Encoder),
    Closed,
}

/// Writes raw frames into a `VideoBuffer` through an ffmpeg encoder started
/// on the first frame.
pub struct VideoWriter {
    codec: Codec,
    buf: Arc<VideoBuffer>,
    freq: Mutex<Option<usize>>,
    encoder: sync::Mutex<EncoderState>,
}

impl VideoWriter {
    pub fn new(codec: Codec) -> Self {
        Self {
            codec,
            buf: VideoBuffer::new(),
            freq: Mutex::new(None),
            encoder: sync::Mutex::new(EncoderState::Idle),
        }
    }

    fn start_encoder(&self, width: u32, height: u32) -> Result<Encoder, BufferError> {
        let freq = (*self.freq.lock())
            .ok_or_else(|| BufferError::failed("video written before its frequency was set"))?;
        let mut child = self
            .codec
            .encode(width, height)
            .map_err(BufferError::failed)?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| BufferError::failed("encoder stdin not captured"))?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| BufferError::failed("encoder stdout not captured"))?;
        self.buf.set_meta(VideoMeta {
            freq,
            width,
            height,
        });

        let buf = self.buf.clone();
        let copier = tokio::spawn(async move {
            let mut chunk = vec![0; COPY_CHUNK];
            loop {
                match stdout.read(&mut chunk).await {
                    Ok(0) => break,
                    Ok(n) => buf.append(&chunk[..n]),
                    Err(err) => {
                        buf.fail(BufferError::failed(err));
                        return;
                    }
                }
            }
            match child.wait().await {
                Ok(status) if status.success() => buf.finish(),
                Ok(status) => {
                    error!(%status, "video encoder exited abnormally");
                    buf.fail(BufferError::Failed(format!("video encoder exited with {}", status)));
                }
                Err(err) => buf.fail(BufferError::failed(err)),
            }
        });
        debug!(width, height, freq, "started video encoder");
        Ok(Encoder {
            stdin,
            width,
            height,
            copier,
        })
    }
}

#[async_trait]
impl DataWriter for VideoWriter {
    fn set_meta(&self, freq: usize) {
        *self.freq.lock() = Some(freq);
    }

    async fn write(&self, data: Data) -> Result<(), BufferError> {
        let Data::Video(frames) = data else {
            return Err(BufferError::Failed(format!(
                "cannot write {} data to a video buffer",
                data.data_type()
            )));
        };
        let mut state = self.encoder.lock().await;
        for frame in frames {
            if let EncoderState::Idle = *state {
                *state = EncoderState::Running(self.start_encoder(frame.width, frame.height)?);
            }
            let EncoderState::Running(encoder) = &mut *state else {
                return Err(BufferError::Closed);
            };
            if (frame.width, frame.height) != (encoder.width, encoder.height) {
                return Err(BufferError::Failed(format!(
                    "frame is {}x{} but the video is {}x{}",
                    frame.width, frame.height, encoder.width, encoder.height
                )));
            }
            if let Err(err) = encoder.stdin.write_all(&frame.bytes).await {
                let err = BufferError::failed(err);
                self.buf.fail(err.clone());
                return Err(err);
            }
        }
        Ok(())
    }

    async fn close(&self) {
        let mut state = self.encoder.lock().await;
        match std::mem::replace(&mut *state, EncoderState::Closed) {
            EncoderState::Running(encoder) => {
                drop(encoder.stdin);
                if let Err(err) = encoder.copier.await {
                    self.buf.fail(BufferError::failed(err));
                }
            }
            EncoderState::Idle => {
                if let Some(freq) = *self.freq.lock() {
                    self.buf.set_meta(VideoMeta {
                        freq,
                        width: 0,
                        height: 0,
                    });
                }
                self.buf.finish();
            }
            EncoderState::Closed => {}
        }
    }

    async fn error(&self, err: BufferError) {
        let mut state = self.encoder.lock().await;
        if let EncoderState::Running(encoder) = std::mem::replace(&mut *state, EncoderState::Closed)
        {
            drop(encoder.stdin);
            encoder.copier.abort();
        }
        self.buf.fail(err);
    }

    fn buffer(self: Arc<Self>) -> Arc<dyn DataBuffer> {
        Arc::new(VideoView::from_buffer(self.buf.clone(), self.codec.clone()))
    }
}

#[derive(Clone)]
pub enum VideoSource {
    Buffer(Arc<VideoBuffer>),
    Item {
        item: Item,
        slice: Slice,
        store: Arc<ItemStore>,
    },
}

/// Metadata preceding a streamed video. Item-backed videos send only this
/// header and the receiver decodes the stored item itself.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct VideoWireMeta {
    freq: usize,
    width: u32,
    height: u32,
    resample: usize,
    rescale: Option<[u32; 2]>,
    length: Option<usize>,
    item: Option<Item>,
    slice: Option<Slice>,
}

/// A video plus the rescale and resample operations to apply when it is
/// decoded. Pushing these into ffmpeg avoids resampling decoded frames.
#[derive(Clone)]
pub struct VideoView {
    source: VideoSource,
    codec: Codec,
    rescale: Option<[u32; 2]>,
    resample: usize,
    length: Option<usize>,
}

impl VideoView {
    pub fn from_buffer(buf: Arc<VideoBuffer>, codec: Codec) -> Self {
        Self {
            source: VideoSource::Buffer(buf),
            codec,
            rescale: None,
            resample: 1,
            length: None,
        }
    }

    pub fn from_item(item: Item, slice: Slice, store: Arc<ItemStore>, codec: Codec) -> Self {
        Self {
            source: VideoSource::Item { item, slice, store },
            codec,
            rescale: None,
            resample: 1,
            length: None,
        }
    }

    pub fn rescale(&mut self, width: u32, height: u32) {
        self.rescale = Some([width, height]);
    }

    /// Keeps one frame in `factor`.
    pub fn resample(&mut self, factor: usize) {
        self.resample = self.resample.max(1) * factor.max(1);
    }

    pub fn set_length(&mut self, length: usize) {
        self.length = Some(length);
    }

    pub async fn source_meta(&self) -> Result<VideoMeta, BufferError> {
        match &self.source {
            VideoSource::Buffer(buf) => buf.meta().await,
            VideoSource::Item { item, .. } => Ok(VideoMeta {
                freq: item.freq.max(1),
                width: item.width,
                height: item.height,
            }),
        }
    }

    pub async fn freq(&self) -> Result<usize, BufferError> {
        Ok(self.source_meta().await?.freq * self.resample)
    }

    /// Output dimensions after rescaling.
    pub async fn dims(&self) -> Result<[u32; 2], BufferError> {
        match self.rescale {
            Some(dims) => Ok(dims),
            None => {
                let meta = self.source_meta().await?;
                Ok([meta.width, meta.height])
            }
        }
    }

    fn needs_transcode(&self, meta: &VideoMeta) -> bool {
        self.resample > 1 || self.rescale.is_some_and(|dims| dims != [meta.width, meta.height])
    }

    fn item_range(item: &Item, slice: &Slice) -> Result<FrameRange> {
        let (start, end) = item.record_range(slice)?;
        Ok(FrameRange {
            start,
            frames: end - start,
        })
    }

    async fn open(&self) -> Result<Box<dyn FrameSource>> {
        let meta = self.source_meta().await?;
        let mut opts = DecodeOptions {
            dims: self.dims().await?,
            sample: self.resample,
            range: None,
        };
        let input = match &self.source {
            VideoSource::Buffer(buf) => {
                if !buf.has_bytes().await? {
                    return Ok(Box::new(VecFrames::default()));
                }
                VideoInput::Stream(buf.stream())
            }
            VideoSource::Item { item, slice, store } => {
                opts.range = Some(Self::item_range(item, slice)?);
                store.video_input(item).await?
            }
        };
        debug!(
            width = opts.dims[0],
            height = opts.dims[1],
            sample = opts.sample,
            freq = meta.freq,
            "opening video decoder"
        );
        Ok(Box::new(self.codec.decode(input, opts)?))
    }

    /// Writes the video as MP4, copying the encoded bytes when no rescale or
    /// resample is requested.
    pub async fn read_mp4(&self, w: &mut (dyn AsyncWrite + Send + Unpin)) -> Result<()> {
        let meta = self.source_meta().await?;
        let transcode = self.needs_transcode(&meta);
        let mut opts = DecodeOptions {
            dims: self.dims().await?,
            sample: self.resample,
            range: None,
        };
        let input = match &self.source {
            VideoSource::Buffer(buf) => {
                if !transcode {
                    return buf.copy_to(w).await;
                }
                VideoInput::Stream(buf.stream())
            }
            VideoSource::Item { item, slice, store } => {
                if !transcode && item.slice == *slice {
                    let mut stream = store.get(&item.key).await?;
                    while let Some(chunk) = stream.next().await {
                        w.write_all(&chunk?).await?;
                    }
                    return Ok(());
                }
                opts.range = Some(Self::item_range(item, slice)?);
                store.video_input(item).await?
            }
        };
        let mut transcoder = self.codec.transcode(input, opts)?;
        tokio::io::copy(&mut transcoder.stdout, w).await?;
        transcoder.finish().await
    }

    /// Reads a streamed video written by `to_writer`.
    pub async fn from_reader<R>(r: R, codec: Codec, store: Arc<ItemStore>) -> Result<Self>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let mut r = r;
        let meta: VideoWireMeta = codec::read_meta(&mut r).await?;
        let mut view = match (meta.item, meta.slice) {
            (Some(item), Some(slice)) => VideoView::from_item(item, slice, store, codec),
            _ => {
                let buf = VideoBuffer::new();
                buf.set_meta(VideoMeta {
                    freq: meta.freq,
                    width: meta.width,
                    height: meta.height,
                });
                let writer = buf.clone();
                tokio::spawn(async move {
                    loop {
                        match codec::read_packet(&mut r).await {
                            Ok(Some(Packet::Data(bytes))) => writer.append(&bytes),
                            Ok(Some(Packet::Error(msg))) => {
                                writer.fail(BufferError::Failed(msg));
                                return;
                            }
                            Ok(None) => {
                                writer.finish();
                                return;
                            }
                            Err(err) => {
                                warn!("error decoding video stream: {:?}", err);
                                writer.fail(BufferError::failed(err));
                                return;
                            }
                        }
                    }
                });
                VideoView::from_buffer(buf, codec)
            }
        };
        view.resample = meta.resample.max(1);
        view.rescale = meta.rescale;
        view.length = meta.length;
        Ok(view)
    }
}

#[async_trait]
impl DataBuffer for VideoView {
    fn data_type(&self) -> DataType {
        DataType::Video
    }

    fn reader(&self) -> Box<dyn DataReader> {
        Box::new(VideoBufferReader::new(self.clone()))
    }

    async fn wait(&self) -> Result<(), BufferError> {
        match &self.source {
            VideoSource::Buffer(buf) => buf.wait().await,
            VideoSource::Item { .. } => Ok(()),
        }
    }

    async fn to_writer(&self, w: &mut (dyn AsyncWrite + Send + Unpin)) -> Result<()> {
        let mut meta = VideoWireMeta {
            resample: self.resample,
            rescale: self.rescale,
            length: self.length,
            ..Default::default()
        };
        let buf = match &self.source {
            VideoSource::Item { item, slice, .. } => {
                meta.freq = item.freq;
                meta.width = item.width;
                meta.height = item.height;
                meta.item = Some(item.clone());
                meta.slice = Some(slice.clone());
                return codec::write_meta(w, &meta).await;
            }
            VideoSource::Buffer(buf) => buf,
        };
        match buf.meta().await {
            Ok(source) => {
                meta.freq = source.freq;
                meta.width = source.width;
                meta.height = source.height;
                codec::write_meta(w, &meta).await?;
            }
            Err(err) => {
                codec::write_meta(w, &meta).await?;
                codec::write_packet(w, TAG_ERROR, err.to_string().as_bytes()).await?;
                return Err(err.into());
            }
        }
        let mut pos = 0;
        loop {
            match buf.read_from(pos).await {
                Ok(Some(chunk)) => {
                    pos += chunk.len();
                    codec::write_packet(w, TAG_DATA, &chunk).await?;
                }
                Ok(None) => return Ok(()),
                Err(err) => {
                    codec::write_packet(w, TAG_ERROR, err.to_string().as_bytes()).await?;
                    return Err(err.into());
                }
            }
        }
    }

    fn as_video(&self) -> Option<&VideoView> {
        Some(self)
    }
}

/// Decodes a `VideoView` frame by frame. The decoder starts on the first
/// read, so rescale and resample can still be pushed down until then.
pub struct VideoBufferReader {
    view: VideoView,
    frames: Option<Box<dyn FrameSource>>,
    cache: VecDeque<Image>,
    last: Option<Image>,
    pos: usize,
    eof: bool,
    err: Option<BufferError>,
}

impl VideoBufferReader {
    pub fn new(view: VideoView) -> Self {
        Self {
            view,
            frames: None,
            cache: VecDeque::new(),
            last: None,
            pos: 0,
            eof: false,
            err: None,
        }
    }

    /// A reader over frames from `source` instead of an ffmpeg decoder.
    pub fn with_frames(view: VideoView, source: Box<dyn FrameSource>) -> Self {
        let mut reader = Self::new(view);
        reader.frames = Some(source);
        reader
    }

    fn latch(&mut self, err: BufferError) -> BufferError {
        error!("video read failed: {}", err);
        self.err = Some(err.clone());
        err
    }

    async fn get(&mut self, n: usize, peek: bool) -> Result<Data, BufferError> {
        if n > FPS {
            return Err(BufferError::Failed(format!(
                "video reads are limited to {} frames, asked for {}",
                FPS, n
            )));
        }
        if let Some(err) = &self.err {
            return Err(err.clone());
        }
        if self.frames.is_none() && !self.eof {
            match self.view.open().await {
                Ok(frames) => self.frames = Some(frames),
                Err(err) => return Err(self.latch(BufferError::failed(err))),
            }
        }

        let want = n.max(1);
        let take = if n == 0 {
            self.cache.len()
        } else {
            n.min(self.cache.len())
        };
        let mut ims: Vec<Image> = self.cache.drain(..take).collect();
        let length = self.view.length;

        while ims.len() < want && !self.eof {
            let Some(frames) = self.frames.as_mut() else {
                break;
            };
            match frames.next_frame().await {
                Ok(Some(im)) => {
                    if length.is_some_and(|length| self.pos + ims.len() >= length) {
                        frames.close().await;
                        self.eof = true;
                    } else {
                        ims.push(im);
                    }
                }
                Ok(None) => self.eof = true,
                Err(err) => return Err(self.latch(BufferError::failed(err))),
            }
        }

        if let (true, Some(length)) = (self.eof, length) {
            let have = self.pos + ims.len();
            if ims.len() < want && have < length {
                let missing = length - have;
                if missing > MAX_PAD_FRAMES {
                    return Err(self.latch(BufferError::Failed(format!(
                        "decoder ended {} frames short of {}",
                        missing, length
                    ))));
                }
                let Some(last) = ims.last().or(self.last.as_ref()).cloned() else {
                    return Err(self.latch(BufferError::failed("decoder produced no frames")));
                };
                while ims.len() < want && self.pos + ims.len() < length {
                    ims.push(last.clone());
                }
            }
        }

        if ims.is_empty() {
            return Err(BufferError::EndOfStream);
        }
        if n > 0 && ims.len() < n && !peek {
            let available = ims.len();
            for im in ims.into_iter().rev() {
                self.cache.push_front(im);
            }
            return Err(BufferError::UnexpectedEnd {
                wanted: n,
                available,
            });
        }
        if peek {
            for im in ims.iter().rev() {
                self.cache.push_front(im.clone());
            }
        } else {
            self.pos += ims.len();
            self.last = ims.last().cloned();
        }
        Ok(Data::Video(ims))
    }
}

#[async_trait]
impl DataReader for VideoBufferReader {
    fn data_type(&self) -> DataType {
        DataType::Video
    }

    async fn read(&mut self, n: usize) -> Result<Data, BufferError> {
        self.get(n, false).await
    }

    async fn peek(&mut self, n: usize) -> Result<Data, BufferError> {
        self.get(n, true).await
    }

    async fn freq(&mut self) -> Result<usize, BufferError> {
        self.view.freq().await
    }

    async fn close(&mut self) {
        if let Some(mut frames) = self.frames.take() {
            frames.close().await;
        }
        self.cache.clear();
        self.err = Some(BufferError::Closed);
    }

    fn video_view(&self) -> Option<VideoView> {
        Some(self.view.clone())
    }
}
