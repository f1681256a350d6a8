use std::{collections::VecDeque, path::PathBuf, process::Stdio};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use data_model::{Image, FPS};
use futures::{stream::BoxStream, StreamExt};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    process::{Child, ChildStdin, ChildStdout, Command},
    task::JoinHandle,
};
use tracing::{debug, warn};

use crate::config::FfmpegConfig;

/// Source of decoded frames. `Ok(None)` marks the end of the stream.
#[async_trait]
pub trait FrameSource: Send {
    async fn next_frame(&mut self) -> Result<Option<Image>>;

    async fn close(&mut self);
}

/// Frames held in memory.
#[derive(Default)]
pub struct VecFrames(VecDeque<Image>);

impl VecFrames {
    pub fn new(frames: Vec<Image>) -> Self {
        Self(frames.into())
    }
}

#[async_trait]
impl FrameSource for VecFrames {
    async fn next_frame(&mut self) -> Result<Option<Image>> {
        Ok(self.0.pop_front())
    }

    async fn close(&mut self) {
        self.0.clear();
    }
}

/// Encoded video handed to ffmpeg, either a file it can seek in or bytes
/// piped through stdin.
pub enum VideoInput {
    Path(PathBuf),
    Stream(BoxStream<'static, Result<Bytes>>),
}

/// Frames `[start, start + frames)` of the input, relative to its first frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameRange {
    pub start: usize,
    pub frames: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecodeOptions {
    pub dims: [u32; 2],
    /// Keep one frame in `sample`.
    pub sample: usize,
    pub range: Option<FrameRange>,
}

impl DecodeOptions {
    fn filter(&self) -> String {
        format!(
            "scale={}x{},fps={}/{}",
            self.dims[0],
            self.dims[1],
            FPS,
            self.sample.max(1)
        )
    }

    fn expected_frames(&self) -> Option<usize> {
        self.range
            .map(|range| range.frames.div_ceil(self.sample.max(1)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbeInfo {
    pub width: u32,
    pub height: u32,
    pub duration: f64,
}

impl ProbeInfo {
    pub fn frames(&self) -> usize {
        (self.duration * FPS as f64).round() as usize
    }
}

/// Seconds offset of frame `index` as ffmpeg expects it, e.g. `1.04`.
pub fn ffmpeg_time(index: usize) -> String {
    let ts = index * 100 / FPS;
    format!("{}.{:02}", ts / 100, ts % 100)
}

#[derive(Debug, Clone)]
pub struct Codec {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
}

impl Default for Codec {
    fn default() -> Self {
        Self::new(&FfmpegConfig::default())
    }
}

impl Codec {
    pub fn new(config: &FfmpegConfig) -> Self {
        Self {
            ffmpeg: PathBuf::from(&config.ffmpeg_path),
            ffprobe: PathBuf::from(&config.ffprobe_path),
        }
    }

    fn ffmpeg(&self, args: &[String], stdin: bool) -> Result<Child> {
        debug!(args = args.join(" "), "starting ffmpeg");
        Command::new(&self.ffmpeg)
            .arg("-threads")
            .arg("2")
            .args(args)
            .stdin(if stdin { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to start {}", self.ffmpeg.display()))
    }

    /// Input arguments for `input`, plus the stream to pump into stdin.
    fn input_args(
        input: VideoInput,
        range: Option<FrameRange>,
        args: &mut Vec<String>,
    ) -> Option<BoxStream<'static, Result<Bytes>>> {
        if let Some(range) = range {
            args.extend(["-ss".to_string(), ffmpeg_time(range.start)]);
        }
        match input {
            VideoInput::Path(path) => {
                args.extend(["-i".to_string(), path.display().to_string()]);
                None
            }
            VideoInput::Stream(stream) => {
                args.extend(["-f", "mp4", "-i", "-"].map(String::from));
                Some(stream)
            }
        }
    }

    /// Starts an encoder turning raw RGB24 frames on stdin into fragmented
    /// MP4 on stdout.
    pub fn encode(&self, width: u32, height: u32) -> Result<Child> {
        let framerate = FPS.to_string();
        let size = format!("{}x{}", width, height);
        let args = [
            "-f",
            "rawvideo",
            "-framerate",
            framerate.as_str(),
            "-s",
            size.as_str(),
            "-pix_fmt",
            "rgb24",
            "-i",
            "-",
        ]
        .into_iter()
        .map(String::from)
        .chain(Self::mp4_output_args(&format!("fps={}", FPS)))
        .collect::<Vec<_>>();
        self.ffmpeg(&args, true)
    }

    fn mp4_output_args(filter: &str) -> Vec<String> {
        let gop = FPS.to_string();
        [
            "-vcodec",
            "libx264",
            "-preset",
            "ultrafast",
            "-tune",
            "zerolatency",
            "-g",
            gop.as_str(),
            "-vf",
            filter,
            "-f",
            "mp4",
            "-pix_fmt",
            "yuv420p",
            "-movflags",
            "faststart+frag_keyframe+empty_moov",
            "-",
        ]
        .into_iter()
        .map(String::from)
        .collect()
    }

    /// Decodes `input` to raw frames with scaling and sampling applied by
    /// ffmpeg.
    pub fn decode(&self, input: VideoInput, opts: DecodeOptions) -> Result<FfmpegReader> {
        let mut args = Vec::new();
        let feed = Self::input_args(input, opts.range, &mut args);
        if let Some(range) = opts.range {
            args.extend([
                "-vframes".to_string(),
                range.frames.div_ceil(opts.sample.max(1)).to_string(),
            ]);
        }
        args.extend(
            [
                "-c:v", "rawvideo", "-pix_fmt", "rgb24", "-f", "rawvideo", "-vf",
            ]
            .map(String::from),
        );
        args.push(opts.filter());
        args.push("-".to_string());

        let mut child = self.ffmpeg(&args, feed.is_some())?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("ffmpeg stdout not captured"))?;
        let feeder = match feed {
            Some(stream) => Some(pump(stream, take_stdin(&mut child)?)),
            None => None,
        };
        Ok(FfmpegReader {
            child,
            stdout,
            width: opts.dims[0],
            height: opts.dims[1],
            expected_frames: opts.expected_frames(),
            count: 0,
            last: None,
            feeder,
        })
    }

    /// Re-encodes `input` as MP4 with scaling and sampling applied.
    pub fn transcode(&self, input: VideoInput, opts: DecodeOptions) -> Result<Transcoder> {
        let mut args = Vec::new();
        let feed = Self::input_args(input, opts.range, &mut args);
        if let Some(range) = opts.range {
            args.extend(["-to".to_string(), ffmpeg_time(range.frames)]);
        }
        args.extend(Self::mp4_output_args(&opts.filter()));

        let mut child = self.ffmpeg(&args, feed.is_some())?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("ffmpeg stdout not captured"))?;
        let feeder = match feed {
            Some(stream) => Some(pump(stream, take_stdin(&mut child)?)),
            None => None,
        };
        Ok(Transcoder {
            child,
            stdout,
            feeder,
        })
    }

    pub async fn probe(&self, path: &std::path::Path) -> Result<ProbeInfo> {
        let output = Command::new(&self.ffprobe)
            .args([
                "-v",
                "error",
                "-select_streams",
                "v:0",
                "-show_entries",
                "stream=width,height,duration",
                "-of",
                "csv=s=,:p=0",
            ])
            .arg(path)
            .stdin(Stdio::null())
            .output()
            .await
            .with_context(|| format!("failed to start {}", self.ffprobe.display()))?;
        if !output.status.success() {
            return Err(anyhow!(
                "ffprobe failed on {}: {}",
                path.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        parse_probe(&String::from_utf8_lossy(&output.stdout))
    }
}

fn parse_probe(out: &str) -> Result<ProbeInfo> {
    let line = out
        .lines()
        .next()
        .ok_or_else(|| anyhow!("ffprobe printed nothing"))?;
    let parts: Vec<&str> = line.trim().split(',').collect();
    let [width, height, duration] = parts.as_slice() else {
        return Err(anyhow!("unexpected ffprobe output: {:?}", line));
    };
    Ok(ProbeInfo {
        width: width.parse()?,
        height: height.parse()?,
        duration: duration.parse()?,
    })
}

fn take_stdin(child: &mut Child) -> Result<ChildStdin> {
    child
        .stdin
        .take()
        .ok_or_else(|| anyhow!("ffmpeg stdin not captured"))
}

fn pump(mut stream: BoxStream<'static, Result<Bytes>>, mut stdin: ChildStdin) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(err) => {
                    warn!("error reading video input: {:?}", err);
                    break;
                }
            };
            // ffmpeg closes stdin once it has read enough frames
            if stdin.write_all(&chunk).await.is_err() {
                break;
            }
        }
    })
}

/// Raw RGB24 frames read from a decoding ffmpeg process.
pub struct FfmpegReader {
    child: Child,
    stdout: ChildStdout,
    width: u32,
    height: u32,
    expected_frames: Option<usize>,
    count: usize,
    last: Option<Image>,
    feeder: Option<JoinHandle<()>>,
}

#[async_trait]
impl FrameSource for FfmpegReader {
    async fn next_frame(&mut self) -> Result<Option<Image>> {
        let mut buf = vec![0; Image::frame_size(self.width, self.height)];
        match self.stdout.read_exact(&mut buf).await {
            Ok(_) => {
                let im = Image::from_bytes(self.width, self.height, buf.into())?;
                self.last = Some(im.clone());
                self.count += 1;
                Ok(Some(im))
            }
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                // seeking can lose the final frame; repeat the last one
                if let (Some(expected), Some(last)) = (self.expected_frames, &self.last) {
                    if self.count < expected {
                        self.count += 1;
                        return Ok(Some(last.clone()));
                    }
                }
                let status = self.child.wait().await?;
                if !status.success() && self.count == 0 {
                    return Err(anyhow!("ffmpeg decode exited with {}", status));
                }
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn close(&mut self) {
        if let Some(feeder) = self.feeder.take() {
            feeder.abort();
        }
        let _ = self.child.start_kill();
        let _ = self.child.wait().await;
    }
}

/// An MP4-to-MP4 ffmpeg process.
pub struct Transcoder {
    child: Child,
    pub stdout: ChildStdout,
    feeder: Option<JoinHandle<()>>,
}

impl Transcoder {
    pub async fn finish(mut self) -> Result<()> {
        let status = self.child.wait().await?;
        if let Some(feeder) = self.feeder.take() {
            feeder.abort();
        }
        if !status.success() {
            return Err(anyhow!("ffmpeg transcode exited with {}", status));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ffmpeg_time() {
        assert_eq!(ffmpeg_time(0), "0.00");
        assert_eq!(ffmpeg_time(26), "1.04");
        assert_eq!(ffmpeg_time(25 * 61), "61.00");
    }

    #[test]
    fn test_parse_probe() {
        let info = parse_probe("1280,720,10.000000\n").unwrap();
        assert_eq!(info.width, 1280);
        assert_eq!(info.height, 720);
        assert_eq!(info.frames(), 250);
        assert!(parse_probe("1280,720\n").is_err());
        assert!(parse_probe("").is_err());
    }

    #[test]
    fn test_decode_options() {
        let opts = DecodeOptions {
            dims: [640, 360],
            sample: 4,
            range: Some(FrameRange {
                start: 10,
                frames: 50,
            }),
        };
        assert_eq!(opts.filter(), "scale=640x360,fps=25/4");
        assert_eq!(opts.expected_frames(), Some(13));
    }

    #[tokio::test]
    async fn test_vec_frames() -> Result<()> {
        let mut frames = VecFrames::new(vec![Image::solid(2, 2, [0, 0, 0])]);
        assert!(frames.next_frame().await?.is_some());
        assert!(frames.next_frame().await?.is_none());
        Ok(())
    }
}
