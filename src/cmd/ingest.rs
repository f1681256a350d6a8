use std::path::PathBuf;

use anyhow::{anyhow, Result};
use clap::Args;
use data_model::{DataType, Segment, SegmentId, Series, SeriesId, Timeline, FPS};
use tracing::info;

use super::item_store;
use crate::config::Config;

#[derive(Args, Debug)]
pub struct IngestArgs {
    #[arg(long)]
    pub series: i64,
    #[arg(long)]
    pub series_name: String,
    #[arg(long)]
    pub data_type: DataType,
    #[arg(long, default_value_t = 1)]
    pub timeline: i64,
    #[arg(long, default_value = "default")]
    pub timeline_name: String,
    #[arg(long)]
    pub segment: i64,
    #[arg(long)]
    pub segment_name: Option<String>,
    /// Segment length in base frames. Probed for video.
    #[arg(long)]
    pub frames: Option<usize>,
    /// Base frames per record of a data file.
    #[arg(long, default_value_t = 1)]
    pub freq: usize,
    #[arg(long)]
    pub file: PathBuf,
}

pub async fn execute(args: IngestArgs, config: Config) -> Result<()> {
    let store = item_store(&config)?;
    let timeline = Timeline {
        id: args.timeline,
        name: args.timeline_name,
    };
    let series = Series {
        id: SeriesId(args.series),
        timeline: timeline.clone(),
        name: args.series_name,
        data_type: args.data_type,
    };
    let segment = Segment {
        id: SegmentId(args.segment),
        timeline,
        name: args
            .segment_name
            .unwrap_or_else(|| args.file.display().to_string()),
        frames: args.frames.unwrap_or(0),
        fps: FPS as f64,
    };

    let item = if args.data_type == DataType::Video {
        store.ingest_video(&series, segment, &args.file).await?
    } else {
        let frames = args
            .frames
            .ok_or_else(|| anyhow!("--frames is required for {} data", args.data_type))?;
        if frames == 0 {
            return Err(anyhow!("--frames must be positive"));
        }
        let bytes = tokio::fs::read(&args.file).await?;
        store
            .ingest_data(&series, &segment.to_slice(), args.freq, &bytes)
            .await?
    };
    info!(key = item.key, slice = %item.slice, "ingest complete");
    Ok(())
}
