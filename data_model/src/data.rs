use anyhow::{anyhow, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, AsRefStr, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DataType {
    Detection,
    Track,
    Class,
    Int,
    Float,
    String,
    Text,
    Video,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Detection {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub score: f64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub class: String,
    #[serde(default)]
    pub track_id: i64,
}

fn is_zero(v: &f64) -> bool {
    *v == 0.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DetectionFrame {
    #[serde(default)]
    pub detections: Vec<Detection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canvas_dims: Option<[u32; 2]>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RichText {
    pub text: String,
    #[serde(default)]
    pub x: i32,
    #[serde(default)]
    pub y: i32,
}

/// One decoded RGB24 frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Image {
    pub width: u32,
    pub height: u32,
    pub bytes: Bytes,
}

impl Image {
    pub fn frame_size(width: u32, height: u32) -> usize {
        width as usize * height as usize * 3
    }

    pub fn from_bytes(width: u32, height: u32, bytes: Bytes) -> Result<Self> {
        if bytes.len() != Self::frame_size(width, height) {
            return Err(anyhow!(
                "frame of {}x{} needs {} bytes, got {}",
                width,
                height,
                Self::frame_size(width, height),
                bytes.len()
            ));
        }
        Ok(Self {
            width,
            height,
            bytes,
        })
    }

    pub fn solid(width: u32, height: u32, rgb: [u8; 3]) -> Self {
        let bytes: Vec<u8> = rgb
            .iter()
            .copied()
            .cycle()
            .take(Self::frame_size(width, height))
            .collect();
        Self {
            width,
            height,
            bytes: bytes.into(),
        }
    }
}

/// A typed run of records. Each variant holds one record per sampled frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Data {
    Detection(Vec<DetectionFrame>),
    Track(Vec<DetectionFrame>),
    Class(Vec<i64>),
    Int(Vec<i64>),
    Float(Vec<f64>),
    String(Vec<String>),
    Text(Vec<RichText>),
    Video(Vec<Image>),
}

impl Data {
    pub fn new(data_type: DataType) -> Self {
        match data_type {
            DataType::Detection => Data::Detection(Vec::new()),
            DataType::Track => Data::Track(Vec::new()),
            DataType::Class => Data::Class(Vec::new()),
            DataType::Int => Data::Int(Vec::new()),
            DataType::Float => Data::Float(Vec::new()),
            DataType::String => Data::String(Vec::new()),
            DataType::Text => Data::Text(Vec::new()),
            DataType::Video => Data::Video(Vec::new()),
        }
    }

    pub fn data_type(&self) -> DataType {
        match self {
            Data::Detection(_) => DataType::Detection,
            Data::Track(_) => DataType::Track,
            Data::Class(_) => DataType::Class,
            Data::Int(_) => DataType::Int,
            Data::Float(_) => DataType::Float,
            Data::String(_) => DataType::String,
            Data::Text(_) => DataType::Text,
            Data::Video(_) => DataType::Video,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Data::Detection(d) | Data::Track(d) => d.len(),
            Data::Class(d) | Data::Int(d) => d.len(),
            Data::Float(d) => d.len(),
            Data::String(d) => d.len(),
            Data::Text(d) => d.len(),
            Data::Video(d) => d.len(),
        }
    }

    /// True when every record holds its default value. Video is never empty.
    pub fn is_empty(&self) -> bool {
        match self {
            Data::Detection(d) | Data::Track(d) => d.iter().all(|f| f.detections.is_empty()),
            Data::Class(d) | Data::Int(d) => d.iter().all(|v| *v == 0),
            Data::Float(d) => d.iter().all(|v| *v == 0.0),
            Data::String(d) => d.iter().all(|v| v.is_empty()),
            Data::Text(d) => d.iter().all(|v| v.text.is_empty()),
            Data::Video(_) => false,
        }
    }

    /// Copies records `[i, j)`, clamping `j` to the length.
    pub fn slice(&self, i: usize, j: usize) -> Data {
        let j = j.min(self.len());
        let i = i.min(j);
        match self {
            Data::Detection(d) => Data::Detection(d[i..j].to_vec()),
            Data::Track(d) => Data::Track(d[i..j].to_vec()),
            Data::Class(d) => Data::Class(d[i..j].to_vec()),
            Data::Int(d) => Data::Int(d[i..j].to_vec()),
            Data::Float(d) => Data::Float(d[i..j].to_vec()),
            Data::String(d) => Data::String(d[i..j].to_vec()),
            Data::Text(d) => Data::Text(d[i..j].to_vec()),
            Data::Video(d) => Data::Video(d[i..j].to_vec()),
        }
    }

    pub fn append(&mut self, other: Data) -> Result<()> {
        match (self, other) {
            (Data::Detection(a), Data::Detection(b)) | (Data::Track(a), Data::Track(b)) => {
                a.extend(b)
            }
            (Data::Class(a), Data::Class(b)) | (Data::Int(a), Data::Int(b)) => a.extend(b),
            (Data::Float(a), Data::Float(b)) => a.extend(b),
            (Data::String(a), Data::String(b)) => a.extend(b),
            (Data::Text(a), Data::Text(b)) => a.extend(b),
            (Data::Video(a), Data::Video(b)) => a.extend(b),
            (a, b) => {
                return Err(anyhow!(
                    "cannot append {} data to {} data",
                    b.data_type(),
                    a.data_type()
                ))
            }
        }
        Ok(())
    }

    /// Pads with default records up to `length`. Video repeats its last frame
    /// and stays unchanged when it has no frame to repeat.
    pub fn ensure_length(&mut self, length: usize) {
        match self {
            Data::Detection(d) | Data::Track(d) => d.resize_with(length.max(d.len()), Default::default),
            Data::Class(d) | Data::Int(d) => d.resize(length.max(d.len()), 0),
            Data::Float(d) => d.resize(length.max(d.len()), 0.0),
            Data::String(d) => d.resize_with(length.max(d.len()), Default::default),
            Data::Text(d) => d.resize_with(length.max(d.len()), Default::default),
            Data::Video(d) => {
                if let Some(last) = d.last().cloned() {
                    d.resize(length.max(d.len()), last);
                }
            }
        }
    }

    pub fn truncate(&mut self, length: usize) {
        match self {
            Data::Detection(d) | Data::Track(d) => d.truncate(length),
            Data::Class(d) | Data::Int(d) => d.truncate(length),
            Data::Float(d) => d.truncate(length),
            Data::String(d) => d.truncate(length),
            Data::Text(d) => d.truncate(length),
            Data::Video(d) => d.truncate(length),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let bytes = match self {
            Data::Detection(d) | Data::Track(d) => serde_json::to_vec(d)?,
            Data::Class(d) | Data::Int(d) => serde_json::to_vec(d)?,
            Data::Float(d) => serde_json::to_vec(d)?,
            Data::String(d) => serde_json::to_vec(d)?,
            Data::Text(d) => serde_json::to_vec(d)?,
            Data::Video(_) => return Err(anyhow!("video data cannot be encoded as records")),
        };
        Ok(bytes)
    }

    pub fn decode(data_type: DataType, bytes: &[u8]) -> Result<Data> {
        let data = match data_type {
            DataType::Detection => Data::Detection(serde_json::from_slice(bytes)?),
            DataType::Track => Data::Track(serde_json::from_slice(bytes)?),
            DataType::Class => Data::Class(serde_json::from_slice(bytes)?),
            DataType::Int => Data::Int(serde_json::from_slice(bytes)?),
            DataType::Float => Data::Float(serde_json::from_slice(bytes)?),
            DataType::String => Data::String(serde_json::from_slice(bytes)?),
            DataType::Text => Data::Text(serde_json::from_slice(bytes)?),
            DataType::Video => return Err(anyhow!("video data cannot be decoded from records")),
        };
        Ok(data)
    }

    pub fn detections(&self) -> Option<&[DetectionFrame]> {
        match self {
            Data::Detection(d) | Data::Track(d) => Some(d),
            _ => None,
        }
    }
}
