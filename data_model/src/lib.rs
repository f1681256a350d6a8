pub mod data;
pub mod test_objects;

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    fmt::{self, Display},
    hash::{Hash, Hasher},
    str::FromStr,
    time::Duration,
};

use anyhow::{anyhow, Result};
pub use data::*;
use derive_builder::Builder;
use serde::{Deserialize, Serialize};

/// Base frame rate of every stored video. Frequencies are expressed relative
/// to this rate: a stream with freq 4 carries one record per 4 base frames.
pub const FPS: usize = 25;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[serde(transparent)]
pub struct NodeId(pub i64);

impl Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for NodeId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(NodeId(s.parse()?))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[serde(transparent)]
pub struct SeriesId(pub i64);

impl Display for SeriesId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[serde(transparent)]
pub struct SegmentId(pub i64);

impl Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[serde(transparent)]
pub struct QueryId(pub i64);

impl Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Timeline {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Segment {
    pub id: SegmentId,
    #[serde(default)]
    pub timeline: Timeline,
    #[serde(default)]
    pub name: String,
    pub frames: usize,
    #[serde(default)]
    pub fps: f64,
}

impl Segment {
    pub fn to_slice(&self) -> Slice {
        Slice {
            segment: self.clone(),
            start: 0,
            end: self.frames,
        }
    }
}

/// Half-open frame range `[start, end)` within one segment.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Slice {
    pub segment: Segment,
    pub start: usize,
    pub end: usize,
}

impl Slice {
    pub fn new(segment: Segment, start: usize, end: usize) -> Result<Self> {
        if start > end {
            return Err(anyhow!("invalid slice [{}:{}): start after end", start, end));
        }
        Ok(Self {
            segment,
            start,
            end,
        })
    }

    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `other` lies entirely inside this slice. Slices from different
    /// segments never cover each other.
    pub fn covers(&self, other: &Slice) -> bool {
        self.segment.id == other.segment.id && self.start <= other.start && self.end >= other.end
    }
}

impl PartialEq for Slice {
    fn eq(&self, other: &Self) -> bool {
        self.segment.id == other.segment.id && self.start == other.start && self.end == other.end
    }
}

impl Eq for Slice {}

impl Hash for Slice {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.segment.id.hash(state);
        self.start.hash(state);
        self.end.hash(state);
    }
}

impl Display for Slice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}:{}]", self.segment.id, self.start, self.end)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Series {
    pub id: SeriesId,
    #[serde(default)]
    pub timeline: Timeline,
    pub name: String,
    pub data_type: DataType,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, strum::Display, strum::EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ItemFormat {
    Json,
    Mp4,
}

/// A stored chunk of one series covering `slice`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Item {
    pub key: String,
    pub slice: Slice,
    pub series: Series,
    pub format: ItemFormat,
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
    pub freq: usize,
}

impl Item {
    /// Record range of this item's payload that corresponds to `slice`,
    /// rounding the end up so a partial trailing record is kept.
    pub fn record_range(&self, slice: &Slice) -> Result<(usize, usize)> {
        if !self.slice.covers(slice) {
            return Err(anyhow!(
                "item {} covers {} which does not contain {}",
                self.key,
                self.slice,
                slice
            ));
        }
        let freq = self.freq.max(1);
        let start = (slice.start - self.slice.start) / freq;
        let end = (slice.end - self.slice.start).div_ceil(freq);
        Ok((start, end))
    }
}

/// Serialized in its compact form: `n3` for node 3, `s0` for the first
/// vector series.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(try_from = "String", into = "String")]
pub enum Parent {
    /// Output of another node in the same query.
    Node(NodeId),
    /// One of the vector's source series, by position.
    Series(usize),
}

impl Parent {
    pub fn parse_list(s: &str) -> Result<Vec<Parent>> {
        if s.trim().is_empty() {
            return Ok(Vec::new());
        }
        s.split(',').map(|part| part.trim().parse()).collect()
    }
}

impl FromStr for Parent {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_at_checked(1) {
            Some(("n", id)) => Ok(Parent::Node(id.parse()?)),
            Some(("s", idx)) => Ok(Parent::Series(idx.parse()?)),
            _ => Err(anyhow!("invalid parent: {:?}", s)),
        }
    }
}

impl TryFrom<String> for Parent {
    type Error = anyhow::Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<Parent> for String {
    fn from(parent: Parent) -> String {
        parent.to_string()
    }
}

impl Display for Parent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Parent::Node(id) => write!(f, "n{}", id),
            Parent::Series(idx) => write!(f, "s{}", idx),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Builder)]
pub struct Node {
    pub id: NodeId,
    #[builder(default)]
    #[serde(default)]
    pub name: String,
    #[builder(default)]
    #[serde(default)]
    pub parents: Vec<Parent>,
    #[serde(rename = "type")]
    pub kind: String,
    pub data_type: DataType,
    #[builder(default)]
    #[serde(default)]
    pub code: String,
    #[builder(default)]
    #[serde(default)]
    pub query_id: QueryId,
}

impl Node {
    pub fn node_parents(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.parents.iter().filter_map(|parent| match parent {
            Parent::Node(id) => Some(*id),
            Parent::Series(_) => None,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Query {
    pub id: QueryId,
    #[serde(default)]
    pub name: String,
    pub nodes: HashMap<NodeId, Node>,
    #[serde(default)]
    pub outputs: Vec<Vec<Parent>>,
    #[serde(default)]
    pub selector: Option<NodeId>,
}

impl Query {
    pub fn node(&self, id: NodeId) -> Result<&Node> {
        self.nodes
            .get(&id)
            .ok_or_else(|| anyhow!("query {} has no node {}", self.id, id))
    }

    pub fn selector_node(&self) -> Result<Option<&Node>> {
        self.selector.map(|id| self.node(id)).transpose()
    }

    /// Checks that every node parent and output refers to a known node and
    /// that node-to-node edges form a DAG.
    pub fn validate(&self) -> Result<()> {
        for node in self.nodes.values() {
            for parent in node.node_parents() {
                self.node(parent)?;
            }
        }
        for group in &self.outputs {
            for parent in group {
                if let Parent::Node(id) = parent {
                    self.node(*id)?;
                }
            }
        }
        self.selector_node()?;

        let mut done: HashSet<NodeId> = HashSet::new();
        let mut ids: Vec<&NodeId> = self.nodes.keys().collect();
        ids.sort();
        for id in ids {
            let mut path = Vec::new();
            self.visit(*id, &mut path, &mut done)?;
        }
        Ok(())
    }

    fn visit(&self, id: NodeId, path: &mut Vec<NodeId>, done: &mut HashSet<NodeId>) -> Result<()> {
        if done.contains(&id) {
            return Ok(());
        }
        if path.contains(&id) {
            return Err(anyhow!("query {} has a cycle through node {}", self.id, id));
        }
        path.push(id);
        for parent in self.node(id)?.node_parents() {
            self.visit(parent, path, done)?;
        }
        path.pop();
        done.insert(id);
        Ok(())
    }
}

pub const DEFAULT_TEMPLATE: &str = "default";
pub const CONTAINER_RESOURCE: &str = "container";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Environment {
    pub template: String,
    pub requirements: BTreeMap<String, i64>,
    /// Node this environment was created for; unset for the shared default.
    #[serde(default)]
    pub ref_id: Option<NodeId>,
}

impl Environment {
    pub fn default_env() -> Self {
        Self {
            template: DEFAULT_TEMPLATE.to_string(),
            requirements: BTreeMap::from([(CONTAINER_RESOURCE.to_string(), 1)]),
            ref_id: None,
        }
    }

    pub fn is_default(&self) -> bool {
        self.ref_id.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EnvSetId {
    pub kind: String,
    pub ref_id: i64,
}

impl EnvSetId {
    pub fn query(id: QueryId) -> Self {
        Self {
            kind: "query".to_string(),
            ref_id: id.0,
        }
    }
}

impl Display for EnvSetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.ref_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EnvSet {
    pub id: EnvSetId,
    pub environments: Vec<Environment>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Machine {
    pub base_url: String,
    pub resources: BTreeMap<String, i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Container {
    pub uuid: String,
    pub environment: Environment,
    pub base_url: String,
    #[serde(default)]
    pub machine_idx: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ExecOptions {
    /// Persist video outputs as well as typed ones.
    #[serde(default)]
    pub persist_video: bool,
    /// Ignore persisted items and persist nothing.
    #[serde(default)]
    pub tuning: bool,
    /// Handled by the container: skip persisting outputs.
    #[serde(default)]
    pub no_persist: bool,
    /// Handled by the coordinator: recompute even if outputs are stored.
    #[serde(default)]
    pub ignore_items: bool,
    #[serde(default)]
    pub selector: Option<NodeId>,
    #[serde(default)]
    pub no_selector: bool,
    #[serde(default)]
    pub outputs: Option<Vec<Vec<Parent>>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct TimeStats {
    #[serde(with = "duration_nanos")]
    pub t: Duration,
    pub count: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct IdleStats {
    pub fraction: f64,
    pub count: u64,
}

/// Per-node execution statistics reported by containers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct StatsSample {
    pub time: TimeStats,
    pub idle: IdleStats,
}

impl StatsSample {
    /// Count-weighted average of two samples.
    pub fn add(&self, other: &StatsSample) -> StatsSample {
        let mut sum = StatsSample::default();
        let count = self.time.count + other.time.count;
        if count > 0 {
            let total = self.time.t.as_nanos() * self.time.count as u128 +
                other.time.t.as_nanos() * other.time.count as u128;
            sum.time = TimeStats {
                t: Duration::from_nanos((total / count as u128) as u64),
                count,
            };
        }
        let count = self.idle.count + other.idle.count;
        if count > 0 {
            sum.idle = IdleStats {
                fraction: (self.idle.fraction * self.idle.count as f64 +
                    other.idle.fraction * other.idle.count as f64) /
                    count as f64,
                count,
            };
        }
        sum
    }
}

mod duration_nanos {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_nanos() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let nanos = u64::deserialize(deserializer)?;
        Ok(Duration::from_nanos(nanos))
    }
}
