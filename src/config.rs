use crate::builder::heuristics;
use crate::metadata::Subset;
use crate::tile::DataType;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Worker split for a build: `work` threads stream input files, `clip`
/// threads serialize and evict chunks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Threads {
    pub work: u64,
    pub clip: u64,
}

impl Threads {
    /// Split a bare total by the work:clip heuristic.
    pub fn from_total(total: u64) -> Self {
        let total = total.max(2);
        let work = ((total as f64 * heuristics::WORK_TO_CLIP_RATIO).round() as u64).max(1);
        Self {
            work,
            clip: (total - work).max(1),
        }
    }

    /// Parse `"N"` or `"N,M"`.
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        let invalid = || ConfigError::InvalidThreads(s.to_string());
        match s.split_once(',') {
            Some((work, clip)) => {
                let work = work.trim().parse::<u64>().map_err(|_| invalid())?;
                let clip = clip.trim().parse::<u64>().map_err(|_| invalid())?;
                if work == 0 || clip == 0 {
                    return Err(invalid());
                }
                Ok(Self { work, clip })
            }
            None => {
                let total = s.trim().parse::<u64>().map_err(|_| invalid())?;
                if total == 0 {
                    return Err(invalid());
                }
                Ok(Self::from_total(total))
            }
        }
    }

    pub fn total(&self) -> u64 {
        self.work + self.clip
    }
}

impl Default for Threads {
    fn default() -> Self {
        Self::from_total(8)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConfigError {
    NoInput,
    NoPoints,
    InvalidThreads(String),
    InvalidSubset(String),
    InvalidSpan(u64),
    InvalidNodeSizes { min: u64, max: u64 },
    LaszipUnavailable,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoInput => write!(f, "no input files specified"),
            Self::NoPoints => write!(f, "inputs contain no readable points"),
            Self::InvalidThreads(s) => write!(f, "invalid thread specification '{s}'"),
            Self::InvalidSubset(s) => write!(f, "invalid subset specification '{s}'"),
            Self::InvalidSpan(span) => {
                write!(f, "span {span} must be a power of two of at least 2")
            }
            Self::InvalidNodeSizes { min, max } => {
                write!(f, "minNodeSize {min} must not exceed maxNodeSize {max}")
            }
            Self::LaszipUnavailable => {
                write!(f, "data type 'laszip' requires a laszip codec, which this build does not include")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Parsed build configuration. The CLI produces one of these; resume merges
/// the stored build parameters over it.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BuildConfig {
    pub input: Vec<String>,
    pub output: String,
    pub tmp: Option<String>,
    pub threads: Threads,
    pub limit: u64,
    pub force: bool,
    pub deep: bool,
    pub trust_headers: bool,
    pub absolute: bool,
    pub reprojection: Option<String>,
    pub progress_interval: u64,
    pub subset: Option<Subset>,
    pub data_type: DataType,
    pub span: u64,
    pub min_node_size: u64,
    pub max_node_size: u64,
    pub sleep_count: u64,
    pub hierarchy_step: u64,
    pub verbose: bool,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            input: Vec::new(),
            output: String::new(),
            tmp: None,
            threads: Threads::default(),
            limit: 0,
            force: false,
            deep: false,
            trust_headers: true,
            absolute: false,
            reprojection: None,
            progress_interval: 10,
            subset: None,
            data_type: DataType::Binary,
            span: heuristics::DEFAULT_SPAN,
            min_node_size: heuristics::MIN_NODE_SIZE,
            max_node_size: heuristics::MAX_NODE_SIZE,
            sleep_count: heuristics::SLEEP_COUNT,
            hierarchy_step: 0,
            verbose: true,
        }
    }
}

impl BuildConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.data_type == DataType::Laszip {
            return Err(ConfigError::LaszipUnavailable);
        }
        if self.span < 2 || !self.span.is_power_of_two() {
            return Err(ConfigError::InvalidSpan(self.span));
        }
        if self.min_node_size > self.max_node_size {
            return Err(ConfigError::InvalidNodeSizes {
                min: self.min_node_size,
                max: self.max_node_size,
            });
        }
        Ok(())
    }
}

/// Parse the CLI's `i/of` subset form.
pub fn parse_subset(s: &str) -> Result<Subset, ConfigError> {
    let invalid = || ConfigError::InvalidSubset(s.to_string());
    let (id, of) = s.split_once('/').ok_or_else(invalid)?;
    let id = id.trim().parse::<u64>().map_err(|_| invalid())?;
    let of = of.trim().parse::<u64>().map_err(|_| invalid())?;
    Subset::new(id, of).map_err(|_| invalid())
}
