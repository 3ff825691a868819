use crate::builder::heuristics;
use crate::endpoint::{Endpoint, Endpoints};
use crate::shared::{Bounds, Schema};
use crate::tile::DataType;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;

pub const EPT_VERSION: &str = "1.1.0";

/// One disjoint partition of the input domain. `of` must be a power of four;
/// the partitions tile the cube's x/y footprint in a 2^k by 2^k grid.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subset {
    pub id: u64,
    pub of: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SubsetError {
    NotAPowerOfFour(u64),
    IdOutOfRange { id: u64, of: u64 },
}

impl fmt::Display for SubsetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotAPowerOfFour(of) => {
                write!(f, "subset count {of} must be a power of four")
            }
            Self::IdOutOfRange { id, of } => {
                write!(f, "subset id {id} out of range 1..={of}")
            }
        }
    }
}

impl std::error::Error for SubsetError {}

impl Subset {
    pub fn new(id: u64, of: u64) -> Result<Self, SubsetError> {
        let power_of_four = of != 0 && of.is_power_of_two() && of.trailing_zeros() % 2 == 0;
        if !power_of_four {
            return Err(SubsetError::NotAPowerOfFour(of));
        }
        if id == 0 || id > of {
            return Err(SubsetError::IdOutOfRange { id, of });
        }
        Ok(Self { id, of })
    }

    /// Depth at which each node becomes exclusively owned by one subset.
    pub fn shared_depth(&self) -> u64 {
        u64::from(self.of.trailing_zeros() / 2)
    }

    /// Carve this subset's cell out of the cube's x/y footprint.
    pub fn bounds(&self, cube: &Bounds) -> Bounds {
        let cells = 1u64 << self.shared_depth();
        let index = self.id - 1;
        let cx = index % cells;
        let cy = index / cells;
        let width = cube.width() / cells as f64;
        let mut min = cube.min();
        let mut max = cube.max();
        min.x = cube.min().x + cx as f64 * width;
        max.x = min.x + width;
        min.y = cube.min().y + cy as f64 * width;
        max.y = min.y + width;
        Bounds::new(min, max)
    }
}

/// Everything the tree needs to know about itself: geometry, record layout,
/// tile format, node-size policy, and the subset marker.
#[derive(Clone, Debug)]
pub struct Metadata {
    pub bounds: Bounds,
    pub bounds_conforming: Bounds,
    pub schema: Schema,
    pub srs: Option<String>,
    pub data_type: DataType,
    pub span: u64,
    pub start_depth: u64,
    pub subset: Option<Subset>,
    pub min_node_size: u64,
    pub max_node_size: u64,
    pub sleep_count: u64,
    pub hierarchy_step: u64,
}

impl Metadata {
    pub fn point_size(&self) -> usize {
        self.schema.point_size()
    }

    pub fn span_shift(&self) -> u64 {
        u64::from(self.span.trailing_zeros())
    }

    pub fn shared_depth(&self) -> u64 {
        self.subset.map(|s| s.shared_depth()).unwrap_or(0)
    }

    /// Postfix for build-wide artifacts (metadata, hierarchy, manifest).
    pub fn postfix(&self) -> String {
        match self.subset {
            Some(subset) => format!("-{}", subset.id),
            None => String::new(),
        }
    }

    /// Postfix for a data tile. Nodes at or below the shared depth are
    /// exclusively owned by one subset and are written unpostfixed, which is
    /// what lets a merge adopt them without copying.
    pub fn postfix_at_depth(&self, depth: u64) -> String {
        if self.subset.is_some() && depth < self.shared_depth() {
            self.postfix()
        } else {
            String::new()
        }
    }

    pub fn active_bounds(&self) -> Bounds {
        match self.subset {
            Some(subset) => subset.bounds(&self.bounds).intersection(&self.bounds_conforming),
            None => self.bounds_conforming,
        }
    }

    pub fn save(&self, endpoints: &Endpoints, points: u64) -> io::Result<()> {
        let postfix = self.postfix();

        let ept = EptJson {
            version: EPT_VERSION.to_string(),
            bounds: self.bounds,
            bounds_conforming: self.bounds_conforming,
            schema: self.schema.clone(),
            span: self.span,
            data_type: self.data_type,
            hierarchy_type: "json".to_string(),
            hierarchy_step: self.hierarchy_step,
            points,
            srs: self.srs.clone(),
        };
        let body = serde_json::to_string_pretty(&ept)?;
        endpoints.output.ensure_put(
            &format!("ept{postfix}.json"),
            body.as_bytes(),
            Endpoint::DEFAULT_TRIES,
        )?;

        let build = EptBuild {
            software: "entwine".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            min_node_size: self.min_node_size,
            max_node_size: self.max_node_size,
            sleep_count: self.sleep_count,
            start_depth: self.start_depth,
            hierarchy_step: self.hierarchy_step,
            subset: self.subset,
        };
        let body = serde_json::to_string_pretty(&build)?;
        endpoints.output.ensure_put(
            &format!("ept-build{postfix}.json"),
            body.as_bytes(),
            Endpoint::DEFAULT_TRIES,
        )
    }

    /// Reopen a build's metadata. Returns the metadata and the persisted
    /// total point count.
    pub fn load(endpoints: &Endpoints, postfix: &str) -> io::Result<(Metadata, u64)> {
        let body = endpoints
            .output
            .ensure_get_string(&format!("ept{postfix}.json"), Endpoint::DEFAULT_TRIES)?;
        let ept: EptJson = serde_json::from_str(&body)?;

        let body = endpoints
            .output
            .ensure_get_string(&format!("ept-build{postfix}.json"), Endpoint::DEFAULT_TRIES)?;
        let build: EptBuild = serde_json::from_str(&body)?;

        let metadata = Metadata {
            bounds: ept.bounds,
            bounds_conforming: ept.bounds_conforming,
            schema: ept.schema,
            srs: ept.srs,
            data_type: ept.data_type,
            span: ept.span,
            start_depth: build.start_depth,
            subset: build.subset,
            min_node_size: build.min_node_size,
            max_node_size: build.max_node_size,
            sleep_count: build.sleep_count,
            hierarchy_step: build.hierarchy_step,
        };
        Ok((metadata, ept.points))
    }

    pub fn exists(endpoints: &Endpoints) -> bool {
        endpoints.output.try_get_size("ept.json").is_some()
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EptJson {
    version: String,
    bounds: Bounds,
    bounds_conforming: Bounds,
    schema: Schema,
    span: u64,
    data_type: DataType,
    hierarchy_type: String,
    #[serde(default)]
    hierarchy_step: u64,
    points: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    srs: Option<String>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EptBuild {
    software: String,
    version: String,
    min_node_size: u64,
    max_node_size: u64,
    #[serde(default = "default_sleep_count")]
    sleep_count: u64,
    #[serde(default)]
    start_depth: u64,
    #[serde(default)]
    hierarchy_step: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    subset: Option<Subset>,
}

fn default_sleep_count() -> u64 {
    heuristics::SLEEP_COUNT
}
