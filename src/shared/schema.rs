use glam::DVec3;
use serde::{Deserialize, Serialize};

/// Scalar storage type of one dimension.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DimType {
    Double,
    Unsigned32,
}

impl DimType {
    pub fn size(self) -> usize {
        match self {
            DimType::Double => 8,
            DimType::Unsigned32 => 4,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimension {
    pub name: String,
    #[serde(rename = "type")]
    pub dim_type: DimType,
    pub size: usize,
}

impl Dimension {
    pub fn new(name: &str, dim_type: DimType) -> Self {
        Self {
            name: name.to_string(),
            dim_type,
            size: dim_type.size(),
        }
    }
}

/// Ordered record layout. X, Y, Z are f64 at offset 0 so every record embeds
/// its coordinates; OriginId and PointId are stamped by the builder.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Schema {
    pub dims: Vec<Dimension>,
}

pub const ORIGIN_ID: &str = "OriginId";
pub const POINT_ID: &str = "PointId";

impl Schema {
    pub fn standard() -> Self {
        Self {
            dims: vec![
                Dimension::new("X", DimType::Double),
                Dimension::new("Y", DimType::Double),
                Dimension::new("Z", DimType::Double),
                Dimension::new(ORIGIN_ID, DimType::Unsigned32),
                Dimension::new(POINT_ID, DimType::Unsigned32),
            ],
        }
    }

    pub fn point_size(&self) -> usize {
        self.dims.iter().map(|d| d.size).sum()
    }

    pub fn offset_of(&self, name: &str) -> Option<usize> {
        let mut offset = 0;
        for dim in &self.dims {
            if dim.name == name {
                return Some(offset);
            }
            offset += dim.size;
        }
        None
    }
}

pub fn read_point(record: &[u8]) -> DVec3 {
    let x = f64::from_le_bytes(record[0..8].try_into().expect("record too short"));
    let y = f64::from_le_bytes(record[8..16].try_into().expect("record too short"));
    let z = f64::from_le_bytes(record[16..24].try_into().expect("record too short"));
    DVec3::new(x, y, z)
}

pub fn write_point(record: &mut [u8], point: DVec3) {
    record[0..8].copy_from_slice(&point.x.to_le_bytes());
    record[8..16].copy_from_slice(&point.y.to_le_bytes());
    record[16..24].copy_from_slice(&point.z.to_le_bytes());
}

pub fn write_u32(record: &mut [u8], offset: usize, value: u32) {
    record[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

pub fn read_u32(record: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(record[offset..offset + 4].try_into().expect("record too short"))
}
