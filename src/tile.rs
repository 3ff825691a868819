use crate::endpoint::Endpoint;
use crate::shared::Bounds;
use serde::{Deserialize, Serialize};
use std::io;

/// On-disk tile format tag. The core stays agnostic: a writer turns a point
/// table into bytes, a reader turns bytes back into a table, and everything
/// else dispatches on this tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Binary,
    Laszip,
    Zstandard,
}

impl DataType {
    pub fn extension(self) -> &'static str {
        match self {
            DataType::Binary => "bin",
            DataType::Laszip => "laz",
            DataType::Zstandard => "zst",
        }
    }
}

/// Flat buffer of fixed-width point records.
pub struct PointTable {
    point_size: usize,
    data: Vec<u8>,
}

impl PointTable {
    pub fn reserve(point_size: usize, np: u64) -> Self {
        Self {
            point_size,
            data: Vec::with_capacity(point_size * np as usize),
        }
    }

    pub fn from_bytes(point_size: usize, data: Vec<u8>) -> io::Result<Self> {
        if data.len() % point_size != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "tile size {} is not a multiple of the {point_size}-byte record",
                    data.len()
                ),
            ));
        }
        Ok(Self { point_size, data })
    }

    pub fn append(&mut self, record: &[u8]) {
        debug_assert_eq!(record.len(), self.point_size);
        self.data.extend_from_slice(record);
    }

    pub fn len(&self) -> u64 {
        (self.data.len() / self.point_size) as u64
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &[u8]> {
        self.data.chunks_exact(self.point_size)
    }
}

fn encode(data_type: DataType, table: &PointTable, _bounds: &Bounds) -> io::Result<Vec<u8>> {
    match data_type {
        DataType::Binary => Ok(table.data.clone()),
        DataType::Zstandard => zstd::stream::encode_all(
            table.data.as_slice(),
            zstd::DEFAULT_COMPRESSION_LEVEL,
        ),
        DataType::Laszip => Err(laszip_unavailable()),
    }
}

fn decode(data_type: DataType, point_size: usize, bytes: Vec<u8>) -> io::Result<PointTable> {
    match data_type {
        DataType::Binary => PointTable::from_bytes(point_size, bytes),
        DataType::Zstandard => {
            let raw = zstd::stream::decode_all(bytes.as_slice())?;
            PointTable::from_bytes(point_size, raw)
        }
        DataType::Laszip => Err(laszip_unavailable()),
    }
}

fn laszip_unavailable() -> io::Error {
    io::Error::new(
        io::ErrorKind::Unsupported,
        "no laszip codec is registered for this build",
    )
}

/// Write tile `stem` (extension appended by data type) to the data endpoint.
pub fn write(
    data_type: DataType,
    endpoint: &Endpoint,
    stem: &str,
    table: &PointTable,
    bounds: &Bounds,
) -> io::Result<()> {
    let bytes = encode(data_type, table, bounds)?;
    endpoint.ensure_put(
        &format!("{stem}.{}", data_type.extension()),
        &bytes,
        Endpoint::DEFAULT_TRIES,
    )
}

/// Read tile `stem` back into a point table.
pub fn read(
    data_type: DataType,
    endpoint: &Endpoint,
    stem: &str,
    point_size: usize,
) -> io::Result<PointTable> {
    let bytes = endpoint.ensure_get(
        &format!("{stem}.{}", data_type.extension()),
        Endpoint::DEFAULT_TRIES,
    )?;
    decode(data_type, point_size, bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::DVec3;

    fn table_of(records: &[[u8; 4]]) -> PointTable {
        let mut table = PointTable::reserve(4, records.len() as u64);
        for record in records {
            table.append(record);
        }
        table
    }

    #[test]
    fn binary_encoding_is_the_raw_record_stream() {
        let table = table_of(&[[1, 2, 3, 4], [5, 6, 7, 8]]);
        let bounds = Bounds::new(DVec3::ZERO, DVec3::ONE);
        let bytes = encode(DataType::Binary, &table, &bounds).expect("encode");
        assert_eq!(bytes, vec![1, 2, 3, 4, 5, 6, 7, 8]);
        let back = decode(DataType::Binary, 4, bytes).expect("decode");
        assert_eq!(back.len(), 2);
        assert_eq!(back.iter().next(), Some(&[1u8, 2, 3, 4][..]));
    }

    #[test]
    fn zstandard_roundtrips_and_actually_compresses() {
        let records: Vec<[u8; 4]> = (0..1000).map(|_| [42, 42, 42, 42]).collect();
        let table = table_of(&records);
        let bounds = Bounds::new(DVec3::ZERO, DVec3::ONE);
        let bytes = encode(DataType::Zstandard, &table, &bounds).expect("encode");
        assert!(bytes.len() < 4000);
        let back = decode(DataType::Zstandard, 4, bytes).expect("decode");
        assert_eq!(back.len(), 1000);
    }

    #[test]
    fn truncated_binary_tiles_are_rejected() {
        assert!(PointTable::from_bytes(4, vec![1, 2, 3]).is_err());
    }

    #[test]
    fn laszip_reports_the_missing_codec() {
        let table = table_of(&[]);
        let bounds = Bounds::new(DVec3::ZERO, DVec3::ONE);
        let err = encode(DataType::Laszip, &table, &bounds).expect_err("unsupported");
        assert_eq!(err.kind(), io::ErrorKind::Unsupported);
    }

    #[test]
    fn tags_parse_from_their_json_names() {
        assert_eq!(
            serde_json::from_str::<DataType>("\"zstandard\"").expect("parse"),
            DataType::Zstandard
        );
        assert_eq!(DataType::Laszip.extension(), "laz");
    }
}
