use crate::manifest::{Source, SourceInfo};
use crate::pool::Pool;
use crate::shared::Bounds;
use glam::DVec3;
use log::info;
use std::fmt;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read};
use std::path::Path;
use std::sync::{mpsc, Mutex, OnceLock};

/// Reader construction is serialized process-wide; point streaming itself
/// runs lock-free within each worker.
fn construction_lock() -> &'static Mutex<()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PipelineError {
    UnknownFormat(String),
    Malformed { path: String, detail: String },
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownFormat(path) => write!(f, "{path}: no reader for this file type"),
            Self::Malformed { path, detail } => write!(f, "{path}: {detail}"),
        }
    }
}

impl std::error::Error for PipelineError {}

impl From<PipelineError> for io::Error {
    fn from(e: PipelineError) -> Self {
        io::Error::new(io::ErrorKind::InvalidData, e)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Format {
    /// Raw little-endian f64 x,y,z triples.
    Bin,
    /// Whitespace-separated ASCII x y z lines.
    Text,
}

impl Format {
    fn of(path: &str) -> Result<Format, PipelineError> {
        let extension = Path::new(path)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_ascii_lowercase();
        match extension.as_str() {
            "bin" => Ok(Format::Bin),
            "txt" | "xyz" => Ok(Format::Text),
            _ => Err(PipelineError::UnknownFormat(path.to_string())),
        }
    }
}

const BIN_RECORD: usize = 24;

/// Streaming point source for one input file.
#[derive(Debug)]
pub struct PointStream {
    path: String,
    format: Format,
    reader: BufReader<File>,
    line: u64,
}

/// Open `path` for streaming. Construction and validation run under the
/// process-wide lock.
pub fn open(path: &str) -> io::Result<PointStream> {
    let _guard = construction_lock()
        .lock()
        .expect("pipeline construction lock poisoned");

    let format = Format::of(path)?;
    let file = File::open(path)?;
    if format == Format::Bin {
        let size = file.metadata()?.len();
        if size % BIN_RECORD as u64 != 0 {
            return Err(PipelineError::Malformed {
                path: path.to_string(),
                detail: format!("size {size} is not a multiple of the {BIN_RECORD}-byte record"),
            }
            .into());
        }
    }
    Ok(PointStream {
        path: path.to_string(),
        format,
        reader: BufReader::new(file),
        line: 0,
    })
}

impl PointStream {
    pub fn next_point(&mut self) -> io::Result<Option<DVec3>> {
        match self.format {
            Format::Bin => self.next_bin(),
            Format::Text => self.next_text(),
        }
    }

    fn next_bin(&mut self) -> io::Result<Option<DVec3>> {
        let mut record = [0u8; BIN_RECORD];
        let mut filled = 0;
        while filled < BIN_RECORD {
            let n = self.reader.read(&mut record[filled..])?;
            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(PipelineError::Malformed {
                    path: self.path.clone(),
                    detail: "truncated record at end of file".to_string(),
                }
                .into());
            }
            filled += n;
        }
        let x = f64::from_le_bytes(record[0..8].try_into().expect("record"));
        let y = f64::from_le_bytes(record[8..16].try_into().expect("record"));
        let z = f64::from_le_bytes(record[16..24].try_into().expect("record"));
        Ok(Some(DVec3::new(x, y, z)))
    }

    fn next_text(&mut self) -> io::Result<Option<DVec3>> {
        let mut buffer = String::new();
        loop {
            buffer.clear();
            self.line += 1;
            if self.reader.read_line(&mut buffer)? == 0 {
                return Ok(None);
            }
            let trimmed = buffer.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let mut fields = trimmed.split_whitespace();
            let parse = |field: Option<&str>, line: u64, path: &str| -> io::Result<f64> {
                field
                    .and_then(|v| v.parse::<f64>().ok())
                    .ok_or_else(|| {
                        PipelineError::Malformed {
                            path: path.to_string(),
                            detail: format!("line {line}: expected three coordinates"),
                        }
                        .into()
                    })
            };
            let x = parse(fields.next(), self.line, &self.path)?;
            let y = parse(fields.next(), self.line, &self.path)?;
            let z = parse(fields.next(), self.line, &self.path)?;
            return Ok(Some(DVec3::new(x, y, z)));
        }
    }
}

/// Expand inputs: directories contribute their (sorted) files, everything
/// else passes through untouched.
pub fn resolve(inputs: &[String]) -> io::Result<Vec<String>> {
    let mut resolved = Vec::new();
    for input in inputs {
        let path = Path::new(input);
        if path.is_dir() {
            let mut children: Vec<String> = std::fs::read_dir(path)?
                .filter_map(|entry| entry.ok())
                .filter(|entry| entry.path().is_file())
                .map(|entry| entry.path().to_string_lossy().into_owned())
                .collect();
            children.sort();
            resolved.extend(children);
        } else {
            resolved.push(input.clone());
        }
    }
    Ok(resolved)
}

/// Scan one file for its point count and bounds. A full scan is always
/// needed for bounds; `deep` additionally refuses any header shortcut, so
/// both paths walk every point here.
pub fn analyze_one(path: &str, _deep: bool) -> SourceInfo {
    let mut info = SourceInfo::default();
    let mut stream = match open(path) {
        Ok(stream) => stream,
        Err(e) => {
            info.errors.push(e.to_string());
            return info;
        }
    };

    let mut bounds = Bounds::everted();
    loop {
        match stream.next_point() {
            Ok(Some(point)) => {
                info.points += 1;
                bounds.grow(point);
            }
            Ok(None) => break,
            Err(e) => {
                info.points = 0;
                info.errors.push(e.to_string());
                return info;
            }
        }
    }
    if info.points > 0 {
        info.bounds = Some(bounds);
    }
    info
}

/// Analyze many inputs on a pool, preserving input order.
pub fn analyze(inputs: &[String], threads: u64, deep: bool, verbose: bool) -> Vec<Source> {
    if inputs.is_empty() {
        return Vec::new();
    }
    let pool = Pool::new(threads.min(inputs.len() as u64));
    let (tx, rx) = mpsc::channel::<(usize, SourceInfo)>();
    for (index, path) in inputs.iter().enumerate() {
        let tx = tx.clone();
        let path = path.clone();
        pool.add(move || {
            let info = analyze_one(&path, deep);
            let _ = tx.send((index, info));
        });
    }
    drop(tx);
    pool.join();

    let mut sources: Vec<Source> = inputs
        .iter()
        .map(|path| Source {
            path: path.clone(),
            info: SourceInfo::default(),
        })
        .collect();
    for (index, info) in rx {
        if verbose {
            info!(
                "analyzed {}: {} points{}",
                sources[index].path,
                info.points,
                if info.errors.is_empty() { "" } else { " (errors)" }
            );
        }
        sources[index].info = info;
    }
    sources
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU64, Ordering};

    static TEST_UNIQUIFIER: AtomicU64 = AtomicU64::new(0);

    fn test_file(name: &str, bytes: &[u8]) -> PathBuf {
        let serial = TEST_UNIQUIFIER.fetch_add(1, Ordering::Relaxed);
        let mut path = std::env::temp_dir();
        path.push(format!(
            "entwine-pipeline-{}-{}-{name}",
            std::process::id(),
            serial
        ));
        let mut file = File::create(&path).expect("create test file");
        file.write_all(bytes).expect("write test file");
        path
    }

    fn bin_bytes(points: &[[f64; 3]]) -> Vec<u8> {
        let mut bytes = Vec::new();
        for p in points {
            bytes.extend_from_slice(&p[0].to_le_bytes());
            bytes.extend_from_slice(&p[1].to_le_bytes());
            bytes.extend_from_slice(&p[2].to_le_bytes());
        }
        bytes
    }

    #[test]
    fn bin_files_stream_their_triples() {
        let path = test_file("points.bin", &bin_bytes(&[[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]]));
        let mut stream = open(path.to_str().expect("utf8")).expect("open");
        assert_eq!(
            stream.next_point().expect("read"),
            Some(DVec3::new(1.0, 2.0, 3.0))
        );
        assert_eq!(
            stream.next_point().expect("read"),
            Some(DVec3::new(4.0, 5.0, 6.0))
        );
        assert_eq!(stream.next_point().expect("read"), None);
    }

    #[test]
    fn truncated_bin_files_are_rejected_at_open() {
        let mut bytes = bin_bytes(&[[1.0, 2.0, 3.0]]);
        bytes.pop();
        let path = test_file("truncated.bin", &bytes);
        assert!(open(path.to_str().expect("utf8")).is_err());
    }

    #[test]
    fn text_files_skip_blanks_and_comments() {
        let path = test_file(
            "points.xyz",
            b"# header\n1 2 3\n\n  4.5 5.5 6.5  \n",
        );
        let mut stream = open(path.to_str().expect("utf8")).expect("open");
        assert_eq!(
            stream.next_point().expect("read"),
            Some(DVec3::new(1.0, 2.0, 3.0))
        );
        assert_eq!(
            stream.next_point().expect("read"),
            Some(DVec3::new(4.5, 5.5, 6.5))
        );
        assert_eq!(stream.next_point().expect("read"), None);
    }

    #[test]
    fn malformed_text_reports_the_line() {
        let path = test_file("bad.xyz", b"1 2 3\n4 nope 6\n");
        let mut stream = open(path.to_str().expect("utf8")).expect("open");
        stream.next_point().expect("first point");
        let err = stream.next_point().expect_err("bad line");
        assert!(err.to_string().contains("line 2"));
    }

    #[test]
    fn unknown_extensions_are_refused() {
        let path = test_file("scan.las", b"LASF");
        let err = open(path.to_str().expect("utf8")).expect_err("unknown format");
        assert!(err.to_string().contains("no reader"));
    }

    #[test]
    fn analysis_counts_points_and_grows_bounds() {
        let path = test_file(
            "analyze.bin",
            &bin_bytes(&[[0.0, 0.0, 0.0], [2.0, 4.0, 8.0], [1.0, 1.0, 1.0]]),
        );
        let info = analyze_one(path.to_str().expect("utf8"), false);
        assert!(info.errors.is_empty());
        assert_eq!(info.points, 3);
        let bounds = info.bounds.expect("bounds");
        assert_eq!(bounds.min(), DVec3::ZERO);
        assert_eq!(bounds.max(), DVec3::new(2.0, 4.0, 8.0));
    }

    #[test]
    fn analysis_captures_errors_instead_of_failing() {
        let info = analyze_one("/nonexistent/input.bin", false);
        assert_eq!(info.points, 0);
        assert!(!info.errors.is_empty());
    }
}
