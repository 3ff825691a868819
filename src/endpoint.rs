use log::warn;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

/// Byte-addressed key/value store rooted at a directory. This is the whole
/// storage seam: the builder only ever gets, puts, and sizes blobs, so a
/// remote blob store slots in behind the same surface.
#[derive(Clone, Debug)]
pub struct Endpoint {
    root: PathBuf,
}

impl Endpoint {
    pub const DEFAULT_TRIES: u32 = 8;

    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn full_path(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }

    pub fn get(&self, path: &str) -> io::Result<Vec<u8>> {
        fs::read(self.full_path(path))
    }

    pub fn get_string(&self, path: &str) -> io::Result<String> {
        fs::read_to_string(self.full_path(path))
    }

    pub fn put(&self, path: &str, data: &[u8]) -> io::Result<()> {
        let full = self.full_path(path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(full, data)
    }

    pub fn try_get_size(&self, path: &str) -> Option<u64> {
        fs::metadata(self.full_path(path)).ok().map(|m| m.len())
    }

    pub fn get_with_retry(&self, path: &str, tries: u32) -> Option<Vec<u8>> {
        retry(path, tries, || self.get(path)).ok()
    }

    pub fn put_with_retry(&self, path: &str, data: &[u8], tries: u32) -> bool {
        retry(path, tries, || self.put(path, data)).is_ok()
    }

    pub fn ensure_get(&self, path: &str, tries: u32) -> io::Result<Vec<u8>> {
        retry(path, tries, || self.get(path))
    }

    pub fn ensure_get_string(&self, path: &str, tries: u32) -> io::Result<String> {
        retry(path, tries, || self.get_string(path))
    }

    pub fn ensure_put(&self, path: &str, data: &[u8], tries: u32) -> io::Result<()> {
        retry(path, tries, || self.put(path, data))
    }
}

/// Bounded exponential backoff around one storage operation.
fn retry<T>(path: &str, tries: u32, mut op: impl FnMut() -> io::Result<T>) -> io::Result<T> {
    let tries = tries.max(1);
    let mut delay = Duration::from_millis(25);
    for attempt in 1..=tries {
        match op() {
            Ok(value) => return Ok(value),
            Err(e) if attempt == tries => {
                return Err(io::Error::new(
                    e.kind(),
                    format!("{path}: giving up after {tries} tries: {e}"),
                ));
            }
            Err(e) => {
                warn!("{path}: attempt {attempt}/{tries} failed: {e}");
                thread::sleep(delay);
                delay = (delay * 2).min(Duration::from_secs(1));
            }
        }
    }
    unreachable!("retry loop always returns")
}

/// The output roots a build writes through.
#[derive(Clone, Debug)]
pub struct Endpoints {
    pub output: Endpoint,
    pub data: Endpoint,
    pub hierarchy: Endpoint,
    pub sources: Endpoint,
    pub tmp: Endpoint,
}

impl Endpoints {
    pub fn new<P: Into<PathBuf>>(output: P, tmp: Option<PathBuf>) -> Self {
        let output: PathBuf = output.into();
        let tmp = tmp.unwrap_or_else(std::env::temp_dir);
        Self {
            data: Endpoint::new(output.join("ept-data")),
            hierarchy: Endpoint::new(output.join("ept-hierarchy")),
            sources: Endpoint::new(output.join("ept-sources")),
            output: Endpoint::new(output),
            tmp: Endpoint::new(tmp),
        }
    }
}
