use crate::builder::heuristics;
use crate::endpoint::Endpoint;
use crate::shared::{Dxyz, SpinLock};
use std::collections::{BTreeMap, HashMap};
use std::io;

/// Depth-indexed node to point-count map. A node is present iff its count is
/// positive. Counts are published at serialization time, so an entry always
/// reflects the tile as last written.
#[derive(Default)]
pub struct Hierarchy {
    map: SpinLock<HashMap<Dxyz, u64>>,
}

impl Hierarchy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: Dxyz) -> u64 {
        self.map.lock().get(&key).copied().unwrap_or(0)
    }

    pub fn set(&self, key: Dxyz, count: u64) {
        self.map.lock().insert(key, count);
    }

    pub fn len(&self) -> u64 {
        self.map.lock().len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.map.lock().is_empty()
    }

    pub fn total_points(&self) -> u64 {
        self.map.lock().values().sum()
    }

    pub fn snapshot(&self) -> Vec<(Dxyz, u64)> {
        let mut entries: Vec<(Dxyz, u64)> =
            self.map.lock().iter().map(|(k, v)| (*k, *v)).collect();
        entries.sort_unstable();
        entries
    }

    /// Largest page step that keeps every hierarchy file within the
    /// per-file node limit; zero means a single monolithic file suffices.
    pub fn determine_step(&self) -> u64 {
        let limit = heuristics::MAX_HIERARCHY_NODES_PER_FILE;
        if self.len() <= limit {
            return 0;
        }
        for step in (1..=16u64).rev() {
            let pages = self.paginate(step);
            if pages.values().all(|page| page.len() as u64 <= limit) {
                return step;
            }
        }
        1
    }

    fn paginate(&self, step: u64) -> HashMap<Dxyz, BTreeMap<String, i64>> {
        let mut pages: HashMap<Dxyz, BTreeMap<String, i64>> = HashMap::new();
        for (key, count) in self.map.lock().iter() {
            let page_root = key.ancestor_at((key.d / step) * step);
            pages
                .entry(page_root)
                .or_default()
                .insert(key.to_string(), *count as i64);
            // Page roots are referenced from their parent page.
            if key.d > 0 && key.d % step == 0 {
                let parent_root = key.ancestor_at(key.d - step);
                pages
                    .entry(parent_root)
                    .or_default()
                    .insert(key.to_string(), -1);
            }
        }
        pages
    }

    pub fn save(&self, endpoint: &Endpoint, step: u64, postfix: &str) -> io::Result<()> {
        if step == 0 {
            let page: BTreeMap<String, i64> = self
                .map
                .lock()
                .iter()
                .map(|(k, v)| (k.to_string(), *v as i64))
                .collect();
            return write_page(endpoint, &Dxyz::default(), postfix, &page);
        }

        for (root, page) in self.paginate(step) {
            write_page(endpoint, &root, postfix, &page)?;
        }
        Ok(())
    }

    pub fn load(endpoint: &Endpoint, postfix: &str) -> io::Result<Hierarchy> {
        let hierarchy = Hierarchy::new();
        let mut pending = vec![Dxyz::default()];
        while let Some(root) = pending.pop() {
            let body = endpoint.ensure_get_string(
                &format!("{root}{postfix}.json"),
                Endpoint::DEFAULT_TRIES,
            )?;
            let page: BTreeMap<String, i64> = serde_json::from_str(&body)?;
            for (name, count) in page {
                let key: Dxyz = name
                    .parse()
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                if count < 0 {
                    pending.push(key);
                } else if count > 0 {
                    hierarchy.set(key, count as u64);
                }
            }
        }
        Ok(hierarchy)
    }
}

fn write_page(
    endpoint: &Endpoint,
    root: &Dxyz,
    postfix: &str,
    page: &BTreeMap<String, i64>,
) -> io::Result<()> {
    let body = serde_json::to_string(page)?;
    endpoint.ensure_put(
        &format!("{root}{postfix}.json"),
        body.as_bytes(),
        Endpoint::DEFAULT_TRIES,
    )
}
