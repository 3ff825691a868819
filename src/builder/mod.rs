pub mod cache;
pub mod chunk;
pub mod clipper;
pub mod heuristics;
pub mod hierarchy;
pub mod merger;

#[cfg(test)]
mod tests;

pub use cache::{CacheInfo, ChunkCache};
pub use chunk::Chunk;
pub use clipper::Clipper;
pub use hierarchy::Hierarchy;

use crate::config::{BuildConfig, ConfigError, Threads};
use crate::endpoint::Endpoints;
use crate::manifest::{self, BuildItem, Manifest};
use crate::metadata::Metadata;
use crate::pipeline;
use crate::pool::Pool;
use crate::shared::{schema, Bounds, ChunkKey, Key, Schema, Voxel};
use log::info;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

/// Drives one build: streams manifest files through worker tasks, routes
/// their points into the chunk cache, and persists the results.
pub struct Builder {
    pub endpoints: Endpoints,
    pub metadata: Metadata,
    pub manifest: Manifest,
    pub hierarchy: Arc<Hierarchy>,
    pub verbose: bool,
}

struct InsertResult {
    origin: usize,
    error: Option<String>,
}

impl Builder {
    /// Run the build loop plus a progress monitor. Returns the number of
    /// points inserted by this run.
    pub fn run(&mut self, threads: Threads, limit: u64, progress_interval: u64) -> io::Result<u64> {
        let counter = Arc::new(AtomicU64::new(0));
        let done = Arc::new(AtomicBool::new(false));

        let monitor = {
            let counter = Arc::clone(&counter);
            let done = Arc::clone(&done);
            let verbose = self.verbose;
            let already = manifest::inserted_points(&self.manifest) as f64;
            let total = manifest::total_points(&self.manifest) as f64;
            thread::spawn(move || {
                monitor(verbose, progress_interval, already, total, &counter, &done)
            })
        };

        let result = self.run_inserts(threads, limit, &counter);
        done.store(true, Ordering::Relaxed);
        let _ = monitor.join();
        result?;

        Ok(counter.load(Ordering::Relaxed))
    }

    fn run_inserts(
        &mut self,
        threads: Threads,
        limit: u64,
        counter: &Arc<AtomicU64>,
    ) -> io::Result<()> {
        let active = self.metadata.active_bounds();

        let mut scheduled = Vec::new();
        for (origin, item) in self.manifest.iter().enumerate() {
            if limit > 0 && scheduled.len() as u64 >= limit {
                break;
            }
            if item.inserted || item.source.info.points == 0 {
                continue;
            }
            if let Some(bounds) = &item.source.info.bounds {
                if !active.overlaps(bounds) {
                    continue;
                }
            }
            scheduled.push(origin);
        }

        // Work threads an undersubscribed file list cannot use are donated
        // to the clip pool.
        let actual_work = threads.work.min(scheduled.len().max(1) as u64);
        let clip_threads = threads.clip + (threads.work - actual_work);

        let metadata = Arc::new(self.metadata.clone());
        let cache = ChunkCache::new(
            self.endpoints.clone(),
            Arc::clone(&metadata),
            Arc::clone(&self.hierarchy),
            clip_threads,
        );
        let pool = Pool::new(actual_work);
        let (tx, rx) = mpsc::channel::<InsertResult>();

        for origin in scheduled {
            let item = &self.manifest[origin];
            if self.verbose {
                info!("adding {origin} - {}", item.source.path);
            }
            let cache = Arc::clone(&cache);
            let metadata = Arc::clone(&metadata);
            let counter = Arc::clone(counter);
            let tx = tx.clone();
            let path = item.source.path.clone();
            let verbose = self.verbose;
            pool.add(move || {
                let mut clipper = Clipper::new();
                let result =
                    insert_file(&cache, &metadata, origin as u32, &path, &counter, &mut clipper);
                clipper.release(&cache);
                if verbose {
                    info!("done {origin}");
                }
                let _ = tx.send(InsertResult {
                    origin,
                    error: result.err().map(|e| e.to_string()),
                });
            });
        }
        drop(tx);

        pool.join();
        cache.join()?;

        // Per-file outcomes fold into the manifest; a failed file is still
        // marked inserted so a resume will not retry it.
        for result in rx {
            let item = &mut self.manifest[result.origin];
            item.inserted = true;
            if let Some(error) = result.error {
                item.source.info.errors.push(error);
            }
        }

        self.save()
    }

    pub fn save(&mut self) -> io::Result<()> {
        if self.verbose {
            info!("saving");
        }
        self.save_hierarchy()?;
        self.save_sources()?;
        self.save_metadata()
    }

    fn save_hierarchy(&mut self) -> io::Result<()> {
        // Subset and partial builds defer stepping and write one monolithic
        // file; the merge or the completing run settles the step.
        let settled = self
            .manifest
            .iter()
            .all(|item| item.inserted || item.source.info.points == 0);
        let mut step = 0;
        if self.metadata.subset.is_none() && settled {
            step = if self.metadata.hierarchy_step > 0 {
                self.metadata.hierarchy_step
            } else {
                self.hierarchy.determine_step()
            };
        }
        self.metadata.hierarchy_step = step;
        self.hierarchy
            .save(&self.endpoints.hierarchy, step, &self.metadata.postfix())
    }

    fn save_sources(&mut self) -> io::Result<()> {
        let postfix = self.metadata.postfix();
        manifest::save(
            &mut self.manifest,
            &self.endpoints.sources,
            &postfix,
            self.metadata.subset.is_some(),
        )
    }

    fn save_metadata(&self) -> io::Result<()> {
        self.metadata
            .save(&self.endpoints, manifest::inserted_points(&self.manifest))
    }
}

/// Stream one input file into the cache. Points outside the conforming (or
/// subset) bounds are rejected; every accepted point is stamped with its
/// origin and intra-file id before routing.
fn insert_file(
    cache: &Arc<ChunkCache>,
    metadata: &Arc<Metadata>,
    origin: u32,
    path: &str,
    counter: &Arc<AtomicU64>,
    clipper: &mut Clipper,
) -> io::Result<()> {
    let mut stream = pipeline::open(path)?;

    let origin_offset = metadata.schema.offset_of(schema::ORIGIN_ID);
    let point_id_offset = metadata.schema.offset_of(schema::POINT_ID);
    let subset_bounds = metadata.subset.map(|s| s.bounds(&metadata.bounds));

    let root = ChunkKey::new(metadata.bounds);
    let mut key = Key::new(metadata.bounds, metadata.span_shift());
    let mut record = vec![0u8; metadata.point_size()];
    let mut point_id: u32 = 0;
    let mut since_clip = 0u64;

    while let Some(point) = stream.next_point()? {
        let id = point_id;
        point_id = point_id.wrapping_add(1);

        if !metadata.bounds_conforming.contains(point) {
            continue;
        }
        if let Some(bounds) = &subset_bounds {
            if !bounds.contains(point) {
                continue;
            }
        }

        schema::write_point(&mut record, point);
        if let Some(offset) = origin_offset {
            schema::write_u32(&mut record, offset, origin);
        }
        if let Some(offset) = point_id_offset {
            schema::write_u32(&mut record, offset, id);
        }

        let mut voxel = Voxel::init_shallow(point, &record);
        key.init(point, metadata.start_depth);
        cache.insert(&mut voxel, &mut key, &root, clipper)?;

        counter.fetch_add(1, Ordering::Relaxed);
        since_clip += 1;
        if since_clip >= metadata.sleep_count {
            since_clip = 0;
            clipper.clip(cache);
        }
    }
    Ok(())
}

fn monitor(
    verbose: bool,
    progress_interval: u64,
    already: f64,
    total: f64,
    counter: &AtomicU64,
    done: &AtomicBool,
) {
    if progress_interval == 0 {
        return;
    }
    const MPH: f64 = 3600.0 / 1_000_000.0;

    let start = Instant::now();
    let mut last_tick = 0u64;
    let mut last_inserted = already;

    while !done.load(Ordering::Relaxed) {
        let elapsed_ms = start.elapsed().as_millis() as u64;
        thread::sleep(Duration::from_millis(1000 - elapsed_ms % 1000));
        let tick = start.elapsed().as_secs();
        if tick == last_tick || tick % progress_interval != 0 {
            continue;
        }
        last_tick = tick;

        let inserted = already + counter.load(Ordering::Relaxed) as f64;
        let progress = if total > 0.0 { inserted / total } else { 0.0 };
        let pace = (inserted / tick as f64 * MPH) as u64;
        let interval_pace =
            ((inserted - last_inserted).max(0.0) / progress_interval as f64 * MPH) as u64;
        last_inserted = inserted;

        let info = ChunkCache::latch_info();
        if verbose {
            println!(
                "{} - {}% - {} - {} ({}) M/h - {}W - {}R - {}A",
                format_time(tick),
                (progress * 100.0).round(),
                commify(inserted as u64),
                commify(pace),
                commify(interval_pace),
                info.written,
                info.read,
                info.alive
            );
        }
    }
}

fn format_time(seconds: u64) -> String {
    let minutes = seconds / 60;
    if minutes >= 60 {
        format!("{}:{:02}:{:02}", minutes / 60, minutes % 60, seconds % 60)
    } else {
        format!("{}:{:02}", minutes, seconds % 60)
    }
}

fn commify(value: u64) -> String {
    let digits = value.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

fn invalid_input(e: ConfigError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, e)
}

/// Create a builder from a parsed config: continue an existing build at the
/// output (unless forced), analyze any new inputs, and settle the metadata.
pub fn create(config: BuildConfig) -> io::Result<Builder> {
    config.validate().map_err(invalid_input)?;
    let endpoints = Endpoints::new(&config.output, config.tmp.clone().map(PathBuf::from));
    let verbose = config.verbose;

    let mut manifest: Manifest = Vec::new();
    let mut hierarchy = Arc::new(Hierarchy::new());
    let mut existing: Option<Metadata> = None;

    if !config.force && Metadata::exists(&endpoints) {
        if verbose {
            info!("continuing existing build at {}", config.output);
        }
        let (loaded, _points) = Metadata::load(&endpoints, "")?;
        manifest = manifest::load(&endpoints.sources, "")?;
        hierarchy = Arc::new(Hierarchy::load(&endpoints.hierarchy, "")?);
        existing = Some(loaded);
    }

    // Analyze only inputs the manifest does not already know about.
    let inputs = pipeline::resolve(&config.input)?;
    let new_inputs: Vec<String> = inputs
        .into_iter()
        .filter(|path| !manifest::contains_path(&manifest, path))
        .collect();
    let deep = config.deep || !config.trust_headers;
    for source in pipeline::analyze(&new_inputs, config.threads.work, deep, verbose) {
        if source.info.points > 0 || !source.info.errors.is_empty() {
            manifest.push(BuildItem::new(source));
        }
    }
    if manifest.is_empty() {
        return Err(invalid_input(ConfigError::NoInput));
    }

    let metadata = match existing {
        // Geometry and layout are fixed once established; only operational
        // settings come from the incoming config on a resume.
        Some(loaded) => loaded,
        None => {
            let mut conforming = Bounds::everted();
            for item in &manifest {
                if let Some(bounds) = item.source.info.bounds {
                    conforming.grow(bounds.min());
                    conforming.grow(bounds.max());
                }
            }
            if !conforming.is_valid() {
                return Err(invalid_input(ConfigError::NoPoints));
            }
            Metadata {
                bounds: Bounds::cube(conforming),
                bounds_conforming: conforming,
                schema: Schema::standard(),
                srs: config.reprojection.clone(),
                data_type: config.data_type,
                span: config.span,
                start_depth: 0,
                subset: config.subset,
                min_node_size: config.min_node_size,
                max_node_size: config.max_node_size,
                sleep_count: config.sleep_count,
                hierarchy_step: config.hierarchy_step,
            }
        }
    };

    Ok(Builder {
        endpoints,
        metadata,
        manifest,
        hierarchy,
        verbose,
    })
}

/// Reopen a finished or partial build from its artifacts.
pub fn load(endpoints: Endpoints, subset_id: u64, verbose: bool) -> io::Result<Builder> {
    let postfix = if subset_id > 0 {
        format!("-{subset_id}")
    } else {
        String::new()
    };
    let (metadata, _points) = Metadata::load(&endpoints, &postfix)?;
    let manifest = manifest::load(&endpoints.sources, &postfix)?;
    let hierarchy = Arc::new(Hierarchy::load(&endpoints.hierarchy, &postfix)?);
    Ok(Builder {
        endpoints,
        metadata,
        manifest,
        hierarchy,
        verbose,
    })
}

#[cfg(test)]
mod unit_tests {
    use super::*;

    #[test]
    fn format_time_rolls_over_to_hours() {
        assert_eq!(format_time(5), "0:05");
        assert_eq!(format_time(65), "1:05");
        assert_eq!(format_time(3661), "1:01:01");
    }

    #[test]
    fn commify_groups_by_thousands() {
        assert_eq!(commify(0), "0");
        assert_eq!(commify(999), "999");
        assert_eq!(commify(1000), "1,000");
        assert_eq!(commify(1234567), "1,234,567");
    }
}
