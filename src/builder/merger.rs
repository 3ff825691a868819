use crate::builder::cache::ChunkCache;
use crate::builder::clipper::Clipper;
use crate::builder::hierarchy::Hierarchy;
use crate::builder::{self, Builder};
use crate::config::Threads;
use crate::endpoint::Endpoints;
use crate::manifest;
use crate::metadata::Metadata;
use crate::shared::{schema, ChunkKey, Key, Voxel};
use crate::tile;
use log::info;
use std::io;
use std::sync::Arc;

/// Combine every subset build at the output into one tree. Deep nodes are
/// exclusively owned by their subset and their counts are adopted directly;
/// shallow tiles are replayed through a shared cache so the merged chunks
/// resolve them under the same grid rules.
pub fn merge(endpoints: Endpoints, threads: Threads, force: bool, verbose: bool) -> io::Result<()> {
    if !force && Metadata::exists(&endpoints) {
        return Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            "completed dataset already exists here: re-run with --force to overwrite it",
        ));
    }
    if endpoints.output.try_get_size("ept-1.json").is_none() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            "failed to find first subset",
        ));
    }

    if verbose {
        info!("initializing");
    }
    let base = builder::load(endpoints.clone(), 1, verbose)?;
    let of = match base.metadata.subset {
        Some(subset) => subset.of,
        None => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "first subset is not a subset build",
            ))
        }
    };

    let mut metadata = base.metadata.clone();
    metadata.subset = None;
    let mut manifest = base.manifest.clone();

    let hierarchy = Arc::new(Hierarchy::new());
    let cache = ChunkCache::new(
        endpoints.clone(),
        Arc::new(metadata.clone()),
        Arc::clone(&hierarchy),
        threads.total(),
    );

    if verbose {
        info!("merging");
    }
    for id in 1..=of {
        if endpoints
            .output
            .try_get_size(&format!("ept-{id}.json"))
            .is_none()
        {
            if verbose {
                info!("subset {id}/{of}: skipping");
            }
            continue;
        }
        if verbose {
            info!("subset {id}/{of}: merging");
        }
        let src = builder::load(endpoints.clone(), id, verbose)?;
        validate_match(&metadata, &src.metadata, id, of)?;
        merge_one(&metadata, &hierarchy, &cache, &endpoints, &src)?;
        if id > 1 {
            manifest = manifest::merge(manifest, src.manifest);
        }
    }

    cache.join()?;

    let mut merged = Builder {
        endpoints,
        metadata,
        manifest,
        hierarchy,
        verbose,
    };
    merged.save()?;
    if verbose {
        info!("done");
    }
    Ok(())
}

/// Subsets must have been built against identical trees.
fn validate_match(dst: &Metadata, src: &Metadata, id: u64, of: u64) -> io::Result<()> {
    let mismatch = |what: &str| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("subset {id} {what} does not match the first subset"),
        )
    };
    match src.subset {
        Some(subset) if subset.id == id && subset.of == of => {}
        _ => return Err(mismatch("subset marker")),
    }
    if src.bounds != dst.bounds {
        return Err(mismatch("bounds"));
    }
    if src.span != dst.span {
        return Err(mismatch("span"));
    }
    if src.schema != dst.schema {
        return Err(mismatch("schema"));
    }
    if src.data_type != dst.data_type {
        return Err(mismatch("data type"));
    }
    Ok(())
}

fn merge_one(
    metadata: &Metadata,
    hierarchy: &Arc<Hierarchy>,
    cache: &Arc<ChunkCache>,
    endpoints: &Endpoints,
    src: &Builder,
) -> io::Result<()> {
    let shared_depth = src.metadata.shared_depth();
    let src_postfix = src.metadata.postfix();
    let mut clipper = Clipper::new();

    let mut replay = || -> io::Result<()> {
        for (key, count) in src.hierarchy.snapshot() {
            if count == 0 {
                continue;
            }
            if key.d >= shared_depth {
                // Exclusively owned subtree: adopt the count as-is.
                if hierarchy.get(key) > 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("duplicate hierarchy entry {key} during merge"),
                    ));
                }
                hierarchy.set(key, count);
                continue;
            }

            let stem = format!("{key}{src_postfix}");
            let table = tile::read(
                metadata.data_type,
                &endpoints.data,
                &stem,
                metadata.point_size(),
            )?;

            let mut pk = Key::new(metadata.bounds, metadata.span_shift());
            let mut ck = ChunkKey::new(metadata.bounds);
            for record in table.iter() {
                let point = schema::read_point(record);
                let mut voxel = Voxel::init_shallow(point, record);
                pk.init(point, key.d);
                ck.init(point, key.d);
                debug_assert_eq!(ck.dxyz(), key);
                cache.insert(&mut voxel, &mut pk, &ck, &mut clipper)?;
            }
        }
        Ok(())
    };

    let result = replay();
    clipper.release(cache);
    result
}
