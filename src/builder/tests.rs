use crate::builder::{self, merger, Hierarchy};
use crate::config::{BuildConfig, Threads};
use crate::endpoint::{Endpoint, Endpoints};
use crate::metadata::Subset;
use crate::shared::{schema, Bounds, Dxyz, Key};
use crate::tile::{self, DataType};
use glam::DVec3;
use std::collections::HashSet;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

static TEST_UNIQUIFIER: AtomicU64 = AtomicU64::new(0);

fn test_root(name: &str) -> PathBuf {
    let serial = TEST_UNIQUIFIER.fetch_add(1, Ordering::Relaxed);
    let mut path = std::env::temp_dir();
    path.push(format!(
        "entwine-build-{name}-{}-{}",
        std::process::id(),
        serial
    ));
    let _ = std::fs::remove_dir_all(&path);
    std::fs::create_dir_all(&path).expect("create test root");
    path
}

fn write_bin(dir: &PathBuf, name: &str, points: &[DVec3]) -> String {
    let path = dir.join(name);
    let mut file = std::fs::File::create(&path).expect("create input");
    for point in points {
        file.write_all(&point.x.to_le_bytes()).expect("write");
        file.write_all(&point.y.to_le_bytes()).expect("write");
        file.write_all(&point.z.to_le_bytes()).expect("write");
    }
    path.to_string_lossy().into_owned()
}

fn base_config(inputs: Vec<String>, output: &PathBuf) -> BuildConfig {
    BuildConfig {
        input: inputs,
        output: output.to_string_lossy().into_owned(),
        threads: Threads { work: 2, clip: 2 },
        progress_interval: 0,
        verbose: false,
        ..BuildConfig::default()
    }
}

fn run_build(config: BuildConfig) -> u64 {
    let threads = config.threads;
    let limit = config.limit;
    let mut builder = builder::create(config).expect("create builder");
    builder.run(threads, limit, 0).expect("run build")
}

fn load_hierarchy(output: &PathBuf, postfix: &str) -> Hierarchy {
    Hierarchy::load(&Endpoint::new(output.join("ept-hierarchy")), postfix).expect("load hierarchy")
}

fn read_tile_points(output: &PathBuf, stem: &str, data_type: DataType) -> Vec<DVec3> {
    let table = tile::read(
        data_type,
        &Endpoint::new(output.join("ept-data")),
        stem,
        schema::Schema::standard().point_size(),
    )
    .expect("read tile");
    table.iter().map(schema::read_point).collect()
}

/// Reconstruct a node's bounds by walking its address bits from the root.
fn bounds_of(root: Bounds, key: Dxyz) -> Bounds {
    let mut bounds = root;
    for level in (0..key.d).rev() {
        let dir = (((key.xyz.x >> level) & 1)
            | (((key.xyz.y >> level) & 1) << 1)
            | (((key.xyz.z >> level) & 1) << 2)) as u8;
        bounds.go(dir);
    }
    bounds
}

/// A lattice of points guaranteed to land in distinct voxel cells.
fn lattice(per_side: u64, spacing: f64) -> Vec<DVec3> {
    let mut points = Vec::new();
    for i in 0..per_side {
        for j in 0..per_side {
            for k in 0..per_side {
                points.push(DVec3::new(
                    (i as f64 + 0.5) * spacing,
                    (j as f64 + 0.5) * spacing,
                    (k as f64 + 0.5) * spacing,
                ));
            }
        }
    }
    points
}

fn lcg_points(count: usize, seed: u64, scale: DVec3, offset: DVec3) -> Vec<DVec3> {
    let mut state = seed;
    let mut next = move || {
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        (state >> 11) as f64 / (1u64 << 53) as f64
    };
    (0..count)
        .map(|_| {
            DVec3::new(
                offset.x + next() * scale.x,
                offset.y + next() * scale.y,
                offset.z + next() * scale.z,
            )
        })
        .collect()
}

// S1: points in distinct voxel cells all stay in one root tile.
#[test]
fn in_grid_build_writes_one_full_root_tile() {
    let root = test_root("s1");
    let points = lattice(10, 12.0 / 128.0);
    assert_eq!(points.len(), 1000);
    let input = write_bin(&root, "points.bin", &points);
    let output = root.join("out");

    let indexed = run_build(base_config(vec![input], &output));
    assert_eq!(indexed, 1000);

    let hierarchy = load_hierarchy(&output, "");
    assert_eq!(hierarchy.snapshot(), vec![(Dxyz::new(0, 0, 0, 0), 1000)]);

    let tile_points = read_tile_points(&output, "0-0-0-0", DataType::Binary);
    assert_eq!(tile_points.len(), 1000);
    let expected: HashSet<_> = points.iter().map(|p| format!("{p:?}")).collect();
    let seen: HashSet<_> = tile_points.iter().map(|p| format!("{p:?}")).collect();
    assert_eq!(seen, expected);
}

// Property 3 on the S1 tile: no two grid records share a voxel cell.
#[test]
fn grid_records_occupy_distinct_voxel_cells() {
    let root = test_root("uniqueness");
    let points = lattice(6, 1.0 / 8.0);
    let input = write_bin(&root, "points.bin", &points);
    let output = root.join("out");

    let mut config = base_config(vec![input], &output);
    config.span = 8;
    run_build(config);

    let (metadata, _) = crate::metadata::Metadata::load(&Endpoints::new(output.clone(), None), "")
        .expect("metadata");
    let tile_points = read_tile_points(&output, "0-0-0-0", DataType::Binary);
    let mut key = Key::new(metadata.bounds, metadata.span_shift());
    let mut cells = HashSet::new();
    for point in &tile_points {
        key.init(*point, 0);
        assert!(
            cells.insert(key.position()),
            "two grid records share voxel cell {:?}",
            key.position()
        );
    }
}

// S2: a dense corner cluster overflows down a chain of chunks.
#[test]
fn dense_cluster_splits_into_a_deep_chain() {
    let root = test_root("s2");
    let mut points = lcg_points(50_000, 7, DVec3::splat(0.1), DVec3::ZERO);
    points.push(DVec3::new(1.0, 1.0, 1.0));
    points.push(DVec3::ZERO);
    let total = points.len() as u64;
    let input = write_bin(&root, "cluster.bin", &points);
    let output = root.join("out");

    let mut config = base_config(vec![input], &output);
    config.span = 16;
    config.min_node_size = 256;
    config.max_node_size = 1024;
    run_build(config);

    let hierarchy = load_hierarchy(&output, "");
    let snapshot = hierarchy.snapshot();

    let sum: u64 = snapshot.iter().map(|(_, count)| count).sum();
    assert_eq!(sum, total);

    let max_depth = snapshot.iter().map(|(key, _)| key.d).max().expect("nodes");
    assert!(max_depth >= 3, "expected a chain, got depth {max_depth}");

    // No tile outgrew the split policy's reach: the grid is bounded by the
    // cell count and each overflow drains once it is worth a node.
    let bound = 16u64.pow(3) + 8 * 256;
    for (key, count) in &snapshot {
        assert!(*count <= bound, "tile {key} holds {count} points");
    }
}

// Property 2 on the S2 tree: every tile holds exactly its recorded count,
// and every record sits inside its node's bounds.
#[test]
fn tiles_match_their_hierarchy_counts_and_bounds() {
    let root = test_root("fidelity");
    let mut points = lcg_points(20_000, 99, DVec3::splat(0.15), DVec3::ZERO);
    points.push(DVec3::ONE);
    let input = write_bin(&root, "cluster.bin", &points);
    let output = root.join("out");

    let mut config = base_config(vec![input], &output);
    config.span = 16;
    config.min_node_size = 256;
    config.max_node_size = 1024;
    run_build(config);

    let endpoints = Endpoints::new(output.clone(), None);
    let (metadata, _) = crate::metadata::Metadata::load(&endpoints, "").expect("metadata");
    let hierarchy = load_hierarchy(&output, "");

    for (key, count) in hierarchy.snapshot() {
        let tile_points = read_tile_points(&output, &key.to_string(), DataType::Binary);
        assert_eq!(tile_points.len() as u64, count, "tile {key}");
        let bounds = bounds_of(metadata.bounds, key);
        for point in tile_points {
            assert!(bounds.contains(point), "{point} outside {key}");
        }
    }
}

// Property 8: tiles on disk and hierarchy entries name the same node set.
#[test]
fn hierarchy_covers_exactly_the_written_tiles() {
    let root = test_root("coverage");
    let mut points = lcg_points(10_000, 3, DVec3::splat(0.2), DVec3::ZERO);
    points.push(DVec3::ONE);
    let input = write_bin(&root, "cluster.bin", &points);
    let output = root.join("out");

    let mut config = base_config(vec![input], &output);
    config.span = 8;
    config.min_node_size = 128;
    config.max_node_size = 512;
    run_build(config);

    let hierarchy = load_hierarchy(&output, "");
    let from_hierarchy: HashSet<String> = hierarchy
        .snapshot()
        .into_iter()
        .map(|(key, _)| format!("{key}.bin"))
        .collect();

    let from_disk: HashSet<String> = std::fs::read_dir(output.join("ept-data"))
        .expect("data dir")
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect();

    assert_eq!(from_hierarchy, from_disk);
}

// S3: of two points in one voxel cell, the one nearer the cell midpoint
// keeps the slot and the displaced one lands one level down.
#[test]
fn collision_keeps_the_point_nearer_the_cell_midpoint() {
    let root = test_root("s3");
    // Anchors pin the cube to [0,1] on every axis without entering the
    // contested cell.
    let a = DVec3::splat(0.20);
    let b = DVec3::splat(0.26);
    let anchors = [
        DVec3::new(0.0, 0.75, 1.0),
        DVec3::new(1.0, 0.0, 0.75),
        DVec3::new(0.75, 1.0, 0.0),
    ];
    let points = vec![a, b, anchors[0], anchors[1], anchors[2]];
    let input = write_bin(&root, "pair.bin", &points);
    let output = root.join("out");

    let mut config = base_config(vec![input], &output);
    config.span = 2;
    config.min_node_size = 1;
    config.max_node_size = 2;
    run_build(config);

    let hierarchy = load_hierarchy(&output, "");
    assert_eq!(hierarchy.get(Dxyz::new(0, 0, 0, 0)), 4);
    assert_eq!(hierarchy.get(Dxyz::new(1, 0, 0, 0)), 1);
    assert_eq!(hierarchy.total_points(), 5);

    let root_points = read_tile_points(&output, "0-0-0-0", DataType::Binary);
    assert!(root_points.contains(&b));
    assert!(!root_points.contains(&a));
    let child_points = read_tile_points(&output, "1-0-0-0", DataType::Binary);
    assert_eq!(child_points, vec![a]);

    // The displaced record kept its identity through the swap.
    let table = tile::read(
        DataType::Binary,
        &Endpoint::new(output.join("ept-data")),
        "1-0-0-0",
        schema::Schema::standard().point_size(),
    )
    .expect("child tile");
    let record = table.iter().next().expect("one record");
    assert_eq!(schema::read_u32(record, 28), 0);
}

// S4: interrupt after one file (via --limit), resume, and match an
// uninterrupted run.
#[test]
fn resumed_builds_match_uninterrupted_ones() {
    let root = test_root("s4");
    let mut f1 = lcg_points(100, 11, DVec3::ONE, DVec3::ZERO);
    f1.push(DVec3::ZERO);
    f1.push(DVec3::ONE);
    let f2 = lcg_points(50, 22, DVec3::splat(0.5), DVec3::splat(0.25));
    let input1 = write_bin(&root, "f1.bin", &f1);
    let input2 = write_bin(&root, "f2.bin", &f2);

    // Partial run: only the first file goes in.
    let resumed_output = root.join("resumed");
    let mut partial = base_config(vec![input1.clone(), input2.clone()], &resumed_output);
    partial.limit = 1;
    let first = run_build(partial);
    assert_eq!(first, f1.len() as u64);

    let manifest = crate::manifest::load(
        &Endpoint::new(resumed_output.join("ept-sources")),
        "",
    )
    .expect("manifest");
    assert!(manifest[0].inserted);
    assert!(!manifest[1].inserted);

    // Resume with the same config, no limit.
    let resume = base_config(vec![input1.clone(), input2.clone()], &resumed_output);
    let second = run_build(resume);
    assert_eq!(second, f2.len() as u64);

    // Reference: one uninterrupted run.
    let reference_output = root.join("reference");
    run_build(base_config(vec![input1, input2], &reference_output));

    let resumed = load_hierarchy(&resumed_output, "").snapshot();
    let reference = load_hierarchy(&reference_output, "").snapshot();
    assert_eq!(resumed, reference);
    assert_eq!(
        resumed.iter().map(|(_, c)| c).sum::<u64>(),
        (f1.len() + f2.len()) as u64
    );
}

// S5: subsets built independently then merged match a single-shot build.
#[test]
fn subset_merge_matches_a_single_shot_build() {
    let root = test_root("s5");
    let points = lattice(8, 1.0 / 8.0);
    let total = points.len() as u64;
    let input = write_bin(&root, "points.bin", &points);

    let merged_output = root.join("merged");
    for id in 1..=4u64 {
        let mut config = base_config(vec![input.clone()], &merged_output);
        config.span = 8;
        config.subset = Some(Subset::new(id, 4).expect("subset"));
        run_build(config);
    }
    assert!(merged_output.join("ept-1.json").exists());

    merger::merge(
        Endpoints::new(merged_output.clone(), None),
        Threads { work: 2, clip: 2 },
        false,
        false,
    )
    .expect("merge");

    let single_output = root.join("single");
    let mut config = base_config(vec![input], &single_output);
    config.span = 8;
    run_build(config);

    let merged = load_hierarchy(&merged_output, "").snapshot();
    let single = load_hierarchy(&single_output, "").snapshot();
    assert_eq!(merged, single);
    assert_eq!(merged, vec![(Dxyz::new(0, 0, 0, 0), total)]);

    // Same root tile contents, order aside.
    let mut merged_points = read_tile_points(&merged_output, "0-0-0-0", DataType::Binary);
    let mut single_points = read_tile_points(&single_output, "0-0-0-0", DataType::Binary);
    let sort = |points: &mut Vec<DVec3>| {
        points.sort_by(|a, b| {
            (a.x, a.y, a.z)
                .partial_cmp(&(b.x, b.y, b.z))
                .expect("ordered")
        })
    };
    sort(&mut merged_points);
    sort(&mut single_points);
    assert_eq!(merged_points, single_points);
}

// S6: one bad file cannot poison the build.
#[test]
fn per_file_failures_stay_in_the_manifest() {
    let root = test_root("s6");
    let mut good1 = lcg_points(20, 5, DVec3::ONE, DVec3::ZERO);
    good1.push(DVec3::ZERO);
    good1.push(DVec3::ONE);
    let good2 = lcg_points(30, 6, DVec3::splat(0.4), DVec3::splat(0.3));
    let input1 = write_bin(&root, "good1.bin", &good1);
    let input2 = write_bin(&root, "good2.bin", &good2);
    let malformed = root.join("broken.xyz");
    std::fs::write(&malformed, b"1 2 3\nnot a point\n").expect("write malformed");
    let vanishing = write_bin(&root, "vanishing.bin", &lcg_points(10, 8, DVec3::ONE, DVec3::ZERO));

    let output = root.join("out");
    let config = base_config(
        vec![
            input1,
            malformed.to_string_lossy().into_owned(),
            input2,
            vanishing.clone(),
        ],
        &output,
    );

    let threads = config.threads;
    let mut builder = builder::create(config).expect("create");
    // The vanishing file analyzed fine but disappears before insertion,
    // exercising the insert-time error path as well.
    std::fs::remove_file(&vanishing).expect("remove input");
    builder.run(threads, 0, 0).expect("build survives bad files");

    let manifest =
        crate::manifest::load(&Endpoint::new(output.join("ept-sources")), "").expect("manifest");
    let broken = manifest
        .iter()
        .find(|item| item.source.path.ends_with("broken.xyz"))
        .expect("malformed file in manifest");
    assert!(!broken.source.info.errors.is_empty());

    let vanished = manifest
        .iter()
        .find(|item| item.source.path.ends_with("vanishing.bin"))
        .expect("vanishing file in manifest");
    assert!(vanished.inserted, "failed inserts are not retried on resume");
    assert!(!vanished.source.info.errors.is_empty());

    let hierarchy = load_hierarchy(&output, "");
    assert_eq!(hierarchy.total_points(), (good1.len() + good2.len()) as u64);
}

// Conservation under eviction pressure: aggressive clipping with tiny nodes
// forces chunks out to disk and back, and every point survives it.
#[test]
fn eviction_and_reload_conserve_every_point() {
    let root = test_root("eviction");
    let mut points = lcg_points(3000, 42, DVec3::ONE, DVec3::ZERO);
    points.push(DVec3::ZERO);
    points.push(DVec3::ONE);
    let total = points.len() as u64;
    let input = write_bin(&root, "points.bin", &points);
    let output = root.join("out");

    let mut config = base_config(vec![input], &output);
    config.span = 2;
    config.min_node_size = 4;
    config.max_node_size = 16;
    config.sleep_count = 64;
    run_build(config);

    let hierarchy = load_hierarchy(&output, "");
    let snapshot = hierarchy.snapshot();
    assert_eq!(snapshot.iter().map(|(_, c)| c).sum::<u64>(), total);

    // Spot-check tile fidelity across the (well-populated) tree.
    assert!(snapshot.len() > 64, "expected eviction pressure");
    for (key, count) in snapshot.iter().take(10) {
        let tile_points = read_tile_points(&output, &key.to_string(), DataType::Binary);
        assert_eq!(tile_points.len() as u64, *count);
    }
}

// Zstandard tiles round-trip through a whole build.
#[test]
fn zstandard_builds_read_back() {
    let root = test_root("zstd");
    let points = lattice(5, 1.0 / 8.0);
    let input = write_bin(&root, "points.bin", &points);
    let output = root.join("out");

    let mut config = base_config(vec![input], &output);
    config.span = 8;
    config.data_type = DataType::Zstandard;
    run_build(config);

    let tile_points = read_tile_points(&output, "0-0-0-0", DataType::Zstandard);
    assert_eq!(tile_points.len(), points.len());
    assert!(output.join("ept-data").join("0-0-0-0.zst").exists());
}
