use crate::endpoint::Endpoint;
use crate::shared::Bounds;
use serde::{Deserialize, Serialize};
use std::io;

/// What analysis learned about one input file, plus any errors it produced
/// during analysis or insertion. Per-file errors live here and never
/// propagate into the tree.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SourceInfo {
    pub points: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bounds: Option<Bounds>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub srs: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Source {
    pub path: String,
    #[serde(default)]
    pub info: SourceInfo,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildItem {
    #[serde(flatten)]
    pub source: Source,
    #[serde(default)]
    pub inserted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata_path: Option<String>,
}

impl BuildItem {
    pub fn new(source: Source) -> Self {
        Self {
            source,
            inserted: false,
            metadata_path: None,
        }
    }
}

pub type Manifest = Vec<BuildItem>;

pub fn total_points(manifest: &Manifest) -> u64 {
    manifest.iter().map(|item| item.source.info.points).sum()
}

pub fn inserted_points(manifest: &Manifest) -> u64 {
    manifest
        .iter()
        .filter(|item| item.inserted)
        .map(|item| item.source.info.points)
        .sum()
}

pub fn contains_path(manifest: &Manifest, path: &str) -> bool {
    manifest.iter().any(|item| item.source.path == path)
}

fn manifest_filename(postfix: &str) -> String {
    format!("manifest{postfix}.json")
}

/// Persist the manifest. A subset build writes one detailed blob, since the
/// merge will wake the whole thing up anyway; otherwise each source gets its
/// own detail file and the manifest itself is an overview.
pub fn save(manifest: &mut Manifest, sources: &Endpoint, postfix: &str, subset: bool) -> io::Result<()> {
    if subset {
        let body = serde_json::to_string_pretty(&manifest)?;
        return sources.ensure_put(
            &manifest_filename(postfix),
            body.as_bytes(),
            Endpoint::DEFAULT_TRIES,
        );
    }

    for (origin, item) in manifest.iter_mut().enumerate() {
        let path = format!("{origin}.json");
        let body = serde_json::to_string_pretty(&item.source)?;
        sources.ensure_put(&path, body.as_bytes(), Endpoint::DEFAULT_TRIES)?;
        item.metadata_path = Some(path);
    }

    let overview: Vec<OverviewItem> = manifest.iter().map(OverviewItem::from).collect();
    let body = serde_json::to_string_pretty(&overview)?;
    sources.ensure_put(
        &manifest_filename(postfix),
        body.as_bytes(),
        Endpoint::DEFAULT_TRIES,
    )
}

pub fn load(sources: &Endpoint, postfix: &str) -> io::Result<Manifest> {
    let body = sources.ensure_get_string(&manifest_filename(postfix), Endpoint::DEFAULT_TRIES)?;

    // Subset manifests are already detailed; overviews point at their
    // per-source detail files.
    if let Ok(manifest) = serde_json::from_str::<Manifest>(&body) {
        if manifest.iter().all(|item| item.metadata_path.is_none()) {
            return Ok(manifest);
        }
    }

    let overview: Vec<OverviewItem> = serde_json::from_str(&body)?;
    let mut manifest = Vec::with_capacity(overview.len());
    for item in overview {
        let mut source = Source {
            path: item.path.clone(),
            info: SourceInfo {
                points: item.points,
                bounds: item.bounds,
                srs: None,
                errors: Vec::new(),
            },
        };
        if let Some(detail_path) = &item.metadata_path {
            let body = sources.ensure_get_string(detail_path, Endpoint::DEFAULT_TRIES)?;
            source = serde_json::from_str(&body)?;
        }
        manifest.push(BuildItem {
            source,
            inserted: item.inserted,
            metadata_path: item.metadata_path,
        });
    }
    Ok(manifest)
}

/// Fold one subset's manifest into another. Subsets see the same source
/// list; each marks inserted only the files overlapping its region.
pub fn merge(mut dst: Manifest, src: Manifest) -> Manifest {
    for item in src {
        match dst.iter_mut().find(|d| d.source.path == item.source.path) {
            Some(existing) => {
                existing.inserted |= item.inserted;
                for error in item.source.info.errors {
                    if !existing.source.info.errors.contains(&error) {
                        existing.source.info.errors.push(error);
                    }
                }
                if existing.source.info.points == 0 {
                    existing.source.info.points = item.source.info.points;
                    existing.source.info.bounds = item.source.info.bounds;
                }
            }
            None => dst.push(item),
        }
    }
    dst
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OverviewItem {
    path: String,
    points: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    bounds: Option<Bounds>,
    inserted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    metadata_path: Option<String>,
}

impl From<&BuildItem> for OverviewItem {
    fn from(item: &BuildItem) -> Self {
        Self {
            path: item.source.path.clone(),
            points: item.source.info.points,
            bounds: item.source.info.bounds,
            inserted: item.inserted,
            metadata_path: item.metadata_path.clone(),
        }
    }
}
