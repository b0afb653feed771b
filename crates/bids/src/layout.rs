use std::collections::{BTreeMap, BTreeSet};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use tracing::debug;
use walkdir::{DirEntry, WalkDir};

use crate::entities::{parse_entities, values_equal, Entities, FILE_TYPE_ENTITIES};
use crate::error::{LayoutError, Result};
use crate::query::{EntityFilter, Query};

const IGNORED_TOP_LEVEL: &[&str] = &["code", "derivatives", "sourcedata", "stimuli", "models"];

/// Entities never compared when ranking nearest files.
const NEAREST_IGNORED: &[&str] = &["suffix", "extension"];

#[derive(Debug, Clone, PartialEq)]
pub struct BidsFile {
    path: PathBuf,
    entities: Entities,
}

impl BidsFile {
    pub fn new(path: PathBuf) -> Self {
        let entities = parse_entities(&path);
        Self { path, entities }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn dirname(&self) -> &Path {
        self.path.parent().unwrap_or_else(|| Path::new(""))
    }

    pub fn filename(&self) -> &str {
        self.path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or_default()
    }

    pub fn entities(&self) -> &Entities {
        &self.entities
    }

    pub fn entity(&self, name: &str) -> Option<&str> {
        self.entities.get(name).map(String::as_str)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NearestOptions {
    /// Drop candidates whose shared entities disagree with the reference.
    pub strict: bool,
    /// Return every ranked match instead of the single best one.
    pub all: bool,
    /// Also search directories that are not ancestors of the reference.
    pub full_search: bool,
    /// Drop candidates that carry an entity the reference lacks, or lack one
    /// it has. Entities constrained by the query are exempt.
    pub exact: bool,
}

impl NearestOptions {
    pub fn strict() -> Self {
        Self {
            strict: true,
            ..Self::default()
        }
    }

    pub fn strict_all() -> Self {
        Self {
            strict: true,
            all: true,
            ..Self::default()
        }
    }

    /// Every file of the same acquisition as the reference, e.g. all echoes
    /// of one run without mixing in other spaces.
    pub fn same_acquisition() -> Self {
        Self {
            exact: true,
            ..Self::strict_all()
        }
    }
}

/// Read-only index over one BIDS dataset and any number of derivative trees.
///
/// The index is built once by walking every root; all queries afterwards are
/// served from memory, so a layout can be shared across threads by reference.
#[derive(Debug, Clone)]
pub struct BidsLayout {
    roots: Vec<PathBuf>,
    files: BTreeMap<PathBuf, BidsFile>,
}

impl BidsLayout {
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        Self::with_derivatives(root, &[])
    }

    pub fn with_derivatives(root: impl AsRef<Path>, derivatives: &[PathBuf]) -> Result<Self> {
        let mut roots = vec![absolute(root.as_ref())?];
        for extra in derivatives {
            roots.push(absolute(extra)?);
        }
        let mut files = BTreeMap::new();
        for root in &roots {
            if !root.is_dir() {
                return Err(LayoutError::MissingRoot(root.clone()));
            }
            index_root(root, &mut files)?;
        }
        debug!(
            roots = roots.len(),
            files = files.len(),
            "indexed dataset"
        );
        Ok(Self { roots, files })
    }

    pub fn root(&self) -> &Path {
        &self.roots[0]
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn files(&self) -> impl Iterator<Item = &BidsFile> {
        self.files.values()
    }

    /// Every indexed file matching `query`, sorted by path.
    pub fn get(&self, query: &Query) -> Vec<&BidsFile> {
        self.files
            .values()
            .filter(|file| query.matches(file.entities()))
            .collect()
    }

    pub fn get_file(&self, path: impl AsRef<Path>) -> Result<&BidsFile> {
        let path = path.as_ref();
        let candidates: Vec<PathBuf> = if path.is_absolute() {
            vec![path.to_path_buf()]
        } else {
            self.roots.iter().map(|root| root.join(path)).collect()
        };
        candidates
            .iter()
            .find_map(|candidate| self.files.get(candidate))
            .ok_or_else(|| LayoutError::FileNotIndexed(path.to_path_buf()))
    }

    pub fn get_subjects(&self) -> Vec<String> {
        let subjects: BTreeSet<&str> = self
            .files
            .values()
            .filter_map(|file| file.entity("subject"))
            .collect();
        subjects.into_iter().map(str::to_string).collect()
    }

    /// Files matching `query` that sit closest to `reference` in the tree.
    ///
    /// Candidates are grouped by directory, and directories are visited from
    /// the reference's own folder upwards. Inside a folder, candidates sharing
    /// more entity values with the reference rank first. Entities constrained
    /// by the query are not compared, so a query for `desc-brain` still finds
    /// the mask next to a `desc-preproc` reference.
    pub fn get_nearest(
        &self,
        reference: impl AsRef<Path>,
        query: &Query,
        opts: NearestOptions,
    ) -> Result<Vec<&BidsFile>> {
        let reference = self.get_file(reference)?;
        let mut query = query.clone();
        if !query.contains("suffix") {
            if let Some(suffix) = reference.entity("suffix") {
                query.set("suffix", EntityFilter::value(suffix));
            }
        }
        let compared: Vec<(&str, &str)> = reference
            .entities()
            .iter()
            .filter(|(name, _)| !NEAREST_IGNORED.contains(&name.as_str()) && !query.contains(name))
            .map(|(name, value)| (name.as_str(), value.as_str()))
            .collect();

        let mut folders: BTreeMap<&Path, Vec<&BidsFile>> = BTreeMap::new();
        for file in self.get(&query) {
            folders.entry(file.dirname()).or_default().push(file);
        }

        let mut search: Vec<&Path> = reference
            .dirname()
            .ancestors()
            .filter(|dir| folders.contains_key(dir))
            .collect();
        if opts.full_search {
            let rest: Vec<&Path> = folders
                .keys()
                .copied()
                .filter(|dir| !search.contains(dir))
                .collect();
            search.extend(rest);
        }

        let mut matches = Vec::new();
        for dir in search {
            let mut ranked: Vec<(&BidsFile, usize)> = folders[dir]
                .iter()
                .filter_map(|file| {
                    let (shared, equal) = count_matches(&compared, file);
                    if opts.strict && shared != equal {
                        None
                    } else if opts.exact && !same_entity_names(&compared, file, &query) {
                        None
                    } else {
                        Some((*file, equal))
                    }
                })
                .collect();
            if ranked.is_empty() {
                continue;
            }
            ranked.sort_by(|a, b| b.1.cmp(&a.1));
            matches.extend(ranked.into_iter().map(|(file, _)| file));
            if !opts.all {
                matches.truncate(1);
                break;
            }
        }
        Ok(matches)
    }

    /// Sidecar metadata for `path`, merged per the BIDS inheritance principle.
    pub fn get_metadata(&self, path: impl AsRef<Path>) -> Result<Map<String, Value>> {
        let file = self.get_file(path)?;
        let root = self.root_for(file.path());
        let suffix = file.entity("suffix");
        let mut sidecars: Vec<(usize, usize, &BidsFile)> = self
            .files
            .values()
            .filter(|candidate| {
                candidate.path() != file.path()
                    && candidate.entity("extension") == Some(".json")
                    && candidate.entity("suffix") == suffix
                    && candidate.dirname().starts_with(root)
                    && file.path().starts_with(candidate.dirname())
                    && is_subset(candidate, file)
            })
            .map(|candidate| {
                let depth = candidate.dirname().components().count();
                let specificity = acquisition_entities(candidate).count();
                (depth, specificity, candidate)
            })
            .collect();
        sidecars.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));

        let mut metadata = Map::new();
        for (_, _, sidecar) in sidecars {
            let raw = fs::read_to_string(sidecar.path())?;
            let parsed: Map<String, Value> =
                serde_json::from_str(&raw).map_err(|source| LayoutError::InvalidSidecar {
                    path: sidecar.path().to_path_buf(),
                    source,
                })?;
            metadata.extend(parsed);
        }
        Ok(metadata)
    }

    /// `EchoTime` in seconds.
    pub fn get_echo_time(&self, path: impl AsRef<Path>) -> Result<f64> {
        let path = path.as_ref();
        self.get_metadata(path)?
            .get("EchoTime")
            .and_then(Value::as_f64)
            .ok_or_else(|| LayoutError::MissingMetadata {
                path: path.to_path_buf(),
                field: "EchoTime",
            })
    }

    fn root_for(&self, path: &Path) -> &Path {
        self.roots
            .iter()
            .filter(|root| path.starts_with(root))
            .max_by_key(|root| root.components().count())
            .map(PathBuf::as_path)
            .unwrap_or_else(|| self.root())
    }
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(env::current_dir()?.join(path))
    }
}

fn index_root(root: &Path, files: &mut BTreeMap<PathBuf, BidsFile>) -> Result<()> {
    let walker = WalkDir::new(root)
        .follow_links(true)
        .into_iter()
        .filter_entry(|entry| !is_ignored(entry));
    for entry in walker {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path().to_path_buf();
        files.insert(path.clone(), BidsFile::new(path));
    }
    Ok(())
}

fn is_ignored(entry: &DirEntry) -> bool {
    if entry.depth() == 0 {
        return false;
    }
    let name = entry.file_name().to_string_lossy();
    if name.starts_with('.') {
        return true;
    }
    entry.depth() == 1 && entry.file_type().is_dir() && IGNORED_TOP_LEVEL.contains(&name.as_ref())
}

fn count_matches(compared: &[(&str, &str)], file: &BidsFile) -> (usize, usize) {
    let mut shared = 0;
    let mut equal = 0;
    for (name, value) in compared {
        if let Some(other) = file.entity(name) {
            shared += 1;
            if values_equal(name, value, other) {
                equal += 1;
            }
        }
    }
    (shared, equal)
}

fn same_entity_names(compared: &[(&str, &str)], file: &BidsFile, query: &Query) -> bool {
    let names = file
        .entities()
        .keys()
        .filter(|name| !NEAREST_IGNORED.contains(&name.as_str()) && !query.contains(name))
        .count();
    names == compared.len() && compared.iter().all(|(name, _)| file.entity(name).is_some())
}

fn acquisition_entities(file: &BidsFile) -> impl Iterator<Item = (&String, &String)> {
    file.entities()
        .iter()
        .filter(|(name, _)| !FILE_TYPE_ENTITIES.contains(&name.as_str()))
}

/// True when every acquisition entity of `sidecar` appears in `file` with the same value.
fn is_subset(sidecar: &BidsFile, file: &BidsFile) -> bool {
    acquisition_entities(sidecar).all(|(name, value)| {
        file.entity(name)
            .is_some_and(|other| values_equal(name, value, other))
    })
}
