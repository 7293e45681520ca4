//! Places pattern definitions are read from.

use std::{
    cmp::Ordering,
    fs,
    path::{Path, PathBuf},
    sync::{RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use async_trait::async_trait;
use meridian_types::PatternDefinition;
use tracing::{debug, warn};

use crate::error::EngineError;

/// A read-only catalogue of pattern definitions.
#[async_trait]
pub trait PatternSource: Send + Sync {
    /// Returns the definition for `pattern_id`. Without a version the highest available version
    /// is returned. `Ok(None)` means the source has no such pattern.
    async fn fetch(&self, pattern_id: &str, version: Option<&str>) -> Result<Option<PatternDefinition>, EngineError>;

    /// Distinct pattern ids the source can serve, sorted.
    async fn list(&self) -> Result<Vec<String>, EngineError>;
}

/// Reads one pattern per `.yaml`, `.yml`, or `.json` file from a directory.
#[derive(Debug, Clone)]
pub struct DirectoryPatternSource {
    root: PathBuf,
}

impl DirectoryPatternSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn definition_files(&self) -> Result<Vec<PathBuf>, EngineError> {
        let entries = fs::read_dir(&self.root).map_err(|error| {
            EngineError::source_error(format!("cannot read pattern directory {}: {error}", self.root.display()))
        })?;
        let mut files: Vec<PathBuf> = entries
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.is_file() && DefinitionFormat::from_path(path).is_some())
            .collect();
        files.sort();
        Ok(files)
    }

    /// Parses every file, skipping (with a warning) files that do not parse.
    fn read_all(&self) -> Result<Vec<(PathBuf, Result<PatternDefinition, EngineError>)>, EngineError> {
        Ok(self
            .definition_files()?
            .into_iter()
            .map(|path| {
                let parsed = read_definition(&path);
                (path, parsed)
            })
            .collect())
    }
}

#[async_trait]
impl PatternSource for DirectoryPatternSource {
    async fn fetch(&self, pattern_id: &str, version: Option<&str>) -> Result<Option<PatternDefinition>, EngineError> {
        let mut candidates = Vec::new();
        for (path, parsed) in self.read_all()? {
            match parsed {
                Ok(definition) if definition.id == pattern_id => candidates.push(definition),
                Ok(_) => {}
                // A broken file named after the requested pattern must not look like "not found".
                Err(error) if file_stem(&path) == Some(pattern_id) => return Err(error),
                Err(error) => warn!(path = %path.display(), error = %error, "skipping unreadable pattern file"),
            }
        }
        debug!(pattern = %pattern_id, candidates = candidates.len(), "pattern files scanned");
        Ok(select_version(candidates, version))
    }

    async fn list(&self) -> Result<Vec<String>, EngineError> {
        let mut ids: Vec<String> = Vec::new();
        for (path, parsed) in self.read_all()? {
            match parsed {
                Ok(definition) => ids.push(definition.id),
                Err(_) => {
                    if let Some(stem) = file_stem(&path) {
                        ids.push(stem.to_string());
                    }
                }
            }
        }
        ids.sort();
        ids.dedup();
        Ok(ids)
    }
}

/// Holds definitions in memory; used for embedding and tests.
#[derive(Debug, Default)]
pub struct InMemoryPatternSource {
    definitions: RwLock<Vec<PatternDefinition>>,
}

impl InMemoryPatternSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_definitions(definitions: impl IntoIterator<Item = PatternDefinition>) -> Self {
        Self {
            definitions: RwLock::new(definitions.into_iter().collect()),
        }
    }

    /// Adds or replaces the definition with the same id and version.
    pub fn insert(&self, definition: PatternDefinition) {
        let mut definitions = self.write();
        definitions.retain(|existing| existing.key() != definition.key());
        definitions.push(definition);
    }

    /// Removes every version of `pattern_id`.
    pub fn remove(&self, pattern_id: &str) -> bool {
        let mut definitions = self.write();
        let before = definitions.len();
        definitions.retain(|existing| existing.id != pattern_id);
        definitions.len() != before
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<PatternDefinition>> {
        self.definitions.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<PatternDefinition>> {
        self.definitions.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl PatternSource for InMemoryPatternSource {
    async fn fetch(&self, pattern_id: &str, version: Option<&str>) -> Result<Option<PatternDefinition>, EngineError> {
        let candidates = self
            .read()
            .iter()
            .filter(|definition| definition.id == pattern_id)
            .cloned()
            .collect();
        Ok(select_version(candidates, version))
    }

    async fn list(&self) -> Result<Vec<String>, EngineError> {
        let mut ids: Vec<String> = self.read().iter().map(|definition| definition.id.clone()).collect();
        ids.sort();
        ids.dedup();
        Ok(ids)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DefinitionFormat {
    Yaml,
    Json,
}

impl DefinitionFormat {
    fn from_path(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()?.to_ascii_lowercase().as_str() {
            "yaml" | "yml" => Some(Self::Yaml),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

/// Parses a single definition file, choosing the format from its extension.
pub fn read_definition(path: &Path) -> Result<PatternDefinition, EngineError> {
    let format = DefinitionFormat::from_path(path)
        .ok_or_else(|| EngineError::source_error(format!("{} is not a .yaml, .yml, or .json file", path.display())))?;
    let content = fs::read_to_string(path)
        .map_err(|error| EngineError::source_error(format!("cannot read {}: {error}", path.display())))?;
    let parsed = match format {
        DefinitionFormat::Yaml => serde_yaml::from_str(&content).map_err(|error| error.to_string()),
        DefinitionFormat::Json => serde_json::from_str(&content).map_err(|error| error.to_string()),
    };
    parsed.map_err(|error| EngineError::source_error(format!("cannot parse {}: {error}", path.display())))
}

fn file_stem(path: &Path) -> Option<&str> {
    path.file_stem().and_then(|stem| stem.to_str())
}

fn select_version(mut candidates: Vec<PatternDefinition>, version: Option<&str>) -> Option<PatternDefinition> {
    match version {
        Some(version) => candidates.into_iter().find(|definition| definition.version == version),
        None => {
            candidates.sort_by(|left, right| compare_versions(&left.version, &right.version));
            candidates.pop()
        }
    }
}

/// Orders dotted versions segment by segment, so `1.10` sorts after `1.9`.
///
/// Segments compare as integers when both parse, lexically otherwise. A version that runs out of
/// segments first is the older one.
pub fn compare_versions(left: &str, right: &str) -> Ordering {
    let mut left_segments = left.split('.');
    let mut right_segments = right.split('.');
    loop {
        let ordering = match (left_segments.next(), right_segments.next()) {
            (None, None) => return Ordering::Equal,
            (Some(_), None) => return Ordering::Greater,
            (None, Some(_)) => return Ordering::Less,
            (Some(left_segment), Some(right_segment)) => {
                match (left_segment.parse::<u64>(), right_segment.parse::<u64>()) {
                    (Ok(left_number), Ok(right_number)) => left_number.cmp(&right_number),
                    _ => left_segment.cmp(right_segment),
                }
            }
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OVERVIEW_V1: &str = r#"
id: portfolio_overview
version: 1
steps:
  - capability: ledger.positions
    as: positions
outputs: [positions]
"#;

    const OVERVIEW_V2: &str = r#"{
  "id": "portfolio_overview",
  "version": "2",
  "steps": [{"capability": "ledger.positions", "as": "positions"}],
  "outputs": ["positions"]
}"#;

    #[tokio::test]
    async fn directory_source_reads_yaml_and_json_and_picks_latest() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("overview_v1.yaml"), OVERVIEW_V1).expect("write yaml");
        fs::write(dir.path().join("overview_v2.json"), OVERVIEW_V2).expect("write json");
        fs::write(dir.path().join("README.md"), "not a pattern").expect("write readme");

        let source = DirectoryPatternSource::new(dir.path());
        let latest = source.fetch("portfolio_overview", None).await.expect("fetch").expect("found");
        assert_eq!(latest.version, "2");

        let pinned = source.fetch("portfolio_overview", Some("1")).await.expect("fetch").expect("found");
        assert_eq!(pinned.version, "1");

        assert!(source.fetch("tax_lots", None).await.expect("fetch").is_none());
        assert_eq!(source.list().await.expect("list"), vec!["portfolio_overview".to_string()]);
    }

    #[tokio::test]
    async fn unparseable_file_named_after_pattern_is_a_source_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("broken.yaml"), "id: [unterminated").expect("write");

        let source = DirectoryPatternSource::new(dir.path());
        let error = source.fetch("broken", None).await.expect_err("parse error");
        assert_eq!(error.code(), "PATTERN_SOURCE_ERROR");
        assert!(source.fetch("other", None).await.expect("skips broken file").is_none());
    }

    #[tokio::test]
    async fn missing_directory_is_a_source_error() {
        let source = DirectoryPatternSource::new("/nonexistent/meridian/patterns");
        assert!(matches!(source.list().await, Err(EngineError::Source { .. })));
    }

    #[tokio::test]
    async fn in_memory_source_replaces_same_version() {
        let source = InMemoryPatternSource::new();
        let mut definition: PatternDefinition = serde_yaml::from_str(OVERVIEW_V1).expect("yaml");
        source.insert(definition.clone());
        definition.description = Some("updated".into());
        source.insert(definition);

        let fetched = source.fetch("portfolio_overview", None).await.expect("fetch").expect("found");
        assert_eq!(fetched.description.as_deref(), Some("updated"));
        assert!(source.remove("portfolio_overview"));
        assert!(source.list().await.expect("list").is_empty());
    }

    #[test]
    fn versions_compare_segment_by_segment() {
        assert_eq!(compare_versions("10", "9"), Ordering::Greater);
        assert_eq!(compare_versions("1.5", "1.10"), Ordering::Less);
        assert_eq!(compare_versions("1.9", "1.10"), Ordering::Less);
        assert_eq!(compare_versions("1.2.0", "1.10.0"), Ordering::Less);
        assert_eq!(compare_versions("2", "1.10"), Ordering::Greater);
        assert_eq!(compare_versions("1.2", "1.2.1"), Ordering::Less);
        assert_eq!(compare_versions("1.10", "1.10"), Ordering::Equal);
        assert_eq!(compare_versions("beta", "alpha"), Ordering::Greater);
    }

    #[test]
    fn latest_version_prefers_higher_minor_over_longer_string() {
        let candidates = ["1.9", "1.10", "1.2"]
            .into_iter()
            .map(|version| {
                let mut definition: PatternDefinition = serde_yaml::from_str(OVERVIEW_V1).expect("pattern yaml");
                definition.version = version.to_string();
                definition
            })
            .collect();
        let latest = select_version(candidates, None).expect("latest");
        assert_eq!(latest.version, "1.10");
    }
}
