// src/repo/index.rs

//! Repository index emission
//!
//! Publishes `eopkg-index.xml` plus its compressed variants and checksum
//! sidecars. Every artifact is first written next to its final name with a
//! `.new` suffix; only once the whole set exists is each renamed into place.
//! A failure while staging removes the `.new` files and leaves the published
//! set untouched. A failed rename also removes whatever is still staged.

use super::{Assets, Repository, ensure_writable};
use crate::compression::{self, CompressionFormat};
use crate::config::{Config, INDEX_NAME};
use crate::db::Database;
use crate::error::{Error, Result};
use crate::hash::{self, HashAlgorithm};
use crate::pool::{Pool, PoolEntry};
use parking_lot::Mutex;
use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

const NEW_SUFFIX: &str = ".new";

/// What a publication wrote
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSummary {
    pub packages: usize,
    pub deltas: usize,
    pub artifacts: Vec<PathBuf>,
}

/// One package in the index with the deltas leading to it
struct IndexedPackage {
    tip: PoolEntry,
    deltas: Vec<PoolEntry>,
}

/// Emits repository indexes, one at a time per repository
pub struct Indexer {
    config: Arc<Config>,
    pool: Pool,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Indexer {
    pub fn new(config: Arc<Config>, pool: Pool) -> Self {
        Self {
            config,
            pool,
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn repo_lock(&self, name: &str) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Render and atomically publish the index of `name`
    pub fn emit(&self, db: &Database, name: &str) -> Result<IndexSummary> {
        let lock = self.repo_lock(name);
        let _guard = lock.lock();

        ensure_writable(&self.config, name)?;
        let assets = Assets::load(&self.config.assets_dir(name))?;
        let packages = db.transaction(|tx| {
            let repo = Repository::get(tx, name)?;
            self.collect(tx, &repo, &assets)
        })?;

        let document = render(&packages, &assets)?;
        let artifacts = publish(&self.config.repo_dir(name), &document)?;

        let summary = IndexSummary {
            packages: packages.len(),
            deltas: packages.iter().map(|p| p.deltas.len()).sum(),
            artifacts,
        };
        info!(
            "Indexed {}: {} packages, {} deltas",
            name, summary.packages, summary.deltas
        );
        Ok(summary)
    }

    fn collect(
        &self,
        tx: &rusqlite::Transaction,
        repo: &Repository,
        assets: &Assets,
    ) -> Result<Vec<IndexedPackage>> {
        let entries = self.pool.linked_entries(tx, repo.id)?;
        let mut tips: HashMap<&str, &PoolEntry> = HashMap::new();
        for entry in entries.iter().filter(|e| !e.archive.is_delta()) {
            let current = tips.entry(entry.archive.name.as_str()).or_insert(entry);
            if entry.archive.release > current.archive.release {
                *current = entry;
            }
        }

        let mut packages: Vec<IndexedPackage> = tips
            .into_values()
            .filter(|tip| {
                let obsolete = assets.is_obsolete(&tip.archive.name);
                if obsolete {
                    debug!("Skipping obsolete package {}", tip.archive.name);
                }
                !obsolete
            })
            .map(|tip| IndexedPackage {
                tip: tip.clone(),
                deltas: entries
                    .iter()
                    .filter(|d| {
                        d.archive.is_delta()
                            && d.archive.name == tip.archive.name
                            && d.archive.release == tip.archive.release
                    })
                    .cloned()
                    .collect(),
            })
            .collect();
        packages.sort_by_key(|p| p.tip.id);
        Ok(packages)
    }
}

fn render(packages: &[IndexedPackage], assets: &Assets) -> Result<Vec<u8>> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 4);
    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), None)))?;
    writer.write_event(Event::Start(BytesStart::new("PISI")))?;

    if let Some(distribution) = &assets.distribution {
        write_verbatim(&mut writer, distribution)?;
    }

    for package in packages {
        let archive = &package.tip.archive;
        writer.write_event(Event::Start(BytesStart::new("Package")))?;
        text_element(&mut writer, "Name", &archive.name)?;

        writer.write_event(Event::Start(BytesStart::new("Source")))?;
        text_element(&mut writer, "Name", &archive.source)?;
        writer.write_event(Event::End(BytesEnd::new("Source")))?;

        writer.write_event(Event::Start(BytesStart::new("History")))?;
        let release = archive.release.to_string();
        let mut update = BytesStart::new("Update");
        update.push_attribute(("release", release.as_str()));
        writer.write_event(Event::Start(update))?;
        text_element(&mut writer, "Version", &archive.version)?;
        writer.write_event(Event::End(BytesEnd::new("Update")))?;
        writer.write_event(Event::End(BytesEnd::new("History")))?;

        text_element(&mut writer, "Architecture", &archive.architecture)?;
        text_element(&mut writer, "DistributionRelease", &archive.dist_release.to_string())?;
        write_file_fields(&mut writer, &package.tip)?;

        if !package.deltas.is_empty() {
            writer.write_event(Event::Start(BytesStart::new("DeltaPackages")))?;
            for delta in &package.deltas {
                let from = delta.archive.from_release.unwrap_or_default().to_string();
                let mut start = BytesStart::new("Delta");
                start.push_attribute(("releaseFrom", from.as_str()));
                writer.write_event(Event::Start(start))?;
                write_file_fields(&mut writer, delta)?;
                writer.write_event(Event::End(BytesEnd::new("Delta")))?;
            }
            writer.write_event(Event::End(BytesEnd::new("DeltaPackages")))?;
        }

        writer.write_event(Event::End(BytesEnd::new("Package")))?;
    }

    if let Some(components) = &assets.components {
        write_verbatim(&mut writer, components)?;
    }
    if let Some(groups) = &assets.groups {
        write_verbatim(&mut writer, groups)?;
    }

    writer.write_event(Event::End(BytesEnd::new("PISI")))?;
    let mut document = writer.into_inner();
    document.push(b'\n');
    Ok(document)
}

fn write_file_fields(writer: &mut Writer<Vec<u8>>, entry: &PoolEntry) -> Result<()> {
    let uri = entry.archive.relative_path().to_string_lossy().into_owned();
    text_element(writer, "PackageURI", &uri)?;
    text_element(writer, "PackageSize", &entry.archive.size.to_string())?;
    text_element(writer, "PackageHash", &entry.archive.sha1)?;
    Ok(())
}

fn text_element(writer: &mut Writer<Vec<u8>>, name: &str, value: &str) -> Result<()> {
    writer.write_event(Event::Start(BytesStart::new(name)))?;
    writer.write_event(Event::Text(BytesText::new(value)))?;
    writer.write_event(Event::End(BytesEnd::new(name)))?;
    Ok(())
}

fn write_verbatim(writer: &mut Writer<Vec<u8>>, content: &str) -> Result<()> {
    if content.is_empty() {
        return Ok(());
    }
    writer.write_event(Event::Text(BytesText::from_escaped(content)))?;
    Ok(())
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

/// Stage every artifact as `.new`, then rename them all into place
pub fn publish(repo_dir: &Path, document: &[u8]) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(repo_dir)?;
    let index_path = repo_dir.join(INDEX_NAME);

    let mut staged: Vec<PathBuf> = Vec::new();
    if let Err(e) = stage(&index_path, document, &mut staged) {
        discard(&staged);
        return Err(Error::IndexError(format!("{}: {}", repo_dir.display(), e)));
    }

    let mut published = Vec::with_capacity(staged.len());
    for (i, path) in staged.iter().enumerate() {
        let target = path.with_extension("");
        if let Err(e) = fs::rename(path, &target) {
            discard(&staged[i..]);
            return Err(Error::IndexError(format!("{}: {}", target.display(), e)));
        }
        published.push(target);
    }
    Ok(published)
}

fn discard(staged: &[PathBuf]) {
    for path in staged {
        match fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove staged {}: {}", path.display(), e),
        }
    }
}

/// Write one staged file, tracking it for cleanup once anything exists at `path`
fn stage_file<F>(path: PathBuf, staged: &mut Vec<PathBuf>, write: F) -> Result<()>
where
    F: FnOnce(&Path) -> Result<()>,
{
    let result = write(&path);
    if result.is_ok() || path.is_file() {
        staged.push(path);
    }
    result
}

fn stage(index_path: &Path, document: &[u8], staged: &mut Vec<PathBuf>) -> Result<()> {
    let xml_new = with_suffix(index_path, NEW_SUFFIX);
    stage_file(xml_new.clone(), staged, |path| Ok(fs::write(path, document)?))?;
    stage_sidecars(index_path, &xml_new, staged)?;

    for format in CompressionFormat::PUBLISHED {
        let compressed = with_suffix(index_path, format.extension());
        let compressed_new = with_suffix(&compressed, NEW_SUFFIX);
        stage_file(compressed_new.clone(), staged, |path| {
            Ok(compression::compress_file(&xml_new, path, format)?)
        })?;
        stage_sidecars(&compressed, &compressed_new, staged)?;
    }
    Ok(())
}

/// Write `<artifact>.sha1sum.new` and `<artifact>.sha256sum.new` for the staged file
fn stage_sidecars(artifact: &Path, staged_file: &Path, staged: &mut Vec<PathBuf>) -> Result<()> {
    let digests = hash::digest_file(staged_file)?;
    for algorithm in [HashAlgorithm::Sha1, HashAlgorithm::Sha256] {
        let sidecar = with_suffix(&with_suffix(artifact, algorithm.sidecar_suffix()), NEW_SUFFIX);
        stage_file(sidecar, staged, |path| Ok(fs::write(path, digests.get(algorithm))?))?;
    }
    Ok(())
}
