//! Artifact - immutable, content-addressed result of a bundle build
//!
//! The identifier is the SHA-256 over the manifest (hash field empty), every
//! source unit and every data file, each length-framed. Two builds from the
//! same work unit produce byte-identical artifacts and the same identifier.

use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};

use super::archive::{read_archive, write_archive, write_frame, ArchiveEntry};
use super::manifest::Manifest;
use crate::errors::{ArchiveError, BuildError};

pub const MANIFEST_FILE: &str = "manifest.json";
pub const BUNDLE_FILE: &str = "bundle.py";
pub const ARCHIVE_FILE: &str = "artifact.fcar";
pub const DATA_DIR: &str = "data";

/// One named piece of the bundle (preamble, a code block, bootstrap)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceUnit {
    pub name: String,
    pub source: String,
}

impl SourceUnit {
    pub fn new(name: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFile {
    pub name: String,
    pub bytes: Vec<u8>,
}

/// Files written by [`Artifact::materialize`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaterializedArtifact {
    pub dir: PathBuf,
    pub manifest_path: PathBuf,
    pub bundle_path: PathBuf,
    pub archive_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Artifact {
    manifest: Manifest,
    units: Vec<SourceUnit>,
    data_files: Vec<DataFile>,
}

fn unit_entry_name(position: usize, unit: &SourceUnit) -> String {
    format!("units/{:03}_{}.py", position, unit.name)
}

fn content_hash(
    manifest: &Manifest,
    units: &[SourceUnit],
    data_files: &[DataFile],
) -> Result<String, BuildError> {
    let frame_err = |e: std::io::Error| BuildError::Archive(ArchiveError::Truncated(e));

    let mut framed = Vec::new();
    write_frame(&mut framed, &manifest.unsealed().to_json()?).map_err(frame_err)?;
    for unit in units {
        write_frame(&mut framed, unit.name.as_bytes()).map_err(frame_err)?;
        write_frame(&mut framed, unit.source.as_bytes()).map_err(frame_err)?;
    }
    for file in data_files {
        write_frame(&mut framed, file.name.as_bytes()).map_err(frame_err)?;
        write_frame(&mut framed, &file.bytes).map_err(frame_err)?;
    }

    let mut hasher = Sha256::new();
    hasher.update(&framed);
    Ok(format!("{:x}", hasher.finalize()))
}

impl Artifact {
    /// Compute the content hash and freeze the artifact
    pub(crate) fn seal(
        mut manifest: Manifest,
        units: Vec<SourceUnit>,
        data_files: Vec<DataFile>,
    ) -> Result<Self, BuildError> {
        manifest.content_hash = content_hash(&manifest, &units, &data_files)?;
        Ok(Self {
            manifest,
            units,
            data_files,
        })
    }

    /// Content hash, stable across builds of the same input
    pub fn id(&self) -> &str {
        &self.manifest.content_hash
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn units(&self) -> &[SourceUnit] {
        &self.units
    }

    pub fn data_files(&self) -> &[DataFile] {
        &self.data_files
    }

    pub fn entry_point(&self) -> &str {
        &self.manifest.entry_point
    }

    pub fn qualified_name(&self) -> &str {
        &self.manifest.entry_qualified_name
    }

    /// The single executable script: all units in order
    pub fn bundle_source(&self) -> String {
        self.units
            .iter()
            .map(|u| u.source.trim_end())
            .collect::<Vec<_>>()
            .join("\n\n\n")
            + "\n"
    }

    pub fn to_archive(&self) -> Result<Vec<u8>, BuildError> {
        let mut entries = Vec::with_capacity(1 + self.units.len() + self.data_files.len());
        entries.push(ArchiveEntry::new(MANIFEST_FILE, self.manifest.to_json()?));
        for (position, unit) in self.units.iter().enumerate() {
            entries.push(ArchiveEntry::new(
                unit_entry_name(position, unit),
                unit.source.as_bytes().to_vec(),
            ));
        }
        for file in &self.data_files {
            entries.push(ArchiveEntry::new(
                format!("{}/{}", DATA_DIR, file.name),
                file.bytes.clone(),
            ));
        }
        write_archive(&entries).map_err(|e| BuildError::Archive(ArchiveError::Truncated(e)))
    }

    /// Read an archive back and verify its content hash
    pub fn from_archive(bytes: &[u8]) -> Result<Self, ArchiveError> {
        let mut manifest = None;
        let mut units = Vec::new();
        let mut data_files = Vec::new();

        for entry in read_archive(bytes)? {
            if entry.name == MANIFEST_FILE {
                manifest = Some(Manifest::from_json(&entry.data)?);
            } else if let Some(rest) = entry.name.strip_prefix("units/") {
                let name = rest
                    .strip_suffix(".py")
                    .and_then(|stem| stem.split_once('_'))
                    .map(|(_, name)| name.to_string())
                    .ok_or_else(|| ArchiveError::InvalidEntry(entry.name.clone()))?;
                let source = String::from_utf8(entry.data)
                    .map_err(|_| ArchiveError::InvalidEntry(entry.name.clone()))?;
                units.push(SourceUnit { name, source });
            } else if let Some(name) = entry.name.strip_prefix("data/") {
                data_files.push(DataFile {
                    name: name.to_string(),
                    bytes: entry.data,
                });
            } else {
                return Err(ArchiveError::InvalidEntry(entry.name));
            }
        }

        let manifest = manifest.ok_or(ArchiveError::MissingManifest)?;
        let expected = manifest.content_hash.clone();
        let actual = content_hash(&manifest, &units, &data_files).map_err(|e| match e {
            BuildError::Serialization(e) => ArchiveError::Manifest(e),
            other => ArchiveError::InvalidEntry(other.to_string()),
        })?;
        if actual != expected {
            return Err(ArchiveError::HashMismatch { expected, actual });
        }

        Ok(Self {
            manifest,
            units,
            data_files,
        })
    }

    /// Write `manifest.json`, `bundle.py`, `data/*` and the archive into `dir`
    pub fn materialize(&self, dir: &Path) -> Result<MaterializedArtifact, BuildError> {
        fs::create_dir_all(dir).map_err(|e| BuildError::packaging(dir, e))?;

        let manifest_path = dir.join(MANIFEST_FILE);
        fs::write(&manifest_path, self.manifest.to_json()?)
            .map_err(|e| BuildError::packaging(&manifest_path, e))?;

        let bundle_path = dir.join(BUNDLE_FILE);
        fs::write(&bundle_path, self.bundle_source())
            .map_err(|e| BuildError::packaging(&bundle_path, e))?;

        if !self.data_files.is_empty() {
            let data_dir = dir.join(DATA_DIR);
            fs::create_dir_all(&data_dir).map_err(|e| BuildError::packaging(&data_dir, e))?;
            for file in &self.data_files {
                let path = data_dir.join(&file.name);
                fs::write(&path, &file.bytes).map_err(|e| BuildError::packaging(&path, e))?;
            }
        }

        let archive_path = dir.join(ARCHIVE_FILE);
        fs::write(&archive_path, self.to_archive()?)
            .map_err(|e| BuildError::packaging(&archive_path, e))?;

        Ok(MaterializedArtifact {
            dir: dir.to_path_buf(),
            manifest_path,
            bundle_path,
            archive_path,
        })
    }
}
