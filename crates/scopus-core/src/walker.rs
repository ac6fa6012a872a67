//! Enumerate XML members from directory trees, tar archives and zip archives
//!
//! The walk is visitor-driven: each [`Member`] is handed to the caller with
//! its content still unopened, so counting or skipping a member costs no
//! read. Zip members are opened one at a time, on demand.

use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use serde_json::json;
use zip::ZipArchive;

use crate::error::IngestError;
use crate::logging::emit;
use crate::retry::RetryPolicy;

/// Bytes needed to recognise every supported container format
const MAGIC_LEN: usize = 262;

/// Kind of input found at a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerKind {
    Directory,
    Tar,
    TarGz,
    Zip,
}

impl ContainerKind {
    /// Detect the container kind from metadata and magic bytes.
    ///
    /// Returns `Ok(None)` for a regular file that is not an archive.
    pub fn detect(path: &Path, policy: &RetryPolicy) -> Result<Option<Self>, IngestError> {
        let label = path.display().to_string();
        let meta = policy.run(&label, || {
            fs::metadata(path).map_err(|e| IngestError::io(path, e))
        })?;
        if meta.is_dir() {
            return Ok(Some(Self::Directory));
        }

        let head = policy.run(&label, || {
            let mut f = File::open(path).map_err(|e| IngestError::io(path, e))?;
            let mut head = Vec::with_capacity(MAGIC_LEN);
            f.by_ref()
                .take(MAGIC_LEN as u64)
                .read_to_end(&mut head)
                .map_err(|e| IngestError::io(path, e))?;
            Ok(head)
        })?;
        Ok(Self::from_magic(&head, path))
    }

    fn from_magic(head: &[u8], path: &Path) -> Option<Self> {
        if head.starts_with(b"PK\x03\x04") || head.starts_with(b"PK\x05\x06") {
            return Some(Self::Zip);
        }
        if head.starts_with(&[0x1f, 0x8b]) {
            return Some(Self::TarGz);
        }
        if head.len() >= MAGIC_LEN && &head[257..262] == b"ustar" {
            return Some(Self::Tar);
        }
        // pre-POSIX tar has no magic
        if path.extension().is_some_and(|ext| ext == "tar") {
            return Some(Self::Tar);
        }
        None
    }
}

enum Content<'a> {
    File(&'a Path),
    Stream(&'a mut dyn Read),
    Zip {
        archive: &'a mut ZipArchive<File>,
        index: usize,
        archive_path: &'a Path,
    },
}

/// One XML member of an input container, content not yet read.
pub struct Member<'a> {
    path: String,
    content: Content<'a>,
    policy: RetryPolicy,
}

impl Member<'_> {
    /// Path of the member: filesystem path for directory trees, entry name
    /// inside archives.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Read the whole member.
    ///
    /// Files and zip entries are re-opened on retryable failures; tar
    /// entries are a forward-only stream and are read once.
    pub fn read(self) -> Result<Vec<u8>, IngestError> {
        let label = self.path;
        match self.content {
            Content::File(path) => self.policy.run(&label, || {
                fs::read(path).map_err(|e| IngestError::io(path, e))
            }),
            Content::Stream(reader) => {
                let mut buf = Vec::new();
                reader
                    .read_to_end(&mut buf)
                    .map_err(|e| IngestError::io(Path::new(&label), e))?;
                Ok(buf)
            }
            Content::Zip {
                archive,
                index,
                archive_path,
            } => self.policy.run(&label, || {
                let mut entry = archive
                    .by_index(index)
                    .map_err(|e| IngestError::from_zip(archive_path, e))?;
                let mut buf = Vec::with_capacity(entry.size() as usize);
                entry
                    .read_to_end(&mut buf)
                    .map_err(|e| IngestError::io(archive_path, e))?;
                Ok(buf)
            }),
        }
    }
}

/// Counters from one walk.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WalkStats {
    /// XML members handed to the visitor
    pub members: usize,
    /// Directories and archives opened
    pub containers: usize,
    /// Nested containers or files that could not be opened
    pub failures: usize,
}

/// Walk `root` (directory, tar, tar.gz, zip, or a single `.xml` file),
/// handing every `.xml` member to `visit`.
///
/// The visitor returns [`ControlFlow::Break`] to stop early. Failures on
/// the root itself are returned; failures below it are logged, counted and
/// skipped.
pub fn walk(
    root: &Path,
    policy: &RetryPolicy,
    visit: &mut dyn FnMut(Member<'_>) -> ControlFlow<()>,
) -> Result<WalkStats, IngestError> {
    let mut walker = Walker {
        policy: *policy,
        visit,
        stats: WalkStats::default(),
    };
    match ContainerKind::detect(root, policy)? {
        Some(kind) => {
            walker.walk_container(root, kind)?;
        }
        None if is_xml(&root.to_string_lossy()) => {
            walker.visit_file(root);
        }
        None => {
            return Err(IngestError::Archive {
                path: root.to_path_buf(),
                message: "not a directory, tar or zip archive".to_string(),
            });
        }
    }
    Ok(walker.stats)
}

fn is_xml(name: &str) -> bool {
    name.ends_with(".xml")
}

struct Walker<'v> {
    policy: RetryPolicy,
    visit: &'v mut dyn FnMut(Member<'_>) -> ControlFlow<()>,
    stats: WalkStats,
}

impl Walker<'_> {
    fn walk_container(
        &mut self,
        path: &Path,
        kind: ContainerKind,
    ) -> Result<ControlFlow<()>, IngestError> {
        self.stats.containers += 1;
        match kind {
            ContainerKind::Directory => self.walk_dir(path),
            ContainerKind::Tar => {
                let file = self.open(path)?;
                self.walk_tar(BufReader::new(file), path)
            }
            ContainerKind::TarGz => {
                let file = self.open(path)?;
                self.walk_tar(GzDecoder::new(BufReader::new(file)), path)
            }
            ContainerKind::Zip => self.walk_zip(path),
        }
    }

    fn open(&self, path: &Path) -> Result<File, IngestError> {
        self.policy.run(&path.display().to_string(), || {
            File::open(path).map_err(|e| IngestError::io(path, e))
        })
    }

    fn visit_file(&mut self, path: &Path) -> ControlFlow<()> {
        self.stats.members += 1;
        (self.visit)(Member {
            path: path.to_string_lossy().into_owned(),
            content: Content::File(path),
            policy: self.policy,
        })
    }

    fn walk_dir(&mut self, dir: &Path) -> Result<ControlFlow<()>, IngestError> {
        let mut children: Vec<PathBuf> = self.policy.run(&dir.display().to_string(), || {
            fs::read_dir(dir)
                .and_then(|entries| entries.map(|e| e.map(|e| e.path())).collect())
                .map_err(|e| IngestError::io(dir, e))
        })?;
        children.sort();

        for child in children {
            let flow = if is_xml(&child.to_string_lossy()) && child.is_file() {
                self.visit_file(&child)
            } else {
                match ContainerKind::detect(&child, &self.policy) {
                    Ok(Some(kind)) => self.nested(&child, kind),
                    Ok(None) => {
                        log::debug!("Ignoring non-XML file {}", child.display());
                        ControlFlow::Continue(())
                    }
                    Err(e) => {
                        self.nested_failure(&child, &e);
                        ControlFlow::Continue(())
                    }
                }
            };
            if flow.is_break() {
                return Ok(flow);
            }
        }
        Ok(ControlFlow::Continue(()))
    }

    /// Walk a container below the root, logging instead of propagating errors.
    fn nested(&mut self, path: &Path, kind: ContainerKind) -> ControlFlow<()> {
        match self.walk_container(path, kind) {
            Ok(flow) => flow,
            Err(e) => {
                self.nested_failure(path, &e);
                ControlFlow::Continue(())
            }
        }
    }

    fn nested_failure(&mut self, path: &Path, e: &IngestError) {
        self.stats.failures += 1;
        emit(
            log::Level::Error,
            "failed to read input container",
            json!({"path": path.display().to_string(), "error": e.to_string()}),
        );
    }

    fn walk_tar<R: Read>(
        &mut self,
        reader: R,
        path: &Path,
    ) -> Result<ControlFlow<()>, IngestError> {
        let mut archive = tar::Archive::new(reader);
        let entries = archive.entries().map_err(|e| IngestError::io(path, e))?;
        for entry in entries {
            let mut entry = entry.map_err(|e| IngestError::io(path, e))?;
            if !entry.header().entry_type().is_file() {
                continue;
            }
            let name = match entry.path() {
                Ok(p) => p.to_string_lossy().into_owned(),
                Err(e) => {
                    log::warn!("{}: unreadable entry name: {e}", path.display());
                    continue;
                }
            };
            if !is_xml(&name) {
                continue;
            }
            self.stats.members += 1;
            let flow = (self.visit)(Member {
                path: name,
                content: Content::Stream(&mut entry),
                policy: self.policy,
            });
            if flow.is_break() {
                return Ok(flow);
            }
        }
        Ok(ControlFlow::Continue(()))
    }

    fn walk_zip(&mut self, path: &Path) -> Result<ControlFlow<()>, IngestError> {
        let mut archive = self.policy.run(&path.display().to_string(), || {
            let file = File::open(path).map_err(|e| IngestError::io(path, e))?;
            ZipArchive::new(file).map_err(|e| IngestError::from_zip(path, e))
        })?;
        for index in 0..archive.len() {
            let Some(name) = archive.name_for_index(index).map(str::to_string) else {
                continue;
            };
            if name.ends_with('/') || !is_xml(&name) {
                continue;
            }
            self.stats.members += 1;
            let flow = (self.visit)(Member {
                path: name,
                content: Content::Zip {
                    archive: &mut archive,
                    index,
                    archive_path: path,
                },
                policy: self.policy,
            });
            if flow.is_break() {
                return Ok(flow);
            }
        }
        Ok(ControlFlow::Continue(()))
    }
}
