//! The run directory: one sub-directory per target plus `manifest.json`, written last.

use crate::{
    outcome::{
        RunManifest,
        TOOL_NAME,
    },
    target::TargetKey,
};
use chrono::Utc;
use eyre::{
    Context as _,
    Result,
};
use sha1::{
    Digest,
    Sha1,
};
use std::path::{
    Path,
    PathBuf,
};
use tokio::io::AsyncWriteExt as _;
use tokio_util::{
    sync::CancellationToken,
    task::TaskTracker,
};

pub const MANIFEST_FILE: &str = "manifest.json";

/// Where an artifact landed, relative to the run directory, with its checksum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactRef {
    pub relative: PathBuf,
    pub sha1: String,
    pub size: u64,
}

#[derive(Debug, Clone)]
pub struct OutputWriter {
    root: PathBuf,
    /// File writes run detached from their callers and are awaited before the manifest.
    pending: TaskTracker,
}

impl OutputWriter {
    /// Creates `<base>/cluster-diag-<component>-<UTC timestamp>`, suffixed when it already exists.
    pub async fn create(base: impl AsRef<Path>, component: &str) -> Result<Self> {
        let base = base.as_ref();
        tokio::fs::create_dir_all(base)
            .await
            .wrap_err_with(|| format!("Failed to create output directory {}", base.display()))?;

        let stem = format!("{TOOL_NAME}-{component}-{}", Utc::now().format("%Y%m%d-%H%M%S"));
        let mut root = base.join(&stem);
        let mut suffix = 1;
        loop {
            match tokio::fs::create_dir(&root).await {
                Ok(()) => break,
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    root = base.join(format!("{stem}-{suffix}"));
                    suffix += 1;
                }
                Err(err) => {
                    return Err(err).wrap_err_with(|| format!("Failed to create run directory {}", root.display()))
                }
            }
        }

        info!(path = %root.display(), "run directory created");
        Ok(Self {
            root,
            pending: TaskTracker::new(),
        })
    }

    /// Uses an existing directory as the run directory.
    pub async fn at(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .wrap_err_with(|| format!("Failed to create run directory {}", root.display()))?;
        Ok(Self {
            root,
            pending: TaskTracker::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.root.join(MANIFEST_FILE)
    }

    /// Writes `<target>/<filename>`. Either the complete file is visible afterwards or nothing is,
    /// also when the returned future is dropped half way.
    pub async fn write_artifact(&self, target: &TargetKey, filename: &str, bytes: &[u8]) -> Result<ArtifactRef> {
        let relative = Path::new(target.as_str()).join(filename);
        let path = self.root.join(&relative);

        let abandoned = CancellationToken::new();
        let _abandon_on_drop = abandoned.clone().drop_guard();
        self.pending
            .spawn(write_atomic(path, bytes.to_vec(), abandoned))
            .await
            .wrap_err("Artifact write task failed")??;
        trace!(path = %relative.display(), size = bytes.len(), "artifact written");

        Ok(ArtifactRef {
            relative,
            sha1: sha1_hex(bytes),
            size: bytes.len() as u64,
        })
    }

    /// Must be called once, after every node result is final. Waits for artifact writes whose
    /// callers were abandoned.
    pub async fn write_manifest(&self, manifest: &RunManifest) -> Result<PathBuf> {
        self.pending.close();
        self.pending.wait().await;

        let json = serde_json::to_vec_pretty(manifest).wrap_err("Failed to serialize the run manifest")?;
        let path = self.manifest_path();
        write_atomic(path.clone(), json, CancellationToken::new()).await?;
        debug!(path = %path.display(), "manifest written");
        Ok(path)
    }
}

/// Writes a dot-prefixed sibling first and renames it into place. When `abandoned` fires before
/// the rename the sibling is removed and nothing becomes visible.
async fn write_atomic(path: PathBuf, bytes: Vec<u8>, abandoned: CancellationToken) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| eyre::eyre!("{} has no parent directory", path.display()))?;
    let name = path
        .file_name()
        .ok_or_else(|| eyre::eyre!("{} has no file name", path.display()))?;
    tokio::fs::create_dir_all(parent)
        .await
        .wrap_err_with(|| format!("Failed to create {}", parent.display()))?;

    let partial = parent.join(format!(".{}.partial", name.to_string_lossy()));
    let written = async {
        let mut file = tokio::fs::File::create(&partial).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);
        if abandoned.is_cancelled() {
            return Err(std::io::Error::new(std::io::ErrorKind::Interrupted, "write abandoned"));
        }
        tokio::fs::rename(&partial, &path).await
    }
    .await;

    if let Err(err) = written {
        let _ = tokio::fs::remove_file(&partial).await;
        return Err(err).wrap_err_with(|| format!("Failed to write {}", path.display()));
    }
    Ok(())
}

fn sha1_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(bytes);
    hasher.finalize().iter().fold(String::new(), |mut acc, b| {
        acc.push_str(&format!("{:02x}", b));
        acc
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn key() -> TargetKey {
        TargetKey::new("es", "node-1", 9200)
    }

    #[tokio::test]
    async fn artifacts_land_under_the_target_key() {
        let dir = temp_dir::TempDir::new().unwrap();
        let writer = OutputWriter::at(dir.path()).await.unwrap();

        let artifact = writer.write_artifact(&key(), "cat/cat_indices.txt", b"abc").await.unwrap();
        assert_eq!(artifact.relative, PathBuf::from("es_node-1_9200/cat/cat_indices.txt"));
        assert_eq!(artifact.sha1, "a9993e364706816aba3e25717850c26c9cd0d89d");
        assert_eq!(artifact.size, 3);
        assert_eq!(std::fs::read(dir.path().join(&artifact.relative)).unwrap(), b"abc");

        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("es_node-1_9200/cat"))
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(leftovers, vec![std::ffi::OsString::from("cat_indices.txt")]);
    }

    #[tokio::test]
    async fn abandoned_writes_leave_no_partial_files() {
        let dir = temp_dir::TempDir::new().unwrap();
        let writer = OutputWriter::at(dir.path()).await.unwrap();
        let bytes = vec![7u8; 8 * 1024 * 1024];

        for (i, micros) in [0, 1, 10, 100, 1_000, 10_000].into_iter().enumerate() {
            let k = key();
            let name = format!("big_{i}.bin");
            let write = writer.write_artifact(&k, &name, &bytes);
            let _ = tokio::time::timeout(Duration::from_micros(micros), write).await;
        }
        let manifest = RunManifest::new("es", "full", Vec::new(), Utc::now()).finish(Vec::new(), true);
        writer.write_manifest(&manifest).await.unwrap();

        for entry in std::fs::read_dir(dir.path().join("es_node-1_9200")).unwrap() {
            let entry = entry.unwrap();
            let name = entry.file_name().to_string_lossy().into_owned();
            assert!(!name.starts_with('.'), "leftover {name}");
            assert_eq!(entry.metadata().unwrap().len(), bytes.len() as u64, "{name}");
        }
    }

    #[tokio::test]
    async fn run_directories_never_collide() {
        let dir = temp_dir::TempDir::new().unwrap();
        let first = OutputWriter::create(dir.path(), "es").await.unwrap();
        let second = OutputWriter::create(dir.path(), "es").await.unwrap();
        assert_ne!(first.root(), second.root());
        assert!(first
            .root()
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("cluster-diag-es-"));
    }

    #[tokio::test]
    async fn manifest_is_written_as_json() {
        let dir = temp_dir::TempDir::new().unwrap();
        let writer = OutputWriter::at(dir.path()).await.unwrap();
        let manifest = RunManifest::new("es", "full", vec!["http://localhost:9200".to_string()], Utc::now())
            .finish(Vec::new(), false);

        let path = writer.write_manifest(&manifest).await.unwrap();
        let read: RunManifest = serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap();
        assert_eq!(read, manifest);
    }
}
