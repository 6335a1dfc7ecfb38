use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use anyhow::Context;
use futures_util::future::BoxFuture;
use slidegate_process::ResourceId;

use crate::error::PreviewError;

const DEFAULT_ENTRY_FILE: &str = "slides.md";

/// Maps a resource id to the entry document of its slide project.
pub trait ProjectResolver: Send + Sync + 'static {
    fn resolve<'a>(&'a self, id: &'a ResourceId) -> BoxFuture<'a, Result<PathBuf, PreviewError>>;
}

#[derive(Debug, Default, serde::Deserialize)]
struct ProjectManifest {
    #[serde(default)]
    projects: HashMap<String, ManifestEntry>,
}

#[derive(Debug, serde::Deserialize)]
struct ManifestEntry {
    slides_path: PathBuf,
}

/// Resolves projects stored on local disk: either listed in a TOML manifest
/// or laid out as `<root>/<id>/slides.md`.
#[derive(Debug, Clone)]
pub struct FsProjectResolver {
    root: PathBuf,
    overrides: HashMap<ResourceId, PathBuf>,
}

impl FsProjectResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            overrides: HashMap::new(),
        }
    }

    /// ```toml
    /// [projects.42]
    /// slides_path = "team-a/deck/slides.md"
    /// ```
    /// Relative paths are taken from `root`.
    pub async fn with_manifest(root: impl Into<PathBuf>, manifest: &Path) -> anyhow::Result<Self> {
        let raw = tokio::fs::read_to_string(manifest)
            .await
            .with_context(|| format!("read projects manifest {}", manifest.display()))?;
        let parsed: ProjectManifest = toml::from_str(&raw)
            .with_context(|| format!("parse projects manifest {}", manifest.display()))?;

        let mut resolver = Self::new(root);
        for (id, entry) in parsed.projects {
            resolver.overrides.insert(ResourceId::new(id), entry.slides_path);
        }
        tracing::info!(
            manifest = %manifest.display(),
            projects = resolver.overrides.len(),
            "loaded projects manifest"
        );
        Ok(resolver)
    }

    fn candidate(&self, id: &ResourceId) -> PathBuf {
        match self.overrides.get(id) {
            Some(p) if p.is_absolute() => p.clone(),
            Some(p) => self.root.join(p),
            None => self.root.join(id.as_str()).join(DEFAULT_ENTRY_FILE),
        }
    }
}

impl ProjectResolver for FsProjectResolver {
    fn resolve<'a>(&'a self, id: &'a ResourceId) -> BoxFuture<'a, Result<PathBuf, PreviewError>> {
        Box::pin(async move {
            if !id.is_path_safe() {
                return Err(PreviewError::NotFound(format!("invalid resource id: {id:?}")));
            }

            let candidate = self.candidate(id);
            let path = tokio::fs::canonicalize(&candidate).await.map_err(|e| {
                tracing::debug!(resource_id = %id, path = %candidate.display(), error = %e, "project lookup failed");
                PreviewError::NotFound(format!("no slide project for resource {id}"))
            })?;

            match tokio::fs::metadata(&path).await {
                Ok(meta) if meta.is_file() => Ok(path),
                _ => Err(PreviewError::NotFound(format!(
                    "no slide project for resource {id}"
                ))),
            }
        })
    }
}
