use crate::error::SearchError;
use crate::event::{Emitter, Listener};
use crate::paths::{join_inside, normalize_workspace_rel_path};
use async_trait::async_trait;
use ignore::overrides::OverrideBuilder;
use ignore::WalkBuilder;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// The folders currently open, as seen by activation.
#[async_trait]
pub trait Workspace: Send + Sync {
    fn roots(&self) -> Vec<PathBuf>;

    /// True when any root contains any of `relative_paths`.
    async fn contains_some(&self, relative_paths: &[String]) -> bool;
}

#[derive(Clone, Debug, Default)]
pub struct FsWorkspace {
    roots: Vec<PathBuf>,
}

impl FsWorkspace {
    pub fn new<I, P>(roots: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            roots: roots.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl Workspace for FsWorkspace {
    fn roots(&self) -> Vec<PathBuf> {
        self.roots.clone()
    }

    async fn contains_some(&self, relative_paths: &[String]) -> bool {
        for raw in relative_paths {
            let rel = match normalize_workspace_rel_path(raw) {
                Ok(rel) => rel,
                Err(err) => {
                    tracing::debug!(path = %raw, error = %err, "skipping invalid workspace path");
                    continue;
                }
            };
            for root in &self.roots {
                let Ok(candidate) = join_inside(root, &rel) else {
                    continue;
                };
                if tokio::fs::try_exists(&candidate).await.unwrap_or(false) {
                    return true;
                }
            }
        }
        false
    }
}

/// Bounded glob search over workspace roots.
#[async_trait]
pub trait FileSearch: Send + Sync {
    /// At most `limit` files under `roots` matching any of `include`.
    /// Returns [`SearchError::Cancelled`] once `token` fires.
    async fn find(
        &self,
        roots: &[PathBuf],
        include: &[String],
        limit: usize,
        token: CancellationToken,
    ) -> Result<Vec<PathBuf>, SearchError>;
}

/// [`FileSearch`] backed by the `ignore` walker; `.gitignore` rules apply.
#[derive(Clone, Copy, Debug, Default)]
pub struct WalkFileSearch;

#[async_trait]
impl FileSearch for WalkFileSearch {
    async fn find(
        &self,
        roots: &[PathBuf],
        include: &[String],
        limit: usize,
        token: CancellationToken,
    ) -> Result<Vec<PathBuf>, SearchError> {
        if roots.is_empty() || include.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let roots = roots.to_vec();
        let include = include.to_vec();
        tokio::task::spawn_blocking(move || walk(&roots, &include, limit, &token))
            .await
            .map_err(|err| SearchError::Io(format!("search task failed: {err}")))?
    }
}

fn walk(
    roots: &[PathBuf],
    include: &[String],
    limit: usize,
    token: &CancellationToken,
) -> Result<Vec<PathBuf>, SearchError> {
    let mut found = Vec::new();
    for root in roots {
        let mut overrides = OverrideBuilder::new(root);
        for pattern in include {
            overrides
                .add(pattern)
                .map_err(|err| SearchError::Pattern(format!("{pattern}: {err}")))?;
        }
        let overrides = overrides
            .build()
            .map_err(|err| SearchError::Pattern(err.to_string()))?;

        let mut builder = WalkBuilder::new(root);
        builder
            .hidden(false)
            .follow_links(false)
            .ignore(false)
            .git_ignore(true)
            .git_exclude(true)
            .git_global(false)
            .overrides(overrides);

        for result in builder.build() {
            if token.is_cancelled() {
                return Err(SearchError::Cancelled);
            }
            let dent = match result {
                Ok(d) => d,
                Err(err) => {
                    tracing::trace!(error = %err, "skipping unreadable entry");
                    continue;
                }
            };
            if !dent.file_type().is_some_and(|t| t.is_file()) {
                continue;
            }
            found.push(dent.into_path());
            if found.len() >= limit {
                return Ok(found);
            }
        }
    }
    Ok(found)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProviderRegistrationChange {
    pub scheme: String,
    pub added: bool,
}

/// Which URI schemes currently have a file system provider.
pub struct FileSystemProviders {
    schemes: Arc<Mutex<HashMap<String, usize>>>,
    on_did_change: Arc<Emitter<ProviderRegistrationChange>>,
}

impl Default for FileSystemProviders {
    fn default() -> Self {
        Self::new()
    }
}

impl FileSystemProviders {
    pub fn new() -> Self {
        Self {
            schemes: Arc::new(Mutex::new(HashMap::new())),
            on_did_change: Arc::new(Emitter::new()),
        }
    }

    pub fn has_provider(&self, scheme: &str) -> bool {
        self.schemes.lock().contains_key(scheme)
    }

    pub fn on_did_change(&self) -> &Emitter<ProviderRegistrationChange> {
        &self.on_did_change
    }

    /// The provider stays registered until the listener is disposed.
    pub fn register(&self, scheme: impl Into<String>) -> Listener {
        let scheme = scheme.into();
        let first = {
            let mut schemes = self.schemes.lock();
            let count = schemes.entry(scheme.clone()).or_insert(0);
            *count += 1;
            *count == 1
        };
        if first {
            self.on_did_change.fire(&ProviderRegistrationChange {
                scheme: scheme.clone(),
                added: true,
            });
        }

        let schemes = self.schemes.clone();
        let on_did_change = self.on_did_change.clone();
        Listener::new(move || {
            let last = {
                let mut schemes = schemes.lock();
                match schemes.get_mut(&scheme) {
                    Some(count) if *count > 1 => {
                        *count -= 1;
                        false
                    }
                    Some(_) => {
                        schemes.remove(&scheme);
                        true
                    }
                    None => false,
                }
            };
            if last {
                on_did_change.fire(&ProviderRegistrationChange {
                    scheme,
                    added: false,
                });
            }
        })
    }
}
