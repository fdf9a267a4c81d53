//! Model registry: which snapshots to load, and where they live on disk.
//!
//! Fetching and caching weights belongs to the resolver collaborator; this
//! module only asks it for a local path.

use async_trait::async_trait;
use log::{ info, warn };
use std::fmt;
use std::fs;
use std::path::{ Path, PathBuf };
use std::str::FromStr;
use tokio::process::Command;

use crate::error::RelayError;

/// Weight formats vLLM never loads.
const IGNORE_PATTERNS: [&str; 3] = ["*.msgpack", "*.h5", "*.ot"];

/// Splits `MODELS` (`org/a, org/b`) into repository ids.
pub fn parse_model_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(str::to_string)
        .collect()
}

#[async_trait]
pub trait ModelResolver: Send + Sync {
    /// Returns the local path of a fully materialized snapshot of `repo_id`.
    async fn resolve(&self, repo_id: &str, cache_dir: &Path) -> Result<PathBuf, RelayError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolverKind {
    HubCli,
    Cache,
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseResolverKindError {
    message: String,
}

impl fmt::Display for ParseResolverKindError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ParseResolverKindError {}

impl FromStr for ResolverKind {
    type Err = ParseResolverKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "hub-cli" | "huggingface-cli" | "hub" => Ok(ResolverKind::HubCli),
            "cache" | "offline" => Ok(ResolverKind::Cache),
            _ =>
                Err(ParseResolverKindError {
                    message: format!("Invalid model resolver: '{}' (expected hub-cli or cache)", s),
                }),
        }
    }
}

impl fmt::Display for ResolverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolverKind::HubCli => f.write_str("hub-cli"),
            ResolverKind::Cache => f.write_str("cache"),
        }
    }
}

pub fn new_resolver(kind: ResolverKind) -> Box<dyn ModelResolver> {
    match kind {
        ResolverKind::HubCli => Box::new(HubCliResolver::default()),
        ResolverKind::Cache => Box::new(CacheResolver),
    }
}

/// Delegates to `huggingface-cli download`, which reuses the cache and
/// prints the snapshot path as its last line of output.
#[derive(Debug, Clone)]
pub struct HubCliResolver {
    program: String,
}

impl Default for HubCliResolver {
    fn default() -> Self {
        Self { program: "huggingface-cli".to_string() }
    }
}

impl HubCliResolver {
    pub fn new(program: impl Into<String>) -> Self {
        Self { program: program.into() }
    }
}

#[async_trait]
impl ModelResolver for HubCliResolver {
    async fn resolve(&self, repo_id: &str, cache_dir: &Path) -> Result<PathBuf, RelayError> {
        info!("[Download] Checking/Downloading {} to {}...", repo_id, cache_dir.display());

        let mut cmd = Command::new(&self.program);
        cmd.arg("download").arg(repo_id).arg("--cache-dir").arg(cache_dir);
        for pattern in IGNORE_PATTERNS {
            cmd.arg("--exclude").arg(pattern);
        }

        let output = cmd
            .output().await
            .map_err(|e| {
                RelayError::initialization(format!("Failed to run {}: {}", self.program, e))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(
                RelayError::initialization(
                    format!("Error downloading {}: {}", repo_id, stderr.trim())
                )
            );
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let path = stdout
            .lines()
            .rev()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(PathBuf::from)
            .filter(|p| p.is_dir())
            .ok_or_else(|| {
                RelayError::initialization(
                    format!("{} did not report a snapshot path for {}", self.program, repo_id)
                )
            })?;

        info!("[Ready] Model available at: {}", path.display());
        Ok(path)
    }
}

/// Offline lookup in the Hugging Face cache layout:
/// `models--{org}--{name}/snapshots/{revision}` with the revision taken from
/// `refs/main`.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheResolver;

#[async_trait]
impl ModelResolver for CacheResolver {
    async fn resolve(&self, repo_id: &str, cache_dir: &Path) -> Result<PathBuf, RelayError> {
        let repo_dir = cache_dir.join(format!("models--{}", repo_id.replace('/', "--")));
        let snapshots = repo_dir.join("snapshots");

        let revision = fs::read_to_string(repo_dir.join("refs").join("main"))
            .ok()
            .map(|r| r.trim().to_string())
            .filter(|r| !r.is_empty());

        let path = match revision {
            Some(rev) => Some(snapshots.join(rev)),
            None => first_subdir(&snapshots),
        };

        match path {
            Some(p) if p.is_dir() => {
                info!("[Ready] Model available at: {}", p.display());
                Ok(p)
            }
            _ =>
                Err(
                    RelayError::initialization(
                        format!("{} is not in the model cache at {}", repo_id, cache_dir.display())
                    )
                ),
        }
    }
}

fn first_subdir(dir: &Path) -> Option<PathBuf> {
    let mut dirs: Vec<PathBuf> = fs::read_dir(dir)
        .ok()?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|p| p.is_dir())
        .collect();
    dirs.sort();
    dirs.into_iter().next()
}

/// Resolves every listed model and returns the path of the first one (the
/// primary model). With an empty list the first directory under
/// `model_dir` is used.
pub async fn prepare_models(
    resolver: &dyn ModelResolver,
    models: &[String],
    model_dir: &Path
) -> Result<PathBuf, RelayError> {
    fs::create_dir_all(model_dir).map_err(|e| {
        RelayError::initialization(format!("Cannot create {}: {}", model_dir.display(), e))
    })?;

    info!("--- Resolving {} models ---", models.len());
    let mut primary = None;
    for repo_id in models {
        let local = Path::new(repo_id);
        let path = if local.is_absolute() && local.is_dir() {
            local.to_path_buf()
        } else {
            resolver.resolve(repo_id, model_dir).await?
        };
        if primary.is_none() {
            primary = Some(path);
        }
    }

    match primary {
        Some(path) => Ok(path),
        None => {
            warn!("MODELS is empty, looking for a model directory in {}", model_dir.display());
            first_subdir(model_dir).ok_or_else(|| {
                RelayError::initialization(
                    format!("No model found in MODELS env var or {} directory", model_dir.display())
                )
            })
        }
    }
}

/// First `*.gguf` file of a snapshot, for engines that load a single file.
pub fn find_gguf(model_path: &Path) -> Option<PathBuf> {
    if model_path.is_file() {
        return Some(model_path.to_path_buf());
    }
    let mut files: Vec<PathBuf> = fs::read_dir(model_path)
        .ok()?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|p| p.extension().map(|ext| ext.eq_ignore_ascii_case("gguf")).unwrap_or(false))
        .collect();
    files.sort();
    files.into_iter().next()
}
