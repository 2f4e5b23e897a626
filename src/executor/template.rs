//! Per-process template cache.
//!
//! Templates are keyed by id and freshness-checked against the Web backend's
//! `updated_at` before every use: an up-to-date cache entry short-circuits
//! the download entirely, a stale one is purged and refetched. Each template
//! id has its own async lock so concurrent judgments on one executor do not
//! race the same unpack; distinct processes may still refresh independently,
//! which is acceptable at the observed refresh rate.

use crate::client::model::TemplateMeta;
use crate::client::{ApiClient, ApiError};
use crate::config::CONFIG;
use crate::executor::workdir;
use chrono::NaiveDateTime;
use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("template cache io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Unpack(#[from] workdir::WorkdirError),
    #[error("cannot parse template timestamp {0:?}")]
    BadTimestamp(String),
    #[error("a template archive must contain exactly one directory, found {0:?}")]
    AmbiguousLayout(Vec<String>),
    #[error("blocking unpack task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// An unpacked template ready to copy into a working directory.
#[derive(Debug, Clone)]
pub struct Template {
    pub path: PathBuf,
    pub dir_name: String,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    updated_at: NaiveDateTime,
    template: Template,
}

pub struct TemplateManager {
    api: Arc<ApiClient>,
    cache_dir: PathBuf,
    cache: DashMap<i64, CacheEntry>,
    locks: DashMap<i64, Arc<Mutex<()>>>,
}

impl TemplateManager {
    pub fn new(api: Arc<ApiClient>) -> TemplateManager {
        TemplateManager {
            api,
            cache_dir: CONFIG.template_cache_dir(),
            cache: DashMap::new(),
            locks: DashMap::new(),
        }
    }

    /// Resolve a template, downloading only when the cached copy is older
    /// than the backend's `updated_at`.
    pub async fn get_template(&self, template_id: i64) -> Result<Template, TemplateError> {
        let meta: TemplateMeta = self
            .api
            .get(&format!("/api/templates/{}", template_id))
            .await?;
        let remote_updated_at = parse_updated_at(&meta.updated_at)?;

        let lock = self.obtain_lock(template_id);
        let _guard = lock.lock().await;

        if let Some(entry) = self.cache.get(&template_id) {
            if entry.updated_at >= remote_updated_at {
                return Ok(entry.template.clone());
            }
        }
        self.download(template_id, remote_updated_at).await
    }

    /// Drop everything, on disk and in memory.
    pub fn clear_cache(&self) -> Result<(), TemplateError> {
        if self.cache_dir.exists() {
            std::fs::remove_dir_all(&self.cache_dir)?;
        }
        std::fs::create_dir_all(&self.cache_dir)?;
        self.cache.clear();
        Ok(())
    }

    fn obtain_lock(&self, template_id: i64) -> Arc<Mutex<()>> {
        self.locks
            .entry(template_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn download(
        &self,
        template_id: i64,
        updated_at: NaiveDateTime,
    ) -> Result<Template, TemplateError> {
        let template_dir = self.cache_dir.join(template_id.to_string());
        if template_dir.exists() {
            tokio::fs::remove_dir_all(&template_dir).await?;
        }
        tokio::fs::create_dir_all(&template_dir).await?;

        let zip_path = template_dir.join("template.zip");
        self.api
            .download(&format!("/api/templates/{}/download", template_id), &zip_path)
            .await?;
        log::info!("template {} downloaded to {}", template_id, zip_path.display());

        {
            let zip_path = zip_path.clone();
            let template_dir = template_dir.clone();
            tokio::task::spawn_blocking(move || workdir::unpack_zip(&zip_path, &template_dir))
                .await??;
        }
        tokio::fs::remove_file(&zip_path).await?;

        let template = single_top_level_dir(&template_dir)?;
        self.cache.insert(
            template_id,
            CacheEntry { updated_at, template: template.clone() },
        );
        Ok(template)
    }
}

/// Template archives carry their project as one top-level directory; anything
/// else is a packaging mistake worth a loud error.
fn single_top_level_dir(dir: &std::path::Path) -> Result<Template, TemplateError> {
    let mut contents = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        contents.push(entry?.path());
    }
    match contents.as_slice() {
        [only] if only.is_dir() => {
            let dir_name = only
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            Ok(Template { path: only.clone(), dir_name })
        }
        _ => Err(TemplateError::AmbiguousLayout(
            contents
                .iter()
                .map(|p| p.display().to_string())
                .collect(),
        )),
    }
}

/// `updated_at` is ISO-8601; offset-aware timestamps are normalized to UTC,
/// naive ones taken as-is.
fn parse_updated_at(raw: &str) -> Result<NaiveDateTime, TemplateError> {
    if let Ok(aware) = chrono::DateTime::parse_from_rfc3339(raw) {
        return Ok(aware.naive_utc());
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map_err(|_| TemplateError::BadTimestamp(raw.to_owned()))
}
