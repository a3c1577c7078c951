//! Получение артефактов: HTTP(S) через reqwest, локальные файлы через tokio::fs.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;

use crate::error::{Result, RuntimeError};

/// Источник байтов артефакта по адресу.
#[async_trait]
pub trait ArtifactFetcher: Send + Sync {
    async fn fetch(&self, location: &str) -> Result<Vec<u8>>;
}

/// Адрес шарда относительно `model.json` (как `weightPathPrefix` по умолчанию).
pub fn resolve_relative(base: &str, path: &str) -> String {
    if is_remote(path) || path.starts_with("file://") {
        return path.to_string();
    }
    match base.rfind('/') {
        Some(idx) => format!("{}{}", &base[..=idx], path),
        None => path.to_string(),
    }
}

pub fn is_remote(location: &str) -> bool {
    location.starts_with("http://") || location.starts_with("https://")
}

/// Сколько максимум резервировать под тело заранее; `Content-Length` приходит от сервера.
const MAX_PREALLOC: u64 = 64 * 1024 * 1024;

/// Загрузка по HTTP со стримингом тела.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RuntimeError::Fetch(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ArtifactFetcher for HttpFetcher {
    async fn fetch(&self, location: &str) -> Result<Vec<u8>> {
        let response = self
            .client
            .get(location)
            .send()
            .await
            .map_err(|e| RuntimeError::Fetch(format!("{location}: {e}")))?;

        if !response.status().is_success() {
            return Err(RuntimeError::HttpStatus {
                status: response.status().as_u16(),
                url: location.to_string(),
            });
        }

        let total = response.content_length();
        let mut body = Vec::with_capacity(total.map_or(0, |t| t.min(MAX_PREALLOC)) as usize);
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| RuntimeError::Fetch(format!("{location}: {e}")))?;
            body.extend_from_slice(&chunk);
            tracing::debug!(url = %location, bytes_done = body.len(), bytes_total = ?total, "download progress");
        }
        Ok(body)
    }
}

/// Локальные файлы. Пути от корня сайта (`/web_model/model.json`) и относительные
/// разрешаются от `root`; `file://` — абсолютный путь как есть.
pub struct FsFetcher {
    root: PathBuf,
}

impl FsFetcher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn resolve(&self, location: &str) -> PathBuf {
        if let Some(path) = location.strip_prefix("file://") {
            return PathBuf::from(path);
        }
        self.root.join(location.trim_start_matches('/'))
    }
}

#[async_trait]
impl ArtifactFetcher for FsFetcher {
    async fn fetch(&self, location: &str) -> Result<Vec<u8>> {
        let path = self.resolve(location);
        tracing::debug!(path = %path.display(), "reading artifact");
        tokio::fs::read(&path)
            .await
            .map_err(|e| RuntimeError::Fetch(format!("{}: {}", path.display(), e)))
    }
}

/// Выбор загрузчика по схеме адреса.
pub struct SourceFetcher {
    http: HttpFetcher,
    fs: FsFetcher,
}

impl SourceFetcher {
    pub fn new(asset_root: impl Into<PathBuf>, http_timeout: Duration) -> Result<Self> {
        Ok(Self {
            http: HttpFetcher::new(http_timeout)?,
            fs: FsFetcher::new(asset_root),
        })
    }
}

#[async_trait]
impl ArtifactFetcher for SourceFetcher {
    async fn fetch(&self, location: &str) -> Result<Vec<u8>> {
        if is_remote(location) {
            self.http.fetch(location).await
        } else {
            self.fs.fetch(location).await
        }
    }
}
