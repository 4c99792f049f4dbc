//! Inbound media downloads: voice clips to temp files, images inline.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use {
    base64::{Engine, engine::general_purpose::STANDARD},
    napgate_channels::host::InboundImage,
    tracing::{info, warn},
};

use crate::error::{Error, Result};

pub const MAX_AUDIO_DOWNLOADS: usize = 3;
pub const MAX_IMAGE_DOWNLOADS: usize = 5;
pub const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(30);

const AUDIO_DIR_NAME: &str = "napgate-napcatqq-audio";

/// A voice clip saved for the agent host's transcription step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedAudio {
    pub path: PathBuf,
    pub mime_type: String,
}

#[derive(Debug, Clone)]
pub struct MediaFetcher {
    http: reqwest::Client,
    audio_dir: PathBuf,
}

impl Default for MediaFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl MediaFetcher {
    pub fn new() -> Self {
        Self::with_audio_dir(std::env::temp_dir().join(AUDIO_DIR_NAME))
    }

    pub fn with_audio_dir(audio_dir: impl Into<PathBuf>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(DOWNLOAD_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            http,
            audio_dir: audio_dir.into(),
        }
    }

    pub fn audio_dir(&self) -> &Path {
        &self.audio_dir
    }

    async fn fetch(&self, url: &str) -> Result<(Vec<u8>, Option<String>)> {
        let response = self.http.get(url).send().await?;
        if !response.status().is_success() {
            return Err(Error::message(format!(
                "download failed: HTTP {}",
                response.status()
            )));
        }
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        Ok((response.bytes().await?.to_vec(), content_type))
    }

    /// Save up to three voice clips. Failed items are logged and skipped.
    pub async fn download_audio(&self, urls: &[String]) -> Vec<DownloadedAudio> {
        let mut saved = Vec::new();
        if urls.is_empty() {
            return saved;
        }
        if let Err(e) = tokio::fs::create_dir_all(&self.audio_dir).await {
            warn!(dir = %self.audio_dir.display(), error = %e, "failed to create audio dir");
            return saved;
        }
        for url in urls.iter().take(MAX_AUDIO_DOWNLOADS) {
            match self.save_audio(url).await {
                Ok(audio) => {
                    info!(path = %audio.path.display(), "audio downloaded");
                    saved.push(audio);
                },
                Err(e) => warn!(url, error = %e, "failed to download audio"),
            }
        }
        saved
    }

    async fn save_audio(&self, url: &str) -> Result<DownloadedAudio> {
        let (bytes, content_type) = self.fetch(url).await?;
        let content_type = content_type.unwrap_or_default();
        let ext = if content_type.contains("silk") {
            "silk"
        } else {
            "amr"
        };
        let (_, path) = tempfile::Builder::new()
            .prefix("napcat-")
            .suffix(&format!(".{ext}"))
            .tempfile_in(&self.audio_dir)?
            .keep()
            .map_err(|e| e.error)?;
        tokio::fs::write(&path, &bytes).await?;
        Ok(DownloadedAudio {
            path,
            mime_type: mime_essence(&content_type).unwrap_or_else(|| "audio/amr".into()),
        })
    }

    /// Fetch up to five images as base64. Failed items are logged and skipped.
    pub async fn download_images(&self, urls: &[String]) -> Vec<InboundImage> {
        let mut images = Vec::new();
        for url in urls.iter().take(MAX_IMAGE_DOWNLOADS) {
            match self.fetch(url).await {
                Ok((bytes, content_type)) => images.push(InboundImage {
                    data: STANDARD.encode(&bytes),
                    mime_type: content_type
                        .as_deref()
                        .and_then(mime_essence)
                        .unwrap_or_else(|| "image/png".into()),
                }),
                Err(e) => warn!(url, error = %e, "failed to download inbound image"),
            }
        }
        images
    }
}

/// `type/subtype` without parameters; `None` when blank.
fn mime_essence(content_type: &str) -> Option<String> {
    let essence = content_type.split(';').next().unwrap_or_default().trim();
    (!essence.is_empty()).then(|| essence.to_string())
}

/// Delete downloaded clips once the turn is over.
pub async fn remove_audio(files: &[DownloadedAudio]) {
    for file in files {
        if let Err(e) = tokio::fs::remove_file(&file.path).await {
            warn!(path = %file.path.display(), error = %e, "failed to remove audio file");
        }
    }
}
