//! Model management for the ocrs recognizer
//!
//! Handles downloading, caching, and verifying the detection and recognition models.

use anyhow::{Context, Result};
use futures_util::StreamExt;
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::runtime::Runtime;
use tracing::{debug, info};

/// Environment variable that forbids network downloads
pub const OFFLINE_ENV: &str = "OCR_WORKER_OFFLINE";

/// Model files needed by the recognizer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelType {
    /// Text detection model
    Detection,
    /// Text line recognition model
    Recognition,
}

impl ModelType {
    pub const ALL: [ModelType; 2] = [ModelType::Detection, ModelType::Recognition];

    /// Get the filename for this model type
    pub fn filename(&self) -> &'static str {
        match self {
            ModelType::Detection => "text-detection.rten",
            ModelType::Recognition => "text-recognition.rten",
        }
    }

    /// Get the download URL for this model
    pub fn download_url(&self) -> &'static str {
        match self {
            ModelType::Detection => {
                "https://huggingface.co/robertknight/ocrs/resolve/main/text-detection-ssfbcj81.rten"
            }
            ModelType::Recognition => {
                "https://huggingface.co/robertknight/ocrs/resolve/main/text-rec-checkpoint-s52qdbqt.rten"
            }
        }
    }

    /// Plausible file size range in bytes
    pub fn expected_size_range(&self) -> (u64, u64) {
        match self {
            ModelType::Detection => (1_000_000, 8_000_000),     // ~2.5 MB
            ModelType::Recognition => (4_000_000, 25_000_000),  // ~10 MB
        }
    }

    /// Expected SHA256 checksum, when pinned
    pub fn expected_sha256(&self) -> Option<&'static str> {
        match self {
            ModelType::Detection => None,
            ModelType::Recognition => None,
        }
    }

    /// Display name for log output
    pub fn display_name(&self) -> &'static str {
        match self {
            ModelType::Detection => "Text Detection",
            ModelType::Recognition => "Text Recognition",
        }
    }
}

/// Model manifest tracking downloaded models
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ModelManifest {
    pub version: String,
    pub models: Vec<ModelInfo>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ModelInfo {
    pub model_type: String,
    pub filename: String,
    pub size_bytes: u64,
    pub sha256: Option<String>,
    /// Unix seconds
    pub downloaded_at: u64,
}

impl Default for ModelManifest {
    fn default() -> Self {
        Self {
            version: "1.0.0".to_string(),
            models: Vec::new(),
        }
    }
}

/// Downloads and caches the recognizer models
pub struct ModelManager {
    models_dir: PathBuf,
    auto_download: bool,
}

impl ModelManager {
    /// Manager rooted at the default data directory
    pub fn new() -> Result<Self> {
        let models_dir = crate::storage::get_data_dir()?.join("models");
        Self::with_dir(models_dir)
    }

    /// Manager with a custom directory
    pub fn with_dir(models_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&models_dir)
            .with_context(|| format!("Failed to create models directory {:?}", models_dir))?;
        Ok(Self {
            models_dir,
            auto_download: true,
        })
    }

    /// Allow or forbid fetching missing models
    pub fn with_auto_download(mut self, auto_download: bool) -> Self {
        self.auto_download = auto_download;
        self
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    /// Get the path to a specific model file
    pub fn model_path(&self, model_type: ModelType) -> PathBuf {
        self.models_dir.join(model_type.filename())
    }

    /// Whether a model file exists with a plausible size
    pub fn is_model_available(&self, model_type: ModelType) -> bool {
        match std::fs::metadata(self.model_path(model_type)) {
            Ok(metadata) => {
                let (min, max) = model_type.expected_size_range();
                (min..=max).contains(&metadata.len())
            }
            Err(_) => false,
        }
    }

    pub fn are_models_ready(&self) -> bool {
        ModelType::ALL.iter().all(|&m| self.is_model_available(m))
    }

    /// Return the model path, downloading it first if needed
    pub fn ensure_model(&self, model_type: ModelType) -> Result<PathBuf> {
        let path = self.model_path(model_type);

        if self.is_model_available(model_type) {
            debug!("Model {:?} already available at {:?}", model_type, path);
            return Ok(path);
        }

        self.download_model(model_type)?;
        Ok(path)
    }

    /// Make sure every model is present
    pub fn ensure_all_models(&self) -> Result<()> {
        for model_type in ModelType::ALL {
            self.ensure_model(model_type)?;
        }
        Ok(())
    }

    fn offline(&self) -> bool {
        !self.auto_download || std::env::var_os(OFFLINE_ENV).is_some()
    }

    /// Download a specific model (blocking)
    fn download_model(&self, model_type: ModelType) -> Result<()> {
        let url = model_type.download_url();
        let path = self.model_path(model_type);

        if self.offline() {
            anyhow::bail!(
                "Offline mode: cannot download {} model. Download it from {} and place it at {:?}",
                model_type.display_name(),
                url,
                path
            );
        }

        info!("Downloading {} model from {}", model_type.display_name(), url);

        let rt = Runtime::new().context("Failed to create tokio runtime")?;
        rt.block_on(self.download_file_async(url, &path, model_type))?;

        if !self.is_model_available(model_type) {
            anyhow::bail!(
                "Downloaded {} model has an unexpected size",
                model_type.display_name()
            );
        }

        self.update_manifest_for_model(model_type)?;

        info!("Successfully downloaded {} model", model_type.display_name());
        Ok(())
    }

    async fn download_file_async(
        &self,
        url: &str,
        path: &Path,
        model_type: ModelType,
    ) -> Result<()> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(300))
            .build()
            .context("Failed to create HTTP client")?;

        let response = client
            .get(url)
            .send()
            .await
            .context("Failed to send download request")?;

        if !response.status().is_success() {
            anyhow::bail!("Download failed with status {}: {}", response.status(), url);
        }

        debug!("Download size: {:?} bytes", response.content_length());

        let temp_path = path.with_extension("tmp");
        let mut file = std::fs::File::create(&temp_path).context("Failed to create temp file")?;

        let mut hasher = Sha256::new();
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.context("Error reading download stream")?;
            file.write_all(&chunk).context("Failed to write to temp file")?;
            hasher.update(&chunk);
        }

        file.flush().context("Failed to flush temp file")?;
        drop(file);

        let hash = format!("{:x}", hasher.finalize());
        if let Some(expected_hash) = model_type.expected_sha256() {
            if hash != expected_hash {
                std::fs::remove_file(&temp_path).ok();
                anyhow::bail!(
                    "Checksum mismatch for {}: expected {}, got {}",
                    model_type.filename(),
                    expected_hash,
                    hash
                );
            }
            info!("Checksum verified for {}", model_type.display_name());
        }

        std::fs::rename(&temp_path, path)
            .context("Failed to move downloaded file to final location")?;

        Ok(())
    }

    /// Record a freshly downloaded model in the manifest
    fn update_manifest_for_model(&self, model_type: ModelType) -> Result<()> {
        let mut manifest = self.load_manifest().unwrap_or_default();

        let path = self.model_path(model_type);
        let data = std::fs::read(&path)?;
        let hash = format!("{:x}", Sha256::digest(&data));

        let model_info = ModelInfo {
            model_type: format!("{:?}", model_type),
            filename: model_type.filename().to_string(),
            size_bytes: data.len() as u64,
            sha256: Some(hash),
            downloaded_at: unix_timestamp(),
        };

        if let Some(existing) = manifest
            .models
            .iter_mut()
            .find(|m| m.filename == model_info.filename)
        {
            *existing = model_info;
        } else {
            manifest.models.push(model_info);
        }

        self.save_manifest(&manifest)
    }

    pub fn load_manifest(&self) -> Result<ModelManifest> {
        let manifest_path = self.models_dir.join("manifest.json");
        if manifest_path.exists() {
            let content = std::fs::read_to_string(&manifest_path)?;
            Ok(serde_json::from_str(&content)?)
        } else {
            Ok(ModelManifest::default())
        }
    }

    pub fn save_manifest(&self, manifest: &ModelManifest) -> Result<()> {
        let manifest_path = self.models_dir.join("manifest.json");
        let content = serde_json::to_string_pretty(manifest)?;
        std::fs::write(manifest_path, content)?;
        Ok(())
    }
}

fn unix_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write_sized(path: &Path, len: u64) {
        let file = std::fs::File::create(path).unwrap();
        file.set_len(len).unwrap();
    }

    #[test]
    fn test_model_type_filenames() {
        assert_eq!(ModelType::Detection.filename(), "text-detection.rten");
        assert_eq!(ModelType::Recognition.filename(), "text-recognition.rten");
    }

    #[test]
    fn test_with_dir_creates_directory() {
        let dir = tempdir().unwrap();
        let models_dir = dir.path().join("nested").join("models");
        let manager = ModelManager::with_dir(models_dir.clone()).unwrap();
        assert!(models_dir.is_dir());
        assert_eq!(
            manager.model_path(ModelType::Detection),
            models_dir.join("text-detection.rten")
        );
    }

    #[test]
    fn test_availability_checks_size() {
        let dir = tempdir().unwrap();
        let manager = ModelManager::with_dir(dir.path().to_path_buf()).unwrap();
        assert!(!manager.is_model_available(ModelType::Detection));

        write_sized(&manager.model_path(ModelType::Detection), 10);
        assert!(!manager.is_model_available(ModelType::Detection));

        write_sized(&manager.model_path(ModelType::Detection), 2_500_000);
        assert!(manager.is_model_available(ModelType::Detection));
        assert!(!manager.are_models_ready());

        write_sized(&manager.model_path(ModelType::Recognition), 10_000_000);
        assert!(manager.are_models_ready());
    }

    #[test]
    fn test_ensure_model_uses_cached_file() {
        let dir = tempdir().unwrap();
        let manager = ModelManager::with_dir(dir.path().to_path_buf())
            .unwrap()
            .with_auto_download(false);
        let path = manager.model_path(ModelType::Detection);
        write_sized(&path, 2_500_000);
        assert_eq!(manager.ensure_model(ModelType::Detection).unwrap(), path);
    }

    #[test]
    fn test_offline_missing_model_fails() {
        let dir = tempdir().unwrap();
        let manager = ModelManager::with_dir(dir.path().to_path_buf())
            .unwrap()
            .with_auto_download(false);
        let err = manager.ensure_model(ModelType::Recognition).unwrap_err();
        assert!(err.to_string().contains("Offline mode"));
    }

    #[test]
    fn test_manifest_round_trip() {
        let dir = tempdir().unwrap();
        let manager = ModelManager::with_dir(dir.path().to_path_buf()).unwrap();
        assert!(manager.load_manifest().unwrap().models.is_empty());

        let manifest = ModelManifest {
            version: "1.0.0".into(),
            models: vec![ModelInfo {
                model_type: "Detection".into(),
                filename: "text-detection.rten".into(),
                size_bytes: 42,
                sha256: None,
                downloaded_at: 1,
            }],
        };
        manager.save_manifest(&manifest).unwrap();

        let loaded = manager.load_manifest().unwrap();
        assert_eq!(loaded.models.len(), 1);
        assert_eq!(loaded.models[0].size_bytes, 42);
    }
}
