//! Pure-Rust recognizer backed by the ocrs engine

use anyhow::{Context, Result};
use image::RgbImage;
use ocrs::{ImageSource, OcrEngine, OcrEngineParams};
use rten::Model;
use rten_imageproc::BoundingRect;
use tracing::{debug, info};

use super::models::{ModelManager, ModelType};
use super::{Detection, RecognizerFactory, TextRecognizer};

/// ocrs engine with its detection and recognition models loaded
pub struct OcrsRecognizer {
    engine: OcrEngine,
}

impl OcrsRecognizer {
    /// Load both models from the manager's cache, downloading them if allowed
    pub fn load(models: &ModelManager) -> Result<Self> {
        models.ensure_all_models()?;
        let detection_path = models.model_path(ModelType::Detection);
        let recognition_path = models.model_path(ModelType::Recognition);

        debug!("Loading models from {:?}", models.models_dir());
        let detection_model = Model::load_file(&detection_path)
            .context("Failed to load text detection model")?;
        let recognition_model = Model::load_file(&recognition_path)
            .context("Failed to load text recognition model")?;

        let engine = OcrEngine::new(OcrEngineParams {
            detection_model: Some(detection_model),
            recognition_model: Some(recognition_model),
            ..Default::default()
        })
        .context("Failed to create OCR engine")?;

        info!("ocrs engine ready");
        Ok(Self { engine })
    }
}

impl TextRecognizer for OcrsRecognizer {
    fn recognize(&self, image: &RgbImage) -> Result<Vec<Detection>> {
        let source = ImageSource::from_bytes(image.as_raw(), image.dimensions())
            .context("Failed to create image source")?;
        let input = self
            .engine
            .prepare_input(source)
            .context("Failed to prepare OCR input")?;

        let word_rects = self
            .engine
            .detect_words(&input)
            .context("Failed to detect words")?;
        let line_rects = self.engine.find_text_lines(&input, &word_rects);
        let line_texts = self
            .engine
            .recognize_text(&input, &line_rects)
            .context("Failed to recognize text")?;

        let mut detections = Vec::new();
        for (words, line) in line_rects.iter().zip(line_texts.iter()) {
            let Some(line) = line else { continue };
            let text = line.to_string();
            if text.trim().is_empty() {
                continue;
            }

            let Some(first) = words.first() else { continue };
            let bounds = words
                .iter()
                .skip(1)
                .fold(first.bounding_rect(), |acc, w| acc.union(w.bounding_rect()));

            let (left, top) = (bounds.left(), bounds.top());
            let (right, bottom) = (bounds.right(), bounds.bottom());
            detections.push(Detection {
                text,
                // ocrs does not report per-line confidence
                confidence: 1.0,
                quad: [(left, top), (right, top), (right, bottom), (left, bottom)],
            });
        }

        Ok(detections)
    }
}

/// Builds [`OcrsRecognizer`] instances from a model cache
pub struct OcrsFactory {
    models: ModelManager,
}

impl OcrsFactory {
    pub fn new(models: ModelManager) -> Self {
        Self { models }
    }
}

impl RecognizerFactory for OcrsFactory {
    fn create(&self) -> Result<Box<dyn TextRecognizer>> {
        Ok(Box::new(OcrsRecognizer::load(&self.models)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_factory_reports_missing_models_offline() {
        let dir = tempdir().unwrap();
        let models = ModelManager::with_dir(dir.path().to_path_buf())
            .unwrap()
            .with_auto_download(false);
        let factory = OcrsFactory::new(models);

        let err = factory.create().err().unwrap();
        assert!(format!("{:#}", err).contains("Offline mode"));
    }
}
