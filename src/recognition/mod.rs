//! Recognition Layer
//!
//! Owns the heavyweight text recognizer. The recognizer is built on first use, shared by
//! every request behind a single lock, and dropped again once it has been idle for the
//! configured timeout so the worker gives its memory back between bursts of requests.

pub mod models;
pub mod ocrs_backend;

use std::time::{Duration, Instant};

use image::RgbImage;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info};

use crate::protocol::OcrLine;

pub use models::ModelManager;
pub use ocrs_backend::OcrsFactory;

/// Default idle period before the recognizer is released
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Raw detection reported by a recognizer
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub text: String,
    /// 0.0 - 1.0
    pub confidence: f64,
    /// Corner points, possibly rotated
    pub quad: [(f32, f32); 4],
}

/// A loaded text recognition engine
pub trait TextRecognizer: Send {
    /// Detect and read all text lines in a three-channel image
    fn recognize(&self, image: &RgbImage) -> anyhow::Result<Vec<Detection>>;
}

/// Builds recognizer instances on demand
pub trait RecognizerFactory: Send + Sync {
    fn create(&self) -> anyhow::Result<Box<dyn TextRecognizer>>;
}

impl<F> RecognizerFactory for F
where
    F: Fn() -> anyhow::Result<Box<dyn TextRecognizer>> + Send + Sync,
{
    fn create(&self) -> anyhow::Result<Box<dyn TextRecognizer>> {
        self()
    }
}

/// Recognition failures, reported back on the request that triggered them
#[derive(Debug, Error)]
pub enum RecognitionError {
    #[error("failed to load recognizer: {0:#}")]
    Load(anyhow::Error),

    #[error("recognition failed: {0:#}")]
    Recognize(anyhow::Error),
}

enum EngineState {
    Unloaded,
    Loaded {
        engine: Box<dyn TextRecognizer>,
        last_used: Instant,
    },
}

/// Lazily loaded, idle-released recognizer
pub struct RecognitionManager {
    factory: Box<dyn RecognizerFactory>,
    idle_timeout: Duration,
    state: Mutex<EngineState>,
}

impl RecognitionManager {
    /// Create a manager with the default idle timeout. Nothing is loaded yet.
    #[cfg(test)]
    pub fn new(factory: Box<dyn RecognizerFactory>) -> Self {
        Self::with_idle_timeout(factory, DEFAULT_IDLE_TIMEOUT)
    }

    pub fn with_idle_timeout(factory: Box<dyn RecognizerFactory>, idle_timeout: Duration) -> Self {
        Self {
            factory,
            idle_timeout,
            state: Mutex::new(EngineState::Unloaded),
        }
    }

    #[cfg(test)]
    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// Whether a recognizer instance currently exists
    #[cfg(test)]
    pub fn is_loaded(&self) -> bool {
        matches!(*self.state.lock(), EngineState::Loaded { .. })
    }

    /// Load the recognizer if needed and mark it as used now
    #[cfg(test)]
    pub fn ensure_ready(&self) -> Result<(), RecognitionError> {
        let mut state = self.state.lock();
        Self::ensure_loaded(&mut state, self.factory.as_ref())?;
        Ok(())
    }

    /// Release the recognizer if it has been idle for at least the timeout
    pub fn check_idle(&self) {
        self.check_idle_at(Instant::now());
    }

    /// Idle check against an explicit clock reading
    pub fn check_idle_at(&self, now: Instant) {
        let mut state = self.state.lock();
        if let EngineState::Loaded { last_used, .. } = &*state {
            let idle = now.saturating_duration_since(*last_used);
            if idle >= self.idle_timeout {
                info!("Unloading recognizer after {:.0}s idle", idle.as_secs_f64());
                *state = EngineState::Unloaded;
            }
        }
    }

    /// Run recognition, converting every detection to an axis-aligned line result.
    ///
    /// Lines are returned in the order the recognizer produced them.
    pub fn recognize(&self, image: &RgbImage) -> Result<Vec<OcrLine>, RecognitionError> {
        let mut state = self.state.lock();
        let engine = Self::ensure_loaded(&mut state, self.factory.as_ref())?;

        let detections = engine
            .recognize(image)
            .map_err(RecognitionError::Recognize)?;
        debug!("recognizer returned {} detections", detections.len());

        Ok(detections.iter().map(line_from_detection).collect())
    }

    fn ensure_loaded<'a>(
        state: &'a mut EngineState,
        factory: &dyn RecognizerFactory,
    ) -> Result<&'a dyn TextRecognizer, RecognitionError> {
        if let EngineState::Unloaded = state {
            info!("Loading recognizer...");
            let started = Instant::now();
            let engine = factory.create().map_err(RecognitionError::Load)?;
            info!(
                "Recognizer loaded in {:.2}s",
                started.elapsed().as_secs_f64()
            );
            *state = EngineState::Loaded {
                engine,
                last_used: Instant::now(),
            };
        }

        match state {
            EngineState::Loaded { engine, last_used } => {
                *last_used = Instant::now();
                Ok(&**engine)
            }
            EngineState::Unloaded => Err(RecognitionError::Load(anyhow::anyhow!(
                "recognizer unavailable"
            ))),
        }
    }
}

/// Axis-aligned bounds and vertical centre of a detection quad
pub fn line_from_detection(detection: &Detection) -> OcrLine {
    let xs = detection.quad.map(|(x, _)| x as i32);
    let ys = detection.quad.map(|(_, y)| y as i32);

    let min_x = xs.iter().copied().min().unwrap_or(0);
    let max_x = xs.iter().copied().max().unwrap_or(0);
    let min_y = ys.iter().copied().min().unwrap_or(0);
    let max_y = ys.iter().copied().max().unwrap_or(0);

    OcrLine {
        text: detection.text.clone(),
        confidence: detection.confidence,
        bbox: [min_x, min_y, max_x - min_x, max_y - min_y],
        y_center: (min_y + max_y).div_euclid(2),
    }
}
