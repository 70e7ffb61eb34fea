//! Worker Service
//!
//! The request dispatcher and the sequential read/dispatch/write loop over the framed
//! channel. One frame is fully processed and answered before the next one is read.

pub mod supervisor;

use parking_lot::Mutex;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::protocol::{
    decode_request, encode_response, write_frame, FrameError, FrameReader, OcrLine, OcrRequest,
    Request, Response, MAX_FRAME_BYTES,
};
use crate::recognition::{RecognitionError, RecognitionManager};
use crate::vision::{self, VisionError};

pub use supervisor::IdleSupervisor;

/// Failure of a single `ocr` request
#[derive(Debug, Error)]
pub enum OcrError {
    #[error(transparent)]
    Vision(#[from] VisionError),

    #[error(transparent)]
    Recognition(#[from] RecognitionError),
}

/// Faults that end the service loop
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("undecodable request: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("failed to encode response: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("channel write failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Why the loop ended without a fault
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// The peer closed the input stream
    StreamClosed,
    /// A `shutdown` request or signal set the stop flag
    ShutdownRequested,
}

/// Maps requests to responses
pub struct Dispatcher {
    recognizer: Arc<RecognitionManager>,
    stop: Arc<AtomicBool>,
}

impl Dispatcher {
    pub fn new(recognizer: Arc<RecognitionManager>, stop: Arc<AtomicBool>) -> Self {
        Self { recognizer, stop }
    }

    /// Whether a shutdown has been requested
    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Handle one request. Request-local failures become `error` responses.
    pub fn dispatch(&self, request: Request) -> Response {
        match request {
            Request::Ping => Response::Pong,
            Request::Shutdown => {
                info!("Shutdown requested by peer");
                self.stop.store(true, Ordering::SeqCst);
                Response::Ack
            }
            Request::Ocr(ocr) => match self.run_ocr(&ocr) {
                Ok((lines, elapsed_ms)) => {
                    debug!(
                        "request {}: {} lines in {:.1}ms",
                        ocr.request_id,
                        lines.len(),
                        elapsed_ms
                    );
                    Response::OcrResult {
                        request_id: ocr.request_id,
                        lines,
                        elapsed_ms,
                    }
                }
                Err(e) => {
                    warn!("request {} failed: {}", ocr.request_id, e);
                    Response::Error {
                        request_id: Some(ocr.request_id),
                        message: e.to_string(),
                    }
                }
            },
            Request::Unknown(kind) => {
                warn!("Unknown request type: {:?}", kind);
                Response::Error {
                    request_id: None,
                    message: format!("unknown type: {}", kind),
                }
            }
        }
    }

    fn run_ocr(&self, request: &OcrRequest) -> Result<(Vec<OcrLine>, f64), OcrError> {
        let started = Instant::now();

        let image = vision::decode(&request.image_data)?;
        let cropped = vision::crop(image, &request.roi()?)?;
        let prepared = vision::preprocess(cropped, &request.preprocess_config()?);
        let lines = self.recognizer.recognize(&prepared)?;

        Ok((lines, started.elapsed().as_secs_f64() * 1000.0))
    }
}

/// Read/dispatch/write loop over one framed channel
pub struct Service<R, W> {
    reader: FrameReader<R>,
    writer: W,
    dispatcher: Dispatcher,
    dispatch_lock: Arc<Mutex<()>>,
}

impl<R: Read, W: Write> Service<R, W> {
    #[cfg(test)]
    pub fn new(reader: R, writer: W, dispatcher: Dispatcher) -> Self {
        Self::with_max_frame_bytes(reader, writer, dispatcher, MAX_FRAME_BYTES)
    }

    pub fn with_max_frame_bytes(
        reader: R,
        writer: W,
        dispatcher: Dispatcher,
        max_frame_bytes: usize,
    ) -> Self {
        Self {
            reader: FrameReader::with_limit(reader, max_frame_bytes),
            writer,
            dispatcher,
            dispatch_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Held while a request is dispatched and answered
    pub fn dispatch_lock(&self) -> Arc<Mutex<()>> {
        self.dispatch_lock.clone()
    }

    /// Serve frames until the stream closes, a shutdown is requested or a protocol fault occurs
    pub fn run(&mut self) -> Result<ExitReason, ServiceError> {
        loop {
            if self.dispatcher.stop_requested() {
                info!("Stop flag set, leaving service loop");
                return Ok(ExitReason::ShutdownRequested);
            }

            let payload = match self.reader.read_frame() {
                Ok(Some(payload)) => payload,
                Ok(None) => {
                    info!("Input stream closed");
                    return Ok(ExitReason::StreamClosed);
                }
                Err(e) => {
                    error!("Frame error: {}", e);
                    return Err(e.into());
                }
            };

            let request = decode_request(&payload).map_err(|e| {
                error!("Failed to decode request ({} bytes): {}", payload.len(), e);
                ServiceError::Decode(e)
            })?;

            let _guard = self.dispatch_lock.lock();
            let response = self.dispatcher.dispatch(request);
            let encoded = encode_response(&response)?;
            write_frame(&mut self.writer, &encoded).map_err(|e| match e {
                FrameError::Io(io) => ServiceError::Io(io),
                other => ServiceError::Frame(other),
            })?;
        }
    }

    #[cfg(test)]
    pub fn into_writer(self) -> W {
        self.writer
    }
}
