//! Worker Messages
//!
//! MessagePack records exchanged with the host. Requests are decoded through a
//! permissive envelope so that an unrecognised `type` or a malformed ROI still reaches
//! the dispatcher instead of failing the whole channel.

pub mod wire;

use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use serde_json::Value;

use crate::vision::{PreprocessConfig, Roi, VisionError};

pub use wire::{write_frame, FrameError, FrameReader, MAX_FRAME_BYTES};

/// Raw request as it appears on the wire
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Envelope {
    /// Message discriminant (`ping`, `ocr`, `shutdown`)
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// Encoded image bytes, carried as MessagePack `bin`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_data: Option<ByteBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roi_type: Option<String>,
    /// Left untyped until the dispatcher resolves it against `roi_type`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roi_params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preprocess: Option<Value>,
}

/// ROI parameters. Which keys matter depends on `roi_type`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoiParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub w: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub h: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub points: Option<Vec<(f64, f64)>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub corners: Option<Vec<(f64, f64)>>,
}

impl RoiParams {
    /// Resolve the descriptor for a given `roi_type`
    pub fn to_roi(&self, roi_type: &str) -> Roi {
        match roi_type {
            "rect" => Roi::Rect {
                x: floor_i64(self.x.unwrap_or(0.0)),
                y: floor_i64(self.y.unwrap_or(0.0)),
                w: self.w.map(floor_i64),
                h: self.h.map(floor_i64),
            },
            "polygon" => Roi::Polygon {
                points: to_points(self.points.as_deref().unwrap_or_default()),
            },
            "perspective" => match self.corners.as_deref() {
                Some([c0, c1, c2, c3]) => Roi::Perspective {
                    corners: [*c0, *c1, *c2, *c3].map(|(x, y)| (x as f32, y as f32)),
                },
                _ => Roi::FullFrame,
            },
            _ => Roi::FullFrame,
        }
    }
}

fn floor_i64(v: f64) -> i64 {
    v.floor() as i64
}

fn to_points(points: &[(f64, f64)]) -> Vec<(i64, i64)> {
    points
        .iter()
        .map(|&(x, y)| (floor_i64(x), floor_i64(y)))
        .collect()
}

/// Interpreted request
#[derive(Debug, Clone)]
pub enum Request {
    Ping,
    Ocr(OcrRequest),
    Shutdown,
    /// Any other `type` value
    Unknown(String),
}

/// A single recognition job
#[derive(Debug, Clone)]
pub struct OcrRequest {
    pub request_id: String,
    pub image_data: Vec<u8>,
    pub roi_type: String,
    pub roi_params: Option<Value>,
    pub preprocess: Option<Value>,
}

impl OcrRequest {
    /// Region to crop. Unknown ROI kinds select the full frame.
    pub fn roi(&self) -> Result<Roi, VisionError> {
        match self.roi_type.as_str() {
            "rect" | "polygon" | "perspective" => {}
            _ => return Ok(Roi::FullFrame),
        }

        let params: RoiParams = match &self.roi_params {
            None | Some(Value::Null) => RoiParams::default(),
            Some(value) => {
                RoiParams::deserialize(value).map_err(|e| VisionError::InvalidRoi {
                    roi_type: self.roi_type.clone(),
                    reason: e.to_string(),
                })?
            }
        };
        Ok(params.to_roi(&self.roi_type))
    }

    /// Preprocessing toggles, with absent keys at their defaults
    pub fn preprocess_config(&self) -> Result<PreprocessConfig, VisionError> {
        match &self.preprocess {
            None | Some(Value::Null) => Ok(PreprocessConfig::default()),
            Some(value) => PreprocessConfig::deserialize(value)
                .map_err(|e| VisionError::InvalidPreprocess(e.to_string())),
        }
    }
}

impl From<Envelope> for Request {
    fn from(envelope: Envelope) -> Self {
        match envelope.kind.as_str() {
            "ping" => Request::Ping,
            "shutdown" => Request::Shutdown,
            "ocr" => Request::Ocr(OcrRequest {
                request_id: envelope.request_id.unwrap_or_default(),
                image_data: envelope
                    .image_data
                    .map(ByteBuf::into_vec)
                    .unwrap_or_default(),
                roi_type: envelope.roi_type.unwrap_or_else(|| "fullframe".into()),
                roi_params: envelope.roi_params,
                preprocess: envelope.preprocess,
            }),
            _ => Request::Unknown(envelope.kind),
        }
    }
}

/// One recognised text line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrLine {
    pub text: String,
    pub confidence: f64,
    /// x, y, w, h
    pub bbox: [i32; 4],
    pub y_center: i32,
}

/// Reply sent for every request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Pong,
    OcrResult {
        request_id: String,
        lines: Vec<OcrLine>,
        elapsed_ms: f64,
    },
    Ack,
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        message: String,
    },
}

/// Decode a frame payload into a request
pub fn decode_request(payload: &[u8]) -> Result<Request, rmp_serde::decode::Error> {
    let envelope: Envelope = rmp_serde::from_slice(payload)?;
    Ok(envelope.into())
}

/// Encode a response as a MessagePack map with named fields
pub fn encode_response(response: &Response) -> Result<Vec<u8>, rmp_serde::encode::Error> {
    rmp_serde::to_vec_named(response)
}
