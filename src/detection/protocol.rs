//! Length-prefixed JSON wire protocol spoken with the detection service
//!
//! Every message is `[u32 big-endian length][UTF-8 JSON body]`. Requests carry
//! a JPEG frame as base64 text; responses carry boxes as two corners.

use std::io::{self, Read, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use serde::{Deserialize, Serialize};

use crate::capture::Frame;
use crate::detection::types::{BoundingBox, Detection, DetectionParams, DetectionResult};
use crate::error::{PipelineError, ProtocolError};

pub const HEADER_LEN: usize = 4;
pub const FRAME_REQUEST: &str = "frame_request";
pub const DETECTION_RESULT: &str = "detection_result";

/// Outer message shape shared by both directions
#[derive(Debug, Serialize, Deserialize)]
pub struct Envelope<P> {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<f64>,
    pub payload: P,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameRequest {
    pub frame_id: u64,
    pub width: u32,
    pub height: u32,
    /// Base64 JPEG
    pub data: String,
    pub detection_params: DetectionParams,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionResponse {
    pub frame_id: i64,
    #[serde(default)]
    pub processing_time_ms: f64,
    #[serde(default)]
    pub detections: Vec<WireDetection>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireDetection {
    pub class_id: i32,
    pub class_name: String,
    pub confidence: f32,
    pub bbox: Corners,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Corners {
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
}

impl FrameRequest {
    /// JPEG-encode the frame and wrap it with the request parameters.
    pub fn from_frame(frame: &Frame, params: &DetectionParams, quality: u8) -> Result<Self, PipelineError> {
        let rgb = frame.to_rgb().ok_or_else(|| {
            PipelineError::Encode(image::ImageError::Parameter(
                image::error::ParameterError::from_kind(
                    image::error::ParameterErrorKind::DimensionMismatch,
                ),
            ))
        })?;

        let mut jpeg = Vec::with_capacity(rgb.as_raw().len() / 8);
        JpegEncoder::new_with_quality(&mut jpeg, quality.clamp(1, 100)).encode_image(&rgb)?;

        Ok(Self {
            frame_id: frame.id(),
            width: rgb.width(),
            height: rgb.height(),
            data: STANDARD.encode(&jpeg),
            detection_params: params.clone(),
        })
    }

    /// Peer side: recover the transmitted image.
    pub fn decode_image(&self) -> Result<RgbImage, PipelineError> {
        let jpeg = STANDARD
            .decode(&self.data)
            .map_err(|e| PipelineError::Protocol(ProtocolError::Json(serde::de::Error::custom(e))))?;
        Ok(image::load_from_memory(&jpeg)?.to_rgb8())
    }
}

impl DetectionResponse {
    /// Convert to the internal result, keeping only well-formed boxes.
    pub fn into_result(self) -> Result<DetectionResult, ProtocolError> {
        let frame_id = u64::try_from(self.frame_id).map_err(|_| {
            ProtocolError::Json(serde::de::Error::custom(format!(
                "negative frame id {}",
                self.frame_id
            )))
        })?;

        let detections = self
            .detections
            .into_iter()
            .filter_map(|d| {
                let c = d.bbox;
                let bbox = BoundingBox::from_corners(
                    c.x1.round() as i32,
                    c.y1.round() as i32,
                    c.x2.round() as i32,
                    c.y2.round() as i32,
                )?;
                let detection = Detection {
                    class_id: d.class_id,
                    label: d.class_name,
                    confidence: d.confidence,
                    bbox,
                };
                detection.is_valid().then_some(detection)
            })
            .collect();

        Ok(DetectionResult {
            frame_id,
            processing_latency_ms: self.processing_time_ms,
            detections,
            success: true,
        })
    }
}

impl From<&DetectionResult> for DetectionResponse {
    fn from(result: &DetectionResult) -> Self {
        Self {
            frame_id: result.frame_id as i64,
            processing_time_ms: result.processing_latency_ms,
            detections: result
                .detections
                .iter()
                .map(|d| WireDetection {
                    class_id: d.class_id,
                    class_name: d.label.clone(),
                    confidence: d.confidence,
                    bbox: Corners {
                        x1: d.bbox.x as f64,
                        y1: d.bbox.y as f64,
                        x2: (d.bbox.x + d.bbox.width) as f64,
                        y2: (d.bbox.y + d.bbox.height) as f64,
                    },
                })
                .collect(),
        }
    }
}

fn unix_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

/// Length prefix for a body; bodies the header cannot express are rejected.
fn header_len(len: usize) -> Result<u32, ProtocolError> {
    u32::try_from(len).map_err(|_| ProtocolError::FrameTooLarge(len, u32::MAX as usize))
}

/// Prefix a JSON body with its big-endian length.
pub fn encode_message<T: Serialize>(message: &T) -> Result<Bytes, ProtocolError> {
    let body = serde_json::to_vec(message)?;
    let len = header_len(body.len())?;
    let mut out = BytesMut::with_capacity(HEADER_LEN + body.len());
    out.put_u32(len);
    out.extend_from_slice(&body);
    Ok(out.freeze())
}

pub fn encode_request(request: &FrameRequest) -> Result<Bytes, ProtocolError> {
    encode_message(&Envelope {
        kind: FRAME_REQUEST.to_string(),
        timestamp: Some(unix_seconds()),
        payload: request,
    })
}

pub fn encode_response(response: &DetectionResponse) -> Result<Bytes, ProtocolError> {
    encode_message(&Envelope {
        kind: DETECTION_RESULT.to_string(),
        timestamp: None,
        payload: response,
    })
}

fn open_envelope(body: &[u8], expected: &str) -> Result<serde_json::Value, ProtocolError> {
    let envelope: Envelope<serde_json::Value> = serde_json::from_slice(body)?;
    if envelope.kind != expected {
        return Err(ProtocolError::UnexpectedType(envelope.kind));
    }
    Ok(envelope.payload)
}

/// Client side: parse one response body.
pub fn parse_response(body: &[u8]) -> Result<DetectionResult, ProtocolError> {
    let payload = open_envelope(body, DETECTION_RESULT)?;
    let response: DetectionResponse = serde_json::from_value(payload)?;
    response.into_result()
}

/// Peer side: parse one request body.
pub fn parse_request(body: &[u8]) -> Result<FrameRequest, ProtocolError> {
    let payload = open_envelope(body, FRAME_REQUEST)?;
    Ok(serde_json::from_value(payload)?)
}

/// Accumulates stream bytes and splits them into complete message bodies.
pub struct MessageReader {
    buf: BytesMut,
    max_len: usize,
}

impl MessageReader {
    pub fn new(max_len: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(64 * 1024),
            max_len,
        }
    }

    /// Next complete body, or `None` while fewer bytes than declared are buffered.
    pub fn next_message(&mut self) -> Result<Option<Bytes>, ProtocolError> {
        let Some(declared) = self.declared_len() else {
            return Ok(None);
        };
        if declared > self.max_len {
            return Err(ProtocolError::FrameTooLarge(declared, self.max_len));
        }
        if self.buf.len() < HEADER_LEN + declared {
            return Ok(None);
        }
        self.buf.advance(HEADER_LEN);
        Ok(Some(self.buf.split_to(declared).freeze()))
    }

    /// Append whatever one `read` call yields. `Ok(0)` means end of stream.
    pub fn fill<R: Read>(&mut self, reader: &mut R) -> io::Result<usize> {
        let mut chunk = [0u8; 16 * 1024];
        let n = reader.read(&mut chunk)?;
        self.buf.extend_from_slice(&chunk[..n]);
        Ok(n)
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    fn declared_len(&self) -> Option<usize> {
        if self.buf.len() < HEADER_LEN {
            return None;
        }
        let mut header = &self.buf[..HEADER_LEN];
        Some(header.get_u32() as usize)
    }

    /// Error for a stream that ended with a partial message buffered.
    pub fn truncated(&self) -> ProtocolError {
        let expected = self
            .declared_len()
            .map(|n| n + HEADER_LEN)
            .unwrap_or(HEADER_LEN);
        ProtocolError::Truncated {
            received: self.buf.len(),
            expected,
        }
    }

    /// Block until one full message arrives. `Ok(None)` on a clean close
    /// between messages.
    pub fn read_message<R: Read>(&mut self, reader: &mut R) -> Result<Option<Bytes>, PipelineError> {
        loop {
            if let Some(body) = self.next_message()? {
                return Ok(Some(body));
            }
            match self.fill(reader) {
                Ok(0) if self.buf.is_empty() => return Ok(None),
                Ok(0) => return Err(self.truncated().into()),
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(PipelineError::Connection(e)),
            }
        }
    }
}

/// Write a whole encoded message.
pub fn write_message<W: Write>(writer: &mut W, message: &[u8]) -> io::Result<()> {
    writer.write_all(message)?;
    writer.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn sample_frame() -> Frame {
        Frame::from_rgb(42, 1.4, 42, RgbImage::from_pixel(32, 24, Rgb([90, 120, 200])))
    }

    #[test]
    fn request_round_trip_preserves_id_and_params() {
        let params = DetectionParams {
            confidence_threshold: 0.45,
            nms_threshold: 0.5,
            max_detections: 7,
            target_classes: vec!["drone".into()],
        };
        let request = FrameRequest::from_frame(&sample_frame(), &params, 90).unwrap();
        let wire = encode_request(&request).unwrap();

        let mut reader = MessageReader::new(1 << 20);
        reader.feed(&wire);
        let body = reader.next_message().unwrap().unwrap();
        let decoded = parse_request(&body).unwrap();

        assert_eq!(decoded.frame_id, 42);
        assert_eq!(decoded.detection_params, params);
        assert_eq!((decoded.width, decoded.height), (32, 24));
        assert_eq!(decoded.decode_image().unwrap().dimensions(), (32, 24));
    }

    #[test]
    fn header_is_big_endian_length() {
        let wire = encode_message(&serde_json::json!({"a": 1})).unwrap();
        let body_len = wire.len() - HEADER_LEN;
        assert_eq!(&wire[..HEADER_LEN], &(body_len as u32).to_be_bytes());
        assert!(std::str::from_utf8(&wire[HEADER_LEN..]).is_ok());
    }

    #[test]
    fn body_beyond_header_range_is_rejected() {
        assert_eq!(header_len(u32::MAX as usize).unwrap(), u32::MAX);
        #[cfg(target_pointer_width = "64")]
        {
            let oversized = u32::MAX as usize + 1;
            assert!(matches!(
                header_len(oversized),
                Err(ProtocolError::FrameTooLarge(len, max)) if len == oversized && max == u32::MAX as usize
            ));
        }
    }

    #[test]
    fn partial_message_is_incomplete_not_error() {
        let body = br#"{"type":"detection_result","payload":{"frame_id":3,"processing_time_ms":12.5,"detections":[]}}"#;
        let mut wire = (body.len() as u32).to_be_bytes().to_vec();
        wire.extend_from_slice(body);

        let mut reader = MessageReader::new(1024);
        reader.feed(&wire[..2]);
        assert!(reader.next_message().unwrap().is_none());
        reader.feed(&wire[2..20]);
        assert!(reader.next_message().unwrap().is_none());
        reader.feed(&wire[20..]);

        let body = reader.next_message().unwrap().unwrap();
        let result = parse_response(&body).unwrap();
        assert_eq!(result.frame_id, 3);
        assert_eq!(result.processing_latency_ms, 12.5);
        assert_eq!(reader.buffered(), 0);
    }

    #[test]
    fn close_mid_message_is_truncation() {
        let mut wire = 100u32.to_be_bytes().to_vec();
        wire.extend_from_slice(b"{\"type\":");
        let mut reader = MessageReader::new(1024);
        let err = reader.read_message(&mut wire.as_slice()).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Protocol(ProtocolError::Truncated {
                received: 12,
                expected: 104
            })
        ));
    }

    #[test]
    fn clean_close_between_messages() {
        let mut reader = MessageReader::new(1024);
        let empty: &[u8] = &[];
        assert!(reader.read_message(&mut &*empty).unwrap().is_none());
    }

    #[test]
    fn oversized_declaration_is_rejected() {
        let mut reader = MessageReader::new(16);
        reader.feed(&1000u32.to_be_bytes());
        assert!(matches!(
            reader.next_message(),
            Err(ProtocolError::FrameTooLarge(1000, 16))
        ));
    }

    #[test]
    fn response_corners_convert_and_bad_boxes_drop() {
        let body = serde_json::json!({
            "type": "detection_result",
            "payload": {
                "frame_id": 9,
                "processing_time_ms": 48.0,
                "detections": [
                    {"class_id": 0, "class_name": "person", "confidence": 0.91,
                     "bbox": {"x1": 10, "y1": 20, "x2": 60, "y2": 120}},
                    {"class_id": 2, "class_name": "car", "confidence": 0.6,
                     "bbox": {"x1": 50, "y1": 50, "x2": 40, "y2": 90}}
                ]
            }
        });
        let result = parse_response(&serde_json::to_vec(&body).unwrap()).unwrap();
        assert!(result.is_valid());
        assert_eq!(result.detections.len(), 1);
        assert_eq!(
            result.detections[0].bbox,
            BoundingBox {
                x: 10,
                y: 20,
                width: 50,
                height: 100
            }
        );
    }

    #[test]
    fn unknown_type_is_reported() {
        let body = br#"{"type":"heartbeat","payload":{}}"#;
        assert!(matches!(
            parse_response(body),
            Err(ProtocolError::UnexpectedType(t)) if t == "heartbeat"
        ));
    }

    #[test]
    fn negative_frame_id_is_malformed() {
        let body = br#"{"type":"detection_result","payload":{"frame_id":-1}}"#;
        assert!(matches!(parse_response(body), Err(ProtocolError::Json(_))));
    }
}
