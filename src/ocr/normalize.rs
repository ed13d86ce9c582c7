//! Turn untyped engine output into [`Detection`]s.
//!
//! Engines hand us JSON-ish values: numbers that may arrive as strings, text
//! that may be missing, and corner points that are usually `[x, y]` pairs but
//! not always. Everything here is best effort. A bad field is zeroed or the
//! detection is dropped; nothing in this module returns an error.

use super::Detection;
use crate::prelude::*;

/// A detection as reported by an engine, before any cleanup.
#[derive(Clone, Debug, PartialEq)]
pub struct RawDetection {
    /// The region's corner points. Normally an array of four `[x, y]` arrays.
    pub quad: Value,

    /// The recognized text.
    pub text: Value,

    /// Confidence, normally a number between 0 and 1.
    pub confidence: Value,
}

impl RawDetection {
    /// Build a well-formed raw detection from an axis-aligned box, with
    /// corners in top-left, top-right, bottom-right, bottom-left order.
    pub fn from_box(
        left: f64,
        top: f64,
        right: f64,
        bottom: f64,
        text: &str,
        confidence: f64,
    ) -> Self {
        Self {
            quad: serde_json::json!([[left, top], [right, top], [right, bottom], [left, bottom]]),
            text: Value::String(text.to_owned()),
            confidence: serde_json::json!(confidence),
        }
    }
}

/// Keep the detections with `confidence >= min_confidence` and non-blank
/// text, preserving engine order.
pub fn normalize_detections(raw: Vec<RawDetection>, min_confidence: f64) -> Vec<Detection> {
    raw.into_iter()
        .filter_map(|raw| normalize_detection(raw, min_confidence))
        .collect()
}

/// Normalize a single detection, or return `None` if it should be dropped.
fn normalize_detection(raw: RawDetection, min_confidence: f64) -> Option<Detection> {
    let confidence = coerce_confidence(&raw.confidence);
    if confidence < min_confidence {
        return None;
    }
    let text = coerce_text(&raw.text);
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    Some(Detection {
        text: text.to_owned(),
        confidence,
        bbox: coerce_quad(&raw.quad),
    })
}

/// Coerce a confidence value into `[0, 1]`. Anything we can't read is `0.0`.
pub fn coerce_confidence(value: &Value) -> f64 {
    coerce_f64(value).map_or(0.0, |confidence| confidence.clamp(0.0, 1.0))
}

/// Coerce a value to a float the way a lenient reader would: numbers as-is,
/// numeric strings parsed, booleans as 0 or 1, and single-element arrays
/// unwrapped.
///
/// Non-finite results (`"NaN"`, `"inf"`, `"1e400"`) count as unreadable. JSON
/// has no way to write them, so they would not survive `ocr.json`.
fn coerce_f64(value: &Value) -> Option<f64> {
    let coerced = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::Array(items) if items.len() == 1 => coerce_f64(&items[0]),
        _ => None,
    };
    coerced.filter(|v| v.is_finite())
}

/// Text as a string. Non-text scalars are stringified; anything else is
/// empty, which gets the detection dropped.
fn coerce_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => String::new(),
    }
}

/// Coerce corner points into `[[x, y], ...]`.
///
/// If every point is a readable pair we use those. Otherwise we fall back to
/// coercing each element of each point individually, which keeps the number of
/// points but not necessarily two coordinates per point. A quad that is not
/// an array at all becomes an empty list.
pub fn coerce_quad(value: &Value) -> Vec<Vec<f64>> {
    let Value::Array(points) = value else {
        return vec![];
    };
    let pairs = points
        .iter()
        .map(|point| match point {
            Value::Array(xy) if xy.len() == 2 => {
                Some(vec![coerce_f64(&xy[0])?, coerce_f64(&xy[1])?])
            }
            _ => None,
        })
        .collect::<Option<Vec<_>>>();
    match pairs {
        Some(pairs) => pairs,
        None => points.iter().map(coerce_point_flat).collect(),
    }
}

/// Fallback for a malformed point.
fn coerce_point_flat(point: &Value) -> Vec<f64> {
    match point {
        Value::Array(items) => items
            .iter()
            .map(|item| coerce_f64(item).unwrap_or(0.0))
            .collect(),
        scalar => vec![coerce_f64(scalar).unwrap_or(0.0)],
    }
}
