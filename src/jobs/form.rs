//! Turn submitted form fields into job options.
//!
//! Forms are filled in by people, so we are forgiving here: a value we can't
//! use is replaced by its default rather than rejected.

use std::collections::HashMap;

use crate::ocr::{
    DEFAULT_DPI, DEFAULT_MIN_CONFIDENCE, LanguageSet, OcrOptions,
};

/// Filename used when the uploaded one has nothing usable left in it.
pub const FALLBACK_FILENAME: &str = "document.pdf";

/// Build [`OcrOptions`] from form fields.
///
/// Recognized keys are `languages`, `dpi`, `min_conf` (or `min_confidence`)
/// and `use_gpu`. Unknown keys are ignored.
pub fn options_from_form(fields: &HashMap<String, String>) -> OcrOptions {
    let languages = fields
        .get("languages")
        .and_then(|raw| raw.parse::<LanguageSet>().ok())
        .unwrap_or_default();
    let dpi = fields
        .get("dpi")
        .and_then(|raw| raw.trim().parse::<u32>().ok())
        .filter(|dpi| *dpi > 0)
        .unwrap_or(DEFAULT_DPI);
    let min_confidence = fields
        .get("min_conf")
        .or_else(|| fields.get("min_confidence"))
        .and_then(|raw| raw.trim().parse::<f64>().ok())
        .filter(|conf| conf.is_finite() && (0.0..=1.0).contains(conf))
        .unwrap_or(DEFAULT_MIN_CONFIDENCE);
    let use_gpu = fields.get("use_gpu").is_some_and(|raw| is_truthy(raw));
    OcrOptions {
        languages,
        dpi,
        min_confidence,
        use_gpu,
    }
}

/// Checkbox and environment-variable style booleans.
pub fn is_truthy(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Reduce an uploaded filename to something safe to show and store.
///
/// Directory parts are flattened, whitespace becomes `_`, only ASCII letters,
/// digits, `.`, `_` and `-` survive, and leading or trailing dots and
/// underscores are stripped. If nothing is left, we use
/// [`FALLBACK_FILENAME`].
pub fn sanitize_filename(raw: Option<&str>) -> String {
    let raw = raw.unwrap_or_default().replace(['/', '\\'], " ");
    let joined = raw.split_whitespace().collect::<Vec<_>>().join("_");
    let kept = joined
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        .collect::<String>();
    let trimmed = kept.trim_matches(|c| c == '.' || c == '_');
    if trimmed.is_empty() {
        FALLBACK_FILENAME.to_owned()
    } else {
        trimmed.to_owned()
    }
}
