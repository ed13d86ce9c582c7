//! OCR data model and per-page text extraction.

use std::{collections::BTreeSet, fmt, str::FromStr, sync::Arc};

use image::RgbImage;
use schemars::JsonSchema;

use crate::prelude::*;

use self::engines::OcrEngine;

pub mod engines;
pub mod normalize;
pub mod pool;

/// Default DPI for rasterizing pages.
pub const DEFAULT_DPI: u32 = 300;

/// Default minimum confidence for keeping a detection.
pub const DEFAULT_MIN_CONFIDENCE: f64 = 0.2;

/// Default language set.
pub const DEFAULT_LANGUAGES: &str = "en";

/// One recognized text region on a page.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct Detection {
    /// The recognized text, with surrounding whitespace removed. Never empty.
    pub text: String,

    /// Engine confidence, between 0 and 1.
    pub confidence: f64,

    /// The corners of the text region in rendered-page pixels, in the order
    /// the engine returned them. Normally four `[x, y]` points.
    pub bbox: Vec<Vec<f64>>,
}

/// The detections for a single page.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct PageResult {
    /// 1-based page number.
    pub page: usize,

    /// Detections in engine order.
    pub items: Vec<Detection>,
}

/// OCR output for a whole document, one entry per page in page order.
pub type DocumentResult = Vec<PageResult>;

/// Join every detection's text with newlines, in document order.
pub fn flat_text(pages: &[PageResult]) -> String {
    pages
        .iter()
        .flat_map(|page| page.items.iter())
        .map(|item| item.text.as_str())
        .filter(|text| !text.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// A non-empty list of language codes, without duplicates.
///
/// We keep the order the caller gave us, because engines may use it to break
/// ties. Two sets with the same members in a different order are the same set
/// as far as engine reuse is concerned; see [`LanguageSet::is_same_set`].
#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
#[schemars(transparent)]
pub struct LanguageSet {
    codes: Vec<String>,
}

impl LanguageSet {
    /// Build a language set from codes, trimming whitespace and dropping
    /// blanks and duplicates.
    pub fn new<I, S>(codes: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut seen = BTreeSet::new();
        let mut result = vec![];
        for code in codes {
            let code = code.as_ref().trim();
            if !code.is_empty() && seen.insert(code.to_owned()) {
                result.push(code.to_owned());
            }
        }
        if result.is_empty() {
            Err(anyhow!("At least one language code must be provided"))
        } else {
            Ok(Self { codes: result })
        }
    }

    /// The language codes, in the order given.
    pub fn codes(&self) -> &[String] {
        &self.codes
    }

    /// Do these two sets have exactly the same members?
    pub fn is_same_set(&self, other: &LanguageSet) -> bool {
        let ours = self.codes.iter().collect::<BTreeSet<_>>();
        let theirs = other.codes.iter().collect::<BTreeSet<_>>();
        ours == theirs
    }
}

impl Default for LanguageSet {
    fn default() -> Self {
        Self {
            codes: vec![DEFAULT_LANGUAGES.to_owned()],
        }
    }
}

impl FromStr for LanguageSet {
    type Err = anyhow::Error;

    /// Parse a comma-separated list like `en,fr`.
    fn from_str(s: &str) -> Result<Self> {
        Self::new(s.split(','))
    }
}

impl fmt::Display for LanguageSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.codes.join(","))
    }
}

impl TryFrom<Vec<String>> for LanguageSet {
    type Error = anyhow::Error;

    fn try_from(codes: Vec<String>) -> Result<Self> {
        Self::new(codes)
    }
}

impl From<LanguageSet> for Vec<String> {
    fn from(languages: LanguageSet) -> Self {
        languages.codes
    }
}

/// Options controlling how a document is OCRed.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct OcrOptions {
    /// Languages to recognize.
    pub languages: LanguageSet,

    /// Rasterization resolution. Always positive.
    pub dpi: u32,

    /// Detections below this confidence are dropped. Between 0 and 1.
    pub min_confidence: f64,

    /// Ask the engine to use a GPU, if it has one.
    pub use_gpu: bool,
}

impl Default for OcrOptions {
    fn default() -> Self {
        Self {
            languages: LanguageSet::default(),
            dpi: DEFAULT_DPI,
            min_confidence: DEFAULT_MIN_CONFIDENCE,
            use_gpu: false,
        }
    }
}

/// Run `engine` over one rendered page and keep the detections that pass
/// `min_confidence`.
#[instrument(level = "debug", skip_all, fields(width = image.width(), height = image.height()))]
pub async fn extract_page(
    engine: &dyn OcrEngine,
    image: Arc<RgbImage>,
    min_confidence: f64,
) -> Result<Vec<Detection>> {
    let raw = engine.detect(image).await?;
    let raw_count = raw.len();
    let detections = normalize::normalize_detections(raw, min_confidence);
    trace!(raw_count, kept = detections.len(), "Normalized detections");
    Ok(detections)
}
