//! OCR engine interface.

use std::sync::Arc;

use image::RgbImage;

use crate::prelude::*;

use super::{LanguageSet, normalize::RawDetection};

pub mod tesseract;

/// An OCR engine, bound to one language set at construction time.
#[async_trait]
pub trait OcrEngine: Send + Sync + 'static {
    /// The languages this engine was built for.
    fn languages(&self) -> &LanguageSet;

    /// Detect text regions in `image`, in whatever order the engine likes.
    ///
    /// The image is passed as an [`Arc`] so that implementations can move it
    /// to a blocking thread without copying the pixels.
    async fn detect(&self, image: Arc<RgbImage>) -> Result<Vec<RawDetection>>;
}

/// Something that can build [`OcrEngine`]s.
///
/// Building an engine may be slow (loading models, checking for language
/// data), so callers should hang onto engines where they can. See
/// [`crate::ocr::pool::EnginePool`].
#[async_trait]
pub trait EngineFactory: Send + Sync + 'static {
    /// Build an engine for `languages`.
    async fn build(&self, languages: &LanguageSet, use_gpu: bool) -> Result<Arc<dyn OcrEngine>>;
}
