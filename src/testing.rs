//! Fake rasterizers and engines for unit tests.
//!
//! These let us test the pipeline and the job machinery without Poppler or
//! Tesseract installed.

use std::{
    collections::BTreeMap,
    str::FromStr as _,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use image::RgbImage;
use tokio::sync::Semaphore;

use crate::{
    ocr::{
        LanguageSet,
        engines::{EngineFactory, OcrEngine},
        normalize::RawDetection,
    },
    prelude::*,
    raster::{RasterDocument, Rasterizer},
};

/// Minimal bytes that our fake rasterizer accepts as a PDF.
pub const FAKE_PDF: &[u8] = b"%PDF-1.4 fake";

/// A rasterizer that accepts anything starting with `%PDF` and renders page
/// `n` as an `n x 1` image, so engines can tell pages apart by width.
pub struct FakeRasterizer {
    pub page_count: usize,
    /// Fail to render this page, if set.
    pub failing_page: Option<usize>,
}

impl FakeRasterizer {
    pub fn new(page_count: usize) -> Self {
        Self {
            page_count,
            failing_page: None,
        }
    }

    pub fn failing_on(mut self, page: usize) -> Self {
        self.failing_page = Some(page);
        self
    }
}

#[async_trait]
impl Rasterizer for FakeRasterizer {
    async fn open(&self, path: &Path) -> Result<Box<dyn RasterDocument>> {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read {:?}", path.display()))?;
        if !bytes.starts_with(b"%PDF") {
            return Err(anyhow!("{:?} is not a PDF", path.display()));
        }
        Ok(Box::new(FakeDocument {
            page_count: self.page_count,
            failing_page: self.failing_page,
        }))
    }
}

struct FakeDocument {
    page_count: usize,
    failing_page: Option<usize>,
}

#[async_trait]
impl RasterDocument for FakeDocument {
    fn page_count(&self) -> usize {
        self.page_count
    }

    async fn render_page(&mut self, page_number: usize, _dpi: u32) -> Result<RgbImage> {
        if Some(page_number) == self.failing_page {
            return Err(anyhow!("pdftocairo failed with exit code 1"));
        }
        Ok(RgbImage::new(page_number as u32, 1))
    }
}

/// An engine that returns canned detections, keyed by page number (which it
/// reads from the image width; see [`FakeRasterizer`]).
pub struct ScriptedEngine {
    languages: LanguageSet,
    pages: BTreeMap<usize, Vec<RawDetection>>,
    /// When set, each `detect` call waits for a permit.
    gate: Option<Arc<Semaphore>>,
}

impl ScriptedEngine {
    /// An engine for a comma-separated language list, detecting nothing.
    pub fn new(languages: &str) -> Self {
        Self {
            languages: LanguageSet::from_str(languages).expect("bad test languages"),
            pages: BTreeMap::new(),
            gate: None,
        }
    }

    /// Return `raw` for page `page`.
    pub fn with_page(mut self, page: usize, raw: Vec<RawDetection>) -> Self {
        self.pages.insert(page, raw);
        self
    }

    /// Block every `detect` call until `gate` has a permit available.
    pub fn gated(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// A well-formed raw detection.
    pub fn raw(text: &str, confidence: f64) -> RawDetection {
        RawDetection::from_box(0.0, 0.0, 10.0, 5.0, text, confidence)
    }
}

#[async_trait]
impl OcrEngine for ScriptedEngine {
    fn languages(&self) -> &LanguageSet {
        &self.languages
    }

    async fn detect(&self, image: Arc<RgbImage>) -> Result<Vec<RawDetection>> {
        if let Some(gate) = &self.gate {
            gate.acquire().await.context("gate closed")?.forget();
        }
        let page = image.width() as usize;
        Ok(self.pages.get(&page).cloned().unwrap_or_default())
    }
}

/// A factory that counts builds. Engines it builds use `script` for their
/// detections.
#[derive(Default)]
pub struct CountingFactory {
    builds: AtomicUsize,
    fail: bool,
    script: BTreeMap<usize, Vec<RawDetection>>,
}

impl CountingFactory {
    /// A factory whose builds always fail.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    /// Engines built by this factory return `raw` for page `page`.
    pub fn with_page(mut self, page: usize, raw: Vec<RawDetection>) -> Self {
        self.script.insert(page, raw);
        self
    }

    /// How many engines have we built?
    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EngineFactory for CountingFactory {
    async fn build(&self, languages: &LanguageSet, _use_gpu: bool) -> Result<Arc<dyn OcrEngine>> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(anyhow!("language pack {} is not installed", languages));
        }
        let mut engine = ScriptedEngine::new(&languages.to_string());
        for (page, raw) in &self.script {
            engine = engine.with_page(*page, raw.clone());
        }
        Ok(Arc::new(engine))
    }
}
