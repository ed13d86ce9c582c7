//! OCR a whole document, one page at a time.

use std::sync::Arc;

use indicatif::ProgressBar;
use tracing::Instrument as _;

use crate::{
    error::PipelineError,
    ocr::{
        DocumentResult, OcrOptions, PageResult,
        engines::{EngineFactory, OcrEngine},
        extract_page,
    },
    prelude::*,
    raster::Rasterizer,
};

/// Rasterizes a document and runs OCR over each page.
#[derive(Clone)]
pub struct DocumentPipeline {
    rasterizer: Arc<dyn Rasterizer>,
    factory: Arc<dyn EngineFactory>,
}

impl DocumentPipeline {
    /// Create a new pipeline. `factory` is only used when [`Self::run`] is
    /// not given an engine.
    pub fn new(rasterizer: Arc<dyn Rasterizer>, factory: Arc<dyn EngineFactory>) -> Self {
        Self {
            rasterizer,
            factory,
        }
    }

    /// OCR every page of `path`, in order.
    ///
    /// If `engine` is `None`, a fresh engine is built for
    /// `options.languages` and dropped when we return. Any failure aborts the
    /// whole document; we never return results for only some pages.
    #[instrument(
        level = "debug",
        skip_all,
        fields(path = %path.display(), languages = %options.languages, dpi = options.dpi)
    )]
    pub async fn run(
        &self,
        path: &Path,
        options: &OcrOptions,
        engine: Option<Arc<dyn OcrEngine>>,
        progress: Option<&ProgressBar>,
    ) -> Result<DocumentResult, PipelineError> {
        let engine = match engine {
            Some(engine) => engine,
            None => self
                .factory
                .build(&options.languages, options.use_gpu)
                .await
                .map_err(|cause| PipelineError::EngineConstruction { cause })?,
        };

        // The document's scratch space is released when `document` goes out
        // of scope, including on the error paths below.
        let mut document = self.rasterizer.open(path).await.map_err(|cause| {
            PipelineError::DocumentOpen {
                path: path.to_owned(),
                cause,
            }
        })?;
        let page_count = document.page_count();
        if let Some(pb) = progress {
            pb.set_length(page_count as u64);
        }

        let mut pages = Vec::with_capacity(page_count);
        for page in 1..=page_count {
            let span = tracing::debug_span!("page", page, detections = tracing::field::Empty);
            let items = async {
                let image = document
                    .render_page(page, options.dpi)
                    .await
                    .map_err(|cause| PipelineError::Rasterization { page, cause })?;
                let items =
                    extract_page(engine.as_ref(), Arc::new(image), options.min_confidence)
                        .await
                        .map_err(|cause| PipelineError::Recognition { page, cause })?;
                tracing::Span::current().record("detections", items.len());
                Ok::<_, PipelineError>(items)
            }
            .instrument(span)
            .await?;
            pages.push(PageResult { page, items });
            if let Some(pb) = progress {
                pb.inc(1);
            }
        }
        Ok(pages)
    }
}
