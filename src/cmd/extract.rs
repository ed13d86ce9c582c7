//! The `extract` subcommand.

use std::sync::Arc;

use clap::Args;

use crate::{
    async_utils::io::write_json_pretty,
    ocr::{
        DEFAULT_DPI, DEFAULT_LANGUAGES, DEFAULT_MIN_CONFIDENCE, LanguageSet, OcrOptions,
        engines::tesseract::{TesseractEngineFactory, TesseractOpts},
    },
    pipeline::DocumentPipeline,
    prelude::*,
    raster::PopplerRasterizer,
    ui::{ProgressConfig, Ui},
};

/// Extract command line arguments.
#[derive(Debug, Args)]
pub struct ExtractOpts {
    /// The scanned PDF to read.
    #[clap(value_name = "PDF")]
    pub pdf: PathBuf,

    /// Comma-separated language codes, like `en,fr`.
    #[clap(long, default_value = DEFAULT_LANGUAGES)]
    pub languages: LanguageSet,

    /// Resolution to render pages at.
    #[clap(long, default_value_t = DEFAULT_DPI, value_parser = clap::value_parser!(u32).range(1..))]
    pub dpi: u32,

    /// Drop detections with a confidence below this (0.0 to 1.0).
    #[clap(long, default_value_t = DEFAULT_MIN_CONFIDENCE, value_parser = parse_confidence)]
    pub min_confidence: f64,

    /// Ask the OCR engine to use a GPU.
    #[clap(long)]
    pub gpu: bool,

    /// Write JSON here instead of standard output.
    #[clap(long = "json-out", value_name = "PATH")]
    pub output_path: Option<PathBuf>,

    #[clap(flatten)]
    pub tesseract: TesseractOpts,
}

impl ExtractOpts {
    fn ocr_options(&self) -> OcrOptions {
        OcrOptions {
            languages: self.languages.clone(),
            dpi: self.dpi,
            min_confidence: self.min_confidence,
            use_gpu: self.gpu,
        }
    }
}

/// Parse a confidence threshold between 0 and 1.
fn parse_confidence(s: &str) -> Result<f64> {
    let value = s
        .trim()
        .parse::<f64>()
        .with_context(|| format!("not a number: {:?}", s))?;
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(value)
    } else {
        Err(anyhow!("confidence must be between 0 and 1, got {}", value))
    }
}

/// The `extract` subcommand.
#[instrument(level = "debug", skip_all, fields(pdf = %opts.pdf.display()))]
pub async fn cmd_extract(ui: &Ui, opts: &ExtractOpts) -> Result<()> {
    if !opts.pdf.exists() {
        return Err(anyhow!("PDF not found: {}", opts.pdf.display()));
    }

    let pipeline = DocumentPipeline::new(
        Arc::new(PopplerRasterizer::default()),
        Arc::new(TesseractEngineFactory::new(opts.tesseract.clone())),
    );
    let pb = ui.new_progress_bar(
        &ProgressConfig {
            emoji: "📄",
            msg: "OCRing pages",
            done_msg: "OCRed pages",
        },
        0,
    );
    let pages = pipeline
        .run(&opts.pdf, &opts.ocr_options(), None, Some(&pb))
        .await?;
    pb.finish_using_style();

    write_json_pretty(opts.output_path.as_deref(), &pages).await
}
