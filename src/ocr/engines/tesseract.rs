//! Tesseract OCR engine.
//!
//! We run the `tesseract` CLI once per page and ask for TSV output, which
//! gives us one row per recognized word with a pixel box and a confidence.
//! Words are grouped back into lines, and each line becomes one detection.

use std::{io::Cursor, sync::Arc};

use clap::Args;
use image::{ImageFormat, RgbImage};
use tokio::process::Command;

use crate::{
    async_utils::{check_for_command_failure, spawn_blocking_propagating_panics},
    cpu_limit::with_cpu_semaphore,
    ocr::{LanguageSet, normalize::RawDetection},
    prelude::*,
};

use super::{EngineFactory, OcrEngine};

/// TSV row level for individual words.
const WORD_LEVEL: u32 = 5;

/// Options for locating Tesseract.
#[derive(Args, Clone, Debug)]
pub struct TesseractOpts {
    /// The `tesseract` binary to run.
    #[clap(long, env = "TESSERACT_CMD", default_value = "tesseract")]
    pub tesseract_cmd: PathBuf,
}

impl Default for TesseractOpts {
    fn default() -> Self {
        Self {
            tesseract_cmd: PathBuf::from("tesseract"),
        }
    }
}

/// Map a short language code to the name of a Tesseract language pack.
///
/// Codes we don't recognize are passed through unchanged, so callers can
/// always use Tesseract's own names (`eng`, `chi_sim`, ...).
pub fn tesseract_language(code: &str) -> &str {
    match code {
        "en" => "eng",
        "fr" => "fra",
        "de" => "deu",
        "es" => "spa",
        "it" => "ita",
        "pt" => "por",
        "nl" => "nld",
        "ja" => "jpn",
        "ch_sim" => "chi_sim",
        "ch_tra" => "chi_tra",
        "ko" => "kor",
        "ru" => "rus",
        "ar" => "ara",
        "hi" => "hin",
        other => other,
    }
}

/// Builds [`TesseractOcrEngine`]s.
#[derive(Clone, Debug, Default)]
pub struct TesseractEngineFactory {
    opts: TesseractOpts,
}

impl TesseractEngineFactory {
    /// Create a new factory.
    pub fn new(opts: TesseractOpts) -> Self {
        Self { opts }
    }

    /// Ask Tesseract which language packs are installed.
    async fn installed_languages(&self) -> Result<Vec<String>> {
        let output = Command::new(&self.opts.tesseract_cmd)
            .arg("--list-langs")
            .output()
            .await
            .with_context(|| {
                format!("cannot run {:?}", self.opts.tesseract_cmd.display())
            })?;
        check_for_command_failure("tesseract", &output, None)?;
        // Old versions print the list to stderr.
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        Ok(parse_language_list(&format!("{stdout}\n{stderr}")))
    }
}

#[async_trait]
impl EngineFactory for TesseractEngineFactory {
    #[instrument(level = "debug", skip(self), fields(languages = %languages))]
    async fn build(
        &self,
        languages: &LanguageSet,
        use_gpu: bool,
    ) -> Result<Arc<dyn OcrEngine>> {
        if use_gpu {
            warn!("tesseract has no GPU support; running on CPU");
        }
        let installed = self.installed_languages().await?;
        let mut packs = vec![];
        for code in languages.codes() {
            let pack = tesseract_language(code);
            if !installed.iter().any(|l| l == pack) {
                return Err(anyhow!(
                    "tesseract language pack {:?} (for {:?}) is not installed",
                    pack,
                    code
                ));
            }
            packs.push(pack.to_owned());
        }
        debug!(packs = %packs.join("+"), "Built tesseract engine");
        Ok(Arc::new(TesseractOcrEngine {
            command: self.opts.tesseract_cmd.clone(),
            languages: languages.clone(),
            language_arg: packs.join("+"),
        }))
    }
}

/// Parse `tesseract --list-langs` output.
fn parse_language_list(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with("List of available"))
        .map(str::to_owned)
        .collect()
}

/// OCR engine wrapping the `tesseract` CLI tool.
pub struct TesseractOcrEngine {
    command: PathBuf,
    languages: LanguageSet,
    /// Language packs in `eng+fra` form.
    language_arg: String,
}

#[async_trait]
impl OcrEngine for TesseractOcrEngine {
    fn languages(&self) -> &LanguageSet {
        &self.languages
    }

    #[instrument(level = "debug", skip_all, fields(languages = %self.language_arg))]
    async fn detect(&self, image: Arc<RgbImage>) -> Result<Vec<RawDetection>> {
        let png = spawn_blocking_propagating_panics(move || encode_png(&image)).await?;

        // Write our input to a temporary file.
        let tmpdir = tempfile::TempDir::with_prefix("tesseract")?;
        let input_path = tmpdir.path().join("page.png");
        tokio::fs::write(&input_path, &png)
            .await
            .context("cannot write tesseract input file")?;

        let mut cmd = Command::new(&self.command);
        cmd.arg(&input_path)
            .arg("stdout")
            .arg("-l")
            .arg(&self.language_arg)
            .arg("tsv");
        let output = with_cpu_semaphore(move || async move {
            cmd.output().await.context("cannot run tesseract")
        })
        .await?;
        check_for_command_failure("tesseract", &output, None)?;

        let tsv =
            String::from_utf8(output.stdout).context("tesseract output was not UTF-8")?;
        spawn_blocking_propagating_panics(move || parse_tsv(&tsv)).await
    }
}

/// Encode an image as PNG.
fn encode_png(image: &RgbImage) -> Result<Vec<u8>> {
    let mut png = Cursor::new(vec![]);
    image
        .write_to(&mut png, ImageFormat::Png)
        .context("cannot encode page as PNG")?;
    Ok(png.into_inner())
}

/// A line of text being assembled from word rows.
struct LineAccumulator {
    key: (u32, u32, u32, u32),
    words: Vec<String>,
    confidence_sum: f64,
    left: f64,
    top: f64,
    right: f64,
    bottom: f64,
}

impl LineAccumulator {
    fn into_raw(self) -> RawDetection {
        let confidence = self.confidence_sum / self.words.len() as f64 / 100.0;
        RawDetection::from_box(
            self.left,
            self.top,
            self.right,
            self.bottom,
            &self.words.join(" "),
            confidence,
        )
    }
}

/// Parse Tesseract's TSV output into one detection per line of text.
///
/// Lines come out in the order Tesseract first mentions them, which is its
/// reading order.
fn parse_tsv(tsv: &str) -> Result<Vec<RawDetection>> {
    let mut lines: Vec<LineAccumulator> = vec![];
    for (row_idx, row) in tsv.lines().enumerate() {
        if row_idx == 0 && row.starts_with("level") {
            continue;
        }
        if row.trim().is_empty() {
            continue;
        }
        let fields = row.split('\t').collect::<Vec<_>>();
        if fields.len() < 12 {
            return Err(anyhow!("malformed tesseract TSV row: {:?}", row));
        }
        let num = |idx: usize| -> Result<u32> {
            fields[idx]
                .parse::<u32>()
                .with_context(|| format!("bad field {} in tesseract TSV row {:?}", idx, row))
        };
        let float = |idx: usize| -> Result<f64> {
            fields[idx]
                .parse::<f64>()
                .with_context(|| format!("bad field {} in tesseract TSV row {:?}", idx, row))
        };

        if num(0)? != WORD_LEVEL {
            continue;
        }
        let text = fields[11..].join("\t");
        let text = text.trim();
        let confidence = float(10)?;
        if text.is_empty() || confidence < 0.0 {
            continue;
        }

        let key = (num(1)?, num(2)?, num(3)?, num(4)?);
        let left = float(6)?;
        let top = float(7)?;
        let right = left + float(8)?;
        let bottom = top + float(9)?;

        match lines.iter_mut().find(|line| line.key == key) {
            Some(line) => {
                line.words.push(text.to_owned());
                line.confidence_sum += confidence;
                line.left = line.left.min(left);
                line.top = line.top.min(top);
                line.right = line.right.max(right);
                line.bottom = line.bottom.max(bottom);
            }
            None => lines.push(LineAccumulator {
                key,
                words: vec![text.to_owned()],
                confidence_sum: confidence,
                left,
                top,
                right,
                bottom,
            }),
        }
    }
    Ok(lines.into_iter().map(LineAccumulator::into_raw).collect())
}
