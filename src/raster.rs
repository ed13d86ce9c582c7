//! Rasterize PDF pages to RGB images.
//!
//! We use Poppler's `pdfinfo` to learn the page count and page sizes, and
//! `pdftocairo` to render one page at a time. Rendering a single page per call
//! keeps memory bounded to one raster buffer, no matter how long the document
//! is.

use std::{collections::BTreeMap, sync::LazyLock};

use image::{ImageFormat, RgbImage};
use regex::Regex;
use tokio::process::Command;

use crate::{
    async_utils::{check_for_command_failure, spawn_blocking_propagating_panics},
    cpu_limit::with_cpu_semaphore,
    prelude::*,
};

/// PDF user space is measured in points, 72 to the inch.
pub const PDF_POINTS_PER_INCH: f64 = 72.0;

/// A default error regex for checking Poppler output.
static ERROR_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)error").expect("failed to compile regex"));

static DOWNGRADE_TO_WARNING_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)error: xref num").expect("failed to compile regex")
});

/// `Page    3 size: 612 x 792 pts (letter)`, or `Page size: ...` when
/// `pdfinfo` is only describing the first page.
static PAGE_SIZE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^Page\s*(\d*)\s+size:\s+([0-9.]+)\s+x\s+([0-9.]+)\s+pts")
        .expect("failed to compile regex")
});

/// `Page    3 rot:  90`
static PAGE_ROT_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^Page\s*(\d*)\s+rot:\s+(-?\d+)").expect("failed to compile regex")
});

/// Does this line of Poppler output contain an error?
fn is_error_line(line: &str) -> bool {
    ERROR_REGEX.is_match(line) && !DOWNGRADE_TO_WARNING_REGEX.is_match(line)
}

/// Zoom factor for rendering at `dpi`.
pub fn scale_for_dpi(dpi: u32) -> f64 {
    f64::from(dpi) / PDF_POINTS_PER_INCH
}

/// Size and orientation of a page, as reported by `pdfinfo`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PageGeometry {
    /// Unrotated width in points.
    pub width_pt: f64,
    /// Unrotated height in points.
    pub height_pt: f64,
    /// Page rotation in degrees, normalized to `0..360`.
    pub rotation: u32,
}

impl PageGeometry {
    /// Pixel dimensions of this page when rendered at `dpi`.
    ///
    /// Pages rotated by 90 or 270 degrees are displayed sideways, so their
    /// axes are swapped.
    pub fn raster_size(&self, dpi: u32) -> (u32, u32) {
        let scale = scale_for_dpi(dpi);
        let width = (self.width_pt * scale).round().max(1.0) as u32;
        let height = (self.height_pt * scale).round().max(1.0) as u32;
        if self.rotation % 180 == 90 {
            (height, width)
        } else {
            (width, height)
        }
    }
}

/// Something that can open documents for rasterization.
#[async_trait]
pub trait Rasterizer: Send + Sync + 'static {
    /// Open a document. Fails if the file is not a readable PDF.
    async fn open(&self, path: &Path) -> Result<Box<dyn RasterDocument>>;
}

/// An open document. Backing resources are released when this is dropped.
#[async_trait]
pub trait RasterDocument: Send {
    /// How many pages does this document have?
    fn page_count(&self) -> usize;

    /// Render page `page_number` (1-based) at `dpi` as a 3-channel RGB image.
    async fn render_page(&mut self, page_number: usize, dpi: u32) -> Result<RgbImage>;
}

/// A [`Rasterizer`] using Poppler's command-line tools.
#[derive(Clone, Debug)]
pub struct PopplerRasterizer {
    pdfinfo: PathBuf,
    pdftocairo: PathBuf,
}

impl Default for PopplerRasterizer {
    fn default() -> Self {
        Self {
            pdfinfo: PathBuf::from("pdfinfo"),
            pdftocairo: PathBuf::from("pdftocairo"),
        }
    }
}

#[async_trait]
impl Rasterizer for PopplerRasterizer {
    #[instrument(level = "debug", skip_all, fields(path = %path.display()))]
    async fn open(&self, path: &Path) -> Result<Box<dyn RasterDocument>> {
        check_is_pdf(path)?;

        let page_count = self.page_count(path).await?;
        let pages = if page_count == 0 {
            vec![]
        } else {
            self.page_geometries(path, page_count).await?
        };
        debug!(page_count, "Opened PDF");

        let tmpdir = tempfile::TempDir::with_prefix("form-ocr-pages")
            .context("failed to create scratch directory for rendered pages")?;
        Ok(Box::new(PopplerDocument {
            pdftocairo: self.pdftocairo.clone(),
            path: path.to_owned(),
            pages,
            tmpdir: Some(tmpdir),
        }))
    }
}

impl PopplerRasterizer {
    /// Get the number of pages in a PDF file.
    async fn page_count(&self, path: &Path) -> Result<usize> {
        let output = Command::new(&self.pdfinfo)
            .arg(path)
            .output()
            .await
            .with_context(|| format!("failed to run pdfinfo on {:?}", path.display()))?;
        check_for_command_failure("pdfinfo", &output, Some(&is_error_line))?;
        let stdout =
            String::from_utf8(output.stdout).context("pdfinfo output was not valid UTF-8")?;
        parse_page_count(&stdout)
    }

    /// Get the size and rotation of every page.
    async fn page_geometries(
        &self,
        path: &Path,
        page_count: usize,
    ) -> Result<Vec<PageGeometry>> {
        let output = Command::new(&self.pdfinfo)
            .arg("-f")
            .arg("1")
            .arg("-l")
            .arg(page_count.to_string())
            .arg(path)
            .output()
            .await
            .with_context(|| format!("failed to run pdfinfo on {:?}", path.display()))?;
        check_for_command_failure("pdfinfo", &output, Some(&is_error_line))?;
        let stdout =
            String::from_utf8(output.stdout).context("pdfinfo output was not valid UTF-8")?;
        parse_page_geometries(&stdout, page_count)
    }
}

/// Make sure `path` looks like a PDF before handing it to Poppler.
fn check_is_pdf(path: &Path) -> Result<()> {
    let kind = infer::get_from_path(path)
        .with_context(|| format!("failed to read {:?}", path.display()))?;
    match kind {
        Some(kind) if kind.mime_type() == "application/pdf" => Ok(()),
        Some(kind) => Err(anyhow!(
            "{:?} is not a PDF (detected {})",
            path.display(),
            kind.mime_type()
        )),
        None => Err(anyhow!("{:?} is not a PDF", path.display())),
    }
}

/// Parse the `Pages:` line of `pdfinfo` output.
fn parse_page_count(pdfinfo_output: &str) -> Result<usize> {
    let mut properties = BTreeMap::new();
    for line in pdfinfo_output.lines() {
        let mut parts = line.splitn(2, ':');
        let key = parts.next().unwrap_or("").trim();
        let value = parts.next().unwrap_or("").trim();
        properties.insert(key.to_string(), value.to_string());
    }
    let page_count_str = properties
        .get("Pages")
        .ok_or_else(|| anyhow!("failed to find page count in pdfinfo output"))?;
    page_count_str
        .parse::<usize>()
        .with_context(|| format!("failed to parse page count {:?}", page_count_str))
}

/// Parse per-page `size` and `rot` lines from `pdfinfo -f 1 -l N` output.
fn parse_page_geometries(
    pdfinfo_output: &str,
    page_count: usize,
) -> Result<Vec<PageGeometry>> {
    let mut sizes = BTreeMap::new();
    let mut rotations = BTreeMap::new();
    for line in pdfinfo_output.lines() {
        if let Some(caps) = PAGE_SIZE_REGEX.captures(line) {
            let page = parse_page_label(&caps[1])?;
            let width = caps[2]
                .parse::<f64>()
                .with_context(|| format!("bad page width in {:?}", line))?;
            let height = caps[3]
                .parse::<f64>()
                .with_context(|| format!("bad page height in {:?}", line))?;
            sizes.insert(page, (width, height));
        } else if let Some(caps) = PAGE_ROT_REGEX.captures(line) {
            let page = parse_page_label(&caps[1])?;
            let rotation = caps[2]
                .parse::<i64>()
                .with_context(|| format!("bad page rotation in {:?}", line))?;
            rotations.insert(page, rotation.rem_euclid(360) as u32);
        }
    }

    (1..=page_count)
        .map(|page| {
            let (width_pt, height_pt) = *sizes
                .get(&page)
                .ok_or_else(|| anyhow!("pdfinfo did not report a size for page {}", page))?;
            Ok(PageGeometry {
                width_pt,
                height_pt,
                rotation: rotations.get(&page).copied().unwrap_or(0),
            })
        })
        .collect()
}

/// `pdfinfo` leaves out the page number when describing only page 1.
fn parse_page_label(label: &str) -> Result<usize> {
    if label.is_empty() {
        Ok(1)
    } else {
        label
            .parse::<usize>()
            .with_context(|| format!("bad page number {:?}", label))
    }
}

/// A PDF opened with [`PopplerRasterizer`].
struct PopplerDocument {
    pdftocairo: PathBuf,
    path: PathBuf,
    pages: Vec<PageGeometry>,
    /// Scratch space for rendered pages. Released by [`Drop`].
    tmpdir: Option<tempfile::TempDir>,
}

#[async_trait]
impl RasterDocument for PopplerDocument {
    fn page_count(&self) -> usize {
        self.pages.len()
    }

    #[instrument(level = "debug", skip(self), fields(path = %self.path.display()))]
    async fn render_page(&mut self, page_number: usize, dpi: u32) -> Result<RgbImage> {
        let geometry = page_number
            .checked_sub(1)
            .and_then(|idx| self.pages.get(idx))
            .ok_or_else(|| {
                anyhow!("page {} out of range 1..={}", page_number, self.pages.len())
            })?;
        let (width, height) = geometry.raster_size(dpi);
        let tmpdir = self
            .tmpdir
            .as_ref()
            .ok_or_else(|| anyhow!("document has already been closed"))?;

        // With `-singlefile`, pdftocairo appends only the extension.
        let out_base = tmpdir.path().join(format!("page-{}", page_number));
        let out_path = out_base.with_extension("png");

        // We pass explicit pixel sizes rather than `-r`, so the output size is
        // exactly the rounded point size times our scale factor. `pdfinfo`
        // reports crop box sizes, so render the crop box too.
        let mut cmd = Command::new(&self.pdftocairo);
        cmd.arg("-png")
            .arg("-singlefile")
            .arg("-cropbox")
            .arg("-f")
            .arg(page_number.to_string())
            .arg("-l")
            .arg(page_number.to_string())
            .arg("-scale-to-x")
            .arg(width.to_string())
            .arg("-scale-to-y")
            .arg(height.to_string())
            .arg(&self.path)
            .arg(&out_base);
        let pdf_path = self.path.clone();
        let output = with_cpu_semaphore(move || async move {
            cmd.output().await.with_context(|| {
                format!("failed to run pdftocairo on {:?}", pdf_path.display())
            })
        })
        .await?;
        check_for_command_failure("pdftocairo", &output, Some(&is_error_line))?;

        let bytes = tokio::fs::read(&out_path)
            .await
            .with_context(|| format!("failed to read {:?}", out_path.display()))?;
        // Recover scratch space early; we only ever hold one page.
        tokio::fs::remove_file(&out_path)
            .await
            .with_context(|| format!("failed to delete {:?}", out_path.display()))?;

        spawn_blocking_propagating_panics(move || decode_rgb_png(&bytes)).await
    }
}

impl Drop for PopplerDocument {
    fn drop(&mut self) {
        if let Some(tmpdir) = self.tmpdir.take() {
            let tmpdir_path = tmpdir.path().to_owned();
            if let Err(err) = tmpdir.close() {
                error!(
                    directory = ?tmpdir_path.display(),
                    "failed to delete temporary directory: {}",
                    err
                );
            }
        }
    }
}

/// Decode a PNG and flatten it to 3-channel RGB.
///
/// Cairo writes RGBA for pages with transparency and may write gray or
/// palette images, so this always goes through `to_rgb8`.
pub fn decode_rgb_png(bytes: &[u8]) -> Result<RgbImage> {
    let image = image::load_from_memory_with_format(bytes, ImageFormat::Png)
        .context("failed to decode rendered page")?;
    Ok(image.to_rgb8())
}
