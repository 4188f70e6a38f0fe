//! Rasteriser: render selected PDF pages to PNG page images.
//!
//! ## Why spawn_blocking?
//!
//! `pdfium-render` wraps the pdfium C++ library, which is CPU-bound and not
//! async-aware. All pdfium work runs inside `tokio::task::spawn_blocking` so
//! the runtime's worker threads keep driving OCR and generation calls.
//!
//! ## Ownership of page images
//!
//! Each rendered page becomes a [`PageImage`]: the PNG bytes in memory plus a
//! scoped temp file the OCR engine reads from. Dropping the `PageImage`
//! deletes the file; [`PageImage::preserve`] keeps it for manual inspection.

use crate::error::{Ocr2MdError, PageError};
use crate::output::DocumentMetadata;
use crate::pipeline::encode;
use async_trait::async_trait;
use image::DynamicImage;
use pdfium_render::prelude::*;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

/// One rasterised page, owned by the page worker until it is torn down.
#[derive(Debug)]
pub struct PageImage {
    page_num: usize,
    width: u32,
    height: u32,
    png: Vec<u8>,
    file: NamedTempFile,
}

impl PageImage {
    /// Wrap already-encoded PNG bytes, writing them to a scoped temp file.
    pub fn from_png(page_num: usize, png: Vec<u8>, width: u32, height: u32) -> std::io::Result<Self> {
        let mut file = tempfile::Builder::new()
            .prefix(&format!("ocr2md-page-{page_num}-"))
            .suffix(".png")
            .tempfile()?;
        file.write_all(&png)?;
        file.flush()?;
        Ok(Self {
            page_num,
            width,
            height,
            png,
            file,
        })
    }

    /// Encode a rendered bitmap as PNG and wrap it.
    pub fn from_image(page_num: usize, img: &DynamicImage) -> Result<Self, image::ImageError> {
        let png = encode::png_bytes(img)?;
        Self::from_png(page_num, png, img.width(), img.height()).map_err(image::ImageError::IoError)
    }

    /// 1-indexed page number.
    pub fn page_num(&self) -> usize {
        self.page_num
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn png(&self) -> &[u8] {
        &self.png
    }

    /// On-disk location of the PNG, valid while `self` lives.
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Keep the temp file on disk and return its path.
    pub fn preserve(self) -> std::io::Result<PathBuf> {
        let (_file, path) = self.file.keep().map_err(|e| e.error)?;
        Ok(path)
    }
}

/// Render-stage contract.
///
/// `render` returns one entry per requested page, in the requested order. A
/// document that cannot be opened is fatal; a single page that fails to render
/// is reported in its own slot.
#[async_trait]
pub trait Rasterizer: Send + Sync {
    /// Read metadata (page count, title…) without rendering.
    async fn inspect(&self, pdf_path: &Path) -> Result<DocumentMetadata, Ocr2MdError>;

    async fn page_count(&self, pdf_path: &Path) -> Result<usize, Ocr2MdError> {
        Ok(self.inspect(pdf_path).await?.page_count)
    }

    /// Render the given 1-indexed pages at `dpi`.
    async fn render(
        &self,
        pdf_path: &Path,
        pages: &[usize],
        dpi: u32,
    ) -> Result<Vec<Result<PageImage, PageError>>, Ocr2MdError>;
}

/// pdfium-backed rasteriser.
#[derive(Debug, Clone)]
pub struct PdfiumRasterizer {
    /// Cap on the longest rendered edge, in pixels.
    pub max_rendered_pixels: u32,
    /// PDF user password for encrypted documents.
    pub password: Option<String>,
}

impl PdfiumRasterizer {
    pub fn new(max_rendered_pixels: u32) -> Self {
        Self {
            max_rendered_pixels,
            password: None,
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }
}

#[async_trait]
impl Rasterizer for PdfiumRasterizer {
    async fn inspect(&self, pdf_path: &Path) -> Result<DocumentMetadata, Ocr2MdError> {
        let path = pdf_path.to_path_buf();
        let password = self.password.clone();
        tokio::task::spawn_blocking(move || inspect_blocking(&path, password.as_deref()))
            .await
            .map_err(|e| Ocr2MdError::Internal(format!("Metadata task panicked: {}", e)))?
    }

    async fn render(
        &self,
        pdf_path: &Path,
        pages: &[usize],
        dpi: u32,
    ) -> Result<Vec<Result<PageImage, PageError>>, Ocr2MdError> {
        let path = pdf_path.to_path_buf();
        let password = self.password.clone();
        let max_pixels = self.max_rendered_pixels;
        let pages = pages.to_vec();

        tokio::task::spawn_blocking(move || {
            render_blocking(&path, dpi, max_pixels, password.as_deref(), &pages)
        })
        .await
        .map_err(|e| Ocr2MdError::Internal(format!("Render task panicked: {}", e)))?
    }
}

/// Bind pdfium: `PDFIUM_LIB_PATH`, then next to the executable, then the system library.
fn bind_pdfium() -> Result<Pdfium, Ocr2MdError> {
    let exe_dir = std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("./"));

    let bindings = match std::env::var("PDFIUM_LIB_PATH") {
        Ok(path) if !path.is_empty() => Pdfium::bind_to_library(&path),
        _ => Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path(&exe_dir))
            .or_else(|_| Pdfium::bind_to_system_library()),
    }
    .map_err(|e| Ocr2MdError::PdfiumBindingFailed(format!("{:?}", e)))?;
    Ok(Pdfium::new(bindings))
}

fn load_error(pdf_path: &Path, password: Option<&str>, e: PdfiumError) -> Ocr2MdError {
    let detail = format!("{:?}", e);
    let detail = if detail.to_lowercase().contains("password") {
        if password.is_some() {
            "wrong password".to_string()
        } else {
            "document is encrypted and requires a password".to_string()
        }
    } else {
        detail
    };
    Ocr2MdError::InvalidDocument {
        path: pdf_path.to_path_buf(),
        detail,
    }
}

fn render_blocking(
    pdf_path: &Path,
    dpi: u32,
    max_pixels: u32,
    password: Option<&str>,
    page_nums: &[usize],
) -> Result<Vec<Result<PageImage, PageError>>, Ocr2MdError> {
    let pdfium = bind_pdfium()?;
    let document = pdfium
        .load_pdf_from_file(pdf_path, password)
        .map_err(|e| load_error(pdf_path, password, e))?;

    let pages = document.pages();
    let total_pages = pages.len() as usize;
    info!("PDF loaded: {} pages, rendering {} at {} DPI", total_pages, page_nums.len(), dpi);

    let render_config = PdfRenderConfig::new()
        .scale_page_by_factor(dpi as f32 / 72.0)
        .set_maximum_width(max_pixels as i32)
        .set_maximum_height(max_pixels as i32);

    let mut results = Vec::with_capacity(page_nums.len());

    for &page_num in page_nums {
        check_page_in_range(page_num, total_pages)?;

        let rendered = render_page(&pages, page_num, &render_config);

        match rendered {
            Ok(img) => results.push(Ok(img)),
            Err(detail) => {
                warn!("Page {}: rasterisation failed: {}", page_num, detail);
                results.push(Err(PageError::RenderFailed {
                    page: page_num,
                    detail,
                }));
            }
        }
    }

    Ok(results)
}

/// Selected pages are validated before rendering; a page outside the
/// document is fatal for the whole run.
fn check_page_in_range(page_num: usize, total_pages: usize) -> Result<(), Ocr2MdError> {
    if page_num == 0 || page_num > total_pages {
        return Err(Ocr2MdError::PageRange {
            detail: format!("page {page_num} is out of range"),
            total: total_pages,
        });
    }
    Ok(())
}

/// Render one 1-based page. The `PdfPage` stays bound for as long as the
/// bitmap that borrows it.
fn render_page(
    pages: &PdfPages<'_>,
    page_num: usize,
    render_config: &PdfRenderConfig,
) -> Result<PageImage, String> {
    let page = pages
        .get((page_num - 1) as u16)
        .map_err(|e| format!("{:?}", e))?;
    let bitmap = page
        .render_with_config(render_config)
        .map_err(|e| format!("{:?}", e))?;

    let image = bitmap.as_image();
    debug!(
        "Rendered page {} → {}x{} px",
        page_num,
        image.width(),
        image.height()
    );
    PageImage::from_image(page_num, &image).map_err(|e| e.to_string())
}

fn inspect_blocking(
    pdf_path: &Path,
    password: Option<&str>,
) -> Result<DocumentMetadata, Ocr2MdError> {
    let pdfium = bind_pdfium()?;
    let document = pdfium
        .load_pdf_from_file(pdf_path, password)
        .map_err(|e| load_error(pdf_path, password, e))?;

    let metadata = document.metadata();
    let get_meta = |tag: PdfDocumentMetadataTagType| -> Option<String> {
        metadata.get(tag).and_then(|t| {
            let v = t.value().to_string();
            if v.is_empty() {
                None
            } else {
                Some(v)
            }
        })
    };

    Ok(DocumentMetadata {
        title: get_meta(PdfDocumentMetadataTagType::Title),
        author: get_meta(PdfDocumentMetadataTagType::Author),
        subject: get_meta(PdfDocumentMetadataTagType::Subject),
        creator: get_meta(PdfDocumentMetadataTagType::Creator),
        producer: get_meta(PdfDocumentMetadataTagType::Producer),
        creation_date: get_meta(PdfDocumentMetadataTagType::CreationDate),
        modification_date: get_meta(PdfDocumentMetadataTagType::ModificationDate),
        page_count: document.pages().len() as usize,
        pdf_version: format!("{:?}", document.version()),
    })
}
