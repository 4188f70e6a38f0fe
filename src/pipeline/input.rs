//! Input resolution: turn a user-supplied path or URL into a local PDF file.
//!
//! pdfium and tesseract both want real paths, so URL inputs are downloaded
//! into a `TempDir` that lives as long as the [`ResolvedInput`]. The `%PDF`
//! magic is checked up front so a wrong file type surfaces as
//! [`Ocr2MdError::NotAPdf`] rather than an opaque pdfium failure.

use crate::error::Ocr2MdError;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use tracing::{debug, info};

const PDF_MAGIC: &[u8; 4] = b"%PDF";

/// A local PDF ready for rasterisation.
#[derive(Debug)]
pub enum ResolvedInput {
    /// The caller gave a local file.
    Local(PathBuf),
    /// The caller gave a URL; the file lives in `_dir` until drop.
    Downloaded { path: PathBuf, _dir: TempDir },
}

impl ResolvedInput {
    pub fn path(&self) -> &Path {
        match self {
            ResolvedInput::Local(p) => p,
            ResolvedInput::Downloaded { path, .. } => path,
        }
    }
}

pub fn is_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

/// Resolve `input` to a local PDF, downloading it first when it is a URL.
pub async fn resolve_input(input: &str, timeout_secs: u64) -> Result<ResolvedInput, Ocr2MdError> {
    if input.trim().is_empty() {
        return Err(Ocr2MdError::InvalidInput {
            input: input.to_string(),
        });
    }
    if is_url(input) {
        download(input, timeout_secs).await
    } else {
        resolve_local(Path::new(input)).map(ResolvedInput::Local)
    }
}

fn resolve_local(path: &Path) -> Result<PathBuf, Ocr2MdError> {
    let path = path.to_path_buf();
    if !path.exists() {
        return Err(Ocr2MdError::FileNotFound { path });
    }

    let mut file = match std::fs::File::open(&path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            return Err(Ocr2MdError::PermissionDenied { path });
        }
        Err(_) => return Err(Ocr2MdError::FileNotFound { path }),
    };

    let mut magic = [0u8; 4];
    if file.read_exact(&mut magic).is_ok() && &magic != PDF_MAGIC {
        return Err(Ocr2MdError::NotAPdf { path, magic });
    }

    debug!("Resolved local PDF: {}", path.display());
    Ok(path)
}

async fn download(url: &str, timeout_secs: u64) -> Result<ResolvedInput, Ocr2MdError> {
    info!("Downloading PDF from {}", url);

    let failed = |reason: String| Ocr2MdError::DownloadFailed {
        url: url.to_string(),
        reason,
    };

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| failed(e.to_string()))?;

    let response = client.get(url).send().await.map_err(|e| {
        if e.is_timeout() {
            Ocr2MdError::DownloadTimeout {
                url: url.to_string(),
                secs: timeout_secs,
            }
        } else {
            failed(e.to_string())
        }
    })?;

    if !response.status().is_success() {
        return Err(failed(format!("HTTP {}", response.status())));
    }

    let bytes = response.bytes().await.map_err(|e| failed(e.to_string()))?;

    let dir = TempDir::new().map_err(|e| Ocr2MdError::Internal(e.to_string()))?;
    let path = dir.path().join(filename_from_url(url));

    if bytes.len() >= 4 && &bytes[..4] != PDF_MAGIC {
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&bytes[..4]);
        return Err(Ocr2MdError::NotAPdf { path, magic });
    }

    tokio::fs::write(&path, &bytes)
        .await
        .map_err(|e| Ocr2MdError::OutputWriteFailed {
            path: path.clone(),
            source: e,
        })?;

    info!("Downloaded {} bytes to {}", bytes.len(), path.display());
    Ok(ResolvedInput::Downloaded { path, _dir: dir })
}

/// Last URL path segment when it looks like a file name, else `downloaded.pdf`.
fn filename_from_url(url: &str) -> String {
    reqwest::Url::parse(url)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .and_then(|mut s| s.next_back().map(str::to_string))
        })
        .filter(|last| !last.is_empty() && last.contains('.'))
        .unwrap_or_else(|| "downloaded.pdf".to_string())
}
