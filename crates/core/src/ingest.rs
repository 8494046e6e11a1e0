use crate::error::{IngestError, InvalidContractId};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

const MAX_FILENAME_BYTES: usize = 255;
const PDF_SUFFIX: &str = ".pdf";

pub fn discover_pdf_files(folder: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();

    for entry in WalkDir::new(folder)
        .into_iter()
        .filter_map(|item| item.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }

        let is_pdf = entry
            .path()
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"));

        if is_pdf {
            files.push(entry.path().to_path_buf());
        }
    }

    files.sort_unstable();
    files
}

/// Content-derived identifier: lowercase hex SHA-256 of the PDF bytes.
pub fn contract_id_for(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

pub fn is_contract_id(value: &str) -> bool {
    value.len() == 64
        && value
            .bytes()
            .all(|byte| byte.is_ascii_digit() || (b'a'..=b'f').contains(&byte))
}

pub fn validate_contract_id(value: &str) -> Result<&str, InvalidContractId> {
    if is_contract_id(value) {
        Ok(value)
    } else {
        Err(InvalidContractId(value.to_string()))
    }
}

/// Reduces an uploaded name to a safe single path component ending in `.pdf`.
pub fn sanitize_filename(original: &str) -> Result<String, IngestError> {
    let base = original
        .rsplit(|ch: char| ch == '/' || ch == '\\')
        .find(|part| !part.trim().is_empty())
        .unwrap_or_default();

    let cleaned: String = base
        .chars()
        .map(|ch| match ch {
            '<' | '>' | ':' | '"' | '|' | '?' | '*' => '_',
            ch if ch.is_control() => '_',
            ch => ch,
        })
        .collect();
    let cleaned = cleaned.trim();

    let has_suffix = cleaned
        .len()
        .checked_sub(PDF_SUFFIX.len())
        .and_then(|start| cleaned.get(start..))
        .is_some_and(|suffix| suffix.eq_ignore_ascii_case(PDF_SUFFIX));
    let stem = if has_suffix {
        &cleaned[..cleaned.len() - PDF_SUFFIX.len()]
    } else {
        cleaned
    };
    let stem = stem.trim().trim_start_matches('.').trim_start();

    if stem.is_empty() {
        return Err(IngestError::InvalidArgument(format!(
            "unusable file name: {original:?}"
        )));
    }

    let mut end = stem.len().min(MAX_FILENAME_BYTES - PDF_SUFFIX.len());
    while !stem.is_char_boundary(end) {
        end -= 1;
    }

    Ok(format!("{}{}", &stem[..end], PDF_SUFFIX))
}
