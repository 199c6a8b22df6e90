//! Native PDF text handling
//!
//! Per-page text extraction from the PDF content stream, page counting, and
//! single-page slicing for the OCR fallback paths.

use casetrace_common::errors::{AppError, Result};
use tracing::debug;

/// Number of pages in a PDF
pub fn count_pdf_pages(bytes: &[u8]) -> Result<usize> {
    let doc = load(bytes)?;
    Ok(doc.get_pages().len())
}

/// Extract native text from one page (1-based). Returns None when the page
/// carries no extractable text, which is the signal to fall back to OCR.
pub fn extract_page_text(bytes: &[u8], page_number: u32) -> Result<Option<String>> {
    let doc = load(bytes)?;
    let pages = doc.get_pages();
    let page_id = *pages
        .get(&page_number)
        .ok_or_else(|| AppError::Pdf {
            message: format!("Page {} not found ({} pages)", page_number, pages.len()),
        })?;

    let content = doc.get_page_content(page_id).map_err(|e| AppError::Pdf {
        message: format!("Failed to read content of page {}: {}", page_number, e),
    })?;

    let text = clean_text(&extract_text_from_content(&content));
    debug!(page_number, chars = text.len(), "Native extraction finished");

    if text.trim().is_empty() {
        Ok(None)
    } else {
        Ok(Some(text))
    }
}

/// Cut a single page (1-based) out of a PDF, producing a standalone
/// single-page document for the OCR engines.
pub fn slice_page(bytes: &[u8], page_number: u32) -> Result<Vec<u8>> {
    let mut doc = load(bytes)?;
    let others: Vec<u32> = doc
        .get_pages()
        .keys()
        .copied()
        .filter(|n| *n != page_number)
        .collect();

    if doc.get_pages().len() == others.len() {
        return Err(AppError::Pdf {
            message: format!("Page {} not found while slicing", page_number),
        });
    }

    doc.delete_pages(&others);
    doc.prune_objects();

    let mut out = Vec::new();
    doc.save_to(&mut out).map_err(|e| AppError::Pdf {
        message: format!("Failed to serialize sliced page {}: {}", page_number, e),
    })?;
    Ok(out)
}

fn load(bytes: &[u8]) -> Result<lopdf::Document> {
    lopdf::Document::load_mem(bytes).map_err(|e| AppError::Pdf {
        message: format!("Failed to load PDF: {}", e),
    })
}

/// Extract text from a PDF content stream.
///
/// Walks BT/ET text blocks and collects the arguments of the text-showing
/// operators (Tj, TJ, ', ").
fn extract_text_from_content(content: &[u8]) -> String {
    let content_str = String::from_utf8_lossy(content);
    let mut text = String::new();
    let mut in_text_block = false;
    let mut current_text = String::new();

    for line in content_str.lines() {
        let trimmed = line.trim();

        if trimmed == "BT" {
            in_text_block = true;
            continue;
        }

        if trimmed == "ET" {
            in_text_block = false;
            if !current_text.is_empty() {
                text.push_str(&current_text);
                text.push(' ');
                current_text.clear();
            }
            continue;
        }

        if in_text_block {
            if let Some(text_content) = extract_text_from_operator(trimmed) {
                current_text.push_str(&text_content);
                current_text.push(' ');
            }
        }
    }

    text
}

/// Extract text from a single text-showing operator line
fn extract_text_from_operator(line: &str) -> Option<String> {
    // (text) Tj and the quote variants
    if line.ends_with("Tj") || line.ends_with('\'') || line.ends_with('"') {
        if let (Some(start), Some(end)) = (line.find('('), line.rfind(')')) {
            if start < end {
                return Some(decode_pdf_string(&line[start + 1..end]));
            }
        }
    }

    // [(text) num (text) num] TJ
    if line.ends_with("TJ") {
        let mut result = String::new();
        let mut in_paren = false;
        let mut current = String::new();

        for ch in line.chars() {
            match ch {
                '(' => in_paren = true,
                ')' => {
                    in_paren = false;
                    result.push_str(&decode_pdf_string(&current));
                    current.clear();
                }
                _ if in_paren => current.push(ch),
                _ => {}
            }
        }

        if !result.is_empty() {
            return Some(result);
        }
    }

    None
}

/// Decode PDF string escapes
fn decode_pdf_string(s: &str) -> String {
    let mut result = String::new();
    let mut chars = s.chars();

    while let Some(ch) = chars.next() {
        if ch == '\\' {
            match chars.next() {
                Some('n') => result.push('\n'),
                Some('r') => result.push('\r'),
                Some('t') => result.push('\t'),
                Some('\\') => result.push('\\'),
                Some('(') => result.push('('),
                Some(')') => result.push(')'),
                Some(c) => result.push(c),
                None => {}
            }
        } else {
            result.push(ch);
        }
    }

    result
}

/// Collapse whitespace and strip common PDF artifacts
fn clean_text(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .replace('\u{FEFF}', "")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::sample_pdf;

    #[test]
    fn test_count_pages() {
        let bytes = sample_pdf(&["first page", "second page", "third page"]);
        assert_eq!(count_pdf_pages(&bytes).unwrap(), 3);
    }

    #[test]
    fn test_extract_page_text_finds_page_content() {
        let bytes = sample_pdf(&["Progress note for DIAZ", "Lab results attached"]);
        let text = extract_page_text(&bytes, 1).unwrap().unwrap();
        assert!(text.contains("Progress note for DIAZ"));

        let text = extract_page_text(&bytes, 2).unwrap().unwrap();
        assert!(text.contains("Lab results attached"));
    }

    #[test]
    fn test_extract_empty_page_returns_none() {
        let bytes = sample_pdf(&[""]);
        assert!(extract_page_text(&bytes, 1).unwrap().is_none());
    }

    #[test]
    fn test_extract_out_of_range_page_errors() {
        let bytes = sample_pdf(&["only page"]);
        assert!(extract_page_text(&bytes, 5).is_err());
    }

    #[test]
    fn test_slice_page_produces_single_page_pdf() {
        let bytes = sample_pdf(&["page one", "page two", "page three"]);
        let sliced = slice_page(&bytes, 2).unwrap();

        assert_eq!(count_pdf_pages(&sliced).unwrap(), 1);
        let text = extract_page_text(&sliced, 1).unwrap().unwrap();
        assert!(text.contains("page two"));
    }

    #[test]
    fn test_garbage_bytes_are_a_pdf_error() {
        let err = count_pdf_pages(b"definitely not a pdf").unwrap_err();
        assert!(matches!(err, AppError::Pdf { .. }));
    }

    #[test]
    fn test_decode_pdf_string_escapes() {
        assert_eq!(decode_pdf_string("Hello\\nWorld"), "Hello\nWorld");
        assert_eq!(decode_pdf_string("Test\\(paren\\)"), "Test(paren)");
    }

    #[test]
    fn test_clean_text_collapses_whitespace() {
        assert_eq!(clean_text("Hello   World\n\nTest"), "Hello World Test");
    }
}
