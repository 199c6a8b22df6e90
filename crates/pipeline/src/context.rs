//! Context assembly for structured extraction
//!
//! The extraction prompt carries a window of the pages most similar to the
//! one being processed, found by vector search across the whole case. The
//! page itself ranks first in its own window.

use casetrace_common::db::PageNeighbor;

/// Concatenate neighbor pages into a context window, nearest first.
/// Pages that would push the window past `max_chars` are skipped whole;
/// a truncated page reads like missing facts, not fewer pages.
pub fn assemble_context(neighbors: &[PageNeighbor], max_chars: usize) -> String {
    let mut out = String::new();

    for neighbor in neighbors {
        let header = format!("--- page {} ---\n", neighbor.page_number);
        let needed = header.len() + neighbor.page_text.len() + 2;
        if !out.is_empty() && out.len() + needed > max_chars {
            continue;
        }
        if out.is_empty() && needed > max_chars {
            continue;
        }
        out.push_str(&header);
        out.push_str(&neighbor.page_text);
        out.push_str("\n\n");
    }

    out.trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn neighbor(page_number: i32, text: &str, distance: f64) -> PageNeighbor {
        PageNeighbor {
            document_id: Uuid::new_v4(),
            page_number,
            page_text: text.to_string(),
            distance,
        }
    }

    #[test]
    fn test_context_keeps_similarity_order() {
        let neighbors = vec![
            neighbor(3, "current page text", 0.0),
            neighbor(7, "related lab report", 0.12),
            neighbor(1, "cover sheet", 0.4),
        ];

        let context = assemble_context(&neighbors, 10_000);
        let pos_self = context.find("current page text").unwrap();
        let pos_lab = context.find("related lab report").unwrap();
        let pos_cover = context.find("cover sheet").unwrap();
        assert!(pos_self < pos_lab && pos_lab < pos_cover);
    }

    #[test]
    fn test_context_marks_page_numbers() {
        let context = assemble_context(&[neighbor(5, "consult note", 0.1)], 10_000);
        assert!(context.starts_with("--- page 5 ---"));
    }

    #[test]
    fn test_context_skips_pages_that_overflow_budget() {
        let neighbors = vec![
            neighbor(1, "short", 0.0),
            neighbor(2, &"x".repeat(500), 0.1),
            neighbor(3, "also short", 0.2),
        ];

        let context = assemble_context(&neighbors, 120);
        assert!(context.contains("short"));
        assert!(!context.contains("xxxxx"));
        assert!(context.contains("also short"));
    }

    #[test]
    fn test_empty_neighbors_give_empty_context() {
        assert_eq!(assemble_context(&[], 1000), "");
    }
}
