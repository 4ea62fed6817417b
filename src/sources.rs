use std::collections::HashSet;

use regex::Regex;

use crate::models::Citation;

const SOURCES_HEADER: &str = "\n\n**Sources**:\n";

/// Renders the deduplicated source list for a set of citations.
///
/// Chunk- or page-qualified PDF names like `report.chunk1.pdf` collapse to
/// their base document name `report.pdf`; every other URL is displayed
/// unmodified. Returns an empty string when there are no citations.
pub fn format_sources(citations: &[Citation]) -> String {
    if citations.is_empty() {
        return String::new();
    }

    let pdf_chunk =
        Regex::new(r"([^/]+)\.[^.]+\.pdf$").unwrap_or_else(|_| Regex::new("^$").unwrap());

    let mut seen = HashSet::new();
    let mut block = String::from(SOURCES_HEADER);
    for citation in citations {
        let url = citation.metadata.url.as_str();
        let display = match pdf_chunk.captures(url) {
            Some(caps) => format!("{}.pdf", &caps[1]),
            None => url.to_string(),
        };
        if seen.insert(display.clone()) {
            block.push_str(&format!("- {display}\n"));
        }
    }

    block
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CitationMetadata;

    fn citation(url: &str) -> Citation {
        Citation {
            snippet: String::new(),
            metadata: CitationMetadata {
                url: url.to_string(),
                ..Default::default()
            },
        }
    }

    fn bullets(block: &str) -> HashSet<String> {
        block
            .lines()
            .filter_map(|line| line.strip_prefix("- "))
            .map(|source| source.to_string())
            .collect()
    }

    #[test]
    fn chunked_pdf_names_collapse_and_dedupe() {
        let block = format_sources(&[
            citation("docs/report.chunk1.pdf"),
            citation("docs/report.chunk2.pdf"),
        ]);

        assert!(block.starts_with("\n\n**Sources**:\n"));
        assert_eq!(bullets(&block), HashSet::from(["report.pdf".to_string()]));
    }

    #[test]
    fn empty_citations_produce_no_block() {
        assert_eq!(format_sources(&[]), "");
    }

    #[test]
    fn non_pdf_urls_pass_through() {
        let block = format_sources(&[citation("https://example.com/page")]);
        assert_eq!(
            bullets(&block),
            HashSet::from(["https://example.com/page".to_string()])
        );
    }

    #[test]
    fn single_extension_pdf_is_not_rewritten() {
        let block = format_sources(&[citation("docs/a.pdf")]);
        assert_eq!(bullets(&block), HashSet::from(["docs/a.pdf".to_string()]));
    }

    #[test]
    fn mixed_sources_keep_set_of_unique_displays() {
        let block = format_sources(&[
            citation("docs/report.chunk1.pdf"),
            citation("https://example.com/page"),
            citation("docs/report.chunk9.pdf"),
            citation("https://example.com/page"),
        ]);

        assert_eq!(
            bullets(&block),
            HashSet::from([
                "report.pdf".to_string(),
                "https://example.com/page".to_string()
            ])
        );
    }
}
