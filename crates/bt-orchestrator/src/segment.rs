//! Document segmentation
//!
//! A document is cut into [`Segment`]s no longer than `max_chars`
//! characters. Whitespace never starts or ends a text segment: every
//! whitespace run the splitter cuts at becomes a gap segment holding the
//! original characters, so concatenating all segments reproduces the input
//! exactly and a translator that trims its output cannot eat the spacing.
//!
//! Cuts are taken at the coarsest boundary that makes the pieces fit:
//! paragraph breaks (a whitespace run with two or more newlines) first,
//! then line breaks, then spaces between words. A single word longer than
//! `max_chars` is the only thing ever cut mid-word.

use std::ops::Range;

/// Kind of a segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    /// Translatable text; never starts or ends with whitespace
    Text,
    /// Whitespace between text segments, copied through untouched
    Gap,
}

/// One piece of a document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// Position in the document
    pub index: usize,
    pub kind: SegmentKind,
    pub text: String,
}

impl Segment {
    /// Whether the segment is sent to a worker
    pub fn is_translatable(&self) -> bool {
        self.kind == SegmentKind::Text
    }

    /// Length in characters
    pub fn char_len(&self) -> usize {
        self.text.chars().count()
    }
}

/// Boundary strength of a whitespace run
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Boundary {
    Word,
    Line,
    Paragraph,
}

impl Boundary {
    fn of(whitespace: &str) -> Self {
        match whitespace.matches('\n').count() {
            0 => Boundary::Word,
            1 => Boundary::Line,
            _ => Boundary::Paragraph,
        }
    }

    fn finer(self) -> Option<Self> {
        match self {
            Boundary::Paragraph => Some(Boundary::Line),
            Boundary::Line => Some(Boundary::Word),
            Boundary::Word => None,
        }
    }
}

enum Span {
    Text(Range<usize>),
    Gap(Range<usize>),
}

/// Split `document` into segments of at most `max_chars` characters
///
/// Deterministic: the same document and limit always give the same
/// segments. An empty document gives no segments.
pub fn split_document(document: &str, max_chars: usize) -> Vec<Segment> {
    let max_chars = max_chars.max(1);
    let mut spans = Vec::new();

    let start = document.len() - document.trim_start().len();
    let end = document.trim_end().len();
    if start > 0 {
        spans.push(Span::Gap(0..start));
    }
    if start < end {
        pack(document, start..end, Boundary::Paragraph, max_chars, &mut spans);
        if end < document.len() {
            spans.push(Span::Gap(end..document.len()));
        }
    }

    spans
        .into_iter()
        .enumerate()
        .map(|(index, span)| match span {
            Span::Text(range) => Segment {
                index,
                kind: SegmentKind::Text,
                text: document[range].to_string(),
            },
            Span::Gap(range) => Segment {
                index,
                kind: SegmentKind::Gap,
                text: document[range].to_string(),
            },
        })
        .collect()
}

/// Concatenate segment texts in index order
pub fn concat(segments: &[Segment]) -> String {
    segments.iter().map(|s| s.text.as_str()).collect()
}

/// Greedily pack the units of `range` separated at `boundary` or coarser
///
/// `range` is trimmed: it starts and ends with a non-whitespace character.
fn pack(document: &str, range: Range<usize>, boundary: Boundary, max_chars: usize, out: &mut Vec<Span>) {
    if chars(document, &range) <= max_chars {
        out.push(Span::Text(range));
        return;
    }

    let (units, gaps) = split_at(document, range.clone(), boundary);
    if units.len() == 1 {
        match boundary.finer() {
            Some(finer) => pack(document, range, finer, max_chars, out),
            None => hard_cut(document, range, max_chars, out),
        }
        return;
    }

    let mut group: Option<Range<usize>> = None;
    for (i, unit) in units.into_iter().enumerate() {
        if let Some(current) = group.take() {
            let extended = current.start..unit.end;
            if chars(document, &extended) <= max_chars {
                group = Some(extended);
                continue;
            }
            out.push(Span::Text(current));
        }
        if i > 0 {
            out.push(Span::Gap(gaps[i - 1].clone()));
        }

        if chars(document, &unit) <= max_chars {
            group = Some(unit);
        } else {
            match boundary.finer() {
                Some(finer) => pack(document, unit, finer, max_chars, out),
                None => hard_cut(document, unit, max_chars, out),
            }
        }
    }
    if let Some(current) = group {
        out.push(Span::Text(current));
    }
}

/// Cut a single over-long word into `max_chars` pieces
fn hard_cut(document: &str, range: Range<usize>, max_chars: usize, out: &mut Vec<Span>) {
    let text = &document[range.clone()];
    let mut piece_start = 0;
    for (count, (offset, _)) in text.char_indices().enumerate() {
        if count > 0 && count % max_chars == 0 {
            out.push(Span::Text(range.start + piece_start..range.start + offset));
            piece_start = offset;
        }
    }
    out.push(Span::Text(range.start + piece_start..range.end));
}

/// Split a trimmed range at whitespace runs of at least `boundary` strength
///
/// Returns the units and the `units.len() - 1` gaps between them.
fn split_at(document: &str, range: Range<usize>, boundary: Boundary) -> (Vec<Range<usize>>, Vec<Range<usize>>) {
    let text = &document[range.clone()];
    let mut units = Vec::new();
    let mut gaps = Vec::new();
    let mut unit_start = 0;
    let mut run_start: Option<usize> = None;

    for (offset, c) in text.char_indices() {
        match (c.is_whitespace(), run_start) {
            (true, None) => run_start = Some(offset),
            (false, Some(ws)) => {
                run_start = None;
                if Boundary::of(&text[ws..offset]) >= boundary {
                    units.push(range.start + unit_start..range.start + ws);
                    gaps.push(range.start + ws..range.start + offset);
                    unit_start = offset;
                }
            }
            _ => {}
        }
    }
    units.push(range.start + unit_start..range.end);
    (units, gaps)
}

fn chars(document: &str, range: &Range<usize>) -> usize {
    document[range.clone()].chars().count()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texts(segments: &[Segment]) -> Vec<&str> {
        segments
            .iter()
            .filter(|s| s.is_translatable())
            .map(|s| s.text.as_str())
            .collect()
    }

    fn assert_well_formed(document: &str, max: usize) {
        let segments = split_document(document, max);
        assert_eq!(concat(&segments), document);
        for (i, segment) in segments.iter().enumerate() {
            assert_eq!(segment.index, i);
            assert!(!segment.text.is_empty());
            match segment.kind {
                SegmentKind::Text => {
                    assert!(segment.char_len() <= max, "{:?} exceeds {}", segment.text, max);
                    assert_eq!(segment.text.trim(), segment.text);
                }
                SegmentKind::Gap => assert!(segment.text.trim().is_empty()),
            }
        }
    }

    #[test]
    fn test_empty_document() {
        assert!(split_document("", 100).is_empty());
    }

    #[test]
    fn test_whitespace_only_document() {
        let segments = split_document("\n\n  \n", 100);
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].kind, SegmentKind::Gap);
        assert_eq!(concat(&segments), "\n\n  \n");
    }

    #[test]
    fn test_short_document_is_one_segment() {
        let segments = split_document("Hello, world.", 100);
        assert_eq!(texts(&segments), vec!["Hello, world."]);
    }

    #[test]
    fn test_paragraphs_are_packed() {
        let doc = "one\n\ntwo\n\nthree";
        let segments = split_document(doc, 10);
        assert_eq!(texts(&segments), vec!["one\n\ntwo", "three"]);
        assert_eq!(segments[1].text, "\n\n");
        assert_eq!(concat(&segments), doc);
    }

    #[test]
    fn test_paragraph_gaps_are_separate_segments() {
        let doc = format!("{}\n\n\n{}", "a".repeat(60), "b".repeat(60));
        let segments = split_document(&doc, 100);
        assert_eq!(segments.len(), 3);
        assert_eq!(segments[1].kind, SegmentKind::Gap);
        assert_eq!(segments[1].text, "\n\n\n");
    }

    #[test]
    fn test_long_paragraph_splits_at_lines() {
        let doc = "first line here\nsecond line here\nthird";
        let segments = split_document(doc, 20);
        assert_eq!(
            texts(&segments),
            vec!["first line here", "second line here", "third"]
        );
        assert_eq!(concat(&segments), doc);
    }

    #[test]
    fn test_long_line_splits_at_words() {
        let doc = "alpha beta gamma delta epsilon";
        let segments = split_document(doc, 11);
        assert_eq!(texts(&segments), vec!["alpha beta", "gamma delta", "epsilon"]);
        assert_well_formed(doc, 11);
    }

    #[test]
    fn test_only_oversized_words_are_cut() {
        let doc = "a supercalifragilistic word";
        let segments = split_document(doc, 8);
        assert_eq!(
            texts(&segments),
            vec!["a", "supercal", "ifragili", "stic", "word"]
        );
        assert_eq!(concat(&segments), doc);
    }

    #[test]
    fn test_counts_characters_not_bytes() {
        let doc = "Пушкин родился в Москве.\n\nОн писал стихи.";
        assert_well_formed(doc, 25);
        let segments = split_document(doc, 25);
        assert_eq!(texts(&segments).len(), 2);
    }

    #[test]
    fn test_leading_and_trailing_whitespace_preserved() {
        let doc = "\n\n  Title\n\nBody text.\n";
        let segments = split_document(doc, 5);
        assert_eq!(segments.first().unwrap().kind, SegmentKind::Gap);
        assert_eq!(segments.last().unwrap().text, "\n");
        assert_well_formed(doc, 5);
    }

    #[test]
    fn test_crlf_paragraphs() {
        let doc = "first paragraph\r\n\r\nsecond paragraph";
        let segments = split_document(doc, 20);
        assert_eq!(texts(&segments), vec!["first paragraph", "second paragraph"]);
        assert_eq!(segments[1].text, "\r\n\r\n");
    }

    #[test]
    fn test_deterministic() {
        let doc = "lorem ipsum dolor sit amet\nconsectetur\n\nadipiscing elit sed do";
        assert_eq!(split_document(doc, 12), split_document(doc, 12));
    }

    #[test]
    fn test_roundtrip_over_limits() {
        let doc = "Chapter 1\n\n   It was a bright cold day in April, and the clocks were striking thirteen.\n\
                   Winston Smith, his chin nuzzled into his breast,\tslipped quickly through the glass doors.\n\n\n\
                   Ünïcödé ✓ «text» with a verylongwordthatcannotbesplitanywhereelse.  \n";
        for max in [1, 3, 7, 16, 40, 100, 1000] {
            assert_well_formed(doc, max);
        }
    }
}
