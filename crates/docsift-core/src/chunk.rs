//! Token-bounded paragraph chunker.
//!
//! Splits document text into [`ChunkDraft`]s that respect a `max_tokens`
//! budget, carry an optional word overlap from their predecessor, and are
//! classified as code, info, or mixed.
//!
//! # Algorithm
//!
//! 1. Split text on blank lines into trimmed paragraphs.
//! 2. Accumulate paragraphs into a buffer. When adding the next paragraph
//!    would push the estimate over `max_tokens` and the buffer already holds
//!    at least one paragraph, emit the buffer as a chunk.
//! 3. Seed the next buffer with the trailing words of the emitted chunk
//!    (at most `overlap_tokens` worth, and never so many that the seed plus
//!    the next paragraph would exceed the budget).
//! 4. A paragraph that alone exceeds the budget is emitted whole.
//!
//! Token counts are estimated as `floor(words * 1.3)`. The estimate is
//! additive over words, so budget checks work on word counts directly.
//!
//! # Example
//!
//! ```rust
//! use docsift_core::chunk::chunk_text;
//!
//! let chunks = chunk_text("Hello world.\n\nSecond paragraph.", 512, 0);
//! assert_eq!(chunks.len(), 1);
//! assert_eq!(chunks[0].index, 0);
//! ```

use crate::models::{ChunkDraft, ChunkType};

/// Estimated tokens per whitespace-separated word.
const TOKENS_PER_WORD: f64 = 1.3;

const PARAGRAPH_SEPARATOR: &str = "\n\n";

/// Language recorded for a fenced block without an info string.
const UNTAGGED_FENCE_LANGUAGE: &str = "markdown";

/// Line prefixes that indicate source code or API reference material.
const CODE_MARKERS: &[&str] = &[
    "fn ",
    "pub fn ",
    "func ",
    "function ",
    "def ",
    "class ",
    "import ",
    "package ",
    "module ",
    "GET ",
    "POST ",
    "PUT ",
    "PATCH ",
    "DELETE ",
    "@param",
    "@return",
    "@throws",
];

/// Estimate the token count of `text`.
pub fn estimate_tokens(text: &str) -> usize {
    words_to_tokens(text.split_whitespace().count())
}

fn words_to_tokens(words: usize) -> usize {
    (words as f64 * TOKENS_PER_WORD) as usize
}

/// Split text into trimmed paragraphs separated by blank lines.
///
/// A blank line is one that is empty or whitespace-only.
pub fn split_paragraphs(text: &str) -> Vec<&str> {
    let mut paragraphs = Vec::new();
    let mut start: Option<usize> = None;
    let mut end = 0;
    let mut offset = 0;

    for line in text.split_inclusive('\n') {
        if line.trim().is_empty() {
            if let Some(s) = start.take() {
                paragraphs.push(text[s..end].trim());
            }
        } else {
            if start.is_none() {
                start = Some(offset);
            }
            end = offset + line.len();
        }
        offset += line.len();
    }
    if let Some(s) = start {
        paragraphs.push(text[s..end].trim());
    }

    paragraphs
}

/// Split `text` into ordered chunk drafts.
///
/// # Guarantees
///
/// - Empty or whitespace-only input yields no chunks.
/// - Indices are contiguous: `0, 1, …, N-1`.
/// - No chunk's estimate exceeds `max_tokens` unless it consists of a single
///   paragraph that alone exceeds it.
/// - For `overlap_tokens > 0`, every chunk after the first starts with a
///   non-empty word span copied from the end of its predecessor, unless the
///   next paragraph alone leaves no room under the budget.
pub fn chunk_text(text: &str, max_tokens: usize, overlap_tokens: usize) -> Vec<ChunkDraft> {
    let mut drafts = Vec::new();
    let mut headings = HeadingTracker::default();

    let mut buf = String::new();
    let mut buf_words = 0usize;
    let mut overlap_len = 0usize;
    let mut has_own_content = false;

    for para in split_paragraphs(text) {
        let para_words = para.split_whitespace().count();

        if has_own_content && words_to_tokens(buf_words + para_words) > max_tokens {
            let emitted = std::mem::take(&mut buf);
            let seed = overlap_seed(&emitted, overlap_tokens, para_words, max_tokens);
            drafts.push(build_draft(drafts.len(), emitted.clone(), overlap_len, &headings));

            buf_words = seed.split_whitespace().count();
            if seed.is_empty() {
                overlap_len = 0;
            } else {
                buf.push_str(seed);
                buf.push_str(PARAGRAPH_SEPARATOR);
                overlap_len = buf.len();
            }
            has_own_content = false;
        }

        if has_own_content {
            buf.push_str(PARAGRAPH_SEPARATOR);
        }
        buf.push_str(para);
        buf_words += para_words;
        has_own_content = true;
        headings.observe(para);
    }

    if has_own_content {
        drafts.push(build_draft(drafts.len(), buf, overlap_len, &headings));
    }

    drafts
}

/// Trailing words of `emitted` to carry into the next chunk.
fn overlap_seed(emitted: &str, overlap_tokens: usize, next_words: usize, max_tokens: usize) -> &str {
    if overlap_tokens == 0 {
        return "";
    }
    let starts = word_starts(emitted);
    let mut n = ((overlap_tokens as f64 / TOKENS_PER_WORD) as usize)
        .max(1)
        .min(starts.len());
    while n > 0 && words_to_tokens(n + next_words) > max_tokens {
        n -= 1;
    }
    if n == 0 {
        return "";
    }
    emitted[starts[starts.len() - n]..].trim_end()
}

/// Byte offsets at which each whitespace-separated word begins.
fn word_starts(text: &str) -> Vec<usize> {
    let mut starts = Vec::new();
    let mut prev_ws = true;
    for (i, c) in text.char_indices() {
        let ws = c.is_whitespace();
        if !ws && prev_ws {
            starts.push(i);
        }
        prev_ws = ws;
    }
    starts
}

fn build_draft(
    index: usize,
    text: String,
    overlap_len: usize,
    headings: &HeadingTracker,
) -> ChunkDraft {
    let (code, language) = match first_code_block(&text) {
        Some((code, lang)) => (Some(code), lang),
        None => (None, None),
    };
    ChunkDraft {
        index,
        token_count: estimate_tokens(&text),
        chunk_type: classify(&text),
        title: headings.path(),
        code,
        language,
        overlap_len,
        text,
    }
}

/// Classify chunk content.
///
/// A fenced block always makes the chunk `Code`. Otherwise a line starting
/// with a code marker is a code signal, and heading lines or sentence-like
/// prose lines are a prose signal: both together give `Mixed`, the code
/// signal alone gives `Code`. Inline code spans in otherwise plain prose
/// give `Mixed`; everything else is `Info`.
pub fn classify(text: &str) -> ChunkType {
    if text.contains("```") {
        return ChunkType::Code;
    }

    let mut code_signal = false;
    let mut prose_signal = false;
    let mut inline_code = false;

    for line in text.lines() {
        let line = line.trim_start();
        if line.is_empty() {
            continue;
        }
        if heading_level(line).is_some() {
            prose_signal = true;
            continue;
        }
        if CODE_MARKERS.iter().any(|m| line.starts_with(m)) {
            code_signal = true;
            continue;
        }
        if line.matches('`').count() >= 2 {
            inline_code = true;
        }
        if is_sentence(line) {
            prose_signal = true;
        }
    }

    match (code_signal, prose_signal, inline_code) {
        (true, true, _) => ChunkType::Mixed,
        (true, false, _) => ChunkType::Code,
        (false, _, true) => ChunkType::Mixed,
        _ => ChunkType::Info,
    }
}

fn is_sentence(line: &str) -> bool {
    line.split_whitespace().count() >= 4 && line.ends_with(['.', '!', '?', ':'])
}

/// Markdown ATX heading level (`#` through `######` followed by a space).
fn heading_level(line: &str) -> Option<usize> {
    let hashes = line.bytes().take_while(|b| *b == b'#').count();
    if (1..=6).contains(&hashes) && line[hashes..].starts_with(' ') {
        Some(hashes)
    } else {
        None
    }
}

/// Content and language of the first fenced code block, if any. A fence
/// without an info string is tagged `markdown`; an unterminated fence runs
/// to the end of the text.
fn first_code_block(text: &str) -> Option<(String, Option<String>)> {
    let mut lines = text.lines();
    let info = loop {
        let line = lines.next()?.trim_start();
        if let Some(rest) = line.strip_prefix("```") {
            break rest.trim();
        }
    };

    let mut body = Vec::new();
    for line in lines {
        if line.trim_start().starts_with("```") {
            break;
        }
        body.push(line);
    }

    let language = info
        .split_whitespace()
        .next()
        .map(|l| l.to_ascii_lowercase())
        .unwrap_or_else(|| UNTAGGED_FENCE_LANGUAGE.to_string());
    Some((body.join("\n"), Some(language)))
}

/// Tracks the markdown heading path across paragraphs, ignoring lines
/// inside fenced blocks.
#[derive(Default)]
struct HeadingTracker {
    stack: Vec<(usize, String)>,
    in_fence: bool,
}

impl HeadingTracker {
    fn observe(&mut self, paragraph: &str) {
        for line in paragraph.lines() {
            let line = line.trim_start();
            if line.starts_with("```") {
                self.in_fence = !self.in_fence;
                continue;
            }
            if self.in_fence {
                continue;
            }
            if let Some(level) = heading_level(line) {
                let title = line[level..].trim().trim_end_matches('#').trim();
                if title.is_empty() {
                    continue;
                }
                while self.stack.last().is_some_and(|(l, _)| *l >= level) {
                    self.stack.pop();
                }
                self.stack.push((level, title.to_string()));
            }
        }
    }

    fn path(&self) -> Option<String> {
        if self.stack.is_empty() {
            return None;
        }
        Some(
            self.stack
                .iter()
                .map(|(_, t)| t.as_str())
                .collect::<Vec<_>>()
                .join(" > "),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words(n: usize, prefix: &str) -> String {
        (0..n)
            .map(|i| format!("{}{}", prefix, i))
            .collect::<Vec<_>>()
            .join(" ")
    }

    #[test]
    fn test_empty_text_yields_no_chunks() {
        assert!(chunk_text("", 100, 10).is_empty());
        assert!(chunk_text("  \n\n \t\n", 100, 10).is_empty());
    }

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("one"), 1);
        assert_eq!(estimate_tokens("one two three four"), 5);
        assert_eq!(estimate_tokens("a b c d e f g h i j"), 13);
    }

    #[test]
    fn test_split_paragraphs_on_whitespace_only_lines() {
        let paras = split_paragraphs("  first line\nstill first  \n   \n\nsecond\n \t \nthird\n");
        assert_eq!(paras, vec!["first line\nstill first", "second", "third"]);
    }

    #[test]
    fn test_two_paragraphs_under_budget_make_one_chunk() {
        let text = "Alpha beta gamma delta.\n\nEpsilon zeta eta theta.";
        let chunks = chunk_text(text, 512, 4);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, text);
        assert_eq!(chunks[0].overlap_len, 0);
        assert_eq!(chunks[0].token_count, 10);
    }

    #[test]
    fn test_split_seeds_overlap_from_previous_tail() {
        let text = "Alpha beta gamma delta.\n\nEpsilon zeta eta theta.";
        let chunks = chunk_text(text, 8, 2);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].text, "Alpha beta gamma delta.");
        assert_eq!(chunks[1].text, "delta.\n\nEpsilon zeta eta theta.");
        assert_eq!(chunks[1].fresh_text(), "Epsilon zeta eta theta.");
    }

    #[test]
    fn test_no_overlap_when_disabled() {
        let text = format!("{}\n\n{}\n\n{}", words(6, "a"), words(6, "b"), words(6, "c"));
        let chunks = chunk_text(&text, 10, 0);
        assert_eq!(chunks.len(), 3);
        for c in &chunks {
            assert_eq!(c.overlap_len, 0);
        }
        assert_eq!(chunks[1].text, words(6, "b"));
    }

    #[test]
    fn test_oversized_paragraph_emitted_whole() {
        let big = words(40, "w");
        let text = format!("small one\n\n{}\n\nsmall two", big);
        let chunks = chunk_text(&text, 10, 3);
        let holder = chunks
            .iter()
            .find(|c| c.text.contains(&big))
            .expect("oversized paragraph must survive");
        assert_eq!(holder.fresh_text(), big);
        assert_eq!(holder.overlap_len, 0, "no room for overlap next to it");
    }

    #[test]
    fn test_coverage_reconstructs_paragraphs() {
        let paras: Vec<String> = (0..30)
            .map(|i| words(3 + i % 7, &format!("p{}w", i)))
            .collect();
        let text = paras.join("\n\n");
        let chunks = chunk_text(&text, 20, 6);
        assert!(chunks.len() > 1);

        let rebuilt: Vec<&str> = chunks
            .iter()
            .flat_map(|c| split_paragraphs(c.fresh_text()))
            .collect();
        let expected: Vec<&str> = paras.iter().map(|p| p.as_str()).collect();
        assert_eq!(rebuilt, expected);
    }

    #[test]
    fn test_budget_respected() {
        let paras: Vec<String> = (0..25).map(|i| words(2 + i % 8, "t")).collect();
        let text = paras.join("\n\n");
        for (budget, overlap) in [(12, 0), (12, 5), (30, 10), (64, 63)] {
            for c in chunk_text(&text, budget, overlap) {
                assert!(
                    c.token_count <= budget,
                    "chunk {} has {} tokens over budget {}",
                    c.index,
                    c.token_count,
                    budget
                );
            }
        }
    }

    #[test]
    fn test_overlap_shared_and_bounded() {
        let paras: Vec<String> = (0..12).map(|i| words(5, &format!("x{}_", i))).collect();
        let text = paras.join("\n\n");
        let k = 4;
        let chunks = chunk_text(&text, 16, k);
        assert!(chunks.len() > 1);
        for pair in chunks.windows(2) {
            let overlap = &pair[1].text[..pair[1].overlap_len];
            let overlap = overlap.trim_end();
            assert!(!overlap.is_empty());
            assert!(pair[0].text.ends_with(overlap));
            assert!(overlap.split_whitespace().count() <= k);
        }
    }

    #[test]
    fn test_indices_contiguous_and_deterministic() {
        let text = (0..50)
            .map(|i| format!("Paragraph number {}.", i))
            .collect::<Vec<_>>()
            .join("\n\n");
        let a = chunk_text(&text, 10, 3);
        let b = chunk_text(&text, 10, 3);
        assert_eq!(a, b);
        for (i, c) in a.iter().enumerate() {
            assert_eq!(c.index, i);
        }
    }

    #[test]
    fn test_multibyte_words_overlap_on_char_boundaries() {
        let text = "┌──┐ héllo wörld ünïcode\n\nzweite straße größe maß";
        let chunks = chunk_text(text, 6, 2);
        assert_eq!(chunks.len(), 2);
        assert!(chunks[1].text.starts_with("ünïcode"));
    }

    #[test]
    fn test_classify_fence_always_code() {
        let text = "# Setup\n\nThis guide explains the installation in detail.\n\n```bash\ncargo install sift\n```";
        assert_eq!(classify(text), ChunkType::Code);
    }

    #[test]
    fn test_classify_keywords_and_prose() {
        assert_eq!(classify("def handler(event):\n    return event"), ChunkType::Code);
        assert_eq!(
            classify("## Routes\nGET /users/{id}\nReturns the user record."),
            ChunkType::Mixed
        );
        assert_eq!(
            classify("Call `connect()` before issuing any query on the pool."),
            ChunkType::Mixed
        );
        assert_eq!(
            classify("# Overview\n\nThe service indexes documentation for agents."),
            ChunkType::Info
        );
    }

    #[test]
    fn test_code_block_and_language_extracted() {
        let text = "Intro text here.\n\n```Rust ignore\nfn main() {}\n```\n\n```py\nprint(1)\n```";
        let chunks = chunk_text(text, 512, 0);
        assert_eq!(chunks[0].code.as_deref(), Some("fn main() {}"));
        assert_eq!(chunks[0].language.as_deref(), Some("rust"));
    }

    #[test]
    fn test_untagged_fence_defaults_to_markdown() {
        let chunks = chunk_text("Example:\n\n```\nplain block\n```", 512, 0);
        assert_eq!(chunks[0].code.as_deref(), Some("plain block"));
        assert_eq!(chunks[0].language.as_deref(), Some("markdown"));

        let prose = chunk_text("No code in this paragraph.", 512, 0);
        assert_eq!(prose[0].language, None);
    }

    #[test]
    fn test_heading_path_title() {
        let text = "# Guide\n\nIntro words here.\n\n## Install\n\nRun the installer.\n\n\
                    ```sh\n# not a heading\n```\n\n# Reference\n\nAll options.";
        let chunks = chunk_text(text, 512, 0);
        assert_eq!(chunks[0].title.as_deref(), Some("Reference"));

        let split = chunk_text(text, 8, 0);
        assert_eq!(split[0].title.as_deref(), Some("Guide"));
        assert!(split
            .iter()
            .any(|c| c.title.as_deref() == Some("Guide > Install")));
    }

    #[test]
    fn test_no_title_without_headings() {
        let chunks = chunk_text("plain text only", 512, 0);
        assert_eq!(chunks[0].title, None);
        assert_eq!(chunks[0].code, None);
        assert_eq!(chunks[0].language, None);
    }
}
