//! Multi-stage query pipeline.
//!
//! ```text
//! query ──► dense recall (vector) ──┐
//!       └─► lexical recall (BM25) ──┴─► union ► fetch chunks+documents
//!             ► cheap cross-encoder ► strong cross-encoder
//!             ► extractive answer + sentence snap
//!             ► answer-focused cross-encoder ► assembly
//! ```
//!
//! Assembly groups comment-like candidates under their parent document,
//! builds a browser scroll-to-text fragment pointing at the answer, and
//! maps the cross-encoder score onto a 0..100 percentage with the
//! empirical `(s + 12) / 24 × 100` calibration for the published
//! cross-encoders — swap the models and this mapping must be re-fitted.

use anyhow::Result;
use chrono::{TimeZone, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};

use crate::app::App;
use crate::store::{ChunkWithDocument, Document};

/// One run of text in a result snippet; the answer span is bold.
#[derive(Debug, Clone, Serialize)]
pub struct TextPart {
    pub content: String,
    pub bold: bool,
}

/// The stable wire format of one search hit.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    /// Calibrated relevance in 0..100.
    pub score: f32,
    pub title: String,
    pub author: String,
    pub author_image_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author_image_data: Option<String>,
    /// Source URL with a `#:~:text=` fragment pointing at the answer.
    pub url: String,
    pub location: String,
    pub data_source: String,
    /// ISO 8601.
    pub time: String,
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    pub content: Vec<TextPart>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub child: Option<Box<SearchResult>>,
}

#[derive(Debug, Clone)]
struct Candidate {
    content: String,
    document: Document,
    source_type: String,
    score: f32,
    answer_start: usize,
    answer_end: usize,
}

impl Candidate {
    fn from_chunk(chunk: ChunkWithDocument) -> Self {
        Self {
            content: chunk.content,
            document: chunk.document,
            source_type: chunk.source_type,
            score: 0.0,
            answer_start: 0,
            answer_end: 0,
        }
    }

    fn answer(&self) -> &str {
        &self.content[self.answer_start..self.answer_end]
    }
}

/// Run the full pipeline. Returns at most `top_k` results ordered by
/// descending score (ties: newer first, then lower document id).
pub async fn search_documents(app: &App, query: &str, top_k: usize) -> Result<Vec<SearchResult>> {
    let query = query.trim();
    if query.is_empty() || top_k == 0 {
        return Ok(Vec::new());
    }

    // Stage 1+2: recall from both indexes.
    let query_vec = app
        .models
        .encoder
        .encode(&[query.to_string()])
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| anyhow::anyhow!("encoder returned no vector for query"))?;
    let dense_ids = app
        .vector
        .search(&query_vec, app.config.search.dense_candidates);
    let lexical_ids = app
        .lexical
        .search(query, app.config.search.lexical_candidates);

    // Stage 3: union, dedupe, fetch.
    let mut seen = HashSet::new();
    let mut chunk_ids = Vec::new();
    for id in dense_ids.into_iter().chain(lexical_ids) {
        if seen.insert(id) {
            chunk_ids.push(id);
        }
    }
    let chunks = app.store.chunks_with_documents(&chunk_ids).await?;
    if chunks.is_empty() {
        return Ok(Vec::new());
    }
    let mut candidates: Vec<Candidate> = chunks.into_iter().map(Candidate::from_chunk).collect();
    tracing::debug!(count = candidates.len(), "recalled candidates");

    // Stage 4: cheap re-rank down to the dense candidate budget.
    candidates = cross_encode(
        app,
        Stage::Cheap,
        query,
        candidates,
        app.config.search.dense_candidates,
        false,
    )
    .await?;

    // Stage 5: strong re-rank down to top_k.
    candidates = cross_encode(app, Stage::Strong, query, candidates, top_k, false).await?;

    // Stage 6: extractive answers, snapped to sentence boundaries.
    let contexts: Vec<String> = candidates.iter().map(|c| c.content.clone()).collect();
    let spans = app.models.extractor.answer(query, &contexts).await?;
    for (candidate, span) in candidates.iter_mut().zip(spans) {
        let (start, end) = snap_to_sentence(&candidate.content, &span.text);
        candidate.answer_start = start;
        candidate.answer_end = end;
    }

    // Stage 7: re-rank on the answer spans themselves.
    candidates = cross_encode(app, Stage::Strong, query, candidates, top_k, true).await?;

    // Stage 8: group children under parents and assemble.
    let results = assemble(app, candidates).await?;
    Ok(results)
}

#[derive(Clone, Copy)]
enum Stage {
    Cheap,
    Strong,
}

async fn cross_encode(
    app: &App,
    stage: Stage,
    query: &str,
    mut candidates: Vec<Candidate>,
    top_k: usize,
    use_answer: bool,
) -> Result<Vec<Candidate>> {
    if candidates.is_empty() {
        return Ok(candidates);
    }

    let pairs: Vec<(String, String)> = candidates
        .iter()
        .map(|candidate| {
            let mut text = if use_answer {
                candidate.answer().to_string()
            } else {
                candidate.content.clone()
            };
            if !candidate.document.title.is_empty() {
                text.push_str(" [SEP] ");
                text.push_str(&candidate.document.title);
            }
            (query.to_string(), text)
        })
        .collect();

    let scorer = match stage {
        Stage::Cheap => &app.models.scorer_small,
        Stage::Strong => &app.models.scorer_large,
    };
    let scores = scorer.score(&pairs).await?;
    for (candidate, score) in candidates.iter_mut().zip(scores) {
        candidate.score = score;
    }

    candidates.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.document.timestamp.cmp(&a.document.timestamp))
            .then_with(|| a.document.id.cmp(&b.document.id))
    });
    candidates.truncate(top_k);
    Ok(candidates)
}

// ============ Answer span snapping ============

/// Snap an extracted answer to its enclosing sentence. Sentences split on
/// `.?!:` followed by a space, or on quote/paren characters.
fn snap_to_sentence(content: &str, answer: &str) -> (usize, usize) {
    let answer = answer.trim();
    if answer.is_empty() {
        return (0, 0);
    }

    for (start, end) in split_segments(content) {
        let segment = &content[start..end];
        if segment.contains(answer) {
            let lead = segment.len() - segment.trim_start().len();
            let trail = segment.len() - segment.trim_end().len();
            return (start + lead, end - trail);
        }
    }

    match content.find(answer) {
        Some(start) => (start, start + answer.len()),
        None => (0, content.len()),
    }
}

/// Byte ranges of sentence-like segments between boundaries.
fn split_segments(text: &str) -> Vec<(usize, usize)> {
    let mut segments = Vec::new();
    let mut start = 0usize;
    let mut iter = text.char_indices().peekable();

    while let Some((i, ch)) = iter.next() {
        let quote_like = matches!(ch, '"' | '\u{201c}' | '\u{201d}' | '(' | ')');
        let punct_before_space = matches!(ch, '.' | '?' | '!' | ':')
            && iter.peek().map_or(false, |&(_, next)| next == ' ');

        if quote_like {
            if i > start {
                segments.push((start, i));
            }
            start = i + ch.len_utf8();
        } else if punct_before_space {
            if i > start {
                segments.push((start, i));
            }
            let (space_at, _) = iter.next().unwrap();
            start = space_at + 1;
        }
    }
    if text.len() > start {
        segments.push((start, text.len()));
    }
    segments
}

// ============ Assembly ============

async fn assemble(app: &App, candidates: Vec<Candidate>) -> Result<Vec<SearchResult>> {
    // Pair each child candidate with its parent candidate when the parent
    // was recalled too; each parent is consumed by one child.
    let mut doc_to_slot: HashMap<i64, usize> = HashMap::new();
    for (slot, candidate) in candidates.iter().enumerate() {
        doc_to_slot.entry(candidate.document.id).or_insert(slot);
    }

    let mut parent_of: HashMap<usize, usize> = HashMap::new();
    let mut consumed: HashSet<usize> = HashSet::new();
    for (slot, candidate) in candidates.iter().enumerate() {
        if let Some(parent_doc) = candidate.document.parent_id {
            if let Some(&parent_slot) = doc_to_slot.get(&parent_doc) {
                if parent_slot != slot && !consumed.contains(&parent_slot) {
                    parent_of.insert(slot, parent_slot);
                    consumed.insert(parent_slot);
                }
            }
        }
    }

    let mut ordered: Vec<(f32, i64, i64, SearchResult)> = Vec::new();
    for (slot, candidate) in candidates.iter().enumerate() {
        if consumed.contains(&slot) {
            continue;
        }

        let child_result = build_result(app, candidate).await?;
        let (doc_id, timestamp) = (candidate.document.id, candidate.document.timestamp);

        let result = if let Some(&parent_slot) = parent_of.get(&slot) {
            let parent = &candidates[parent_slot];
            let mut parent_result = build_result(app, parent).await?;
            parent_result.score = parent_result.score.max(child_result.score);
            parent_result.child = Some(Box::new(child_result));
            parent_result
        } else if let Some(parent_doc_id) = candidate.document.parent_id {
            match app.store.document_by_id(parent_doc_id).await? {
                Some(parent_doc) => {
                    let shell = Candidate {
                        content: String::new(),
                        source_type: candidate.source_type.clone(),
                        score: candidate.score,
                        document: parent_doc,
                        answer_start: 0,
                        answer_end: 0,
                    };
                    let mut parent_result = build_result(app, &shell).await?;
                    parent_result.child = Some(Box::new(child_result));
                    parent_result
                }
                // The parent vanished between recall and assembly.
                None => child_result,
            }
        } else {
            child_result
        };

        ordered.push((result.score, timestamp, doc_id, result));
    }

    ordered.sort_by(|a, b| {
        b.0.partial_cmp(&a.0)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.1.cmp(&a.1))
            .then_with(|| a.2.cmp(&b.2))
    });
    Ok(ordered.into_iter().map(|(_, _, _, result)| result).collect())
}

async fn build_result(app: &App, candidate: &Candidate) -> Result<SearchResult> {
    let answer = candidate.answer().to_string();

    let mut content = vec![TextPart {
        content: answer.clone(),
        bold: true,
    }];
    if candidate.answer_end < candidate.content.len() {
        let suffix: Vec<&str> = candidate.content[candidate.answer_end..]
            .split_whitespace()
            .take(20)
            .collect();
        if !suffix.is_empty() {
            content.push(TextPart {
                content: suffix.join(" "),
                bold: false,
            });
        }
    }

    let doc = &candidate.document;
    let author_image_data = match (&doc.author_image_url, app.registry.get_class(&candidate.source_type)) {
        (Some(image_url), Some(class)) => match app.registry.get_instance(doc.source_id).await {
            Some(handle) => class.author_image(&handle.context().config, image_url).await,
            None => None,
        },
        _ => None,
    };

    let time = Utc
        .timestamp_opt(doc.timestamp, 0)
        .single()
        .unwrap_or_else(|| Utc.timestamp_opt(0, 0).unwrap())
        .to_rfc3339();

    Ok(SearchResult {
        score: calibrate_score(candidate.score),
        title: doc.title.clone(),
        author: doc.author.clone(),
        author_image_url: doc.author_image_url.clone(),
        author_image_data,
        url: text_anchor(&doc.url, &answer),
        location: doc.location.clone(),
        data_source: candidate.source_type.clone(),
        time,
        kind: doc.kind.as_str().to_string(),
        file_kind: doc.file_kind.map(|k| k.as_str().to_string()),
        status: doc.status.clone(),
        content,
        child: None,
    })
}

/// Empirical calibration from raw cross-encoder logits onto 0..100.
fn calibrate_score(score: f32) -> f32 {
    (score + 12.0) / 24.0 * 100.0
}

// ============ Scroll-to-text fragments ============

/// Append a browser `#:~:text=` fragment so opening the result scrolls to
/// the answer. Long answers anchor on their first and last three words.
fn text_anchor(url: &str, text: &str) -> String {
    let mut anchored = url.to_string();
    if !anchored.contains('#') {
        anchored.push('#');
    }
    anchored.push_str(":~:text=");

    let words: Vec<&str> = text.split_whitespace().collect();
    if words.len() > 7 {
        anchored.push_str(&fragment_quote(&words[..3].join(" ")));
        anchored.push(',');
        anchored.push_str(&fragment_quote(&words[words.len() - 3..].join(" ")));
    } else {
        anchored.push_str(&fragment_quote(&words.join(" ")));
    }
    anchored
}

/// Percent-encode for a text fragment. `-` is encoded too: it is the
/// fragment directive's own delimiter.
fn fragment_quote(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for byte in text.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'_' | b'.' | b'~' | b'/' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fragment_quote_encodes_dash_and_space() {
        assert_eq!(fragment_quote("fox-trot run"), "fox%2Dtrot%20run");
        assert_eq!(fragment_quote("plain"), "plain");
    }

    #[test]
    fn test_text_anchor_short_answer() {
        let url = text_anchor("https://wiki/page", "quick brown fox");
        assert_eq!(url, "https://wiki/page#:~:text=quick%20brown%20fox");
    }

    #[test]
    fn test_text_anchor_long_answer_uses_ends() {
        let url = text_anchor(
            "https://wiki/page",
            "one two three four five six seven eight",
        );
        assert_eq!(
            url,
            "https://wiki/page#:~:text=one%20two%20three,six%20seven%20eight"
        );
    }

    #[test]
    fn test_text_anchor_preserves_existing_fragment() {
        let url = text_anchor("https://wiki/page#section", "fox");
        assert_eq!(url, "https://wiki/page#section:~:text=fox");
    }

    #[test]
    fn test_split_segments_on_punct_space() {
        let text = "First sentence. Second one? Third";
        let segments: Vec<&str> = split_segments(text)
            .into_iter()
            .map(|(s, e)| &text[s..e])
            .collect();
        assert_eq!(segments, vec!["First sentence", "Second one", "Third"]);
    }

    #[test]
    fn test_split_segments_on_quotes_and_parens() {
        let text = "before (inside) after";
        let segments: Vec<&str> = split_segments(text)
            .into_iter()
            .map(|(s, e)| &text[s..e])
            .collect();
        assert_eq!(segments, vec!["before ", "inside", " after"]);
    }

    #[test]
    fn test_snap_expands_answer_to_sentence() {
        let content = "Alpha beta gamma. The quick brown fox jumps over the lazy dog. Omega.";
        let (start, end) = snap_to_sentence(content, "brown fox");
        assert_eq!(&content[start..end], "The quick brown fox jumps over the lazy dog");
    }

    #[test]
    fn test_snap_single_sentence_keeps_trailing_period() {
        let content = "The quick brown fox jumps over the lazy dog.";
        let (start, end) = snap_to_sentence(content, "quick brown fox");
        assert_eq!(&content[start..end], content);
    }

    #[test]
    fn test_snap_unfound_answer_falls_back_to_content() {
        let content = "Nothing matches here.";
        let (start, end) = snap_to_sentence(content, "zeppelin");
        assert_eq!((start, end), (0, content.len()));
    }

    #[test]
    fn test_snap_empty_answer_is_empty_span() {
        assert_eq!(snap_to_sentence("whatever", "  "), (0, 0));
    }

    #[test]
    fn test_calibrate_score_range() {
        assert!((calibrate_score(-12.0) - 0.0).abs() < f32::EPSILON);
        assert!((calibrate_score(0.0) - 50.0).abs() < f32::EPSILON);
        assert!((calibrate_score(12.0) - 100.0).abs() < f32::EPSILON);
    }
}
