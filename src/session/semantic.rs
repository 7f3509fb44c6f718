//! Semantic streaming: turns an unbounded lazy sequence of assistant
//! tokens into an ordered sequence of chunks, delivered to TTS one at a
//! time. Stateless aside from a per-call token buffer.

use regex::Regex;
use std::sync::OnceLock;

fn sentence_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // A terminator only closes a sentence when followed by whitespace or
    // end of string, so an embedded decimal point like "$3.14" doesn't
    // split. `.*?` is lazy and (?s) lets it cross embedded terminators
    // that don't qualify, absorbing them into the sentence instead of
    // splitting on them.
    RE.get_or_init(|| Regex::new(r"(?s).*?[.!?]+(?:\s|$)").unwrap())
}

/// Splits on sentence terminators, keeping the terminator attached to the
/// sentence it closes. Any trailing text with no terminator is kept as a
/// final piece.
fn split_sentences(text: &str) -> Vec<String> {
    let re = sentence_pattern();
    let mut sentences: Vec<String> = Vec::new();
    let mut consumed = 0;
    for m in re.find_iter(text) {
        let trimmed = m.as_str().trim();
        if !trimmed.is_empty() {
            sentences.push(trimmed.to_string());
        }
        consumed = m.end();
    }
    let remainder = text[consumed..].trim();
    if !remainder.is_empty() {
        sentences.push(remainder.to_string());
    }
    sentences
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SemanticMetrics {
    pub total_chunks_streamed: u64,
    pub total_chunks_to_tts: u64,
    pub max_chunk_size: usize,
    pub fallbacks_used: u64,
    chunk_size_sum: u64,
}

impl SemanticMetrics {
    pub fn average_chunk_size(&self) -> f64 {
        if self.total_chunks_streamed == 0 {
            0.0
        } else {
            self.chunk_size_sum as f64 / self.total_chunks_streamed as f64
        }
    }

    fn record(&mut self, chunk: &str) {
        self.total_chunks_streamed += 1;
        self.total_chunks_to_tts += 1;
        self.chunk_size_sum += chunk.len() as u64;
        self.max_chunk_size = self.max_chunk_size.max(chunk.len());
    }
}

pub struct SemanticStreamer {
    break_marker: String,
    max_buffer_size: usize,
    buffer: String,
    saw_marker: bool,
    pub metrics: SemanticMetrics,
}

impl SemanticStreamer {
    pub fn new(break_marker: impl Into<String>, max_buffer_size: usize) -> Self {
        Self {
            break_marker: break_marker.into(),
            max_buffer_size,
            buffer: String::new(),
            saw_marker: false,
            metrics: SemanticMetrics::default(),
        }
    }

    /// Feed the next token. Returns any chunks it unblocks, in order.
    pub fn push_token(&mut self, token: &str) -> Vec<String> {
        self.buffer.push_str(token);
        let mut chunks = Vec::new();

        if self.buffer.contains(&self.break_marker) {
            self.saw_marker = true;
            let mut pieces: Vec<&str> = self.buffer.split(&self.break_marker as &str).collect();
            let remainder = pieces.pop().unwrap_or("").to_string();
            for piece in pieces {
                let trimmed = piece.trim();
                if !trimmed.is_empty() {
                    chunks.push(trimmed.to_string());
                }
            }
            self.buffer = remainder;
        }

        if self.buffer.len() > self.max_buffer_size {
            let trimmed = self.buffer.trim().to_string();
            if !trimmed.is_empty() {
                chunks.push(trimmed);
            }
            self.buffer.clear();
        }

        for chunk in &chunks {
            self.metrics.record(chunk);
        }
        chunks
    }

    /// Call once the token stream has ended. Applies sentence fallback if
    /// no marker was ever seen, then the terminal flush.
    pub fn finish(&mut self) -> Vec<String> {
        let mut chunks = Vec::new();

        if !self.saw_marker && !self.buffer.trim().is_empty() {
            let sentences = split_sentences(&self.buffer);
            if !sentences.is_empty() {
                self.metrics.fallbacks_used += 1;
                chunks.extend(sentences);
                self.buffer.clear();
            }
        }

        let remainder = self.buffer.trim().to_string();
        if !remainder.is_empty() {
            chunks.push(remainder);
        }
        self.buffer.clear();

        for chunk in &chunks {
            self.metrics.record(chunk);
        }
        chunks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream(streamer: &mut SemanticStreamer, tokens: &[&str]) -> Vec<String> {
        let mut out = Vec::new();
        for t in tokens {
            out.extend(streamer.push_token(t));
        }
        out.extend(streamer.finish());
        out
    }

    #[test]
    fn test_marker_based_chunking() {
        let mut s = SemanticStreamer::new("||BREAK||", 400);
        let chunks = stream(
            &mut s,
            &["Our pricing starts at $99/month. ||BREAK|| Would you like a demo?"],
        );
        assert_eq!(
            chunks,
            vec![
                "Our pricing starts at $99/month.".to_string(),
                "Would you like a demo?".to_string()
            ]
        );
        assert_eq!(s.metrics.fallbacks_used, 0);
    }

    #[test]
    fn test_marker_chunking_is_token_boundary_independent() {
        let full = "Hello there. ||BREAK|| How can I help?";
        let mut whole = SemanticStreamer::new("||BREAK||", 400);
        let whole_chunks = stream(&mut whole, &[full]);

        let mut split = SemanticStreamer::new("||BREAK||", 400);
        let pieces: Vec<&str> = vec!["Hel", "lo there. |", "|BREAK|| How ", "can I help?"];
        let split_chunks = stream(&mut split, &pieces);

        assert_eq!(whole_chunks, split_chunks);
    }

    #[test]
    fn test_multiple_markers_yield_all_pieces() {
        let mut s = SemanticStreamer::new("||BREAK||", 400);
        let chunks = stream(&mut s, &["a ||BREAK|| b ||BREAK|| c"]);
        assert_eq!(chunks, vec!["a".to_string(), "b".to_string(), "c".to_string()]);
    }

    #[test]
    fn test_sentence_fallback_when_no_marker() {
        let mut s = SemanticStreamer::new("||BREAK||", 400);
        let chunks = stream(&mut s, &["Hello there. How can I help? Great."]);
        assert_eq!(
            chunks,
            vec![
                "Hello there.".to_string(),
                "How can I help?".to_string(),
                "Great.".to_string()
            ]
        );
        assert_eq!(s.metrics.fallbacks_used, 1);
    }

    #[test]
    fn test_sentence_fallback_does_not_split_on_decimal_point() {
        let mut s = SemanticStreamer::new("||BREAK||", 400);
        let chunks = stream(&mut s, &["The price is $3.14. Buy now."]);
        assert_eq!(
            chunks,
            vec!["The price is $3.14.".to_string(), "Buy now.".to_string()]
        );
        assert_eq!(s.metrics.fallbacks_used, 1);
    }

    #[test]
    fn test_forced_flush_on_overflow() {
        let mut s = SemanticStreamer::new("||BREAK||", 10);
        let chunks = s.push_token("this sentence has no terminator and is long");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0], "this sentence has no terminator and is long");
    }

    #[test]
    fn test_terminal_flush_of_remaining_buffer() {
        let mut s = SemanticStreamer::new("||BREAK||", 400);
        s.push_token("partial without terminator");
        let chunks = s.finish();
        assert_eq!(chunks, vec!["partial without terminator".to_string()]);
    }

    #[test]
    fn test_no_tokens_produce_no_chunks() {
        let mut s = SemanticStreamer::new("||BREAK||", 400);
        assert!(s.finish().is_empty());
    }

    #[test]
    fn test_average_and_max_chunk_size_metrics() {
        let mut s = SemanticStreamer::new("||BREAK||", 400);
        stream(&mut s, &["ab ||BREAK|| abcdef"]);
        assert_eq!(s.metrics.total_chunks_streamed, 2);
        assert_eq!(s.metrics.max_chunk_size, 6);
        assert!((s.metrics.average_chunk_size() - 4.0).abs() < f64::EPSILON);
    }
}
