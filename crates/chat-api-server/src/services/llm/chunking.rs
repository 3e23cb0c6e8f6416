use unicode_segmentation::UnicodeSegmentation;

/// Split a complete answer into pieces of at most `max_chars` characters, so a
/// single-string reply can still be streamed.
///
/// Pieces break at Unicode word boundaries, after any whitespace. Joining the
/// pieces gives back `text` exactly. A segment longer than the limit is cut at
/// grapheme boundaries.
pub fn split_into_chunks(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0usize;

    for segment in word_segments(text) {
        let segment_len = segment.chars().count();

        if segment_len > max_chars {
            if !current.is_empty() {
                chunks.push(std::mem::take(&mut current));
                current_len = 0;
            }
            let mut pieces = hard_split(segment, max_chars);
            // The tail piece may still share a chunk with what follows
            if let Some(last) = pieces.pop() {
                chunks.extend(pieces);
                current_len = last.chars().count();
                current = last;
            }
            continue;
        }

        if current_len + segment_len > max_chars && !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
            current_len = 0;
        }
        current.push_str(segment);
        current_len += segment_len;
    }

    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Unicode word-boundary segments, each whitespace run glued to the segment
/// before it. Leading whitespace forms its own segment.
fn word_segments(text: &str) -> Vec<&str> {
    let mut segments: Vec<&str> = Vec::new();
    let mut start = 0usize;
    let mut end = 0usize;

    for (idx, segment) in text.split_word_bound_indices() {
        let is_space = segment.chars().all(char::is_whitespace);
        if !is_space && end > start {
            segments.push(&text[start..end]);
            start = idx;
        }
        end = idx + segment.len();
    }
    if end > start {
        segments.push(&text[start..end]);
    }
    segments
}

fn hard_split(segment: &str, max_chars: usize) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut current = String::new();
    let mut current_len = 0usize;

    for grapheme in segment.graphemes(true) {
        let grapheme_len = grapheme.chars().count();

        if grapheme_len > max_chars {
            // Pathological cluster, fall back to chars
            for ch in grapheme.chars() {
                if current_len == max_chars {
                    pieces.push(std::mem::take(&mut current));
                    current_len = 0;
                }
                current.push(ch);
                current_len += 1;
            }
            continue;
        }

        if current_len + grapheme_len > max_chars {
            pieces.push(std::mem::take(&mut current));
            current_len = 0;
        }
        current.push_str(grapheme);
        current_len += grapheme_len;
    }

    if !current.is_empty() {
        pieces.push(current);
    }
    pieces
}
