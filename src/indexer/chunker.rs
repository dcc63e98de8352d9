#[derive(Debug, Clone, PartialEq)]
pub struct TextChunk {
    pub text: String,
    pub chunk_index: usize,
}

/// Preferred split points, strongest first.
const SEPARATORS: [&str; 9] = ["\n\n", "\n", "。", "？", "！", ". ", "? ", "! ", " "];

/// Splits `text` into windows of at most `chunk_size` characters where each
/// window starts `overlap` characters before the previous one ended.
///
/// Windows end after the strongest separator that still leaves the window
/// longer than `overlap`, falling back to a hard cut. Text no longer than
/// `chunk_size` is returned as a single chunk. Sizes count chars, not bytes.
pub fn chunk_text(text: &str, chunk_size: usize, overlap: usize) -> Vec<TextChunk> {
    let text = text.trim();
    if text.is_empty() {
        return Vec::new();
    }

    let chunk_size = chunk_size.max(1);
    let overlap = overlap.min(chunk_size - 1);

    // byte offset of every char boundary, including the end
    let bounds: Vec<usize> = text
        .char_indices()
        .map(|(i, _)| i)
        .chain(std::iter::once(text.len()))
        .collect();
    let char_len = bounds.len() - 1;

    if char_len <= chunk_size {
        return vec![TextChunk {
            text: text.to_string(),
            chunk_index: 0,
        }];
    }

    let mut chunks = Vec::new();
    let mut start = 0;
    loop {
        let max_end = (start + chunk_size).min(char_len);
        let end = if max_end == char_len {
            char_len
        } else {
            find_break_point(text, &bounds, start, start + overlap + 1, max_end).unwrap_or(max_end)
        };

        chunks.push(TextChunk {
            text: text[bounds[start]..bounds[end]].to_string(),
            chunk_index: chunks.len(),
        });

        if end == char_len {
            break;
        }
        start = end - overlap;
    }

    chunks
}

/// Char position just past the last strong separator in
/// `[start, max_end)` that yields an end of at least `min_end`.
fn find_break_point(
    text: &str,
    bounds: &[usize],
    start: usize,
    min_end: usize,
    max_end: usize,
) -> Option<usize> {
    let segment_start = bounds[start];
    let segment = &text[segment_start..bounds[max_end]];

    for sep in SEPARATORS {
        if let Some(pos) = segment.rfind(sep) {
            let end_byte = segment_start + pos + sep.len();
            if let Ok(end) = bounds.binary_search(&end_byte) {
                if end >= min_end {
                    return Some(end);
                }
            }
        }
    }
    None
}
