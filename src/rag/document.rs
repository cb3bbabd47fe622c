//! Document ingestion: splitting uploaded text into overlapping chunks
//! ready for embedding and indexing.

/// A chunk of document text ready to be embedded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub index: usize,
    pub text: String,
    pub word_count: usize,
}

/// Split `text` into chunks of `chunk_size` characters, each overlapping
/// the previous by `chunk_overlap` characters.
///
/// The stride between chunk starts is `chunk_size - chunk_overlap`; the
/// final chunk is trimmed rather than padded if fewer characters remain.
/// `word_count` is computed per chunk via whitespace splitting, for
/// telemetry only — chunking itself never splits on word boundaries.
///
/// # Panics
///
/// Panics if `chunk_overlap >= chunk_size` (the stride would be zero or
/// negative, producing an infinite chunk count).
pub fn chunk_text(text: &str, chunk_size: usize, chunk_overlap: usize) -> Vec<Chunk> {
    assert!(chunk_overlap < chunk_size, "chunk_overlap must be smaller than chunk_size");

    if text.trim().is_empty() {
        return Vec::new();
    }

    let chars: Vec<char> = text.chars().collect();
    let stride = chunk_size - chunk_overlap;
    let mut chunks = Vec::new();
    let mut start = 0usize;
    let mut index = 0usize;

    while start < chars.len() {
        let end = (start + chunk_size).min(chars.len());
        let slice: String = chars[start..end].iter().collect();
        chunks.push(Chunk { index, word_count: slice.split_whitespace().count(), text: slice });
        index += 1;

        if end == chars.len() {
            break;
        }
        start += stride;
    }

    chunks
}

/// Plain-text/markdown passthrough: returns the text unmodified. PDF
/// extraction is handled upstream by the document-upload handler before
/// this function runs; this stays a pure function so it is reusable from
/// tests without exercising the upload path.
pub fn normalize_text(raw: &str) -> String {
    raw.replace("\r\n", "\n").trim().to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunks_respect_stride() {
        let text = "0123456789";
        let chunks = chunk_text(text, 4, 1);
        // stride = 3: starts at 0, 3, 6, 9
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[0].text, "0123");
        assert_eq!(chunks[1].text, "3456");
        assert_eq!(chunks[2].text, "6789");
        assert_eq!(chunks[3].text, "9");
    }

    #[test]
    fn final_partial_chunk_is_trimmed_not_padded() {
        let text = "abcde";
        let chunks = chunk_text(text, 4, 0);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1].text, "e");
    }

    #[test]
    fn single_chunk_when_text_shorter_than_chunk_size() {
        let chunks = chunk_text("short text here", 500, 50);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].word_count, 3);
    }

    #[test]
    fn empty_text_yields_no_chunks() {
        assert!(chunk_text("   ", 10, 2).is_empty());
    }

    #[test]
    #[should_panic(expected = "chunk_overlap must be smaller than chunk_size")]
    fn overlap_must_be_smaller_than_chunk_size() {
        chunk_text("abc", 4, 4);
    }

    #[test]
    fn normalize_text_trims_and_unifies_newlines() {
        assert_eq!(normalize_text("  hello\r\nworld  \n"), "hello\nworld");
    }

    #[test]
    fn chunk_indices_are_sequential() {
        let text = "x".repeat(97);
        let chunks = chunk_text(&text, 20, 5);
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.index, i);
        }
    }

    #[test]
    fn never_splits_inside_a_multibyte_character() {
        let text = "é".repeat(30);
        let chunks = chunk_text(&text, 11, 3);
        for c in &chunks {
            assert!(c.text.chars().count() <= 11);
        }
        assert_eq!(chunks.iter().map(|c| c.text.chars().count()).sum::<usize>() > 0, true);
    }
}
