//! Inline voice-marker detection.
//!
//! A marker counts only as a whole word: delimited by whitespace or by the
//! edges of the chunk. Anything else that merely contains a marker
//! ("AAron", "BB:") is content.

use crate::pipeline::types::VoiceMarker;

/// A piece of a scanned text chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Piece<'a> {
    Text(&'a str),
    Marker(VoiceMarker),
}

/// Splits text chunks at known voice markers.
#[derive(Debug, Clone)]
pub struct MarkerScanner {
    markers: Vec<VoiceMarker>,
}

impl MarkerScanner {
    pub fn new(markers: impl IntoIterator<Item = VoiceMarker>) -> Self {
        Self {
            markers: markers.into_iter().collect(),
        }
    }

    /// Known marker equal to `word`, if any.
    pub fn lookup(&self, word: &str) -> Option<&VoiceMarker> {
        self.markers.iter().find(|m| m.as_str() == word)
    }

    pub fn markers(&self) -> &[VoiceMarker] {
        &self.markers
    }

    /// Splits `text` into content and markers, preserving every content byte.
    pub fn scan<'a>(&self, text: &'a str) -> Vec<Piece<'a>> {
        let mut pieces = Vec::new();
        let mut content_start = 0;
        let mut word_start: Option<usize> = None;

        for (idx, ch) in text.char_indices().chain(std::iter::once((text.len(), ' '))) {
            if ch.is_whitespace() {
                if let Some(start) = word_start.take()
                    && let Some(marker) = self.lookup(&text[start..idx])
                {
                    if start > content_start {
                        pieces.push(Piece::Text(&text[content_start..start]));
                    }
                    pieces.push(Piece::Marker(marker.clone()));
                    content_start = idx;
                }
            } else if word_start.is_none() {
                word_start = Some(idx);
            }
        }

        if content_start < text.len() {
            pieces.push(Piece::Text(&text[content_start..]));
        }
        pieces
    }
}
