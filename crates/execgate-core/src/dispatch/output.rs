//! Bounded output capture.

/// Aggregated output that keeps the most recent `max_chars` characters.
#[derive(Debug, Clone, Default)]
pub struct OutputBuffer {
    text: String,
    max_chars: usize,
    truncated: bool,
}

impl OutputBuffer {
    pub fn new(max_chars: usize) -> Self {
        Self {
            text: String::new(),
            max_chars: max_chars.max(1),
            truncated: false,
        }
    }

    pub fn push(&mut self, data: &str) {
        self.text.push_str(data);
        // Trims down to 90% of the cap.
        if self.text.len() > self.max_chars {
            let keep = self.max_chars * 9 / 10;
            let char_count = self.text.chars().count();
            if char_count > self.max_chars {
                let skip = char_count - keep;
                let start = self
                    .text
                    .char_indices()
                    .nth(skip)
                    .map_or(self.text.len(), |(i, _)| i);
                self.text.drain(..start);
                self.truncated = true;
            }
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn truncated(&self) -> bool {
        self.truncated
    }

    /// Last `max_chars` characters.
    pub fn tail(&self, max_chars: usize) -> String {
        tail_chars(&self.text, max_chars)
    }
}

pub fn tail_chars(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    if count <= max_chars {
        return text.to_string();
    }
    text.chars().skip(count - max_chars).collect()
}

/// Splits `bytes` at the last complete UTF-8 character.
pub fn find_utf8_boundary(bytes: &[u8]) -> usize {
    match std::str::from_utf8(bytes) {
        Ok(_) => bytes.len(),
        Err(e) if e.error_len().is_none() => e.valid_up_to(),
        Err(_) => bytes.len(),
    }
}
