//! Incremental decoder for line-delimited `data:` frames.

/// Buffers raw bytes and yields complete `data:` payloads. Frames split across reads are
/// held until their newline arrives; blank lines, comments, other SSE fields and the
/// `[DONE]` sentinel are skipped.
#[derive(Debug, Default)]
pub struct SseLineDecoder {
    buffer: Vec<u8>,
}

impl SseLineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk of the response body; returns the payloads completed by it.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);
        let mut payloads = Vec::new();

        while let Some(newline_pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=newline_pos).collect();
            if let Some(data) = Self::data_of(&line) {
                payloads.push(data);
            }
        }
        payloads
    }

    /// Flush a trailing line the backend sent without a final newline.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        Self::data_of(&rest)
    }

    fn data_of(raw: &[u8]) -> Option<String> {
        // Decode per line so multi-byte characters split across reads survive.
        let line = String::from_utf8_lossy(raw);
        let line = line.trim_end_matches(['\n', '\r']);
        let data = line.strip_prefix("data:")?.trim_start();
        if data.is_empty() || data == "[DONE]" {
            None
        } else {
            Some(data.to_string())
        }
    }
}
