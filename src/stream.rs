use std::time::Duration;

/// Accumulates streamed assistant fragments until the turn is finalized.
///
/// The owner schedules the idle flush: every fragment pushes the deadline
/// `idle_window()` further out, and [`StreamAssembler::on_done`] flushes
/// immediately.
#[derive(Debug)]
pub struct StreamAssembler {
    buffer: String,
    idle_window: Duration,
}

impl StreamAssembler {
    pub fn new(idle_window: Duration) -> Self {
        Self { buffer: String::new(), idle_window }
    }

    pub fn idle_window(&self) -> Duration {
        self.idle_window
    }

    /// Appends a fragment and returns the whole buffer for live display.
    pub fn on_fragment(&mut self, text: &str) -> &str {
        self.buffer.push_str(text);
        &self.buffer
    }

    /// Server signalled the end of the turn.
    pub fn on_done(&mut self) -> Option<String> {
        self.flush()
    }

    /// Takes the buffered text. Returns the trimmed text when there is any;
    /// the buffer is empty afterwards either way.
    pub fn flush(&mut self) -> Option<String> {
        let taken = std::mem::take(&mut self.buffer);
        let trimmed = taken.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    }

    pub fn partial(&self) -> &str {
        &self.buffer
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_grows_then_flushes_trimmed() {
        let mut assembler = StreamAssembler::new(Duration::from_millis(2000));
        assert_eq!(assembler.on_fragment("  Xin"), "  Xin");
        assert_eq!(assembler.on_fragment(" chào"), "  Xin chào");
        assert_eq!(assembler.on_fragment("!\n"), "  Xin chào!\n");
        assert_eq!(assembler.on_done().as_deref(), Some("Xin chào!"));
        assert!(assembler.is_empty());
        assert_eq!(assembler.flush(), None);
    }

    #[test]
    fn whitespace_only_buffer_is_not_emitted() {
        let mut assembler = StreamAssembler::new(Duration::from_millis(2000));
        assembler.on_fragment("  \n ");
        assert_eq!(assembler.flush(), None);
        assert!(assembler.is_empty());
    }

    #[test]
    fn next_turn_starts_clean() {
        let mut assembler = StreamAssembler::new(Duration::from_millis(2000));
        assembler.on_fragment("first");
        assert_eq!(assembler.flush().as_deref(), Some("first"));
        assembler.on_fragment("second");
        assert_eq!(assembler.partial(), "second");
        assembler.reset();
        assert_eq!(assembler.on_done(), None);
    }
}
