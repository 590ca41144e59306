use std::time::Duration;

const THINKING: &str = "Thinking";
const WARMING_UP: &str = "Warming up AI";
const MAX_DOTS: usize = 3;

/// Label shown in place of a reply that is still being generated.
///
/// Driven by a periodic tick; after `warmup_after` it switches to a
/// "warming up" label so a cold model does not look stuck.
#[derive(Clone, Debug)]
pub struct ThinkingIndicator {
    warmup_after: Duration,
    dots: usize,
    warming_up: bool,
}

impl ThinkingIndicator {
    pub fn new(warmup_after: Duration) -> Self {
        Self {
            warmup_after,
            dots: 0,
            warming_up: false,
        }
    }

    /// Advance one frame. `elapsed` is measured from when thinking started.
    pub fn tick(&mut self, elapsed: Duration) -> String {
        self.dots = if self.dots < MAX_DOTS { self.dots + 1 } else { 0 };
        if elapsed >= self.warmup_after {
            self.warming_up = true;
        }
        self.label()
    }

    pub fn label(&self) -> String {
        let base = if self.warming_up { WARMING_UP } else { THINKING };
        format!("{base}{}", ".".repeat(self.dots))
    }

    pub fn reset(&mut self) {
        self.dots = 0;
        self.warming_up = false;
    }
}
