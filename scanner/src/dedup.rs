use std::time::Duration;

use qrscan_common::symbol::DecodedSymbol;
use tracing::trace;

/// Minimum interval before the same text is emitted again.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_millis(1500);

/// Last emitted symbol text and its detection time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DedupEntry {
    pub text: String,
    pub emitted_at_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Emit,
    Suppress,
}

/// Suppresses repeats of the same symbol text within a cooldown window.
///
/// Elapsed time is measured on the symbols' own detection timestamps, so the
/// behaviour follows the capture clock rather than when decodes finish.
#[derive(Debug)]
pub struct ResultDeduplicator {
    cooldown_ms: i64,
    last: Option<DedupEntry>,
}

impl Default for ResultDeduplicator {
    fn default() -> Self {
        Self::new(DEFAULT_COOLDOWN)
    }
}

impl ResultDeduplicator {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown_ms: i64::try_from(cooldown.as_millis()).unwrap_or(i64::MAX),
            last: None,
        }
    }

    pub fn filter(&mut self, symbol: &DecodedSymbol) -> Verdict {
        let now = symbol.detected_at_ms;
        if let Some(last) = self.last.as_mut() {
            if last.text == symbol.text {
                let elapsed = now.saturating_sub(last.emitted_at_ms);
                if elapsed < 0 {
                    // Capture clock went backwards; restart the window from here.
                    last.emitted_at_ms = now;
                    return Verdict::Suppress;
                }
                if elapsed <= self.cooldown_ms {
                    trace!(text = symbol.text, elapsed, "suppressing repeat");
                    return Verdict::Suppress;
                }
            }
        }
        self.last = Some(DedupEntry {
            text: symbol.text.clone(),
            emitted_at_ms: now,
        });
        Verdict::Emit
    }

    pub fn reset(&mut self) {
        self.last = None;
    }

    pub fn last(&self) -> Option<&DedupEntry> {
        self.last.as_ref()
    }
}
