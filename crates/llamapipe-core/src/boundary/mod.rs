//! Response boundary detection and output sanitizing.
//!
//! In interactive instruction mode the engine prints a return-prompt
//! marker (`"\n>"`) whenever it is ready for more input, plus one extra
//! marker before the very first prompt. There is no structured end-of-turn
//! signal, so response boundaries are found by watching the text itself.
//!
//! ```text
//!             feed(text)               feed(text)
//! AwaitingMarker ---------> MarkerSeen(n) ---------> Complete
//!       ^                                              |
//!       +------------------- begin(index) -------------+
//! ```
//!
//! The marker heuristic breaks if the generated text contains the marker
//! characters itself. [`BoundaryPolicy::Sentinel`] exists for engines that
//! can be told to print an explicit end-of-turn token.

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Return-prompt marker echoed by the engine after each response.
pub const PROMPT_MARKER: &str = "\n>";

/// The bare delimiter character inside [`PROMPT_MARKER`].
pub const DELIMITER: char = '>';

/// How the end of a response is recognized.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BoundaryPolicy {
    /// Count [`PROMPT_MARKER`] occurrences across the whole dispatch.
    /// Prompt `k` (0-based) is complete once `k + 2` markers were seen.
    #[default]
    PromptMarker,
    /// A segment is complete after two bare [`DELIMITER`] characters.
    DelimiterPair,
    /// A segment is complete when `token` appears in the output.
    Sentinel { token: String },
}

impl BoundaryPolicy {
    /// Text whose occurrences are counted.
    fn pattern(&self) -> &str {
        match self {
            BoundaryPolicy::PromptMarker => PROMPT_MARKER,
            BoundaryPolicy::DelimiterPair => ">",
            BoundaryPolicy::Sentinel { token } => token,
        }
    }
}

/// Progress of the segment currently being read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundaryState {
    /// No marker seen since the segment began.
    AwaitingMarker,
    /// `n` markers seen in this segment, but not enough to finish it.
    MarkerSeen(usize),
    /// The segment is finished.
    Complete,
}

/// Stateful boundary detector for one dispatch.
///
/// Call [`BoundaryDetector::begin`] before each prompt's output, then
/// [`BoundaryDetector::feed`] every decoded chunk until it reports
/// [`BoundaryState::Complete`]. Markers split across chunks are counted
/// once.
#[derive(Debug, Clone)]
pub struct BoundaryDetector {
    policy: BoundaryPolicy,
    state: BoundaryState,
    /// Markers seen since the detector was created.
    total: usize,
    /// Markers seen since the last `begin`.
    in_segment: usize,
    /// Completion threshold for the current segment.
    target: usize,
    /// Unmatched tail of the previous chunk that may start a marker.
    carry: String,
}

impl BoundaryDetector {
    pub fn new(policy: BoundaryPolicy) -> Self {
        let policy = match policy {
            BoundaryPolicy::Sentinel { token } if token.is_empty() => {
                warn!("empty sentinel token, falling back to prompt-marker counting");
                BoundaryPolicy::PromptMarker
            }
            other => other,
        };
        Self {
            policy,
            state: BoundaryState::AwaitingMarker,
            total: 0,
            in_segment: 0,
            target: 0,
            carry: String::new(),
        }
    }

    pub fn policy(&self) -> &BoundaryPolicy {
        &self.policy
    }

    pub fn state(&self) -> BoundaryState {
        self.state
    }

    /// Total markers seen over the detector's lifetime.
    pub fn markers_seen(&self) -> usize {
        self.total
    }

    /// Start a new segment for the prompt at `prompt_index` (0-based).
    pub fn begin(&mut self, prompt_index: usize) {
        self.state = BoundaryState::AwaitingMarker;
        self.in_segment = 0;
        self.carry.clear();
        self.target = match self.policy {
            BoundaryPolicy::PromptMarker => prompt_index + 2,
            BoundaryPolicy::DelimiterPair => 2,
            BoundaryPolicy::Sentinel { .. } => 1,
        };
    }

    /// Feed one decoded chunk of engine output and return the new state.
    ///
    /// Once the segment is complete further input is ignored until the
    /// next [`BoundaryDetector::begin`].
    pub fn feed(&mut self, text: &str) -> BoundaryState {
        if self.state == BoundaryState::Complete {
            return self.state;
        }

        let pattern = self.policy.pattern();
        let mut window = std::mem::take(&mut self.carry);
        window.push_str(text);

        let mut found = 0;
        let mut last_end = 0;
        for (idx, m) in window.match_indices(pattern) {
            found += 1;
            last_end = idx + m.len();
        }

        let keep = pattern.chars().count().saturating_sub(1);
        self.carry = tail_chars(&window[last_end..], keep).to_string();

        self.total += found;
        self.in_segment += found;

        let reached = match self.policy {
            BoundaryPolicy::PromptMarker => self.total >= self.target,
            _ => self.in_segment >= self.target,
        };

        self.state = if reached {
            BoundaryState::Complete
        } else if self.in_segment > 0 {
            BoundaryState::MarkerSeen(self.in_segment)
        } else {
            BoundaryState::AwaitingMarker
        };
        self.state
    }
}

/// Last `n` characters of `s`.
fn tail_chars(s: &str, n: usize) -> &str {
    if n == 0 {
        return "";
    }
    match s.char_indices().rev().nth(n - 1) {
        Some((idx, _)) => &s[idx..],
        None => s,
    }
}

/// Remove ANSI CSI escape sequences (colors from `--color`).
fn strip_ansi(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\u{1b}' {
            out.push(c);
            continue;
        }
        if chars.peek() == Some(&'[') {
            chars.next();
            for c in chars.by_ref() {
                if ('\u{40}'..='\u{7e}').contains(&c) {
                    break;
                }
            }
        }
    }
    out
}

/// Clean a captured segment for return to the caller.
///
/// Removes color escapes, the sentinel token (sentinel policy), every
/// line terminator and every [`DELIMITER`], then trims the ends.
pub fn sanitize(raw: &str, policy: &BoundaryPolicy) -> String {
    let mut text = strip_ansi(raw);
    if let BoundaryPolicy::Sentinel { token } = policy {
        if !token.is_empty() {
            text = text.replace(token.as_str(), "");
        }
    }
    let cleaned: String = text
        .chars()
        .filter(|c| !matches!(*c, '\n' | '\r' | DELIMITER))
        .collect();
    cleaned.trim().to_string()
}
