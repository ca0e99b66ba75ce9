//! Structured signals recovered from free-form agent output.
//!
//! Parsing never fails: missing or malformed signals come back as
//! [`Signal::Indeterminate`], which callers must treat as "not a success".
//!
//! Recognized formats:
//!
//! ```text
//! <review-verdict>
//! verdict: APPROVED | NEEDS_CHANGES | BLOCKED | SKIPPED
//! blocking_issues: 0
//! </review-verdict>
//!
//! <promise>COMPLETE</promise>
//! <promise>NO_WORK</promise>
//!
//! <intent>
//! BEFORE: what is true now
//! AFTER: what will be true when done
//! </intent>
//! ```

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Bare completion token; must sit on its own line.
pub const COMPLETION_MARKER: &str = "<promise>COMPLETE</promise>";
/// Bare "nothing actionable" token; must sit on its own line.
pub const NO_WORK_MARKER: &str = "<promise>NO_WORK</promise>";

static VERDICT_BLOCK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<review-verdict>(.*?)</review-verdict>").expect("verdict regex is valid")
});
static FIELD_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^[ \t]*([A-Za-z_][A-Za-z_ -]*?)[ \t]*:[ \t]*(.*?)[ \t]*$").expect("field regex is valid")
});
static INTENT_BLOCK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<intent>(.*?)</intent>").expect("intent regex is valid")
});
static INTENT_FIELDS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?ims)^\s*BEFORE:\s*(.*?)\s*^\s*AFTER:\s*(.*?)\s*\z")
        .expect("intent fields regex is valid")
});

/// Review decision carried by a verdict block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerdictKind {
    Approved,
    NeedsChanges,
    Blocked,
    Skipped,
}

impl VerdictKind {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().replace([' ', '-'], "_").as_str() {
            "APPROVED" => Some(Self::Approved),
            "NEEDS_CHANGES" => Some(Self::NeedsChanges),
            "BLOCKED" => Some(Self::Blocked),
            "SKIPPED" => Some(Self::Skipped),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Approved => "APPROVED",
            Self::NeedsChanges => "NEEDS_CHANGES",
            Self::Blocked => "BLOCKED",
            Self::Skipped => "SKIPPED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    pub kind: VerdictKind,
    pub blocking_issues: u32,
}

impl Verdict {
    /// An approval that still lists blocking issues is not an approval.
    pub fn effective(&self) -> VerdictKind {
        if self.kind == VerdictKind::Approved && self.blocking_issues > 0 {
            VerdictKind::NeedsChanges
        } else {
            self.kind
        }
    }

    pub fn approves(&self) -> bool {
        matches!(
            self.effective(),
            VerdictKind::Approved | VerdictKind::Skipped
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Intent {
    pub before: String,
    pub after: String,
}

/// The single strongest signal found in a block of output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    Verdict(Verdict),
    NoWork,
    Complete,
    Intent(Intent),
    Indeterminate,
}

/// Classify `text` by precedence: verdict, no-work, completion, intent.
pub fn parse_signal(text: &str) -> Signal {
    if let Some(verdict) = parse_verdict(text) {
        return Signal::Verdict(verdict);
    }
    if has_no_work_marker(text) {
        return Signal::NoWork;
    }
    if has_completion_marker(text) {
        return Signal::Complete;
    }
    if let Some(intent) = parse_intent(text) {
        return Signal::Intent(intent);
    }
    Signal::Indeterminate
}

/// Last well-formed verdict block in `text`.
///
/// Agents often echo the format from their instructions before emitting the
/// real block, so earlier or malformed blocks are ignored.
pub fn parse_verdict(text: &str) -> Option<Verdict> {
    VERDICT_BLOCK_RE
        .captures_iter(text)
        .filter_map(|caps| caps.get(1).and_then(|body| parse_verdict_body(body.as_str())))
        .last()
}

fn parse_verdict_body(body: &str) -> Option<Verdict> {
    let mut kind = None;
    let mut blocking_issues = None;
    for caps in FIELD_RE.captures_iter(body) {
        let key = caps[1].trim().to_ascii_lowercase().replace([' ', '-'], "_");
        let value = &caps[2];
        match key.as_str() {
            "verdict" => kind = Some(VerdictKind::parse(value)?),
            "blocking_issues" => blocking_issues = Some(value.trim().parse::<u32>().ok()?),
            _ => {}
        }
    }
    Some(Verdict {
        kind: kind?,
        blocking_issues: blocking_issues.unwrap_or(0),
    })
}

pub fn has_completion_marker(text: &str) -> bool {
    has_bare_line(text, COMPLETION_MARKER)
}

pub fn has_no_work_marker(text: &str) -> bool {
    has_bare_line(text, NO_WORK_MARKER)
}

fn has_bare_line(text: &str, token: &str) -> bool {
    text.lines().any(|line| line.trim() == token)
}

/// Last intent block carrying both labels.
pub fn parse_intent(text: &str) -> Option<Intent> {
    INTENT_BLOCK_RE
        .captures_iter(text)
        .filter_map(|caps| {
            let body = caps.get(1)?.as_str().trim();
            let fields = INTENT_FIELDS_RE.captures(body)?;
            let before = fields[1].trim().to_string();
            let after = fields[2].trim().to_string();
            (!before.is_empty() && !after.is_empty()).then_some(Intent { before, after })
        })
        .last()
}
