//! Text-level control protocol spoken by agents
//!
//! Agents driven by plain-text models address each other with
//! `<AgentName>:::<payload>` and sometimes sprinkle the legacy markers
//! `COMPLETE`, `FAIL` and `PASS` into their output. Everything here turns that
//! raw text into tagged values once, at the point where it leaves the model,
//! so the router and analysis code never match on substrings themselves.

use serde::{Deserialize, Serialize};

/// Delimiter between recipient name and payload
pub const ADDRESS_DELIMITER: &str = ":::";

/// Legacy markers a model may embed in free text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlToken {
    Complete,
    Fail,
    Pass,
}

impl ControlToken {
    pub const ALL: [ControlToken; 3] = [Self::Complete, Self::Fail, Self::Pass];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Complete => "COMPLETE",
            Self::Fail => "FAIL",
            Self::Pass => "PASS",
        }
    }
}

/// Result of parsing a message for an explicit recipient
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Addressing<'a> {
    /// No `:::` marker; the message goes to whoever handles unaddressed text
    Unaddressed(&'a str),
    /// `recipient` is trimmed, `payload` is everything after the first delimiter
    Addressed { recipient: &'a str, payload: &'a str },
}

impl<'a> Addressing<'a> {
    pub fn parse(message: &'a str) -> Self {
        match message.split_once(ADDRESS_DELIMITER) {
            Some((recipient, payload)) => Self::Addressed {
                recipient: recipient.trim(),
                payload,
            },
            None => Self::Unaddressed(message),
        }
    }

    pub fn is_addressed(&self) -> bool {
        matches!(self, Self::Addressed { .. })
    }
}

/// Format a message addressed to `recipient` in wire form
pub fn address(recipient: &str, payload: &str) -> String {
    format!("{}{}{}", recipient, ADDRESS_DELIMITER, payload)
}

/// Remove every control token from `text`.
///
/// Removal runs to a fixed point so that fragments which form a new token once
/// an inner one is cut out (`PAPASSSS`) are removed as well; this makes the
/// operation idempotent. Text without tokens is returned unchanged, otherwise
/// surrounding whitespace left behind is trimmed.
pub fn strip_control_tokens(text: &str) -> String {
    let mut current = text.to_string();
    let mut changed = false;
    loop {
        let mut next = current.clone();
        for token in ControlToken::ALL {
            next = next.replace(token.as_str(), "");
        }
        if next == current {
            break;
        }
        changed = true;
        current = next;
    }
    if changed {
        current.trim().to_string()
    } else {
        current
    }
}

/// Control tokens present in `text`, in declaration order
pub fn find_control_tokens(text: &str) -> Vec<ControlToken> {
    ControlToken::ALL
        .into_iter()
        .filter(|t| text.contains(t.as_str()))
        .collect()
}

/// What an agent reply asks the router to do next
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyKind {
    /// Terminal reply for the current chain
    Final,
    /// Reply addresses another agent and the chain continues
    Handoff { recipient: String, payload: String },
}

/// Parsed agent reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentReply {
    /// Reply text with control tokens removed, as shown and logged
    pub display: String,
    /// Control tokens the raw text carried
    pub markers: Vec<ControlToken>,
    pub kind: ReplyKind,
}

impl AgentReply {
    pub fn parse(raw: &str) -> Self {
        let markers = find_control_tokens(raw);
        let display = strip_control_tokens(raw);
        let kind = match Addressing::parse(&display) {
            Addressing::Addressed { recipient, payload } => ReplyKind::Handoff {
                recipient: recipient.to_string(),
                payload: payload.to_string(),
            },
            Addressing::Unaddressed(_) => ReplyKind::Final,
        };
        Self {
            display,
            markers,
            kind,
        }
    }

    pub fn is_handoff(&self) -> bool {
        matches!(self.kind, ReplyKind::Handoff { .. })
    }
}
