//! Request and control-marker vocabulary carried inside frames.
//!
//! One connection carries one request/response cycle:
//!
//! ```text
//! client                                   worker
//!   │ ── DATA "<depth> <script>" ──────────────► │
//!   │ ◄──────────────────── DATA item (0..n) ─── │
//!   │ ── CONTROL <<CANCEL>> (at most once) ────► │
//!   │ ◄────────────── CONTROL <<CANCELLED>> ──── │  (only after a confirmed cancel)
//!   │ ◄──────────────────── CONTROL <<END>> ──── │  (always last)
//! ```
//!
//! Markers travel in CONTROL frames only, so a DATA frame whose text happens
//! to be `<<END>>` is ordinary output.

use std::fmt;

use crate::constants::DEFAULT_DEPTH;

/// Reserved control markers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Marker {
    /// Client → worker: abort the in-flight script.
    Cancel,
    /// Worker → client: the abort completed.
    Cancelled,
    /// Worker → client: the response is complete. Always the last frame.
    End,
}

impl Marker {
    /// Wire text of the marker.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Cancel => "<<CANCEL>>",
            Self::Cancelled => "<<CANCELLED>>",
            Self::End => "<<END>>",
        }
    }

    /// Parse the payload of a CONTROL frame.
    ///
    /// Returns `None` for anything that is not exactly a marker.
    pub fn parse(text: &str) -> Option<Self> {
        match text {
            "<<CANCEL>>" => Some(Self::Cancel),
            "<<CANCELLED>>" => Some(Self::Cancelled),
            "<<END>>" => Some(Self::End),
            _ => None,
        }
    }
}

impl fmt::Display for Marker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A script invocation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Maximum nesting depth when serializing result items.
    pub depth: usize,
    /// Script source text.
    pub script: String,
}

impl Request {
    /// Create a request.
    pub fn new(script: impl Into<String>, depth: usize) -> Self {
        Self {
            depth,
            script: script.into(),
        }
    }

    /// Parse the first frame of a connection.
    ///
    /// Accepts `"<depth> <script>"` when the first space-separated token is an
    /// integer, otherwise the whole text is the script and the depth defaults
    /// to [`DEFAULT_DEPTH`].
    pub fn parse(text: &str) -> Self {
        if let Some((head, script)) = text.split_once(' ') {
            if let Ok(depth) = head.parse::<usize>() {
                return Self::new(script, depth);
            }
        }
        Self::new(text, DEFAULT_DEPTH)
    }

    /// Encode as the request frame text, always with an explicit depth.
    pub fn encode(&self) -> String {
        format!("{} {}", self.depth, self.script)
    }
}
