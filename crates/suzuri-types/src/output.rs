//! The cell output model and its coalescing rule.
//!
//! Outputs are a tagged variant: stream text, rich execute results, display
//! data, and errors. The one non-obvious rule lives in [`push_coalesced`]:
//! consecutive stream outputs with the same name at the *tail* of the list
//! merge into a single entry, so a kernel emitting stdout in 50 fragments
//! renders as one block. Non-stream outputs never merge.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// A mime-type → payload bundle, e.g. `{"text/plain": "42", "text/html": ...}`.
pub type MimeBundle = HashMap<String, serde_json::Value>;

/// Which standard stream a text fragment belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum StreamName {
    Stdout,
    Stderr,
}

/// One entry in a cell's ordered output list.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "output_type", rename_all = "snake_case")]
pub enum Output {
    /// Coalesced stream text (stdout or stderr).
    Stream { name: StreamName, text: String },
    /// A rich result of an execution, numbered by the kernel.
    ExecuteResult {
        data: MimeBundle,
        metadata: MimeBundle,
        execution_count: Option<u32>,
    },
    /// Rich display output, optionally addressable for in-place updates.
    DisplayData {
        data: MimeBundle,
        metadata: MimeBundle,
        display_id: Option<String>,
    },
    /// An execution error with traceback.
    Error {
        ename: String,
        evalue: String,
        traceback: Vec<String>,
    },
}

impl Output {
    /// Shorthand constructor for stream outputs.
    pub fn stream(name: StreamName, text: impl Into<String>) -> Self {
        Output::Stream { name, text: text.into() }
    }

    /// The display id, if this is display data that carries one.
    pub fn display_id(&self) -> Option<&str> {
        match self {
            Output::DisplayData { display_id, .. } => display_id.as_deref(),
            _ => None,
        }
    }
}

/// Append `output` to `outputs`, coalescing tail stream fragments.
///
/// If `output` is a stream entry and the current tail is a stream entry with
/// the same name, the text is concatenated in arrival order instead of
/// growing the list. Returns the index the output landed at, which is stable
/// for display-registry bookkeeping.
pub fn push_coalesced(outputs: &mut Vec<Output>, output: Output) -> usize {
    if let Output::Stream { name, text } = &output
        && let Some(Output::Stream { name: tail_name, text: tail_text }) = outputs.last_mut()
        && tail_name == name
    {
        tail_text.push_str(text);
        return outputs.len() - 1;
    }
    outputs.push(output);
    outputs.len() - 1
}

// ============================================================================
// Tests
// ============================================================================
