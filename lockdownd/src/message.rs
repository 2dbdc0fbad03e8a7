//! Request/response envelope handling.
//!
//! Every lockdown request is a dictionary carrying `Request: <verb>` and,
//! when the client has one configured, a `Label`. Every response echoes the
//! verb back; a reply whose echo does not match the request is treated as
//! malformed no matter what else it contains.

use log::debug;
use plist::{Dictionary, Value};

use crate::LockdownError;

/// Outcome of inspecting a response envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultStatus {
    /// `Result: "Success"`.
    Success,
    /// `Result: "Failure"`; verb-specific `Error` details may be present.
    Failure,
    /// Verb echo mismatch, missing `Result`, or an unknown result value.
    Malformed,
}

/// Builds the request envelope for `verb`. The label is only inserted when
/// non-empty.
pub fn request(verb: &str, label: Option<&str>) -> Dictionary {
    let mut dict = Dictionary::new();
    if let Some(label) = label {
        if !label.is_empty() {
            dict.insert("Label".into(), label.into());
        }
    }
    dict.insert("Request".into(), verb.into());
    dict
}

/// Checks a response against the verb that was sent.
pub fn check_result(dict: &Dictionary, expected_verb: &str) -> ResultStatus {
    match dict.get("Request").and_then(Value::as_string) {
        Some(verb) if verb == expected_verb => {}
        Some(verb) => {
            debug!("response echoed verb {verb:?}, expected {expected_verb:?}");
            return ResultStatus::Malformed;
        }
        None => return ResultStatus::Malformed,
    }

    match dict.get("Result").and_then(Value::as_string) {
        Some("Success") => ResultStatus::Success,
        Some("Failure") => ResultStatus::Failure,
        Some(other) => {
            debug!("unknown result value {other:?}");
            ResultStatus::Malformed
        }
        None => ResultStatus::Malformed,
    }
}

/// Extracts a required string field from a response.
pub(crate) fn expect_string(
    dict: &Dictionary,
    key: &'static str,
) -> Result<String, LockdownError> {
    dict.get(key)
        .and_then(Value::as_string)
        .map(str::to_owned)
        .ok_or(LockdownError::NotEnoughData(key))
}

/// The `Error` string of a failed response, when the device sent one.
pub(crate) fn error_string(dict: &Dictionary) -> Option<&str> {
    dict.get("Error").and_then(Value::as_string)
}
