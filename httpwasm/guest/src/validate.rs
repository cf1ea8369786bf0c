//! Field validation rules and the JSON verdicts they produce.

use serde::Serialize;
use serde_json::Value;

/// Error code reported for a field that does not hold its expected value.
pub const MISMATCH: u32 = 1;

/// One field check.
#[derive(Debug, Clone, Copy)]
pub struct Rule {
    /// Dot-separated path into the document, e.g. `name.last`.
    pub field_path: &'static str,
    pub expected: &'static str,
    pub description: &'static str,
}

/// The rules applied to every request, in order.
pub const RULES: &[Rule] = &[Rule {
    field_path: "name.last",
    expected: "Doe",
    description: "mismatched last name",
}];

/// What the module writes back to the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Validation {
    /// JSON verdict for the output stream.
    pub output: String,
    /// Note for the diagnostic stream, if any.
    pub diagnostic: Option<String>,
}

#[derive(Serialize)]
struct Verdict<'a> {
    status: &'static str,
    reason: Reason<'a>,
}

#[derive(Serialize, Default)]
struct Reason<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    field: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<&'a str>,
}

/// Check `input` against [`RULES`], stopping at the first failure.
///
/// Input that is not JSON is treated as a document with no fields.
pub fn validate(input: &str) -> Validation {
    let (doc, diagnostic) = match serde_json::from_str::<Value>(input) {
        Ok(doc) => (Some(doc), None),
        Err(e) => (None, Some(format!("input is not valid JSON: {e}"))),
    };

    let failed = RULES.iter().find_map(|rule| {
        let got = lookup(doc.as_ref(), rule.field_path);
        (got != rule.expected).then_some((rule, got))
    });

    let verdict = match failed {
        None => Verdict {
            status: "success",
            reason: Reason::default(),
        },
        Some((rule, got)) => Verdict {
            status: "error",
            reason: Reason {
                code: Some(MISMATCH),
                field: Some(rule.field_path),
                value: Some(got),
                description: Some(rule.description),
            },
        },
    };

    Validation {
        output: serde_json::to_string(&verdict).unwrap_or_default(),
        diagnostic,
    }
}

/// Resolve a dot-separated path. Numeric segments index into arrays.
/// Missing fields and `null` read as the empty string; non-string scalars
/// and containers read as their JSON text.
fn lookup(doc: Option<&Value>, path: &str) -> String {
    let found = doc.and_then(|doc| {
        path.split('.').try_fold(doc, |value, segment| match value {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
    });
    match found {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}
