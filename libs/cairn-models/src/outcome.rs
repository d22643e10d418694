//! FHIR `OperationOutcome` construction helpers.
//!
//! The store and processor never carry a typed `OperationOutcome`; they build
//! one at the boundary from an error category, issue code, and diagnostics —
//! the same shape the teacher builds ad hoc with `serde_json::json!` in its
//! batch response assembly.

use serde_json::{json, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueSeverity {
    Fatal,
    Error,
    Warning,
    Information,
}

impl IssueSeverity {
    fn as_str(self) -> &'static str {
        match self {
            IssueSeverity::Fatal => "fatal",
            IssueSeverity::Error => "error",
            IssueSeverity::Warning => "warning",
            IssueSeverity::Information => "information",
        }
    }
}

pub fn operation_outcome(
    severity: IssueSeverity,
    code: &str,
    diagnostics: &str,
    expression: Option<&str>,
) -> Value {
    let mut issue = json!({
        "severity": severity.as_str(),
        "code": code,
        "diagnostics": diagnostics,
    });
    if let Some(expr) = expression {
        issue["expression"] = json!([expr]);
    }
    json!({
        "resourceType": "OperationOutcome",
        "issue": [issue],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_single_issue_outcome() {
        let outcome = operation_outcome(
            IssueSeverity::Error,
            "conflict",
            "Duplicate resource \"Patient/0\".",
            Some("Bundle.entry[1]"),
        );
        assert_eq!(outcome["resourceType"], "OperationOutcome");
        assert_eq!(outcome["issue"][0]["code"], "conflict");
        assert_eq!(outcome["issue"][0]["expression"][0], "Bundle.entry[1]");
    }

    #[test]
    fn omits_expression_when_absent() {
        let outcome = operation_outcome(IssueSeverity::Error, "not-found", "missing", None);
        assert!(outcome["issue"][0].get("expression").is_none());
    }
}
