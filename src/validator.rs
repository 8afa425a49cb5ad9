//! JSON completeness validation for model output.
//!
//! A stage result is only accepted when it is long enough to be real
//! output, parses as JSON, carries the stage's mandatory top-level keys, and
//! is a non-empty object. When parsing fails the raw text is scanned to tell
//! *truncated* output (the model hit its token ceiling: unclosed brackets,
//! trailing comma or colon, unterminated string) apart from *malformed*
//! output, since the two need different remediation.
//!
//! # Checks
//!
//! | # | Check | Severity |
//! |---|-------|----------|
//! | 1 | non-empty, `len >= absolute_min_length` | hard, short-circuits |
//! | 2 | parses as JSON | hard, short-circuits |
//! | 3 | mandatory keys present | hard |
//! | 3 | `len >= stage min_length` | warning |
//! | 4 | top-level object with at least one property | hard |
//!
//! The returned [`ValidationResult`] is serializable and meant to be
//! embedded verbatim in operator alerts.

use serde::Serialize;
use serde_json::Value;

use crate::stages::StageSchema;

/// Which check rejected the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailedCheck {
    Empty,
    TooShort,
    Truncated,
    Malformed,
    MissingMandatoryKeys,
    NotAnObject,
    EmptyObject,
}

/// Counters and flags gathered while validating.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ValidationDiagnostics {
    pub length: usize,
    pub expected_min_length: Option<usize>,
    pub is_parseable: bool,
    pub is_truncated: bool,
    pub has_mandatory_keys: bool,
    pub missing_keys: Vec<String>,
    pub open_braces: usize,
    pub close_braces: usize,
    pub open_brackets: usize,
    pub close_brackets: usize,
    pub unterminated_string: bool,
    pub property_count: usize,
    pub estimated_completeness_pct: u8,
    pub failed_check: Option<FailedCheck>,
    pub parse_error: Option<String>,
    /// Last characters of the payload, to eyeball where output stopped.
    pub tail: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub diagnostics: ValidationDiagnostics,
}

impl ValidationResult {
    /// One-line description for logs and error messages.
    pub fn summary(&self) -> String {
        if self.is_valid {
            return "valid".to_string();
        }
        let check = self
            .diagnostics
            .failed_check
            .map(|c| format!("{:?}", c))
            .unwrap_or_else(|| "unknown".to_string());
        format!(
            "{} ({}% complete): {}",
            check,
            self.diagnostics.estimated_completeness_pct,
            self.errors.join("; ")
        )
    }

    /// Remediation hint for operators.
    pub fn remediation(&self) -> &'static str {
        match self.diagnostics.failed_check {
            Some(FailedCheck::Truncated) => "increase the max output token budget for this stage",
            Some(FailedCheck::Malformed) | Some(FailedCheck::NotAnObject) => {
                "review the stage prompt's output format instructions"
            }
            Some(FailedCheck::MissingMandatoryKeys) => {
                "review the stage prompt against the stage schema"
            }
            Some(FailedCheck::Empty) | Some(FailedCheck::TooShort) => {
                "inspect the model response; output was empty or garbage"
            }
            Some(FailedCheck::EmptyObject) => "the model returned an empty object",
            None => "none",
        }
    }
}

/// Validates stage output against a [`StageSchema`].
#[derive(Debug, Clone)]
pub struct JsonValidator {
    absolute_min_length: usize,
}

impl Default for JsonValidator {
    fn default() -> Self {
        Self::new(5)
    }
}

impl JsonValidator {
    pub fn new(absolute_min_length: usize) -> Self {
        Self {
            absolute_min_length,
        }
    }

    pub fn validate(&self, text: &str, schema: &StageSchema) -> ValidationResult {
        let body = strip_code_fences(text);
        let mut diag = ValidationDiagnostics {
            length: body.len(),
            expected_min_length: schema.min_length,
            tail: tail_of(body, 80),
            ..Default::default()
        };
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        // 1. Presence and absolute length.
        if body.is_empty() {
            errors.push("output is empty".to_string());
            diag.failed_check = Some(FailedCheck::Empty);
            return finish(errors, warnings, diag);
        }
        if body.len() < self.absolute_min_length {
            errors.push(format!(
                "output is {} characters, below the absolute minimum of {}",
                body.len(),
                self.absolute_min_length
            ));
            diag.failed_check = Some(FailedCheck::TooShort);
            return finish(errors, warnings, diag);
        }

        let scan = scan_structure(body);
        diag.open_braces = scan.open_braces;
        diag.close_braces = scan.close_braces;
        diag.open_brackets = scan.open_brackets;
        diag.close_brackets = scan.close_brackets;
        diag.unterminated_string = scan.in_string;

        // 2. Syntax, with truncation diagnosis on failure.
        let value: Value = match serde_json::from_str(body) {
            Ok(v) => v,
            Err(e) => {
                diag.parse_error = Some(e.to_string());
                if scan.looks_truncated() {
                    diag.is_truncated = true;
                    diag.failed_check = Some(FailedCheck::Truncated);
                    errors.push(format!(
                        "output appears truncated: {} unclosed brace(s), {} unclosed bracket(s), ends with {:?}",
                        scan.open_braces.saturating_sub(scan.close_braces),
                        scan.open_brackets.saturating_sub(scan.close_brackets),
                        scan.last_significant.map(String::from).unwrap_or_default()
                    ));
                } else {
                    diag.failed_check = Some(FailedCheck::Malformed);
                    if scan.mismatched {
                        errors.push("brackets are mismatched".to_string());
                    }
                    errors.push(format!("invalid JSON: {}", e));
                }
                diag.estimated_completeness_pct = scan.closure_pct(body.len(), schema.min_length);
                return finish(errors, warnings, diag);
            }
        };
        diag.is_parseable = true;

        // 3. Stage contract.
        let object = value.as_object();
        diag.missing_keys = schema
            .mandatory_keys
            .iter()
            .filter(|k| object.map_or(true, |o| !o.contains_key(k.as_str())))
            .cloned()
            .collect();
        diag.has_mandatory_keys = diag.missing_keys.is_empty();
        if !diag.has_mandatory_keys {
            errors.push(format!(
                "missing mandatory keys: {}",
                diag.missing_keys.join(", ")
            ));
            diag.failed_check = Some(FailedCheck::MissingMandatoryKeys);
        }
        if let Some(min) = schema.min_length {
            if body.len() < min {
                warnings.push(format!(
                    "output is {} characters, below the expected {} for this stage",
                    body.len(),
                    min
                ));
            }
        }

        // 4. Non-empty object.
        match object {
            Some(o) if o.is_empty() => {
                errors.push("top-level object has no properties".to_string());
                diag.failed_check.get_or_insert(FailedCheck::EmptyObject);
            }
            Some(o) => diag.property_count = o.len(),
            None => {
                errors.push("top-level value is not an object".to_string());
                diag.failed_check.get_or_insert(FailedCheck::NotAnObject);
            }
        }

        diag.estimated_completeness_pct = key_coverage_pct(schema, &diag);
        finish(errors, warnings, diag)
    }
}

fn finish(
    errors: Vec<String>,
    warnings: Vec<String>,
    diagnostics: ValidationDiagnostics,
) -> ValidationResult {
    ValidationResult {
        is_valid: errors.is_empty(),
        errors,
        warnings,
        diagnostics,
    }
}

fn key_coverage_pct(schema: &StageSchema, diag: &ValidationDiagnostics) -> u8 {
    if diag.property_count == 0 {
        return 0;
    }
    let total = schema.mandatory_keys.len();
    if total == 0 {
        return 100;
    }
    let present = total - diag.missing_keys.len();
    ((present * 100) / total) as u8
}

/// Remove a surrounding markdown code fence (```json ... ```), if any.
pub fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = match rest.find('\n') {
        Some(pos) => &rest[pos + 1..],
        None => rest,
    };
    rest.trim_end()
        .strip_suffix("```")
        .unwrap_or(rest)
        .trim()
}

fn tail_of(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    text.chars().skip(count.saturating_sub(max_chars)).collect()
}

/// Bracket and string state of a raw payload, ignoring characters inside strings.
#[derive(Debug, Default)]
struct StructureScan {
    open_braces: usize,
    close_braces: usize,
    open_brackets: usize,
    close_brackets: usize,
    in_string: bool,
    mismatched: bool,
    unclosed: usize,
    last_significant: Option<char>,
}

impl StructureScan {
    fn looks_truncated(&self) -> bool {
        if self.mismatched {
            return false;
        }
        self.in_string
            || self.unclosed > 0
            || matches!(self.last_significant, Some(',') | Some(':'))
    }

    fn closure_pct(&self, length: usize, expected: Option<usize>) -> u8 {
        if let Some(min) = expected.filter(|m| *m > 0) {
            return ((length * 100) / min).min(99) as u8;
        }
        let opened = self.open_braces + self.open_brackets;
        if opened == 0 {
            return 0;
        }
        let closed = self.close_braces + self.close_brackets;
        ((closed * 100) / opened).min(99) as u8
    }
}

fn scan_structure(text: &str) -> StructureScan {
    let mut scan = StructureScan::default();
    let mut stack: Vec<char> = Vec::new();
    let mut escaped = false;

    for c in text.chars() {
        if scan.in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                scan.in_string = false;
                scan.last_significant = Some('"');
            }
            continue;
        }
        match c {
            '"' => scan.in_string = true,
            '{' => {
                scan.open_braces += 1;
                stack.push('{');
            }
            '[' => {
                scan.open_brackets += 1;
                stack.push('[');
            }
            '}' => {
                scan.close_braces += 1;
                if stack.pop() != Some('{') {
                    scan.mismatched = true;
                }
            }
            ']' => {
                scan.close_brackets += 1;
                if stack.pop() != Some('[') {
                    scan.mismatched = true;
                }
            }
            _ => {}
        }
        if !c.is_whitespace() {
            scan.last_significant = Some(c);
        }
    }
    scan.unclosed = stack.len();
    scan
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::{StageKind, StageSchema};

    fn requires_b() -> StageSchema {
        StageSchema::with_keys(StageKind::Generic, ["b"], None)
    }

    #[test]
    fn truncated_output_is_flagged() {
        let v = JsonValidator::default();
        let r = v.validate(r#"{"a": 1, "b": [1,2,"#, &requires_b());
        assert!(!r.is_valid);
        assert!(r.diagnostics.is_truncated);
        assert_eq!(r.diagnostics.failed_check, Some(FailedCheck::Truncated));
        assert_eq!(r.diagnostics.open_brackets, 1);
        assert_eq!(r.diagnostics.close_brackets, 0);
    }

    #[test]
    fn missing_mandatory_key_is_hard_failure() {
        let v = JsonValidator::default();
        let r = v.validate(r#"{"a":1}"#, &requires_b());
        assert!(!r.is_valid);
        assert!(!r.diagnostics.has_mandatory_keys);
        assert_eq!(r.diagnostics.missing_keys, vec!["b".to_string()]);
        assert_eq!(r.diagnostics.estimated_completeness_pct, 0);
    }

    #[test]
    fn complete_object_passes_without_min_length() {
        let v = JsonValidator::default();
        let r = v.validate(r#"{"a":1,"b":2}"#, &requires_b());
        assert!(r.is_valid, "{:?}", r.errors);
        assert!(r.warnings.is_empty());
        assert!(r.diagnostics.has_mandatory_keys);
        assert_eq!(r.diagnostics.estimated_completeness_pct, 100);
    }

    #[test]
    fn short_output_is_only_a_warning() {
        let v = JsonValidator::default();
        let schema = StageSchema::with_keys(StageKind::Risks, ["risks"], Some(500));
        let r = v.validate(r#"{"risks": []}"#, &schema);
        assert!(r.is_valid);
        assert_eq!(r.warnings.len(), 1);
    }

    #[test]
    fn malformed_is_not_truncated() {
        let v = JsonValidator::default();
        let r = v.validate(r#"{"a": 1]}"#, &StageSchema::generic());
        assert!(!r.is_valid);
        assert!(!r.diagnostics.is_truncated);
        assert_eq!(r.diagnostics.failed_check, Some(FailedCheck::Malformed));
    }

    #[test]
    fn unterminated_string_counts_as_truncation() {
        let v = JsonValidator::default();
        let r = v.validate(r#"{"summary": "the court ruled that"#, &StageSchema::generic());
        assert!(r.diagnostics.is_truncated);
        assert!(r.diagnostics.unterminated_string);
    }

    #[test]
    fn brackets_inside_strings_are_ignored() {
        let scan = scan_structure(r#"{"a": "[{not}]"}"#);
        assert_eq!(scan.open_braces, 1);
        assert_eq!(scan.close_braces, 1);
        assert_eq!(scan.open_brackets, 0);
        assert!(!scan.mismatched);
    }

    #[test]
    fn empty_and_tiny_outputs_rejected() {
        let v = JsonValidator::new(5);
        assert_eq!(
            v.validate("   ", &StageSchema::generic()).diagnostics.failed_check,
            Some(FailedCheck::Empty)
        );
        assert_eq!(
            v.validate("{}", &StageSchema::generic()).diagnostics.failed_check,
            Some(FailedCheck::TooShort)
        );
    }

    #[test]
    fn empty_object_and_arrays_rejected() {
        let v = JsonValidator::new(2);
        let r = v.validate("{ }", &StageSchema::generic());
        assert_eq!(r.diagnostics.failed_check, Some(FailedCheck::EmptyObject));
        let r = v.validate("[1, 2, 3]", &StageSchema::generic());
        assert_eq!(r.diagnostics.failed_check, Some(FailedCheck::NotAnObject));
    }

    #[test]
    fn code_fences_are_stripped() {
        assert_eq!(strip_code_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fences("  {\"a\":1} "), "{\"a\":1}");
        let v = JsonValidator::default();
        assert!(v
            .validate("```json\n{\"a\":1,\"b\":2}\n```", &requires_b())
            .is_valid);
    }
}
