//! Wrapper template population

use crate::models::{Language, TestCase};
use serde_json::Value;
use thiserror::Error;

pub const USER_CODE_PLACEHOLDER: &str = "{{__USER_CODE__}}";
pub const TESTCASES_PLACEHOLDER: &str = "{{__TESTCASES_JSON__}}";

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("Test case {index} has malformed {field}: {source}")]
    MalformedTestCase {
        index: usize,
        field: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("Test case {index} {field} is not an integer array")]
    NotAnIntArray { index: usize, field: &'static str },

    #[error("Wrapper code is not a JSON string: {0}")]
    MalformedWrapper(#[source] serde_json::Error),
}

/// Wrapper code is stored JSON-encoded upstream
pub fn decode_wrapper(raw: &str) -> Result<String, TemplateError> {
    serde_json::from_str(raw).map_err(TemplateError::MalformedWrapper)
}

/// Substitute the user's code and the test cases into `template`.
///
/// Only the first occurrence of each placeholder is replaced.
pub fn populate_template(
    language: Language,
    template: &str,
    user_code: &str,
    test_cases: &[TestCase],
) -> Result<String, TemplateError> {
    let cases = match language {
        Language::Javascript | Language::Python => json_cases(test_cases)?,
        Language::Go => go_cases(test_cases)?,
    };

    Ok(template
        .replacen(USER_CODE_PLACEHOLDER, user_code, 1)
        .replacen(TESTCASES_PLACEHOLDER, &cases, 1))
}

fn parse_field(index: usize, field: &'static str, raw: &str) -> Result<Value, TemplateError> {
    serde_json::from_str(raw).map_err(|source| TemplateError::MalformedTestCase {
        index,
        field,
        source,
    })
}

fn json_cases(test_cases: &[TestCase]) -> Result<String, TemplateError> {
    let cases = test_cases
        .iter()
        .enumerate()
        .map(|(i, tc)| {
            Ok(serde_json::json!({
                "input": parse_field(i, "input", &tc.input)?,
                "output": parse_field(i, "output", &tc.output)?,
            }))
        })
        .collect::<Result<Vec<_>, TemplateError>>()?;

    Ok(Value::Array(cases).to_string())
}

fn int_list(index: usize, field: &'static str, raw: &str) -> Result<String, TemplateError> {
    let values = match parse_field(index, field, raw)? {
        Value::Array(values) => values,
        _ => return Err(TemplateError::NotAnIntArray { index, field }),
    };

    let ints = values
        .iter()
        .map(|v| v.as_i64().ok_or(TemplateError::NotAnIntArray { index, field }))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(ints
        .iter()
        .map(i64::to_string)
        .collect::<Vec<_>>()
        .join(", "))
}

fn go_cases(test_cases: &[TestCase]) -> Result<String, TemplateError> {
    let literals = test_cases
        .iter()
        .enumerate()
        .map(|(i, tc)| {
            Ok(format!(
                "{{\n    Input: []int{{{}}},\n    Output: []int{{{}}},\n}},",
                int_list(i, "input", &tc.input)?,
                int_list(i, "output", &tc.output)?
            ))
        })
        .collect::<Result<Vec<_>, TemplateError>>()?;

    Ok(literals.join("\n"))
}
