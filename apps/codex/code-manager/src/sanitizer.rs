//! Static screening of user code before it is dispatched

use crate::models::Language;
use once_cell::sync::Lazy;
use regex::Regex;

pub const MAX_CODE_LENGTH: usize = 10_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SanitizeOutcome {
    pub valid: bool,
    pub error: Option<String>,
}

impl SanitizeOutcome {
    pub fn valid() -> Self {
        Self {
            valid: true,
            error: None,
        }
    }

    pub fn rejected(error: impl Into<String>) -> Self {
        Self {
            valid: false,
            error: Some(error.into()),
        }
    }
}

#[cfg_attr(test, mockall::automock)]
pub trait CodeSanitizer: Send + Sync {
    fn sanitize(&self, code: &str, language: Language) -> SanitizeOutcome;
}

struct PatternCategory {
    description: &'static str,
    patterns: Vec<Regex>,
}

impl PatternCategory {
    fn new(description: &'static str, patterns: &[&str]) -> Self {
        Self {
            description,
            patterns: patterns
                .iter()
                .filter_map(|p| match Regex::new(p) {
                    Ok(re) => Some(re),
                    Err(e) => {
                        tracing::error!(pattern = %p, error = %e, "Invalid sanitizer pattern");
                        None
                    }
                })
                .collect(),
        }
    }

    fn first_match(&self, code: &str) -> Option<&Regex> {
        self.patterns.iter().find(|re| re.is_match(code))
    }
}

static COMMON: Lazy<Vec<PatternCategory>> = Lazy::new(|| {
    vec![
        PatternCategory::new(
            "Code patterns that can lead to resource exhaustion.",
            &[
                r"(?i)while\s*\(\s*true\s*\)",
                r"for\s*\(\s*;\s*;\s*\)",
                r"(?i)\.repeat\s*\(\s*Infinity\s*\)",
            ],
        ),
        PatternCategory::new(
            "Patterns that create an excessive number of processes.",
            &[
                r"(?i)while\s*\(\s*true\s*\)\s*\{\s*fork\s*\(\s*\)",
                r"os\.fork\(",
                r"Process\.fork\(",
                r"cluster\.fork\(",
                r"multiprocessing\.Process",
            ],
        ),
    ]
});

static JAVASCRIPT: Lazy<Vec<PatternCategory>> = Lazy::new(|| {
    vec![
        PatternCategory::new(
            "Disallows importing core Node.js modules that can interact with the OS.",
            &[
                r#"require\s*\(\s*['"`]fs['"`]\s*\)"#,
                r#"require\s*\(\s*['"`]child_process['"`]\s*\)"#,
                r#"require\s*\(\s*['"`]os['"`]\s*\)"#,
                r#"require\s*\(\s*['"`]net['"`]\s*\)"#,
                r#"require\s*\(\s*['"`]http['"`]\s*\)"#,
                r#"import\s+.*\s+from\s+['"`]fs['"`]"#,
                r#"import\s+.*\s+from\s+['"`]child_process['"`]"#,
            ],
        ),
        PatternCategory::new(
            "Disallows access to global objects and functions that can be abused.",
            &[
                r"\bprocess\b",
                r"\bglobal\b",
                r"\bFunction\s*\(",
                r"\beval\s*\(",
                r"\bwindow\b",
                r"\bdocument\b",
                r"\blocalStorage\b",
                r"\bWebSocket\b",
            ],
        ),
    ]
});

static PYTHON: Lazy<Vec<PatternCategory>> = Lazy::new(|| {
    vec![
        PatternCategory::new(
            "Disallows importing Python modules that can interact with the OS.",
            &[
                r"import\s+os",
                r"import\s+subprocess",
                r"import\s+sys",
                r"import\s+shutil",
                r"from\s+os\s+import",
            ],
        ),
        PatternCategory::new(
            "Disallows dangerous built-in functions and system calls.",
            &[
                r"__import__\s*\(",
                r"open\s*\(",
                r"eval\s*\(",
                r"exec\s*\(",
                r"os\.system",
                r"subprocess\.run",
                r"subprocess\.Popen",
            ],
        ),
    ]
});

static GO: Lazy<Vec<PatternCategory>> = Lazy::new(|| {
    vec![
        PatternCategory::new(
            "Disallows importing Go packages that can interact with the OS.",
            &[r#""os""#, r#""os/exec""#, r#""syscall""#, r#""net""#],
        ),
        PatternCategory::new(
            "Disallows specific dangerous functions.",
            &[
                r"os\.Remove",
                r"os\.RemoveAll",
                r"os\.Exit",
                r"exec\.Command",
                r"syscall\.Exec",
            ],
        ),
    ]
});

/// Regex-driven sanitizer: length limit, then common categories, then the language's own
#[derive(Debug, Clone, Copy, Default)]
pub struct PatternSanitizer;

impl PatternSanitizer {
    pub fn new() -> Self {
        Self
    }

    fn language_categories(language: Language) -> &'static [PatternCategory] {
        match language {
            Language::Javascript => &JAVASCRIPT,
            Language::Python => &PYTHON,
            Language::Go => &GO,
        }
    }
}

impl CodeSanitizer for PatternSanitizer {
    fn sanitize(&self, code: &str, language: Language) -> SanitizeOutcome {
        if code.chars().count() > MAX_CODE_LENGTH {
            return SanitizeOutcome::rejected(format!(
                "Syntax Error: Code length exceeds maximum limit of {} characters.",
                MAX_CODE_LENGTH
            ));
        }

        for category in COMMON.iter() {
            if let Some(re) = category.first_match(code) {
                return SanitizeOutcome::rejected(format!(
                    "Syntax Error: Prohibited operation detected: {} (pattern: {})",
                    category.description,
                    re.as_str()
                ));
            }
        }

        for category in Self::language_categories(language) {
            if let Some(re) = category.first_match(code) {
                return SanitizeOutcome::rejected(format!(
                    "Syntax Error: Prohibited {} operation detected: {} (pattern: {})",
                    language,
                    category.description,
                    re.as_str()
                ));
            }
        }

        SanitizeOutcome::valid()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(code: &str, language: Language) -> SanitizeOutcome {
        PatternSanitizer::new().sanitize(code, language)
    }

    #[test]
    fn test_plain_code_is_valid() {
        let code = "function twoSum(nums, target) {\n  return [0, 1];\n}";
        assert_eq!(check(code, Language::Javascript), SanitizeOutcome::valid());

        let code = "def two_sum(nums, target):\n    return [0, 1]";
        assert!(check(code, Language::Python).valid);

        let code = "func twoSum(nums []int, target int) []int {\n\treturn []int{0, 1}\n}";
        assert!(check(code, Language::Go).valid);
    }

    #[test]
    fn test_length_limit() {
        let code = "a".repeat(MAX_CODE_LENGTH + 1);
        let outcome = check(&code, Language::Python);

        assert!(!outcome.valid);
        assert_eq!(
            outcome.error.as_deref(),
            Some("Syntax Error: Code length exceeds maximum limit of 10000 characters.")
        );
        assert!(check(&"a".repeat(MAX_CODE_LENGTH), Language::Python).valid);
    }

    #[test]
    fn test_common_patterns_apply_to_every_language() {
        for language in [Language::Javascript, Language::Python, Language::Go] {
            let outcome = check("while (TRUE) { x++ }", language);
            let error = outcome.error.unwrap();
            assert!(error.starts_with("Syntax Error: Prohibited operation detected"));
            assert!(error.contains("resource exhaustion"));
        }
    }

    #[test]
    fn test_language_specific_rejections() {
        let outcome = check("const fs = require('fs');", Language::Javascript);
        assert!(outcome
            .error
            .unwrap()
            .starts_with("Syntax Error: Prohibited javascript operation detected"));

        assert!(!check("import subprocess", Language::Python).valid);
        assert!(!check("import (\n\t\"os/exec\"\n)", Language::Go).valid);
        assert!(!check("exec.Command(\"ls\")", Language::Go).valid);
    }

    #[test]
    fn test_patterns_are_language_scoped() {
        // `eval(` is only screened for JavaScript and Python
        assert!(check("x := eval(y)", Language::Go).valid);
        assert!(!check("eval(y)", Language::Python).valid);
    }

    #[test]
    fn test_word_boundaries() {
        assert!(check("const processed = 1;", Language::Javascript).valid);
        assert!(!check("process.exit(1)", Language::Javascript).valid);
    }
}
