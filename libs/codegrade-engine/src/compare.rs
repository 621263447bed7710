// Output comparison policies

use codegrade_common::types::ComparisonPolicy;

pub fn outputs_match(actual: &str, expected: &str, policy: ComparisonPolicy) -> bool {
    match policy {
        ComparisonPolicy::Exact => actual.as_bytes() == expected.as_bytes(),
        ComparisonPolicy::Whitespace => normalize(actual) == normalize(expected),
    }
}

/// Collapse runs of whitespace inside each line, strip leading/trailing
/// whitespace per line, unify line endings and drop trailing blank lines
fn normalize(text: &str) -> Vec<String> {
    let mut lines: Vec<String> = text
        .lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .collect();

    while lines.last().is_some_and(|line| line.is_empty()) {
        lines.pop();
    }
    lines
}
