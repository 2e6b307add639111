/// Output Matcher
///
/// Decides whether a program's actual output is equivalent to the expected
/// output. Used for both stdout and stderr of judge tasks.
///
/// **Equivalence Rules:**
/// - Split on `\n`, trim every line, drop lines that are empty after trimming
/// - Both sides must keep the same number of lines
/// - Each line pair must split into the same number of whitespace-separated tokens
/// - Tokens are compared exactly (case-sensitive, no float tolerance)
///
/// So `"1  2\n\n3\r\n"` matches `"1 2\n3"`, but `"1 2 3"` does not match
/// `"1 2\n3"`: line structure is significant, blank lines and spacing are not.

fn significant_lines(output: &str) -> Vec<&str> {
    output
        .split('\n')
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect()
}

/// Returns true when `actual` is equivalent to `expected`.
pub fn matches(expected: &str, actual: &str) -> bool {
    let expected = significant_lines(expected);
    let actual = significant_lines(actual);

    if expected.len() != actual.len() {
        return false;
    }

    expected.iter().zip(actual.iter()).all(|(want, got)| {
        let want: Vec<&str> = want.split_whitespace().collect();
        let got: Vec<&str> = got.split_whitespace().collect();
        want == got
    })
}
