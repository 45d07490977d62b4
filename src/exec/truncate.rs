use serde::Serialize;

/// Default line budget when the caller does not supply one.
pub const DEFAULT_MAX_OUTPUT_LINES: usize = 300;

/// A single line longer than this trips the long-line marker.
const MAX_LINE_CHARS: usize = 10_000;

/// Bytes probed when sniffing for binary content.
const BINARY_PROBE_BYTES: usize = 1024;

/// Fraction of non-printable bytes in the probe that marks output binary.
const BINARY_THRESHOLD: f64 = 0.30;

pub const BINARY_MARKER: &str = "Binary output detected — content omitted";
pub const LONG_LINE_MARKER: &str = "Output contains extremely long lines - content omitted";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TruncationKind {
    Binary,
    LongLines,
    LineBudget,
}

/// Records what was cut. Original counts always reflect the untruncated
/// output.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TruncationInfo {
    pub kind: TruncationKind,
    pub original_lines: usize,
    pub original_bytes: usize,
    pub returned_lines: usize,
    pub omitted_lines: usize,
}

/// Apply the uniform output truncation rules, in order: binary sniff,
/// long-line guard, line budget (keep the first 60% and last 40% of the
/// budget with an omission marker spliced between).
pub fn truncate_output(text: &str, max_lines: usize) -> (String, Option<TruncationInfo>) {
    let original_bytes = text.len();
    let original_lines = text.lines().count();

    if looks_binary(text.as_bytes()) {
        return (
            BINARY_MARKER.to_string(),
            Some(TruncationInfo {
                kind: TruncationKind::Binary,
                original_lines,
                original_bytes,
                returned_lines: 1,
                omitted_lines: original_lines,
            }),
        );
    }

    if text.lines().any(|l| l.chars().count() > MAX_LINE_CHARS) {
        return (
            LONG_LINE_MARKER.to_string(),
            Some(TruncationInfo {
                kind: TruncationKind::LongLines,
                original_lines,
                original_bytes,
                returned_lines: 1,
                omitted_lines: original_lines,
            }),
        );
    }

    let max_lines = max_lines.max(2);
    if original_lines <= max_lines {
        return (text.to_string(), None);
    }

    let head_budget = max_lines * 60 / 100;
    let tail_budget = max_lines - head_budget;
    let omitted = original_lines - head_budget - tail_budget;

    let lines: Vec<&str> = text.lines().collect();
    let mut out = String::with_capacity(text.len().min(max_lines * 80));
    for line in &lines[..head_budget] {
        out.push_str(line);
        out.push('\n');
    }
    out.push_str(&format!("[... {omitted} lines omitted ...]\n"));
    for line in &lines[original_lines - tail_budget..] {
        out.push_str(line);
        out.push('\n');
    }

    (
        out,
        Some(TruncationInfo {
            kind: TruncationKind::LineBudget,
            original_lines,
            original_bytes,
            returned_lines: head_budget + tail_budget + 1,
            omitted_lines: omitted,
        }),
    )
}

/// Probe the first 1 KiB: a null byte, or more than 30% non-printable bytes
/// (tabs and newlines excluded), marks the output binary.
fn looks_binary(bytes: &[u8]) -> bool {
    let probe = &bytes[..bytes.len().min(BINARY_PROBE_BYTES)];
    if probe.is_empty() {
        return false;
    }
    if probe.contains(&0) {
        return true;
    }
    let non_printable = probe
        .iter()
        .filter(|&&b| b < 0x20 && b != b'\n' && b != b'\r' && b != b'\t')
        .count();
    non_printable as f64 / probe.len() as f64 > BINARY_THRESHOLD
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_text_passes_through() {
        let (out, info) = truncate_output("hello\nworld\n", 100);
        assert_eq!(out, "hello\nworld\n");
        assert!(info.is_none());
    }

    #[test]
    fn null_byte_marks_binary() {
        let (out, info) = truncate_output("abc\0def", 100);
        assert_eq!(out, BINARY_MARKER);
        assert_eq!(info.unwrap().kind, TruncationKind::Binary);
    }

    #[test]
    fn mostly_control_bytes_mark_binary() {
        let noisy: String = (0..100u8)
            .map(|i| if i % 2 == 0 { '\u{1}' } else { 'a' })
            .collect();
        let (out, _) = truncate_output(&noisy, 100);
        assert_eq!(out, BINARY_MARKER);
    }

    #[test]
    fn extremely_long_line_replaced_by_marker() {
        let long = "x".repeat(10_001);
        let (out, info) = truncate_output(&long, 100);
        assert_eq!(out, LONG_LINE_MARKER);
        assert_eq!(info.unwrap().kind, TruncationKind::LongLines);
    }

    #[test]
    fn budget_keeps_head_and_tail() {
        let text: String = (1..=100).map(|i| format!("line{i}\n")).collect();
        let (out, info) = truncate_output(&text, 10);
        let info = info.unwrap();
        assert_eq!(info.kind, TruncationKind::LineBudget);
        assert_eq!(info.original_lines, 100);
        assert_eq!(info.omitted_lines, 90);

        let lines: Vec<&str> = out.lines().collect();
        // 6 head + marker + 4 tail
        assert_eq!(lines.len(), 11);
        assert_eq!(lines[0], "line1");
        assert_eq!(lines[5], "line6");
        assert!(lines[6].contains("90 lines omitted"));
        assert_eq!(lines[7], "line97");
        assert_eq!(lines[10], "line100");
    }

    #[test]
    fn exact_budget_is_untouched() {
        let text: String = (1..=10).map(|i| format!("line{i}\n")).collect();
        let (out, info) = truncate_output(&text, 10);
        assert_eq!(out, text);
        assert!(info.is_none());
    }
}
