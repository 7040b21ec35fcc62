//! Unified diff previews
//!
//! Pure rendering: the same inputs always produce the same lines. The preview
//! is cut to a fixed number of lines so it fits in a chat message.

use similar::{Algorithm, ChangeTag, TextDiff};

/// Context lines around each change
const CONTEXT_RADIUS: usize = 3;

/// Marker appended when a preview is cut short
pub const TRUNCATION_MARKER: &str = "... (truncated)";

/// A rendered, possibly truncated, unified diff
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffPreview {
    /// Rendered lines, including the truncation marker if any
    pub lines: Vec<String>,
    /// Whether lines were dropped
    pub truncated: bool,
    /// Line count of the full diff before truncation
    pub total_lines: usize,
}

impl DiffPreview {
    /// Whether the two inputs differed at all
    pub fn has_changes(&self) -> bool {
        self.total_lines > 0
    }
}

impl std::fmt::Display for DiffPreview {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.lines.join("\n"))
    }
}

/// Diff two texts line by line
pub fn render_diff(original: &str, proposed: &str, max_lines: usize) -> DiffPreview {
    let old: Vec<&str> = original.lines().collect();
    let new: Vec<&str> = proposed.lines().collect();
    render_line_diff(&old, &new, max_lines)
}

/// Diff two line sequences, keeping the first `max_lines` lines of output
pub fn render_line_diff(original: &[&str], proposed: &[&str], max_lines: usize) -> DiffPreview {
    let full = unified_lines(original, proposed);
    let total_lines = full.len();

    if total_lines <= max_lines {
        return DiffPreview {
            lines: full,
            truncated: false,
            total_lines,
        };
    }

    let mut lines: Vec<String> = full.into_iter().take(max_lines).collect();
    lines.push(TRUNCATION_MARKER.to_string());
    DiffPreview {
        lines,
        truncated: true,
        total_lines,
    }
}

fn unified_lines(original: &[&str], proposed: &[&str]) -> Vec<String> {
    let diff = TextDiff::configure()
        .algorithm(Algorithm::Myers)
        .diff_slices(original, proposed);

    let groups = diff.grouped_ops(CONTEXT_RADIUS);
    if groups.is_empty() {
        return Vec::new();
    }

    let mut out = vec!["--- before".to_string(), "+++ after".to_string()];

    for group in &groups {
        let (Some(first), Some(last)) = (group.first(), group.last()) else {
            continue;
        };
        let old_start = first.old_range().start;
        let old_len = last.old_range().end - old_start;
        let new_start = first.new_range().start;
        let new_len = last.new_range().end - new_start;

        out.push(format!(
            "@@ -{} +{} @@",
            hunk_range(old_start, old_len),
            hunk_range(new_start, new_len)
        ));

        for op in group {
            for change in diff.iter_changes(op) {
                let sign = match change.tag() {
                    ChangeTag::Equal => ' ',
                    ChangeTag::Delete => '-',
                    ChangeTag::Insert => '+',
                };
                out.push(format!("{}{}", sign, change.value()));
            }
        }
    }

    out
}

/// `start,len` in unified diff convention (1-based, empty ranges name the
/// line before)
fn hunk_range(start: usize, len: usize) -> String {
    match len {
        0 => format!("{},0", start),
        1 => format!("{}", start + 1),
        _ => format!("{},{}", start + 1, len),
    }
}
