//! Splitting submitted code into markdown and code cells.

use super::cell::CellType;

/// A piece of submitted code destined for one cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitCell {
    pub cell_type: CellType,
    pub source: Vec<String>,
    /// Line of the first source line, relative to the submission.
    pub line_offset: u32,
}

/// Whether a line opens a markdown cell (`#%% [markdown]`, `# %% [markdown]`,
/// `# <markdowncell>`).
pub fn is_markdown_marker(line: &str) -> bool {
    let compact: String = line
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_ascii_lowercase();
    compact.starts_with("#%%[markdown]") || compact.starts_with("#<markdowncell>")
}

fn triple_quote(line: &str) -> Option<&'static str> {
    ["\"\"\"", "'''"]
        .into_iter()
        .find(|q| line.starts_with(q))
}

/// Index of the first line after the marker that is not markdown text.
///
/// Blank lines, comments, and lines inside a triple-quoted block count as
/// markdown.
fn first_code_line(lines: &[&str]) -> Option<usize> {
    let mut open: Option<&str> = None;
    for (i, line) in lines.iter().enumerate().skip(1) {
        let trimmed = line.trim();
        if let Some(delim) = open {
            if trimmed.contains(delim) {
                open = None;
            }
            continue;
        }
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        if let Some(delim) = triple_quote(trimmed) {
            if !trimmed[delim.len()..].contains(delim) {
                open = Some(delim);
            }
            continue;
        }
        return Some(i);
    }
    None
}

/// Split submitted code into the cells it describes.
pub fn split_cells(code: &str) -> Vec<SplitCell> {
    let lines: Vec<&str> = code.lines().collect();
    let owned = |range: &[&str]| range.iter().map(|l| l.to_string()).collect::<Vec<_>>();

    let starts_markdown = lines.first().is_some_and(|l| is_markdown_marker(l));
    if !starts_markdown {
        return vec![SplitCell {
            cell_type: CellType::Code,
            source: owned(&lines),
            line_offset: 0,
        }];
    }

    match first_code_line(&lines) {
        Some(code_start) => vec![
            SplitCell {
                cell_type: CellType::Markdown,
                source: owned(&lines[1..code_start]),
                line_offset: 0,
            },
            SplitCell {
                cell_type: CellType::Code,
                source: owned(&lines[code_start..]),
                line_offset: code_start as u32,
            },
        ],
        None => vec![SplitCell {
            cell_type: CellType::Markdown,
            source: owned(&lines[1..]),
            line_offset: 0,
        }],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_markers() {
        assert!(is_markdown_marker("#%% [markdown]"));
        assert!(is_markdown_marker("# %% [markdown]"));
        assert!(is_markdown_marker("# <markdowncell>"));
        assert!(is_markdown_marker("  #%%   [Markdown]"));
        assert!(!is_markdown_marker("#%%"));
        assert!(!is_markdown_marker("# In[3]"));
    }

    #[test]
    fn test_plain_code_is_one_cell() {
        let cells = split_cells("a=1\na");
        assert_eq!(cells.len(), 1);
        assert_eq!(cells[0].cell_type, CellType::Code);
        assert_eq!(cells[0].source, vec!["a=1", "a"]);
    }

    #[test]
    fn test_markdown_then_code() {
        let cells = split_cells("#%% [markdown]\n# Title\n# more text\nprint(1)");
        assert_eq!(cells.len(), 2);
        assert_eq!(cells[0].cell_type, CellType::Markdown);
        assert_eq!(cells[0].source, vec!["# Title", "# more text"]);
        assert_eq!(cells[1].cell_type, CellType::Code);
        assert_eq!(cells[1].source, vec!["print(1)"]);
        assert_eq!(cells[1].line_offset, 3);
    }

    #[test]
    fn test_triple_quoted_markdown() {
        let code = "# <markdowncell>\n\"\"\"\nSome prose\nprint(not code)\n\"\"\"\n\nx = 2";
        let cells = split_cells(code);
        assert_eq!(cells.len(), 2);
        assert_eq!(cells[0].source.len(), 5);
        assert_eq!(cells[1].source, vec!["x = 2"]);
        assert_eq!(cells[1].line_offset, 6);

        let single = split_cells("#%% [markdown]\n'''one line'''\ny = 1");
        assert_eq!(single[1].line_offset, 2);
    }

    #[test]
    fn test_all_markdown() {
        let cells = split_cells("#%% [markdown]\n# only\n\n# prose");
        assert_eq!(cells.len(), 1);
        assert_eq!(cells[0].cell_type, CellType::Markdown);
        assert_eq!(cells[0].source, vec!["# only", "", "# prose"]);
    }
}
