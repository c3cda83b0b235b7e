//! Block-text post-processing for Bot-stream delivery.
//! `<think>…</think>` spans are round-tripped through a placeholder token
//! so markdown-table conversion can't corrupt chain-of-thought content, then
//! any markdown tables in the remainder are rewritten per [`TableMode`].

/// How delivered markdown tables are rendered for the Bot passive-stream
/// surface, which has no table-rendering widget of its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TableMode {
    /// Leave markdown tables untouched.
    #[default]
    Off,
    /// Rewrite `| a | b |` rows into a column-aligned plain-text block.
    PlainText,
}

const THINK_OPEN: &str = "<think>";
const THINK_CLOSE: &str = "</think>";
const PLACEHOLDER_PREFIX: char = '\u{e000}';

/// Applies think-tag protection, then table conversion, to one delivered
/// block's text.
pub fn apply(text: &str, mode: TableMode) -> String {
    let (protected, spans) = protect_think_blocks(text);
    let converted = match mode {
        TableMode::Off => protected,
        TableMode::PlainText => convert_tables(&protected),
    };
    restore_think_blocks(&converted, &spans)
}

fn protect_think_blocks(text: &str) -> (String, Vec<String>) {
    let mut spans = Vec::new();
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find(THINK_OPEN) {
        let Some(end_rel) = rest[start..].find(THINK_CLOSE) else {
            out.push_str(rest);
            rest = "";
            break;
        };
        let end = start + end_rel + THINK_CLOSE.len();
        out.push_str(&rest[..start]);
        out.push(PLACEHOLDER_PREFIX);
        out.push_str(&spans.len().to_string());
        out.push(PLACEHOLDER_PREFIX);
        spans.push(rest[start..end].to_string());
        rest = &rest[end..];
    }
    out.push_str(rest);
    (out, spans)
}

fn restore_think_blocks(text: &str, spans: &[String]) -> String {
    let mut out = text.to_string();
    for (i, span) in spans.iter().enumerate() {
        let token = format!("{PLACEHOLDER_PREFIX}{i}{PLACEHOLDER_PREFIX}");
        out = out.replacen(&token, span, 1);
    }
    out
}

fn convert_tables(text: &str) -> String {
    let mut out: Vec<String> = Vec::new();
    let mut block: Vec<Vec<String>> = Vec::new();
    for line in text.lines() {
        if is_table_row(line) {
            if !is_separator_row(line) {
                block.push(split_row(line));
            }
        } else {
            if !block.is_empty() {
                out.extend(render_block(&block));
                block.clear();
            }
            out.push(line.to_string());
        }
    }
    if !block.is_empty() {
        out.extend(render_block(&block));
    }
    out.join("\n")
}

fn is_table_row(line: &str) -> bool {
    let t = line.trim();
    t.len() > 1 && t.starts_with('|') && t.ends_with('|')
}

fn is_separator_row(line: &str) -> bool {
    line.trim().trim_matches('|').split('|').all(|cell| {
        let c = cell.trim();
        !c.is_empty() && c.chars().all(|ch| ch == '-' || ch == ':')
    })
}

fn split_row(line: &str) -> Vec<String> {
    line.trim()
        .trim_matches('|')
        .split('|')
        .map(|c| c.trim().to_string())
        .collect()
}

fn render_block(rows: &[Vec<String>]) -> Vec<String> {
    let cols = rows.iter().map(|r| r.len()).max().unwrap_or(0);
    let mut widths = vec![0usize; cols];
    for row in rows {
        for (i, cell) in row.iter().enumerate() {
            widths[i] = widths[i].max(cell.chars().count());
        }
    }
    rows.iter()
        .map(|row| {
            row.iter()
                .enumerate()
                .map(|(i, cell)| format!("{cell:<width$}", width = widths[i]))
                .collect::<Vec<_>>()
                .join("  ")
                .trim_end()
                .to_string()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn think_block_survives_table_conversion_untouched() {
        let text = "<think>| a | b |\n|---|---|</think>\n| x | y |\n|---|---|\n| 1 | 2 |";
        let out = apply(text, TableMode::PlainText);
        assert!(out.contains("<think>| a | b |\n|---|---|</think>"));
        assert!(out.contains("x  y"));
        assert!(out.contains("1  2"));
    }

    #[test]
    fn off_mode_leaves_tables_untouched() {
        let text = "| x | y |\n|---|---|\n| 1 | 2 |";
        assert_eq!(apply(text, TableMode::Off), text);
    }

    #[test]
    fn separator_row_is_dropped_and_columns_aligned() {
        let text = "| name | age |\n|---|---|\n| alice | 30 |\n| bob | 7 |";
        let out = convert_tables(text);
        assert!(!out.contains("---"));
        assert!(out.contains("name   age"));
        assert!(out.contains("alice  30"));
    }

    #[test]
    fn unterminated_think_tag_passes_through() {
        let text = "before <think>never closes";
        let out = apply(text, TableMode::PlainText);
        assert_eq!(out, text);
    }
}
