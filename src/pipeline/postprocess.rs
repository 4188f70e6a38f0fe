//! Deterministic cleanup applied to every generated markdown text.
//!
//! Generated text is cleaned once, when the candidate is created, so every
//! round of a page's history, the meta-reasoned text and a fallback all share
//! the same normal form. Rules run in order; each is a pure `&str → String`.

use once_cell::sync::Lazy;
use regex::Regex;

type Rule = fn(&str) -> String;

const RULES: &[(&str, Rule)] = &[
    ("line-endings", normalise_line_endings),
    ("fences", strip_outer_fences),
    ("preamble", strip_chat_preamble),
    ("trailing-whitespace", trim_trailing_whitespace),
    ("invisible-chars", remove_invisible_chars),
    ("table-separators", remove_mid_table_separators),
    ("blank-lines", collapse_blank_lines),
    ("final-newline", ensure_final_newline),
];

/// Apply every cleanup rule in order.
pub fn clean_markdown(input: &str) -> String {
    RULES
        .iter()
        .fold(input.to_string(), |text, (_, rule)| rule(&text))
}

fn normalise_line_endings(input: &str) -> String {
    input.replace("\r\n", "\n").replace('\r', "\n")
}

static RE_OUTER_FENCES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^```(?:markdown|md)?[ \t]*\n(.*?)\n```$").unwrap());

/// Models wrap output in a ```markdown fence despite being told not to.
fn strip_outer_fences(input: &str) -> String {
    match RE_OUTER_FENCES.captures(input.trim()) {
        Some(caps) => caps[1].to_string(),
        None => input.to_string(),
    }
}

static RE_PREAMBLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(here is|here's|below is|sure[,!])[^\n]*(markdown|conversion|version|translation)[^\n]*:\s*\n")
        .unwrap()
});

/// Drop a single conversational lead-in line such as "Here is the improved Markdown:".
fn strip_chat_preamble(input: &str) -> String {
    let trimmed = input.trim_start();
    match RE_PREAMBLE.find(trimmed) {
        Some(m) => trimmed[m.end()..].to_string(),
        None => input.to_string(),
    }
}

fn trim_trailing_whitespace(input: &str) -> String {
    input
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
}

fn remove_invisible_chars(input: &str) -> String {
    input.replace(
        ['\u{200B}', '\u{200C}', '\u{200D}', '\u{2060}', '\u{FEFF}', '\u{00AD}'],
        "",
    )
}

fn is_table_row(line: &str) -> bool {
    let t = line.trim();
    t.len() > 2 && t.starts_with('|') && t.ends_with('|')
}

fn is_separator_row(line: &str) -> bool {
    let t = line.trim();
    t.starts_with('|') && t.contains('-') && t.chars().all(|c| matches!(c, '|' | '-' | ':' | ' '))
}

/// GFM allows a separator only as the second row of a table.
fn remove_mid_table_separators(input: &str) -> String {
    let mut out: Vec<&str> = Vec::new();
    let mut row_in_table = 0usize;
    for line in input.lines() {
        if !is_table_row(line) {
            row_in_table = 0;
            out.push(line);
            continue;
        }
        row_in_table += 1;
        if is_separator_row(line) && row_in_table != 2 {
            continue;
        }
        out.push(line);
    }
    out.join("\n")
}

static RE_BLANK_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").unwrap());

fn collapse_blank_lines(input: &str) -> String {
    RE_BLANK_RUN.replace_all(input, "\n\n").into_owned()
}

fn ensure_final_newline(input: &str) -> String {
    let trimmed = input.trim_matches('\n').trim_end();
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{trimmed}\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_fences_and_crlf() {
        let out = clean_markdown("```markdown\r\n# Title\r\n\r\nBody\r\n```");
        assert_eq!(out, "# Title\n\nBody\n");
    }

    #[test]
    fn passthrough_plain_markdown() {
        assert_eq!(clean_markdown("# Hello\n\nWorld"), "# Hello\n\nWorld\n");
    }

    #[test]
    fn inner_code_block_is_kept() {
        let input = "Intro\n\n```rust\nfn main() {}\n```\n\nOutro";
        assert_eq!(clean_markdown(input), format!("{input}\n"));
    }

    #[test]
    fn drops_chat_preamble() {
        let out = clean_markdown("Here is the improved Markdown:\n\n# Report\n");
        assert_eq!(out, "# Report\n");
        let kept = clean_markdown("Here is a list of items\n- a");
        assert!(kept.starts_with("Here is a list"));
    }

    #[test]
    fn collapses_blank_runs() {
        assert_eq!(clean_markdown("a\n\n\n\n\nb"), "a\n\nb\n");
    }

    #[test]
    fn removes_invisible_characters() {
        assert_eq!(clean_markdown("he\u{200B}llo\u{FEFF}"), "hello\n");
    }

    #[test]
    fn removes_mid_table_separator() {
        let input = "| A | B |\n| --- | --- |\n| 1 | 2 |\n| --- | --- |\n| 3 | 4 |";
        let out = clean_markdown(input);
        assert_eq!(out.lines().filter(|l| is_separator_row(l)).count(), 1);
        assert!(out.contains("| 3 | 4 |"));
    }

    #[test]
    fn empty_output_stays_empty() {
        assert_eq!(clean_markdown("  \n\n "), "");
    }

    #[test]
    fn cleaning_is_stable() {
        let once = clean_markdown("```\n# T\n\n\n\nx  \n```");
        assert_eq!(clean_markdown(&once), once);
    }
}
