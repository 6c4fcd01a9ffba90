//! # Pretty printing
//!
//! Terminal rendering for reports and SQL.
//!
//! Reports arrive as markdown, usually a couple of headings, some bullet points,
//! a table copied from the result set and now and then a ```` ```sql ```` block.
//! [`PrettyPrinter`] renders that stream line by line as chunks come in:
//!
//! | Markdown                | Terminal                       |
//! |-------------------------|--------------------------------|
//! | `# ..`, `## ..`, `### ..` | bold cyan                    |
//! | `- item`, `* item`      | `  • item`                     |
//! | `\|---\|---\|`          | dark grey table rule           |
//! | `**bold**`, `*italic*`  | bold, italic                   |
//! | `` `code` ``            | yellow                         |
//! | fenced block            | syntect, `base16-ocean.dark`   |
//!
//! A line is printed once its newline arrives; a fenced block once its closing
//! fence arrives. [`PrettyPrinter::flush`] prints whatever is left, including an
//! unterminated block.

use std::io::{self, Stdout, Write, stdout};

use crossterm::{
    QueueableCommand,
    style::{Attribute, Color, ResetColor, SetAttribute, SetForegroundColor},
};
use once_cell::sync::Lazy;
use regex::Regex;
use syntect::{
    easy::HighlightLines,
    highlighting::ThemeSet,
    parsing::{SyntaxReference, SyntaxSet},
    util::{LinesWithEndings, as_24_bit_terminal_escaped},
};

use crate::error::Result;

const THEME: &str = "base16-ocean.dark";

static SYNTAXES: Lazy<SyntaxSet> = Lazy::new(SyntaxSet::load_defaults_newlines);
static THEMES: Lazy<ThemeSet> = Lazy::new(ThemeSet::load_defaults);

static INLINE_CODE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"`([^`]+)`").expect("inline code pattern is valid"));
static BOLD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\*\*([^*]+)\*\*").expect("bold pattern is valid"));
static ITALIC: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\*([^*\s][^*]*)\*").expect("italic pattern is valid"));
static TABLE_RULE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\|(\s*:?-+:?\s*\|)+$").expect("table rule pattern is valid"));

/// Render a complete markdown text to stdout.
pub fn print_pretty(text: &str) -> Result<()> {
    let mut printer = PrettyPrinter::stdout();
    printer.add_chunk(text)?;
    printer.flush()
}

/// Print one SQL statement highlighted, under a `[sql]` label.
pub fn print_sql(sql: &str) -> Result<()> {
    let mut out = stdout();
    write_code_block(&mut out, sql, "sql")?;
    out.flush()?;
    Ok(())
}

struct CodeBlock {
    language: String,
    content: String,
}

/// Streaming markdown renderer.
///
/// ```no_run
/// use db_analyst::pretty::PrettyPrinter;
///
/// # fn example() -> db_analyst::error::Result<()> {
/// let mut printer = PrettyPrinter::stdout();
/// for chunk in ["## Weekly ", "retention\n", "- week 1: **80%**\n"] {
///     printer.add_chunk(chunk)?;
/// }
/// printer.flush()?;
/// # Ok(())
/// # }
/// ```
pub struct PrettyPrinter<W: Write = Stdout> {
    out: W,
    /// Text after the last complete line.
    buffer: String,
    /// Open fenced block, if any.
    code: Option<CodeBlock>,
}

impl PrettyPrinter<Stdout> {
    pub fn stdout() -> Self {
        Self::new(stdout())
    }
}

impl<W: Write> PrettyPrinter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            buffer: String::new(),
            code: None,
        }
    }

    /// Buffer `chunk` and print every line it completes.
    pub fn add_chunk(&mut self, chunk: &str) -> Result<()> {
        self.buffer.push_str(chunk);
        while let Some(newline) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=newline).collect();
            self.render_line(line.trim_end_matches(['\n', '\r']))?;
        }
        self.out.flush()?;
        Ok(())
    }

    /// Print the partial last line and any unterminated block.
    pub fn flush(&mut self) -> Result<()> {
        let rest = std::mem::take(&mut self.buffer);
        if !rest.is_empty() {
            self.render_line(&rest)?;
        }
        if let Some(block) = self.code.take() {
            write_code_block(&mut self.out, &block.content, &block.language)?;
        }
        self.out.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn render_line(&mut self, line: &str) -> Result<()> {
        match self.code.take() {
            Some(block) if line.trim() == "```" => {
                write_code_block(&mut self.out, &block.content, &block.language)?;
            }
            Some(mut block) => {
                block.content.push_str(line);
                block.content.push('\n');
                self.code = Some(block);
            }
            None => match line.trim_start().strip_prefix("```") {
                Some(language) => {
                    self.code = Some(CodeBlock {
                        language: language.trim().to_string(),
                        content: String::new(),
                    });
                }
                None => write_markdown_line(&mut self.out, line)?,
            },
        }
        Ok(())
    }
}

fn write_markdown_line<W: Write>(out: &mut W, line: &str) -> io::Result<()> {
    let heading = line
        .strip_prefix("### ")
        .or_else(|| line.strip_prefix("## "))
        .or_else(|| line.strip_prefix("# "));
    let item = line.strip_prefix("- ").or_else(|| line.strip_prefix("* "));

    if let Some(title) = heading {
        out.queue(SetForegroundColor(Color::Cyan))?
            .queue(SetAttribute(Attribute::Bold))?;
        write!(out, "{title}")?;
        out.queue(SetAttribute(Attribute::Reset))?.queue(ResetColor)?;
    } else if TABLE_RULE.is_match(line.trim()) {
        out.queue(SetForegroundColor(Color::DarkGrey))?;
        write!(out, "{line}")?;
        out.queue(ResetColor)?;
    } else if let Some(item) = item {
        write!(out, "  • {}", style_inline(item))?;
    } else {
        write!(out, "{}", style_inline(line))?;
    }
    writeln!(out)
}

/// Bold, italic and inline code as ANSI escapes.
fn style_inline(text: &str) -> String {
    let text = INLINE_CODE.replace_all(text, "\x1b[33m${1}\x1b[0m");
    let text = BOLD.replace_all(&text, "\x1b[1m${1}\x1b[0m");
    ITALIC.replace_all(&text, "\x1b[3m${1}\x1b[0m").into_owned()
}

fn find_syntax(language: &str) -> &'static SyntaxReference {
    let syntaxes: &'static SyntaxSet = &SYNTAXES;
    let alias = match language.to_lowercase().as_str() {
        "sh" | "bash" | "shell" => "sh",
        "py" => "python",
        "yml" => "yaml",
        "md" => "markdown",
        _ => language,
    }
    .to_string();
    syntaxes
        .find_syntax_by_token(language)
        .or_else(|| syntaxes.find_syntax_by_extension(&alias))
        .unwrap_or_else(|| syntaxes.find_syntax_plain_text())
}

fn write_code_block<W: Write>(out: &mut W, code: &str, language: &str) -> io::Result<()> {
    if !language.is_empty() {
        out.queue(SetForegroundColor(Color::DarkGrey))?
            .queue(SetAttribute(Attribute::Italic))?;
        writeln!(out, "[{language}]")?;
        out.queue(SetAttribute(Attribute::Reset))?.queue(ResetColor)?;
    }

    match THEMES.themes.get(THEME) {
        Some(theme) => {
            let mut highlighter = HighlightLines::new(find_syntax(language), theme);
            for line in LinesWithEndings::from(code) {
                let ranges = highlighter
                    .highlight_line(line, &SYNTAXES)
                    .map_err(|err| io::Error::other(err.to_string()))?;
                write!(out, "{}", as_24_bit_terminal_escaped(&ranges, false))?;
            }
        }
        None => write!(out, "{code}")?,
    }
    out.queue(SetAttribute(Attribute::Reset))?.queue(ResetColor)?;
    if !code.ends_with('\n') {
        writeln!(out)?;
    }
    writeln!(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render(chunks: &[&str]) -> String {
        let mut printer = PrettyPrinter::new(Vec::new());
        for chunk in chunks {
            printer.add_chunk(chunk).unwrap();
        }
        printer.flush().unwrap();
        String::from_utf8(printer.into_inner()).unwrap()
    }

    #[test]
    fn inline_markup_becomes_ansi() {
        assert_eq!(
            style_inline("**80%** of `week_1` *returned*"),
            "\x1b[1m80%\x1b[0m of \x1b[33mweek_1\x1b[0m \x1b[3mreturned\x1b[0m"
        );
        assert_eq!(style_inline("3 * 4 * 5"), "3 * 4 * 5");
    }

    #[test]
    fn headings_and_items_lose_their_markers() {
        let out = render(&["## Weekly retention\n- week 1\n"]);
        assert!(out.contains("Weekly retention"));
        assert!(!out.contains("## "));
        assert!(out.contains("  • week 1\n"));
    }

    #[test]
    fn lines_wait_for_their_newline() {
        let mut printer = PrettyPrinter::new(Vec::new());
        printer.add_chunk("Retention ").unwrap();
        printer.add_chunk("dropped").unwrap();
        assert!(printer.out.is_empty());

        printer.add_chunk(" in week 3.\nNext").unwrap();
        let shown = String::from_utf8(printer.out.clone()).unwrap();
        assert_eq!(shown, "Retention dropped in week 3.\n");

        printer.flush().unwrap();
        assert!(String::from_utf8(printer.into_inner()).unwrap().ends_with("Next\n"));
    }

    #[test]
    fn fenced_block_split_across_chunks_is_highlighted() {
        let out = render(&["Query:\n``", "`sql\nSELECT week\n", "FROM submissions\n```\nDone.\n"]);
        assert!(out.contains("[sql]"));
        assert!(out.contains("SELECT"));
        assert!(out.contains("submissions"));
        assert!(!out.contains("```"));
        assert!(out.ends_with("Done.\n"));
    }

    #[test]
    fn unterminated_block_is_printed_on_flush() {
        let out = render(&["```sql\nSELECT 1"]);
        assert!(out.contains("[sql]"));
        assert!(out.contains('1'));
    }

    #[test]
    fn table_rule_is_dimmed_and_rows_kept() {
        let out = render(&["|    | week |\n|---:|:---|\n| 0 | 1 |\n"]);
        assert!(out.contains("|    | week |"));
        assert!(out.contains("| 0 | 1 |"));
        assert!(out.contains("|---:|:---|"));
    }

    #[test]
    fn unknown_language_falls_back_to_plain_text() {
        assert_eq!(find_syntax("no-such-language").name, "Plain Text");
        assert_eq!(find_syntax("sql").name, "SQL");
    }
}
