use clap::Parser;
use std::path::PathBuf;

/// Run a command under a pseudo-console, bridged to this terminal's
/// standard streams.
#[derive(Parser, Debug)]
#[command(name = "conbridge", version, about)]
pub struct Args {
    /// Console width in character cells.
    #[arg(long)]
    pub cols: Option<u16>,

    /// Console height in character cells.
    #[arg(long)]
    pub rows: Option<u16>,

    /// Give up waiting for the command after this many milliseconds
    /// (0 waits forever).
    #[arg(long)]
    pub timeout_ms: Option<u64>,

    /// Config file path override.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Log level override (trace, debug, info, warn, error).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Command line to run. Defaults to the configured command, then the
    /// user's shell.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

pub fn parse() -> Args {
    Args::parse()
}

/// Join argv words into one Windows command line, quoting words that
/// contain whitespace or quotes.
pub fn command_line(words: &[String]) -> Option<String> {
    if words.is_empty() {
        return None;
    }
    let quoted: Vec<String> = words.iter().map(|w| quote(w)).collect();
    Some(quoted.join(" "))
}

fn quote(word: &str) -> String {
    if !word.is_empty() && !word.contains([' ', '\t', '"']) {
        return word.to_string();
    }
    let mut out = String::with_capacity(word.len() + 2);
    out.push('"');
    let mut backslashes = 0usize;
    for ch in word.chars() {
        match ch {
            '\\' => backslashes += 1,
            '"' => {
                // Backslashes before a quote are doubled, and the quote escaped.
                out.extend(std::iter::repeat('\\').take(backslashes * 2 + 1));
                out.push('"');
                backslashes = 0;
            }
            _ => {
                out.extend(std::iter::repeat('\\').take(backslashes));
                out.push(ch);
                backslashes = 0;
            }
        }
    }
    out.extend(std::iter::repeat('\\').take(backslashes * 2));
    out.push('"');
    out
}
