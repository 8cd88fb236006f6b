//! Output formatting for the affinity-audit CLI
//!
//! Human-readable output uses ANSI colors; `--json` output is pretty JSON on
//! stdout.

use anyhow::Result;
use serde::Serialize;

pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub fn ok_line(message: &str) -> String {
    format!("\x1b[32m✓\x1b[0m {}", message)
}

pub fn fail_line(message: &str) -> String {
    format!("\x1b[31m✗\x1b[0m {}", message)
}

pub fn heading(title: &str) -> String {
    format!("\x1b[1m{}\x1b[0m", title)
}

/// Format an error for display
pub fn format_error(error: &anyhow::Error, json_output: bool) -> String {
    if json_output {
        #[derive(Serialize)]
        struct ErrorJson {
            error: String,
            #[serde(skip_serializing_if = "Vec::is_empty")]
            causes: Vec<String>,
        }

        let err = ErrorJson {
            error: error.to_string(),
            causes: error.chain().skip(1).map(|e| e.to_string()).collect(),
        };
        serde_json::to_string_pretty(&err).unwrap_or_else(|_| "{}".to_string())
    } else {
        let mut out = format!("\x1b[31mError:\x1b[0m {}\n", error);
        let mut causes = error.chain().skip(1).peekable();
        if causes.peek().is_some() {
            out.push_str("Caused by:\n");
            for (idx, cause) in causes.enumerate() {
                out.push_str(&format!("  {}: {}\n", idx + 1, cause));
            }
        }
        out
    }
}
