//! Output rendering for CLI surfaces.
//!
//! JSON goes to stdout verbatim. Text mode walks the same envelope and prints a
//! bounded, colored summary.

use clap::ValueEnum;
use colored::Colorize;
use serde_json::Value as JsonValue;

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum OutputFormat {
    Json,
    Text,
}

const MAX_LINE_CHARS: usize = 100;
const MAX_LIST_ITEMS: usize = 25;
const ENVELOPE_KEYS: [&str; 5] = ["envelope_version", "ts", "event_id", "cmd", "status"];

/// Collapse newlines/extra whitespace and bound length for terminal display.
pub fn compact_line(input: &str, max_chars: usize) -> String {
    let collapsed = input.split_whitespace().collect::<Vec<_>>().join(" ");
    let mut chars = collapsed.chars();
    let preview: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        format!("{}...", preview)
    } else {
        preview
    }
}

pub fn emit(format: OutputFormat, envelope: &JsonValue) -> Result<(), serde_json::Error> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(envelope)?),
        OutputFormat::Text => print!("{}", render_text(envelope)),
    }
    Ok(())
}

pub fn render_text(envelope: &JsonValue) -> String {
    let mut out = String::new();
    let cmd = envelope.get("cmd").and_then(JsonValue::as_str).unwrap_or("?");
    let status = envelope
        .get("status")
        .and_then(JsonValue::as_str)
        .unwrap_or("?");
    let badge = match status {
        "ok" => status.green().bold(),
        "error" => status.red().bold(),
        _ => status.yellow().bold(),
    };
    out.push_str(&format!("{} {}\n", cmd.bright_white().bold(), badge));

    if let Some(obj) = envelope.as_object() {
        for (key, value) in obj {
            if ENVELOPE_KEYS.contains(&key.as_str()) {
                continue;
            }
            render_field(&mut out, key, value, 1);
        }
    }
    out
}

fn render_field(out: &mut String, key: &str, value: &JsonValue, depth: usize) {
    let indent = "  ".repeat(depth);
    match value {
        JsonValue::Array(items) if items.is_empty() => {
            out.push_str(&format!("{}{}: {}\n", indent, key.cyan(), "(none)".dimmed()));
        }
        JsonValue::Array(items) => {
            out.push_str(&format!("{}{} ({}):\n", indent, key.cyan(), items.len()));
            for item in items.iter().take(MAX_LIST_ITEMS) {
                out.push_str(&format!("{}  {} {}\n", indent, "▸".bright_black(), summarize(item)));
            }
            if items.len() > MAX_LIST_ITEMS {
                out.push_str(&format!(
                    "{}  (+{} more)\n",
                    indent,
                    items.len() - MAX_LIST_ITEMS
                ));
            }
        }
        JsonValue::Object(map) if depth < 3 => {
            out.push_str(&format!("{}{}:\n", indent, key.cyan()));
            for (k, v) in map {
                render_field(out, k, v, depth + 1);
            }
        }
        _ => {
            out.push_str(&format!("{}{}: {}\n", indent, key.cyan(), summarize(value)));
        }
    }
}

/// One-line rendering of any JSON value; objects show their most telling fields.
fn summarize(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => compact_line(s, MAX_LINE_CHARS),
        JsonValue::Null => "-".to_string(),
        JsonValue::Object(map) => {
            let head = ["seq", "name", "id", "worker", "from", "kind", "status", "score", "trigger", "slug"]
                .iter()
                .filter_map(|k| map.get(*k).map(|v| (k, v)))
                .filter(|(_, v)| !v.is_null() && !v.is_object() && !v.is_array())
                .map(|(k, v)| match v {
                    JsonValue::String(s) => format!("{}={}", k, s),
                    JsonValue::Number(n) => match n.as_f64() {
                        Some(f) if n.is_f64() => format!("{}={:.3}", k, f),
                        _ => format!("{}={}", k, n),
                    },
                    other => format!("{}={}", k, other),
                })
                .collect::<Vec<_>>();
            if head.is_empty() {
                compact_line(&value.to_string(), MAX_LINE_CHARS)
            } else {
                compact_line(&head.join(" "), MAX_LINE_CHARS)
            }
        }
        other => compact_line(&other.to_string(), MAX_LINE_CHARS),
    }
}
