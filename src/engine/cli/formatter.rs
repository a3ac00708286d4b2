//! CLI Output Formatting Module
//! Renders the status stream for terminals, scripts and other tools

use colored::Colorize;

use super::OutputFormat;
use crate::engine::events::{StatusColor, StatusEvent};

pub struct CliFormatter;

impl CliFormatter {
    /// Render one event in the requested format
    pub fn render(event: &StatusEvent, format: OutputFormat) -> String {
        match format {
            OutputFormat::Lines => event.to_string(),
            OutputFormat::Json => serde_json::to_string(event).unwrap_or_else(|_| event.to_string()),
            OutputFormat::Pretty => Self::pretty(event),
        }
    }

    /// Print one event to stdout
    pub fn emit(event: &StatusEvent, format: OutputFormat) {
        println!("{}", Self::render(event, format));
    }

    fn pretty(event: &StatusEvent) -> String {
        match event {
            StatusEvent::Status { label, color } => {
                let (r, g, b) = color.rgb();
                format!("{} {}", "●".truecolor(r, g, b), label.truecolor(r, g, b).bold())
            }
            StatusEvent::Log { message } => Self::pretty_log(message),
            StatusEvent::Progress { percent } => progress_bar(*percent),
        }
    }

    fn pretty_log(message: &str) -> String {
        let text = message.trim_start();
        let upper = text.to_ascii_uppercase();
        if upper.contains("MISMATCH") || upper.contains("ERROR") || upper.contains("FAILED") {
            format!("  {} {}", "✗".red().bold(), text)
        } else if upper.starts_with("WARNING") || upper.contains("TIMED OUT") {
            format!("  {} {}", "⚠".yellow().bold(), text)
        } else {
            format!("  {} {}", "•".bright_black(), text)
        }
    }

    /// Print a success message
    pub fn success(message: &str) {
        println!("{} {}", "✓".green().bold(), message);
    }

    /// Print an error message
    pub fn error(message: &str) {
        eprintln!("{} {}", "✗".red().bold(), message);
    }

    /// Print a warning message
    pub fn warning(message: &str) {
        println!("{} {}", "⚠".yellow().bold(), message);
    }

    /// Print a section header
    pub fn header(title: &str) {
        println!("\n{}", title.bright_cyan().bold());
        println!("{}", "─".repeat(title.chars().count()).bright_black());
    }

    /// Print a key-value pair
    pub fn kv(key: &str, value: &str) {
        println!("  {}: {}", key.bright_white().bold(), value);
    }

    /// Print a list item
    pub fn item(text: &str) {
        println!("  {} {}", "•".bright_black(), text);
    }
}

/// A 20-cell bar with the percentage
pub fn progress_bar(percent: f64) -> String {
    let percent = percent.clamp(0.0, 100.0);
    let filled = (percent / 5.0).floor() as usize;
    let (r, g, b) = StatusColor::Amber.rgb();
    format!(
        "  [{}{}] {:>5.1}%",
        "█".repeat(filled).truecolor(r, g, b),
        "░".repeat(20 - filled).bright_black(),
        percent
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_lines_matches_wire_format() {
        let event = StatusEvent::Progress { percent: 42.0 };
        assert_eq!(CliFormatter::render(&event, OutputFormat::Lines), "PROGRESS:42.0");
    }

    #[test]
    fn test_render_json() {
        let event = StatusEvent::Status {
            label: "Verifying".to_string(),
            color: StatusColor::Purple,
        };
        let json: serde_json::Value =
            serde_json::from_str(&CliFormatter::render(&event, OutputFormat::Json)).unwrap();
        assert_eq!(json["kind"], "status");
        assert_eq!(json["label"], "Verifying");
    }

    #[test]
    fn test_progress_bar_cells() {
        colored::control::set_override(false);
        assert_eq!(progress_bar(50.0), "  [██████████░░░░░░░░░░]  50.0%");
        assert_eq!(progress_bar(150.0), "  [████████████████████] 100.0%");
        assert_eq!(progress_bar(0.0), "  [░░░░░░░░░░░░░░░░░░░░]   0.0%");
    }
}
