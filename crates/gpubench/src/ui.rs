//! UI helpers for the CLI.
//!
//! Provides consistent formatting for console output during bring-up.

use std::io::Write;

use colored::Colorize;

/// Print the gpubench banner.
pub fn print_banner() {
    println!();
    println!(
        "{}",
        r"
   __ _ _ __  _   _| |__   ___ _ __   ___| |__
  / _` | '_ \| | | | '_ \ / _ \ '_ \ / __| '_ \
 | (_| | |_) | |_| | |_) |  __/ | | | (__| | | |
  \__, | .__/ \__,_|_.__/ \___|_| |_|\___|_| |_|
  |___/|_|
"
        .cyan()
    );
    println!("  {}", "GPU kind cluster + LLM serving benchmark".bright_black());
    println!();
}

/// Print a section header.
pub fn print_section(title: &str) {
    println!();
    println!("{}", "═".repeat(70).bright_black());
    println!("{}", title.cyan().bold());
    println!("{}", "═".repeat(70).bright_black());
    println!();
}

/// Print a progress step with step number.
pub fn print_progress_step(current: u8, total: u8, message: &str) {
    println!(
        "{} {} {}",
        format!("[{current}/{total}]").bright_black(),
        "▶".cyan(),
        message.bold()
    );
}

/// Print a success message.
pub fn print_success(message: &str) {
    println!("{} {}", "✓".green().bold(), message.green());
}

/// Print a warning message.
pub fn print_warning(message: &str) {
    println!("{} {}", "⚠".yellow().bold(), message.yellow());
}

/// Print an error message.
pub fn print_error(message: &str) {
    println!("{} {}", "✗".red().bold(), message.red());
}

/// Print an info message.
pub fn print_info(message: &str) {
    println!("{} {}", "ℹ".blue().bold(), message);
}

/// Print an indented progress line.
pub fn print_progress(message: &str) {
    println!("  {} {}", "→".cyan(), message);
}

/// Print prerequisite check result.
pub fn print_check_result(name: &str, passed: bool, message: Option<&str>) {
    let status = if passed { "✓".green() } else { "✗".red() };

    let text = if let Some(msg) = message {
        format!("{name} - {msg}")
    } else {
        name.to_string()
    };

    println!("  {status} {text}");
}

/// Print a key-value pair.
pub fn print_kv(key: &str, value: &str) {
    println!("  {} {}", format!("{key}:").bright_black(), value.green());
}

/// Print lines from a log file.
pub fn print_log_lines(lines: &[String]) {
    let mut stdout = std::io::stdout().lock();
    for line in lines {
        let _ = writeln!(stdout, "  {} {line}", "│".bright_black());
    }
    let _ = stdout.flush();
}
