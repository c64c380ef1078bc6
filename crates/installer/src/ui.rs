//! UI helpers for the installer CLI.
//!
//! Provides consistent formatting for console output during installation.

use colored::Colorize;

/// Print the installer banner.
pub fn print_banner() {
    println!();
    println!(
        "{}",
        r"
   _____ _           _              ___           _        _ _
  / ____| |         | |            |_ _|_ __  ___| |_ __ _| | | ___ _ __
 | |    | |_   _ ___| |_ ___ _ __   | || '_ \/ __| __/ _` | | |/ _ \ '__|
 | |____| | |_| \__ \ ||  __/ |     | || | | \__ \ || (_| | | |  __/ |
  \_____|_|\__,_|___/\__\___|_|    |___|_| |_|___/\__\__,_|_|_|\___|_|
"
        .cyan()
    );
    println!("  {}", "Kubernetes platform bootstrapper".bright_black());
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

/// Print a stage that was skipped because it is already done.
pub fn print_skipped(current: u8, total: u8, message: &str) {
    println!(
        "{} {} {}",
        format!("[{current}/{total}]").bright_black(),
        "↷".bright_black(),
        format!("{message} (already complete)").bright_black()
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

/// Print a module-level progress line.
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
