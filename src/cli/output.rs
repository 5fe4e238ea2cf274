use colored::Colorize;

/// Print a success message with a green checkmark
pub fn print_success(message: &str) {
    println!("{} {}", "✓".green().bold(), message);
}

/// Print an aligned name/value field
pub fn print_field(name: &str, value: &str) {
    println!("  {:<20} {}", name.dimmed(), value);
}
