/// Host control commands recognized in chat text (without the prefix).
pub const CONTROL_COMMANDS: &[&str] = &[
    "new", "reset", "clear", "compact", "context", "model", "stop", "status", "help", "sessions",
];

/// Return the control command a message starts with, if any.
///
/// The command must directly follow `prefix` and be followed by whitespace or
/// the end of the text; matching is case-insensitive.
pub fn control_command<'a>(text: &'a str, prefix: &str) -> Option<&'a str> {
    let prefix = if prefix.is_empty() { "/" } else { prefix };
    let rest = text.trim_start().strip_prefix(prefix)?;
    let cmd = rest.split_whitespace().next()?;
    CONTROL_COMMANDS
        .iter()
        .any(|c| c.eq_ignore_ascii_case(cmd))
        .then_some(cmd)
}

pub fn has_control_command(text: &str, prefix: &str) -> bool {
    control_command(text, prefix).is_some()
}
