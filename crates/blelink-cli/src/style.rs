//! Terminal rendering of session events.

use blelink_core::{SessionEvent, SessionState};
use owo_colors::OwoColorize;
use time::OffsetDateTime;

/// Format a session state, colored by severity.
pub fn format_state(state: SessionState, no_color: bool) -> String {
    let label = state.label();
    if no_color {
        return format!("[{}]", label);
    }
    match state {
        SessionState::Connected => format!("[{}]", label.green()),
        SessionState::Connecting | SessionState::RequestingSelection => {
            format!("[{}]", label.cyan())
        }
        SessionState::WaitingForUserGesture => format!("[{}]", label.yellow()),
        SessionState::Failed => format!("[{}]", label.red()),
        SessionState::Disconnected => format!("[{}]", label.dimmed()),
    }
}

/// Lowercase hex with a space between bytes.
pub fn format_payload(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

fn clock(at: &OffsetDateTime) -> String {
    format!("{:02}:{:02}:{:02}", at.hour(), at.minute(), at.second())
}

/// Render one event as a single output line.
///
/// Payload lines go to stdout and are kept free of color so they can be
/// piped; everything else is meant for stderr.
pub fn format_event(event: &SessionEvent, no_color: bool) -> String {
    match event {
        SessionEvent::StateChanged { state, at } => {
            format!("{} {}", clock(at), format_state(*state, no_color))
        }
        SessionEvent::StatusText { text, at } => {
            if no_color {
                format!("{} ... {}", clock(at), text)
            } else {
                format!("{} {} {}", clock(at), "...".cyan(), text)
            }
        }
        SessionEvent::Log { message, at } => format!("{} {}", clock(at), message),
        SessionEvent::Payload { data, at } => format!("{} {}", clock(at), format_payload(data)),
        other => format!("{:?}", other),
    }
}

/// Format a success message.
pub fn format_success(message: &str, no_color: bool) -> String {
    if no_color {
        format!("[OK] {}", message)
    } else {
        format!("{} {}", "[OK]".green(), message)
    }
}

/// Format a warning message.
pub fn format_warning(message: &str, no_color: bool) -> String {
    if no_color {
        format!("[!!] {}", message)
    } else {
        format!("{} {}", "[!!]".yellow(), message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_payload_hex() {
        assert_eq!(format_payload(&[0x00, 0x0f, 0xa5]), "00 0f a5");
        assert_eq!(format_payload(&[]), "");
    }

    #[test]
    fn test_plain_state() {
        assert_eq!(format_state(SessionState::Connected, true), "[Connected]");
        assert_eq!(
            format_state(SessionState::WaitingForUserGesture, true),
            "[Waiting for user action]"
        );
    }

    #[test]
    fn test_colored_state_keeps_label() {
        let colored = format_state(SessionState::Failed, false);
        assert!(colored.contains("Failed"));
        assert_ne!(colored, "[Failed]");
    }

    #[test]
    fn test_event_lines() {
        let at = datetime!(2026-01-02 03:04:05 UTC);
        let log = SessionEvent::Log {
            message: "Connected to X (abc123)".into(),
            at,
        };
        assert_eq!(format_event(&log, true), "03:04:05 Connected to X (abc123)");

        let payload = SessionEvent::Payload {
            data: vec![1, 2],
            at,
        };
        assert_eq!(format_event(&payload, false), "03:04:05 01 02");

        let status = SessionEvent::StatusText {
            text: "Looking for remembered peripheral".into(),
            at,
        };
        assert_eq!(
            format_event(&status, true),
            "03:04:05 ... Looking for remembered peripheral"
        );
    }
}
