//! Updater console protocol classification.
//!
//! The updater's only interface is its human-oriented console output, so
//! its text is treated as a best-effort protocol versioned by tool release.
//! Every trigger lives in this one function; adapting to a changed output
//! format touches nothing else.

/// Event derived from one line of updater output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolEvent {
    /// The tool is asking for a two-factor code on stdin.
    TwoFactorPrompt,
    /// Login is waiting for a confirmation in the vendor's mobile app.
    MobileConfirmPending,
    /// The submitted two-factor code was rejected.
    TwoFactorMismatch,
    /// Login completed; the session is authenticated.
    Authenticated,
    /// The interactive prompt is back: the previous command finished.
    CommandPrompt,
}

/// Classify one output line against the previous line.
///
/// Classification is substring-based on purpose — the updater wraps and
/// merges its output freely, so anchored matching would be brittle. The
/// authentication confirmation spans two lines: a bare `OK` only counts
/// when the preceding line announced the user-info wait.
pub fn classify(line: &str, prev_line: &str, prompt_marker: &str) -> Option<ProtocolEvent> {
    if line.contains("Two-factor code:") {
        return Some(ProtocolEvent::TwoFactorPrompt);
    }

    if line.contains("confirm the login in the mobile app") {
        return Some(ProtocolEvent::MobileConfirmPending);
    }

    if line.contains("FAILED") && line.contains("code mismatch") {
        return Some(ProtocolEvent::TwoFactorMismatch);
    }

    if line.contains("OK") && prev_line.contains("Waiting for user info") {
        return Some(ProtocolEvent::Authenticated);
    }

    if line.contains(prompt_marker) {
        return Some(ProtocolEvent::CommandPrompt);
    }

    None
}
