//! Subcommand bodies. Hook commands return a [`HookOutput`] instead of
//! printing, so `main` owns the streams and tests can inspect the result.

pub mod archive;
pub mod input;
pub mod model;
pub mod prompt;
pub mod restore;
pub mod status;

use serde_json::json;

use crate::memory::store::ArchiveResult;

/// What a hook invocation has to say.
#[derive(Debug, Default)]
pub struct HookOutput {
    /// Host-facing payload. `None` means stay silent.
    pub stdout: Option<String>,
    /// Human-readable diagnostics.
    pub stderr: Vec<String>,
    /// Set when the run archived (or deliberately skipped archiving).
    pub archived: Option<ArchiveResult>,
}

impl HookOutput {
    pub fn silent() -> Self {
        Self::default()
    }

    pub fn emit(&self) {
        for line in &self.stderr {
            eprintln!("{line}");
        }
        if let Some(out) = &self.stdout {
            print!("{out}");
        }
    }
}

/// Whether the process exits successfully. A hook failure is logged and
/// swallowed so the host's turn is never aborted; operator commands report it.
pub fn report_outcome(result: anyhow::Result<()>, is_hook: bool) -> bool {
    match result {
        Ok(()) => true,
        Err(e) if is_hook => {
            tracing::warn!("[ctxvault] hook failed: {e:#}");
            true
        }
        Err(e) => {
            eprintln!("Error: {e:#}");
            false
        }
    }
}

/// `{"hookSpecificOutput": {"hookEventName": .., "additionalContext": ..}}`
pub fn hook_payload(event: &str, additional_context: &str) -> String {
    json!({
        "hookSpecificOutput": {
            "hookEventName": event,
            "additionalContext": additional_context,
        }
    })
    .to_string()
}
