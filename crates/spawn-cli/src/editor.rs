use std::io::Write;
use std::process::Command;

use spawn_core::models::{SpawnError, SpawnErrorKind, SpawnResult};
use spawn_core::prompt::PromptEditor;

const FALLBACK_EDITOR: &str = "vi";

/// Opens the operator's editor on a temporary file seeded with the prompt
/// template.
pub struct ExternalEditor {
    command: String,
}

impl ExternalEditor {
    /// `$VISUAL`, then `$EDITOR`, then `vi`.
    pub fn from_env() -> Self {
        let command = ["VISUAL", "EDITOR"]
            .iter()
            .filter_map(|name| std::env::var(name).ok())
            .find(|value| !value.trim().is_empty())
            .unwrap_or_else(|| FALLBACK_EDITOR.to_string());
        Self { command }
    }

    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

impl PromptEditor for ExternalEditor {
    fn edit(&self, template: &str) -> SpawnResult<String> {
        let mut file = tempfile::Builder::new()
            .prefix("spawn-prompt-")
            .suffix(".md")
            .tempfile()
            .map_err(|error| editor_error(format!("failed to create prompt file: {error}")))?;
        file.write_all(template.as_bytes())
            .and_then(|()| file.flush())
            .map_err(|error| editor_error(format!("failed to write prompt file: {error}")))?;

        // `code --wait` and similar carry their own arguments.
        let mut parts = self.command.split_whitespace();
        let program = parts.next().unwrap_or(FALLBACK_EDITOR);
        let status = Command::new(program)
            .args(parts)
            .arg(file.path())
            .status()
            .map_err(|error| editor_error(format!("failed to launch editor '{program}': {error}")))?;
        if !status.success() {
            return Err(SpawnError::new(
                SpawnErrorKind::InvalidInput,
                format!("editor '{program}' exited with {status}; prompt discarded"),
            ));
        }

        std::fs::read_to_string(file.path())
            .map_err(|error| editor_error(format!("failed to read prompt file: {error}")))
    }
}

fn editor_error(message: String) -> SpawnError {
    SpawnError::new(SpawnErrorKind::Internal, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn returns_file_contents_after_editor_exits() {
        // `true` leaves the template untouched.
        let edited = ExternalEditor::new("true").edit("# heading\nbody\n").expect("edit");
        assert_eq!(edited, "# heading\nbody\n");
    }

    #[cfg(unix)]
    #[test]
    fn failing_editor_discards_prompt() {
        let error = ExternalEditor::new("false").edit("body").unwrap_err();
        assert_eq!(error.kind, SpawnErrorKind::InvalidInput);
    }

    #[test]
    fn missing_editor_is_reported() {
        let error = ExternalEditor::new("spawn-no-such-editor-binary")
            .edit("body")
            .unwrap_err();
        assert_eq!(error.kind, SpawnErrorKind::Internal);
    }
}
