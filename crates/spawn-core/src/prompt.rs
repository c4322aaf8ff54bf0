//! Prompt scaffolding shown in the operator's editor, and its removal.

use crate::models::{Environment, SpawnResult};

const PROMPT_MARKER: &str = "<!-- Write your prompt below -->";

/// Supplies a prompt when none was given on the command line.
///
/// Implementations may block (an external editor, a terminal read); the
/// controller calls them off the async runtime.
pub trait PromptEditor: Send + Sync {
    /// Returns the raw edited text, template included.
    fn edit(&self, template: &str) -> SpawnResult<String>;
}

pub fn prompt_template(environment: &Environment) -> String {
    format!(
        "# Worker Prompt for Environment: {}\n# Repository: {}\n\n{PROMPT_MARKER}\n",
        environment.name, environment.repo_url
    )
}

/// Drops heading lines, HTML comment lines and blank lines.
pub fn strip_template(text: &str) -> String {
    text.lines()
        .filter(|line| {
            let trimmed = line.trim();
            !(trimmed.is_empty()
                || trimmed.starts_with('#')
                || trimmed.starts_with("<!--")
                || trimmed.contains("-->"))
        })
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}
