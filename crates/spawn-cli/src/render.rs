//! Plain-text output for command results.

use std::time::SystemTime;

use spawn_core::models::{Environment, Worker};
use spawn_core::orchestration::ReconciledWorker;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

const PROMPT_PREVIEW_CHARS: usize = 48;

pub fn timestamp(value: SystemTime) -> String {
    OffsetDateTime::from(value)
        .replace_nanosecond(0)
        .ok()
        .and_then(|value| value.format(&Rfc3339).ok())
        .unwrap_or_else(|| "-".to_string())
}

pub fn environment_table(environments: &[Environment]) -> String {
    if environments.is_empty() {
        return "No environments. Create one with `spawn env create <name> --repo <url>`.\n"
            .to_string();
    }
    let mut out = format!("{:<10} {:<20} {:<12} {}\n", "ID", "NAME", "BRANCH", "REPOSITORY");
    for environment in environments {
        out.push_str(&format!(
            "{:<10} {:<20} {:<12} {}\n",
            environment.id, environment.name, environment.branch, environment.repo_url
        ));
    }
    out
}

pub fn environment_detail(environment: &Environment, workers: &[Worker]) -> String {
    let mut out = format!(
        "ID:          {}\nName:        {}\nRepository:  {}\nBranch:      {}\nImage:       {}\nCreated:     {}\n",
        environment.id,
        environment.name,
        environment.repo_url,
        environment.branch,
        environment.docker_image,
        timestamp(environment.created_at),
    );
    if environment.environment_vars.is_empty() {
        out.push_str("Variables:   (none)\n");
    } else {
        out.push_str("Variables:\n");
        for key in environment.environment_vars.keys() {
            // Values may be secrets.
            out.push_str(&format!("  {key}=<set>\n"));
        }
    }
    out.push_str(&format!("Workers:     {}\n", workers.len()));
    out
}

pub fn worker_table(workers: &[Worker]) -> String {
    if workers.is_empty() {
        return "No workers.\n".to_string();
    }
    let mut out = format!(
        "{:<10} {:<10} {:<9} {:<26} {}\n",
        "ID", "ENV", "STATUS", "CONTAINER", "PROMPT"
    );
    for worker in workers {
        out.push_str(&format!(
            "{:<10} {:<10} {:<9} {:<26} {}\n",
            worker.id,
            worker.env_id,
            worker.status,
            worker.container_id.as_deref().unwrap_or("-"),
            preview(&worker.prompt),
        ));
    }
    out
}

pub fn worker_detail(worker: &Worker) -> String {
    format!(
        "ID:            {}\nEnvironment:   {}\nStatus:        {}\nContainer:     {}\nCreated:       {}\nLast activity: {}\nPrompt:\n{}\n",
        worker.id,
        worker.env_id,
        worker.status,
        worker.container_id.as_deref().unwrap_or("-"),
        timestamp(worker.created_at),
        timestamp(worker.last_activity),
        worker.prompt,
    )
}

pub fn reconciliation(changes: &[ReconciledWorker]) -> String {
    if changes.is_empty() {
        return "All running workers match the container runtime.\n".to_string();
    }
    let mut out = String::new();
    for change in changes {
        let exit = change
            .exit_code
            .map(|code| format!(" (exit {code})"))
            .unwrap_or_default();
        out.push_str(&format!(
            "{}: {} -> {}{exit}\n",
            change.worker.id, change.previous, change.worker.status
        ));
    }
    out
}

fn preview(prompt: &str) -> String {
    let first_line = prompt.lines().next().unwrap_or_default();
    if first_line.chars().count() > PROMPT_PREVIEW_CHARS || prompt.lines().nth(1).is_some() {
        let cut: String = first_line.chars().take(PROMPT_PREVIEW_CHARS).collect();
        format!("{cut}...")
    } else {
        first_line.to_string()
    }
}
