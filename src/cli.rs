//! CLI commands for inspecting saved parameter sets.

use chrono::Utc;
use clap::Subcommand;

use crate::parameters::Parameter;
use crate::storage::{DefinitionStore, SavedParameterSet, SqliteStorage};

/// Saved-set CLI subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum SetCommands {
    /// List saved parameter sets, most recently updated first
    List,

    /// Show one saved parameter set
    Show {
        /// Parameter set id
        id: String,

        /// Print the stored definitions as JSON
        #[arg(long)]
        json: bool,
    },

    /// Delete a saved parameter set
    Delete {
        /// Parameter set id
        id: String,
    },
}

/// Result of CLI command execution.
#[derive(Debug)]
pub struct CliResult {
    /// Exit code (0 = success)
    pub exit_code: i32,
    /// Output message
    pub message: String,
}

impl CliResult {
    /// Create a success result with the given message.
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            message: message.into(),
        }
    }

    /// Create an error result with the given message.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            exit_code: 1,
            message: message.into(),
        }
    }
}

/// Execute a saved-set CLI command.
pub async fn execute_command(command: SetCommands, storage: &SqliteStorage) -> CliResult {
    match command {
        SetCommands::List => execute_list(storage).await,
        SetCommands::Show { id, json } => execute_show(storage, &id, json).await,
        SetCommands::Delete { id } => match storage.delete_parameter_set(&id).await {
            Ok(()) => CliResult::success(format!("Deleted parameter set '{}'", id)),
            Err(e) => CliResult::error(format!("Failed to delete '{}': {}", id, e)),
        },
    }
}

async fn execute_list(storage: &SqliteStorage) -> CliResult {
    let sets = match storage.list_parameter_sets().await {
        Ok(sets) => sets,
        Err(e) => return CliResult::error(format!("Failed to list parameter sets: {}", e)),
    };
    if sets.is_empty() {
        return CliResult::success("No saved parameter sets");
    }

    let mut output = String::from("\nSaved Parameter Sets\n\n");
    for set in &sets {
        output.push_str(&format!(
            "  {:<24} v{:<4} {:>3} params  updated {} ago  ({})\n",
            set.id,
            set.version,
            set.parameters.len(),
            format_age(Utc::now() - set.updated_at),
            set.name
        ));
    }
    CliResult::success(output)
}

async fn execute_show(storage: &SqliteStorage, id: &str, json: bool) -> CliResult {
    let set = match storage.get_parameter_set(id).await {
        Ok(Some(set)) => set,
        Ok(None) => return CliResult::error(format!("Parameter set '{}' not found", id)),
        Err(e) => return CliResult::error(format!("Failed to load '{}': {}", id, e)),
    };

    if json {
        return match serde_json::to_string_pretty(&set.parameters) {
            Ok(text) => CliResult::success(text),
            Err(e) => CliResult::error(format!("Failed to serialize '{}': {}", id, e)),
        };
    }
    CliResult::success(describe(&set))
}

fn describe(set: &SavedParameterSet) -> String {
    let mut output = format!("\n{} ({}), version {}\n\n", set.name, set.id, set.version);
    for definition in &set.parameters {
        let parameter = Parameter::new(definition.clone());
        let parents: Vec<&str> = parameter
            .parent_parameter
            .iter()
            .map(|link| link.name.as_str())
            .collect();
        output.push_str(&format!("  {:<20} = {}", parameter.name, parameter.value()));
        if !parents.is_empty() {
            output.push_str(&format!("  <- {}", parents.join(", ")));
        }
        output.push('\n');
    }
    output
}

fn format_age(duration: chrono::Duration) -> String {
    if duration.num_days() > 0 {
        format!("{}d", duration.num_days())
    } else if duration.num_hours() > 0 {
        format!("{}h", duration.num_hours())
    } else if duration.num_minutes() > 0 {
        format!("{}m", duration.num_minutes())
    } else {
        format!("{}s", duration.num_seconds().max(0))
    }
}
