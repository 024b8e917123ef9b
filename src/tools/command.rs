use crate::config::ToolConfig;
use crate::errors::{AppError, AppResult};
use crate::models::ToolParameters;
use std::path::{Path, PathBuf};

static TOOL_MISSING_PATTERNS: &[&str] = &[
    "command not found",
    "no such file or directory",
    "not installed",
    "is not recognized as an internal or external command",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedCommand {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
}

/// Lays out the tool's arguments as: configured flags, the output directory,
/// positional parameters in declared order, then every other parameter as
/// `--key value`.
pub fn build_command(
    tool: &ToolConfig,
    output_dir: &Path,
    parameters: &ToolParameters,
) -> AppResult<ValidatedCommand> {
    if tool.path.trim().is_empty() {
        return Err(AppError::Config("tool path is empty".to_string()));
    }

    let mut args = tool.flag_args.clone();
    args.push(output_dir.to_string_lossy().to_string());

    for name in &tool.positional_args {
        let value = parameters
            .get(name)
            .map(|value| value.trim())
            .filter(|value| !value.is_empty())
            .ok_or_else(|| AppError::Invalid(format!("missing required parameter '{}'", name)))?;
        args.push(value.to_string());
    }

    for (key, value) in parameters {
        if tool.positional_args.contains(key) {
            continue;
        }
        if !is_flag_name(key) {
            return Err(AppError::Invalid(format!("parameter name '{}' is not a valid flag", key)));
        }
        args.push(format!("--{}", key));
        args.push(value.clone());
    }

    Ok(ValidatedCommand {
        program: tool.path.clone(),
        args,
        cwd: output_dir.to_path_buf(),
    })
}

pub fn is_tool_missing_line(line: &str) -> bool {
    let lower = line.to_ascii_lowercase();
    TOOL_MISSING_PATTERNS.iter().any(|pattern| lower.contains(pattern))
}

fn is_flag_name(key: &str) -> bool {
    let mut chars = key.chars();
    matches!(chars.next(), Some(first) if first.is_ascii_alphanumeric())
        && chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn maigret() -> ToolConfig {
        ToolConfig {
            path: "/opt/maigret/bin/maigret".to_string(),
            flag_args: vec!["--html".to_string(), "--folderoutput".to_string()],
            positional_args: vec!["username".to_string()],
            output_subfolder: "Social_Media".to_string(),
            output_extensions: vec!["html".to_string()],
        }
    }

    #[test]
    fn orders_flags_output_positionals_then_options() {
        let mut parameters = ToolParameters::new();
        parameters.insert("username".to_string(), "jdoe".to_string());
        parameters.insert("timeout".to_string(), "30".to_string());
        parameters.insert("retries".to_string(), "2".to_string());

        let command =
            build_command(&maigret(), Path::new("/tmp/stage/run-1"), &parameters).expect("command");
        assert_eq!(command.program, "/opt/maigret/bin/maigret");
        assert_eq!(
            command.args,
            vec![
                "--html",
                "--folderoutput",
                "/tmp/stage/run-1",
                "jdoe",
                "--retries",
                "2",
                "--timeout",
                "30"
            ]
        );
        assert_eq!(command.cwd, PathBuf::from("/tmp/stage/run-1"));
    }

    #[test]
    fn missing_positional_is_rejected() {
        let mut parameters = ToolParameters::new();
        parameters.insert("username".to_string(), "  ".to_string());
        let error = build_command(&maigret(), Path::new("/tmp/x"), &parameters)
            .expect_err("blank username");
        assert_eq!(error.kind(), "INVALID_INPUT");
    }

    #[test]
    fn odd_parameter_names_are_rejected() {
        let mut parameters = ToolParameters::new();
        parameters.insert("username".to_string(), "jdoe".to_string());
        parameters.insert("-rf".to_string(), "/".to_string());
        assert!(build_command(&maigret(), Path::new("/tmp/x"), &parameters).is_err());
    }

    #[test]
    fn detects_missing_tool_messages() {
        assert!(is_tool_missing_line("bash: maigret: command not found"));
        assert!(!is_tool_missing_line("[+] Checking jdoe on 3000 sites"));
    }
}
