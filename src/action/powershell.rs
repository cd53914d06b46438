//! PowerShell Action - runs a command with parameters taken from the event.
//!
//! The command is wrapped in a script that splats the JSON encoded
//! `parameters` into it and converts the result to compact JSON. The script is
//! written to a temporary directory and run with `pwsh -File`; a non-zero exit
//! code fails the action with the combined output as the message.

use super::{Action, ActionContext, ActionError, PropertyKind, PropertySpec};
use crate::event::Event;
use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::process::Command;
use tracing::{debug, info};

/// Interpreter used when `executable` is not configured
pub const DEFAULT_EXECUTABLE: &str = "pwsh";

const DEFAULT_JSON_DEPTH: u32 = 4;
const SCRIPT_NAME: &str = "script.ps1";

const PROPERTIES: &[PropertySpec] = &[
    PropertySpec::required("command", "The command to run. Rendered as a template."),
    PropertySpec::optional(
        "parameters",
        "Parameters splatted into the command. String values are rendered as templates.",
    )
    .of_kind(PropertyKind::StringMap),
    PropertySpec::optional(
        "jsonDepth",
        "Depth used when converting parameters and results to and from JSON. Defaults to 4.",
    ),
    PropertySpec::optional("executable", "PowerShell executable. Defaults to pwsh."),
];

/// Script running `command` with `parameters` splatted into it.
pub fn wrap_command(
    command: &str,
    parameters: &Map<String, Value>,
    depth: u32,
) -> Result<String, ActionError> {
    let parameters = serde_json::to_string(parameters)?;
    Ok(format!(
        r#"
Trap {{
    $_
    Write-Output 'AN ERROR HAS OCCURRED!!'
    Exit 1
}}
$funcParams = @'
{parameters}
'@ | ConvertFrom-Json -Depth {depth} -AsHashtable -WarningAction Stop
$WarningPreference='Stop'
$results = {command} @funcParams
$p = @{{
    Depth         = {depth}
    Compress      = $true
    WarningAction = "Stop"
}}
if ($results -is [array]) {{
    $p.add('AsArray', $true)
}}
$results | ConvertTo-Json @p
"#
    ))
}

/// An action that runs a PowerShell command.
#[derive(Clone)]
pub struct PowershellAction {
    ctx: ActionContext,
}

impl PowershellAction {
    pub const NAME: &'static str = "powershell";

    pub fn new(ctx: ActionContext) -> Self {
        Self { ctx }
    }

    async fn script(&self, event: &Event) -> Result<String, ActionError> {
        let options = self.ctx.template_options(event).await;

        let command = self.ctx.rendered("command", event, &options).await?;
        if command.trim().is_empty() {
            return Err(ActionError::EmptyProperty("command".to_string()));
        }

        let mut parameters = self.ctx.json_map("parameters", event).await?;
        for (key, value) in parameters.iter_mut() {
            if let Value::String(raw) = value {
                let rendered = self.ctx.templates.render(
                    &format!("parameters.{}", key),
                    raw,
                    event,
                    &options,
                )?;
                *value = Value::String(rendered);
            }
        }

        let depth = self
            .ctx
            .number_or("jsonDepth", event, DEFAULT_JSON_DEPTH)
            .await?;
        wrap_command(&command, &parameters, depth)
    }
}

#[async_trait]
impl Action for PowershellAction {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn description(&self) -> &str {
        "Runs a PowerShell command with parameters taken from the event"
    }

    fn properties(&self) -> &[PropertySpec] {
        PROPERTIES
    }

    async fn execute(&self, event: &Event) -> Result<(), ActionError> {
        self.ctx.check_required(PROPERTIES)?;
        let script = self.script(event).await?;

        let mut executable = self.ctx.string("executable", event).await?;
        if executable.trim().is_empty() {
            executable = DEFAULT_EXECUTABLE.to_string();
        }

        let io_error = |what: &str, e: std::io::Error| ActionError::Failed(format!("{}: {}", what, e));

        // Removed on drop
        let dir = tempfile::Builder::new()
            .prefix("pwsh")
            .tempdir()
            .map_err(|e| io_error("failed to create the script directory", e))?;
        let path = dir.path().join(SCRIPT_NAME);
        tokio::fs::write(&path, script)
            .await
            .map_err(|e| io_error("failed to write the script", e))?;

        debug!(executable = %executable, script = %path.display(), "Running PowerShell");
        let output = Command::new(&executable)
            .args(["-o", "Text", "-nologo", "-noprofile", "-NonInteractive", "-File"])
            .arg(&path)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| io_error(&format!("failed to start '{}'", executable), e))?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        if !output.status.success() {
            return Err(ActionError::Failed(format!(
                "PowerShell exited with {}: {}",
                output.status,
                combined.trim()
            )));
        }

        info!(output = %combined.trim(), "PowerShell command completed");
        Ok(())
    }
}
