use async_trait::async_trait;
use flowcore::{Tool, ToolContext, ToolDefinition, ToolError, ToolOutput, ToolType, Value};
use flowruntime::ToolFactory;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Interpreter override.
pub const PYTHON_ENV: &str = "PF_PYTHON";

/// Loads the script by path, calls the tool function with the JSON inputs
/// from stdin and writes the JSON result to stdout. Anything the tool prints
/// goes to stderr so stdout stays parseable.
const BOOTSTRAP: &str = r#"
import importlib.util, inspect, json, sys
path, name = sys.argv[1], sys.argv[2]
spec = importlib.util.spec_from_file_location("flow_tool", path)
module = importlib.util.module_from_spec(spec)
spec.loader.exec_module(module)
if not name:
    found = [f for _, f in inspect.getmembers(module, inspect.isfunction) if f.__module__ == module.__name__]
    if len(found) != 1:
        sys.exit("expected exactly one function in %s, found %d" % (path, len(found)))
    func = found[0]
else:
    func = getattr(module, name)
inputs = json.load(sys.stdin)
out = sys.stdout
sys.stdout = sys.stderr
result = func(**inputs)
json.dump(result, out, default=str)
"#;

/// Python script tool run in a child interpreter
pub struct PythonTool {
    definition: ToolDefinition,
    script: PathBuf,
    function: String,
    interpreter: String,
}

impl PythonTool {
    fn command(&self, ctx: &ToolContext) -> Command {
        let mut cmd = Command::new(&self.interpreter);
        cmd.arg("-c")
            .arg(BOOTSTRAP)
            .arg(&self.script)
            .arg(&self.function)
            .envs(ctx.env.iter())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = self.script.parent() {
            cmd.current_dir(dir);
        }
        cmd
    }

    async fn run(&self, ctx: &ToolContext) -> Result<Value, ToolError> {
        let payload = serde_json::to_vec(&ctx.inputs)
            .map_err(|e| ToolError::ExecutionFailed(format!("Failed to encode inputs: {}", e)))?;

        let mut child = self.command(ctx).spawn().map_err(|e| {
            ToolError::ExecutionFailed(format!("Failed to spawn {}: {}", self.interpreter, e))
        })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&payload)
                .await
                .map_err(|e| ToolError::ExecutionFailed(format!("Failed to write stdin: {}", e)))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("Failed to wait for process: {}", e)))?;
        let status = output.status;
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !status.success() {
            let last = stderr.lines().last().unwrap_or_default();
            return Err(ToolError::ExecutionFailed(format!(
                "{} exited with {}: {}",
                self.script.display(),
                status,
                last
            )));
        }
        if !stderr.is_empty() {
            ctx.events.info(stderr.trim_end().to_string());
        }

        serde_json::from_slice(&output.stdout).map_err(|e| {
            ToolError::ExecutionFailed(format!("Tool result is not JSON: {}", e))
        })
    }
}

#[async_trait]
impl Tool for PythonTool {
    fn definition(&self) -> &ToolDefinition {
        &self.definition
    }

    async fn invoke(&self, ctx: ToolContext) -> Result<ToolOutput, ToolError> {
        tracing::debug!(node = %ctx.node, script = %self.script.display(), "Running python tool");
        // A started call always runs to completion; cancellation only stops new nodes.
        self.run(&ctx).await.map(ToolOutput::new)
    }
}

pub struct PythonToolFactory {
    interpreter: String,
}

impl PythonToolFactory {
    pub fn new() -> Self {
        let interpreter = std::env::var(PYTHON_ENV)
            .ok()
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| "python3".to_string());
        Self { interpreter }
    }

    pub fn with_interpreter(interpreter: impl Into<String>) -> Self {
        Self {
            interpreter: interpreter.into(),
        }
    }
}

impl Default for PythonToolFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolFactory for PythonToolFactory {
    fn tool_type(&self) -> ToolType {
        ToolType::Python
    }

    fn create(&self, definition: &ToolDefinition, working_dir: &Path) -> Result<Arc<dyn Tool>, ToolError> {
        let source = definition
            .source
            .as_deref()
            .ok_or_else(|| ToolError::Configuration(format!("python tool '{}' has no source", definition.name)))?;
        let script = working_dir.join(source).canonicalize().map_err(|e| {
            ToolError::Configuration(format!("script '{}' not found: {}", source, e))
        })?;
        Ok(Arc::new(PythonTool {
            definition: definition.clone(),
            script,
            function: definition.function.clone().unwrap_or_default(),
            interpreter: self.interpreter.clone(),
        }))
    }

    fn description(&self) -> &str {
        "Python scripts run out of process"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowcore::EventEmitter;
    use serde_json::json;
    use std::collections::HashMap;
    use std::io::Write;
    use tokio_util::sync::CancellationToken;

    fn python_available() -> bool {
        std::process::Command::new("python3")
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    fn context(inputs: HashMap<String, Value>) -> ToolContext {
        ToolContext {
            node: "py".to_string(),
            run_id: "run".to_string(),
            inputs,
            env: Arc::new(HashMap::from([("GREETING".to_string(), "hi".to_string())])),
            events: EventEmitter::detached("py"),
            cancellation: CancellationToken::new(),
        }
    }

    #[test]
    fn missing_script_is_a_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let def = ToolDefinition::new("gone.py", ToolType::Python).with_source("gone.py");
        let err = PythonToolFactory::with_interpreter("python3")
            .create(&def, dir.path())
            .err()
            .unwrap();
        assert!(matches!(err, ToolError::Configuration(_)));

        let unsourced = ToolDefinition::new("nothing", ToolType::Python);
        assert!(PythonToolFactory::with_interpreter("python3")
            .create(&unsourced, dir.path())
            .is_err());
    }

    #[tokio::test]
    async fn runs_the_single_function_with_inputs() {
        if !python_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let mut file = std::fs::File::create(dir.path().join("greet.py")).unwrap();
        writeln!(
            file,
            "import os\ndef greet(name, times=1):\n    print('noise')\n    return {{'text': os.environ['GREETING'] + ' ' + name, 'n': times}}"
        )
        .unwrap();

        let def = ToolDefinition::new("greet.py", ToolType::Python).with_source("greet.py");
        let tool = PythonToolFactory::with_interpreter("python3")
            .create(&def, dir.path())
            .unwrap();
        let output = tool
            .invoke(context(HashMap::from([("name".to_string(), json!("bob"))])))
            .await
            .unwrap();
        assert_eq!(output.value, json!({"text": "hi bob", "n": 1}));
    }

    #[tokio::test]
    async fn raised_exception_fails_the_call() {
        if !python_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("boom.py"),
            "def boom():\n    raise ValueError('bad input')\n",
        )
        .unwrap();
        let def = ToolDefinition::new("boom.py", ToolType::Python).with_source("boom.py");
        let tool = PythonToolFactory::with_interpreter("python3")
            .create(&def, dir.path())
            .unwrap();
        let err = tool.invoke(context(HashMap::new())).await.unwrap_err();
        match err {
            ToolError::ExecutionFailed(message) => assert!(message.contains("bad input")),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn cancellation_lets_a_started_call_finish() {
        if !python_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("slow.py"),
            "import time\ndef slow():\n    time.sleep(0.5)\n    return 'done'\n",
        )
        .unwrap();
        let def = ToolDefinition::new("slow.py", ToolType::Python).with_source("slow.py");
        let tool = PythonToolFactory::with_interpreter("python3")
            .create(&def, dir.path())
            .unwrap();

        let ctx = context(HashMap::new());
        let token = ctx.cancellation.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            token.cancel();
        });
        let output = tool.invoke(ctx).await.unwrap();
        assert_eq!(output.value, json!("done"));
    }
}
