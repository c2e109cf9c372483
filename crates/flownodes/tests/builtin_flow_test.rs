use flowcore::{
    BatchFlowRequest, Flow, InputRow, RunMode, Status, SubmissionData, SubmitFlowRequest,
};
use flowruntime::{FlowRuntime, RuntimeConfig, ToolRegistry};
use serde_json::json;

const FLOW: &str = r#"
name: greeter
inputs:
  payload:
    type: string
outputs:
  greeting:
    reference: ${greet.output}
  encoded:
    reference: ${encode.output}
nodes:
  - name: parse
    source:
      type: package
      tool: transform.json_parse
    inputs:
      json: ${inputs.payload}
  - name: greet
    type: prompt
    source:
      type: code
      path: greet.jinja2
    inputs:
      name: ${parse.output.name}
  - name: encode
    tool: flownodes.tools.json_stringify
    inputs:
      value: ${parse.output}
"#;

fn runtime(dir: &std::path::Path) -> FlowRuntime {
    let mut registry = ToolRegistry::new();
    flownodes::register_all(&mut registry).unwrap();
    FlowRuntime::new(registry, RuntimeConfig::default().with_working_dir(dir))
}

#[tokio::test]
async fn package_and_prompt_tools_run_in_a_flow() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("greet.jinja2"), "Hello {{ name }}!").unwrap();
    let flow = Flow::from_yaml_str(FLOW).unwrap();

    let inputs = vec![
        InputRow::from([("payload".to_string(), json!(r#"{"name":"Ada"}"#))]),
        InputRow::from([("payload".to_string(), json!("not json"))]),
    ];
    let request = SubmitFlowRequest::new(
        "greeter",
        "greet_run",
        RunMode::Flow,
        SubmissionData::Batch(BatchFlowRequest::new(flow, inputs)),
    );
    let result = runtime(dir.path()).submit(request).await.unwrap();

    let root = result.flow_runs.iter().find(|r| r.is_root()).unwrap();
    assert_eq!(root.status, Status::Completed);
    assert_eq!(
        root.output,
        Some(json!({
            "greeting": ["Hello Ada!"],
            "encoded": [r#"{"name":"Ada"}"#],
            "line_number": [0],
        }))
    );

    let parse_failure = result
        .node_runs
        .iter()
        .find(|r| r.run_id == "greet_run_1_parse_1")
        .unwrap();
    assert_eq!(parse_failure.status, Status::Failed);
    assert_eq!(parse_failure.error.as_ref().unwrap().code, "ToolExecutionError");
}

#[test]
fn registry_exposes_builtins() {
    let mut registry = ToolRegistry::new();
    flownodes::register_all(&mut registry).unwrap();
    let names: Vec<String> = registry
        .list_package_tools()
        .into_iter()
        .map(|t| t.name)
        .collect();
    assert_eq!(names, vec![flownodes::JSON_PARSE, flownodes::JSON_STRINGIFY]);
    assert_eq!(registry.resolve_alias("transform.json_stringify"), flownodes::JSON_STRINGIFY);
    assert_eq!(registry.list_tool_types().len(), 3);
}
