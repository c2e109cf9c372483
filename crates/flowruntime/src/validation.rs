use crate::dag::NodeGraph;
use crate::ExecutionError;
use flowcore::{DefinitionError, Flow, InputAssignment, InputRow};
use std::collections::HashSet;

/// Structural checks run before any line starts; returns the node order.
pub fn validate_flow(flow: &Flow) -> Result<Vec<String>, DefinitionError> {
    let mut names = HashSet::new();
    for node in &flow.nodes {
        if !names.insert(node.name.as_str()) {
            return Err(DefinitionError::DuplicateNodeName(node.name.clone()));
        }
    }

    for node in &flow.nodes {
        let assignments = node
            .inputs
            .values()
            .chain(node.activate.iter().map(|a| &a.condition));
        for assignment in assignments {
            if let Some(input) = assignment.referenced_flow_input() {
                if !flow.inputs.contains_key(input) {
                    return Err(DefinitionError::InputNotFound {
                        node: node.name.clone(),
                        input: input.to_string(),
                    });
                }
            }
        }
        if !node.aggregation {
            if let Some(aggregation) = node
                .dependencies()
                .into_iter()
                .find(|dep| flow.is_aggregation_node(dep))
            {
                return Err(DefinitionError::AggregationReference {
                    node: node.name.clone(),
                    aggregation: aggregation.to_string(),
                });
            }
        }
    }

    for (name, output) in &flow.outputs {
        match &output.reference {
            InputAssignment::NodeReference { node, .. } if !names.contains(node.as_str()) => {
                return Err(DefinitionError::ReferenceNotFound {
                    owner: name.clone(),
                    reference: output.reference.to_string(),
                });
            }
            InputAssignment::FlowInput { name: input, .. } if !flow.inputs.contains_key(input) => {
                return Err(DefinitionError::ReferenceNotFound {
                    owner: name.clone(),
                    reference: output.reference.to_string(),
                });
            }
            _ => {}
        }
    }

    NodeGraph::build(&flow.nodes, true)?.topological_order()
}

/// Apply defaults and convert a row to the declared flow input types.
///
/// Inputs the flow does not declare are passed through untouched.
pub fn ensure_flow_inputs(flow: &Flow, row: &InputRow, line: &str) -> Result<InputRow, ExecutionError> {
    let mut resolved = row.clone();
    for (name, def) in &flow.inputs {
        let value = match row.get(name) {
            Some(value) => value,
            None => match &def.default {
                Some(default) => default,
                None => {
                    return Err(ExecutionError::InputNotProvided {
                        input: name.clone(),
                        line: line.to_string(),
                    })
                }
            },
        };
        let converted = def
            .value_type
            .convert(value)
            .map_err(|message| ExecutionError::InputTypeError {
                input: name.clone(),
                message,
            })?;
        resolved.insert(name.clone(), converted);
    }
    Ok(resolved)
}
