use super::dto::ProcessDefinitionDto;
use super::dto_to_graph::build_graph;
use crate::error::{EngineError, EngineResult};
use crate::graph::ProcessGraph;
use anyhow::Result;

/// Parse a YAML string into a ProcessDefinitionDto. No validation.
pub fn parse_definition_yaml(yaml_str: &str) -> Result<ProcessDefinitionDto> {
    let dto: ProcessDefinitionDto = serde_yaml::from_str(yaml_str)?;
    Ok(dto)
}

/// Parse, validate and build a graph from YAML.
pub fn load_graph_yaml(yaml_str: &str) -> EngineResult<ProcessGraph> {
    let dto = parse_definition_yaml(yaml_str)
        .map_err(|e| EngineError::InvalidGraph(format!("yaml: {e}")))?;
    build_graph(&dto)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timer::TimerSpec;
    use crate::types::*;
    use std::time::Duration;

    const ORDER_FLOW: &str = r#"
id: order-flow
name: Order handling
nodes:
  - kind: StartEvent
    id: start
  - kind: ExclusiveGateway
    id: gw
  - kind: UserTask
    id: review
    name: Review order
  - kind: ServiceTask
    id: auto
  - kind: IntermediateCatchEvent
    id: wait_payment
    trigger:
      type: message
      name: payment-received
  - kind: IntermediateCatchEvent
    id: cool_off
    definition: "TimerEventDefinition: Duration=PT10M"
  - kind: EndEvent
    id: end
edges:
  - from: start
    to: gw
  - from: gw
    to: review
    condition: "${amount gt 100}"
  - from: gw
    to: auto
  - from: review
    to: wait_payment
  - from: auto
    to: wait_payment
  - from: wait_payment
    to: cool_off
  - from: cool_off
    to: end
"#;

    #[test]
    fn test_load_yaml_graph() {
        let graph = load_graph_yaml(ORDER_FLOW).unwrap();
        assert_eq!(graph.id(), "order-flow");
        assert_eq!(graph.nodes().len(), 7);
        assert_eq!(graph.edges().len(), 7);
        assert_eq!(graph.node("review").unwrap().label(), "Review order");
        assert_eq!(
            graph.node("wait_payment").unwrap().trigger(),
            Some(&Trigger::Message {
                name: "payment-received".into()
            })
        );
        assert_eq!(
            graph.node("cool_off").unwrap().trigger(),
            Some(&Trigger::Timer(TimerSpec::Duration(Duration::from_secs(600))))
        );
        assert_eq!(
            graph.outgoing("gw")[0].condition.as_deref(),
            Some("${amount gt 100}")
        );
    }

    #[test]
    fn test_malformed_timer_fails_at_load() {
        let yaml = r#"
id: bad-timer
nodes:
  - kind: IntermediateCatchEvent
    id: wait
    trigger:
      type: timer
      duration: "ten minutes"
"#;
        assert!(matches!(
            load_graph_yaml(yaml),
            Err(EngineError::MalformedTriggerSpec { .. })
        ));
    }

    #[test]
    fn test_unknown_kind_is_invalid_graph() {
        let yaml = r#"
id: bad
nodes:
  - kind: Teleporter
    id: x
"#;
        assert!(matches!(
            load_graph_yaml(yaml),
            Err(EngineError::InvalidGraph(_))
        ));
    }
}
