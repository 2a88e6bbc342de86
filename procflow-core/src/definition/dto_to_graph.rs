use super::dto::*;
use crate::error::{EngineError, EngineResult};
use crate::graph::ProcessGraph;
use crate::timer::TimerSpec;
use crate::types::*;

/// Convert an authoring DTO into a validated graph.
///
/// Trigger text (structured or definition-string form) is parsed here, once;
/// malformed timer specs fail with `MalformedTriggerSpec`.
pub fn build_graph(dto: &ProcessDefinitionDto) -> EngineResult<ProcessGraph> {
    let nodes = dto
        .nodes
        .iter()
        .map(convert_node)
        .collect::<EngineResult<Vec<_>>>()?;

    let edges = dto
        .edges
        .iter()
        .enumerate()
        .map(|(i, e)| Edge {
            id: e.id.clone().unwrap_or_else(|| format!("flow_{}", i + 1)),
            source: e.from.clone(),
            target: e.to.clone(),
            condition: e.condition.clone(),
        })
        .collect();

    ProcessGraph::new(dto.id.clone(), dto.name.clone(), nodes, edges)
}

fn convert_node(dto: &NodeDto) -> EngineResult<Node> {
    let kind = match dto.kind {
        NodeKindDto::Task => NodeKind::Task(TaskKind::None),
        NodeKindDto::UserTask => NodeKind::Task(TaskKind::User),
        NodeKindDto::ServiceTask => NodeKind::Task(TaskKind::Service),
        NodeKindDto::ScriptTask => NodeKind::Task(TaskKind::Script),
        NodeKindDto::BusinessRuleTask => NodeKind::Task(TaskKind::BusinessRule),
        NodeKindDto::SendTask => NodeKind::Task(TaskKind::Send),
        NodeKindDto::ReceiveTask => NodeKind::Task(TaskKind::Receive),
        NodeKindDto::ManualTask => NodeKind::Task(TaskKind::Manual),
        NodeKindDto::StartEvent => event(dto, EventKind::Start)?,
        NodeKindDto::EndEvent => event(dto, EventKind::End)?,
        NodeKindDto::IntermediateCatchEvent => event(dto, EventKind::IntermediateCatch)?,
        NodeKindDto::IntermediateThrowEvent => event(dto, EventKind::IntermediateThrow)?,
        NodeKindDto::BoundaryEvent => event(dto, EventKind::Boundary)?,
        NodeKindDto::ExclusiveGateway => NodeKind::Gateway(GatewayKind::Exclusive),
        NodeKindDto::InclusiveGateway => NodeKind::Gateway(GatewayKind::Inclusive),
        NodeKindDto::ParallelGateway => NodeKind::Gateway(GatewayKind::Parallel),
        NodeKindDto::EventBasedGateway => NodeKind::Gateway(GatewayKind::EventBased),
        NodeKindDto::SubProcess => NodeKind::SubProcessEntry,
    };

    let has_trigger = dto.trigger.is_some() || dto.definition.is_some();
    if !matches!(kind, NodeKind::Event { .. }) && has_trigger {
        return Err(EngineError::InvalidGraph(format!(
            "node '{}': only events carry triggers",
            dto.id
        )));
    }

    Ok(Node {
        id: dto.id.clone(),
        name: dto.name.clone(),
        kind,
        owner_sub_process: dto.sub_process.clone(),
    })
}

fn event(dto: &NodeDto, kind: EventKind) -> EngineResult<NodeKind> {
    let trigger = match (&dto.trigger, &dto.definition) {
        (Some(_), Some(_)) => {
            return Err(EngineError::InvalidGraph(format!(
                "node '{}': give either 'trigger' or 'definition', not both",
                dto.id
            )))
        }
        (Some(t), None) => convert_trigger(t)?,
        (None, Some(text)) => parse_event_definition(text)?,
        (None, None) => Trigger::None,
    };
    Ok(NodeKind::Event { kind, trigger })
}

fn convert_trigger(dto: &TriggerDto) -> EngineResult<Trigger> {
    Ok(match dto {
        TriggerDto::None => Trigger::None,
        TriggerDto::Message { name } => Trigger::Message { name: name.clone() },
        TriggerDto::Signal { name } => Trigger::Signal { name: name.clone() },
        TriggerDto::Timer {
            duration,
            date,
            cycle,
        } => match (duration, date, cycle) {
            (Some(d), None, None) => Trigger::Timer(TimerSpec::duration(d)?),
            (None, Some(d), None) => Trigger::Timer(TimerSpec::date(d)?),
            (None, None, Some(c)) => Trigger::Timer(TimerSpec::cycle(c)?),
            _ => {
                return Err(EngineError::malformed(
                    format!("{dto:?}"),
                    "timer needs exactly one of duration, date or cycle",
                ))
            }
        },
        TriggerDto::Conditional { condition } => Trigger::Conditional {
            expression: condition.clone(),
        },
        TriggerDto::Error { code } => Trigger::Error { code: code.clone() },
        TriggerDto::Escalation { code } => Trigger::Escalation { code: code.clone() },
        TriggerDto::Compensation => Trigger::Compensation,
        TriggerDto::Link { name } => Trigger::Link { name: name.clone() },
        TriggerDto::Terminate => Trigger::Terminate,
    })
}

/// Parse `"<Type>EventDefinition[: detail]"`.
pub fn parse_event_definition(text: &str) -> EngineResult<Trigger> {
    let (type_name, detail) = match text.split_once(':') {
        Some((t, d)) => (t.trim(), Some(d.trim()).filter(|d| !d.is_empty())),
        None => (text.trim(), None),
    };
    let lowered = type_name.to_ascii_lowercase();
    let base = lowered.strip_suffix("eventdefinition").unwrap_or(&lowered);

    let named = |what: &str| {
        detail
            .map(str::to_string)
            .ok_or_else(|| EngineError::malformed(text, format!("{what} name missing")))
    };

    Ok(match base {
        "message" => Trigger::Message {
            name: named("message")?,
        },
        "signal" => Trigger::Signal {
            name: named("signal")?,
        },
        "timer" => {
            let spec = detail.ok_or_else(|| EngineError::malformed(text, "timer spec missing"))?;
            Trigger::Timer(TimerSpec::parse_tagged(spec)?)
        }
        "conditional" => Trigger::Conditional {
            expression: detail.unwrap_or_default().to_string(),
        },
        "error" => Trigger::Error {
            code: detail.map(str::to_string),
        },
        "escalation" => Trigger::Escalation {
            code: detail.map(str::to_string),
        },
        "compensation" | "compensate" => Trigger::Compensation,
        "link" => Trigger::Link {
            name: detail.map(str::to_string),
        },
        "terminate" => Trigger::Terminate,
        other => {
            tracing::warn!(
                definition = text,
                kind = other,
                "unknown event definition; treating as none"
            );
            Trigger::None
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_event_definition_strings() {
        assert_eq!(
            parse_event_definition("MessageEventDefinition: order-paid").unwrap(),
            Trigger::Message {
                name: "order-paid".into()
            }
        );
        assert_eq!(
            parse_event_definition("SignalEventDefinition: halt").unwrap(),
            Trigger::Signal { name: "halt".into() }
        );
        assert_eq!(
            parse_event_definition("TimerEventDefinition: Duration=PT1H").unwrap(),
            Trigger::Timer(TimerSpec::Duration(Duration::from_secs(3600)))
        );
        assert!(matches!(
            parse_event_definition("TimerEventDefinition: Date=2023-12-31T23:59:59").unwrap(),
            Trigger::Timer(TimerSpec::Date(_))
        ));
        assert_eq!(
            parse_event_definition("TerminateEventDefinition").unwrap(),
            Trigger::Terminate
        );
        assert_eq!(
            parse_event_definition("SomethingElse").unwrap(),
            Trigger::None
        );
    }

    #[test]
    fn test_event_definition_errors() {
        assert!(matches!(
            parse_event_definition("MessageEventDefinition"),
            Err(EngineError::MalformedTriggerSpec { .. })
        ));
        assert!(matches!(
            parse_event_definition("TimerEventDefinition: Duration=soon"),
            Err(EngineError::MalformedTriggerSpec { .. })
        ));
    }

    #[test]
    fn test_trigger_on_task_is_rejected() {
        let dto = ProcessDefinitionDto {
            id: "p".into(),
            name: None,
            nodes: vec![NodeDto {
                id: "t".into(),
                kind: NodeKindDto::UserTask,
                name: None,
                sub_process: None,
                trigger: Some(TriggerDto::Terminate),
                definition: None,
            }],
            edges: vec![],
        };
        assert!(matches!(build_graph(&dto), Err(EngineError::InvalidGraph(_))));
    }

    #[test]
    fn test_edge_ids_are_generated() {
        let dto = ProcessDefinitionDto {
            id: "p".into(),
            name: Some("P".into()),
            nodes: vec![
                NodeDto {
                    id: "a".into(),
                    kind: NodeKindDto::Task,
                    name: None,
                    sub_process: None,
                    trigger: None,
                    definition: None,
                },
                NodeDto {
                    id: "b".into(),
                    kind: NodeKindDto::Task,
                    name: None,
                    sub_process: None,
                    trigger: None,
                    definition: None,
                },
            ],
            edges: vec![EdgeDto {
                id: None,
                from: "a".into(),
                to: "b".into(),
                condition: None,
            }],
        };
        let graph = build_graph(&dto).unwrap();
        assert_eq!(graph.edges()[0].id, "flow_1");
        assert_eq!(graph.name(), Some("P"));
    }
}
