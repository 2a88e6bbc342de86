//! YAML authoring format for process definitions.

pub mod dto;
pub mod dto_to_graph;
pub mod yaml;

pub use dto_to_graph::{build_graph, parse_event_definition};
pub use yaml::{load_graph_yaml, parse_definition_yaml};
