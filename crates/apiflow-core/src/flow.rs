use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use crate::GraphError;

// ============================================================================
// Graph
// ============================================================================

/// A parsed test-case flow. Node payloads are validated into [`NodeKind`]
/// once, when the graph is built from JSON.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(try_from = "RawFlowGraph")]
pub struct FlowGraph {
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
    pub variables: Map<String, Value>,
}

/// A named flow, the unit a suite runs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestCase {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub flow_config: FlowGraph,
}

#[derive(Debug, Clone, Serialize)]
pub struct Node {
    pub id: String,
    pub position: Position,
    #[serde(flatten)]
    pub kind: NodeKind,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Position {
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    #[serde(default)]
    pub id: String,
    pub source: String,
    pub target: String,
}

/// Node payload keyed by the wire `type` field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum NodeKind {
    Start(MarkerNodeData),
    End(MarkerNodeData),
    Api(ApiNodeData),
    Wait(WaitNodeData),
    Assertion(AssertionNodeData),
    Parallel(ParallelNodeData),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NodeKindTag {
    Start,
    End,
    Api,
    Wait,
    Assertion,
    Parallel,
}

impl NodeKindTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKindTag::Start => "start",
            NodeKindTag::End => "end",
            NodeKindTag::Api => "api",
            NodeKindTag::Wait => "wait",
            NodeKindTag::Assertion => "assertion",
            NodeKindTag::Parallel => "parallel",
        }
    }
}

impl std::fmt::Display for NodeKindTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl NodeKind {
    pub fn tag(&self) -> NodeKindTag {
        match self {
            NodeKind::Start(_) => NodeKindTag::Start,
            NodeKind::End(_) => NodeKindTag::End,
            NodeKind::Api(_) => NodeKindTag::Api,
            NodeKind::Wait(_) => NodeKindTag::Wait,
            NodeKind::Assertion(_) => NodeKindTag::Assertion,
            NodeKind::Parallel(_) => NodeKindTag::Parallel,
        }
    }

    /// User-facing name carried in the node payload, if any.
    pub fn name(&self) -> Option<&str> {
        match self {
            NodeKind::Start(d) | NodeKind::End(d) => d.name.as_deref(),
            NodeKind::Api(d) => d.name.as_deref(),
            NodeKind::Wait(d) => d.name.as_deref(),
            NodeKind::Assertion(d) => d.name.as_deref(),
            NodeKind::Parallel(d) => d.name.as_deref(),
        }
    }

    pub fn is_cleanup(&self) -> bool {
        match self {
            NodeKind::Api(d) => d.is_cleanup,
            NodeKind::Parallel(d) => d.is_cleanup,
            _ => false,
        }
    }
}

impl Node {
    /// Display name, falling back to `Step <id>`.
    pub fn display_name(&self) -> String {
        self.kind
            .name()
            .map(str::to_string)
            .unwrap_or_else(|| format!("Step {}", self.id))
    }
}

// ============================================================================
// Per-kind payloads
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MarkerNodeData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiNodeData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub request_config: RequestConfig,
    #[serde(default, deserialize_with = "null_as_default")]
    pub response_extract: Vec<ResponseExtract>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub assertions: Vec<Assertion>,
    #[serde(default)]
    pub assertion_failure_strategy: AssertionFailureStrategy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait: Option<WaitConfig>,
    #[serde(default)]
    pub is_cleanup: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestConfig {
    #[serde(default, deserialize_with = "null_as_default")]
    pub path_params: BTreeMap<String, ParamValue>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub query_params: BTreeMap<String, ParamValue>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub headers: BTreeMap<String, ParamValue>,
    /// Arbitrary body tree. Objects shaped like a [`ParamValue`] are resolved
    /// in place, everything else is walked recursively.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "valueType", rename_all = "camelCase")]
pub enum ParamValue {
    Fixed {
        #[serde(default)]
        value: Value,
    },
    Variable {
        #[serde(default)]
        variable: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        template: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseExtract {
    pub path: String,
    pub variable: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Assertion {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub field: String,
    pub operator: AssertionOperator,
    #[serde(default)]
    pub expected: Value,
    #[serde(default)]
    pub expected_type: ExpectedType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AssertionOperator {
    Equals,
    NotEquals,
    Contains,
    NotContains,
    GreaterThan,
    LessThan,
    Exists,
    NotExists,
    /// Any operator name outside the known set; fails at evaluation time.
    #[serde(untagged)]
    Unknown(String),
}

impl AssertionOperator {
    pub fn as_str(&self) -> &str {
        match self {
            AssertionOperator::Equals => "equals",
            AssertionOperator::NotEquals => "notEquals",
            AssertionOperator::Contains => "contains",
            AssertionOperator::NotContains => "notContains",
            AssertionOperator::GreaterThan => "greaterThan",
            AssertionOperator::LessThan => "lessThan",
            AssertionOperator::Exists => "exists",
            AssertionOperator::NotExists => "notExists",
            AssertionOperator::Unknown(name) => name,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ExpectedType {
    #[default]
    Auto,
    String,
    Number,
    Boolean,
    Object,
    Array,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AssertionFailureStrategy {
    #[default]
    StopOnFailure,
    ContinueAll,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WaitConfig {
    Time {
        /// Delay in milliseconds.
        #[serde(default)]
        value: u64,
    },
    #[serde(rename_all = "camelCase")]
    Condition {
        condition: WaitCondition,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        check_interval: Option<u64>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitCondition {
    pub variable: String,
    pub operator: ConditionOperator,
    #[serde(default)]
    pub expected: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConditionOperator {
    Equals,
    NotEquals,
    Exists,
}

impl std::fmt::Display for ConditionOperator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ConditionOperator::Equals => "equals",
            ConditionOperator::NotEquals => "notEquals",
            ConditionOperator::Exists => "exists",
        })
    }
}

/// Wait nodes accept either `{name, wait: {...}}` or the wait config inlined
/// into the node payload.
#[derive(Debug, Clone, Serialize)]
pub struct WaitNodeData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub wait: WaitConfig,
}

impl<'de> Deserialize<'de> for WaitNodeData {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = Value::deserialize(deserializer)?;
        let name = raw
            .get("name")
            .and_then(Value::as_str)
            .map(str::to_string);
        let wait_value = match raw.get("wait") {
            Some(nested) if !nested.is_null() => nested.clone(),
            _ => raw,
        };
        let wait = serde_json::from_value(wait_value).map_err(serde::de::Error::custom)?;
        Ok(Self { name, wait })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssertionNodeData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub assertions: Vec<Assertion>,
    #[serde(default)]
    pub assertion_failure_strategy: AssertionFailureStrategy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParallelNodeData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub apis: Vec<ParallelBranch>,
    #[serde(default)]
    pub failure_strategy: ParallelFailureStrategy,
    #[serde(default)]
    pub is_cleanup: bool,
}

/// One branch of a parallel group: a full API config plus its branch id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParallelBranch {
    pub id: String,
    #[serde(flatten)]
    pub api: ApiNodeData,
}

impl ParallelBranch {
    pub fn display_name(&self) -> String {
        self.api.name.clone().unwrap_or_else(|| self.id.clone())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ParallelFailureStrategy {
    #[default]
    StopAll,
    ContinueAll,
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

// ============================================================================
// Parsing
// ============================================================================

impl FlowGraph {
    /// Parse and validate a flow graph from its JSON form.
    pub fn from_json(value: Value) -> Result<Self, GraphError> {
        let raw: RawFlowGraph = serde_json::from_value(value).map_err(GraphError::Malformed)?;
        raw.try_into()
    }

    pub fn start_node(&self) -> Option<&Node> {
        self.nodes
            .iter()
            .find(|n| matches!(n.kind, NodeKind::Start(_)))
    }
}

/// Wire form before per-kind validation, so errors can name the node.
#[derive(Deserialize)]
struct RawFlowGraph {
    #[serde(default)]
    nodes: Vec<RawNode>,
    #[serde(default)]
    edges: Vec<Edge>,
    #[serde(default, deserialize_with = "null_as_default")]
    variables: Map<String, Value>,
}

#[derive(Deserialize)]
struct RawNode {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    position: Position,
    #[serde(default)]
    data: Value,
}

impl TryFrom<RawFlowGraph> for FlowGraph {
    type Error = GraphError;

    fn try_from(raw: RawFlowGraph) -> Result<Self, Self::Error> {
        let mut seen = HashSet::new();
        let mut nodes = Vec::with_capacity(raw.nodes.len());
        for raw_node in raw.nodes {
            if !seen.insert(raw_node.id.clone()) {
                return Err(GraphError::DuplicateNode(raw_node.id));
            }
            let data = if raw_node.data.is_null() {
                Value::Object(Map::new())
            } else {
                raw_node.data
            };
            let tagged = serde_json::json!({ "type": raw_node.kind, "data": data });
            let kind: NodeKind =
                serde_json::from_value(tagged).map_err(|source| GraphError::InvalidNode {
                    id: raw_node.id.clone(),
                    kind: raw_node.kind.clone(),
                    source,
                })?;
            nodes.push(Node {
                id: raw_node.id,
                position: raw_node.position,
                kind,
            });
        }

        for edge in &raw.edges {
            for endpoint in [&edge.source, &edge.target] {
                if !seen.contains(endpoint) {
                    return Err(GraphError::DanglingEdge {
                        edge: edge.id.clone(),
                        node: endpoint.clone(),
                    });
                }
            }
        }

        Ok(FlowGraph {
            nodes,
            edges: raw.edges,
            variables: raw.variables,
        })
    }
}

// ============================================================================
// Execution order
// ============================================================================

/// Nodes in execution order, split into the normal and cleanup phases.
#[derive(Debug, Clone, Default)]
pub struct ExecutionPlan<'a> {
    pub normal: Vec<&'a Node>,
    pub cleanup: Vec<&'a Node>,
}

impl ExecutionPlan<'_> {
    pub fn total_steps(&self) -> usize {
        self.normal.len() + self.cleanup.len()
    }

    pub fn is_empty(&self) -> bool {
        self.total_steps() == 0
    }
}

impl FlowGraph {
    /// Breadth-first walk from the first `start` node.
    ///
    /// Each reachable node other than `start`/`end` is listed once, in
    /// discovery order. Nodes not reachable from `start` are left out.
    pub fn execution_plan(&self) -> ExecutionPlan<'_> {
        let Some(start) = self.start_node() else {
            return ExecutionPlan::default();
        };

        let by_id: HashMap<&str, &Node> = self.nodes.iter().map(|n| (n.id.as_str(), n)).collect();
        let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
        for edge in &self.edges {
            adjacency
                .entry(edge.source.as_str())
                .or_default()
                .push(edge.target.as_str());
        }

        let mut plan = ExecutionPlan::default();
        let mut visited: HashSet<&str> = HashSet::from([start.id.as_str()]);
        let mut queue: VecDeque<&str> = VecDeque::from([start.id.as_str()]);

        while let Some(current) = queue.pop_front() {
            let Some(targets) = adjacency.get(current) else {
                continue;
            };
            for &target in targets {
                if !visited.insert(target) {
                    continue;
                }
                queue.push_back(target);
                let Some(node) = by_id.get(target) else {
                    continue;
                };
                match &node.kind {
                    NodeKind::Start(_) | NodeKind::End(_) => {}
                    kind if kind.is_cleanup() => plan.cleanup.push(node),
                    _ => plan.normal.push(node),
                }
            }
        }

        plan
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn api(id: &str, cleanup: bool) -> Value {
        json!({
            "id": id,
            "type": "api",
            "position": {"x": 0.0, "y": 0.0},
            "data": {"apiId": id, "name": id, "method": "GET", "url": "/x", "isCleanup": cleanup}
        })
    }

    fn marker(id: &str, kind: &str) -> Value {
        json!({"id": id, "type": kind, "position": {"x": 0.0, "y": 0.0}, "data": {}})
    }

    fn edge(source: &str, target: &str) -> Value {
        json!({"id": format!("{source}-{target}"), "source": source, "target": target})
    }

    fn ids(nodes: &[&Node]) -> Vec<String> {
        nodes.iter().map(|n| n.id.clone()).collect()
    }

    #[test]
    fn bfs_order_skips_markers() {
        let graph = FlowGraph::from_json(json!({
            "nodes": [marker("s", "start"), api("a", false), api("b", false), api("c", false), marker("e", "end")],
            "edges": [edge("s", "a"), edge("s", "b"), edge("a", "c"), edge("b", "c"), edge("c", "e")],
        }))
        .unwrap();
        let plan = graph.execution_plan();
        assert_eq!(ids(&plan.normal), vec!["a", "b", "c"]);
        assert!(plan.cleanup.is_empty());
    }

    #[test]
    fn cleanup_nodes_are_bucketed_in_traversal_order() {
        let graph = FlowGraph::from_json(json!({
            "nodes": [marker("s", "start"), api("a", false), api("z", true), api("b", false), api("y", true)],
            "edges": [edge("s", "a"), edge("a", "z"), edge("z", "b"), edge("b", "y")],
        }))
        .unwrap();
        let plan = graph.execution_plan();
        assert_eq!(ids(&plan.normal), vec!["a", "b"]);
        assert_eq!(ids(&plan.cleanup), vec!["z", "y"]);
        assert_eq!(plan.total_steps(), 4);
    }

    #[test]
    fn unreachable_nodes_are_excluded() {
        let graph = FlowGraph::from_json(json!({
            "nodes": [marker("s", "start"), api("a", false), api("island", false)],
            "edges": [edge("s", "a")],
        }))
        .unwrap();
        assert_eq!(ids(&graph.execution_plan().normal), vec!["a"]);
    }

    #[test]
    fn missing_start_yields_empty_plan() {
        let graph = FlowGraph::from_json(json!({
            "nodes": [api("a", false)],
            "edges": [],
        }))
        .unwrap();
        assert!(graph.execution_plan().is_empty());
        assert!(FlowGraph::default().execution_plan().is_empty());
    }

    #[test]
    fn cycles_do_not_revisit() {
        let graph = FlowGraph::from_json(json!({
            "nodes": [marker("s", "start"), api("a", false), api("b", false)],
            "edges": [edge("s", "a"), edge("a", "b"), edge("b", "a")],
        }))
        .unwrap();
        assert_eq!(ids(&graph.execution_plan().normal), vec!["a", "b"]);
    }

    #[test]
    fn duplicate_node_id_is_rejected() {
        let err = FlowGraph::from_json(json!({
            "nodes": [marker("s", "start"), api("a", false), api("a", false)],
            "edges": [],
        }))
        .unwrap_err();
        assert!(matches!(err, GraphError::DuplicateNode(id) if id == "a"));
    }

    #[test]
    fn dangling_edge_is_rejected() {
        let err = FlowGraph::from_json(json!({
            "nodes": [marker("s", "start")],
            "edges": [edge("s", "ghost")],
        }))
        .unwrap_err();
        assert!(matches!(err, GraphError::DanglingEdge { node, .. } if node == "ghost"));
    }

    #[test]
    fn invalid_node_payload_names_the_node() {
        let err = FlowGraph::from_json(json!({
            "nodes": [{"id": "broken", "type": "api", "data": {"name": "no url"}}],
            "edges": [],
        }))
        .unwrap_err();
        assert!(matches!(err, GraphError::InvalidNode { id, .. } if id == "broken"));
    }

    #[test]
    fn wait_node_accepts_nested_and_inline_config() {
        let nested: WaitNodeData =
            serde_json::from_value(json!({"name": "pause", "wait": {"type": "time", "value": 250}}))
                .unwrap();
        assert_eq!(nested.name.as_deref(), Some("pause"));
        assert!(matches!(nested.wait, WaitConfig::Time { value: 250 }));

        let inline: WaitNodeData = serde_json::from_value(json!({
            "type": "condition",
            "timeout": 500,
            "checkInterval": 50,
            "condition": {"variable": "status", "operator": "equals", "expected": 200}
        }))
        .unwrap();
        match inline.wait {
            WaitConfig::Condition {
                condition,
                timeout,
                check_interval,
            } => {
                assert_eq!(condition.variable, "status");
                assert_eq!(condition.operator, ConditionOperator::Equals);
                assert_eq!(timeout, Some(500));
                assert_eq!(check_interval, Some(50));
            }
            other => panic!("expected condition wait, got {other:?}"),
        }
    }

    #[test]
    fn unknown_assertion_operator_is_preserved() {
        let assertion: Assertion = serde_json::from_value(json!({
            "field": "status",
            "operator": "matchesRegex",
            "expected": "2.."
        }))
        .unwrap();
        assert_eq!(
            assertion.operator,
            AssertionOperator::Unknown("matchesRegex".to_string())
        );
        assert_eq!(assertion.expected_type, ExpectedType::Auto);
    }

    #[test]
    fn param_value_variants_parse() {
        let fixed: ParamValue =
            serde_json::from_value(json!({"valueType": "fixed", "value": "[1,2,3]"})).unwrap();
        assert_eq!(
            fixed,
            ParamValue::Fixed {
                value: json!("[1,2,3]")
            }
        );
        let variable: ParamValue = serde_json::from_value(
            json!({"valueType": "variable", "variable": "login.response.token", "template": "Bearer {value}"}),
        )
        .unwrap();
        assert!(matches!(variable, ParamValue::Variable { variable: Some(v), template: Some(_) } if v == "login.response.token"));
    }

    #[test]
    fn parallel_branches_carry_their_id() {
        let graph = FlowGraph::from_json(json!({
            "nodes": [
                marker("s", "start"),
                {"id": "p", "type": "parallel", "data": {
                    "name": "fan out",
                    "failureStrategy": "continueAll",
                    "apis": [
                        {"id": "b1", "apiId": "x", "method": "GET", "url": "/one"},
                        {"id": "b2", "apiId": "y", "method": "POST", "url": "/two", "responseExtract": null}
                    ]
                }}
            ],
            "edges": [edge("s", "p")],
        }))
        .unwrap();
        let NodeKind::Parallel(data) = &graph.nodes[1].kind else {
            panic!("expected parallel node");
        };
        assert_eq!(data.failure_strategy, ParallelFailureStrategy::ContinueAll);
        assert_eq!(data.apis[0].id, "b1");
        assert_eq!(data.apis[1].api.url, "/two");
    }

    #[test]
    fn test_case_wraps_a_validated_flow() {
        let case: TestCase = serde_json::from_value(json!({
            "id": "tc-1",
            "name": "Login",
            "flowConfig": {
                "nodes": [marker("s", "start"), api("a", false)],
                "edges": [edge("s", "a")],
                "variables": {"user": "ann"}
            }
        }))
        .unwrap();
        assert_eq!(case.flow_config.execution_plan().total_steps(), 1);
        assert_eq!(case.flow_config.variables["user"], json!("ann"));

        let broken = serde_json::from_value::<TestCase>(json!({
            "flowConfig": {"nodes": [], "edges": [edge("s", "a")]}
        }));
        assert!(broken.is_err());
    }
}
