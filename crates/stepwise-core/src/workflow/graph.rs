//! Workflow graph construction and validation.
//!
//! A workflow is a directed graph of named nodes. Step nodes run a [`BoxStep`];
//! phase nodes fan out to member steps and join them behind a barrier. Each
//! non-member node has exactly one outgoing [`Edge`].
//!
//! `WorkflowBuilder::build()` validates the whole graph once, using `petgraph`
//! for reachability and cycle detection, so the executor never discovers a
//! dangling target at runtime.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use stepwise_types::progress::ProgressRange;

use super::router::Router;
use super::state::StateSchema;
use super::step::{BoxStep, Step};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Structural problems detected while building a workflow graph.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    #[error("node '{0}' is declared more than once")]
    DuplicateNode(String),

    #[error("no entry step declared")]
    MissingEntry,

    #[error("no error handler declared")]
    MissingErrorHandler,

    #[error("'{0}' is not a declared node")]
    UnknownNode(String),

    #[error("edge from '{from}' targets unknown node '{to}'")]
    UnknownTarget { from: String, to: String },

    #[error("router '{router}' on '{from}' maps label '{label}' to unknown node '{to}'")]
    UnknownRouteTarget {
        from: String,
        router: String,
        label: String,
        to: String,
    },

    #[error("router '{router}' on '{from}' declares no labels")]
    EmptyRouter { from: String, router: String },

    #[error("node '{0}' has no outgoing edge")]
    MissingEdge(String),

    #[error("node '{0}' has more than one outgoing edge")]
    DuplicateEdge(String),

    #[error("error handler '{0}' must be a step that ends the run")]
    InvalidErrorHandler(String),

    #[error("node '{0}' is unreachable from the entry step")]
    Unreachable(String),

    #[error("cycle detected involving node '{0}'")]
    CycleDetected(String),

    #[error("phase '{phase}': {reason}")]
    InvalidPhase { phase: String, reason: String },
}

// ---------------------------------------------------------------------------
// Nodes and edges
// ---------------------------------------------------------------------------

/// Per-step registration options.
#[derive(Debug, Clone, Copy)]
pub struct StepOptions {
    pub range: ProgressRange,
    /// Overrides the executor's default step timeout.
    pub timeout: Option<Duration>,
    /// Write a checkpoint after the step succeeds.
    pub milestone: bool,
}

impl StepOptions {
    pub fn new(range: ProgressRange) -> Self {
        Self {
            range,
            timeout: None,
            milestone: false,
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn milestone(mut self) -> Self {
        self.milestone = true;
        self
    }
}

/// A registered step.
#[derive(Debug, Clone)]
pub struct StepNode {
    pub step: BoxStep,
    pub options: StepOptions,
}

/// Concurrent fan-out joined by a barrier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseSpec {
    pub members: Vec<String>,
    /// Members that must succeed for `{phase}_complete` to be true.
    pub required_count: usize,
}

#[derive(Debug, Clone)]
pub enum Node {
    Step(StepNode),
    Phase(PhaseSpec),
}

/// Outgoing transition of a node.
#[derive(Debug, Clone)]
pub enum Edge {
    /// Unconditional transition.
    Next(String),
    /// Conditional transition chosen by a router.
    Route(Router),
    /// Terminal node.
    End,
}

// ---------------------------------------------------------------------------
// WorkflowGraph
// ---------------------------------------------------------------------------

/// Immutable, validated workflow.
#[derive(Debug)]
pub struct WorkflowGraph {
    name: String,
    schema: StateSchema,
    nodes: HashMap<String, Node>,
    edges: HashMap<String, Edge>,
    entry: String,
    error_handler: String,
    phase_of: HashMap<String, String>,
    order: Vec<String>,
}

impl WorkflowGraph {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schema(&self) -> &StateSchema {
        &self.schema
    }

    pub fn entry(&self) -> &str {
        &self.entry
    }

    pub fn error_handler(&self) -> &str {
        &self.error_handler
    }

    pub fn node(&self, name: &str) -> Option<&Node> {
        self.nodes.get(name)
    }

    pub fn edge(&self, name: &str) -> Option<&Edge> {
        self.edges.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.nodes.contains_key(name)
    }

    /// Phase a step belongs to, if it is a phase member.
    pub fn phase_of(&self, step: &str) -> Option<&str> {
        self.phase_of.get(step).map(String::as_str)
    }

    /// Node names in a topological order.
    pub fn topological_order(&self) -> &[String] {
        &self.order
    }

    /// Where a resumed run continues after `milestone`: the milestone's
    /// unconditional successor. Routed or terminal milestones resume at the
    /// entry step.
    pub fn resume_point(&self, milestone: &str) -> Option<&str> {
        match self.edges.get(milestone) {
            Some(Edge::Next(target)) => Some(target.as_str()),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// WorkflowBuilder
// ---------------------------------------------------------------------------

/// Fluent builder for [`WorkflowGraph`]. Errors are collected and reported
/// by [`build`](WorkflowBuilder::build).
pub struct WorkflowBuilder {
    name: String,
    schema: StateSchema,
    nodes: HashMap<String, Node>,
    declared: Vec<String>,
    edges: HashMap<String, Edge>,
    entry: Option<String>,
    error_handler: Option<String>,
    errors: Vec<GraphError>,
}

impl WorkflowBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            schema: StateSchema::new(),
            nodes: HashMap::new(),
            declared: Vec::new(),
            edges: HashMap::new(),
            entry: None,
            error_handler: None,
            errors: Vec::new(),
        }
    }

    pub fn schema(mut self, schema: StateSchema) -> Self {
        self.schema = schema;
        self
    }

    /// Register a step with default options for `range`.
    pub fn step<S: Step + 'static>(self, name: impl Into<String>, step: S, range: ProgressRange) -> Self {
        self.step_with(name, step, StepOptions::new(range))
    }

    pub fn step_with<S: Step + 'static>(
        self,
        name: impl Into<String>,
        step: S,
        options: StepOptions,
    ) -> Self {
        self.boxed_step(name, BoxStep::new(step), options)
    }

    pub fn boxed_step(mut self, name: impl Into<String>, step: BoxStep, options: StepOptions) -> Self {
        let name = name.into();
        self.add_node(name, Node::Step(StepNode { step, options }));
        self
    }

    /// Declare a phase over already (or later) registered member steps.
    pub fn phase<I, M>(mut self, name: impl Into<String>, members: I, required_count: usize) -> Self
    where
        I: IntoIterator<Item = M>,
        M: Into<String>,
    {
        let spec = PhaseSpec {
            members: members.into_iter().map(Into::into).collect(),
            required_count,
        };
        self.add_node(name.into(), Node::Phase(spec));
        self
    }

    pub fn edge(self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.add_edge(from.into(), Edge::Next(to.into()))
    }

    pub fn route(self, from: impl Into<String>, router: Router) -> Self {
        self.add_edge(from.into(), Edge::Route(router))
    }

    pub fn end(self, node: impl Into<String>) -> Self {
        self.add_edge(node.into(), Edge::End)
    }

    pub fn entry(mut self, name: impl Into<String>) -> Self {
        self.entry = Some(name.into());
        self
    }

    /// The terminal step every failure is routed to. Implicitly terminal.
    pub fn error_handler(mut self, name: impl Into<String>) -> Self {
        self.error_handler = Some(name.into());
        self
    }

    fn add_node(&mut self, name: String, node: Node) {
        if self.nodes.contains_key(&name) {
            self.errors.push(GraphError::DuplicateNode(name));
            return;
        }
        self.declared.push(name.clone());
        self.nodes.insert(name, node);
    }

    fn add_edge(mut self, from: String, edge: Edge) -> Self {
        if self.edges.contains_key(&from) {
            self.errors.push(GraphError::DuplicateEdge(from));
            return self;
        }
        self.edges.insert(from, edge);
        self
    }

    /// Validate and freeze the graph.
    pub fn build(mut self) -> Result<WorkflowGraph, GraphError> {
        if let Some(err) = self.errors.into_iter().next() {
            return Err(err);
        }

        let entry = self.entry.ok_or(GraphError::MissingEntry)?;
        let error_handler = self.error_handler.ok_or(GraphError::MissingErrorHandler)?;
        if !self.nodes.contains_key(&entry) {
            return Err(GraphError::UnknownNode(entry));
        }
        match self.nodes.get(&error_handler) {
            Some(Node::Step(_)) => {}
            Some(Node::Phase(_)) => return Err(GraphError::InvalidErrorHandler(error_handler)),
            None => return Err(GraphError::UnknownNode(error_handler)),
        }
        match self.edges.get(&error_handler) {
            None => {
                self.edges.insert(error_handler.clone(), Edge::End);
            }
            Some(Edge::End) => {}
            Some(_) => return Err(GraphError::InvalidErrorHandler(error_handler)),
        }

        let phase_of = validate_phases(&self.declared, &self.nodes, &self.edges)?;
        if phase_of.contains_key(&entry) {
            return Err(GraphError::InvalidPhase {
                phase: phase_of[&entry].clone(),
                reason: format!("member '{entry}' cannot be the entry step"),
            });
        }
        if phase_of.contains_key(&error_handler) {
            return Err(GraphError::InvalidErrorHandler(error_handler));
        }

        // Every edge source is a node; every non-member node has an edge
        for from in self.edges.keys() {
            if !self.nodes.contains_key(from) {
                return Err(GraphError::UnknownNode(from.clone()));
            }
        }
        for name in &self.declared {
            if !phase_of.contains_key(name) && !self.edges.contains_key(name) {
                return Err(GraphError::MissingEdge(name.clone()));
            }
        }

        // petgraph model: transition edges plus phase -> member edges
        let mut graph = DiGraph::<&str, ()>::new();
        let index: HashMap<&str, NodeIndex> = self
            .declared
            .iter()
            .map(|name| (name.as_str(), graph.add_node(name.as_str())))
            .collect();

        for name in &self.declared {
            let from = index[name.as_str()];
            if let Some(Node::Phase(spec)) = self.nodes.get(name) {
                for member in &spec.members {
                    graph.add_edge(from, index[member.as_str()], ());
                }
            }
            match self.edges.get(name) {
                Some(Edge::Next(to)) => {
                    let target = index.get(to.as_str()).ok_or_else(|| GraphError::UnknownTarget {
                        from: name.clone(),
                        to: to.clone(),
                    })?;
                    graph.add_edge(from, *target, ());
                }
                Some(Edge::Route(router)) => {
                    if router.labels().next().is_none() {
                        return Err(GraphError::EmptyRouter {
                            from: name.clone(),
                            router: router.name().to_string(),
                        });
                    }
                    for (label, to) in router.labels().zip(router.targets()) {
                        let target =
                            index
                                .get(to)
                                .ok_or_else(|| GraphError::UnknownRouteTarget {
                                    from: name.clone(),
                                    router: router.name().to_string(),
                                    label: label.to_string(),
                                    to: to.to_string(),
                                })?;
                        graph.add_edge(from, *target, ());
                    }
                }
                Some(Edge::End) | None => {}
            }
        }

        // Reachability: the error handler is implicitly reachable from any step
        let mut reachable = HashSet::new();
        for root in [entry.as_str(), error_handler.as_str()] {
            let mut dfs = Dfs::new(&graph, index[root]);
            while let Some(nx) = dfs.next(&graph) {
                reachable.insert(graph[nx]);
            }
        }
        if let Some(orphan) = self.declared.iter().find(|n| !reachable.contains(n.as_str())) {
            return Err(GraphError::Unreachable(orphan.clone()));
        }

        let sorted = toposort(&graph, None)
            .map_err(|cycle| GraphError::CycleDetected(graph[cycle.node_id()].to_string()))?;
        let order = sorted.into_iter().map(|nx| graph[nx].to_string()).collect();

        tracing::debug!(
            workflow = self.name.as_str(),
            nodes = self.declared.len(),
            entry = entry.as_str(),
            "workflow graph validated"
        );

        Ok(WorkflowGraph {
            name: self.name,
            schema: self.schema,
            nodes: self.nodes,
            edges: self.edges,
            entry,
            error_handler,
            phase_of,
            order,
        })
    }
}

/// Check phase declarations and return the member -> phase map.
fn validate_phases(
    declared: &[String],
    nodes: &HashMap<String, Node>,
    edges: &HashMap<String, Edge>,
) -> Result<HashMap<String, String>, GraphError> {
    let mut phase_of: HashMap<String, String> = HashMap::new();
    for name in declared {
        let Some(Node::Phase(spec)) = nodes.get(name) else {
            continue;
        };
        let invalid = |reason: String| GraphError::InvalidPhase {
            phase: name.clone(),
            reason,
        };
        if spec.members.is_empty() {
            return Err(invalid("declares no members".to_string()));
        }
        if spec.required_count == 0 || spec.required_count > spec.members.len() {
            return Err(invalid(format!(
                "required_count {} must be between 1 and {} members",
                spec.required_count,
                spec.members.len()
            )));
        }
        for member in &spec.members {
            match nodes.get(member) {
                Some(Node::Step(_)) => {}
                Some(Node::Phase(_)) => {
                    return Err(invalid(format!("member '{member}' is itself a phase")));
                }
                None => return Err(invalid(format!("member '{member}' is not a registered step"))),
            }
            if edges.contains_key(member) {
                return Err(invalid(format!("member '{member}' declares its own edge")));
            }
            if let Some(other) = phase_of.insert(member.clone(), name.clone()) {
                return Err(invalid(format!("member '{member}' already belongs to phase '{other}'")));
            }
        }
    }
    Ok(phase_of)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
