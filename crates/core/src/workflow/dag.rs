use super::interpolate::find_refs;
use crate::error::GraphError;
use crate::types::{CapabilityType, StepDefinition, WorkflowSpec, TRIGGER_REF};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

/// A vertex of the dependency graph
#[derive(Debug, Clone)]
pub struct Vertex {
    pub step: StepDefinition,
    /// Refs this vertex reads from, sorted
    pub dependencies: Vec<String>,
}

impl Vertex {
    pub fn reference(&self) -> &str {
        self.step.effective_ref()
    }

    pub fn is_trigger(&self) -> bool {
        self.reference() == TRIGGER_REF
    }
}

/// Directed acyclic graph of a workflow's steps keyed by ref.
///
/// Vertices live in an arena; edges point from a dependency to its dependent.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    vertices: Vec<Vertex>,
    index: HashMap<String, usize>,
    outgoing: Vec<Vec<usize>>,
    incoming: Vec<Vec<usize>>,
}

impl DependencyGraph {
    fn empty() -> Self {
        Self {
            vertices: Vec::new(),
            index: HashMap::new(),
            outgoing: Vec::new(),
            incoming: Vec::new(),
        }
    }

    /// Build and validate the graph of a workflow spec
    pub fn build(spec: &WorkflowSpec) -> Result<Self, GraphError> {
        let mut graph = Self::empty();

        let mut trigger = StepDefinition::new(TRIGGER_REF, CapabilityType::Trigger);
        trigger.reference = TRIGGER_REF.to_string();
        graph.add_vertex(trigger)?;

        for step in spec.steps() {
            let mut step = step.clone();
            if step.reference.is_empty() {
                step.reference = step.id.clone();
            }
            graph.add_vertex(step)?;
        }

        for idx in 0..graph.vertices.len() {
            let vertex = &graph.vertices[idx];
            let refs = find_refs(&vertex.step.inputs).map_err(|source| {
                GraphError::InvalidReference {
                    step: vertex.reference().to_string(),
                    source,
                }
            })?;

            if refs.is_empty() && !vertex.is_trigger() {
                return Err(GraphError::MissingDependentRef(vertex.reference().to_string()));
            }

            let dependent = vertex.reference().to_string();
            for dependency in &refs {
                graph.add_edge(dependency, &dependent)?;
            }
            graph.vertices[idx].dependencies = refs.into_iter().collect();
        }

        Ok(graph)
    }

    fn add_vertex(&mut self, step: StepDefinition) -> Result<(), GraphError> {
        let reference = step.effective_ref().to_string();
        if self.index.contains_key(&reference) {
            return Err(GraphError::DuplicateRef(reference));
        }

        self.index.insert(reference, self.vertices.len());
        self.vertices.push(Vertex {
            step,
            dependencies: Vec::new(),
        });
        self.outgoing.push(Vec::new());
        self.incoming.push(Vec::new());
        Ok(())
    }

    fn add_edge(&mut self, from: &str, to: &str) -> Result<(), GraphError> {
        let source = *self
            .index
            .get(from)
            .ok_or_else(|| GraphError::VertexNotFound(from.to_string()))?;
        let target = *self
            .index
            .get(to)
            .ok_or_else(|| GraphError::VertexNotFound(to.to_string()))?;

        if source == target || self.reaches(target, source) {
            return Err(GraphError::Cycle {
                from: from.to_string(),
                to: to.to_string(),
            });
        }

        if !self.outgoing[source].contains(&target) {
            self.outgoing[source].push(target);
            self.incoming[target].push(source);
        }
        Ok(())
    }

    /// Whether `to` is reachable from `from` along existing edges
    fn reaches(&self, from: usize, to: usize) -> bool {
        let mut seen = HashSet::new();
        let mut stack = vec![from];
        while let Some(current) = stack.pop() {
            if current == to {
                return true;
            }
            if seen.insert(current) {
                stack.extend(self.outgoing[current].iter().copied());
            }
        }
        false
    }

    fn position(&self, reference: &str) -> Result<usize, GraphError> {
        self.index
            .get(reference)
            .copied()
            .ok_or_else(|| GraphError::VertexNotFound(reference.to_string()))
    }

    pub fn vertex(&self, reference: &str) -> Result<&Vertex, GraphError> {
        Ok(&self.vertices[self.position(reference)?])
    }

    pub fn len(&self) -> usize {
        self.vertices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty()
    }

    /// Vertices that read from `reference` directly
    pub fn dependents(&self, reference: &str) -> Result<Vec<&Vertex>, GraphError> {
        let idx = self.position(reference)?;
        Ok(self.outgoing[idx].iter().map(|&i| &self.vertices[i]).collect())
    }

    /// Vertices `reference` reads from directly
    pub fn dependencies(&self, reference: &str) -> Result<Vec<&Vertex>, GraphError> {
        let idx = self.position(reference)?;
        Ok(self.incoming[idx].iter().map(|&i| &self.vertices[i]).collect())
    }

    /// Breadth-first walk from `start`, visiting each reachable vertex exactly once
    pub fn walk(&self, start: &str) -> Result<Vec<&Vertex>, GraphError> {
        let start = self.position(start)?;
        let mut seen = vec![false; self.vertices.len()];
        let mut queue = VecDeque::from([start]);
        let mut order = Vec::new();
        seen[start] = true;

        while let Some(current) = queue.pop_front() {
            order.push(&self.vertices[current]);
            for &next in &self.outgoing[current] {
                if !seen[next] {
                    seen[next] = true;
                    queue.push_back(next);
                }
            }
        }
        Ok(order)
    }

    /// Breadth-first walk from `start` that only enqueues a vertex once every
    /// dependency of it has been visited.
    ///
    /// This is the order the engine executes steps in.
    pub fn execution_order(&self, start: &str) -> Result<Vec<&Vertex>, GraphError> {
        let start = self.position(start)?;
        let mut remaining: Vec<usize> = self.incoming.iter().map(Vec::len).collect();
        let mut queue = VecDeque::from([start]);
        let mut order = Vec::new();

        while let Some(current) = queue.pop_front() {
            order.push(&self.vertices[current]);
            for &next in &self.outgoing[current] {
                remaining[next] -= 1;
                if remaining[next] == 0 {
                    queue.push_back(next);
                }
            }
        }
        Ok(order)
    }

    /// Every vertex reachable from `reference`, excluding itself
    pub fn descendants(&self, reference: &str) -> Result<Vec<&Vertex>, GraphError> {
        let mut walked = self.walk(reference)?;
        walked.remove(0);
        Ok(walked)
    }

    /// Adjacency map: ref -> refs of its direct dependents
    pub fn adjacency(&self) -> BTreeMap<String, Vec<String>> {
        self.vertices
            .iter()
            .enumerate()
            .map(|(idx, vertex)| {
                let dependents = self.outgoing[idx]
                    .iter()
                    .map(|&i| self.vertices[i].reference().to_string())
                    .collect();
                (vertex.reference().to_string(), dependents)
            })
            .collect()
    }

    /// Non-trigger vertices in declaration order
    pub fn steps(&self) -> impl Iterator<Item = &Vertex> {
        self.vertices.iter().filter(|v| !v.is_trigger())
    }
}
