//! Migration plans: a dependency graph of operations executed by pull.

use super::error::MigrationError;
use super::operation::{Operation, OperationKind};
use crate::versioning::VersionId;
use std::collections::{BTreeSet, VecDeque};

/// Handle to a [`Step`] within its [`Plan`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StepId(usize);

/// An operation together with the steps that must run before it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    operation: Operation,
    executed: bool,
    depends_on: BTreeSet<StepId>,
}

impl Step {
    pub fn operation(&self) -> &Operation {
        &self.operation
    }

    pub fn is_executed(&self) -> bool {
        self.executed
    }

    /// Direct dependencies.
    pub fn dependencies(&self) -> &BTreeSet<StepId> {
        &self.depends_on
    }
}

/// A sequence created for an auto-increment column of a brand-new table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSequence {
    /// Sequence name.
    pub name: String,
    /// Physical table owning the sequence.
    pub table: String,
    /// Column served by the sequence.
    pub column: String,
}

/// An executable migration plan from one version to another.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    /// Source version.
    pub from: VersionId,
    /// Target version.
    pub to: VersionId,
    steps: Vec<Step>,
    order: Vec<StepId>,
    ghost_tables: BTreeSet<String>,
    new_sequences: Vec<NewSequence>,
}

impl Plan {
    /// Create an empty plan.
    pub fn new(from: VersionId, to: VersionId) -> Self {
        Self {
            from,
            to,
            steps: Vec::new(),
            order: Vec::new(),
            ghost_tables: BTreeSet::new(),
            new_sequences: Vec::new(),
        }
    }

    fn insert(&mut self, operation: Operation) -> StepId {
        let id = StepId(self.steps.len());
        self.steps.push(Step {
            operation,
            executed: false,
            depends_on: BTreeSet::new(),
        });
        id
    }

    /// Append a step.
    pub fn push_back(&mut self, operation: Operation) -> StepId {
        let id = self.insert(operation);
        self.order.push(id);
        id
    }

    /// Prepend a step.
    pub fn push_front(&mut self, operation: Operation) -> StepId {
        let id = self.insert(operation);
        self.order.insert(0, id);
        id
    }

    pub fn step(&self, id: StepId) -> &Step {
        &self.steps[id.0]
    }

    pub(crate) fn operation_mut(&mut self, id: StepId) -> &mut Operation {
        &mut self.steps[id.0].operation
    }

    /// Steps in plan order.
    pub fn steps(&self) -> impl Iterator<Item = (StepId, &Step)> {
        self.order.iter().map(move |id| (*id, &self.steps[id.0]))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// 1-based position of a step in plan order.
    pub fn position(&self, id: StepId) -> usize {
        self.order
            .iter()
            .position(|candidate| *candidate == id)
            .map(|i| i + 1)
            .unwrap_or(0)
    }

    /// Every step `id` depends on, directly or indirectly.
    pub fn transitive_dependencies(&self, id: StepId) -> BTreeSet<StepId> {
        let mut dependencies = BTreeSet::new();
        let mut queue: VecDeque<StepId> = self.step(id).depends_on.iter().copied().collect();
        while let Some(next) = queue.pop_front() {
            if dependencies.insert(next) {
                queue.extend(self.step(next).depends_on.iter().copied());
            }
        }
        dependencies
    }

    /// Make `step` run after `dependency`, rejecting edges that would close a cycle.
    pub fn make_dependent_on(&mut self, step: StepId, dependency: StepId) -> Result<(), MigrationError> {
        if step == dependency || self.transitive_dependencies(dependency).contains(&step) {
            return Err(MigrationError::CyclicDependency {
                step: self.position(step),
                dependency: self.position(dependency),
            });
        }
        self.steps[step.0].depends_on.insert(dependency);
        Ok(())
    }

    /// Whether a step is pending with all its dependencies executed.
    pub fn can_be_executed(&self, id: StepId) -> bool {
        let step = self.step(id);
        !step.executed && step.depends_on.iter().all(|d| self.step(*d).executed)
    }

    /// The first executable step in plan order.
    pub fn next_step(&self) -> Option<StepId> {
        self.order
            .iter()
            .copied()
            .find(|id| self.can_be_executed(*id))
    }

    /// Record a step as executed. A step executes at most once.
    pub fn mark_as_executed(&mut self, id: StepId) -> Result<(), MigrationError> {
        if self.step(id).executed {
            return Err(MigrationError::AlreadyExecuted {
                step: self.position(id),
            });
        }
        self.steps[id.0].executed = true;
        Ok(())
    }

    /// Whether every step has executed.
    pub fn is_executed(&self) -> bool {
        self.order.iter().all(|id| self.step(*id).executed)
    }

    /// Steps no other step depends on.
    pub fn sinks(&self) -> BTreeSet<StepId> {
        let mut sinks: BTreeSet<StepId> = self.order.iter().copied().collect();
        for id in &self.order {
            for dependency in &self.step(*id).depends_on {
                sinks.remove(dependency);
            }
        }
        sinks
    }

    /// Steps of the given kind, in plan order.
    pub fn steps_of_kind(&self, kind: OperationKind) -> Vec<StepId> {
        self.steps()
            .filter(|(_, step)| step.operation.kind() == kind)
            .map(|(id, _)| id)
            .collect()
    }

    /// Physical names of the ghost tables the plan creates.
    pub fn ghost_tables(&self) -> &BTreeSet<String> {
        &self.ghost_tables
    }

    pub(crate) fn set_ghost_tables(&mut self, tables: BTreeSet<String>) {
        self.ghost_tables = tables;
    }

    /// Sequences to create before the ghost tables.
    pub fn new_sequences(&self) -> &[NewSequence] {
        &self.new_sequences
    }

    pub(crate) fn set_new_sequences(&mut self, sequences: Vec<NewSequence>) {
        self.new_sequences = sequences;
    }
}

impl std::fmt::Display for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, (_, step)) in self.steps().enumerate() {
            write!(f, "{}.\t{}", i + 1, step.operation)?;
            if !step.depends_on.is_empty() {
                let mut positions: Vec<usize> =
                    step.depends_on.iter().map(|d| self.position(*d)).collect();
                positions.sort_unstable();
                let positions: Vec<String> = positions.iter().map(|p| p.to_string()).collect();
                write!(f, " depends on: [{}]", positions.join(", "))?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}
