//! Mutants and the per-session mutant registry.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::sandbox::TestRunStatus;

/// A 1-based line/column position in a source document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    /// Line number.
    pub line: u32,
    /// Column number.
    pub column: u32,
}

/// A range in a source document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSpan {
    /// Inclusive start.
    pub start: Position,
    /// Exclusive end.
    pub end: Position,
}

/// Classification of a mutant after its test run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    /// Not evaluated (yet).
    #[default]
    NotRun,
    /// A test failed with the mutant active.
    Killed,
    /// All tests passed with the mutant active.
    Survived,
    /// The test run did not finish in time.
    Timeout,
    /// The sandbox could not be acquired or crashed; there is no verdict.
    ExecutionError,
}

impl ResultStatus {
    /// Map a sandbox outcome to a mutant classification.
    pub fn from_test_status(status: TestRunStatus) -> Self {
        match status {
            TestRunStatus::Failed => Self::Killed,
            TestRunStatus::Timeout => Self::Timeout,
            TestRunStatus::Passed => Self::Survived,
        }
    }

    /// True for every status other than `NotRun`.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::NotRun)
    }

    /// Stable lower-case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotRun => "not_run",
            Self::Killed => "killed",
            Self::Survived => "survived",
            Self::Timeout => "timeout",
            Self::ExecutionError => "execution_error",
        }
    }
}

impl fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NotRun => "NotRun",
            Self::Killed => "Killed",
            Self::Survived => "Survived",
            Self::Timeout => "Timeout",
            Self::ExecutionError => "ExecutionError",
        };
        f.write_str(name)
    }
}

/// One alternate-behavior variant of the program under test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mutant {
    /// Id, unique within one compilation. Activates the mutant at runtime.
    pub id: u32,
    /// Human-readable description.
    pub display_name: String,
    /// Name of the mutation operator that produced the mutant.
    #[serde(default)]
    pub mutator_name: String,
    /// Replacement source snippet, if the injector reports one.
    #[serde(default)]
    pub replacement: Option<String>,
    /// Mutated region of the original source.
    pub location: SourceSpan,
    /// Classification.
    #[serde(default)]
    pub status: ResultStatus,
    /// Error detail for `ExecutionError`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_reason: Option<String>,
}

/// Registry write errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// Two mutants share one id.
    #[error("duplicate mutant id {0}")]
    DuplicateId(u32),
    /// No mutant with that id.
    #[error("unknown mutant id {0}")]
    UnknownMutant(u32),
    /// The mutant already has a terminal status.
    #[error("mutant {id} is already classified as {status}")]
    AlreadyClassified {
        /// Mutant id.
        id: u32,
        /// Existing status.
        status: ResultStatus,
    },
    /// Attempted to record `NotRun`.
    #[error("mutant {0} cannot be reset to NotRun")]
    NotTerminal(u32),
}

/// Ordered, fixed set of mutants for one compiled artifact.
///
/// The mutant set never changes after construction. The only write is a
/// one-time transition of each mutant from `NotRun` to a terminal status.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MutantRegistry {
    mutants: Vec<Mutant>,
    index: HashMap<u32, usize>,
}

impl MutantRegistry {
    /// Build a registry, rejecting duplicate ids.
    pub fn new(mutants: Vec<Mutant>) -> Result<Self, RegistryError> {
        let mut index = HashMap::with_capacity(mutants.len());
        for (position, mutant) in mutants.iter().enumerate() {
            if index.insert(mutant.id, position).is_some() {
                return Err(RegistryError::DuplicateId(mutant.id));
            }
        }
        Ok(Self { mutants, index })
    }

    /// Mutants in injection order.
    pub fn mutants(&self) -> &[Mutant] {
        &self.mutants
    }

    /// Look up a mutant by id.
    pub fn get(&self, id: u32) -> Option<&Mutant> {
        self.index.get(&id).map(|&position| &self.mutants[position])
    }

    /// Number of mutants.
    pub fn len(&self) -> usize {
        self.mutants.len()
    }

    /// True when no mutants were produced.
    pub fn is_empty(&self) -> bool {
        self.mutants.is_empty()
    }

    /// Mutants still waiting for a verdict.
    pub fn pending(&self) -> impl Iterator<Item = &Mutant> {
        self.mutants.iter().filter(|m| !m.status.is_terminal())
    }

    /// Record the terminal status of a mutant.
    pub fn record(&mut self, id: u32, status: ResultStatus) -> Result<(), RegistryError> {
        self.transition(id, status, None)
    }

    /// Record an execution error with its reason.
    pub fn record_error(&mut self, id: u32, reason: impl Into<String>) -> Result<(), RegistryError> {
        self.transition(id, ResultStatus::ExecutionError, Some(reason.into()))
    }

    fn transition(
        &mut self,
        id: u32,
        status: ResultStatus,
        reason: Option<String>,
    ) -> Result<(), RegistryError> {
        if !status.is_terminal() {
            return Err(RegistryError::NotTerminal(id));
        }
        let position = *self.index.get(&id).ok_or(RegistryError::UnknownMutant(id))?;
        let mutant = &mut self.mutants[position];
        if mutant.status.is_terminal() {
            return Err(RegistryError::AlreadyClassified {
                id,
                status: mutant.status,
            });
        }
        mutant.status = status;
        mutant.status_reason = reason;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) fn test_mutant(id: u32, name: &str) -> Mutant {
    Mutant {
        id,
        display_name: name.to_string(),
        mutator_name: "Arithmetic".to_string(),
        replacement: None,
        location: SourceSpan {
            start: Position { line: 1, column: 1 },
            end: Position { line: 1, column: 4 },
        },
        status: ResultStatus::NotRun,
        status_reason: None,
    }
}
