// Priority values and the resolver that assigns them

use crate::assembler::AssemblerConfig;
use crate::error::{AssemblyError, StoreError};
use crate::rule_metadata::{GroupType, SourceApplicationId};
use log::debug;
use serde::{Deserialize, Serialize};

/// Evaluation priority of a rule collection.
///
/// Always a multiple of 100 within `[100, 65000]`; the gaps leave room for
/// manual reordering without renumbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "u32")]
pub struct Priority(u32);

impl Priority {
    pub const MIN: u32 = 100;
    pub const MAX: u32 = 65000;
    pub const STEP: u32 = 100;

    pub fn new(value: i64) -> Result<Self, String> {
        if value < Self::MIN as i64 || value > Self::MAX as i64 {
            return Err(format!(
                "priority {} is outside {}-{}",
                value,
                Self::MIN,
                Self::MAX
            ));
        }
        if value % Self::STEP as i64 != 0 {
            return Err(format!("priority {} is not a multiple of {}", value, Self::STEP));
        }
        Ok(Priority(value as u32))
    }

    pub fn value(&self) -> u32 {
        self.0
    }
}

impl TryFrom<i64> for Priority {
    type Error = String;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Priority::new(value)
    }
}

impl From<Priority> for u32 {
    fn from(priority: Priority) -> Self {
        priority.0
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Reports the highest priority already assigned to collections of a type.
pub trait PriorityOracle {
    /// With no source application the answer covers every application.
    fn max_priority(
        &self,
        group_type: GroupType,
        source: Option<&SourceApplicationId>,
    ) -> Result<Option<Priority>, StoreError>;
}

/// Baseline-plus-increment priority assignment.
#[derive(Debug, Clone)]
pub struct PriorityResolver {
    ceiling: u32,
    increment: u32,
}

impl PriorityResolver {
    pub fn new(config: &AssemblerConfig) -> Self {
        Self {
            ceiling: config.ceiling.min(Priority::MAX),
            increment: config.increment,
        }
    }

    /// Explicit priorities are used as-is. Otherwise the type's baseline when
    /// nothing is assigned yet, else one increment above the current maximum.
    pub fn resolve<O: PriorityOracle + ?Sized>(
        &self,
        oracle: &O,
        group_type: GroupType,
        source: Option<&SourceApplicationId>,
        explicit: Option<Priority>,
    ) -> Result<Priority, AssemblyError> {
        if let Some(priority) = explicit {
            debug!("{} priority {} given explicitly", group_type, priority);
            return Ok(priority);
        }

        let candidate = match oracle.max_priority(group_type, source)? {
            None => group_type.baseline_priority(),
            Some(max) => max.value().saturating_add(self.increment),
        };

        if candidate > self.ceiling {
            let highest = candidate.saturating_sub(self.increment);
            return Err(AssemblyError::PriorityExhausted {
                group_type,
                source_application: source.cloned(),
                highest,
                ceiling: self.ceiling,
            });
        }

        let priority = Priority::new(candidate as i64).map_err(|e| {
            AssemblyError::Serialization(format!("computed invalid priority: {}", e))
        })?;
        debug!(
            "{} priority {} assigned automatically (source: {})",
            group_type,
            priority,
            source.map(|s| s.as_str()).unwrap_or("<global>")
        );
        Ok(priority)
    }
}

impl Default for PriorityResolver {
    fn default() -> Self {
        Self::new(&AssemblerConfig::default())
    }
}
