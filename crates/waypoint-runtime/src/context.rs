use waypoint_core::error::{Result, WaypointError};

pub const DEFAULT_MAX_CALL_DEPTH: u32 = 5;

/// Call-depth counter threaded explicitly through nested invocations
/// (a node running a sub-graph, an agent invoking a sub-agent).
///
/// Every executor entry takes a `child()`, so a chain of nested runs fails
/// fast with `RecursionLimit` instead of recursing without bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionContext {
    depth: u32,
    max_depth: u32,
}

impl ExecutionContext {
    /// Context of a top-level caller, before any executor entry.
    pub fn root() -> Self {
        Self::with_max_depth(DEFAULT_MAX_CALL_DEPTH)
    }

    pub fn with_max_depth(max_depth: u32) -> Self {
        Self {
            depth: 0,
            max_depth,
        }
    }

    /// Re-enter at a recorded depth, e.g. when resuming a paused run.
    pub fn at_depth(depth: u32, max_depth: u32) -> Self {
        Self { depth, max_depth }
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn max_depth(&self) -> u32 {
        self.max_depth
    }

    /// Enter one level deeper.
    pub fn child(&self) -> Result<Self> {
        let depth = self.depth + 1;
        if depth > self.max_depth {
            return Err(WaypointError::RecursionLimit {
                depth,
                limit: self.max_depth,
            });
        }
        Ok(Self {
            depth,
            max_depth: self.max_depth,
        })
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::root()
    }
}
