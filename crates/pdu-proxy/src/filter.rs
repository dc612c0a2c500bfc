use std::fmt;
use std::sync::Arc;

use tracing::trace;

use crate::context::SessionContext;
use crate::error::{ChainError, FilterError};
use crate::message::{Direction, MessageUnit};
use crate::session::ProxySession;

/// What a [`Filter`] decided to do with one unit.
pub enum FilterResult {
    /// Pass the unit on: either the original (observers) or a replacement
    /// (transforms).
    Forward(MessageUnit),
    /// Swallow the unit. It is not delivered and later filters never see it.
    /// The `String` is a human-readable reason for the logs.
    Drop(String),
}

/// Per-invocation context handed to every filter.
///
/// Carries the direction the unit is travelling in and the session it
/// belongs to, so filters can reach the shared [`SessionContext`] without
/// any global lookup.
#[derive(Clone, Copy)]
pub struct FilterContext<'a> {
    direction: Direction,
    session: &'a ProxySession,
}

impl<'a> FilterContext<'a> {
    /// Create the context for a unit travelling in `direction`.
    pub fn new(direction: Direction, session: &'a ProxySession) -> Self {
        Self { direction, session }
    }

    /// Direction the current unit is travelling in.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn session(&self) -> &'a ProxySession {
        self.session
    }

    /// Shorthand for `session().context()`.
    pub fn session_context(&self) -> &'a SessionContext {
        self.session.context()
    }
}

/// A processing stage over the unit stream.
///
/// Filters are synchronous and must not block: they run inline on the relay
/// worker for their direction. The same filter instance is shared by both
/// directions, so any filter-local state needs its own synchronization.
pub trait Filter: Send + Sync {
    /// Name used for chain splicing and in logs.
    fn name(&self) -> &str;

    fn apply(
        &self,
        unit: MessageUnit,
        ctx: &FilterContext<'_>,
    ) -> Result<FilterResult, FilterError>;
}

/// Ordered sequence of filters applied to every relayed unit.
#[derive(Clone, Default)]
pub struct FilterChain {
    filters: Vec<Arc<dyn Filter>>,
}

impl FilterChain {
    /// Create a chain that applies `filters` in the given order.
    pub fn new(filters: Vec<Arc<dyn Filter>>) -> Self {
        Self { filters }
    }

    /// Insert `filter` immediately before the first member named `anchor`.
    ///
    /// Every other member keeps its relative position. Returns the inserted
    /// filter.
    pub fn insert_before(
        &mut self,
        anchor: &str,
        filter: Arc<dyn Filter>,
    ) -> Result<Arc<dyn Filter>, ChainError> {
        let index = self
            .filters
            .iter()
            .position(|f| f.name() == anchor)
            .ok_or_else(|| ChainError::AnchorNotFound {
                anchor: anchor.to_string(),
            })?;

        self.filters.insert(index, Arc::clone(&filter));
        Ok(filter)
    }

    /// Run `unit` through every member in order, stopping at the first drop.
    pub fn apply(
        &self,
        unit: MessageUnit,
        ctx: &FilterContext<'_>,
    ) -> Result<FilterResult, FilterError> {
        let mut current = unit;

        for filter in &self.filters {
            match filter.apply(current, ctx)? {
                FilterResult::Forward(next) => current = next,
                FilterResult::Drop(reason) => {
                    trace!(
                        filter = filter.name(),
                        direction = %ctx.direction(),
                        %reason,
                        "unit dropped"
                    );
                    return Ok(FilterResult::Drop(reason));
                }
            }
        }

        Ok(FilterResult::Forward(current))
    }

    /// Name of the first member, the anchor for handshake splicing.
    pub fn first_name(&self) -> Option<&str> {
        self.filters.first().map(|f| f.name())
    }

    /// Member names in application order.
    pub fn names(&self) -> Vec<&str> {
        self.filters.iter().map(|f| f.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }
}

impl FromIterator<Arc<dyn Filter>> for FilterChain {
    fn from_iter<I: IntoIterator<Item = Arc<dyn Filter>>>(iter: I) -> Self {
        Self {
            filters: iter.into_iter().collect(),
        }
    }
}

impl fmt::Debug for FilterChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}
