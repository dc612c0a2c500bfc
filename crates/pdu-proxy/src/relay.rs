use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::connection::Connection;
use crate::error::{ConnectionError, RelayError};
use crate::filter::{FilterChain, FilterContext, FilterResult};
use crate::message::{Direction, MessageUnit};

/// Result of relaying one unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Forwarded {
    Delivered,
    Dropped,
}

/// One direction of the proxy: reads from `source`, filters, writes to
/// `destination`.
///
/// A link holds nothing but its connection pair, so it can be driven once
/// for the handshake and then looped by a relay worker.
pub struct RelayLink {
    direction: Direction,
    source: Arc<dyn Connection>,
    destination: Arc<dyn Connection>,
}

impl RelayLink {
    pub fn new(
        direction: Direction,
        source: Arc<dyn Connection>,
        destination: Arc<dyn Connection>,
    ) -> Self {
        Self {
            direction,
            source,
            destination,
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Name of the source connection; a link is known by where it reads.
    pub fn name(&self) -> &str {
        self.source.name()
    }

    /// Relay exactly one unit through `chain`.
    pub async fn forward(
        &self,
        chain: &FilterChain,
        ctx: &FilterContext<'_>,
    ) -> Result<Forwarded, RelayError> {
        let unit = self.receive().await?;
        self.deliver(unit, chain, ctx).await
    }

    /// Like [`forward`](Self::forward), but gives up while *waiting* for a
    /// unit if `cancel` fires. Returns `Ok(None)` in that case.
    ///
    /// Cancellation is only observed before a unit has been read. A unit
    /// that has been read is always filtered and written.
    pub async fn forward_until(
        &self,
        chain: &FilterChain,
        ctx: &FilterContext<'_>,
        cancel: &CancellationToken,
    ) -> Result<Option<Forwarded>, RelayError> {
        let unit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(None),
            unit = self.receive() => unit?,
        };
        self.deliver(unit, chain, ctx).await.map(Some)
    }

    async fn receive(&self) -> Result<MessageUnit, RelayError> {
        self.source.read_next().await.map_err(|err| match err {
            ConnectionError::EndOfStream => RelayError::EndOfStream {
                connection: self.source.name().to_string(),
            },
            source => RelayError::Read {
                connection: self.source.name().to_string(),
                source,
            },
        })
    }

    async fn deliver(
        &self,
        unit: MessageUnit,
        chain: &FilterChain,
        ctx: &FilterContext<'_>,
    ) -> Result<Forwarded, RelayError> {
        match chain.apply(unit, ctx)? {
            FilterResult::Forward(unit) => {
                self.destination
                    .write(unit)
                    .await
                    .map_err(|source| RelayError::Write {
                        connection: self.destination.name().to_string(),
                        source,
                    })?;
                Ok(Forwarded::Delivered)
            }
            FilterResult::Drop(_) => Ok(Forwarded::Dropped),
        }
    }
}
