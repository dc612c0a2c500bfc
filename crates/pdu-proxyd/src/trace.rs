use pdu_proxy::{Direction, Filter, FilterContext, FilterError, FilterResult, MessageUnit};
use serde_json::Value;
use tracing::debug;

/// Observer filter: logs every unit and keeps running per-direction counts in
/// the session context.
///
/// Counters live under `traffic.<direction>.units` and
/// `traffic.<direction>.bytes`. Each direction is only ever updated by its own
/// worker, so the read-then-write here never races.
#[derive(Debug, Default)]
pub struct TrafficTrace;

impl TrafficTrace {
    pub const NAME: &'static str = "traffic-trace";

    pub fn units_key(direction: Direction) -> String {
        format!("traffic.{direction}.units")
    }

    pub fn bytes_key(direction: Direction) -> String {
        format!("traffic.{direction}.bytes")
    }
}

impl Filter for TrafficTrace {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn apply(
        &self,
        unit: MessageUnit,
        ctx: &FilterContext<'_>,
    ) -> Result<FilterResult, FilterError> {
        let direction = ctx.direction();
        let context = ctx.session_context();

        let units = bump(context.get_attribute(&Self::units_key(direction)), 1);
        let bytes = bump(
            context.get_attribute(&Self::bytes_key(direction)),
            unit.len() as u64,
        );
        context.set_attribute(Self::units_key(direction), units);
        context.set_attribute(Self::bytes_key(direction), bytes);

        debug!(
            session_id = %ctx.session().id(),
            %direction,
            tag = unit.tag,
            len = unit.len(),
            seq = units,
            "unit observed"
        );
        Ok(FilterResult::Forward(unit))
    }
}

fn bump(current: Option<Value>, by: u64) -> u64 {
    current.and_then(|v| v.as_u64()).unwrap_or(0) + by
}
