use ulid::Ulid;

use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

/// Reject malformed intervals before any conflict evaluation.
pub(crate) fn validate_span(start: Ms, end: Ms) -> Result<Span, EngineError> {
    use crate::limits::*;
    if start >= end {
        return Err(EngineError::Invalid(format!(
            "booking must end after it starts (start={start}, end={end})"
        )));
    }
    if start < MIN_VALID_TIMESTAMP_MS || end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    let span = Span::new(start, end);
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("span too wide"));
    }
    Ok(span)
}

/// Decide whether `span` may be admitted on `room`.
///
/// Only bookings still holding their slot (requested or approved) are
/// considered. `exclude` lets a reschedule ignore the booking's own prior
/// interval. The caller holds the room's write lock across this check and
/// the insert that follows, so concurrent requests serialize here.
pub fn admit(room: &RoomState, span: &Span, exclude: Option<Ulid>) -> Result<(), EngineError> {
    let clash = room
        .overlapping(span)
        .filter(|b| Some(b.id) != exclude)
        .find(|b| b.status.is_active());
    match clash {
        Some(existing) => {
            metrics::counter!(crate::observability::BOOKING_CONFLICTS_TOTAL).increment(1);
            Err(EngineError::Conflict(existing.id))
        }
        None => Ok(()),
    }
}
