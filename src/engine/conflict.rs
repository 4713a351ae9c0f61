use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability::first_conflict;
use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

/// Ordering plus the sanity bounds every stored span must respect.
pub(crate) fn validate_span(start: Ms, end: Ms) -> Result<Span, EngineError> {
    if start >= end {
        return Err(EngineError::InvalidInterval);
    }
    if start < MIN_VALID_TIMESTAMP_MS || end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if end - start > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("span too wide"));
    }
    Ok(Span::new(start, end))
}

/// Query windows share the timestamp bounds but allow a wider width check.
pub(crate) fn validate_window(start: Ms, end: Ms) -> Result<Span, EngineError> {
    if start >= end {
        return Err(EngineError::InvalidInterval);
    }
    if end - start > MAX_QUERY_WINDOW_MS {
        return Err(EngineError::LimitExceeded("query window too wide"));
    }
    Ok(Span::new(start, end))
}

/// Caller must hold the space's write lock until the reservation it is
/// guarding has been appended and applied.
pub(crate) fn check_no_conflict(
    space: &SpaceState,
    span: &Span,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    match first_conflict(space, span, exclude) {
        Some(existing) => Err(EngineError::Conflict(existing.id)),
        None => Ok(()),
    }
}
