//! Reservation lifecycle rules.
//!
//! Everything here is pure: the engine resolves records, takes locks and
//! supplies `now`, then persists whatever these functions decide.

use crate::limits::*;
use crate::model::*;

use super::conflict::{check_no_conflict, validate_span};
use super::EngineError;

/// Validate a booking request in the documented order and build the
/// pending reservation. Nothing is persisted here.
///
/// 1. space active, 2. interval ordered, 3. start in the future,
/// 4. attendees within `1..=capacity`, 5. no overlap.
/// Space existence is checked by the caller before the lock is taken.
pub(crate) fn plan_create(
    space: &SpaceState,
    owner: &Requester,
    req: &NewReservation,
    now: Ms,
) -> Result<Reservation, EngineError> {
    let user_id = owner
        .user_id
        .ok_or(EngineError::Forbidden("only registered users can reserve"))?;

    if !space.space.is_active {
        return Err(EngineError::SpaceInactive(space.space.id));
    }
    let span = validate_span(req.span.start, req.span.end)?;
    if span.start <= now {
        return Err(EngineError::StartNotInFuture);
    }
    if req.attendees < 1 {
        return Err(EngineError::InvalidAttendees(req.attendees));
    }
    if req.attendees > space.space.capacity {
        return Err(EngineError::CapacityExceeded {
            capacity: space.space.capacity,
        });
    }
    if let Some(ref n) = req.notes
        && n.len() > MAX_NOTES_LEN {
            return Err(EngineError::LimitExceeded("notes too long"));
        }
    if space.reservations.len() >= MAX_RESERVATIONS_PER_SPACE {
        return Err(EngineError::LimitExceeded("too many reservations on space"));
    }

    check_no_conflict(space, &span, None)?;

    let total_price = space
        .space
        .price
        .for_span(&span)
        .ok_or(EngineError::LimitExceeded("total price out of range"))?;

    Ok(Reservation {
        id: req.id,
        user_id,
        space_id: space.space.id,
        span,
        status: ReservationStatus::Pending,
        attendees: req.attendees,
        total_price,
        notes: req.notes.clone(),
        created_at: now,
        updated_at: None,
    })
}

/// Resulting status/notes of an update, or `None` when the patch changes
/// nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PlannedUpdate {
    pub status: ReservationStatus,
    pub notes: Option<String>,
}

/// Admins may move status along the state machine; the owner may edit
/// notes while the reservation is pending. Authorization is decided before
/// anything else so a forbidden request never mutates.
pub(crate) fn plan_update(
    current: &Reservation,
    requester: &Requester,
    patch: &ReservationPatch,
) -> Result<Option<PlannedUpdate>, EngineError> {
    let is_admin = requester.is_admin();
    let is_owner = requester.owns(current);
    if !is_admin && !is_owner {
        return Err(EngineError::Forbidden("not the owner of this reservation"));
    }

    let mut status = current.status;
    let mut notes = current.notes.clone();
    let mut changed = false;

    if let Some(ref raw) = patch.status {
        if !is_admin {
            return Err(EngineError::Forbidden("only administrators can change status"));
        }
        let next: ReservationStatus = raw
            .parse()
            .map_err(|_| EngineError::UnknownStatus(raw.clone()))?;
        if !current.status.can_transition_to(next) {
            return Err(EngineError::InvalidTransition {
                from: current.status,
                to: next,
            });
        }
        status = next;
        changed = true;
    }

    if let Some(ref new_notes) = patch.notes {
        if !is_owner {
            return Err(EngineError::Forbidden("only the owner can edit notes"));
        }
        // Checked against the status after any admin change in this patch.
        if status != ReservationStatus::Pending {
            return Err(EngineError::NotesLocked(status));
        }
        if new_notes.len() > MAX_NOTES_LEN {
            return Err(EngineError::LimitExceeded("notes too long"));
        }
        notes = Some(new_notes.clone());
        changed = true;
    }

    Ok(changed.then_some(PlannedUpdate { status, notes }))
}

/// Owner or admin, start strictly in the future, and a legal transition.
pub(crate) fn check_cancel(
    current: &Reservation,
    requester: &Requester,
    now: Ms,
) -> Result<(), EngineError> {
    if !requester.is_admin() && !requester.owns(current) {
        return Err(EngineError::Forbidden("not the owner of this reservation"));
    }
    if current.span.start <= now {
        return Err(EngineError::CannotCancelPast(current.id));
    }
    if !current.status.can_transition_to(ReservationStatus::Canceled) {
        return Err(EngineError::InvalidTransition {
            from: current.status,
            to: ReservationStatus::Canceled,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use ulid::Ulid;

    use super::*;

    const H: Ms = 3_600_000;
    const NOW: Ms = 1_700_000_000_000;

    fn user(roles: &[Role]) -> Requester {
        Requester {
            user_id: Some(Ulid::new()),
            roles: roles.iter().copied().collect::<BTreeSet<_>>(),
        }
    }

    fn space_state(capacity: u32, price_cents: i64, active: bool) -> SpaceState {
        SpaceState::new(Space {
            id: Ulid::new(),
            name: "Hall".into(),
            description: String::new(),
            price: Money::from_cents(price_cents),
            capacity,
            location: None,
            amenities: vec![],
            image_url: None,
            is_active: active,
        })
    }

    fn request(ss: &SpaceState, start: Ms, end: Ms, attendees: u32) -> NewReservation {
        NewReservation {
            id: Ulid::new(),
            space_id: ss.space.id,
            span: Span { start, end },
            attendees,
            notes: None,
        }
    }

    fn reservation_for(owner: &Requester, status: ReservationStatus, start: Ms) -> Reservation {
        Reservation {
            id: Ulid::new(),
            user_id: owner.user_id.unwrap(),
            space_id: Ulid::new(),
            span: Span::new(start, start + H),
            status,
            attendees: 1,
            total_price: Money::ZERO,
            notes: None,
            created_at: NOW - H,
            updated_at: None,
        }
    }

    #[test]
    fn create_builds_pending_reservation_with_price() {
        let ss = space_state(10, 10_000, true);
        let owner = user(&[Role::User]);
        let req = request(&ss, NOW + H, NOW + H + 90 * 60_000, 3);
        let r = plan_create(&ss, &owner, &req, NOW).unwrap();
        assert_eq!(r.status, ReservationStatus::Pending);
        assert_eq!(r.total_price, Money::from_cents(15_000));
        assert_eq!(r.created_at, NOW);
        assert_eq!(r.updated_at, None);
        assert_eq!(r.user_id, owner.user_id.unwrap());
    }

    #[test]
    fn create_rejects_inactive_space_before_interval() {
        let ss = space_state(10, 0, false);
        // Interval is also bad; inactive is reported first.
        let req = request(&ss, NOW + 2 * H, NOW + H, 1);
        let err = plan_create(&ss, &user(&[Role::User]), &req, NOW).unwrap_err();
        assert!(matches!(err, EngineError::SpaceInactive(_)));
    }

    #[test]
    fn create_rejects_reversed_and_empty_interval() {
        let ss = space_state(10, 0, true);
        let owner = user(&[Role::User]);
        let reversed = request(&ss, NOW + 2 * H, NOW + H, 1);
        assert!(matches!(
            plan_create(&ss, &owner, &reversed, NOW),
            Err(EngineError::InvalidInterval)
        ));
        let empty = request(&ss, NOW + H, NOW + H, 1);
        assert!(matches!(
            plan_create(&ss, &owner, &empty, NOW),
            Err(EngineError::InvalidInterval)
        ));
    }

    #[test]
    fn create_requires_future_start() {
        let ss = space_state(10, 0, true);
        let owner = user(&[Role::User]);
        let at_now = request(&ss, NOW, NOW + H, 1);
        assert!(matches!(
            plan_create(&ss, &owner, &at_now, NOW),
            Err(EngineError::StartNotInFuture)
        ));
    }

    #[test]
    fn capacity_boundary() {
        let ss = space_state(10, 0, true);
        let owner = user(&[Role::User]);
        let at_cap = request(&ss, NOW + H, NOW + 2 * H, 10);
        assert!(plan_create(&ss, &owner, &at_cap, NOW).is_ok());

        let over = request(&ss, NOW + H, NOW + 2 * H, 11);
        let err = plan_create(&ss, &owner, &over, NOW).unwrap_err();
        assert!(matches!(err, EngineError::CapacityExceeded { capacity: 10 }));
        assert_eq!(err.detail().as_deref(), Some("capacity=10"));
    }

    #[test]
    fn total_price_overflow_rejected() {
        let ss = space_state(10, 5_000_000_000_000_000_000, true);
        let req = request(&ss, NOW + H, NOW + 3 * H, 1);
        let err = plan_create(&ss, &user(&[Role::User]), &req, NOW).unwrap_err();
        assert!(matches!(err, EngineError::LimitExceeded("total price out of range")));

        let one_hour = request(&ss, NOW + H, NOW + 2 * H, 1);
        let r = plan_create(&ss, &user(&[Role::User]), &one_hour, NOW).unwrap();
        assert_eq!(r.total_price, Money::from_cents(5_000_000_000_000_000_000));
    }

    #[test]
    fn zero_attendees_rejected() {
        let ss = space_state(10, 0, true);
        let req = request(&ss, NOW + H, NOW + 2 * H, 0);
        assert!(matches!(
            plan_create(&ss, &user(&[Role::User]), &req, NOW),
            Err(EngineError::InvalidAttendees(0))
        ));
    }

    #[test]
    fn anonymous_cannot_create() {
        let ss = space_state(10, 0, true);
        let req = request(&ss, NOW + H, NOW + 2 * H, 1);
        assert!(matches!(
            plan_create(&ss, &Requester::anonymous(), &req, NOW),
            Err(EngineError::Forbidden(_))
        ));
    }

    #[test]
    fn admin_moves_status_along_state_machine() {
        let owner = user(&[Role::User]);
        let admin = user(&[Role::Admin, Role::User]);
        let r = reservation_for(&owner, ReservationStatus::Pending, NOW + H);
        let patch = ReservationPatch {
            status: Some("approved".into()),
            notes: None,
        };
        let planned = plan_update(&r, &admin, &patch).unwrap().unwrap();
        assert_eq!(planned.status, ReservationStatus::Approved);
    }

    #[test]
    fn admin_cannot_reopen_rejected() {
        let owner = user(&[Role::User]);
        let admin = user(&[Role::Admin]);
        let r = reservation_for(&owner, ReservationStatus::Rejected, NOW + H);
        let patch = ReservationPatch {
            status: Some("pending".into()),
            notes: None,
        };
        assert!(matches!(
            plan_update(&r, &admin, &patch),
            Err(EngineError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn unknown_status_string_rejected() {
        let owner = user(&[Role::User]);
        let admin = user(&[Role::Admin]);
        let r = reservation_for(&owner, ReservationStatus::Pending, NOW + H);
        let patch = ReservationPatch {
            status: Some("archived".into()),
            notes: None,
        };
        assert!(matches!(
            plan_update(&r, &admin, &patch),
            Err(EngineError::UnknownStatus(_))
        ));
    }

    #[test]
    fn owner_edits_notes_only_while_pending() {
        let owner = user(&[Role::User]);
        let pending = reservation_for(&owner, ReservationStatus::Pending, NOW + H);
        let patch = ReservationPatch {
            status: None,
            notes: Some("bring a projector".into()),
        };
        let planned = plan_update(&pending, &owner, &patch).unwrap().unwrap();
        assert_eq!(planned.notes.as_deref(), Some("bring a projector"));
        assert_eq!(planned.status, ReservationStatus::Pending);

        let approved = reservation_for(&owner, ReservationStatus::Approved, NOW + H);
        assert!(matches!(
            plan_update(&approved, &owner, &patch),
            Err(EngineError::NotesLocked(ReservationStatus::Approved))
        ));
    }

    #[test]
    fn owner_cannot_change_status() {
        let owner = user(&[Role::User]);
        let r = reservation_for(&owner, ReservationStatus::Pending, NOW + H);
        let patch = ReservationPatch {
            status: Some("approved".into()),
            notes: None,
        };
        assert!(matches!(plan_update(&r, &owner, &patch), Err(EngineError::Forbidden(_))));
    }

    #[test]
    fn stranger_forbidden_even_with_empty_patch() {
        let owner = user(&[Role::User]);
        let stranger = user(&[Role::User]);
        let r = reservation_for(&owner, ReservationStatus::Pending, NOW + H);
        assert!(matches!(
            plan_update(&r, &stranger, &ReservationPatch::default()),
            Err(EngineError::Forbidden(_))
        ));
    }

    #[test]
    fn empty_patch_is_noop() {
        let owner = user(&[Role::User]);
        let r = reservation_for(&owner, ReservationStatus::Pending, NOW + H);
        assert_eq!(plan_update(&r, &owner, &ReservationPatch::default()).unwrap(), None);
    }

    #[test]
    fn admin_owner_approving_locks_notes_in_same_patch() {
        let admin_owner = user(&[Role::Admin, Role::User]);
        let r = reservation_for(&admin_owner, ReservationStatus::Pending, NOW + H);
        let patch = ReservationPatch {
            status: Some("approved".into()),
            notes: Some("late edit".into()),
        };
        assert!(matches!(
            plan_update(&r, &admin_owner, &patch),
            Err(EngineError::NotesLocked(ReservationStatus::Approved))
        ));
    }

    #[test]
    fn cancel_rules() {
        let owner = user(&[Role::User]);
        let admin = user(&[Role::Admin]);
        let stranger = user(&[Role::User]);

        let future = reservation_for(&owner, ReservationStatus::Approved, NOW + H);
        assert!(check_cancel(&future, &owner, NOW).is_ok());
        assert!(check_cancel(&future, &admin, NOW).is_ok());
        assert!(matches!(
            check_cancel(&future, &stranger, NOW),
            Err(EngineError::Forbidden(_))
        ));

        let past = reservation_for(&owner, ReservationStatus::Pending, NOW - H);
        assert!(matches!(
            check_cancel(&past, &owner, NOW),
            Err(EngineError::CannotCancelPast(_))
        ));

        let starting_now = reservation_for(&owner, ReservationStatus::Pending, NOW);
        assert!(matches!(
            check_cancel(&starting_now, &owner, NOW),
            Err(EngineError::CannotCancelPast(_))
        ));

        let rejected = reservation_for(&owner, ReservationStatus::Rejected, NOW + H);
        assert!(matches!(
            check_cancel(&rejected, &owner, NOW),
            Err(EngineError::InvalidTransition { .. })
        ));
    }
}
