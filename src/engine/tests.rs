use std::collections::BTreeSet;

use super::*;
use super::conflict::now_ms;
use crate::auth::Argon2AuthService;
use crate::limits::*;

const H: Ms = 3_600_000; // 1 hour in ms
const M: Ms = 60_000; // 1 minute in ms
const DAY: Ms = 24 * H;
/// Fixed "now" for the `_at` variants (2027-01-15T08:00:00Z).
const NOW: Ms = 1_800_000_000_000;

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("spacebook_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn cheap_auth() -> Arc<dyn AuthService> {
    Arc::new(Argon2AuthService::with_cost(8, 1, 1).unwrap())
}

fn new_engine(name: &str) -> Engine {
    Engine::new(test_wal_path(name), cheap_auth()).unwrap()
}

fn admin() -> Requester {
    Requester {
        user_id: Some(Ulid::new()),
        roles: BTreeSet::from([Role::Admin, Role::User]),
    }
}

fn member() -> Requester {
    Requester {
        user_id: Some(Ulid::new()),
        roles: BTreeSet::from([Role::User]),
    }
}

fn space(name: &str, capacity: u32, price_cents: i64) -> Space {
    Space {
        id: Ulid::new(),
        name: name.into(),
        description: format!("{name} description"),
        price: Money::from_cents(price_cents),
        capacity,
        location: None,
        amenities: vec![],
        image_url: None,
        is_active: true,
    }
}

fn booking(space_id: Ulid, start: Ms, end: Ms, attendees: u32) -> NewReservation {
    NewReservation {
        id: Ulid::new(),
        space_id,
        span: Span { start, end },
        attendees,
        notes: None,
    }
}

async fn seeded_space(engine: &Engine, capacity: u32, price_cents: i64) -> Ulid {
    let sp = space("Meeting Room", capacity, price_cents);
    let id = sp.id;
    engine.create_space(&admin(), sp).await.unwrap();
    id
}

fn status_patch(status: &str) -> ReservationPatch {
    ReservationPatch {
        status: Some(status.into()),
        notes: None,
    }
}

fn notes_patch(notes: &str) -> ReservationPatch {
    ReservationPatch {
        status: None,
        notes: Some(notes.into()),
    }
}

// ── Space Catalog ───────────────────────────────────────

#[tokio::test]
async fn create_space_requires_admin() {
    let engine = new_engine("space_admin_only.wal");
    let result = engine.create_space(&member(), space("Loft", 4, 0)).await;
    assert!(matches!(result, Err(EngineError::Forbidden(_))));
    assert!(engine.spaces.is_empty());
}

#[tokio::test]
async fn create_space_duplicate_id_rejected() {
    let engine = new_engine("space_dup.wal");
    let sp = space("Loft", 4, 0);
    engine.create_space(&admin(), sp.clone()).await.unwrap();
    let result = engine.create_space(&admin(), sp.clone()).await;
    assert!(matches!(result, Err(EngineError::AlreadyExists(id)) if id == sp.id));
}

#[tokio::test]
async fn list_spaces_filters_inactive_for_members() {
    let engine = new_engine("list_spaces.wal");
    let a = admin();
    engine.create_space(&a, space("Zen Room", 2, 0)).await.unwrap();
    engine.create_space(&a, space("Atrium", 50, 0)).await.unwrap();
    let mut hidden = space("Basement", 5, 0);
    hidden.is_active = false;
    engine.create_space(&a, hidden.clone()).await.unwrap();

    let names: Vec<String> = engine.list_spaces(&member()).await.into_iter().map(|s| s.name).collect();
    assert_eq!(names, vec!["Atrium", "Zen Room"]);

    let names: Vec<String> = engine.list_spaces(&a).await.into_iter().map(|s| s.name).collect();
    assert_eq!(names, vec!["Atrium", "Basement", "Zen Room"]);

    assert!(matches!(
        engine.get_space(&member(), hidden.id).await,
        Err(EngineError::Forbidden(_))
    ));
    assert_eq!(engine.get_space(&a, hidden.id).await.unwrap().name, "Basement");
    assert!(matches!(
        engine.get_space(&a, Ulid::new()).await,
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test]
async fn update_space_leaves_existing_reservations_alone() {
    let engine = new_engine("update_space_price.wal");
    let sid = seeded_space(&engine, 10, 10_000).await;
    let user = member();
    let r = engine
        .create_reservation_at(&user, booking(sid, NOW + DAY, NOW + DAY + 2 * H, 8), NOW)
        .await
        .unwrap();
    assert_eq!(r.total_price, Money::from_cents(20_000));

    let patch = SpacePatch {
        price: Some(Money::from_cents(1)),
        capacity: Some(2),
        ..Default::default()
    };
    let updated = engine.update_space(&admin(), sid, patch).await.unwrap();
    assert_eq!(updated.capacity, 2);

    let again = engine.get_reservation(&user, r.id).await.unwrap();
    assert_eq!(again.total_price, Money::from_cents(20_000));
    assert_eq!(again.attendees, 8);
}

#[tokio::test]
async fn update_space_validates_patch() {
    let engine = new_engine("update_space_invalid.wal");
    let sid = seeded_space(&engine, 10, 0).await;
    let patch = SpacePatch {
        capacity: Some(0),
        ..Default::default()
    };
    assert!(matches!(
        engine.update_space(&admin(), sid, patch).await,
        Err(EngineError::InvalidInput(_))
    ));
    assert!(matches!(
        engine.update_space(&member(), sid, SpacePatch::default()).await,
        Err(EngineError::Forbidden(_))
    ));
}

#[tokio::test]
async fn delete_space_without_reservations_removes_it() {
    let engine = new_engine("delete_space_empty.wal");
    let sid = seeded_space(&engine, 4, 0).await;
    let removal = engine.delete_space(&admin(), sid).await.unwrap();
    assert_eq!(removal, SpaceRemoval::Deleted);
    assert!(engine.get_space_state(&sid).is_none());
    assert!(matches!(
        engine.delete_space(&admin(), sid).await,
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test]
async fn delete_space_with_any_reservation_only_disables() {
    let engine = new_engine("delete_space_soft.wal");
    let sid = seeded_space(&engine, 4, 0).await;
    let user = member();
    let r = engine
        .create_reservation_at(&user, booking(sid, NOW + DAY, NOW + DAY + H, 1), NOW)
        .await
        .unwrap();
    // Even a canceled reservation keeps the space around.
    engine.cancel_reservation_at(&user, r.id, NOW).await.unwrap();

    let removal = engine.delete_space(&admin(), sid).await.unwrap();
    assert_eq!(removal, SpaceRemoval::Disabled);
    let kept = engine.get_space(&admin(), sid).await.unwrap();
    assert!(!kept.is_active);

    // Disabled space is excluded from booking.
    let result = engine
        .create_reservation_at(&user, booking(sid, NOW + 2 * DAY, NOW + 2 * DAY + H, 1), NOW)
        .await;
    assert!(matches!(result, Err(EngineError::SpaceInactive(_))));
}

// ── Reservation creation ────────────────────────────────

#[tokio::test]
async fn reservation_created_pending_with_fractional_price() {
    let engine = new_engine("create_pending.wal");
    let sid = seeded_space(&engine, 10, 10_000).await;
    let user = member();
    let r = engine
        .create_reservation_at(&user, booking(sid, NOW + H, NOW + H + 90 * M, 3), NOW)
        .await
        .unwrap();
    assert_eq!(r.status, ReservationStatus::Pending);
    assert_eq!(r.total_price, Money::from_cents(15_000));
    assert_eq!(r.total_price.to_string(), "150.00");
    assert_eq!(r.created_at, NOW);
    assert_eq!(r.updated_at, None);
    assert_eq!(r.user_id, user.user_id.unwrap());
}

#[tokio::test]
async fn create_reports_missing_space_first() {
    let engine = new_engine("create_missing_space.wal");
    // Interval and attendees are bad too; existence wins.
    let result = engine
        .create_reservation_at(&member(), booking(Ulid::new(), NOW + 2 * H, NOW + H, 0), NOW)
        .await;
    assert!(matches!(result, Err(EngineError::NotFound(_))));
}

#[tokio::test]
async fn create_rejects_bad_interval_and_past_start() {
    let engine = new_engine("create_bad_interval.wal");
    let sid = seeded_space(&engine, 10, 0).await;
    let user = member();

    let reversed = engine
        .create_reservation_at(&user, booking(sid, NOW + 2 * H, NOW + H, 1), NOW)
        .await;
    assert!(matches!(reversed, Err(EngineError::InvalidInterval)));

    let past = engine
        .create_reservation_at(&user, booking(sid, NOW - H, NOW + H, 1), NOW)
        .await;
    assert!(matches!(past, Err(EngineError::StartNotInFuture)));

    let out_of_range = engine
        .create_reservation_at(&user, booking(sid, MAX_VALID_TIMESTAMP_MS, MAX_VALID_TIMESTAMP_MS + H, 1), NOW)
        .await;
    assert!(matches!(out_of_range, Err(EngineError::LimitExceeded(_))));
}

#[tokio::test]
async fn capacity_boundary_reports_capacity() {
    let engine = new_engine("capacity_boundary.wal");
    let sid = seeded_space(&engine, 10, 0).await;
    let user = member();

    let over = engine
        .create_reservation_at(&user, booking(sid, NOW + H, NOW + 2 * H, 11), NOW)
        .await
        .unwrap_err();
    assert!(matches!(over, EngineError::CapacityExceeded { capacity: 10 }));
    assert_eq!(over.outcome(), Outcome::Invalid);
    assert!(over.to_string().contains("capacity: 10"));

    let exact = engine
        .create_reservation_at(&user, booking(sid, NOW + H, NOW + 2 * H, 10), NOW)
        .await
        .unwrap();
    assert_eq!(exact.attendees, 10);
}

#[tokio::test]
async fn touching_reservations_both_accepted() {
    let engine = new_engine("touching.wal");
    let sid = seeded_space(&engine, 10, 0).await;
    let day = NOW + DAY;
    engine
        .create_reservation_at(&member(), booking(sid, day + 10 * H, day + 11 * H, 1), NOW)
        .await
        .unwrap();
    engine
        .create_reservation_at(&member(), booking(sid, day + 11 * H, day + 12 * H, 1), NOW)
        .await
        .unwrap();
    engine
        .create_reservation_at(&member(), booking(sid, day + 9 * H, day + 10 * H, 1), NOW)
        .await
        .unwrap();
}

#[tokio::test]
async fn overlapping_reservation_conflicts() {
    let engine = new_engine("overlap_conflict.wal");
    let sid = seeded_space(&engine, 10, 0).await;
    let day = NOW + DAY;
    let first = engine
        .create_reservation_at(&member(), booking(sid, day + 10 * H, day + 12 * H, 1), NOW)
        .await
        .unwrap();
    let result = engine
        .create_reservation_at(&member(), booking(sid, day + 11 * H, day + 13 * H, 1), NOW)
        .await;
    match result {
        Err(e @ EngineError::Conflict(_)) => {
            assert_eq!(e.outcome(), Outcome::Conflict);
            assert_eq!(e.detail(), Some(format!("conflicting_reservation={}", first.id)));
        }
        other => panic!("expected conflict, got {other:?}"),
    }
}

#[tokio::test]
async fn rejected_reservation_keeps_blocking() {
    let engine = new_engine("rejected_blocks.wal");
    let sid = seeded_space(&engine, 10, 0).await;
    let day = NOW + DAY;
    let r = engine
        .create_reservation_at(&member(), booking(sid, day, day + H, 1), NOW)
        .await
        .unwrap();
    engine
        .update_reservation_at(&admin(), r.id, status_patch("rejected"), NOW)
        .await
        .unwrap();
    let retry = engine
        .create_reservation_at(&member(), booking(sid, day, day + H, 1), NOW)
        .await;
    assert!(matches!(retry, Err(EngineError::Conflict(_))));
}

#[tokio::test]
async fn canceled_interval_can_be_rebooked() {
    let engine = new_engine("canceled_rebook.wal");
    let sid = seeded_space(&engine, 10, 0).await;
    let owner = member();
    let day = NOW + DAY;
    let r = engine
        .create_reservation_at(&owner, booking(sid, day + 9 * H, day + 10 * H, 1), NOW)
        .await
        .unwrap();
    engine.cancel_reservation_at(&owner, r.id, NOW).await.unwrap();

    assert!(engine
        .check_availability(sid, day + 9 * H, day + 10 * H, None)
        .await
        .unwrap());
    engine
        .create_reservation_at(&member(), booking(sid, day + 9 * H, day + 10 * H, 1), NOW)
        .await
        .unwrap();
}

#[tokio::test]
async fn anonymous_cannot_reserve() {
    let engine = new_engine("anonymous_reserve.wal");
    let sid = seeded_space(&engine, 10, 0).await;
    let result = engine
        .create_reservation_at(&Requester::anonymous(), booking(sid, NOW + H, NOW + 2 * H, 1), NOW)
        .await;
    assert!(matches!(result, Err(EngineError::Forbidden(_))));
}

#[tokio::test]
async fn duplicate_reservation_id_rejected() {
    let engine = new_engine("dup_reservation.wal");
    let sid = seeded_space(&engine, 10, 0).await;
    let req = booking(sid, NOW + H, NOW + 2 * H, 1);
    let mut again = booking(sid, NOW + 5 * H, NOW + 6 * H, 1);
    again.id = req.id;
    engine.create_reservation_at(&member(), req, NOW).await.unwrap();
    assert!(matches!(
        engine.create_reservation_at(&member(), again, NOW).await,
        Err(EngineError::AlreadyExists(_))
    ));
}

#[tokio::test]
async fn public_entry_points_use_wall_clock() {
    let engine = new_engine("wall_clock.wal");
    let sid = seeded_space(&engine, 10, 0).await;
    let owner = member();
    let start = now_ms() + DAY;
    let r = engine
        .create_reservation(&owner, booking(sid, start, start + H, 2))
        .await
        .unwrap();
    assert!(r.created_at <= now_ms());

    let past = engine
        .create_reservation(&owner, booking(sid, now_ms() - H, now_ms() + H, 2))
        .await;
    assert!(matches!(past, Err(EngineError::StartNotInFuture)));

    let canceled = engine.cancel_reservation(&owner, r.id).await.unwrap();
    assert_eq!(canceled.status, ReservationStatus::Canceled);
}

// ── Concurrency ─────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_overlapping_requests_admit_exactly_one() {
    let engine = Arc::new(new_engine("concurrent_overlap.wal"));
    let sid = seeded_space(&engine, 10, 0).await;
    let day = NOW + DAY;

    let mut handles = Vec::new();
    for i in 0..32 {
        let eng = engine.clone();
        handles.push(tokio::spawn(async move {
            // Every request overlaps [10:00, 11:00) by at least half an hour.
            let start = day + 10 * H - 30 * M + (i % 3) * 15 * M;
            eng.create_reservation_at(&member(), booking(sid, start, start + H, 1), NOW)
                .await
        }));
    }

    let mut accepted = 0;
    let mut conflicts = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => accepted += 1,
            Err(EngineError::Conflict(_)) => conflicts += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(accepted, 1);
    assert_eq!(conflicts, 31);

    let ss = engine.get_space_state(&sid).unwrap();
    let guard = ss.read().await;
    assert_eq!(guard.reservations.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn same_reservation_id_on_two_spaces_admits_one() {
    let engine = Arc::new(new_engine("dup_id_two_spaces.wal"));
    let admin = admin();
    let first = seeded_space(&engine, 10, 0).await;
    let second = seeded_space(&engine, 10, 0).await;

    for round in 0..16 {
        let id = Ulid::new();
        let start = NOW + DAY + round * H;
        let mut handles = Vec::new();
        for sid in [first, second] {
            let eng = engine.clone();
            let owner = admin.clone();
            let mut req = booking(sid, start, start + H, 1);
            req.id = id;
            handles.push(tokio::spawn(async move {
                eng.create_reservation_at(&owner, req, NOW).await
            }));
        }

        let mut winner = None;
        let mut duplicates = 0;
        for h in handles {
            match h.await.unwrap() {
                Ok(r) => winner = Some(r),
                Err(EngineError::AlreadyExists(dup)) => {
                    assert_eq!(dup, id);
                    duplicates += 1;
                }
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        let winner = winner.expect("one create must succeed");
        assert_eq!(duplicates, 1);

        let found = engine.get_reservation(&admin, id).await.unwrap();
        assert_eq!(found.space_id, winner.space_id);
        let loser = if winner.space_id == first { second } else { first };
        let ss = engine.get_space_state(&loser).unwrap();
        assert!(ss.read().await.reservation(&id).is_none());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_disjoint_requests_all_succeed() {
    let engine = Arc::new(new_engine("concurrent_disjoint.wal"));
    let sid = seeded_space(&engine, 10, 0).await;
    let day = NOW + DAY;

    let mut handles = Vec::new();
    for i in 0..24 {
        let eng = engine.clone();
        handles.push(tokio::spawn(async move {
            let start = day + i * H;
            eng.create_reservation_at(&member(), booking(sid, start, start + H, 1), NOW)
                .await
        }));
    }
    for h in handles {
        h.await.unwrap().unwrap();
    }

    let ss = engine.get_space_state(&sid).unwrap();
    let guard = ss.read().await;
    assert_eq!(guard.reservations.len(), 24);
    for pair in guard.reservations.windows(2) {
        assert!(pair[0].span.end <= pair[1].span.start);
    }
}

// ── Status and notes ────────────────────────────────────

#[tokio::test]
async fn admin_approves_and_updated_at_is_set() {
    let engine = new_engine("admin_approve.wal");
    let sid = seeded_space(&engine, 10, 0).await;
    let r = engine
        .create_reservation_at(&member(), booking(sid, NOW + DAY, NOW + DAY + H, 1), NOW)
        .await
        .unwrap();

    let approved = engine
        .update_reservation_at(&admin(), r.id, status_patch("approved"), NOW + M)
        .await
        .unwrap();
    assert_eq!(approved.status, ReservationStatus::Approved);
    assert_eq!(approved.updated_at, Some(NOW + M));
    assert_eq!(approved.created_at, NOW);
}

#[tokio::test]
async fn illegal_transitions_are_invalid() {
    let engine = new_engine("illegal_transition.wal");
    let sid = seeded_space(&engine, 10, 0).await;
    let a = admin();
    let r = engine
        .create_reservation_at(&member(), booking(sid, NOW + DAY, NOW + DAY + H, 1), NOW)
        .await
        .unwrap();
    engine
        .update_reservation_at(&a, r.id, status_patch("rejected"), NOW)
        .await
        .unwrap();

    let reopen = engine
        .update_reservation_at(&a, r.id, status_patch("pending"), NOW)
        .await
        .unwrap_err();
    assert!(matches!(reopen, EngineError::InvalidTransition { .. }));
    assert_eq!(reopen.outcome(), Outcome::Invalid);

    let unknown = engine
        .update_reservation_at(&a, r.id, status_patch("on-hold"), NOW)
        .await;
    assert!(matches!(unknown, Err(EngineError::UnknownStatus(_))));

    let still = engine.get_reservation(&a, r.id).await.unwrap();
    assert_eq!(still.status, ReservationStatus::Rejected);
}

#[tokio::test]
async fn owner_notes_editable_only_while_pending() {
    let engine = new_engine("owner_notes.wal");
    let sid = seeded_space(&engine, 10, 0).await;
    let owner = member();
    let r = engine
        .create_reservation_at(&owner, booking(sid, NOW + DAY, NOW + DAY + H, 1), NOW)
        .await
        .unwrap();

    let edited = engine
        .update_reservation_at(&owner, r.id, notes_patch("need a projector"), NOW + M)
        .await
        .unwrap();
    assert_eq!(edited.notes.as_deref(), Some("need a projector"));
    assert_eq!(edited.updated_at, Some(NOW + M));

    engine
        .update_reservation_at(&admin(), r.id, status_patch("approved"), NOW + 2 * M)
        .await
        .unwrap();
    let locked = engine
        .update_reservation_at(&owner, r.id, notes_patch("too late"), NOW + 3 * M)
        .await;
    assert!(matches!(locked, Err(EngineError::NotesLocked(ReservationStatus::Approved))));

    let after = engine.get_reservation(&owner, r.id).await.unwrap();
    assert_eq!(after.notes.as_deref(), Some("need a projector"));
    assert_eq!(after.updated_at, Some(NOW + 2 * M));
}

#[tokio::test]
async fn stranger_cannot_touch_reservation() {
    let engine = new_engine("stranger.wal");
    let sid = seeded_space(&engine, 10, 0).await;
    let owner = member();
    let stranger = member();
    let r = engine
        .create_reservation_at(&owner, booking(sid, NOW + DAY, NOW + DAY + H, 1), NOW)
        .await
        .unwrap();

    assert!(matches!(
        engine.update_reservation_at(&stranger, r.id, notes_patch("mine now"), NOW).await,
        Err(EngineError::Forbidden(_))
    ));
    assert!(matches!(
        engine.cancel_reservation_at(&stranger, r.id, NOW).await,
        Err(EngineError::Forbidden(_))
    ));
    assert!(matches!(
        engine.get_reservation(&stranger, r.id).await,
        Err(EngineError::Forbidden(_))
    ));
    assert_eq!(engine.get_reservation(&owner, r.id).await.unwrap(), r);
}

#[tokio::test]
async fn owner_cannot_set_status() {
    let engine = new_engine("owner_status.wal");
    let sid = seeded_space(&engine, 10, 0).await;
    let owner = member();
    let r = engine
        .create_reservation_at(&owner, booking(sid, NOW + DAY, NOW + DAY + H, 1), NOW)
        .await
        .unwrap();
    assert!(matches!(
        engine.update_reservation_at(&owner, r.id, status_patch("approved"), NOW).await,
        Err(EngineError::Forbidden(_))
    ));
}

#[tokio::test]
async fn unknown_reservation_not_found() {
    let engine = new_engine("unknown_reservation.wal");
    let id = Ulid::new();
    assert!(matches!(
        engine.update_reservation_at(&admin(), id, status_patch("approved"), NOW).await,
        Err(EngineError::NotFound(x)) if x == id
    ));
    assert!(matches!(
        engine.cancel_reservation_at(&admin(), id, NOW).await,
        Err(EngineError::NotFound(_))
    ));
}

// ── Cancellation ────────────────────────────────────────

#[tokio::test]
async fn cancel_past_reservation_leaves_state_unchanged() {
    let engine = new_engine("cancel_past.wal");
    let sid = seeded_space(&engine, 10, 0).await;
    let owner = member();
    let r = engine
        .create_reservation_at(&owner, booking(sid, NOW + H, NOW + 2 * H, 1), NOW)
        .await
        .unwrap();

    // Time moves past the start.
    let later = NOW + 90 * M;
    let result = engine.cancel_reservation_at(&owner, r.id, later).await;
    assert!(matches!(result, Err(EngineError::CannotCancelPast(_))));

    let unchanged = engine.get_reservation(&owner, r.id).await.unwrap();
    assert_eq!(unchanged, r);
}

#[tokio::test]
async fn cancel_twice_is_invalid() {
    let engine = new_engine("cancel_twice.wal");
    let sid = seeded_space(&engine, 10, 0).await;
    let owner = member();
    let r = engine
        .create_reservation_at(&owner, booking(sid, NOW + DAY, NOW + DAY + H, 1), NOW)
        .await
        .unwrap();
    let canceled = engine.cancel_reservation_at(&admin(), r.id, NOW + M).await.unwrap();
    assert_eq!(canceled.status, ReservationStatus::Canceled);
    assert_eq!(canceled.updated_at, Some(NOW + M));

    assert!(matches!(
        engine.cancel_reservation_at(&owner, r.id, NOW + 2 * M).await,
        Err(EngineError::InvalidTransition { .. })
    ));
}

// ── End-to-end scenario ─────────────────────────────────

#[tokio::test]
async fn conflict_then_cancel_then_retry() {
    let engine = new_engine("end_to_end.wal");
    let sid = seeded_space(&engine, 10, 5_000).await;
    let user1 = member();
    let user2 = member();
    let day = NOW + DAY;

    let a = engine
        .create_reservation_at(&user1, booking(sid, day + 10 * H, day + 12 * H, 5), NOW)
        .await
        .unwrap();
    assert_eq!(a.status, ReservationStatus::Pending);
    assert_eq!(a.total_price.to_string(), "100.00");

    let b = booking(sid, day + 11 * H, day + 13 * H, 3);
    let first_try = engine.create_reservation_at(&user2, b.clone(), NOW).await;
    assert!(matches!(first_try, Err(EngineError::Conflict(id)) if id == a.id));

    engine.cancel_reservation_at(&user1, a.id, NOW).await.unwrap();

    let retried = engine.create_reservation_at(&user2, b, NOW).await.unwrap();
    assert_eq!(retried.status, ReservationStatus::Pending);
    assert_eq!(retried.total_price.to_string(), "100.00");
}

// ── Listings ────────────────────────────────────────────

#[tokio::test]
async fn list_reservations_scoped_and_newest_first() {
    let engine = new_engine("list_reservations.wal");
    let sid = seeded_space(&engine, 10, 0).await;
    let alice = member();
    let bob = member();
    for i in 0..3 {
        let start = NOW + DAY + i * 2 * H;
        engine
            .create_reservation_at(&alice, booking(sid, start, start + H, 1), NOW)
            .await
            .unwrap();
    }
    engine
        .create_reservation_at(&bob, booking(sid, NOW + 3 * DAY, NOW + 3 * DAY + H, 1), NOW)
        .await
        .unwrap();

    let mine = engine.list_reservations(&alice).await;
    assert_eq!(mine.len(), 3);
    assert!(mine.windows(2).all(|w| w[0].span.start > w[1].span.start));
    assert!(mine.iter().all(|r| alice.owns(r)));

    assert_eq!(engine.list_reservations(&admin()).await.len(), 4);
    assert!(engine.list_reservations(&Requester::anonymous()).await.is_empty());
}

#[tokio::test]
async fn upcoming_excludes_past_and_canceled() {
    let engine = new_engine("upcoming.wal");
    let sid = seeded_space(&engine, 10, 0).await;
    let owner = member();
    let soon = engine
        .create_reservation_at(&owner, booking(sid, NOW + H, NOW + 2 * H, 1), NOW)
        .await
        .unwrap();
    let later = engine
        .create_reservation_at(&owner, booking(sid, NOW + DAY, NOW + DAY + H, 1), NOW)
        .await
        .unwrap();
    let dropped = engine
        .create_reservation_at(&owner, booking(sid, NOW + 2 * DAY, NOW + 2 * DAY + H, 1), NOW)
        .await
        .unwrap();
    engine.cancel_reservation_at(&owner, dropped.id, NOW).await.unwrap();

    let ids: Vec<Ulid> = engine
        .upcoming_reservations_at(&owner, NOW)
        .await
        .into_iter()
        .map(|r| r.id)
        .collect();
    assert_eq!(ids, vec![soon.id, later.id]);

    // Three hours on, the first one has started.
    let ids: Vec<Ulid> = engine
        .upcoming_reservations_at(&owner, NOW + 3 * H)
        .await
        .into_iter()
        .map(|r| r.id)
        .collect();
    assert_eq!(ids, vec![later.id]);
}

#[tokio::test]
async fn calendar_window_is_inclusive_on_start_or_end() {
    let engine = new_engine("calendar.wal");
    let sid = seeded_space(&engine, 10, 0).await;
    let owner = member();
    let day = NOW + DAY;
    // Ends exactly at the window start.
    let ends_at_edge = engine
        .create_reservation_at(&owner, booking(sid, day - H, day, 1), NOW)
        .await
        .unwrap();
    // Fully inside.
    let inside = engine
        .create_reservation_at(&owner, booking(sid, day + H, day + 2 * H, 1), NOW)
        .await
        .unwrap();
    // Spans the whole window: neither endpoint inside.
    let spanning_space = seeded_space(&engine, 10, 0).await;
    engine
        .create_reservation_at(&owner, booking(spanning_space, day - H, day + 5 * H, 1), NOW)
        .await
        .unwrap();
    // Canceled.
    let canceled = engine
        .create_reservation_at(&owner, booking(sid, day + 3 * H, day + 4 * H, 1), NOW)
        .await
        .unwrap();
    engine.cancel_reservation_at(&owner, canceled.id, NOW).await.unwrap();

    let window_end = day + 4 * H;
    let ids: Vec<Ulid> = engine
        .calendar(&admin(), day, window_end)
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.id)
        .collect();
    assert_eq!(ids, vec![ends_at_edge.id, inside.id]);

    assert!(matches!(
        engine.calendar(&owner, day, window_end).await,
        Err(EngineError::Forbidden(_))
    ));
}

#[tokio::test]
async fn availability_queries() {
    let engine = new_engine("availability_queries.wal");
    let sid = seeded_space(&engine, 10, 0).await;
    let day = NOW + DAY;
    let r = engine
        .create_reservation_at(&member(), booking(sid, day + 10 * H, day + 11 * H, 1), NOW)
        .await
        .unwrap();

    assert!(!engine.check_availability(sid, day + 10 * H, day + 11 * H, None).await.unwrap());
    assert!(engine
        .check_availability(sid, day + 10 * H, day + 11 * H, Some(r.id))
        .await
        .unwrap());
    assert!(engine.check_availability(sid, day + 11 * H, day + 12 * H, None).await.unwrap());
    assert!(matches!(
        engine.check_availability(sid, day + 12 * H, day + 11 * H, None).await,
        Err(EngineError::InvalidInterval)
    ));
    assert!(matches!(
        engine.check_availability(Ulid::new(), day, day + H, None).await,
        Err(EngineError::NotFound(_))
    ));

    let free = engine.free_slots(sid, day + 8 * H, day + 12 * H).await.unwrap();
    assert_eq!(
        free,
        vec![Span::new(day + 8 * H, day + 10 * H), Span::new(day + 11 * H, day + 12 * H)]
    );
}

// ── Users ───────────────────────────────────────────────

fn new_user(email: &str, password: &str) -> NewUser {
    NewUser {
        id: Ulid::new(),
        email: email.into(),
        first_name: "Ana".into(),
        last_name: "Lima".into(),
        password: password.into(),
    }
}

#[tokio::test]
async fn register_hashes_password_and_rejects_duplicate_email() {
    let engine = new_engine("register.wal");
    let user = engine.register_user(new_user("ana@example.com", "s3cret")).await.unwrap();
    assert_ne!(user.password_hash, "s3cret");
    assert!(engine.auth.verify("s3cret", &user.password_hash));
    assert_eq!(user.roles, BTreeSet::from([Role::User]));

    let dup = engine.register_user(new_user("ana@example.com", "other")).await;
    assert!(matches!(dup, Err(EngineError::EmailTaken(_))));

    // Case-sensitive key.
    engine.register_user(new_user("Ana@example.com", "other")).await.unwrap();

    assert!(matches!(
        engine.register_user(new_user("not-an-email", "x")).await,
        Err(EngineError::InvalidInput(_))
    ));
}

#[tokio::test]
async fn requester_resolved_from_session_user() {
    let engine = new_engine("requester_for.wal");
    let user = engine.register_user(new_user("bo@example.com", "pw")).await.unwrap();
    let req = engine.requester_for(Some(user.id));
    assert_eq!(req.user_id, Some(user.id));
    assert!(!req.is_admin());
    assert_eq!(engine.requester_for(None), Requester::anonymous());
    assert_eq!(engine.requester_for(Some(Ulid::new())), Requester::anonymous());
    assert!(matches!(
        engine.profile(&Requester::anonymous()),
        Err(EngineError::Forbidden(_))
    ));
    assert_eq!(engine.profile(&req).unwrap().email, "bo@example.com");
}

#[tokio::test]
async fn authenticate_checks_the_account_password() {
    let engine = new_engine("authenticate.wal");
    let root = engine.bootstrap_admin("root@example.com", "admin-pass").await.unwrap();

    let ok = engine.authenticate("root@example.com", "admin-pass").await.unwrap();
    assert_eq!(ok.map(|u| u.id), Some(root.id));
    assert!(matches!(
        engine.authenticate("root@example.com", "spacebook").await,
        Err(EngineError::WrongPassword)
    ));
    assert!(matches!(
        engine.authenticate("root@example.com", "").await,
        Err(EngineError::WrongPassword)
    ));
    assert!(engine.authenticate("ghost@example.com", "anything").await.unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_profile_patches_both_apply() {
    let engine = Arc::new(new_engine("profile_race.wal"));
    let user = engine.register_user(new_user("ed@example.com", "pw")).await.unwrap();
    let uid = user.id;

    for round in 0..20 {
        let me = Requester::for_user(&user);
        let first = format!("First{round}");
        let last = format!("Last{round}");
        let e1 = engine.clone();
        let r1 = me.clone();
        let f = first.clone();
        let a = tokio::spawn(async move {
            let patch = ProfilePatch {
                first_name: Some(f),
                ..Default::default()
            };
            e1.update_profile(&r1, uid, patch).await
        });
        let e2 = engine.clone();
        let l = last.clone();
        let b = tokio::spawn(async move {
            let patch = ProfilePatch {
                last_name: Some(l),
                ..Default::default()
            };
            e2.update_profile(&me, uid, patch).await
        });
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        let stored = engine.get_user(&uid).unwrap();
        assert_eq!(stored.first_name, first);
        assert_eq!(stored.last_name, last);
    }
}

#[tokio::test]
async fn password_change_requires_current_password() {
    let engine = new_engine("password_change.wal");
    let user = engine.register_user(new_user("cy@example.com", "old-pw")).await.unwrap();
    let me = Requester::for_user(&user);

    let wrong = ProfilePatch {
        new_password: Some("new-pw".into()),
        current_password: Some("guess".into()),
        ..Default::default()
    };
    assert!(matches!(
        engine.update_profile(&me, user.id, wrong).await,
        Err(EngineError::WrongPassword)
    ));

    let missing = ProfilePatch {
        new_password: Some("new-pw".into()),
        ..Default::default()
    };
    assert!(matches!(
        engine.update_profile(&me, user.id, missing).await,
        Err(EngineError::WrongPassword)
    ));

    let right = ProfilePatch {
        first_name: Some("Cyd".into()),
        new_password: Some("new-pw".into()),
        current_password: Some("old-pw".into()),
        ..Default::default()
    };
    let updated = engine.update_profile(&me, user.id, right).await.unwrap();
    assert_eq!(updated.first_name, "Cyd");
    assert!(engine.auth.verify("new-pw", &updated.password_hash));
    assert!(!engine.auth.verify("old-pw", &updated.password_hash));

    let someone_else = member();
    assert!(matches!(
        engine.update_profile(&someone_else, user.id, ProfilePatch::default()).await,
        Err(EngineError::Forbidden(_))
    ));
}

#[tokio::test]
async fn roles_managed_by_admins_only() {
    let engine = new_engine("roles.wal");
    let user = engine.register_user(new_user("di@example.com", "pw")).await.unwrap();
    let me = Requester::for_user(&user);

    assert!(matches!(
        engine.set_roles(&me, user.id, BTreeSet::from([Role::Admin])).await,
        Err(EngineError::Forbidden(_))
    ));
    assert!(matches!(
        engine.set_roles(&admin(), user.id, BTreeSet::new()).await,
        Err(EngineError::InvalidInput(_))
    ));
    let promoted = engine
        .set_roles(&admin(), user.id, BTreeSet::from([Role::Admin, Role::User]))
        .await
        .unwrap();
    assert!(promoted.is_admin());
    assert!(engine.requester_for(Some(user.id)).is_admin());
}

#[tokio::test]
async fn bootstrap_admin_is_idempotent() {
    let engine = new_engine("bootstrap_admin.wal");
    let first = engine.bootstrap_admin("root@example.com", "pw").await.unwrap();
    assert!(first.is_admin());
    let second = engine.bootstrap_admin("root@example.com", "pw").await.unwrap();
    assert_eq!(first.id, second.id);
    assert_eq!(engine.users.len(), 1);

    // Existing plain user is promoted in place.
    let plain = engine.register_user(new_user("ed@example.com", "pw")).await.unwrap();
    let promoted = engine.bootstrap_admin("ed@example.com", "ignored").await.unwrap();
    assert_eq!(promoted.id, plain.id);
    assert!(promoted.is_admin());
    assert_eq!(promoted.password_hash, plain.password_hash);
}

// ── Persistence ─────────────────────────────────────────

#[tokio::test]
async fn replay_restores_catalog_users_and_lifecycle() {
    let path = test_wal_path("replay_full.wal");
    let owner_id;
    let (kept, gone, disabled) = (space("Kept", 10, 2_500), space("Gone", 2, 0), space("Disabled", 2, 0));
    let (approved_id, canceled_id);
    {
        let engine = Engine::new(path.clone(), cheap_auth()).unwrap();
        let a = admin();
        let user = engine.register_user(new_user("fa@example.com", "pw")).await.unwrap();
        owner_id = user.id;
        let owner = Requester::for_user(&user);

        engine.create_space(&a, kept.clone()).await.unwrap();
        engine.create_space(&a, gone.clone()).await.unwrap();
        engine.create_space(&a, disabled.clone()).await.unwrap();

        let r1 = engine
            .create_reservation_at(&owner, booking(kept.id, NOW + DAY, NOW + DAY + H, 4), NOW)
            .await
            .unwrap();
        engine
            .update_reservation_at(&owner, r1.id, notes_patch("coffee please"), NOW)
            .await
            .unwrap();
        engine
            .update_reservation_at(&a, r1.id, status_patch("approved"), NOW + M)
            .await
            .unwrap();
        approved_id = r1.id;

        let r2 = engine
            .create_reservation_at(&owner, booking(disabled.id, NOW + DAY, NOW + DAY + H, 1), NOW)
            .await
            .unwrap();
        engine.cancel_reservation_at(&owner, r2.id, NOW + M).await.unwrap();
        canceled_id = r2.id;

        engine.delete_space(&a, gone.id).await.unwrap();
        engine.delete_space(&a, disabled.id).await.unwrap();
    }

    let engine = Engine::new(path, cheap_auth()).unwrap();
    let a = admin();
    assert!(engine.get_space_state(&gone.id).is_none());
    assert!(!engine.get_space(&a, disabled.id).await.unwrap().is_active);
    assert_eq!(engine.get_space(&a, kept.id).await.unwrap(), kept);

    let user = engine.user_by_email("fa@example.com").unwrap();
    assert_eq!(user.id, owner_id);
    assert!(engine.auth.verify("pw", &user.password_hash));

    let r1 = engine.get_reservation(&a, approved_id).await.unwrap();
    assert_eq!(r1.status, ReservationStatus::Approved);
    assert_eq!(r1.notes.as_deref(), Some("coffee please"));
    assert_eq!(r1.updated_at, Some(NOW + M));
    assert_eq!(r1.total_price, Money::from_cents(2_500));

    let r2 = engine.get_reservation(&a, canceled_id).await.unwrap();
    assert_eq!(r2.status, ReservationStatus::Canceled);

    // The approved booking still blocks after restart.
    let owner = Requester::for_user(&user);
    let clash = engine
        .create_reservation_at(&owner, booking(kept.id, NOW + DAY, NOW + DAY + H, 1), NOW)
        .await;
    assert!(matches!(clash, Err(EngineError::Conflict(_))));
}

#[tokio::test]
async fn compact_wal_survives_restart() {
    let path = test_wal_path("compact_restart.wal");
    let sp = space("Hall", 20, 1_000);
    let (kept_id, canceled_id);
    {
        let engine = Engine::new(path.clone(), cheap_auth()).unwrap();
        let a = admin();
        engine.create_space(&a, sp.clone()).await.unwrap();
        let user = engine.register_user(new_user("gi@example.com", "pw")).await.unwrap();
        let owner = Requester::for_user(&user);

        // Churn
        for i in 0..10 {
            let patch = SpacePatch {
                description: Some(format!("rev {i}")),
                ..Default::default()
            };
            engine.update_space(&a, sp.id, patch).await.unwrap();
        }
        let r = engine
            .create_reservation_at(&owner, booking(sp.id, NOW + DAY, NOW + DAY + H, 2), NOW)
            .await
            .unwrap();
        engine.cancel_reservation_at(&owner, r.id, NOW).await.unwrap();
        canceled_id = r.id;

        engine.compact_wal().await.unwrap();

        // Append new event after compaction
        let kept = engine
            .create_reservation_at(&owner, booking(sp.id, NOW + 2 * DAY, NOW + 2 * DAY + H, 2), NOW)
            .await
            .unwrap();
        kept_id = kept.id;
    }

    let engine = Engine::new(path, cheap_auth()).unwrap();
    let a = admin();
    let hall = engine.get_space(&a, sp.id).await.unwrap();
    assert_eq!(hall.description, "rev 9");
    assert_eq!(engine.users.len(), 1);
    assert_eq!(
        engine.get_reservation(&a, canceled_id).await.unwrap().status,
        ReservationStatus::Canceled
    );
    assert_eq!(
        engine.get_reservation(&a, kept_id).await.unwrap().status,
        ReservationStatus::Pending
    );
    assert_eq!(engine.list_reservations(&a).await.len(), 2);
}

#[tokio::test]
async fn group_commit_batches_appends() {
    let path = test_wal_path("group_commit_batch.wal");
    let engine = Arc::new(Engine::new(path.clone(), cheap_auth()).unwrap());

    let n = 20;
    let mut handles = Vec::new();
    for i in 0..n {
        let eng = engine.clone();
        handles.push(tokio::spawn(async move {
            eng.create_space(&admin(), space(&format!("Room {i:02}"), 1, 0)).await
        }));
    }
    for h in handles {
        h.await.unwrap().unwrap();
    }
    assert_eq!(engine.list_spaces(&admin()).await.len(), n);

    let engine2 = Engine::new(path, cheap_auth()).unwrap();
    assert_eq!(engine2.list_spaces(&admin()).await.len(), n);
}

#[tokio::test]
async fn appends_counter_resets_on_compaction() {
    let engine = new_engine("appends_counter.wal");
    assert_eq!(engine.wal_appends_since_compact().await, 0);

    let sid = seeded_space(&engine, 4, 0).await;
    let owner = member();
    let r = engine
        .create_reservation_at(&owner, booking(sid, NOW + DAY, NOW + DAY + H, 1), NOW)
        .await
        .unwrap();
    engine.cancel_reservation_at(&owner, r.id, NOW).await.unwrap();
    assert_eq!(engine.wal_appends_since_compact().await, 3);

    // Rejected requests never reach the log.
    let _ = engine
        .create_reservation_at(&owner, booking(sid, NOW + DAY, NOW + DAY + H, 99), NOW)
        .await;
    assert_eq!(engine.wal_appends_since_compact().await, 3);

    engine.compact_wal().await.unwrap();
    assert_eq!(engine.wal_appends_since_compact().await, 0);
}
