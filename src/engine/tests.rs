use super::*;
use super::conflict::validate_span;
use crate::limits::*;

const H: Ms = 3_600_000; // 1 hour in ms
/// 2030-01-01T00:00:00Z
const DAY0: Ms = 1_893_456_000_000;

fn at(hour: Ms) -> Ms {
    DAY0 + hour * H
}

fn spec(name: &str) -> RoomSpec {
    RoomSpec {
        name: name.into(),
        capacity: 6,
        location: Some("3F east".into()),
        equipment: Some("projector".into()),
        description: None,
    }
}

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("roombook_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

async fn seeded(name: &str) -> Engine {
    let engine = Engine::new(test_wal_path(name)).unwrap();
    engine.seed_reference_data().await.unwrap();
    engine
}

async fn user(engine: &Engine, username: &str) -> Account {
    engine
        .register_account(username, "hash".into(), &format!("{username}@example.com"), false)
        .await
        .unwrap()
}

async fn room(engine: &Engine, name: &str) -> Ulid {
    let id = Ulid::new();
    engine.create_room(id, spec(name)).await.unwrap();
    id
}

// ── Conflict resolver ────────────────────────────────────

#[test]
fn validate_span_rejects_inverted_and_empty() {
    assert!(matches!(validate_span(at(10), at(9)), Err(EngineError::Invalid(_))));
    assert!(matches!(validate_span(at(10), at(10)), Err(EngineError::Invalid(_))));
    assert!(validate_span(at(9), at(10)).is_ok());
}

#[test]
fn validate_span_rejects_out_of_range() {
    assert!(matches!(
        validate_span(0, 1000),
        Err(EngineError::LimitExceeded(_))
    ));
    assert!(matches!(
        validate_span(at(0), at(0) + MAX_SPAN_DURATION_MS + 1),
        Err(EngineError::LimitExceeded(_))
    ));
}

#[test]
fn admit_considers_only_active_bookings() {
    let mut rs = RoomState::new(Ulid::new(), spec("Pine"));
    for status in [BookingStatus::Rejected, BookingStatus::Released] {
        rs.insert_booking(Booking {
            id: Ulid::new(),
            room_id: rs.id,
            account_id: Ulid::new(),
            span: Span::new(at(9), at(10)),
            status,
            note: None,
            created_at: 0,
        });
    }
    assert!(admit(&rs, &Span::new(at(9), at(10)), None).is_ok());

    for status in [BookingStatus::Requested, BookingStatus::Approved] {
        let mut rs = rs.clone();
        let id = Ulid::new();
        rs.insert_booking(Booking {
            id,
            room_id: rs.id,
            account_id: Ulid::new(),
            span: Span::new(at(9), at(10)),
            status,
            note: None,
            created_at: 0,
        });
        match admit(&rs, &Span::new(at(9) + 1, at(9) + 2), None) {
            Err(EngineError::Conflict(existing)) => assert_eq!(existing, id),
            other => panic!("expected conflict for {status}, got {other:?}"),
        }
        assert!(admit(&rs, &Span::new(at(9), at(10)), Some(id)).is_ok());
    }
}

// ── Async engine tests ───────────────────────────────────

#[tokio::test]
async fn seed_is_idempotent() {
    let engine = seeded("seed_idempotent.wal").await;
    engine.seed_reference_data().await.unwrap();
    assert_eq!(engine.permissions.len(), PERMISSIONS.len());
    assert_eq!(engine.roles.len(), 2);

    let admin_role = *engine.role_names.get(ROLE_ADMIN).unwrap().value();
    assert_eq!(
        engine.roles.get(&admin_role).unwrap().permission_ids.len(),
        PERMISSIONS.len()
    );
}

#[tokio::test]
async fn back_to_back_bookings_both_admit() {
    let engine = seeded("back_to_back.wal").await;
    let alice = user(&engine, "alice").await;
    let rid = room(&engine, "Aurora").await;

    engine
        .request_booking(Ulid::new(), rid, alice.id, at(9), at(10), None)
        .await
        .unwrap();
    engine
        .request_booking(Ulid::new(), rid, alice.id, at(10), at(11), None)
        .await
        .unwrap();

    let page = engine
        .list_bookings(&BookingFilter { room_id: Some(rid), ..Default::default() }, Pagination::default())
        .await;
    assert_eq!(page.total, 2);
    assert_eq!(page.items[0].start, at(9));
    assert_eq!(page.items[1].start, at(10));
}

#[tokio::test]
async fn overlapping_booking_conflicts() {
    let engine = seeded("overlap_conflict.wal").await;
    let alice = user(&engine, "alice").await;
    let rid = room(&engine, "Aurora").await;

    let first = engine
        .request_booking(Ulid::new(), rid, alice.id, at(9), at(10), None)
        .await
        .unwrap();
    let err = engine
        .request_booking(Ulid::new(), rid, alice.id, at(9) + H / 2, at(10) + H / 2, None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Conflict(id) if id == first.id));
}

#[tokio::test]
async fn same_span_on_other_room_is_fine() {
    let engine = seeded("other_room.wal").await;
    let alice = user(&engine, "alice").await;
    let a = room(&engine, "Aurora").await;
    let b = room(&engine, "Borealis").await;

    engine.request_booking(Ulid::new(), a, alice.id, at(9), at(10), None).await.unwrap();
    engine.request_booking(Ulid::new(), b, alice.id, at(9), at(10), None).await.unwrap();
}

#[tokio::test]
async fn released_and_rejected_free_the_slot() {
    let engine = seeded("release_frees.wal").await;
    let alice = user(&engine, "alice").await;
    let rid = room(&engine, "Aurora").await;

    for status in [BookingStatus::Released, BookingStatus::Rejected] {
        let b = engine
            .request_booking(Ulid::new(), rid, alice.id, at(9), at(10), None)
            .await
            .unwrap();
        let updated = engine.set_booking_status(b.id, status).await.unwrap();
        assert_eq!(updated.status, status);
    }
    engine
        .request_booking(Ulid::new(), rid, alice.id, at(9), at(10), None)
        .await
        .unwrap();
}

#[tokio::test]
async fn approve_does_not_recheck_conflicts() {
    let engine = seeded("approve_loose.wal").await;
    let alice = user(&engine, "alice").await;
    let rid = room(&engine, "Aurora").await;

    let released = engine
        .request_booking(Ulid::new(), rid, alice.id, at(9), at(10), None)
        .await
        .unwrap();
    engine.set_booking_status(released.id, BookingStatus::Released).await.unwrap();
    engine
        .request_booking(Ulid::new(), rid, alice.id, at(9), at(10), None)
        .await
        .unwrap();

    let revived = engine
        .set_booking_status(released.id, BookingStatus::Approved)
        .await
        .unwrap();
    assert_eq!(revived.status, BookingStatus::Approved);
}

#[tokio::test]
async fn reschedule_excludes_itself() {
    let engine = seeded("reschedule_self.wal").await;
    let alice = user(&engine, "alice").await;
    let rid = room(&engine, "Aurora").await;

    let b = engine
        .request_booking(Ulid::new(), rid, alice.id, at(9), at(11), None)
        .await
        .unwrap();
    let moved = engine.reschedule_booking(b.id, at(10), at(12)).await.unwrap();
    assert_eq!(moved.span, Span::new(at(10), at(12)));

    let other = engine
        .request_booking(Ulid::new(), rid, alice.id, at(13), at(14), None)
        .await
        .unwrap();
    let err = engine.reschedule_booking(b.id, at(11), at(14)).await.unwrap_err();
    assert!(matches!(err, EngineError::Conflict(id) if id == other.id));

    let info = engine.booking(b.id).await.unwrap();
    assert_eq!((info.start, info.end), (at(10), at(12)));
}

#[tokio::test]
async fn reschedule_inactive_is_invalid() {
    let engine = seeded("reschedule_inactive.wal").await;
    let alice = user(&engine, "alice").await;
    let rid = room(&engine, "Aurora").await;

    let b = engine
        .request_booking(Ulid::new(), rid, alice.id, at(9), at(10), None)
        .await
        .unwrap();
    engine.set_booking_status(b.id, BookingStatus::Rejected).await.unwrap();
    assert!(matches!(
        engine.reschedule_booking(b.id, at(11), at(12)).await,
        Err(EngineError::Invalid(_))
    ));
}

#[tokio::test]
async fn validation_order_span_before_room() {
    let engine = seeded("validation_order.wal").await;
    let err = engine
        .request_booking(Ulid::new(), Ulid::new(), Ulid::new(), at(10), at(9), None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Invalid(_)));

    let err = engine
        .request_booking(Ulid::new(), Ulid::new(), Ulid::new(), at(9), at(10), None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::RoomNotFound(_)));

    let rid = room(&engine, "Aurora").await;
    let err = engine
        .request_booking(Ulid::new(), rid, Ulid::new(), at(9), at(10), None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::AccountNotFound(_)));
}

#[tokio::test]
async fn frozen_account_cannot_book() {
    let engine = seeded("frozen_books.wal").await;
    let alice = user(&engine, "alice").await;
    let rid = room(&engine, "Aurora").await;

    let frozen = engine.set_account_frozen(alice.id, true).await.unwrap();
    assert!(frozen.is_frozen);
    assert!(matches!(
        engine.request_booking(Ulid::new(), rid, alice.id, at(9), at(10), None).await,
        Err(EngineError::AccountFrozen(_))
    ));
}

#[tokio::test]
async fn duplicate_booking_id_rejected() {
    let engine = seeded("dup_booking_id.wal").await;
    let alice = user(&engine, "alice").await;
    let rid = room(&engine, "Aurora").await;
    let id = Ulid::new();

    engine.request_booking(id, rid, alice.id, at(9), at(10), None).await.unwrap();
    assert!(matches!(
        engine.request_booking(id, rid, alice.id, at(12), at(13), None).await,
        Err(EngineError::AlreadyExists(_))
    ));
}

#[tokio::test]
async fn concurrent_overlapping_requests_admit_exactly_one() {
    let engine = Arc::new(seeded("concurrent_overlap.wal").await);
    let alice = user(&engine, "alice").await;
    let rid = room(&engine, "Aurora").await;

    let mut handles = Vec::new();
    for i in 0..16 {
        let engine = engine.clone();
        let account = alice.id;
        handles.push(tokio::spawn(async move {
            let offset = (i % 4) * 60_000;
            engine
                .request_booking(Ulid::new(), rid, account, at(9) + offset, at(10) + offset, None)
                .await
        }));
    }
    let mut admitted = 0;
    let mut conflicts = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => admitted += 1,
            Err(EngineError::Conflict(_)) => conflicts += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(admitted, 1);
    assert_eq!(conflicts, 15);
}

#[tokio::test]
async fn duplicate_names_conflict() {
    let engine = seeded("dup_names.wal").await;
    user(&engine, "alice").await;
    assert!(matches!(
        engine.register_account("alice", "h".into(), "a2@example.com", false).await,
        Err(EngineError::AlreadyExists(_))
    ));

    let a = room(&engine, "Aurora").await;
    let b = room(&engine, "Borealis").await;
    assert!(matches!(
        engine.create_room(Ulid::new(), spec("Aurora")).await,
        Err(EngineError::AlreadyExists(_))
    ));
    assert!(matches!(
        engine.patch_room(b, spec("Aurora").into()).await,
        Err(EngineError::AlreadyExists(_))
    ));

    // Renaming frees the old name.
    engine.patch_room(a, spec("Cassiopeia").into()).await.unwrap();
    room(&engine, "Aurora").await;
}

#[tokio::test]
async fn room_spec_validation() {
    let engine = seeded("room_validation.wal").await;
    let mut zero = spec("Zero");
    zero.capacity = 0;
    assert!(matches!(
        engine.create_room(Ulid::new(), zero).await,
        Err(EngineError::Invalid(_))
    ));
    assert!(matches!(
        engine.create_room(Ulid::new(), spec("  ")).await,
        Err(EngineError::Invalid(_))
    ));
    assert!(matches!(
        engine.create_room(Ulid::new(), spec(&"x".repeat(MAX_NAME_LEN + 1))).await,
        Err(EngineError::LimitExceeded(_))
    ));
}

#[tokio::test]
async fn delete_room_cascades_bookings() {
    let engine = seeded("delete_cascade.wal").await;
    let alice = user(&engine, "alice").await;
    let rid = room(&engine, "Aurora").await;
    let b = engine
        .request_booking(Ulid::new(), rid, alice.id, at(9), at(10), None)
        .await
        .unwrap();

    assert_eq!(engine.delete_room(rid).await.unwrap(), 1);
    assert!(engine.get_room(&rid).is_none());
    assert!(engine.booking(b.id).await.is_none());
    assert!(matches!(
        engine.set_booking_status(b.id, BookingStatus::Approved).await,
        Err(EngineError::BookingNotFound(_))
    ));
    // Name is reusable.
    room(&engine, "Aurora").await;
}

#[tokio::test]
async fn availability_subtracts_active_bookings() {
    let engine = seeded("availability.wal").await;
    let alice = user(&engine, "alice").await;
    let rid = room(&engine, "Aurora").await;
    engine.request_booking(Ulid::new(), rid, alice.id, at(9), at(10), None).await.unwrap();
    let rejected = engine
        .request_booking(Ulid::new(), rid, alice.id, at(12), at(13), None)
        .await
        .unwrap();
    engine.set_booking_status(rejected.id, BookingStatus::Rejected).await.unwrap();

    let free = engine.availability(rid, at(8), at(14)).await.unwrap();
    assert_eq!(free, vec![Span::new(at(8), at(9)), Span::new(at(10), at(14))]);

    assert!(matches!(
        engine.availability(Ulid::new(), at(8), at(14)).await,
        Err(EngineError::RoomNotFound(_))
    ));
    assert!(matches!(
        engine.availability(rid, at(14), at(8)).await,
        Err(EngineError::Invalid(_))
    ));
}

#[tokio::test]
async fn identity_flattens_roles() {
    let engine = seeded("identity.wal").await;
    let alice = user(&engine, "alice").await;
    let plain = engine.resolve_identity(&alice);
    assert_eq!(plain.roles, vec![ROLE_USER.to_string()]);
    assert!(plain.permissions.is_empty());

    assert!(engine.grant_role(alice.id, ROLE_ADMIN).await.unwrap());
    assert!(!engine.grant_role(alice.id, ROLE_ADMIN).await.unwrap());
    let alice = engine.account(&alice.id).unwrap();
    let elevated = engine.resolve_identity(&alice);
    assert_eq!(elevated.roles, vec![ROLE_USER.to_string(), ROLE_ADMIN.to_string()]);
    let names: Vec<&str> = elevated.permissions.iter().map(|p| p.name.as_str()).collect();
    assert_eq!(names, vec![PERM_ROOM_MANAGE, PERM_BOOKING_REVIEW, PERM_ACCOUNT_MANAGE]);
    // Role grants don't flip the account-level admin flag.
    assert!(!elevated.is_admin);

    assert!(matches!(
        engine.grant_role(alice.id, "janitor").await,
        Err(EngineError::RoleNotFound(_))
    ));
}

#[tokio::test]
async fn admin_email_picks_active_admin() {
    let engine = seeded("admin_email.wal").await;
    assert_eq!(engine.admin_email(), None);
    user(&engine, "alice").await;
    let root = engine
        .register_account("root", "h".into(), "root@example.com", true)
        .await
        .unwrap();
    assert_eq!(engine.admin_email().as_deref(), Some("root@example.com"));
    engine.set_account_frozen(root.id, true).await.unwrap();
    assert_eq!(engine.admin_email(), None);
}

#[tokio::test]
async fn listing_filters_and_pages() {
    let engine = seeded("listing.wal").await;
    let alice = user(&engine, "alice").await;
    let bob = user(&engine, "bob").await;
    let aurora = room(&engine, "Aurora").await;
    let birch = Ulid::new();
    engine
        .create_room(birch, RoomSpec { location: Some("Annex 2F".into()), ..spec("Birch") })
        .await
        .unwrap();

    engine.request_booking(Ulid::new(), aurora, alice.id, at(9), at(10), None).await.unwrap();
    engine.request_booking(Ulid::new(), aurora, bob.id, at(10), at(11), None).await.unwrap();
    let b = engine
        .request_booking(Ulid::new(), birch, bob.id, at(8), at(9), Some("standup".into()))
        .await
        .unwrap();
    engine.set_booking_status(b.id, BookingStatus::Approved).await.unwrap();

    let by_user = engine
        .list_bookings(
            &BookingFilter { username: Some("BO".into()), ..Default::default() },
            Pagination::default(),
        )
        .await;
    assert_eq!(by_user.total, 2);
    assert_eq!(by_user.items[0].room_name, "Birch");
    assert_eq!(by_user.items[0].note.as_deref(), Some("standup"));

    let approved = engine
        .list_bookings(
            &BookingFilter { status: Some(BookingStatus::Approved), ..Default::default() },
            Pagination::default(),
        )
        .await;
    assert_eq!(approved.items.len(), 1);

    let window = engine
        .list_bookings(
            &BookingFilter { start_from: Some(at(9)), start_to: Some(at(9)), ..Default::default() },
            Pagination::default(),
        )
        .await;
    assert_eq!(window.items.len(), 1);
    assert_eq!(window.items[0].username, "alice");

    let by_room_name = engine
        .list_bookings(
            &BookingFilter { room_name: Some("auR".into()), ..Default::default() },
            Pagination::default(),
        )
        .await;
    assert_eq!(by_room_name.total, 2);
    assert!(by_room_name.items.iter().all(|b| b.room_id == aurora));

    let by_location = engine
        .list_bookings(
            &BookingFilter { location: Some("annex".into()), ..Default::default() },
            Pagination::default(),
        )
        .await;
    assert_eq!(by_location.total, 1);
    assert_eq!(by_location.items[0].id, b.id);

    let no_match = engine
        .list_bookings(
            &BookingFilter { room_name: Some("aurora".into()), location: Some("annex".into()), ..Default::default() },
            Pagination::default(),
        )
        .await;
    assert_eq!(no_match.total, 0);

    let second_page = engine
        .list_bookings(&BookingFilter::default(), Pagination { page_no: 2, page_size: 2 })
        .await;
    assert_eq!(second_page.total, 3);
    assert_eq!(second_page.items.len(), 1);

    let rooms = engine.list_rooms(Some("bir"), None, Pagination::default()).await;
    assert_eq!(rooms.total, 1);
    assert_eq!(rooms.items[0].id, birch);
    assert!(!rooms.items[0].is_booked);

    let accounts = engine.list_accounts(Some("ali"), Pagination::default());
    assert_eq!(accounts.total, 1);
    assert_eq!(accounts.items[0].roles, vec![ROLE_USER.to_string()]);
}

#[tokio::test]
async fn replay_restores_state() {
    let path = test_wal_path("replay_restores.wal");
    let (alice_id, rid, bid) = {
        let engine = Engine::new(path.clone()).unwrap();
        engine.seed_reference_data().await.unwrap();
        let alice = user(&engine, "alice").await;
        engine.set_account_frozen(alice.id, true).await.unwrap();
        engine.set_account_frozen(alice.id, false).await.unwrap();
        let rid = room(&engine, "Aurora").await;
        engine.patch_room(rid, spec("Aurora II").into()).await.unwrap();
        let b = engine
            .request_booking(Ulid::new(), rid, alice.id, at(9), at(10), None)
            .await
            .unwrap();
        engine.reschedule_booking(b.id, at(11), at(12)).await.unwrap();
        engine.set_booking_status(b.id, BookingStatus::Approved).await.unwrap();
        let gone = room(&engine, "Gone").await;
        engine.delete_room(gone).await.unwrap();
        (alice.id, rid, b.id)
    };

    let engine = Engine::new(path).unwrap();
    let alice = engine.account_by_username("alice").unwrap();
    assert_eq!(alice.id, alice_id);
    assert!(!alice.is_frozen);
    assert_eq!(engine.rooms.len(), 1);
    assert_eq!(*engine.room_names.get("Aurora II").unwrap().value(), rid);
    assert!(engine.room_names.get("Aurora").is_none());

    let b = engine.booking(bid).await.unwrap();
    assert_eq!((b.start, b.end), (at(11), at(12)));
    assert_eq!(b.status, BookingStatus::Approved);
    assert_eq!(b.username, "alice");

    // Seeding again after replay defines nothing new.
    engine.seed_reference_data().await.unwrap();
    assert_eq!(engine.roles.len(), 2);
}

#[tokio::test]
async fn compaction_preserves_state() {
    let path = test_wal_path("compaction.wal");
    let bid = {
        let engine = Engine::new(path.clone()).unwrap();
        engine.seed_reference_data().await.unwrap();
        let alice = user(&engine, "alice").await;
        let rid = room(&engine, "Aurora").await;
        let b = engine
            .request_booking(Ulid::new(), rid, alice.id, at(9), at(10), None)
            .await
            .unwrap();
        for _ in 0..5 {
            engine.set_booking_status(b.id, BookingStatus::Approved).await.unwrap();
            engine.set_booking_status(b.id, BookingStatus::Requested).await.unwrap();
        }
        assert!(engine.wal_appends_since_compact().await > 10);
        engine.compact_wal().await.unwrap();
        assert_eq!(engine.wal_appends_since_compact().await, 0);
        b.id
    };

    let engine = Engine::new(path).unwrap();
    let b = engine.booking(bid).await.unwrap();
    assert_eq!(b.status, BookingStatus::Requested);
    assert_eq!(engine.permissions.len(), PERMISSIONS.len());
    assert!(engine.account_by_username("alice").is_some());
}
