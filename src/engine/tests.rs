use std::path::PathBuf;

use super::*;
use crate::limits::*;

const H: Ms = 3_600_000; // 1 hour in ms
const M: Ms = 60_000; // 1 minute in ms
/// 2026-03-02T00:00:00Z, a Monday.
const DAY0: Ms = 1_772_409_600_000;

fn test_journal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("slotbook_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    let _ = std::fs::remove_file(path.with_extension("journal.compact"));
    path
}

fn at(hours: Ms) -> Ms {
    DAY0 + hours * H
}

fn occurrences(schedule_id: Ulid, spans: &[(Ms, Ms)]) -> Vec<ScheduleOccurrences> {
    vec![ScheduleOccurrences {
        schedule_id,
        spans: spans.iter().map(|&(s, e)| Span::new(s, e)).collect(),
    }]
}

fn day_window() -> Span {
    Span::new(DAY0, DAY0 + 24 * H)
}

async fn engine_with_slots(name: &str, spans: &[(Ms, Ms)]) -> (Engine, Ulid, Vec<TimeSlot>) {
    let engine = Engine::open(&test_journal_path(name)).unwrap();
    let provider = Ulid::new();
    engine
        .materialize_slots(provider, None, day_window(), occurrences(Ulid::new(), spans))
        .await
        .unwrap();
    let slots = engine
        .list_provider_slots(provider, day_window(), MAX_PAGE_SIZE, 0)
        .await
        .unwrap()
        .slots;
    (engine, provider, slots)
}

// ── Materialization ──────────────────────────────────────

#[tokio::test]
async fn materialize_creates_planned_slots_in_order() {
    let engine = Engine::open(&test_journal_path("materialize_order.journal")).unwrap();
    let provider = Ulid::new();
    let service = Ulid::new();
    let schedule = Ulid::new();

    let created = engine
        .materialize_slots(
            provider,
            Some(service),
            day_window(),
            occurrences(schedule, &[(at(11), at(12)), (at(9), at(10)), (at(10), at(11))]),
        )
        .await
        .unwrap();
    assert_eq!(created, 3);

    let page = engine
        .list_provider_slots(provider, day_window(), 10, 0)
        .await
        .unwrap();
    assert_eq!(page.total, 3);
    let starts: Vec<Ms> = page.slots.iter().map(|s| s.span.start).collect();
    assert_eq!(starts, vec![at(9), at(10), at(11)]);
    assert!(page.slots.iter().all(|s| s.status == SlotStatus::Planned));
    assert!(page.slots.iter().all(|s| s.schedule_id == Some(schedule)));
    assert!(page.slots.iter().all(|s| s.service_id == Some(service)));
}

#[tokio::test]
async fn materialize_is_idempotent() {
    let engine = Engine::open(&test_journal_path("materialize_idem.journal")).unwrap();
    let provider = Ulid::new();
    let schedule = Ulid::new();
    let spans = [(at(9), at(10)), (at(10), at(11))];

    let first = engine
        .materialize_slots(provider, None, day_window(), occurrences(schedule, &spans))
        .await
        .unwrap();
    let second = engine
        .materialize_slots(provider, None, day_window(), occurrences(schedule, &spans))
        .await
        .unwrap();
    assert_eq!(first, 2);
    assert_eq!(second, 0);

    // Duplicates inside one request collapse as well.
    let dup = engine
        .materialize_slots(
            provider,
            None,
            day_window(),
            occurrences(schedule, &[(at(12), at(13)), (at(12), at(13))]),
        )
        .await
        .unwrap();
    assert_eq!(dup, 1);
    assert_eq!(engine.stats().await.slots, 3);
}

#[tokio::test]
async fn materialize_skips_cancelled_and_booked_matches() {
    let (engine, provider, slots) =
        engine_with_slots("materialize_status.journal", &[(at(9), at(10)), (at(10), at(11))]).await;
    engine.cancel_slot(slots[0].id).await.unwrap();
    engine
        .create_booking(Ulid::new(), slots[1].id, String::new())
        .await
        .unwrap();

    let created = engine
        .materialize_slots(
            provider,
            None,
            day_window(),
            occurrences(Ulid::new(), &[(at(9), at(10)), (at(10), at(11))]),
        )
        .await
        .unwrap();
    assert_eq!(created, 0);
}

#[tokio::test]
async fn materialize_keys_on_service() {
    let engine = Engine::open(&test_journal_path("materialize_service.journal")).unwrap();
    let provider = Ulid::new();
    let spans = [(at(9), at(10))];
    for service in [None, Some(Ulid::new()), Some(Ulid::new())] {
        let n = engine
            .materialize_slots(provider, service, day_window(), occurrences(Ulid::new(), &spans))
            .await
            .unwrap();
        assert_eq!(n, 1);
    }
    assert_eq!(engine.stats().await.slots, 3);
}

#[tokio::test]
async fn materialize_empty_is_noop() {
    let engine = Engine::open(&test_journal_path("materialize_empty.journal")).unwrap();
    let n = engine
        .materialize_slots(Ulid::new(), None, day_window(), Vec::new())
        .await
        .unwrap();
    assert_eq!(n, 0);
    assert_eq!(engine.journal_appends_since_compact().await, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_materialize_never_duplicates() {
    let engine = Arc::new(Engine::open(&test_journal_path("materialize_concurrent.journal")).unwrap());
    let provider = Ulid::new();
    let spans: Vec<(Ms, Ms)> = (0..12).map(|h| (at(h), at(h) + 30 * M)).collect();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let engine = engine.clone();
        let spans = spans.clone();
        handles.push(tokio::spawn(async move {
            engine
                .materialize_slots(provider, None, day_window(), occurrences(Ulid::new(), &spans))
                .await
                .unwrap()
        }));
    }
    let mut total = 0;
    for h in handles {
        total += h.await.unwrap();
    }
    assert_eq!(total, 12);
    assert_eq!(engine.stats().await.slots, 12);
}

#[tokio::test]
async fn materialize_rejects_bad_spans() {
    let engine = Engine::open(&test_journal_path("materialize_bad.journal")).unwrap();
    let err = engine
        .materialize_slots(
            Ulid::new(),
            None,
            day_window(),
            occurrences(Ulid::new(), &[(at(0), at(0) + 8 * 24 * H)]),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::LimitExceeded("slot too long")));
}

// ── Booking ──────────────────────────────────────────────

#[tokio::test]
async fn booking_marks_slot_booked() {
    let (engine, _, slots) = engine_with_slots("book_basic.journal", &[(at(9), at(10))]).await;
    let client = Ulid::new();

    let detail = engine
        .create_booking(client, slots[0].id, "first visit".into())
        .await
        .unwrap();
    assert_eq!(detail.booking.status, BookingStatus::Confirmed);
    assert_eq!(detail.booking.client_id, client);
    assert_eq!(detail.booking.comment, "first visit");
    assert_eq!(detail.slot.status, SlotStatus::Booked);

    let stored = engine.get_slot(slots[0].id).await.unwrap();
    assert_eq!(stored.status, SlotStatus::Booked);
    let fetched = engine.get_booking(detail.booking.id).await.unwrap();
    assert_eq!(fetched.booking, detail.booking);
}

#[tokio::test]
async fn booking_taken_slot_fails() {
    let (engine, _, slots) = engine_with_slots("book_taken.journal", &[(at(9), at(10))]).await;
    engine
        .create_booking(Ulid::new(), slots[0].id, String::new())
        .await
        .unwrap();
    let err = engine
        .create_booking(Ulid::new(), slots[0].id, String::new())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::SlotNotFree(id) if id == slots[0].id));
    assert_eq!(err.to_string(), "slot is not free");
}

#[tokio::test]
async fn booking_unknown_slot_is_not_found() {
    let engine = Engine::open(&test_journal_path("book_unknown.journal")).unwrap();
    let err = engine
        .create_booking(Ulid::new(), Ulid::new(), String::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn booking_cancelled_slot_fails() {
    let (engine, _, slots) = engine_with_slots("book_cancelled_slot.journal", &[(at(9), at(10))]).await;
    engine.cancel_slot(slots[0].id).await.unwrap();
    let err = engine
        .create_booking(Ulid::new(), slots[0].id, String::new())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::SlotNotFree(_)));
}

#[tokio::test]
async fn booking_comment_too_long() {
    let (engine, _, slots) = engine_with_slots("book_comment.journal", &[(at(9), at(10))]).await;
    let err = engine
        .create_booking(Ulid::new(), slots[0].id, "x".repeat(MAX_COMMENT_LEN + 1))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::LimitExceeded(_)));
}

#[tokio::test]
async fn client_overlap_across_providers() {
    let engine = Engine::open(&test_journal_path("book_client_overlap.journal")).unwrap();
    let (p1, p2) = (Ulid::new(), Ulid::new());
    engine
        .materialize_slots(p1, None, day_window(), occurrences(Ulid::new(), &[(at(10), at(11))]))
        .await
        .unwrap();
    engine
        .materialize_slots(
            p2,
            None,
            day_window(),
            occurrences(Ulid::new(), &[(at(10) + 30 * M, at(11) + 30 * M), (at(11), at(12))]),
        )
        .await
        .unwrap();
    let s1 = engine.list_free_slots(p1, None, day_window(), 10, 0).await.unwrap().slots;
    let s2 = engine.list_free_slots(p2, None, day_window(), 10, 0).await.unwrap().slots;

    let client = Ulid::new();
    let first = engine.create_booking(client, s1[0].id, String::new()).await.unwrap();

    let err = engine
        .create_booking(client, s2[0].id, String::new())
        .await
        .unwrap_err();
    match err {
        EngineError::ClientConflict { slot_id, conflicts } => {
            assert_eq!(slot_id, s2[0].id);
            assert_eq!(conflicts, vec![s1[0].span]);
        }
        other => panic!("expected client conflict, got {other:?}"),
    }

    // Once the first booking is cancelled the overlapping slot is open again.
    engine.cancel_booking(first.booking.id).await.unwrap();
    engine.create_booking(client, s2[0].id, String::new()).await.unwrap();

    engine.create_booking(client, s1[0].id, String::new()).await.unwrap_err();
    let err = engine
        .create_booking(client, s2[1].id, String::new())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::ClientConflict { .. }));
}

#[tokio::test]
async fn touching_bookings_are_allowed() {
    let (engine, _, slots) =
        engine_with_slots("book_touching.journal", &[(at(9), at(10)), (at(10), at(11))]).await;
    let client = Ulid::new();
    engine.create_booking(client, slots[0].id, String::new()).await.unwrap();
    engine.create_booking(client, slots[1].id, String::new()).await.unwrap();
    assert_eq!(engine.index.client_confirmed(&client).len(), 2);
}

#[tokio::test]
async fn provider_overlap_blocks_booking() {
    let (engine, _, slots) = engine_with_slots(
        "book_provider_overlap.journal",
        &[(at(10), at(11)), (at(10) + 30 * M, at(11) + 30 * M)],
    )
    .await;
    engine
        .create_booking(Ulid::new(), slots[0].id, String::new())
        .await
        .unwrap();
    let err = engine
        .create_booking(Ulid::new(), slots[1].id, String::new())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::ProviderConflict { .. }));
    assert_eq!(err.to_string(), "provider has conflicting booking");
}

#[tokio::test]
async fn cancel_then_rebook() {
    let (engine, _, slots) = engine_with_slots("book_rebook.journal", &[(at(9), at(10))]).await;
    let first = engine
        .create_booking(Ulid::new(), slots[0].id, String::new())
        .await
        .unwrap();

    let cancelled = engine.cancel_booking(first.booking.id).await.unwrap();
    assert_eq!(cancelled.booking.status, BookingStatus::Cancelled);
    assert!(cancelled.booking.cancelled_at.is_some());
    assert_eq!(cancelled.slot.status, SlotStatus::Planned);

    // Cancelling twice returns the same record.
    let again = engine.cancel_booking(first.booking.id).await.unwrap();
    assert_eq!(again.booking.cancelled_at, cancelled.booking.cancelled_at);

    let second = engine
        .create_booking(Ulid::new(), slots[0].id, String::new())
        .await
        .unwrap();
    assert_ne!(second.booking.id, first.booking.id);
    assert_eq!(engine.stats().await.bookings, 2);
    assert_eq!(engine.stats().await.active_bookings, 1);
}

#[tokio::test]
async fn cancel_unknown_booking() {
    let engine = Engine::open(&test_journal_path("cancel_unknown.journal")).unwrap();
    let err = engine.cancel_booking(Ulid::new()).await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound { entity: "booking", .. }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_booking_one_winner() {
    let (engine, _, slots) = engine_with_slots("book_race.journal", &[(at(9), at(10))]).await;
    let engine = Arc::new(engine);
    let slot_id = slots[0].id;

    let mut handles = Vec::new();
    for _ in 0..16 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine.create_booking(Ulid::new(), slot_id, String::new()).await
        }));
    }
    let mut wins = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => wins += 1,
            Err(e) => assert!(matches!(e, EngineError::SlotNotFree(_))),
        }
    }
    assert_eq!(wins, 1);
    assert_eq!(engine.stats().await.active_bookings, 1);
    assert!(engine.client_locks.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_client_bookings_never_overlap() {
    let engine = Arc::new(Engine::open(&test_journal_path("book_client_race.journal")).unwrap());
    let client = Ulid::new();
    let mut slot_ids = Vec::new();
    for _ in 0..6 {
        let provider = Ulid::new();
        engine
            .materialize_slots(
                provider,
                None,
                day_window(),
                occurrences(Ulid::new(), &[(at(14), at(15))]),
            )
            .await
            .unwrap();
        let page = engine.list_free_slots(provider, None, day_window(), 10, 0).await.unwrap();
        slot_ids.push(page.slots[0].id);
    }

    let mut handles = Vec::new();
    for slot_id in slot_ids {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine.create_booking(client, slot_id, String::new()).await
        }));
    }
    let mut wins = 0;
    for h in handles {
        if h.await.unwrap().is_ok() {
            wins += 1;
        }
    }
    assert_eq!(wins, 1);
    assert!(engine.client_locks.is_empty());
}

#[tokio::test]
async fn client_locks_do_not_accumulate() {
    let (engine, _, slots) =
        engine_with_slots("client_locks.journal", &[(at(9), at(10)), (at(10), at(11))]).await;
    for slot in &slots {
        engine.create_booking(Ulid::new(), slot.id, String::new()).await.unwrap();
    }
    assert!(engine.client_locks.is_empty());

    // Rejected attempts release their entry too.
    engine
        .create_booking(Ulid::new(), slots[0].id, String::new())
        .await
        .unwrap_err();
    engine
        .create_booking(Ulid::new(), Ulid::new(), String::new())
        .await
        .unwrap_err();
    assert!(engine.client_locks.is_empty());

    // A waiting attempt keeps the entry alive until it is done.
    let client = Ulid::new();
    let held = engine.lock_client(client).await;
    let waiter = engine.client_locks.get(&client).map(|m| m.value().clone()).unwrap();
    drop(held);
    assert_eq!(engine.client_locks.len(), 1);
    drop(waiter);
    let again = engine.lock_client(client).await;
    drop(again);
    assert!(engine.client_locks.is_empty());
}

// ── Availability ─────────────────────────────────────────

#[tokio::test]
async fn availability_reasons() {
    let (engine, _, slots) = engine_with_slots(
        "availability.journal",
        &[(at(9), at(10)), (at(12), at(13)), (at(12) + 30 * M, at(13) + 30 * M)],
    )
    .await;
    let client = Ulid::new();

    let ok = engine.check_availability(client, slots[0].id).await.unwrap();
    assert_eq!(ok, Availability::available());

    let missing = engine.check_availability(client, Ulid::new()).await.unwrap();
    assert_eq!(missing.reason.as_deref(), Some("slot not found"));

    engine.create_booking(client, slots[0].id, String::new()).await.unwrap();
    let taken = engine.check_availability(Ulid::new(), slots[0].id).await.unwrap();
    assert_eq!(taken.reason.as_deref(), Some("slot is not free"));

    engine.create_booking(client, slots[1].id, String::new()).await.unwrap();
    let own = engine.check_availability(client, slots[2].id).await.unwrap();
    assert_eq!(own.reason.as_deref(), Some("client has conflicting booking"));

    let provider = engine.check_availability(Ulid::new(), slots[2].id).await.unwrap();
    assert_eq!(provider.reason.as_deref(), Some("provider has conflicting booking"));

    // Checking never mutates.
    assert_eq!(engine.stats().await.active_bookings, 2);
}

// ── Bulk cancel ──────────────────────────────────────────

#[tokio::test]
async fn bulk_cancel_window() {
    let (engine, provider, slots) = engine_with_slots(
        "bulk_cancel.journal",
        &[(at(9), at(10)), (at(10), at(11)), (at(15), at(16))],
    )
    .await;
    let client = Ulid::new();
    let booked = engine
        .create_booking(client, slots[1].id, "bring documents".into())
        .await
        .unwrap();

    let result = engine
        .bulk_cancel_provider_slots(provider, Span::new(at(8), at(12)), Some("provider is ill".into()))
        .await
        .unwrap();
    assert_eq!(result.cancelled_slots, 2);
    assert_eq!(result.cancelled_bookings, 1);
    let affected = &result.affected_bookings[0];
    assert_eq!(affected.booking_id, booked.booking.id);
    assert_eq!(affected.client_id, client);
    assert_eq!(affected.span, Span::new(at(10), at(11)));

    let booking = engine.get_booking(booked.booking.id).await.unwrap();
    assert_eq!(booking.booking.status, BookingStatus::Cancelled);
    assert_eq!(booking.booking.comment, "provider is ill");
    assert_eq!(booking.slot.status, SlotStatus::Cancelled);
    assert_eq!(engine.get_slot(slots[0].id).await.unwrap().status, SlotStatus::Cancelled);
    assert_eq!(engine.get_slot(slots[2].id).await.unwrap().status, SlotStatus::Planned);

    // The client's time is released.
    assert!(engine.index.client_confirmed(&client).is_empty());

    // A second pass finds nothing left to cancel.
    let again = engine
        .bulk_cancel_provider_slots(provider, Span::new(at(8), at(12)), None)
        .await
        .unwrap();
    assert_eq!(again, BulkCancelResult::default());
}

#[tokio::test]
async fn bulk_cancel_keeps_comment_without_reason() {
    let (engine, provider, slots) = engine_with_slots("bulk_no_reason.journal", &[(at(9), at(10))]).await;
    let booked = engine
        .create_booking(Ulid::new(), slots[0].id, "window seat".into())
        .await
        .unwrap();
    engine
        .bulk_cancel_provider_slots(provider, day_window(), Some(String::new()))
        .await
        .unwrap();
    let booking = engine.get_booking(booked.booking.id).await.unwrap();
    assert_eq!(booking.booking.comment, "window seat");
}

#[tokio::test]
async fn bulk_cancel_skips_partially_covered_slots() {
    let (engine, provider, _) = engine_with_slots("bulk_partial.journal", &[(at(9), at(11))]).await;
    let result = engine
        .bulk_cancel_provider_slots(provider, Span::new(at(10), at(12)), None)
        .await
        .unwrap();
    assert_eq!(result.cancelled_slots, 0);
}

#[tokio::test]
async fn bulk_cancel_unknown_provider() {
    let engine = Engine::open(&test_journal_path("bulk_unknown.journal")).unwrap();
    let result = engine
        .bulk_cancel_provider_slots(Ulid::new(), day_window(), None)
        .await
        .unwrap();
    assert_eq!(result, BulkCancelResult::default());
}

// ── Slot mutations ───────────────────────────────────────

#[tokio::test]
async fn create_slot_and_duplicate() {
    let engine = Engine::open(&test_journal_path("slot_create.journal")).unwrap();
    let provider = Ulid::new();
    let span = Span::new(at(9), at(10));
    let slot = engine.create_slot(provider, None, span).await.unwrap();
    assert_eq!(slot.status, SlotStatus::Planned);
    assert_eq!(slot.schedule_id, None);

    let err = engine.create_slot(provider, None, span).await.unwrap_err();
    assert!(matches!(err, EngineError::SlotExists(id) if id == slot.id));

    // Another service may hold the same interval.
    engine.create_slot(provider, Some(Ulid::new()), span).await.unwrap();
}

#[tokio::test]
async fn create_slot_validates_span() {
    let engine = Engine::open(&test_journal_path("slot_validate.journal")).unwrap();
    let err = engine
        .create_slot(Ulid::new(), None, Span { start: at(10), end: at(9) })
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidRange));
}

#[tokio::test]
async fn cancel_slot_cancels_its_booking() {
    let (engine, _, slots) = engine_with_slots("slot_cancel.journal", &[(at(9), at(10))]).await;
    let client = Ulid::new();
    let booked = engine.create_booking(client, slots[0].id, String::new()).await.unwrap();

    let slot = engine.cancel_slot(slots[0].id).await.unwrap();
    assert_eq!(slot.status, SlotStatus::Cancelled);
    let booking = engine.get_booking(booked.booking.id).await.unwrap();
    assert_eq!(booking.booking.status, BookingStatus::Cancelled);
    assert!(engine.index.client_confirmed(&client).is_empty());

    let again = engine.cancel_slot(slots[0].id).await.unwrap();
    assert_eq!(again.status, SlotStatus::Cancelled);
}

#[tokio::test]
async fn delete_slot_refused_with_bookings() {
    let (engine, _, slots) =
        engine_with_slots("slot_delete.journal", &[(at(9), at(10)), (at(10), at(11))]).await;
    let booked = engine
        .create_booking(Ulid::new(), slots[0].id, String::new())
        .await
        .unwrap();
    engine.cancel_booking(booked.booking.id).await.unwrap();

    // A cancelled booking still references the slot.
    let err = engine.delete_slot(slots[0].id).await.unwrap_err();
    assert!(matches!(err, EngineError::SlotHasBookings(_)));

    engine.delete_slot(slots[1].id).await.unwrap();
    let err = engine.get_slot(slots[1].id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    let err = engine.delete_slot(slots[1].id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

// ── Queries ──────────────────────────────────────────────

#[tokio::test]
async fn free_slots_filtering_and_paging() {
    let engine = Engine::open(&test_journal_path("query_free.journal")).unwrap();
    let provider = Ulid::new();
    let service = Ulid::new();
    let spans: Vec<(Ms, Ms)> = (8..14).map(|h| (at(h), at(h + 1))).collect();
    engine
        .materialize_slots(provider, Some(service), day_window(), occurrences(Ulid::new(), &spans))
        .await
        .unwrap();
    engine
        .materialize_slots(provider, None, day_window(), occurrences(Ulid::new(), &[(at(20), at(21))]))
        .await
        .unwrap();

    let all = engine.list_free_slots(provider, None, day_window(), 100, 0).await.unwrap();
    assert_eq!(all.total, 7);

    let by_service = engine
        .list_free_slots(provider, Some(service), day_window(), 100, 0)
        .await
        .unwrap();
    assert_eq!(by_service.total, 6);

    engine
        .create_booking(Ulid::new(), by_service.slots[0].id, String::new())
        .await
        .unwrap();
    let page = engine
        .list_free_slots(provider, Some(service), day_window(), 2, 2)
        .await
        .unwrap();
    assert_eq!(page.total, 5);
    let starts: Vec<Ms> = page.slots.iter().map(|s| s.span.start).collect();
    assert_eq!(starts, vec![at(11), at(12)]);

    // Slots crossing the window edge are left out.
    let partial = engine
        .list_free_slots(provider, None, Span::new(at(9) + 30 * M, at(12)), 100, 0)
        .await
        .unwrap();
    assert_eq!(partial.total, 2);

    let unknown = engine
        .list_free_slots(Ulid::new(), None, day_window(), 100, 0)
        .await
        .unwrap();
    assert_eq!(unknown, SlotPage::default());
}

#[tokio::test]
async fn client_bookings_window_and_order() {
    let engine = Engine::open(&test_journal_path("query_client.journal")).unwrap();
    let (p1, p2) = (Ulid::new(), Ulid::new());
    engine
        .materialize_slots(p1, None, day_window(), occurrences(Ulid::new(), &[(at(15), at(16))]))
        .await
        .unwrap();
    engine
        .materialize_slots(
            p2,
            None,
            day_window(),
            occurrences(Ulid::new(), &[(at(9), at(10)), (at(12), at(13))]),
        )
        .await
        .unwrap();
    let s1 = engine.list_free_slots(p1, None, day_window(), 10, 0).await.unwrap().slots;
    let s2 = engine.list_free_slots(p2, None, day_window(), 10, 0).await.unwrap().slots;

    let client = Ulid::new();
    engine.create_booking(client, s1[0].id, String::new()).await.unwrap();
    let cancelled = engine.create_booking(client, s2[1].id, String::new()).await.unwrap();
    engine.create_booking(client, s2[0].id, String::new()).await.unwrap();
    engine.cancel_booking(cancelled.booking.id).await.unwrap();

    let (all, total) = engine.list_client_bookings(client, None, 10, 0).await.unwrap();
    assert_eq!(total, 3);
    let starts: Vec<Ms> = all.iter().map(|d| d.slot.span.start).collect();
    assert_eq!(starts, vec![at(9), at(12), at(15)]);

    let (windowed, total) = engine
        .list_client_bookings(client, Some(Span::new(at(10), at(15))), 10, 0)
        .await
        .unwrap();
    assert_eq!(total, 1);
    assert_eq!(windowed[0].booking.status, BookingStatus::Cancelled);

    let (paged, total) = engine.list_client_bookings(client, None, 1, 2).await.unwrap();
    assert_eq!(total, 3);
    assert_eq!(paged[0].slot.span.start, at(15));

    let (none, total) = engine.list_client_bookings(Ulid::new(), None, 10, 0).await.unwrap();
    assert!(none.is_empty());
    assert_eq!(total, 0);
}

#[tokio::test]
async fn queries_reject_inverted_windows() {
    let engine = Engine::open(&test_journal_path("query_inverted.journal")).unwrap();
    let bad = Span { start: at(10), end: at(9) };
    assert!(matches!(
        engine.list_free_slots(Ulid::new(), None, bad, 10, 0).await,
        Err(EngineError::InvalidRange)
    ));
    assert!(matches!(
        engine.list_client_bookings(Ulid::new(), Some(bad), 10, 0).await,
        Err(EngineError::InvalidRange)
    ));
}

// ── Journal replay and compaction ────────────────────────

#[tokio::test]
async fn state_survives_reopen() {
    let path = test_journal_path("replay.journal");
    let client = Ulid::new();
    let (provider, booking_id, withdrawn_id, deleted_id);
    {
        let engine = Engine::open(&path).unwrap();
        provider = Ulid::new();
        engine
            .materialize_slots(
                provider,
                None,
                day_window(),
                occurrences(
                    Ulid::new(),
                    &[(at(9), at(10)), (at(10), at(11)), (at(11), at(12)), (at(13), at(14))],
                ),
            )
            .await
            .unwrap();
        let slots = engine.list_free_slots(provider, None, day_window(), 10, 0).await.unwrap().slots;
        booking_id = engine
            .create_booking(client, slots[0].id, "hello".into())
            .await
            .unwrap()
            .booking
            .id;
        withdrawn_id = slots[1].id;
        engine.cancel_slot(withdrawn_id).await.unwrap();
        deleted_id = slots[2].id;
        engine.delete_slot(deleted_id).await.unwrap();
        engine
            .bulk_cancel_provider_slots(provider, Span::new(at(13), at(14)), Some("closed".into()))
            .await
            .unwrap();
    }

    let engine = Engine::open(&path).unwrap();
    let stats = engine.stats().await;
    assert_eq!(stats.slots, 3);
    assert_eq!(stats.active_bookings, 1);

    let booking = engine.get_booking(booking_id).await.unwrap();
    assert_eq!(booking.booking.comment, "hello");
    assert_eq!(booking.slot.status, SlotStatus::Booked);
    assert_eq!(engine.get_slot(withdrawn_id).await.unwrap().status, SlotStatus::Cancelled);
    assert!(engine.get_slot(deleted_id).await.is_err());

    // The client index is rebuilt, so overlap checks still apply.
    assert_eq!(engine.index.client_confirmed(&client).len(), 1);
    let (bookings, _) = engine.list_client_bookings(client, None, 10, 0).await.unwrap();
    assert_eq!(bookings.len(), 1);
}

#[tokio::test]
async fn compaction_preserves_state() {
    let path = test_journal_path("compact.journal");
    let client = Ulid::new();
    let (provider, kept_booking);
    {
        let engine = Engine::open(&path).unwrap();
        provider = Ulid::new();
        let spans: Vec<(Ms, Ms)> = (8..12).map(|h| (at(h), at(h + 1))).collect();
        engine
            .materialize_slots(provider, None, day_window(), occurrences(Ulid::new(), &spans))
            .await
            .unwrap();
        let slots = engine.list_free_slots(provider, None, day_window(), 10, 0).await.unwrap().slots;
        let dropped = engine.create_booking(client, slots[0].id, String::new()).await.unwrap();
        engine.cancel_booking(dropped.booking.id).await.unwrap();
        kept_booking = engine
            .create_booking(client, slots[1].id, String::new())
            .await
            .unwrap()
            .booking
            .id;
        engine.cancel_slot(slots[3].id).await.unwrap();
        assert_eq!(engine.journal_appends_since_compact().await, 5);

        let written = engine.compact_journal().await.unwrap();
        assert_eq!(written, 2);
        assert_eq!(engine.journal_appends_since_compact().await, 0);

        // Appends after compaction land in the new file.
        engine.create_booking(Ulid::new(), slots[2].id, String::new()).await.unwrap();
    }

    let engine = Engine::open(&path).unwrap();
    let stats = engine.stats().await;
    assert_eq!(stats.slots, 4);
    assert_eq!(stats.free_slots, 1);
    assert_eq!(stats.bookings, 3);
    assert_eq!(stats.active_bookings, 2);
    let kept = engine.get_booking(kept_booking).await.unwrap();
    assert_eq!(kept.booking.status, BookingStatus::Confirmed);
    assert_eq!(engine.index.client_confirmed(&client).len(), 1);
    let (history, _) = engine.list_client_bookings(client, None, 10, 0).await.unwrap();
    assert_eq!(history.len(), 2);
}

#[test]
fn failed_batch_is_rolled_back_whole() {
    let path = test_journal_path("failed_batch.journal");
    let provider = Ulid::new();
    let deleted = |_| Event::SlotDeleted {
        provider_id: provider,
        slot_id: Ulid::new(),
    };
    let events: Vec<Event> = (0..5).map(deleted).collect();
    let batch = |events: &[Event]| -> Vec<(Event, oneshot::Sender<io::Result<()>>)> {
        events.iter().map(|e| (e.clone(), oneshot::channel().0)).collect()
    };

    let mut journal = Journal::open(&path).unwrap();
    flush_batch(&mut journal, &batch(&events[..1])).unwrap();

    // The first two events of this batch reach the file before the third fails.
    journal.fail_after_appends(2);
    assert!(flush_batch(&mut journal, &batch(&events[1..4])).is_err());
    assert_eq!(Journal::replay(&path).unwrap(), events[..1].to_vec());

    // Later batches are not hidden behind a torn frame.
    flush_batch(&mut journal, &batch(&events[4..])).unwrap();
    assert_eq!(Journal::replay(&path).unwrap(), vec![events[0].clone(), events[4].clone()]);
    assert_eq!(journal.appends_since_compact(), 2);
}

#[tokio::test]
async fn commits_after_torn_tail_survive_restart() {
    let path = test_journal_path("torn_restart.journal");
    let provider = Ulid::new();
    {
        let engine = Engine::open(&path).unwrap();
        engine.create_slot(provider, None, Span::new(at(9), at(10))).await.unwrap();
    }
    {
        use std::io::Write;
        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(&[64u8, 0, 0, 0, 1, 2, 3]).unwrap();
    }
    {
        let engine = Engine::open(&path).unwrap();
        assert_eq!(engine.stats().await.slots, 1);
        engine.create_slot(provider, None, Span::new(at(10), at(11))).await.unwrap();
        assert_eq!(engine.stats().await.slots, 2);
    }

    let engine = Engine::open(&path).unwrap();
    assert_eq!(engine.stats().await.slots, 2);
}

#[test]
fn snapshot_rebuild_matches_source() {
    let provider = Ulid::new();
    let slot = TimeSlot {
        id: Ulid::new(),
        schedule_id: None,
        provider_id: provider,
        service_id: None,
        span: Span::new(at(9), at(10)),
        status: SlotStatus::Planned,
    };
    let booking = Booking {
        id: Ulid::new(),
        client_id: Ulid::new(),
        slot_id: slot.id,
        status: BookingStatus::Confirmed,
        created_at: DAY0,
        cancelled_at: None,
        comment: String::new(),
    };
    let events = vec![
        Event::SlotsCreated {
            provider_id: provider,
            slots: vec![slot.clone()],
        },
        Event::BookingConfirmed {
            provider_id: provider,
            booking: booking.clone(),
        },
    ];
    let state = rebuild(&events);
    let again = rebuild(&snapshot_events(&state));
    let (a, b) = (&state[&provider], &again[&provider]);
    assert_eq!(a.slots, b.slots);
    assert_eq!(a.bookings, b.bookings);
    assert_eq!(a.active_by_slot, b.active_by_slot);
    assert_eq!(b.slots[0].status, SlotStatus::Booked);
}

#[tokio::test]
async fn stats_count_everything() {
    let (engine, _, slots) =
        engine_with_slots("stats.journal", &[(at(9), at(10)), (at(10), at(11)), (at(11), at(12))]).await;
    engine.create_booking(Ulid::new(), slots[0].id, String::new()).await.unwrap();
    engine.cancel_slot(slots[2].id).await.unwrap();
    let stats = engine.stats().await;
    assert_eq!(
        stats,
        EngineStats {
            providers: 1,
            slots: 3,
            free_slots: 1,
            bookings: 1,
            active_bookings: 1,
        }
    );
}
