use super::*;
use crate::auth::Actor;
use crate::notify::{Notifier, NotifyError};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use tokio::sync::broadcast;
use tokio_test::{assert_err, assert_ok};

const H: Minute = 60;

// 2024-05-06 is a Monday.
fn monday() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 5, 6).unwrap()
}

/// A week before `monday()`, so every test date is in the future.
fn before_monday() -> Clock {
    fixed_clock(NaiveDate::from_ymd_opt(2024, 4, 29).unwrap().and_hms_opt(8, 0, 0).unwrap())
}

fn test_wal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("carebook_test_engine");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

fn engine_with(path: PathBuf, notify: Arc<NotifyHub>) -> Engine {
    Engine::with_clock(path, notify, before_monday()).unwrap()
}

fn engine(name: &str) -> Engine {
    engine_with(test_wal_path(name), Arc::new(NotifyHub::new()))
}

/// Valid professional working Mondays 09:00–17:00 with a 12:00–13:00 break on `monday()`.
async fn professional(engine: &Engine) -> Ulid {
    let pid = Ulid::new();
    engine
        .create_professional(pid, Some("Dr. Ana Souza".into()), 20000, ProfessionalStatus::Valid)
        .await
        .unwrap();
    engine.add_window(Ulid::new(), pid, 0, 9 * H, 17 * H, true).await.unwrap();
    engine
        .add_exception(Ulid::new(), pid, monday(), 12 * H, 13 * H)
        .await
        .unwrap();
    pid
}

async fn next_event(rx: &mut broadcast::Receiver<LifecycleEvent>) -> LifecycleEvent {
    tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("event timeout")
        .expect("channel closed")
}

// ── Calendar and slots ───────────────────────────────────

#[tokio::test]
async fn engine_resolve_day_and_slots() {
    let engine = engine("resolve_and_slots.wal");
    let pid = professional(&engine).await;

    let free = engine.resolve_day(pid, monday()).await.unwrap();
    assert_eq!(free, vec![Span::new(9 * H, 12 * H), Span::new(13 * H, 17 * H)]);

    let slots = engine.generate_slots(pid, monday(), 60).await.unwrap();
    let hours: Vec<_> = slots.iter().map(|m| m / H).collect();
    assert_eq!(hours, vec![9, 10, 11, 13, 14, 15, 16]);

    let tuesday = monday().succ_opt().unwrap();
    assert!(engine.resolve_day(pid, tuesday).await.unwrap().is_empty());
}

#[tokio::test]
async fn engine_unknown_professional_not_found() {
    let engine = engine("unknown_professional.wal");
    let ghost = Ulid::new();
    assert!(matches!(
        engine.resolve_day(ghost, monday()).await,
        Err(EngineError::NotFound(id)) if id == ghost
    ));
    assert!(matches!(
        engine.generate_slots(ghost, monday(), 30).await,
        Err(EngineError::NotFound(_))
    ));
    assert!(matches!(
        engine.book(ghost, None, monday(), 9 * H, 60).await,
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test]
async fn engine_slots_reject_bad_duration() {
    let engine = engine("bad_duration.wal");
    let pid = professional(&engine).await;
    assert!(matches!(
        engine.generate_slots(pid, monday(), 0).await,
        Err(EngineError::InvalidInput(_))
    ));
    assert!(matches!(
        engine.book(pid, None, monday(), 9 * H, -30).await,
        Err(EngineError::InvalidInput(_))
    ));
}

#[tokio::test]
async fn engine_booked_slot_leaves_the_grid() {
    let engine = engine("booked_leaves_grid.wal");
    let pid = professional(&engine).await;

    engine.book(pid, None, monday(), 10 * H, 60).await.unwrap();
    let slots = engine.generate_slots(pid, monday(), 60).await.unwrap();
    assert!(!slots.contains(&(10 * H)));
    assert!(slots.contains(&(9 * H)));
    assert!(slots.contains(&(11 * H)));

    assert!(!engine.is_slot_bookable(pid, monday(), 10 * H + 30, 60).await.unwrap());
    assert!(engine.is_slot_bookable(pid, monday(), 11 * H, 60).await.unwrap());
    assert!(!engine.is_slot_bookable(pid, monday(), 11 * H + 30, 60).await.unwrap());
    assert!(!engine.is_slot_bookable(pid, monday(), 23 * H + 30, 60).await.unwrap());
}

#[tokio::test]
async fn engine_slots_hide_the_past() {
    let now = monday().and_hms_opt(14, 30, 0).unwrap();
    let engine = Engine::with_clock(
        test_wal_path("past_slots.wal"),
        Arc::new(NotifyHub::new()),
        fixed_clock(now),
    )
    .unwrap();
    let pid = professional(&engine).await;

    let slots = engine.generate_slots(pid, monday(), 60).await.unwrap();
    assert_eq!(slots, vec![15 * H, 16 * H]);
    assert!(matches!(
        engine.book(pid, None, monday(), 9 * H, 60).await,
        Err(EngineError::SlotUnavailable { .. })
    ));
}

// ── Booking ──────────────────────────────────────────────

#[tokio::test]
async fn engine_book_happy_path() {
    let engine = engine("book_happy.wal");
    let pid = professional(&engine).await;
    let patient = Ulid::new();

    let appt = assert_ok!(engine.book(pid, Some(patient), monday(), 9 * H, 60).await);
    assert_eq!(appt.status, AppointmentStatus::Pending);
    assert_eq!(appt.span, Span::new(9 * H, 10 * H));
    assert_eq!(appt.patient_id, Some(patient));

    let fetched = engine.get_appointment(appt.id).await.unwrap();
    assert_eq!(fetched, appt);
    assert_eq!(engine.list_appointments(pid, Some(monday())).await.unwrap(), vec![appt.clone()]);
    assert_eq!(engine.patient_appointments(patient).await, vec![appt]);
}

#[tokio::test]
async fn engine_book_rejects_non_valid_professional() {
    let engine = engine("not_bookable.wal");
    let pid = professional(&engine).await;

    for status in [ProfessionalStatus::Pending, ProfessionalStatus::Rejected] {
        engine.set_professional_status(pid, status).await.unwrap();
        assert!(matches!(
            engine.book(pid, None, monday(), 9 * H, 60).await,
            Err(EngineError::ProfessionalNotBookable(id)) if id == pid
        ));
    }

    engine.set_professional_status(pid, ProfessionalStatus::Valid).await.unwrap();
    assert_ok!(engine.book(pid, None, monday(), 9 * H, 60).await);
}

#[tokio::test]
async fn engine_is_slot_bookable_requires_valid_professional() {
    let engine = engine("bookable_status.wal");
    let pid = Ulid::new();
    engine
        .create_professional(pid, None, 0, ProfessionalStatus::Pending)
        .await
        .unwrap();
    engine.add_window(Ulid::new(), pid, 0, 9 * H, 17 * H, true).await.unwrap();

    assert!(!engine.is_slot_bookable(pid, monday(), 9 * H, 60).await.unwrap());
    engine
        .set_professional_status(pid, ProfessionalStatus::Valid)
        .await
        .unwrap();
    assert!(engine.is_slot_bookable(pid, monday(), 9 * H, 60).await.unwrap());
}

#[tokio::test]
async fn engine_book_outside_availability() {
    let engine = engine("outside_availability.wal");
    let pid = professional(&engine).await;

    // lunch exception
    assert_err!(engine.book(pid, None, monday(), 12 * H, 60).await);
    // straddles the end of the window
    assert!(matches!(
        engine.book(pid, None, monday(), 16 * H + 30, 60).await,
        Err(EngineError::SlotUnavailable { .. })
    ));
    // runs past midnight
    assert!(matches!(
        engine.book(pid, None, monday(), 23 * H + 30, 60).await,
        Err(EngineError::SlotUnavailable { .. })
    ));
}

#[tokio::test]
async fn engine_double_booking_rejected() {
    let engine = engine("double_booking.wal");
    let pid = professional(&engine).await;

    engine.book(pid, None, monday(), 9 * H, 60).await.unwrap();
    let err = engine.book(pid, None, monday(), 9 * H, 60).await.unwrap_err();
    assert!(matches!(err, EngineError::SlotUnavailable { professional_id, .. } if professional_id == pid));

    // overlapping but not same start
    assert!(matches!(
        engine.book(pid, None, monday(), 9 * H + 30, 60).await,
        Err(EngineError::SlotUnavailable { .. })
    ));
    // touching is fine
    assert_ok!(engine.book(pid, None, monday(), 10 * H, 60).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn engine_concurrent_books_exactly_one_wins() {
    let engine = Arc::new(engine("concurrent_books.wal"));
    let pid = professional(&engine).await;

    let mut handles = Vec::new();
    for _ in 0..16 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine.book(pid, Some(Ulid::new()), monday(), 9 * H, 60).await
        }));
    }

    let mut won = 0;
    let mut lost = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(_) => won += 1,
            Err(EngineError::SlotUnavailable { .. }) => lost += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!(won, 1);
    assert_eq!(lost, 15);
    assert_eq!(engine.list_appointments(pid, Some(monday())).await.unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn engine_two_simultaneous_books_one_appointment() {
    let engine = Arc::new(engine("two_simultaneous.wal"));
    let pid = professional(&engine).await;

    let (a, b) = tokio::join!(
        engine.book(pid, Some(Ulid::new()), monday(), 9 * H, 30),
        engine.book(pid, Some(Ulid::new()), monday(), 9 * H, 30),
    );
    assert!(a.is_ok() != b.is_ok());
    let loser = if a.is_ok() { b } else { a };
    assert!(matches!(loser, Err(EngineError::SlotUnavailable { .. })));
}

#[tokio::test]
async fn engine_cancelled_slot_can_be_rebooked() {
    let engine = engine("rebook_after_cancel.wal");
    let pid = professional(&engine).await;

    let first = engine.book(pid, None, monday(), 9 * H, 60).await.unwrap();
    engine.cancel(first.id, &Actor::Admin).await.unwrap();

    let second = assert_ok!(engine.book(pid, None, monday(), 9 * H, 60).await);
    assert_ne!(first.id, second.id);
    let all = engine.list_appointments(pid, None).await.unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all.iter().filter(|a| a.status.is_active()).count(), 1);
}

#[tokio::test]
async fn engine_admin_book_confirmed() {
    let engine = engine("admin_book.wal");
    let pid = professional(&engine).await;
    let mut rx = engine.notify.subscribe(pid);

    let appt = engine
        .admin_book(&Actor::Admin, pid, None, monday(), 14 * H, 45, true)
        .await
        .unwrap();
    assert_eq!(appt.status, AppointmentStatus::Confirmed);

    let created = next_event(&mut rx).await;
    assert_eq!(created.appointment_id, appt.id);
    assert_eq!(created.old_status, None);
    assert_eq!(created.new_status, AppointmentStatus::Confirmed);

    let pending = engine
        .admin_book(&Actor::Admin, pid, None, monday(), 15 * H, 45, false)
        .await
        .unwrap();
    assert_eq!(pending.status, AppointmentStatus::Pending);
    let created = next_event(&mut rx).await;
    assert_eq!(created.appointment_id, pending.id);
    assert_eq!(created.new_status, AppointmentStatus::Pending);

    assert!(matches!(
        engine
            .admin_book(&Actor::Professional(pid), pid, None, monday(), 16 * H, 30, true)
            .await,
        Err(EngineError::Unauthorized(_))
    ));
}

// ── Lifecycle ────────────────────────────────────────────

#[tokio::test]
async fn engine_confirm_then_cancel() {
    let engine = engine("confirm_cancel.wal");
    let pid = professional(&engine).await;
    let appt = engine.book(pid, None, monday(), 9 * H, 60).await.unwrap();

    let owner = Actor::Professional(pid);
    let confirmed = engine.confirm(appt.id, &owner).await.unwrap();
    assert_eq!(confirmed.status, AppointmentStatus::Confirmed);

    // idempotent
    let again = engine.confirm(appt.id, &owner).await.unwrap();
    assert_eq!(again.status, AppointmentStatus::Confirmed);

    assert!(matches!(
        engine.set_status(appt.id, "pending", &owner).await,
        Err(EngineError::InvalidStatus(_))
    ));

    let cancelled = engine.cancel(appt.id, &Actor::Admin).await.unwrap();
    assert_eq!(cancelled.status, AppointmentStatus::Cancelled);
}

#[tokio::test]
async fn engine_cancel_cancelled_succeeds() {
    let engine = engine("cancel_twice.wal");
    let pid = professional(&engine).await;
    let appt = engine.book(pid, None, monday(), 9 * H, 60).await.unwrap();

    engine.cancel(appt.id, &Actor::Admin).await.unwrap();
    let again = assert_ok!(engine.cancel(appt.id, &Actor::Admin).await);
    assert_eq!(again.status, AppointmentStatus::Cancelled);
}

#[tokio::test]
async fn engine_cancelled_is_terminal() {
    let engine = engine("terminal.wal");
    let pid = professional(&engine).await;
    let appt = engine.book(pid, None, monday(), 9 * H, 60).await.unwrap();
    engine.cancel(appt.id, &Actor::Admin).await.unwrap();

    assert!(matches!(
        engine.confirm(appt.id, &Actor::Admin).await,
        Err(EngineError::TerminalStateViolation(id)) if id == appt.id
    ));
    assert!(matches!(
        engine.set_status(appt.id, "pending", &Actor::Admin).await,
        Err(EngineError::TerminalStateViolation(_))
    ));
}

#[tokio::test]
async fn engine_unknown_status_string() {
    let engine = engine("unknown_status.wal");
    let pid = professional(&engine).await;
    let appt = engine.book(pid, None, monday(), 9 * H, 60).await.unwrap();
    assert!(matches!(
        engine.set_status(appt.id, "done", &Actor::Admin).await,
        Err(EngineError::InvalidStatus(_))
    ));
}

#[tokio::test]
async fn engine_transition_requires_owner_or_admin() {
    let engine = engine("unauthorized.wal");
    let pid = professional(&engine).await;
    let patient = Ulid::new();
    let appt = engine.book(pid, Some(patient), monday(), 9 * H, 60).await.unwrap();

    for actor in [Actor::Professional(Ulid::new()), Actor::Patient(patient)] {
        assert!(matches!(
            engine.confirm(appt.id, &actor).await,
            Err(EngineError::Unauthorized(_))
        ));
    }
    assert_eq!(
        engine.get_appointment(appt.id).await.unwrap().status,
        AppointmentStatus::Pending
    );
}

#[tokio::test]
async fn engine_transition_unknown_appointment() {
    let engine = engine("transition_unknown.wal");
    let ghost = Ulid::new();
    assert!(matches!(
        engine.cancel(ghost, &Actor::Admin).await,
        Err(EngineError::NotFound(id)) if id == ghost
    ));
}

// ── Notifications ────────────────────────────────────────

#[tokio::test]
async fn engine_events_follow_commits() {
    let notify = Arc::new(NotifyHub::new());
    let engine = engine_with(test_wal_path("events_follow_commits.wal"), notify.clone());
    let pid = professional(&engine).await;
    let mut rx = notify.subscribe(pid);

    let appt = engine.book(pid, None, monday(), 9 * H, 60).await.unwrap();
    let created = next_event(&mut rx).await;
    assert_eq!(created.appointment_id, appt.id);
    assert_eq!(created.old_status, None);
    assert_eq!(created.new_status, AppointmentStatus::Pending);

    engine.confirm(appt.id, &Actor::Admin).await.unwrap();
    let confirmed = next_event(&mut rx).await;
    assert_eq!(confirmed.old_status, Some(AppointmentStatus::Pending));
    assert_eq!(confirmed.new_status, AppointmentStatus::Confirmed);

    // no-op and failures emit nothing
    engine.confirm(appt.id, &Actor::Admin).await.unwrap();
    let _ = engine.book(pid, None, monday(), 9 * H, 60).await;
    let _ = engine.set_status(appt.id, "pending", &Actor::Admin).await;
    assert!(matches!(rx.try_recv(), Err(broadcast::error::TryRecvError::Empty)));

    engine.cancel(appt.id, &Actor::Professional(pid)).await.unwrap();
    let cancelled = next_event(&mut rx).await;
    assert_eq!(cancelled.old_status, Some(AppointmentStatus::Confirmed));
    assert_eq!(cancelled.new_status, AppointmentStatus::Cancelled);
}

struct AlwaysDown(Arc<AtomicUsize>);

#[async_trait]
impl Notifier for AlwaysDown {
    fn name(&self) -> &'static str {
        "always_down"
    }

    async fn notify(&self, _event: &LifecycleEvent) -> Result<(), NotifyError> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Err(NotifyError::Delivery("smtp refused".into()))
    }
}

#[tokio::test]
async fn engine_failing_notifier_never_fails_booking() {
    let calls = Arc::new(AtomicUsize::new(0));
    let notify = Arc::new(NotifyHub::new().with_notifier(Arc::new(AlwaysDown(calls.clone()))));
    let engine = engine_with(test_wal_path("failing_notifier.wal"), notify);
    let pid = professional(&engine).await;

    let appt = assert_ok!(engine.book(pid, None, monday(), 9 * H, 60).await);
    assert_ok!(engine.cancel(appt.id, &Actor::Admin).await);

    tokio::time::timeout(Duration::from_secs(1), async {
        while calls.load(Ordering::SeqCst) < 2 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();
}

// ── Patients and professionals ───────────────────────────

#[tokio::test]
async fn engine_forget_patient_keeps_appointments() {
    let engine = engine("forget_patient.wal");
    let pid = professional(&engine).await;
    let other_pid = professional(&engine).await;
    let patient = Ulid::new();

    engine.book(pid, Some(patient), monday(), 9 * H, 60).await.unwrap();
    engine.book(other_pid, Some(patient), monday(), 10 * H, 60).await.unwrap();
    engine.book(pid, Some(Ulid::new()), monday(), 11 * H, 60).await.unwrap();

    assert_eq!(engine.forget_patient(patient).await.unwrap(), 2);
    assert!(engine.patient_appointments(patient).await.is_empty());
    assert_eq!(engine.list_appointments(pid, None).await.unwrap().len(), 2);
    assert_eq!(engine.list_appointments(other_pid, None).await.unwrap().len(), 1);
    assert_eq!(engine.forget_patient(patient).await.unwrap(), 0);
}

#[tokio::test]
async fn engine_forget_patient_excludes_late_professionals() {
    let path = test_wal_path("forget_vs_create.wal");
    let notify = Arc::new(NotifyHub::new());
    let patient = Ulid::new();
    let engine = Arc::new(engine_with(path.clone(), notify.clone()));
    let existing = professional(&engine).await;

    // Stall the detach on an existing professional's lock.
    let held = engine.get_shared(&existing).unwrap().write_owned().await;
    let forget = tokio::spawn({
        let engine = engine.clone();
        async move { engine.forget_patient(patient).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let late = tokio::spawn({
        let engine = engine.clone();
        async move {
            let pid = professional(&engine).await;
            engine.book(pid, Some(patient), monday(), 9 * H, 60).await.unwrap().id
        }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!late.is_finished(), "create committed while the detach was in progress");

    drop(held);
    assert_eq!(forget.await.unwrap().unwrap(), 0);
    let appt_id = late.await.unwrap();

    let live = engine.get_appointment(appt_id).await.unwrap().patient_id;
    assert_eq!(live, Some(patient));
    let replayed = engine_with(path, notify).get_appointment(appt_id).await.unwrap().patient_id;
    assert_eq!(replayed, live);
}

#[tokio::test]
async fn engine_duplicate_professional_rejected() {
    let engine = engine("duplicate_professional.wal");
    let pid = professional(&engine).await;
    assert!(matches!(
        engine.create_professional(pid, None, 0, ProfessionalStatus::Valid).await,
        Err(EngineError::AlreadyExists(id)) if id == pid
    ));
}

#[tokio::test]
async fn engine_concurrent_creates_same_id_one_wins() {
    let engine = engine("create_race.wal");
    let pid = Ulid::new();

    let (a, b) = tokio::join!(
        engine.create_professional(pid, Some("A".into()), 0, ProfessionalStatus::Valid),
        engine.create_professional(pid, Some("B".into()), 0, ProfessionalStatus::Valid),
    );
    let winner = match (a, b) {
        (Ok(p), Err(EngineError::AlreadyExists(id))) | (Err(EngineError::AlreadyExists(id)), Ok(p)) => {
            assert_eq!(id, pid);
            p
        }
        other => panic!("expected exactly one create to succeed, got {other:?}"),
    };
    assert_eq!(engine.get_professional(pid).await.unwrap(), winner);
    assert_eq!(engine.list_professionals().await.len(), 1);
}

#[tokio::test]
async fn engine_concurrent_window_ids_one_wins() {
    let engine = engine("window_id_race.wal");
    let p1 = professional(&engine).await;
    let p2 = professional(&engine).await;
    let wid = Ulid::new();

    let (a, b) = tokio::join!(
        engine.add_window(wid, p1, 2, 9 * H, 12 * H, true),
        engine.add_window(wid, p2, 2, 9 * H, 12 * H, true),
    );
    let winner = match (&a, &b) {
        (Ok(_), Err(EngineError::AlreadyExists(_))) => p1,
        (Err(EngineError::AlreadyExists(_)), Ok(_)) => p2,
        other => panic!("expected exactly one add to succeed, got {other:?}"),
    };
    assert_eq!(engine.professional_for_entity(&wid), Some(winner));
    let total = engine.windows(p1).await.unwrap().len() + engine.windows(p2).await.unwrap().len();
    assert_eq!(total, 3);
}

#[tokio::test]
async fn engine_waiter_on_replaced_professional_not_found() {
    let engine = Arc::new(engine("recreated_waiter.wal"));
    let pid = professional(&engine).await;

    let held = engine.get_shared(&pid).unwrap().write_owned().await;
    let waiter = tokio::spawn({
        let engine = engine.clone();
        async move { engine.set_professional_status(pid, ProfessionalStatus::Rejected).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Same map state a delete leaves, then a create reusing the id.
    engine.state.remove(&pid);
    engine
        .create_professional(pid, None, 0, ProfessionalStatus::Valid)
        .await
        .unwrap();
    drop(held);

    assert!(matches!(waiter.await.unwrap(), Err(EngineError::NotFound(id)) if id == pid));
    assert_eq!(
        engine.get_professional(pid).await.unwrap().status,
        ProfessionalStatus::Valid
    );
}

#[tokio::test]
async fn engine_delete_professional_cascades() {
    let engine = engine("delete_professional.wal");
    let pid = professional(&engine).await;
    let appt = engine.book(pid, None, monday(), 9 * H, 60).await.unwrap();

    engine.delete_professional(pid).await.unwrap();
    assert!(matches!(engine.get_professional(pid).await, Err(EngineError::NotFound(_))));
    assert!(matches!(engine.get_appointment(appt.id).await, Err(EngineError::NotFound(_))));
    assert!(matches!(engine.delete_professional(pid).await, Err(EngineError::NotFound(_))));
}

#[tokio::test]
async fn engine_window_and_exception_validation() {
    let engine = engine("window_validation.wal");
    let pid = professional(&engine).await;

    assert!(matches!(
        engine.add_window(Ulid::new(), pid, 7, 9 * H, 10 * H, true).await,
        Err(EngineError::InvalidInput(_))
    ));
    assert!(matches!(
        engine.add_window(Ulid::new(), pid, 1, 10 * H, 9 * H, true).await,
        Err(EngineError::InvalidInput(_))
    ));
    assert!(matches!(
        engine.add_exception(Ulid::new(), pid, monday(), 9 * H, 25 * H).await,
        Err(EngineError::InvalidInput(_))
    ));
    assert!(matches!(
        engine.add_window(Ulid::new(), Ulid::new(), 1, 9 * H, 10 * H, true).await,
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test]
async fn engine_remove_window_and_exception() {
    let engine = engine("remove_window_exception.wal");
    let pid = Ulid::new();
    engine.create_professional(pid, None, 0, ProfessionalStatus::Valid).await.unwrap();
    let window = engine.add_window(Ulid::new(), pid, 0, 9 * H, 17 * H, true).await.unwrap();
    let exception = engine
        .add_exception(Ulid::new(), pid, monday(), 12 * H, 13 * H)
        .await
        .unwrap();

    assert_eq!(engine.remove_exception(exception.id).await.unwrap(), pid);
    assert_eq!(engine.resolve_day(pid, monday()).await.unwrap(), vec![Span::new(9 * H, 17 * H)]);

    assert_eq!(engine.remove_window(window.id).await.unwrap(), pid);
    assert!(engine.resolve_day(pid, monday()).await.unwrap().is_empty());
    assert!(matches!(engine.remove_window(window.id).await, Err(EngineError::NotFound(_))));

    // an exception id is not a window
    let exception = engine
        .add_exception(Ulid::new(), pid, monday(), 12 * H, 13 * H)
        .await
        .unwrap();
    assert!(matches!(engine.remove_window(exception.id).await, Err(EngineError::NotFound(_))));
}

// ── Durability ───────────────────────────────────────────

#[tokio::test]
async fn engine_wal_replay_restores_state() {
    let path = test_wal_path("replay.wal");
    let notify = Arc::new(NotifyHub::new());
    let patient = Ulid::new();

    let (pid, kept, cancelled) = {
        let engine = engine_with(path.clone(), notify.clone());
        let pid = professional(&engine).await;
        let kept = engine.book(pid, Some(patient), monday(), 9 * H, 60).await.unwrap();
        engine.confirm(kept.id, &Actor::Admin).await.unwrap();
        let cancelled = engine.book(pid, None, monday(), 10 * H, 60).await.unwrap();
        engine.cancel(cancelled.id, &Actor::Admin).await.unwrap();
        (pid, kept, cancelled)
    };

    let engine = engine_with(path, notify);
    let restored = engine.get_appointment(kept.id).await.unwrap();
    assert_eq!(restored.status, AppointmentStatus::Confirmed);
    assert_eq!(restored.patient_id, Some(patient));
    assert_eq!(
        engine.get_appointment(cancelled.id).await.unwrap().status,
        AppointmentStatus::Cancelled
    );

    // uniqueness index rebuilt: 09:00 held, 10:00 free again
    assert!(matches!(
        engine.book(pid, None, monday(), 9 * H, 60).await,
        Err(EngineError::SlotUnavailable { .. })
    ));
    assert_ok!(engine.book(pid, None, monday(), 10 * H, 60).await);
    assert_eq!(
        engine.resolve_day(pid, monday()).await.unwrap(),
        vec![Span::new(9 * H, 12 * H), Span::new(13 * H, 17 * H)]
    );
}

#[tokio::test]
async fn engine_replay_after_forget_and_delete() {
    let path = test_wal_path("replay_forget_delete.wal");
    let notify = Arc::new(NotifyHub::new());
    let patient = Ulid::new();

    let (kept_pid, appt, gone_pid) = {
        let engine = engine_with(path.clone(), notify.clone());
        let kept_pid = professional(&engine).await;
        let gone_pid = professional(&engine).await;
        let appt = engine.book(kept_pid, Some(patient), monday(), 9 * H, 60).await.unwrap();
        engine.forget_patient(patient).await.unwrap();
        engine.delete_professional(gone_pid).await.unwrap();
        (kept_pid, appt, gone_pid)
    };

    let engine = engine_with(path, notify);
    assert_eq!(engine.get_appointment(appt.id).await.unwrap().patient_id, None);
    assert!(engine.get_professional(kept_pid).await.is_ok());
    assert!(matches!(engine.get_professional(gone_pid).await, Err(EngineError::NotFound(_))));
}

#[tokio::test]
async fn engine_compaction_preserves_state() {
    let path = test_wal_path("compaction.wal");
    let notify = Arc::new(NotifyHub::new());

    let (pid, active, cancelled) = {
        let engine = engine_with(path.clone(), notify.clone());
        let pid = professional(&engine).await;
        for _ in 0..10 {
            let w = engine.add_window(Ulid::new(), pid, 2, 8 * H, 9 * H, true).await.unwrap();
            engine.remove_window(w.id).await.unwrap();
        }
        let active = engine.book(pid, None, monday(), 14 * H, 60).await.unwrap();
        engine.confirm(active.id, &Actor::Admin).await.unwrap();
        let cancelled = engine.book(pid, None, monday(), 15 * H, 60).await.unwrap();
        engine.cancel(cancelled.id, &Actor::Admin).await.unwrap();

        let before = std::fs::metadata(&path).unwrap().len();
        assert!(engine.wal_appends_since_compact().await > 0);
        engine.compact_wal().await.unwrap();
        assert_eq!(engine.wal_appends_since_compact().await, 0);
        assert!(std::fs::metadata(&path).unwrap().len() < before);

        // appends after compaction land in the new file
        engine.book(pid, None, monday(), 16 * H, 60).await.unwrap();
        (pid, active, cancelled)
    };

    let engine = engine_with(path, notify);
    assert_eq!(engine.list_appointments(pid, None).await.unwrap().len(), 3);
    assert_eq!(
        engine.get_appointment(active.id).await.unwrap().status,
        AppointmentStatus::Confirmed
    );
    assert_eq!(
        engine.get_appointment(cancelled.id).await.unwrap().status,
        AppointmentStatus::Cancelled
    );
    assert_eq!(engine.windows(pid).await.unwrap().len(), 1);
    assert_eq!(engine.exceptions(pid).await.unwrap().len(), 1);
    assert!(matches!(
        engine.book(pid, None, monday(), 14 * H, 60).await,
        Err(EngineError::SlotUnavailable { .. })
    ));
    assert_ok!(engine.book(pid, None, monday(), 15 * H, 60).await);
}

#[tokio::test]
async fn engine_list_professionals() {
    let engine = engine("list_professionals.wal");
    let a = professional(&engine).await;
    let b = professional(&engine).await;
    let listed: Vec<_> = engine.list_professionals().await.into_iter().map(|p| p.id).collect();
    let mut expected = vec![a, b];
    expected.sort();
    assert_eq!(listed, expected);
}
