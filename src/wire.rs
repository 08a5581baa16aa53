use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, NaiveDate, Utc};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::{debug, warn};
use ulid::Ulid;

use crate::auth::Actor;
use crate::engine::{Engine, EngineError};
use crate::limits::*;
use crate::model::*;
use crate::observability::{self, op_label};

const EVENT_QUEUE: usize = 256;

// ── Requests ─────────────────────────────────────────────────────

fn default_true() -> bool {
    true
}

fn default_professional_status() -> ProfessionalStatus {
    ProfessionalStatus::Pending
}

/// One request line. Times of day are `"HH:MM"`; durations are minutes.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Auth {
        password: String,
    },
    CreateProfessional {
        id: Option<Ulid>,
        name: Option<String>,
        #[serde(default)]
        consultation_fee: u64,
        #[serde(default = "default_professional_status")]
        status: ProfessionalStatus,
    },
    SetProfessionalStatus {
        id: Ulid,
        status: ProfessionalStatus,
    },
    DeleteProfessional {
        id: Ulid,
    },
    AddWindow {
        id: Option<Ulid>,
        professional_id: Ulid,
        day_of_week: u8,
        start: String,
        end: String,
        #[serde(default = "default_true")]
        is_available: bool,
    },
    RemoveWindow {
        id: Ulid,
    },
    AddException {
        id: Option<Ulid>,
        professional_id: Ulid,
        date: NaiveDate,
        start: String,
        end: String,
    },
    RemoveException {
        id: Ulid,
    },
    ResolveDay {
        professional_id: Ulid,
        date: NaiveDate,
    },
    Slots {
        professional_id: Ulid,
        date: NaiveDate,
        duration: Minute,
    },
    IsBookable {
        professional_id: Ulid,
        date: NaiveDate,
        start: String,
        duration: Minute,
    },
    Book {
        professional_id: Ulid,
        patient_id: Option<Ulid>,
        date: NaiveDate,
        start: String,
        duration: Minute,
    },
    AdminBook {
        actor: Actor,
        professional_id: Ulid,
        patient_id: Option<Ulid>,
        date: NaiveDate,
        start: String,
        duration: Minute,
        #[serde(default)]
        confirmed: bool,
    },
    Confirm {
        id: Ulid,
        actor: Actor,
    },
    Cancel {
        id: Ulid,
        actor: Actor,
    },
    SetStatus {
        id: Ulid,
        status: String,
        actor: Actor,
    },
    GetAppointment {
        id: Ulid,
    },
    ListAppointments {
        professional_id: Ulid,
        date: Option<NaiveDate>,
    },
    PatientAppointments {
        patient_id: Ulid,
    },
    GetProfessional {
        id: Ulid,
    },
    ListProfessionals,
    ForgetPatient {
        patient_id: Ulid,
    },
    Subscribe {
        professional_id: Ulid,
    },
}

#[derive(Debug, Error)]
pub enum WireError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("authenticate first with {{\"op\":\"auth\"}}")]
    AuthRequired,
    #[error("password authentication failed")]
    AuthFailed,
    #[error("framing: {0}")]
    Codec(#[from] LinesCodecError),
    #[error("encoding: {0}")]
    Json(#[from] serde_json::Error),
}

impl WireError {
    pub fn kind(&self) -> &'static str {
        match self {
            WireError::Engine(e) => e.kind(),
            WireError::BadRequest(_) => "bad_request",
            WireError::AuthRequired => "auth_required",
            WireError::AuthFailed => "auth_failed",
            WireError::Codec(_) => "framing",
            WireError::Json(_) => "encoding",
        }
    }
}

fn clock(field: &str, raw: &str) -> Result<Minute, WireError> {
    parse_clock(raw).ok_or_else(|| WireError::BadRequest(format!("{field}: expected HH:MM, got {raw:?}")))
}

// ── Views ────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct IntervalView {
    pub start: String,
    pub end: String,
}

impl From<&Span> for IntervalView {
    fn from(s: &Span) -> Self {
        Self {
            start: format_clock(s.start),
            end: format_clock(s.end),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct AppointmentView {
    pub id: Ulid,
    pub professional_id: Ulid,
    pub patient_id: Option<Ulid>,
    pub date: NaiveDate,
    pub start: String,
    pub end: String,
    pub status: AppointmentStatus,
    pub created_at: DateTime<Utc>,
}

impl From<&Appointment> for AppointmentView {
    fn from(a: &Appointment) -> Self {
        Self {
            id: a.id,
            professional_id: a.professional_id,
            patient_id: a.patient_id,
            date: a.date,
            start: format_clock(a.span.start),
            end: format_clock(a.span.end),
            status: a.status,
            created_at: a.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct WindowView {
    pub id: Ulid,
    pub day_of_week: u8,
    pub start: String,
    pub end: String,
    pub is_available: bool,
}

impl From<&AvailabilityWindow> for WindowView {
    fn from(w: &AvailabilityWindow) -> Self {
        Self {
            id: w.id,
            day_of_week: w.day_of_week,
            start: format_clock(w.start),
            end: format_clock(w.end),
            is_available: w.is_available,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ExceptionView {
    pub id: Ulid,
    pub date: NaiveDate,
    pub start: String,
    pub end: String,
}

impl From<&UnavailableSlot> for ExceptionView {
    fn from(e: &UnavailableSlot) -> Self {
        Self {
            id: e.id,
            date: e.date,
            start: format_clock(e.start),
            end: format_clock(e.end),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct EventView {
    pub appointment_id: Ulid,
    pub professional_id: Ulid,
    pub patient_id: Option<Ulid>,
    pub old_status: Option<AppointmentStatus>,
    pub new_status: AppointmentStatus,
    pub date: NaiveDate,
    pub start: String,
    pub end: String,
}

impl From<&LifecycleEvent> for EventView {
    fn from(e: &LifecycleEvent) -> Self {
        Self {
            appointment_id: e.appointment_id,
            professional_id: e.professional_id,
            patient_id: e.patient_id,
            old_status: e.old_status,
            new_status: e.new_status,
            date: e.date,
            start: format_clock(e.start),
            end: format_clock(e.end),
        }
    }
}

fn appointments(list: &[Appointment]) -> Vec<AppointmentView> {
    list.iter().map(AppointmentView::from).collect()
}

// ── Dispatch ─────────────────────────────────────────────────────

/// Run one stateless request against the engine.
pub async fn dispatch(engine: &Engine, req: Request) -> Result<Value, WireError> {
    let value = match req {
        Request::CreateProfessional {
            id,
            name,
            consultation_fee,
            status,
        } => {
            let p = engine
                .create_professional(id.unwrap_or_else(Ulid::new), name, consultation_fee, status)
                .await?;
            serde_json::to_value(p)?
        }
        Request::SetProfessionalStatus { id, status } => {
            serde_json::to_value(engine.set_professional_status(id, status).await?)?
        }
        Request::DeleteProfessional { id } => {
            engine.delete_professional(id).await?;
            json!({ "deleted": id })
        }
        Request::AddWindow {
            id,
            professional_id,
            day_of_week,
            start,
            end,
            is_available,
        } => {
            let w = engine
                .add_window(
                    id.unwrap_or_else(Ulid::new),
                    professional_id,
                    day_of_week,
                    clock("start", &start)?,
                    clock("end", &end)?,
                    is_available,
                )
                .await?;
            serde_json::to_value(WindowView::from(&w))?
        }
        Request::RemoveWindow { id } => {
            let professional_id = engine.remove_window(id).await?;
            json!({ "deleted": id, "professional_id": professional_id })
        }
        Request::AddException {
            id,
            professional_id,
            date,
            start,
            end,
        } => {
            let e = engine
                .add_exception(
                    id.unwrap_or_else(Ulid::new),
                    professional_id,
                    date,
                    clock("start", &start)?,
                    clock("end", &end)?,
                )
                .await?;
            serde_json::to_value(ExceptionView::from(&e))?
        }
        Request::RemoveException { id } => {
            let professional_id = engine.remove_exception(id).await?;
            json!({ "deleted": id, "professional_id": professional_id })
        }
        Request::ResolveDay { professional_id, date } => {
            let free = engine.resolve_day(professional_id, date).await?;
            serde_json::to_value(free.iter().map(IntervalView::from).collect::<Vec<_>>())?
        }
        Request::Slots {
            professional_id,
            date,
            duration,
        } => {
            let slots = engine.generate_slots(professional_id, date, duration).await?;
            serde_json::to_value(slots.into_iter().map(format_clock).collect::<Vec<_>>())?
        }
        Request::IsBookable {
            professional_id,
            date,
            start,
            duration,
        } => {
            let start = clock("start", &start)?;
            Value::Bool(engine.is_slot_bookable(professional_id, date, start, duration).await?)
        }
        Request::Book {
            professional_id,
            patient_id,
            date,
            start,
            duration,
        } => {
            let start = clock("start", &start)?;
            let a = engine.book(professional_id, patient_id, date, start, duration).await?;
            serde_json::to_value(AppointmentView::from(&a))?
        }
        Request::AdminBook {
            actor,
            professional_id,
            patient_id,
            date,
            start,
            duration,
            confirmed,
        } => {
            let start = clock("start", &start)?;
            let a = engine
                .admin_book(&actor, professional_id, patient_id, date, start, duration, confirmed)
                .await?;
            serde_json::to_value(AppointmentView::from(&a))?
        }
        Request::Confirm { id, actor } => {
            serde_json::to_value(AppointmentView::from(&engine.confirm(id, &actor).await?))?
        }
        Request::Cancel { id, actor } => {
            serde_json::to_value(AppointmentView::from(&engine.cancel(id, &actor).await?))?
        }
        Request::SetStatus { id, status, actor } => {
            serde_json::to_value(AppointmentView::from(&engine.set_status(id, &status, &actor).await?))?
        }
        Request::GetAppointment { id } => {
            serde_json::to_value(AppointmentView::from(&engine.get_appointment(id).await?))?
        }
        Request::ListAppointments { professional_id, date } => {
            serde_json::to_value(appointments(&engine.list_appointments(professional_id, date).await?))?
        }
        Request::PatientAppointments { patient_id } => {
            serde_json::to_value(appointments(&engine.patient_appointments(patient_id).await))?
        }
        Request::GetProfessional { id } => {
            let p = engine.get_professional(id).await?;
            let windows: Vec<_> = engine.windows(id).await?.iter().map(WindowView::from).collect();
            let exceptions: Vec<_> = engine.exceptions(id).await?.iter().map(ExceptionView::from).collect();
            json!({ "professional": p, "windows": windows, "exceptions": exceptions })
        }
        Request::ListProfessionals => serde_json::to_value(engine.list_professionals().await)?,
        Request::ForgetPatient { patient_id } => {
            json!({ "detached": engine.forget_patient(patient_id).await? })
        }
        ref session @ (Request::Auth { .. } | Request::Subscribe { .. }) => {
            return Err(WireError::BadRequest(format!(
                "{} needs a connection session",
                op_label(session)
            )));
        }
    };
    Ok(value)
}

fn reply_line(result: &Result<Value, WireError>) -> String {
    match result {
        Ok(data) => json!({ "ok": true, "data": data }).to_string(),
        Err(e) => json!({
            "ok": false,
            "error": { "kind": e.kind(), "message": e.to_string() }
        })
        .to_string(),
    }
}

// ── Session ──────────────────────────────────────────────────────

/// Per-connection state: authentication and live subscriptions.
pub struct Session {
    engine: Arc<Engine>,
    password: String,
    authenticated: bool,
    events_tx: mpsc::Sender<LifecycleEvent>,
    subscriptions: HashMap<Ulid, JoinHandle<()>>,
}

impl Session {
    pub fn new(engine: Arc<Engine>, password: String, events_tx: mpsc::Sender<LifecycleEvent>) -> Self {
        Self {
            engine,
            password,
            authenticated: false,
            events_tx,
            subscriptions: HashMap::new(),
        }
    }

    /// Handle one request line. Returns the reply line and whether the
    /// connection should be closed afterwards.
    pub async fn handle_line(&mut self, line: &str) -> (String, bool) {
        let req: Request = match serde_json::from_str(line) {
            Ok(req) => req,
            Err(e) => {
                metrics::counter!(observability::REQUESTS_TOTAL, "op" => "unknown", "status" => "error")
                    .increment(1);
                return (reply_line(&Err(WireError::BadRequest(e.to_string()))), false);
            }
        };

        let op = op_label(&req);
        let started = Instant::now();
        let result = self.handle(req).await;
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(observability::REQUESTS_TOTAL, "op" => op, "status" => status).increment(1);
        metrics::histogram!(observability::REQUEST_DURATION_SECONDS, "op" => op)
            .record(started.elapsed().as_secs_f64());
        if let Err(e) = &result {
            debug!(op, kind = e.kind(), "request failed: {e}");
        }

        let close = matches!(result, Err(WireError::AuthFailed));
        (reply_line(&result), close)
    }

    async fn handle(&mut self, req: Request) -> Result<Value, WireError> {
        match req {
            Request::Auth { password } => {
                if password != self.password {
                    metrics::counter!(observability::AUTH_FAILURES_TOTAL).increment(1);
                    return Err(WireError::AuthFailed);
                }
                self.authenticated = true;
                Ok(json!({ "authenticated": true }))
            }
            _ if !self.authenticated => Err(WireError::AuthRequired),
            Request::Subscribe { professional_id } => self.subscribe(professional_id).await,
            other => dispatch(&self.engine, other).await,
        }
    }

    async fn subscribe(&mut self, professional_id: Ulid) -> Result<Value, WireError> {
        self.engine.get_professional(professional_id).await?;
        if self.subscriptions.contains_key(&professional_id) {
            return Ok(json!({ "subscribed": professional_id }));
        }
        if self.subscriptions.len() >= MAX_SUBSCRIPTIONS_PER_CONNECTION {
            return Err(EngineError::LimitExceeded("too many subscriptions on connection").into());
        }

        let mut rx = self.engine.notify.subscribe(professional_id);
        let tx = self.events_tx.clone();
        let forward = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(professional = %professional_id, skipped, "subscriber lagged, events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        self.subscriptions.insert(professional_id, forward);
        Ok(json!({ "subscribed": professional_id }))
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        for (_, task) in self.subscriptions.drain() {
            task.abort();
        }
    }
}

/// Serve one client: newline-delimited JSON requests in, replies and pushed
/// `{"event":…}` lines out.
pub async fn process_connection(socket: TcpStream, engine: Arc<Engine>, password: String) -> Result<(), WireError> {
    let mut framed = Framed::new(socket, LinesCodec::new_with_max_length(MAX_LINE_LEN));
    let (events_tx, mut events_rx) = mpsc::channel(EVENT_QUEUE);
    let mut session = Session::new(engine, password, events_tx);

    loop {
        tokio::select! {
            line = framed.next() => {
                let line = match line {
                    None => break,
                    Some(Ok(line)) => line,
                    Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                        let err = WireError::Engine(EngineError::LimitExceeded("request line too long"));
                        framed.send(reply_line(&Err(err))).await?;
                        break;
                    }
                    Some(Err(e)) => return Err(e.into()),
                };
                if line.trim().is_empty() {
                    continue;
                }
                let (reply, close) = session.handle_line(&line).await;
                framed.send(reply).await?;
                if close {
                    break;
                }
            }
            Some(event) = events_rx.recv() => {
                let push = json!({ "event": EventView::from(&event) });
                framed.send(push.to_string()).await?;
            }
        }
    }

    Ok(())
}
