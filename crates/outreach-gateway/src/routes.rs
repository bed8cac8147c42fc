//! API route handlers for the gateway.
//!
//! Every handler answers with a JSON body. Failures carry
//! `{"ok": false, "error": ...}` and a status picked from the error kind:
//! caller faults are 4xx, upstream provider faults are 502.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use chrono::{DateTime, Utc};
use outreach_core::error::{OutreachError, Result};
use outreach_core::traits::{OutboundMessage, SendContext};
use outreach_core::types::{
    AbTest, Channel, DelayUnit, Lead, ProviderEvent, RetentionSequence, SequenceStatus, SequenceStep,
    StepCondition, TriggerType, new_id,
};
use outreach_engine::{CRON_LOCK, ContactRequest, spawn_detached};
use outreach_store::Store;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::str::FromStr;
use std::sync::Arc;

use crate::server::AppState;

pub type ApiResponse = (StatusCode, Json<Value>);

fn status_for(e: &OutreachError) -> StatusCode {
    match e {
        OutreachError::NotFound(_) => StatusCode::NOT_FOUND,
        OutreachError::InvalidTransition(_) | OutreachError::LockHeld(_) => StatusCode::CONFLICT,
        OutreachError::Precondition(_) | OutreachError::Serialization(_) | OutreachError::Config(_) => {
            StatusCode::BAD_REQUEST
        }
        OutreachError::Provider(_) | OutreachError::Transient(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn fail(e: OutreachError) -> ApiResponse {
    let status = status_for(&e);
    if status.is_server_error() {
        tracing::error!("❌ Request failed: {e}");
    } else {
        tracing::debug!("Request rejected ({status}): {e}");
    }
    (status, Json(json!({"ok": false, "error": e.to_string()})))
}

fn reply<T: Serialize>(status: StatusCode, value: T) -> ApiResponse {
    match serde_json::to_value(value) {
        Ok(body) => (status, Json(body)),
        Err(e) => fail(e.into()),
    }
}

fn respond<T: Serialize>(result: Result<T>) -> ApiResponse {
    match result {
        Ok(value) => reply(StatusCode::OK, value),
        Err(e) => fail(e),
    }
}

fn parse_channel(raw: &str) -> Result<Channel> {
    Channel::from_str(&raw.to_ascii_uppercase())
}

// ─── Health & cron ────────────────────────────────────────────

pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "outreach-gateway",
        "version": env!("CARGO_PKG_VERSION"),
        "uptimeSecs": state.start_time.elapsed().as_secs(),
        "channels": state.engine.dispatcher.adapters().channels(),
    }))
}

#[derive(Debug, Default, Deserialize)]
pub struct CronQuery {
    pub secret: Option<String>,
}

/// `GET|POST /cron/run?secret=` or header `x-cron-secret`.
pub async fn cron_run(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CronQuery>,
    headers: HeaderMap,
) -> ApiResponse {
    let provided = query.secret.or_else(|| {
        headers
            .get("x-cron-secret")
            .and_then(|v| v.to_str().ok())
            .map(String::from)
    });
    let authorized = match (&state.engine.config.cron.secret, provided) {
        (Some(expected), Some(given)) => !expected.is_empty() && *expected == given,
        _ => false,
    };
    if !authorized {
        tracing::warn!("🔒 Cron trigger rejected: bad or missing secret");
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"ok": false, "error": "Unauthorized"})),
        );
    }

    match state.engine.cron.run().await {
        Ok(report) => reply(StatusCode::OK, report),
        Err(OutreachError::LockHeld(_)) => (
            StatusCode::CONFLICT,
            Json(json!({"ok": false, "error": "Cron already running"})),
        ),
        Err(e) => fail(e),
    }
}

pub async fn cron_lock(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "name": CRON_LOCK,
        "lock": state.engine.cron.lock_info(),
    }))
}

// ─── Webhooks ─────────────────────────────────────────────────

/// Normalized provider callback. Unknown refs and repeats answer 200 so the
/// provider stops redelivering.
pub async fn provider_status(State(state): State<Arc<AppState>>, Json(event): Json<ProviderEvent>) -> ApiResponse {
    respond(state.engine.events.apply(&event).await)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundLead {
    pub first_name: String,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub push_token: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    /// Contact the lead on this channel right away.
    #[serde(default)]
    pub channel: Option<Channel>,
    #[serde(default)]
    pub campaign_id: Option<String>,
}

/// Store an inbound lead, then enroll and optionally contact it in the
/// background.
pub async fn inbound_lead(State(state): State<Arc<AppState>>, Json(body): Json<InboundLead>) -> ApiResponse {
    if body.first_name.trim().is_empty() {
        return fail(OutreachError::Precondition("firstName is required".into()));
    }
    let mut lead = Lead::new(body.first_name.trim());
    lead.last_name = body.last_name;
    lead.email = body.email;
    lead.phone = body.phone;
    lead.push_token = body.push_token;
    lead.source = body.source;
    if lead.email.is_none() && lead.phone.is_none() && lead.push_token.is_none() {
        return fail(OutreachError::Precondition(
            "one of email, phone or pushToken is required".into(),
        ));
    }
    if let Err(e) = state.engine.store.insert_lead(&lead) {
        return fail(e);
    }
    tracing::info!("📥 Inbound lead {} from {}", lead.id, lead.source.as_deref().unwrap_or("-"));

    let engine = state.engine.clone();
    let lead_id = lead.id.clone();
    spawn_detached(
        engine.store.clone(),
        "inbound-enroll",
        Some(format!("lead={lead_id}")),
        async move {
            engine
                .enrollments
                .auto_enroll_by_trigger(&lead_id, TriggerType::Inbound, Some("inbound"))?;
            Ok(())
        },
    );
    if let Some(channel) = body.channel {
        let engine = state.engine.clone();
        let req = ContactRequest::new(&lead.id, channel).campaign(body.campaign_id.as_deref());
        spawn_detached(
            engine.store.clone(),
            "inbound-route",
            Some(format!("lead={} channel={channel}", lead.id)),
            async move {
                engine.router.route_contact(&req).await?;
                Ok(())
            },
        );
    }

    reply(StatusCode::CREATED, json!({"ok": true, "leadId": lead.id}))
}

pub async fn convert_lead(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResponse {
    respond(state.engine.events.convert_lead(&id, Utc::now()))
}

// ─── Contacts ─────────────────────────────────────────────────

pub async fn route_contact(State(state): State<Arc<AppState>>, Json(req): Json<ContactRequest>) -> ApiResponse {
    respond(state.engine.router.route_contact(&req).await)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleRequest {
    pub lead_id: String,
    pub channel: Channel,
    pub at: DateTime<Utc>,
    #[serde(default)]
    pub campaign_id: Option<String>,
    #[serde(default)]
    pub script_id: Option<String>,
}

pub async fn schedule_contact(State(state): State<Arc<AppState>>, Json(req): Json<ScheduleRequest>) -> ApiResponse {
    match state.engine.scheduled.schedule(
        &req.lead_id,
        req.channel,
        req.at,
        req.campaign_id.as_deref(),
        req.script_id.as_deref(),
    ) {
        Ok(contact) => reply(StatusCode::CREATED, contact),
        Err(e) => fail(e),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestSend {
    pub channel: Channel,
    /// Phone number, email address or push token, depending on channel.
    pub to: String,
    #[serde(default)]
    pub subject: Option<String>,
    pub content: String,
    #[serde(default)]
    pub first_name: Option<String>,
}

/// Send one message straight through the channel adapter, with no attempt
/// bookkeeping. 400 for bad input or a missing integration, 502 when the
/// provider fails.
pub async fn send_test(State(state): State<Arc<AppState>>, Json(body): Json<TestSend>) -> ApiResponse {
    let mut lead = Lead::new(body.first_name.as_deref().unwrap_or("Test"));
    match body.channel {
        Channel::Email => lead.email = Some(body.to.clone()),
        Channel::Sms | Channel::Call => lead.phone = Some(body.to.clone()),
        Channel::Push => lead.push_token = Some(body.to.clone()),
    }
    if let Err(e) = lead.check_reachable(body.channel) {
        return send_failure(e);
    }
    if body.content.trim().is_empty() {
        return send_failure(OutreachError::Precondition("content is required".into()));
    }
    let Some(adapter) = state.engine.dispatcher.adapters().get(body.channel) else {
        return send_failure(OutreachError::Config(format!(
            "no active integration for {}",
            body.channel
        )));
    };

    let message = OutboundMessage {
        subject: body.subject,
        ..OutboundMessage::text(&body.content)
    };
    match adapter.send(&lead, &message, &SendContext::default()).await {
        Ok(receipt) => {
            tracing::info!("🧪 Test {} sent via {} ({})", body.channel, receipt.provider, receipt.provider_ref);
            reply(
                StatusCode::OK,
                json!({"success": true, "provider": receipt.provider, "providerRef": receipt.provider_ref}),
            )
        }
        Err(e) => send_failure(e),
    }
}

fn send_failure(e: OutreachError) -> ApiResponse {
    let status = if e.is_client_fault() || matches!(e, OutreachError::Config(_)) {
        StatusCode::BAD_REQUEST
    } else {
        StatusCode::BAD_GATEWAY
    };
    tracing::warn!("🧪 Test send failed ({status}): {e}");
    (status, Json(json!({"success": false, "error": e.to_string()})))
}

pub async fn test_integration(State(state): State<Arc<AppState>>, Path(channel): Path<String>) -> ApiResponse {
    let channel = match parse_channel(&channel) {
        Ok(c) => c,
        Err(e) => return fail(e),
    };
    let Some(adapter) = state.engine.dispatcher.adapters().get(channel) else {
        return fail(OutreachError::NotFound(format!("no active integration for {channel}")));
    };
    let check = adapter.test_connection().await;
    reply(
        StatusCode::OK,
        json!({"channel": channel, "provider": adapter.provider(), "ok": check.ok, "error": check.error}),
    )
}

// ─── Sequences & enrollments ──────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewStep {
    pub channel: Channel,
    #[serde(default)]
    pub delay_value: i64,
    #[serde(default = "default_delay_unit")]
    pub delay_unit: DelayUnit,
    #[serde(default)]
    pub script_id: Option<String>,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub condition: StepCondition,
}

fn default_delay_unit() -> DelayUnit {
    DelayUnit::Hours
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSequence {
    pub name: String,
    #[serde(default)]
    pub campaign_id: Option<String>,
    #[serde(default)]
    pub trigger_type: Option<TriggerType>,
    #[serde(default = "default_true")]
    pub exit_on_conversion: bool,
    #[serde(default)]
    pub steps: Vec<NewStep>,
}

impl NewSequence {
    fn into_sequence(self) -> RetentionSequence {
        let id = new_id();
        let steps = self
            .steps
            .into_iter()
            .enumerate()
            .map(|(order, s)| SequenceStep {
                id: new_id(),
                sequence_id: id.clone(),
                step_order: order as i64,
                channel: s.channel,
                delay_value: s.delay_value,
                delay_unit: s.delay_unit,
                script_id: s.script_id,
                subject: s.subject,
                content: s.content,
                condition: s.condition,
            })
            .collect();
        RetentionSequence {
            id,
            name: self.name,
            status: SequenceStatus::Draft,
            campaign_id: self.campaign_id,
            trigger_type: self.trigger_type,
            exit_on_conversion: self.exit_on_conversion,
            created_at: Utc::now(),
            steps,
        }
    }
}

pub async fn create_sequence(State(state): State<Arc<AppState>>, Json(body): Json<NewSequence>) -> ApiResponse {
    match state.engine.enrollments.create_sequence(body.into_sequence()) {
        Ok(sequence) => reply(StatusCode::CREATED, sequence),
        Err(e) => fail(e),
    }
}

pub async fn get_sequence(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResponse {
    respond(
        state
            .engine
            .store
            .get_sequence(&id)
            .and_then(|s| s.ok_or_else(|| OutreachError::NotFound(format!("sequence {id}")))),
    )
}

pub async fn sequence_action(
    State(state): State<Arc<AppState>>,
    Path((id, action)): Path<(String, String)>,
) -> ApiResponse {
    let api = &state.engine.enrollments;
    respond(match action.as_str() {
        "activate" => api.activate_sequence(&id),
        "pause" => api.pause_sequence(&id),
        "archive" => api.archive_sequence(&id),
        other => Err(OutreachError::NotFound(format!("sequence action '{other}'"))),
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrollRequest {
    pub lead_id: String,
    #[serde(default)]
    pub source: Option<String>,
}

pub async fn enroll_lead(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<EnrollRequest>,
) -> ApiResponse {
    match state
        .engine
        .enrollments
        .enroll_lead(&id, &body.lead_id, body.source.as_deref().or(Some("api")))
    {
        Ok(outcome) if outcome.created => reply(StatusCode::CREATED, outcome),
        Ok(outcome) => reply(StatusCode::OK, outcome),
        Err(e) => fail(e),
    }
}

pub async fn enrollment_action(
    State(state): State<Arc<AppState>>,
    Path((id, action)): Path<(String, String)>,
) -> ApiResponse {
    let api = &state.engine.enrollments;
    let now = Utc::now();
    respond(match action.as_str() {
        "pause" => api.pause_enrollment(&id, now),
        "resume" => api.resume_enrollment(&id, now),
        "cancel" => api.cancel_enrollment(&id, now),
        other => Err(OutreachError::NotFound(format!("enrollment action '{other}'"))),
    })
}

// ─── A/B tests ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewAbTest {
    pub campaign_id: String,
    pub channel: Channel,
    pub variant_a: String,
    pub variant_b: String,
}

fn register_ab_test(store: &Store, body: &NewAbTest) -> Result<AbTest> {
    if store.get_campaign(&body.campaign_id)?.is_none() {
        return Err(OutreachError::NotFound(format!("campaign {}", body.campaign_id)));
    }
    for script_id in [&body.variant_a, &body.variant_b] {
        if store.get_script(script_id)?.is_none() {
            return Err(OutreachError::Precondition(format!("script {script_id} not found")));
        }
    }
    if store.running_ab_test(&body.campaign_id, body.channel)?.is_some() {
        return Err(OutreachError::InvalidTransition(format!(
            "campaign {} already runs a {} test",
            body.campaign_id, body.channel
        )));
    }
    let test = AbTest::new(&body.campaign_id, body.channel, &body.variant_a, &body.variant_b);
    store.insert_ab_test(&test)?;
    Ok(test)
}

/// Start a RUNNING test; both variants must be stored scripts.
pub async fn create_ab_test(State(state): State<Arc<AppState>>, Json(body): Json<NewAbTest>) -> ApiResponse {
    match register_ab_test(&state.engine.store, &body) {
        Ok(test) => {
            tracing::info!("🧪 A/B test {} started on {}", test.id, test.channel);
            reply(StatusCode::CREATED, test)
        }
        Err(e) => fail(e),
    }
}

pub async fn evaluate_ab_test(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResponse {
    respond(state.engine.ab.evaluate_test(&id))
}

pub async fn auto_end_ab_test(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResponse {
    respond(
        state
            .engine
            .ab
            .auto_end_test(&id, Utc::now())
            .map(|ended| json!({"ended": ended})),
    )
}

// ─── Operations ───────────────────────────────────────────────

pub async fn queue_stats(State(state): State<Arc<AppState>>) -> Json<Value> {
    let queue = &state.engine.queue;
    let consumers = state.workers.as_ref().map(|w| w.stats()).unwrap_or_default();
    Json(json!({
        "backendAvailable": queue.is_backend_available().await,
        "queues": queue.stats().await,
        "consumers": consumers,
    }))
}

#[derive(Debug, Default, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<usize>,
}

pub async fn dead_letters(State(state): State<Arc<AppState>>, Query(q): Query<LimitQuery>) -> ApiResponse {
    respond(state.engine.store.dead_letters(q.limit.unwrap_or(50).min(500)))
}
