//! Domain types: leads, contact attempts, retention sequences, A/B tests.
//!
//! Enums persist as their SCREAMING_CASE names; `as_str` and `FromStr` are the
//! single source of truth for the database representation.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::OutreachError;

/// Generate a new record id.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Implements `as_str`, `Display` and `FromStr` for a fieldless enum.
macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = OutreachError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(OutreachError::Precondition(format!(
                        "unknown {} '{}'",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }
    };
}

// ═══════════════════════════════════════════════════════
// Channels & leads
// ═══════════════════════════════════════════════════════

/// Outreach medium. Each channel has one provider adapter and one queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Channel {
    Call,
    Sms,
    Email,
    Push,
}

string_enum!(Channel {
    Call => "CALL",
    Sms => "SMS",
    Email => "EMAIL",
    Push => "PUSH",
});

impl Channel {
    pub const ALL: [Channel; 4] = [Channel::Sms, Channel::Email, Channel::Call, Channel::Push];

    /// Name of the durable queue backing this channel.
    pub fn queue_name(&self) -> &'static str {
        match self {
            Channel::Sms => "outreach-sms",
            Channel::Email => "outreach-email",
            Channel::Call => "outreach-call",
            Channel::Push => "outreach-push",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LeadStatus {
    New,
    Contacted,
    Qualified,
    Converted,
    Lost,
    DoNotContact,
}

string_enum!(LeadStatus {
    New => "NEW",
    Contacted => "CONTACTED",
    Qualified => "QUALIFIED",
    Converted => "CONVERTED",
    Lost => "LOST",
    DoNotContact => "DO_NOT_CONTACT",
});

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lead {
    pub id: String,
    pub first_name: String,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    /// Push subscription / device token.
    #[serde(default)]
    pub push_token: Option<String>,
    pub status: LeadStatus,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub score: i64,
    pub created_at: DateTime<Utc>,
}

impl Lead {
    pub fn new(first_name: &str) -> Self {
        Self {
            id: new_id(),
            first_name: first_name.to_string(),
            last_name: None,
            email: None,
            phone: None,
            push_token: None,
            status: LeadStatus::New,
            source: None,
            score: 0,
            created_at: Utc::now(),
        }
    }

    pub fn full_name(&self) -> String {
        match &self.last_name {
            Some(last) if !last.is_empty() => format!("{} {}", self.first_name, last),
            _ => self.first_name.clone(),
        }
    }

    /// Check that this lead can be reached on `channel`.
    pub fn check_reachable(&self, channel: Channel) -> Result<(), OutreachError> {
        if self.status == LeadStatus::DoNotContact {
            return Err(OutreachError::Precondition(format!(
                "lead {} is marked DO_NOT_CONTACT",
                self.id
            )));
        }
        let present = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.trim().is_empty());
        let ok = match channel {
            Channel::Email => present(&self.email),
            Channel::Sms | Channel::Call => present(&self.phone),
            Channel::Push => present(&self.push_token),
        };
        if ok {
            Ok(())
        } else {
            let field = match channel {
                Channel::Email => "email",
                Channel::Sms | Channel::Call => "phone",
                Channel::Push => "push token",
            };
            Err(OutreachError::Precondition(format!(
                "lead {} has no {} for {}",
                self.id, field, channel
            )))
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Campaign {
    pub id: String,
    pub name: String,
    /// Free-form campaign metadata forwarded to queue jobs.
    #[serde(default)]
    pub meta: Option<serde_json::Value>,
    /// Campaign id on the bulk email provider.
    #[serde(default)]
    pub instantly_campaign_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Campaign {
    pub fn new(name: &str) -> Self {
        Self {
            id: new_id(),
            name: name.to_string(),
            meta: None,
            instantly_campaign_id: None,
            created_at: Utc::now(),
        }
    }
}

/// Message or call script for one channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Script {
    pub id: String,
    pub name: String,
    pub channel: Channel,
    #[serde(default)]
    pub subject: Option<String>,
    pub content: String,
    /// Email template rendered in place of `content` when present.
    #[serde(default)]
    pub template_id: Option<String>,
    /// VAPI assistant handling calls for this script.
    #[serde(default)]
    pub assistant_id: Option<String>,
    #[serde(default)]
    pub campaign_id: Option<String>,
    /// Default script for (campaign, channel) when the caller names none.
    #[serde(default)]
    pub is_default: bool,
}

impl Script {
    pub fn new(name: &str, channel: Channel, content: &str) -> Self {
        Self {
            id: new_id(),
            name: name.to_string(),
            channel,
            subject: None,
            content: content.to_string(),
            template_id: None,
            assistant_id: None,
            campaign_id: None,
            is_default: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailTemplate {
    pub id: String,
    pub name: String,
    pub subject: String,
    pub html_body: String,
    #[serde(default)]
    pub text_body: Option<String>,
}

// ═══════════════════════════════════════════════════════
// Contact attempts
// ═══════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttemptStatus {
    Pending,
    InProgress,
    Success,
    Failed,
    NoAnswer,
    Bounced,
}

string_enum!(AttemptStatus {
    Pending => "PENDING",
    InProgress => "IN_PROGRESS",
    Success => "SUCCESS",
    Failed => "FAILED",
    NoAnswer => "NO_ANSWER",
    Bounced => "BOUNCED",
});

impl AttemptStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AttemptStatus::Success
                | AttemptStatus::Failed
                | AttemptStatus::NoAnswer
                | AttemptStatus::Bounced
        )
    }
}

/// Structured outcome of an attempt, by channel family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AttemptResult {
    Call {
        #[serde(default)]
        transcript: Option<String>,
        #[serde(default)]
        summary: Option<String>,
        #[serde(default)]
        keywords: Vec<String>,
        #[serde(default)]
        recording_url: Option<String>,
        #[serde(default)]
        outcome: Option<String>,
    },
    Email {
        #[serde(default)]
        opened: bool,
        #[serde(default)]
        clicked: bool,
        #[serde(default)]
        replied: bool,
        #[serde(default)]
        bounced: bool,
    },
    Message {
        #[serde(default)]
        delivered: bool,
        #[serde(default)]
        error_code: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactAttempt {
    pub id: String,
    pub lead_id: String,
    pub channel: Channel,
    pub campaign_id: Option<String>,
    pub script_id: Option<String>,
    pub status: AttemptStatus,
    pub provider: Option<String>,
    pub provider_ref: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_secs: Option<i64>,
    pub cost: Option<f64>,
    pub result: Option<AttemptResult>,
    pub notes: Option<String>,
    pub ab_test_id: Option<String>,
    pub ab_variant: Option<Variant>,
    pub created_at: DateTime<Utc>,
}

impl ContactAttempt {
    /// A fresh PENDING attempt.
    pub fn pending(
        lead_id: &str,
        channel: Channel,
        campaign_id: Option<&str>,
        script_id: Option<&str>,
    ) -> Self {
        Self {
            id: new_id(),
            lead_id: lead_id.to_string(),
            channel,
            campaign_id: campaign_id.map(String::from),
            script_id: script_id.map(String::from),
            status: AttemptStatus::Pending,
            provider: None,
            provider_ref: None,
            started_at: None,
            completed_at: None,
            duration_secs: None,
            cost: None,
            result: None,
            notes: None,
            ab_test_id: None,
            ab_variant: None,
            created_at: Utc::now(),
        }
    }
}

/// A normalized provider callback: "this providerRef reached this status".
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderEvent {
    pub provider_ref: String,
    pub status: AttemptStatus,
    #[serde(default)]
    pub duration_secs: Option<i64>,
    #[serde(default)]
    pub cost: Option<f64>,
    #[serde(default)]
    pub result: Option<AttemptResult>,
    #[serde(default)]
    pub notes: Option<String>,
}

/// Queue job payload, one per enqueued attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelJob {
    pub attempt_id: String,
    pub channel: Channel,
    pub lead_id: String,
    pub script_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub campaign_id: Option<String>,
    /// JSON-encoded campaign metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub campaign_meta: Option<String>,
}

// ═══════════════════════════════════════════════════════
// Retention sequences
// ═══════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SequenceStatus {
    Draft,
    Active,
    Paused,
    Archived,
}

string_enum!(SequenceStatus {
    Draft => "DRAFT",
    Active => "ACTIVE",
    Paused => "PAUSED",
    Archived => "ARCHIVED",
});

impl SequenceStatus {
    pub fn can_transition_to(&self, next: SequenceStatus) -> bool {
        use SequenceStatus::*;
        matches!(
            (self, next),
            (Draft, Active)
                | (Draft, Archived)
                | (Active, Paused)
                | (Active, Archived)
                | (Paused, Active)
                | (Paused, Archived)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DelayUnit {
    Minutes,
    Hours,
    Days,
}

string_enum!(DelayUnit {
    Minutes => "MINUTES",
    Hours => "HOURS",
    Days => "DAYS",
});

impl DelayUnit {
    pub fn duration(&self, value: i64) -> Duration {
        match self {
            DelayUnit::Minutes => Duration::minutes(value),
            DelayUnit::Hours => Duration::hours(value),
            DelayUnit::Days => Duration::days(value),
        }
    }
}

/// What starts an automatic enrollment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerType {
    NewLead,
    NoAnswer,
    EmailBounced,
    Inbound,
    Manual,
}

string_enum!(TriggerType {
    NewLead => "NEW_LEAD",
    NoAnswer => "NO_ANSWER",
    EmailBounced => "EMAIL_BOUNCED",
    Inbound => "INBOUND",
    Manual => "MANUAL",
});

/// Branch condition evaluated immediately before a step is dispatched.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepCondition {
    #[default]
    Always,
    /// Previous step's execution ended in one of these statuses.
    PreviousStepStatus { statuses: Vec<StepExecutionStatus> },
    LeadStatusIs { statuses: Vec<LeadStatus> },
    /// No attempt for this lead succeeded since enrollment.
    NoReply,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequenceStep {
    pub id: String,
    pub sequence_id: String,
    pub step_order: i64,
    pub channel: Channel,
    pub delay_value: i64,
    pub delay_unit: DelayUnit,
    #[serde(default)]
    pub script_id: Option<String>,
    #[serde(default)]
    pub subject: Option<String>,
    /// Inline content used when no script is attached.
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub condition: StepCondition,
}

impl SequenceStep {
    pub fn delay(&self) -> Duration {
        self.delay_unit.duration(self.delay_value)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionSequence {
    pub id: String,
    pub name: String,
    pub status: SequenceStatus,
    #[serde(default)]
    pub campaign_id: Option<String>,
    #[serde(default)]
    pub trigger_type: Option<TriggerType>,
    /// Leave the sequence as CONVERTED when the lead converts.
    #[serde(default = "default_true")]
    pub exit_on_conversion: bool,
    pub created_at: DateTime<Utc>,
    /// Ordered by `step_order`.
    #[serde(default)]
    pub steps: Vec<SequenceStep>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EnrollmentStatus {
    Active,
    Paused,
    Completed,
    Cancelled,
    Converted,
}

string_enum!(EnrollmentStatus {
    Active => "ACTIVE",
    Paused => "PAUSED",
    Completed => "COMPLETED",
    Cancelled => "CANCELLED",
    Converted => "CONVERTED",
});

impl EnrollmentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EnrollmentStatus::Completed | EnrollmentStatus::Cancelled | EnrollmentStatus::Converted
        )
    }

    pub fn can_transition_to(&self, next: EnrollmentStatus) -> bool {
        use EnrollmentStatus::*;
        match (self, next) {
            (Active, Paused) | (Paused, Active) => true,
            (Active, Completed) => true,
            (Active | Paused, Cancelled | Converted) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequenceEnrollment {
    pub id: String,
    pub sequence_id: String,
    pub lead_id: String,
    pub status: EnrollmentStatus,
    /// Number of steps already advanced past; the next step is `steps[current_step]`.
    pub current_step: i64,
    pub enrolled_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_step_at: Option<DateTime<Utc>>,
    pub source: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StepExecutionStatus {
    Scheduled,
    Sent,
    Delivered,
    Failed,
    Skipped,
}

string_enum!(StepExecutionStatus {
    Scheduled => "SCHEDULED",
    Sent => "SENT",
    Delivered => "DELIVERED",
    Failed => "FAILED",
    Skipped => "SKIPPED",
});

impl StepExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepExecutionStatus::Delivered
                | StepExecutionStatus::Failed
                | StepExecutionStatus::Skipped
        )
    }
}

/// Structured result stored on a step execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepExecutionResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recording_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StepExecutionResult {
    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            error: Some(msg.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequenceStepExecution {
    pub id: String,
    pub enrollment_id: String,
    pub step_id: String,
    pub status: StepExecutionStatus,
    pub scheduled_at: DateTime<Utc>,
    pub executed_at: Option<DateTime<Utc>>,
    pub contact_attempt_id: Option<String>,
    pub result: Option<StepExecutionResult>,
}

// ═══════════════════════════════════════════════════════
// A/B tests
// ═══════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Variant {
    A,
    B,
}

string_enum!(Variant {
    A => "A",
    B => "B",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AbTestStatus {
    Running,
    Completed,
}

string_enum!(AbTestStatus {
    Running => "RUNNING",
    Completed => "COMPLETED",
});

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariantStats {
    pub sent: u64,
    pub converted: u64,
}

impl VariantStats {
    pub fn rate(&self) -> f64 {
        if self.sent == 0 {
            0.0
        } else {
            self.converted as f64 / self.sent as f64
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AbTest {
    pub id: String,
    pub campaign_id: String,
    pub channel: Channel,
    /// Script id of variant A.
    pub variant_a: String,
    /// Script id of variant B.
    pub variant_b: String,
    pub status: AbTestStatus,
    pub stats_a: VariantStats,
    pub stats_b: VariantStats,
    pub winner_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl AbTest {
    pub fn new(campaign_id: &str, channel: Channel, variant_a: &str, variant_b: &str) -> Self {
        Self {
            id: new_id(),
            campaign_id: campaign_id.to_string(),
            channel,
            variant_a: variant_a.to_string(),
            variant_b: variant_b.to_string(),
            status: AbTestStatus::Running,
            stats_a: VariantStats::default(),
            stats_b: VariantStats::default(),
            winner_id: None,
            started_at: Utc::now(),
            ended_at: None,
        }
    }

    pub fn script_for(&self, variant: Variant) -> &str {
        match variant {
            Variant::A => &self.variant_a,
            Variant::B => &self.variant_b,
        }
    }
}

// ═══════════════════════════════════════════════════════
// Scheduled contacts
// ═══════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ScheduledContactStatus {
    Pending,
    Done,
    Failed,
}

string_enum!(ScheduledContactStatus {
    Pending => "PENDING",
    Done => "DONE",
    Failed => "FAILED",
});

/// A one-off contact planned for a future time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledContact {
    pub id: String,
    pub lead_id: String,
    pub campaign_id: Option<String>,
    pub channel: Channel,
    pub script_id: Option<String>,
    pub scheduled_at: DateTime<Utc>,
    pub status: ScheduledContactStatus,
    pub attempt_id: Option<String>,
    pub error: Option<String>,
}
