//! Persistent row types for the ledger, strategy, policy and audit tables
//! described in the data model. Enum fields are stored as `TEXT` columns;
//! [`text_enum!`] wires up the `sqlx::Type`/`Encode`/`Decode` impls so they
//! bind and decode like any other scalar.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Declares a C-like enum backed by a `TEXT` column: `as_str`/`FromStr`/
/// `Display` plus the three sqlx trait impls needed to `.bind()` and decode
/// it directly, the way the generated columns in this schema are read.
macro_rules! text_enum {
    ($name:ident { $($variant:ident => $repr:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $repr),+
                }
            }
        }

        impl std::str::FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($repr => Ok(Self::$variant),)+
                    other => Err(format!("unknown {}: {other}", stringify!($name))),
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl sqlx::Type<sqlx::Postgres> for $name {
            fn type_info() -> sqlx::postgres::PgTypeInfo {
                <String as sqlx::Type<sqlx::Postgres>>::type_info()
            }
        }

        impl<'r> sqlx::Decode<'r, sqlx::Postgres> for $name {
            fn decode(
                value: sqlx::postgres::PgValueRef<'r>,
            ) -> Result<Self, sqlx::error::BoxDynError> {
                let raw = <&str as sqlx::Decode<sqlx::Postgres>>::decode(value)?;
                raw.parse::<Self>().map_err(Into::into)
            }
        }

        impl<'q> sqlx::Encode<'q, sqlx::Postgres> for $name {
            fn encode_by_ref(
                &self,
                buf: &mut sqlx::postgres::PgArgumentBuffer,
            ) -> Result<sqlx::encode::IsNull, sqlx::error::BoxDynError> {
                <&str as sqlx::Encode<sqlx::Postgres>>::encode_by_ref(&self.as_str(), buf)
            }
        }
    };
}

text_enum!(StrategyKind {
    Periodic => "periodic",
    Single => "single",
});

text_enum!(ExecutionStatus {
    Processing => "processing",
    Completed => "completed",
    Failed => "failed",
});

text_enum!(QuotaStatus {
    Valid => "VALID",
    Expired => "EXPIRED",
});

text_enum!(AuditOperation {
    Recharge => "RECHARGE",
    TransferIn => "TRANSFER_IN",
    TransferOut => "TRANSFER_OUT",
    Expire => "EXPIRE",
    Deduct => "DEDUCT",
    MergeQuota => "MERGE_QUOTA",
});

text_enum!(PolicyKind {
    ModelAllowlist => "model_allowlist",
    StarCheck => "star_check",
    QuotaCheck => "quota_check",
});

text_enum!(PolicyTargetKind {
    User => "user",
    Department => "department",
});

text_enum!(LineStatus {
    Success => "SUCCESS",
    Expired => "EXPIRED",
    Failed => "FAILED",
});

/// A declarative award rule (spec §3 "Strategy").
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Strategy {
    pub id: i64,
    pub name: String,
    pub title: String,
    pub kind: StrategyKind,
    pub amount: i64,
    pub model_label: Option<String>,
    pub cron_expression: Option<String>,
    pub condition: String,
    pub expiry_days: Option<i32>,
    pub enabled: bool,
    pub max_exec_per_user: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Per (strategy, user, batch) attempt record.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ExecutionRecord {
    pub id: Uuid,
    pub strategy_id: i64,
    pub user_id: String,
    pub batch: String,
    pub status: ExecutionStatus,
    pub expiry: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A single credit row, keyed by user and expiry.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct QuotaRow {
    pub id: Uuid,
    pub user_id: String,
    pub amount: i64,
    pub expiry: DateTime<Utc>,
    pub status: QuotaStatus,
}

/// Append-only ledger change log.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct QuotaAudit {
    pub id: Uuid,
    pub user_id: String,
    pub delta: i64,
    pub operation: AuditOperation,
    pub voucher_code: Option<String>,
    pub related_user: Option<String>,
    pub strategy_name: Option<String>,
    pub earliest_expiry: Option<DateTime<Utc>>,
    pub detail: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Proof that a voucher code was redeemed, exactly once.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct VoucherRedemption {
    pub voucher_code: String,
    pub receiver_id: String,
    pub created_at: DateTime<Utc>,
}

/// HR-synced employee-to-department mapping. `department_path` is stored as
/// a Postgres `text[]`, ordered shallow-to-deep.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct EmployeeDepartment {
    pub employee_number: String,
    pub username: String,
    pub department_path: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

/// One policy row for one of {models, star-check, quota-check}, scoped to a
/// user or a department.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PolicyRow {
    pub id: Uuid,
    pub kind: PolicyKind,
    pub target_kind: PolicyTargetKind,
    pub target_id: String,
    pub payload: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

/// Materialized, resolved view of a policy kind for one employee.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct EffectiveView {
    pub employee_number: String,
    pub kind: PolicyKind,
    pub payload: serde_json::Value,
    pub source_policy_id: Option<Uuid>,
    pub updated_at: DateTime<Utc>,
}

/// Snapshot of the Gateway "used" counter, captured just before an expiry
/// pass resets it.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct MonthlyQuotaUsage {
    pub user_id: String,
    pub period: String,
    pub used_quota_value: i64,
    pub record_time: DateTime<Utc>,
}

/// Append-only log of policy changes and sync runs.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PermissionAudit {
    pub id: Uuid,
    pub event_type: String,
    pub employee_number: Option<String>,
    pub detail: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// A row from the read-only auth store (spec §3 "Ownership"): the canonical
/// identity fields the ledger echoes into vouchers. The core never writes
/// this table.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AuthUserProfile {
    pub id: String,
    pub name: String,
    pub phone: Option<String>,
    pub github_id: Option<String>,
    pub starred_projects: String,
    pub employee_number: Option<String>,
}

/// Payload shape for the `model_allowlist` policy kind.
pub fn allowlist_payload(models: &[String]) -> serde_json::Value {
    serde_json::json!(models)
}

/// Payload shape for the `star_check`/`quota_check` toggle policy kinds.
pub fn toggle_payload(enabled: bool) -> serde_json::Value {
    serde_json::json!(enabled)
}

/// `true` when a policy payload counts as "effective" under the resolver's
/// priority rule (spec §4.F): a non-empty allowlist, or any boolean toggle.
pub fn payload_is_effective(kind: PolicyKind, payload: &serde_json::Value) -> bool {
    match kind {
        PolicyKind::ModelAllowlist => payload
            .as_array()
            .map(|models| !models.is_empty())
            .unwrap_or(false),
        PolicyKind::StarCheck | PolicyKind::QuotaCheck => payload.is_boolean(),
    }
}

/// The default payload for a policy kind when nothing resolves.
pub fn default_payload(kind: PolicyKind) -> serde_json::Value {
    match kind {
        PolicyKind::ModelAllowlist => serde_json::json!([] as [String; 0]),
        PolicyKind::StarCheck | PolicyKind::QuotaCheck => serde_json::json!(false),
    }
}
