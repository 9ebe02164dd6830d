use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type Id = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Creator,
    Approver,
    Viewer,
    Admin,
}

/// The authenticated caller, extracted and verified by the surface layer.
/// The core never reads a role or id from anywhere else.
#[derive(Debug, Clone, Copy)]
pub struct Principal {
    pub user_id: Id,
    pub role: Role,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Id,
    pub username: String,
    pub display_name: String,
    pub role: Role,
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
    Draft,
    Submitted,
    Processing,
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentBatch {
    pub id: Id,
    pub title: String,
    pub status: BatchStatus,
    pub created_at: DateTime<Utc>,
    pub created_by: Id,
    pub submitted_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestStatus {
    Draft,
    Submitted,
    PendingApproval,
    Approved,
    Rejected,
    Paid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityType {
    Vendor,
    Subcontractor,
}

/// The legacy, free-text counterparty shape. Mutually exclusive with
/// `LedgerShape` on any one `PaymentRequest`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LegacyShape {
    pub amount: Decimal,
    pub beneficiary_name: String,
    pub beneficiary_account: String,
    pub purpose: String,
}

/// The ledger-driven counterparty shape: a snapshot of a referenced vendor or
/// subcontractor, taken at creation time so later renames in the ledger don't
/// alter historical records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerShape {
    pub entity_type: EntityType,
    pub vendor_id: Option<Id>,
    pub subcontractor_id: Option<Id>,
    pub site_id: Id,
    pub base_amount: Decimal,
    pub extra_amount: Decimal,
    pub extra_reason: Option<String>,
    pub total_amount: Decimal,
    pub entity_name_snapshot: String,
    pub site_code_snapshot: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RequestShape {
    Legacy(LegacyShape),
    Ledger(LedgerShape),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentRequest {
    pub id: Id,
    pub batch_id: Id,
    pub status: RequestStatus,
    pub currency: String,
    pub shape: RequestShape,
    pub created_at: DateTime<Utc>,
    pub created_by: Id,
    pub updated_at: DateTime<Utc>,
    pub updated_by: Id,
    pub version: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApprovalDecision {
    Approved,
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRecord {
    pub id: Id,
    pub request_id: Id,
    pub approver_id: Id,
    pub decision: ApprovalDecision,
    pub comment: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SoaSource {
    Upload,
    Generated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SoaVersion {
    pub id: Id,
    pub request_id: Id,
    pub version_number: i32,
    pub document_reference: String,
    pub source: SoaSource,
    pub uploaded_at: DateTime<Utc>,
    pub uploaded_by: Option<Id>,
}

/// Reference-data entity returned by the ledger collaborator interface (C9).
#[derive(Debug, Clone)]
pub struct LedgerCounterparty {
    pub id: Id,
    pub display_name: String,
    pub is_active: bool,
}

#[derive(Debug, Clone)]
pub struct LedgerSite {
    pub id: Id,
    pub code: String,
    pub is_active: bool,
}

/// Operation names used for idempotency scoping (§6). Kept as an enum rather
/// than raw strings so a typo can't silently create a new idempotency bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationName {
    CreateBatch,
    CreatePaymentRequest,
    UpdatePaymentRequest,
    SubmitBatch,
    CancelBatch,
    ApprovePaymentRequest,
    RejectPaymentRequest,
    MarkPaymentPaid,
    UploadSoa,
}

impl OperationName {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CreateBatch => "CREATE_BATCH",
            Self::CreatePaymentRequest => "CREATE_PAYMENT_REQUEST",
            Self::UpdatePaymentRequest => "UPDATE_PAYMENT_REQUEST",
            Self::SubmitBatch => "SUBMIT_BATCH",
            Self::CancelBatch => "CANCEL_BATCH",
            Self::ApprovePaymentRequest => "APPROVE_PAYMENT_REQUEST",
            Self::RejectPaymentRequest => "REJECT_PAYMENT_REQUEST",
            Self::MarkPaymentPaid => "MARK_PAYMENT_PAID",
            Self::UploadSoa => "UPLOAD_SOA",
        }
    }
}
