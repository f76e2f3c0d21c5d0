//! Typed TraceGuard backend surface over the call gateway.
//!
//! Every method is a thin wrapper: build the request DTO, pick the
//! operation name, let the gateway do tracing, auth and classification.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CallError;
use crate::gateway::{CallGateway, EventStream};
use crate::model::{Entity, EntityKind, Page, ProvenanceRecord, Sbom, UpdateEvent};

/// Operation names (`<package>.<Service>/<Method>`).
pub mod ops {
    pub const LOGIN: &str = "traceguard.v1.AuthService/Login";
    pub const LIST_SBOMS: &str = "traceguard.v1.TraceGuardService/ListSBOMs";
    pub const GET_SBOM: &str = "traceguard.v1.TraceGuardService/GetSBOM";
    pub const CREATE_SBOM: &str = "traceguard.v1.TraceGuardService/CreateSBOM";
    pub const DELETE_SBOM: &str = "traceguard.v1.TraceGuardService/DeleteSBOM";
    pub const LIST_PROVENANCE: &str = "traceguard.v1.TraceGuardService/ListProvenanceRecords";
    pub const GET_PROVENANCE: &str = "traceguard.v1.TraceGuardService/GetProvenance";
    pub const CREATE_PROVENANCE: &str = "traceguard.v1.TraceGuardService/CreateProvenanceRecord";
    pub const VERIFY_PROVENANCE: &str = "traceguard.v1.TraceGuardService/VerifySlsaProvenance";
    pub const GENERATE_COMPLIANCE_REPORT: &str =
        "traceguard.v1.TraceGuardService/GenerateComplianceReport";
    pub const STREAM_UPDATES: &str = "traceguard.v1.TraceGuardService/StreamUpdates";
}

/// Login exchange input.
#[derive(Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

impl LoginRequest {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl std::fmt::Debug for LoginRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoginRequest")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub token: String,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListRequest {
    pub entity_type: EntityKind,
    pub page: u32,
    pub page_size: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdRequest {
    #[serde(rename = "identifier")]
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSbom {
    pub name: String,
    pub format: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewProvenance {
    #[serde(rename = "artifactIdentifier")]
    pub artifact_id: String,
    pub slsa_level: u8,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedResponse {
    #[serde(rename = "identifier")]
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyResponse {
    pub verified: bool,
    #[serde(default)]
    pub reasons: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComplianceReportRequest {
    /// SBOMs to include; empty means all visible to the subject.
    #[serde(default)]
    pub sbom_ids: Vec<String>,
    /// Control framework, e.g. `nist-800-53` or `slsa`.
    pub framework: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComplianceReport {
    #[serde(rename = "identifier")]
    pub id: String,
    pub framework: String,
    pub generated_at: DateTime<Utc>,
    pub summary: String,
    #[serde(default)]
    pub findings: Vec<ComplianceFinding>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComplianceFinding {
    pub control: String,
    pub passed: bool,
    #[serde(default)]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamUpdatesRequest {
    pub subject: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Empty {}

fn list_operation(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Sbom => ops::LIST_SBOMS,
        EntityKind::Provenance => ops::LIST_PROVENANCE,
    }
}

/// TraceGuard API client.
#[derive(Clone)]
pub struct TraceGuardClient {
    gateway: CallGateway,
}

impl TraceGuardClient {
    pub fn new(gateway: CallGateway) -> Self {
        Self { gateway }
    }

    pub fn gateway(&self) -> &CallGateway {
        &self.gateway
    }

    pub async fn login(&self, request: &LoginRequest) -> Result<LoginResponse, CallError> {
        self.gateway.anonymous_call(ops::LOGIN, request).await
    }

    /// Fetch one page (1-based) of any synced entity type.
    pub async fn list<E: Entity>(&self, page: u32, page_size: u32) -> Result<Page<E>, CallError> {
        let request = ListRequest {
            entity_type: E::KIND,
            page,
            page_size,
        };
        self.gateway
            .unary_call(list_operation(E::KIND), &request)
            .await
    }

    pub async fn list_sboms(&self, page: u32, page_size: u32) -> Result<Page<Sbom>, CallError> {
        self.list(page, page_size).await
    }

    pub async fn list_provenance(
        &self,
        page: u32,
        page_size: u32,
    ) -> Result<Page<ProvenanceRecord>, CallError> {
        self.list(page, page_size).await
    }

    pub async fn get_sbom(&self, id: &str) -> Result<Sbom, CallError> {
        self.gateway
            .unary_call(ops::GET_SBOM, &IdRequest { id: id.to_string() })
            .await
    }

    /// Returns the identifier assigned by the backend.
    pub async fn create_sbom(&self, sbom: &NewSbom) -> Result<String, CallError> {
        let created: CreatedResponse = self.gateway.unary_call(ops::CREATE_SBOM, sbom).await?;
        Ok(created.id)
    }

    pub async fn delete_sbom(&self, id: &str) -> Result<(), CallError> {
        let _: Empty = self
            .gateway
            .unary_call(ops::DELETE_SBOM, &IdRequest { id: id.to_string() })
            .await?;
        Ok(())
    }

    pub async fn get_provenance(&self, id: &str) -> Result<ProvenanceRecord, CallError> {
        self.gateway
            .unary_call(ops::GET_PROVENANCE, &IdRequest { id: id.to_string() })
            .await
    }

    pub async fn create_provenance(&self, record: &NewProvenance) -> Result<String, CallError> {
        if record.artifact_id.trim().is_empty() || record.slsa_level == 0 {
            return Err(CallError::validation(
                "provenance needs an artifact identifier and a SLSA level of at least 1",
            ));
        }
        let created: CreatedResponse = self
            .gateway
            .unary_call(ops::CREATE_PROVENANCE, record)
            .await?;
        Ok(created.id)
    }

    pub async fn verify_provenance(&self, id: &str) -> Result<VerifyResponse, CallError> {
        self.gateway
            .unary_call(ops::VERIFY_PROVENANCE, &IdRequest { id: id.to_string() })
            .await
    }

    pub async fn generate_compliance_report(
        &self,
        request: &ComplianceReportRequest,
    ) -> Result<ComplianceReport, CallError> {
        self.gateway
            .unary_call(ops::GENERATE_COMPLIANCE_REPORT, request)
            .await
    }

    /// Open the push-update stream for `subject`.
    pub async fn stream_updates(
        &self,
        subject: &str,
    ) -> Result<EventStream<UpdateEvent>, CallError> {
        let request = StreamUpdatesRequest {
            subject: subject.to_string(),
        };
        self.gateway.stream_call(ops::STREAM_UPDATES, &request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_login_request_debug_redacts_password() {
        let rendered = format!("{:?}", LoginRequest::new("alice", "hunter2"));
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn test_list_request_wire_shape() {
        let value = serde_json::to_value(ListRequest {
            entity_type: EntityKind::Provenance,
            page: 2,
            page_size: 25,
        })
        .unwrap();
        assert_eq!(value["entityType"], "provenance");
        assert_eq!(value["pageSize"], 25);
    }

    #[test]
    fn test_list_operation_per_kind() {
        assert_eq!(list_operation(EntityKind::Sbom), ops::LIST_SBOMS);
        assert_eq!(list_operation(EntityKind::Provenance), ops::LIST_PROVENANCE);
    }
}
