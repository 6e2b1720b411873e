use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Outcome of registering a face with [`record`](crate::FaceCompareClient::record).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitResult {
    /// Subject key the service stored the face under.
    pub user_id: String,
    /// Opaque reference to the stored face data.
    pub face_data: String,
    /// Number of faces registered on the service, when reported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub face_count: Option<u64>,
}

/// Result of comparing one probe image against the registered face.
///
/// Values are passed through from the service unchanged; `is_match` is the
/// service's verdict and is never recomputed client-side.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompareOutcome {
    /// Similarity in [0, 1].
    pub similarity: f64,
    pub is_match: bool,
    /// Confidence in [0, 1].
    pub confidence: f64,
    /// Threshold the service applied (echoed, or the one the client sent).
    pub threshold_used: f64,
}

/// A successful item of a batch comparison, keyed by its input position.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BatchItemOutcome {
    pub index: usize,
    #[serde(flatten)]
    pub outcome: CompareOutcome,
}

/// A failed item of a batch comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchItemFailure {
    pub index: usize,
    pub error: String,
}

/// Partial-failure report for [`compare_batch`](crate::FaceCompareClient::compare_batch).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchCompareReport {
    /// Successful items in input order.
    pub outcomes: Vec<BatchItemOutcome>,
    /// Failed items in input order.
    pub failures: Vec<BatchItemFailure>,
    /// Number of images submitted.
    pub total: usize,
    /// Whether the service's batch endpoint produced this report.
    pub server_side: bool,
}

impl BatchCompareReport {
    pub fn success_count(&self) -> usize {
        self.outcomes.len()
    }

    pub fn error_count(&self) -> usize {
        self.failures.len()
    }

    /// Only the successful outcomes, in input order.
    pub fn into_outcomes(self) -> Vec<CompareOutcome> {
        self.outcomes.into_iter().map(|item| item.outcome).collect()
    }
}

/// Registration record for one subject.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    pub user_id: String,
    pub created_at: String,
    /// Shape of the stored face crop as reported by the service.
    #[serde(default)]
    pub image_size: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserList {
    pub users: Vec<UserInfo>,
    pub total_count: usize,
}

/// Service description returned by `GET {base}/`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemInfo {
    pub status: String,
    #[serde(default)]
    pub service: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub model_status: Option<String>,
    /// Runtime/process stats and any other fields the service adds.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Liveness payload returned by `GET {base}/health`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    pub status: String,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        self.status.eq_ignore_ascii_case("healthy") || self.status.eq_ignore_ascii_case("ok")
    }
}
