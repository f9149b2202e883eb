//! LFS Batch API types.
//!
//! The Batch API is used to request upload/download URLs for LFS objects.
//! See: https://github.com/git-lfs/git-lfs/blob/main/docs/api/batch.md

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::{Oid, Pointer};

/// Actions expiring within this window are treated as already expired.
pub const EXPIRY_MARGIN_SECS: i64 = 30;

/// Operation type for batch requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    /// Download objects from the server.
    Download,
    /// Upload objects to the server.
    Upload,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Download => f.write_str("download"),
            Operation::Upload => f.write_str("upload"),
        }
    }
}

/// An object identity as exchanged with endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectSpec {
    pub oid: Oid,
    pub size: u64,
}

impl ObjectSpec {
    pub fn new(oid: Oid, size: u64) -> Self {
        ObjectSpec { oid, size }
    }

    pub fn hex(&self) -> String {
        self.oid.to_hex()
    }
}

impl From<&Pointer> for ObjectSpec {
    fn from(pointer: &Pointer) -> Self {
        ObjectSpec::new(pointer.oid().clone(), pointer.size())
    }
}

/// A batch request to the LFS server.
#[derive(Debug, Clone, Serialize)]
pub struct BatchRequest {
    /// The operation to perform.
    pub operation: Operation,
    /// The transfer adapters the client supports.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transfers: Option<Vec<String>>,
    /// Reference information (branch, etc).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub r#ref: Option<RefInfo>,
    /// The objects to operate on.
    pub objects: Vec<BatchRequestObject>,
}

/// Reference information for a batch request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefInfo {
    /// The reference name (e.g., "refs/heads/main").
    pub name: String,
}

/// An object in a batch request.
#[derive(Debug, Clone, Serialize)]
pub struct BatchRequestObject {
    /// The SHA256 OID of the object.
    pub oid: String,
    /// The size of the object in bytes.
    pub size: u64,
}

/// A batch response from the LFS server.
#[derive(Debug, Clone, Deserialize)]
pub struct BatchResponse {
    /// The transfer adapter to use (usually "basic").
    #[serde(default = "default_transfer")]
    pub transfer: String,
    /// The objects with their actions.
    pub objects: Vec<BatchObject>,
}

fn default_transfer() -> String {
    "basic".to_string()
}

/// An object in a batch response.
#[derive(Debug, Clone, Deserialize)]
pub struct BatchObject {
    /// The SHA256 OID of the object.
    pub oid: String,
    /// The size of the object in bytes.
    #[serde(default)]
    pub size: u64,
    /// Whether the object was authenticated.
    #[serde(default)]
    pub authenticated: Option<bool>,
    /// Actions available for this object.
    #[serde(default)]
    pub actions: Option<HashMap<String, Action>>,
    /// Error information if the object failed.
    #[serde(default)]
    pub error: Option<BatchError>,
}

/// An action (upload/download URL) for an object.
#[derive(Debug, Clone, Deserialize)]
pub struct Action {
    /// The URL for the action.
    pub href: String,
    /// HTTP headers to include in the request.
    #[serde(default)]
    pub header: HashMap<String, String>,
    /// Seconds until the action expires.
    #[serde(default)]
    pub expires_in: Option<i64>,
    /// Absolute expiration time (ISO 8601).
    #[serde(default)]
    pub expires_at: Option<String>,
}

/// Error information for a batch object.
#[derive(Debug, Clone, Deserialize)]
pub struct BatchError {
    /// HTTP status code.
    pub code: u16,
    /// Error message.
    pub message: String,
}

impl BatchRequest {
    pub fn new(operation: Operation, objects: Vec<BatchRequestObject>) -> Self {
        BatchRequest {
            operation,
            transfers: Some(vec!["basic".to_string()]),
            r#ref: None,
            objects,
        }
    }

    /// Set the reference for this request.
    pub fn with_ref(mut self, name: &str) -> Self {
        self.r#ref = Some(RefInfo {
            name: name.to_string(),
        });
        self
    }
}

impl BatchRequestObject {
    /// Create a new batch request object.
    pub fn new(oid: &str, size: u64) -> Self {
        BatchRequestObject {
            oid: oid.to_string(),
            size,
        }
    }
}

impl From<&ObjectSpec> for BatchRequestObject {
    fn from(spec: &ObjectSpec) -> Self {
        BatchRequestObject::new(&spec.hex(), spec.size)
    }
}

impl BatchObject {
    /// Get the download action if available.
    pub fn download_action(&self) -> Option<&Action> {
        self.actions.as_ref()?.get("download")
    }

    /// Get the upload action if available.
    pub fn upload_action(&self) -> Option<&Action> {
        self.actions.as_ref()?.get("upload")
    }

    /// Get the verify action if available (for uploads).
    pub fn verify_action(&self) -> Option<&Action> {
        self.actions.as_ref()?.get("verify")
    }

    /// Interpret this response entry for the given operation.
    ///
    /// `received_at` anchors relative `expires_in` values.
    pub fn into_transfer_action(
        self,
        operation: Operation,
        received_at: DateTime<Utc>,
    ) -> TransferAction {
        if let Some(err) = &self.error {
            return TransferAction::Rejected {
                oid: self.oid.clone(),
                code: err.code,
                message: err.message.clone(),
            };
        }

        let resolve = |action: &Action| SignedAction::from_wire(action, received_at);
        match operation {
            Operation::Download => match self.download_action() {
                Some(action) => TransferAction::Ready {
                    oid: self.oid.clone(),
                    size: self.size,
                    operation,
                    action: resolve(action),
                    verify: None,
                },
                None => TransferAction::Rejected {
                    oid: self.oid.clone(),
                    code: 404,
                    message: "no download action returned".into(),
                },
            },
            Operation::Upload => {
                let verify = self.verify_action().map(resolve);
                match self.upload_action() {
                    Some(action) => TransferAction::Ready {
                        oid: self.oid.clone(),
                        size: self.size,
                        operation,
                        action: resolve(action),
                        verify,
                    },
                    // No upload action (or verify only) means the server has it.
                    None => TransferAction::Present {
                        oid: self.oid.clone(),
                        size: self.size,
                    },
                }
            }
        }
    }
}

/// A transfer URL with its headers and absolute expiry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedAction {
    pub href: String,
    pub headers: HashMap<String, String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl SignedAction {
    pub fn new(href: impl Into<String>) -> Self {
        SignedAction {
            href: href.into(),
            headers: HashMap::new(),
            expires_at: None,
        }
    }

    fn from_wire(action: &Action, received_at: DateTime<Utc>) -> Self {
        // expires_at wins when both are present; unparseable values are ignored.
        let absolute = action
            .expires_at
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc));
        let relative = action
            .expires_in
            .filter(|secs| *secs > 0)
            .map(|secs| received_at + Duration::seconds(secs));

        SignedAction {
            href: action.href.clone(),
            headers: action.header.clone(),
            expires_at: absolute.or(relative),
        }
    }

    /// Whether the action is (nearly) unusable at `now`.
    pub fn is_stale_at(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(at) => at - Duration::seconds(EXPIRY_MARGIN_SECS) <= now,
            None => false,
        }
    }

    pub fn is_stale(&self) -> bool {
        self.is_stale_at(Utc::now())
    }
}

/// Outcome of a batch request for one object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferAction {
    /// The endpoint handed out a URL for the operation.
    Ready {
        oid: String,
        size: u64,
        operation: Operation,
        action: SignedAction,
        verify: Option<SignedAction>,
    },
    /// Upload not needed: the endpoint already stores the object.
    Present { oid: String, size: u64 },
    /// The endpoint declined to service this object.
    Rejected {
        oid: String,
        code: u16,
        message: String,
    },
}

impl TransferAction {
    pub fn oid(&self) -> &str {
        match self {
            TransferAction::Ready { oid, .. }
            | TransferAction::Present { oid, .. }
            | TransferAction::Rejected { oid, .. } => oid,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, TransferAction::Rejected { code: 404 | 410, .. })
    }

    /// A ready action that can still be used.
    pub fn is_fresh(&self) -> bool {
        match self {
            TransferAction::Ready { action, .. } => !action.is_stale(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> BatchResponse {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_batch_request_serialize() {
        let request = BatchRequest::new(Operation::Upload, vec![BatchRequestObject::new("abc123", 1024)])
            .with_ref("refs/heads/main");

        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains("\"operation\":\"upload\""));
        assert!(json.contains("\"oid\":\"abc123\""));
        assert!(json.contains("\"size\":1024"));
        assert!(json.contains("\"ref\":{\"name\":\"refs/heads/main\"}"));
    }

    #[test]
    fn test_batch_response_deserialize() {
        let response = parse(
            r#"{
            "transfer": "basic",
            "objects": [
                {
                    "oid": "abc123",
                    "size": 1024,
                    "actions": {
                        "upload": {
                            "href": "https://example.com/upload",
                            "header": {
                                "Authorization": "Bearer token"
                            },
                            "expires_in": 3600
                        }
                    }
                }
            ]
        }"#,
        );
        assert_eq!(response.transfer, "basic");
        assert_eq!(response.objects.len(), 1);

        let upload = response.objects[0].upload_action().unwrap();
        assert_eq!(upload.href, "https://example.com/upload");
        assert_eq!(upload.header.get("Authorization").unwrap(), "Bearer token");
    }

    #[test]
    fn test_rejected_object() {
        let response = parse(
            r#"{"objects": [{"oid": "abc123", "size": 1024,
                "error": {"code": 404, "message": "Object not found"}}]}"#,
        );
        assert_eq!(response.objects[0].error.as_ref().map(|e| e.code), Some(404));
        let action = response.objects[0]
            .clone()
            .into_transfer_action(Operation::Download, Utc::now());
        assert!(action.is_not_found());
        assert_eq!(action.oid(), "abc123");
    }

    #[test]
    fn test_upload_without_action_is_present() {
        let response = parse(
            r#"{"objects": [{"oid": "abc123", "size": 5,
                "actions": {"verify": {"href": "https://example.com/verify"}}}]}"#,
        );
        let action = response.objects[0]
            .clone()
            .into_transfer_action(Operation::Upload, Utc::now());
        assert_eq!(
            action,
            TransferAction::Present {
                oid: "abc123".into(),
                size: 5
            }
        );
    }

    #[test]
    fn test_expiry_from_expires_in() {
        let response = parse(
            r#"{"objects": [{"oid": "a", "size": 1, "actions":
                {"download": {"href": "https://x/a", "expires_in": 10}}}]}"#,
        );
        let now = Utc::now();
        let action = response.objects[0]
            .clone()
            .into_transfer_action(Operation::Download, now);
        match action {
            TransferAction::Ready { action, .. } => {
                assert_eq!(action.expires_at, Some(now + Duration::seconds(10)));
                // 10s left is inside the safety margin.
                assert!(action.is_stale_at(now));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_expiry_from_expires_at() {
        let response = parse(
            r#"{"objects": [{"oid": "a", "size": 1, "actions":
                {"download": {"href": "https://x/a",
                              "expires_at": "2030-01-01T00:00:00Z",
                              "expires_in": 5}}}]}"#,
        );
        let now = DateTime::parse_from_rfc3339("2029-12-31T23:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        match response.objects[0].clone().into_transfer_action(Operation::Download, now) {
            TransferAction::Ready { action, .. } => {
                assert!(!action.is_stale_at(now));
                let later = now + Duration::hours(2);
                assert!(action.is_stale_at(later));
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
