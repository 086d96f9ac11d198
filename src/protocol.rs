//! Wire protocol — JSON frames exchanged with remote clients.
//!
//! Every frame is a JSON object with a `type` tag and camelCase fields.
//! Inbound frames optionally carry a `requestId` used for deduplication and
//! response correlation.

use serde::{Deserialize, Serialize};

/// Opaque worker handle assigned by the host environment.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct WorkerId(pub u64);

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Worker availability status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Free,
    Busy,
    Sleeping,
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Free => "free",
            Self::Busy => "busy",
            Self::Sleeping => "sleeping",
        };
        write!(f, "{s}")
    }
}

/// Snapshot of a worker as pushed to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerSnapshot {
    pub worker_id: WorkerId,
    pub label: String,
    pub status: WorkerStatus,
    pub can_accept: bool,
    pub request_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace_link: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_request_id: Option<String>,
}

/// Token usage estimate attached to a successful response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl Usage {
    /// Word-count estimate (~0.75 tokens per word). The precise tokenizer is
    /// an external concern; this matches the original fallback heuristic.
    pub fn estimate(prompt: &str, completion: &str) -> Self {
        let prompt_tokens = estimate_tokens(prompt);
        let completion_tokens = estimate_tokens(completion);
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

fn estimate_tokens(text: &str) -> u64 {
    let words = text.split_whitespace().count() as u64;
    // ceil(words * 0.75) without float arithmetic
    (words * 3).div_ceil(4)
}

/// Classification attached to failure responses and error frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureKind {
    Timeout,
    Truncated,
    NoResponse,
    ProcessingError,
    Conflict,
    NotFound,
    Validation,
    UnknownType,
}

/// Frames received from remote clients.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Inbound {
    Ping {
        #[serde(default)]
        request_id: Option<String>,
    },
    SendPrompt {
        worker_id: WorkerId,
        payload: String,
        request_id: String,
        #[serde(default)]
        is_new_task: bool,
        #[serde(default)]
        workspace_link: Option<String>,
    },
    GetAvailableWorkers {
        request_id: String,
    },
    GetWorkersByWorkspace {
        workspace_link: String,
        request_id: String,
    },
    CleanupWorkspaceLink {
        workspace_link: String,
    },
    UpdateWorkerStatus {
        worker_id: WorkerId,
        status: WorkerStatus,
        #[serde(default)]
        request_id: Option<String>,
        #[serde(default)]
        workspace_link: Option<String>,
    },
    RefreshWorkers,
}

impl Inbound {
    /// Frame types this coordinator understands.
    pub const KNOWN_TYPES: &'static [&'static str] = &[
        "ping",
        "sendPrompt",
        "getAvailableWorkers",
        "getWorkersByWorkspace",
        "cleanupWorkspaceLink",
        "updateWorkerStatus",
        "refreshWorkers",
    ];
}

/// Frames sent to remote clients.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Outbound {
    Pong {
        timestamp: i64,
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    AvailableWorkers {
        request_id: String,
        workers: Vec<WorkerSnapshot>,
        count: usize,
    },
    PromptResponse {
        request_id: String,
        worker_id: WorkerId,
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        response: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error_type: Option<FailureKind>,
        #[serde(skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
    },
    FocusedWorkersUpdate {
        data: Vec<WorkerSnapshot>,
        timestamp: i64,
    },
    WorkerStatusUpdated {
        worker_id: WorkerId,
        status: WorkerStatus,
    },
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        error: String,
        error_type: FailureKind,
    },
}

impl Outbound {
    /// Successful prompt response.
    pub fn prompt_success(
        request_id: impl Into<String>,
        worker_id: WorkerId,
        response: String,
        usage: Usage,
    ) -> Self {
        Self::PromptResponse {
            request_id: request_id.into(),
            worker_id,
            success: true,
            response: Some(response),
            error: None,
            error_type: None,
            usage: Some(usage),
        }
    }

    /// Classified prompt failure.
    pub fn prompt_failure(
        request_id: impl Into<String>,
        worker_id: WorkerId,
        error: impl Into<String>,
        kind: FailureKind,
    ) -> Self {
        Self::PromptResponse {
            request_id: request_id.into(),
            worker_id,
            success: false,
            response: None,
            error: Some(error.into()),
            error_type: Some(kind),
            usage: None,
        }
    }
}
