pub mod frame;

use serde::{Deserialize, Serialize};

pub use frame::{Envelope, FrameError, decode, encode};

/// Unique identifier for a group.
pub type GroupId = String;

/// Unique identifier for an interaction inside a group's history.
pub type InteractionId = String;

/// Preamble used when no system prompt is configured.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant.";

/// Cookie a worker presents its shared access key in.
pub const WORKER_ACCESS_COOKIE: &str = "access_key";

/// Maximum size of a single worker WebSocket frame (2 MiB).
pub const MAX_WORKER_FRAME_BYTES: usize = 2 * 1024 * 1024;

// ---------------------------------------------------------------------------
// Shared models
// ---------------------------------------------------------------------------

/// Lifecycle of one prompt/response exchange.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum InteractionStatus {
    #[default]
    Created,
    Queued,
    Processing,
    Completed,
    Failed,
    Aborted,
    Deleted,
}

impl InteractionStatus {
    /// Whether the interaction reached an outcome and will not change on its own.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            InteractionStatus::Completed
                | InteractionStatus::Failed
                | InteractionStatus::Aborted
                | InteractionStatus::Deleted
        )
    }
}

/// One prompt/response exchange. `response` only ever grows while a job runs.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Interaction {
    pub id: InteractionId,
    #[serde(default)]
    pub status: InteractionStatus,
    pub prompt: String,
    #[serde(default)]
    pub response: String,
}

impl Interaction {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            status: InteractionStatus::Created,
            prompt: prompt.into(),
            response: String::new(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum GroupStatus {
    #[default]
    Idle,
    Processing,
}

/// Identity of a group as shown to users.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct GroupCredential {
    pub id: GroupId,
    pub title: String,
}

/// Snapshot of a group pushed to its members.
///
/// `queue_position` is 1-based while the group waits for a worker and 0
/// otherwise. The default value is the neutral snapshot sent to a client that
/// left its group.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct GroupInfos {
    pub credential: GroupCredential,
    pub status: GroupStatus,
    pub queue_position: usize,
}

/// Process-wide connection counts.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Population {
    pub clients: usize,
    pub workers: usize,
    pub groups: usize,
    pub waiting: usize,
}

/// Severity attached to free-text messages.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StatusType {
    Info,
    Warning,
    Error,
    Success,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct MessageModel {
    pub status: StatusType,
    pub text: String,
}

impl MessageModel {
    pub fn new(status: StatusType, text: impl Into<String>) -> Self {
        Self {
            status,
            text: text.into(),
        }
    }

    pub fn info(text: impl Into<String>) -> Self {
        Self::new(StatusType::Info, text)
    }

    pub fn warning(text: impl Into<String>) -> Self {
        Self::new(StatusType::Warning, text)
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self::new(StatusType::Error, text)
    }

    pub fn success(text: impl Into<String>) -> Self {
        Self::new(StatusType::Success, text)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One transcript entry as handed to a worker.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Client <-> broker
// ---------------------------------------------------------------------------

/// Actions a client sends to the broker.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "action", content = "content", rename_all = "snake_case")]
pub enum ClientAction {
    CreateGroup {
        #[serde(default)]
        title: Option<String>,
    },
    JoinGroup {
        group_id: GroupId,
    },
    LeaveGroup,
    DeleteGroup,
    CreateInteraction {
        prompt: String,
    },
    EditInteraction {
        interaction_id: InteractionId,
        prompt: String,
    },
    DeleteInteraction {
        interaction_id: InteractionId,
    },
    AbortInteraction,
}

impl Envelope for ClientAction {
    const ACTIONS: &'static [&'static str] = &[
        "create_group",
        "join_group",
        "leave_group",
        "delete_group",
        "create_interaction",
        "edit_interaction",
        "delete_interaction",
        "abort_interaction",
    ];
}

/// Pushes from the broker to a client.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "action", content = "content", rename_all = "snake_case")]
pub enum ClientEvent {
    Heartbeat,
    Message(MessageModel),
    GroupInfos(GroupInfos),
    Population(Population),
    GroupDirectory(Vec<GroupCredential>),
    Interaction(Interaction),
}

impl Envelope for ClientEvent {
    const ACTIONS: &'static [&'static str] = &[
        "heartbeat",
        "message",
        "group_infos",
        "population",
        "group_directory",
        "interaction",
    ];
}

// ---------------------------------------------------------------------------
// Worker <-> broker
// ---------------------------------------------------------------------------

/// Commands the broker sends to a worker.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "action", content = "content", rename_all = "snake_case")]
pub enum WorkerCommand {
    StartJob { messages: Vec<ChatMessage> },
    AbortRequest,
    Log(MessageModel),
}

impl Envelope for WorkerCommand {
    const ACTIONS: &'static [&'static str] = &["start_job", "abort_request", "log"];
}

/// Events a worker reports while it runs a job.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "action", content = "content", rename_all = "snake_case")]
pub enum WorkerEvent {
    Chunk { text: String },
    EndJob,
    Aborted,
    Error { message: String },
    Log { message: String },
}

impl Envelope for WorkerEvent {
    const ACTIONS: &'static [&'static str] = &["chunk", "end_job", "aborted", "error", "log"];
}
