//! Wire protocol between the vbox gateway and editor clients.
//!
//! Every frame on the collaboration socket is a JSON object tagged with a
//! `type` field. Clients send [`ClientMessage`] frames; the server answers
//! with [`ServerEvent`] frames, replying to a request by echoing its
//! `requestId` inside [`ServerEvent::Reply`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// File tree
// ============================================================================

/// A node in a virtualbox file tree.
///
/// `id` is the full object key (`projects/<projectId>/<relative/path>`),
/// `name` is the last path segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum FileNode {
    File {
        id: String,
        name: String,
    },
    Folder {
        id: String,
        name: String,
        children: Vec<FileNode>,
    },
}

impl FileNode {
    pub fn id(&self) -> &str {
        match self {
            FileNode::File { id, .. } | FileNode::Folder { id, .. } => id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            FileNode::File { name, .. } | FileNode::Folder { name, .. } => name,
        }
    }

    pub fn is_folder(&self) -> bool {
        matches!(self, FileNode::Folder { .. })
    }

    /// Children of a folder; empty for files.
    pub fn children(&self) -> &[FileNode] {
        match self {
            FileNode::Folder { children, .. } => children,
            FileNode::File { .. } => &[],
        }
    }

    /// Find a node anywhere below (and including) this one.
    pub fn find(&self, id: &str) -> Option<&FileNode> {
        if self.id() == id {
            return Some(self);
        }
        self.children().iter().find_map(|child| child.find(id))
    }

    /// Collect the ids of every file below (and including) this node.
    pub fn file_ids(&self, out: &mut Vec<String>) {
        match self {
            FileNode::File { id, .. } => out.push(id.clone()),
            FileNode::Folder { children, .. } => {
                for child in children {
                    child.file_ids(out);
                }
            }
        }
    }
}

/// Find a node in a forest by id.
pub fn find_node<'a>(forest: &'a [FileNode], id: &str) -> Option<&'a FileNode> {
    forest.iter().find_map(|node| node.find(id))
}

// ============================================================================
// Client -> Server
// ============================================================================

/// A frame sent by the editor client.
///
/// `requestId` is optional; when present, the server answers with a
/// [`ServerEvent::Reply`] carrying the same id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<u64>,
    #[serde(flatten)]
    pub command: ClientCommand,
}

/// Named operations a client can invoke.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientCommand {
    // ========== Files ==========
    GetFile {
        file_id: String,
    },
    SaveFile {
        file_id: String,
        body: String,
    },
    CreateFile {
        name: String,
    },
    CreateFolder {
        name: String,
    },
    DeleteFile {
        file_id: String,
    },
    DeleteFolder {
        folder_id: String,
    },
    RenameFile {
        file_id: String,
        new_name: String,
    },
    RenameFolder {
        old_folder_id: String,
        new_folder_id: String,
    },
    MoveFile {
        file_id: String,
        folder_id: String,
    },
    GetFolder {
        folder_id: String,
    },

    // ========== Terminals ==========
    CreateTerminal {
        id: String,
    },
    CloseTerminal {
        id: String,
    },
    TerminalData {
        id: String,
        data: String,
    },
    TerminalResize {
        id: String,
        cols: u16,
        rows: u16,
    },
    ResizeTerminal {
        cols: u16,
        rows: u16,
    },

    // ========== AI ==========
    GenerateCode {
        file_name: String,
        code: String,
        line: u32,
        instructions: String,
    },

    /// Answer to a server ping.
    Pong,
}

impl ClientCommand {
    /// Operation name as it appears on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            ClientCommand::GetFile { .. } => "getFile",
            ClientCommand::SaveFile { .. } => "saveFile",
            ClientCommand::CreateFile { .. } => "createFile",
            ClientCommand::CreateFolder { .. } => "createFolder",
            ClientCommand::DeleteFile { .. } => "deleteFile",
            ClientCommand::DeleteFolder { .. } => "deleteFolder",
            ClientCommand::RenameFile { .. } => "renameFile",
            ClientCommand::RenameFolder { .. } => "renameFolder",
            ClientCommand::MoveFile { .. } => "moveFile",
            ClientCommand::GetFolder { .. } => "getFolder",
            ClientCommand::CreateTerminal { .. } => "createTerminal",
            ClientCommand::CloseTerminal { .. } => "closeTerminal",
            ClientCommand::TerminalData { .. } => "terminalData",
            ClientCommand::TerminalResize { .. } => "terminalResize",
            ClientCommand::ResizeTerminal { .. } => "resizeTerminal",
            ClientCommand::GenerateCode { .. } => "generateCode",
            ClientCommand::Pong => "pong",
        }
    }
}

// ============================================================================
// Server -> Client
// ============================================================================

/// Frames pushed by the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    /// Initial file tree after hydration.
    Loaded { files: Vec<FileNode> },

    /// Completion of a client request.
    Reply { request_id: u64, result: Reply },

    /// A mutating operation was refused by a rate budget.
    RateLimit { message: String },

    /// The connection is now read-only.
    DisableAccess { message: String },

    /// The project owner left; terminals were torn down.
    OwnerDisconnected,

    /// A newer connection for the same user and project replaced this one.
    ForceDisconnect { message: String },

    /// Output chunk from a terminal.
    TerminalResponse { id: String, data: String },

    /// A terminal process exited.
    TerminalExit {
        id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<u32>,
    },

    /// Heartbeat.
    Ping,

    /// Malformed frame or unexpected failure.
    Error { message: String },
}

/// Reply payloads, tagged by `kind`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Reply {
    /// File contents, `None` when the file is unknown.
    Content { content: Option<String> },
    /// Updated tree.
    Tree { files: Vec<FileNode> },
    /// Plain success flag, optionally with the updated tree.
    Ack {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        files: Option<Vec<FileNode>>,
    },
    /// File ids contained in a folder.
    Ids { ids: Vec<String> },
    /// Whether a terminal was created.
    Terminal { created: bool },
    /// AI response forwarded verbatim.
    Generated { data: Value },
    /// The request was refused.
    Rejected {
        reason: RejectReason,
        message: String,
    },
}

impl Reply {
    pub fn rejected(reason: RejectReason, message: impl Into<String>) -> Self {
        Reply::Rejected {
            reason,
            message: message.into(),
        }
    }
}

/// Why a request was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RejectReason {
    RateLimited,
    QuotaExceeded,
    FileTooLarge,
    AccessDisabled,
    NotFound,
    AlreadyExists,
    InvalidRequest,
    TerminalLimit,
    Unavailable,
    Internal,
}
