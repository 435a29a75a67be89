//! The node hierarchy: every path contract of the mount, transport-free.
//!
//! The FUSE adapter (and the test suite) drives this engine through a small
//! path-addressed API: `getattr`, `readdir`, `read`/`write` over open
//! handles, `readlink`, `create`, `unlink`. All methods are re-entrant; no
//! lock is held across a backend call.

mod conversation;
mod messages;
mod models;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use tracing::{debug, warn};

use shellfs_client::CachingClient;
use shellfs_common::model::ModelRecord;

use crate::error::{FsError, Result};
use crate::readme::README_MD;
use crate::state::{ConversationRecord, StateStore};

/// Entry/attr TTL for content that changes under the kernel's feet.
pub(crate) const DYNAMIC_TTL: Duration = Duration::ZERO;
/// Entry/attr TTL for content that never changes once visible.
pub(crate) const STATIC_TTL: Duration = Duration::from_secs(3600);

/// What a path resolves to.
#[derive(Debug, Clone)]
pub(crate) enum Node {
    Root,
    Readme,
    ModelsDir,
    DefaultModelLink,
    ModelDir(ModelRecord),
    ModelIdFile(ModelRecord),
    ModelReadyFile(ModelRecord),
    NewDir,
    CloneFile,
    ConversationRoot,
    /// Backend-id or slug alias, pointing at the owning local id.
    ConversationAlias(String),
    ConvDir(Box<ConversationRecord>),
    CtlFile(Box<ConversationRecord>),
    SendFile(Box<ConversationRecord>),
    IdFile(Box<ConversationRecord>),
    SlugFile(Box<ConversationRecord>),
    FuseIdFile(Box<ConversationRecord>),
    CreatedFile(Box<ConversationRecord>),
    ArchivedFile(Box<ConversationRecord>),
    ModelLink(Box<ConversationRecord>),
    CwdLink(Box<ConversationRecord>),
    MetaNode {
        record: Box<ConversationRecord>,
        rest: Vec<String>,
    },
    MessagesNode {
        record: Box<ConversationRecord>,
        node: messages::MsgNode,
    },
}

/// Node type as exposed to the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Dir,
    File,
    Symlink,
}

/// Attributes plus kernel-cache hints for one node.
#[derive(Debug, Clone)]
pub struct NodeAttr {
    pub kind: NodeKind,
    pub size: u64,
    pub perm: u16,
    pub mtime: SystemTime,
    /// Entry/attr timeout the transport should advertise.
    pub ttl: Duration,
    /// Ask the kernel to bypass the page cache for this file.
    pub direct_io: bool,
    /// Ask the kernel to keep the page cache across opens.
    pub keep_cache: bool,
}

impl NodeAttr {
    pub(crate) fn dir(ttl: Duration, mtime: SystemTime) -> Self {
        Self {
            kind: NodeKind::Dir,
            size: 0,
            perm: 0o755,
            mtime,
            ttl,
            direct_io: false,
            keep_cache: false,
        }
    }

    pub(crate) fn file(size: u64, perm: u16, ttl: Duration, mtime: SystemTime) -> Self {
        Self {
            kind: NodeKind::File,
            size,
            perm,
            mtime,
            ttl,
            direct_io: ttl.is_zero(),
            keep_cache: !ttl.is_zero(),
        }
    }

    pub(crate) fn symlink(target_len: u64, ttl: Duration, mtime: SystemTime) -> Self {
        Self {
            kind: NodeKind::Symlink,
            size: target_len,
            perm: 0o777,
            mtime,
            ttl,
            direct_io: false,
            keep_cache: false,
        }
    }
}

/// One directory listing entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub kind: NodeKind,
}

impl DirEntry {
    pub(crate) fn dir(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: NodeKind::Dir,
        }
    }

    pub(crate) fn file(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: NodeKind::File,
        }
    }

    pub(crate) fn symlink(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: NodeKind::Symlink,
        }
    }
}

/// An open file handle.
enum Handle {
    /// Snapshot taken at open; reads slice it.
    Read(Vec<u8>),
    Write(WriteTarget),
}

#[derive(Debug, Clone)]
enum WriteTarget {
    Ctl(String),
    Send(String),
    /// Writes accepted and ignored (presence files).
    Sink,
}

/// Result of opening a node.
#[derive(Debug, Clone, Copy)]
pub struct OpenHandle {
    pub fh: u64,
    pub direct_io: bool,
    pub keep_cache: bool,
}

/// The filesystem-semantics engine.
pub struct Engine {
    pub(crate) state: StateStore,
    pub(crate) client: CachingClient,
    pub(crate) clone_timeout: Duration,
    pub(crate) start_time: SystemTime,
    handles: Mutex<HashMap<u64, Handle>>,
    next_fh: AtomicU64,
    send_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    pub(crate) msg_memo: Mutex<HashMap<String, (usize, Arc<shellfs_common::MessageList>)>>,
}

impl Engine {
    pub fn new(state: StateStore, client: CachingClient, clone_timeout: Duration) -> Self {
        Self {
            state,
            client,
            clone_timeout,
            start_time: SystemTime::now(),
            handles: Mutex::new(HashMap::new()),
            next_fh: AtomicU64::new(1),
            send_locks: Mutex::new(HashMap::new()),
            msg_memo: Mutex::new(HashMap::new()),
        }
    }

    /// The state store backing this engine.
    pub fn state(&self) -> &StateStore {
        &self.state
    }

    /// Joins a parent path and an entry name.
    pub fn join(parent: &str, name: &str) -> String {
        if parent.is_empty() {
            name.to_string()
        } else {
            format!("{parent}/{name}")
        }
    }

    async fn resolve(&self, path: &str) -> Result<Node> {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        match segments.as_slice() {
            [] => Ok(Node::Root),
            ["README.md"] => Ok(Node::Readme),
            ["new"] => Ok(Node::NewDir),
            ["new", "clone"] => Ok(Node::CloneFile),
            ["models", rest @ ..] => models::resolve(self, rest).await,
            ["conversation", rest @ ..] => conversation::resolve(self, rest).await,
            _ => Err(FsError::NotFound),
        }
    }

    /// Attributes of the node at `path`.
    pub async fn getattr(&self, path: &str) -> Result<NodeAttr> {
        let node = self.resolve(path).await?;
        self.attr(&node).await
    }

    /// Attributes of `name` under `parent`.
    pub async fn lookup(&self, parent: &str, name: &str) -> Result<NodeAttr> {
        self.getattr(&Self::join(parent, name)).await
    }

    async fn attr(&self, node: &Node) -> Result<NodeAttr> {
        let now = self.start_time;
        match node {
            Node::Root | Node::NewDir | Node::ConversationRoot => {
                Ok(NodeAttr::dir(DYNAMIC_TTL, now))
            }
            Node::ModelsDir | Node::ModelDir(_) => Ok(NodeAttr::dir(DYNAMIC_TTL, now)),
            Node::Readme => Ok(NodeAttr::file(
                README_MD.len() as u64,
                0o444,
                STATIC_TTL,
                now,
            )),
            Node::DefaultModelLink => {
                let target = self.readlink_node(node).await?;
                Ok(NodeAttr::symlink(target.len() as u64, DYNAMIC_TTL, now))
            }
            Node::ModelIdFile(model) => Ok(NodeAttr::file(
                (model.id.len() + 1) as u64,
                0o444,
                DYNAMIC_TTL,
                now,
            )),
            Node::ModelReadyFile(_) => Ok(NodeAttr::file(0, 0o444, DYNAMIC_TTL, now)),
            // Every open of `clone` reserves a fresh id, so the size is the
            // fixed id-plus-newline length and the content must never be
            // page-cached.
            Node::CloneFile => Ok(NodeAttr::file(9, 0o444, DYNAMIC_TTL, now)),
            Node::ConversationAlias(local_id) => {
                Ok(NodeAttr::symlink(local_id.len() as u64, DYNAMIC_TTL, now))
            }
            Node::ConvDir(_) => Ok(NodeAttr::dir(DYNAMIC_TTL, now)),
            Node::CtlFile(record) => {
                let content = conversation::ctl_content(record);
                let perm = if record.created { 0o444 } else { 0o644 };
                Ok(NodeAttr::file(content.len() as u64, perm, DYNAMIC_TTL, now))
            }
            Node::SendFile(_) => Ok(NodeAttr::file(0, 0o200, DYNAMIC_TTL, now)),
            Node::IdFile(record) => Ok(NodeAttr::file(
                (record.backend_id.len() + 1) as u64,
                0o444,
                DYNAMIC_TTL,
                now,
            )),
            Node::SlugFile(record) => Ok(NodeAttr::file(
                (record.slug.len() + 1) as u64,
                0o444,
                DYNAMIC_TTL,
                now,
            )),
            Node::FuseIdFile(record) => Ok(NodeAttr::file(
                (record.local_id.len() + 1) as u64,
                0o444,
                DYNAMIC_TTL,
                now,
            )),
            Node::CreatedFile(record) => Ok(NodeAttr::file(
                0,
                0o444,
                DYNAMIC_TTL,
                SystemTime::from(record.local_created_at),
            )),
            Node::ArchivedFile(_) => Ok(NodeAttr::file(0, 0o644, DYNAMIC_TTL, now)),
            Node::ModelLink(record) => Ok(NodeAttr::symlink(
                (format!("../../models/{}", record.model_display_name).len()) as u64,
                DYNAMIC_TTL,
                now,
            )),
            Node::CwdLink(record) => {
                Ok(NodeAttr::symlink(record.cwd.len() as u64, DYNAMIC_TTL, now))
            }
            Node::MetaNode { record, rest } => conversation::meta_attr(self, record, rest),
            Node::MessagesNode { record, node } => messages::attr(self, record, node).await,
        }
    }

    /// Lists the directory at `path`. Backend failures degrade to the
    /// locally known subset; the listing never contains an entry that does
    /// not resolve.
    pub async fn readdir(&self, path: &str) -> Result<Vec<DirEntry>> {
        let node = self.resolve(path).await?;
        match &node {
            Node::Root => Ok(vec![
                DirEntry::file("README.md"),
                DirEntry::dir("conversation"),
                DirEntry::dir("models"),
                DirEntry::dir("new"),
            ]),
            Node::NewDir => Ok(vec![DirEntry::file("clone")]),
            Node::ModelsDir => models::readdir_models(self).await,
            Node::ModelDir(model) => Ok(models::readdir_model(model)),
            Node::ConversationRoot => conversation::readdir_root(self).await,
            Node::ConvDir(record) => conversation::readdir_conversation(self, record).await,
            Node::MetaNode { record, rest } => conversation::meta_readdir(self, record, rest),
            Node::MessagesNode { record, node } => messages::readdir(self, record, node).await,
            _ => Err(FsError::NotPermitted),
        }
    }

    /// The target of the symlink at `path`.
    pub async fn readlink(&self, path: &str) -> Result<String> {
        let node = self.resolve(path).await?;
        self.readlink_node(&node).await
    }

    async fn readlink_node(&self, node: &Node) -> Result<String> {
        match node {
            Node::DefaultModelLink => {
                let catalog = self.client.models().await?;
                catalog
                    .default_name()
                    .map(String::from)
                    .ok_or(FsError::NotFound)
            }
            Node::ConversationAlias(local_id) => Ok(local_id.clone()),
            Node::ModelLink(record) => {
                Ok(format!("../../models/{}", record.model_display_name))
            }
            Node::CwdLink(record) => Ok(record.cwd.clone()),
            Node::MessagesNode { record, node } => messages::readlink(self, record, node).await,
            _ => Err(FsError::Invalid("not a symlink".to_string())),
        }
    }

    /// Full content of a regular file node.
    async fn file_content(&self, node: &Node) -> Result<Vec<u8>> {
        match node {
            Node::Readme => Ok(README_MD.as_bytes().to_vec()),
            Node::ModelIdFile(model) => Ok(format!("{}\n", model.id).into_bytes()),
            Node::ModelReadyFile(_)
            | Node::SendFile(_)
            | Node::CreatedFile(_)
            | Node::ArchivedFile(_) => Ok(Vec::new()),
            Node::CtlFile(record) => Ok(conversation::ctl_content(record).into_bytes()),
            Node::IdFile(record) => Ok(format!("{}\n", record.backend_id).into_bytes()),
            Node::SlugFile(record) => Ok(format!("{}\n", record.slug).into_bytes()),
            Node::FuseIdFile(record) => Ok(format!("{}\n", record.local_id).into_bytes()),
            Node::MetaNode { record, rest } => conversation::meta_content(self, record, rest),
            Node::MessagesNode { record, node } => messages::content(self, record, node).await,
            Node::CloneFile => Err(FsError::Invariant(
                "clone content is reserved at open".to_string(),
            )),
            _ => Err(FsError::NotPermitted),
        }
    }

    fn register(&self, handle: Handle) -> Result<u64> {
        let fh = self.next_fh.fetch_add(1, Ordering::Relaxed);
        self.handles
            .lock()
            .map_err(|_| FsError::Invariant("handle table poisoned".to_string()))?
            .insert(fh, handle);
        Ok(fh)
    }

    /// Opens `path` for reading, snapshotting its content. Opening
    /// `/new/clone` reserves a fresh local id and hands it to this handle's
    /// readers.
    pub async fn open_read(&self, path: &str) -> Result<OpenHandle> {
        let node = self.resolve(path).await?;
        let attr = self.attr(&node).await?;
        if attr.kind != NodeKind::File {
            return Err(FsError::NotPermitted);
        }
        let content = if matches!(node, Node::CloneFile) {
            let local_id = self.state.clone_record()?;
            debug!(local_id, "reserved conversation via clone");
            format!("{local_id}\n").into_bytes()
        } else {
            self.file_content(&node).await?
        };
        let fh = self.register(Handle::Read(content))?;
        Ok(OpenHandle {
            fh,
            direct_io: attr.direct_io,
            keep_cache: attr.keep_cache,
        })
    }

    /// Opens `path` for writing.
    pub async fn open_write(&self, path: &str) -> Result<OpenHandle> {
        let node = self.resolve(path).await?;
        let target = match &node {
            Node::CtlFile(record) => {
                if record.created {
                    return Err(FsError::AlreadyCreated);
                }
                WriteTarget::Ctl(record.local_id.clone())
            }
            Node::SendFile(record) => WriteTarget::Send(record.local_id.clone()),
            Node::ArchivedFile(_) => WriteTarget::Sink,
            _ => return Err(FsError::NotPermitted),
        };
        let fh = self.register(Handle::Write(target))?;
        Ok(OpenHandle {
            fh,
            direct_io: true,
            keep_cache: false,
        })
    }

    /// Reads from an open read handle.
    pub fn read(&self, fh: u64, offset: i64, size: u32) -> Result<Vec<u8>> {
        let handles = self
            .handles
            .lock()
            .map_err(|_| FsError::Invariant("handle table poisoned".to_string()))?;
        let Some(Handle::Read(content)) = handles.get(&fh) else {
            return Err(FsError::NotPermitted);
        };
        let start = usize::try_from(offset.max(0)).unwrap_or(usize::MAX);
        if start >= content.len() {
            return Ok(Vec::new());
        }
        let end = start.saturating_add(size as usize).min(content.len());
        Ok(content[start..end].to_vec())
    }

    /// Writes a payload to an open write handle. Each call carries one
    /// complete command or message.
    pub async fn write(&self, fh: u64, data: &[u8]) -> Result<u32> {
        let target = {
            let handles = self
                .handles
                .lock()
                .map_err(|_| FsError::Invariant("handle table poisoned".to_string()))?;
            match handles.get(&fh) {
                Some(Handle::Write(target)) => target.clone(),
                _ => return Err(FsError::NotPermitted),
            }
        };
        match target {
            WriteTarget::Sink => {}
            WriteTarget::Ctl(local_id) => conversation::ctl_write(self, &local_id, data).await?,
            WriteTarget::Send(local_id) => self.send_write(&local_id, data).await?,
        }
        u32::try_from(data.len()).map_err(|_| FsError::Invalid("oversized write".to_string()))
    }

    /// Closes a handle.
    pub fn release(&self, fh: u64) {
        if let Ok(mut handles) = self.handles.lock() {
            handles.remove(&fh);
        }
    }

    fn send_lock(&self, local_id: &str) -> Result<Arc<tokio::sync::Mutex<()>>> {
        let mut locks = self
            .send_locks
            .lock()
            .map_err(|_| FsError::Invariant("send lock table poisoned".to_string()))?;
        Ok(Arc::clone(
            locks.entry(local_id.to_string()).or_default(),
        ))
    }

    /// The `send` contract: the first successful write creates the
    /// conversation, later writes post follow-ups. Writes to one
    /// conversation are serialized; a failed call leaves the record in its
    /// pre-call state.
    async fn send_write(&self, local_id: &str, data: &[u8]) -> Result<()> {
        let message = String::from_utf8_lossy(data).trim().to_string();
        if message.is_empty() {
            return Ok(());
        }

        let lock = self.send_lock(local_id)?;
        let _guard = lock.lock().await;

        let record = self.state.get(local_id).ok_or(FsError::NotFound)?;
        if record.created {
            self.client
                .send_message(&record.backend_id, &message, &record.model_api_id)
                .await?;
            debug!(local_id, backend_id = %record.backend_id, "sent message");
        } else {
            let started = self
                .client
                .start_conversation(&message, &record.model_api_id, &record.cwd)
                .await?;
            if started.conversation_id.is_empty() {
                return Err(FsError::Invariant(
                    "backend create returned no conversation id".to_string(),
                ));
            }
            self.state
                .mark_created(local_id, &started.conversation_id, &started.slug)?;
            debug!(
                local_id,
                backend_id = %started.conversation_id,
                slug = %started.slug,
                "created conversation"
            );
        }
        Ok(())
    }

    /// Creates `name` under `parent`. The only creatable node is a
    /// conversation's `archived` presence file, which archives it.
    pub async fn create(&self, parent: &str, name: &str) -> Result<(OpenHandle, NodeAttr)> {
        let node = self.resolve(parent).await?;
        let Node::ConvDir(record) = node else {
            return Err(FsError::NotPermitted);
        };
        if name != "archived" {
            return Err(FsError::NotPermitted);
        }
        if !record.created {
            return Err(FsError::NotPermitted);
        }
        self.client.archive(&record.backend_id).await?;
        debug!(local_id = %record.local_id, "archived conversation");
        let fh = self.register(Handle::Write(WriteTarget::Sink))?;
        let attr = NodeAttr::file(0, 0o644, DYNAMIC_TTL, self.start_time);
        Ok((
            OpenHandle {
                fh,
                direct_io: true,
                keep_cache: false,
            },
            attr,
        ))
    }

    /// Unlinks `name` under `parent`. The only removable node is a
    /// conversation's `archived` presence file, which unarchives it; local
    /// records are never deleted this way.
    pub async fn unlink(&self, parent: &str, name: &str) -> Result<()> {
        let node = self.resolve(parent).await?;
        let Node::ConvDir(record) = node else {
            return Err(FsError::NotPermitted);
        };
        if name != "archived" || !record.created {
            return Err(FsError::NotPermitted);
        }
        self.client.unarchive(&record.backend_id).await?;
        debug!(local_id = %record.local_id, "unarchived conversation");
        Ok(())
    }

    pub(crate) fn log_degraded(&self, context: &str, err: &FsError) {
        warn!(context, error = %err, "backend unavailable, serving local state");
    }
}
