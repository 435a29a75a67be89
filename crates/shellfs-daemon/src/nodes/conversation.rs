//! The `/conversation` subtree: per-conversation directories, control
//! files, presence files, symlink aliases, and the `meta/` record view.

use serde_json::{Map, Value};
use tracing::debug;

use shellfs_common::summary::parse_summaries;

use crate::error::{FsError, Result};
use crate::jsonfs::{JsonFs, JsonFsConfig, JsonNode, JsonNodeKind};
use crate::nodes::{DYNAMIC_TTL, DirEntry, Engine, Node, NodeAttr, messages};
use crate::state::ConversationRecord;

/// Resolves a path below `/conversation`.
pub(crate) async fn resolve(engine: &Engine, rest: &[&str]) -> Result<Node> {
    match rest {
        [] => Ok(Node::ConversationRoot),
        [name, tail @ ..] => {
            if let Some(record) = engine.state.get(name) {
                return resolve_in(engine, record, tail).await;
            }
            // Backend ids and slugs resolve as symlink aliases; anything
            // deeper goes through the symlink target.
            if tail.is_empty() {
                if let Some(local_id) = resolve_alias(engine, name).await {
                    return Ok(Node::ConversationAlias(local_id));
                }
            }
            Err(FsError::NotFound)
        }
    }
}

async fn resolve_alias(engine: &Engine, name: &str) -> Option<String> {
    if let Some(record) = engine.state.get_by_backend_id(name) {
        return Some(record.local_id);
    }
    if let Some(record) = engine.state.get_by_slug(name) {
        return Some(record.local_id);
    }
    // First sight of a backend conversation: adopt and retry.
    adopt_from_listings(engine).await;
    engine
        .state
        .get_by_backend_id(name)
        .or_else(|| engine.state.get_by_slug(name))
        .map(|record| record.local_id)
}

async fn resolve_in(
    engine: &Engine,
    record: ConversationRecord,
    tail: &[&str],
) -> Result<Node> {
    let record = Box::new(record);
    match tail {
        [] => Ok(Node::ConvDir(record)),
        ["ctl"] => Ok(Node::CtlFile(record)),
        ["send"] => Ok(Node::SendFile(record)),
        ["fuse_id"] => Ok(Node::FuseIdFile(record)),
        ["id"] => {
            if record.backend_id.is_empty() {
                Err(FsError::NotFound)
            } else {
                Ok(Node::IdFile(record))
            }
        }
        ["slug"] => {
            if record.slug.is_empty() {
                Err(FsError::NotFound)
            } else {
                Ok(Node::SlugFile(record))
            }
        }
        ["created"] => {
            if record.created {
                Ok(Node::CreatedFile(record))
            } else {
                Err(FsError::NotFound)
            }
        }
        ["archived"] => {
            if !record.created {
                return Err(FsError::NotFound);
            }
            match engine.client.is_archived(&record.backend_id).await {
                Ok(true) => Ok(Node::ArchivedFile(record)),
                Ok(false) => Err(FsError::NotFound),
                Err(e) => {
                    engine.log_degraded("is_archived", &FsError::from(e));
                    Err(FsError::NotFound)
                }
            }
        }
        ["model"] => {
            if record.model_display_name.is_empty() {
                Err(FsError::NotFound)
            } else {
                Ok(Node::ModelLink(record))
            }
        }
        ["cwd"] => {
            if record.cwd.is_empty() {
                Err(FsError::NotFound)
            } else {
                Ok(Node::CwdLink(record))
            }
        }
        ["meta", more @ ..] => Ok(Node::MetaNode {
            rest: more.iter().map(ToString::to_string).collect(),
            record,
        }),
        ["messages", more @ ..] => {
            let node = messages::resolve(engine, &record, more).await?;
            Ok(Node::MessagesNode { record, node })
        }
        _ => Err(FsError::NotFound),
    }
}

/// Adopts every backend conversation not yet known locally, from both the
/// active and the archived listings. Listing failures degrade silently to
/// the locally known set.
pub(crate) async fn adopt_from_listings(engine: &Engine) {
    let mut summaries = Vec::new();
    match engine.client.list_conversations().await {
        Ok(bytes) => summaries.extend(parse_summaries(&bytes)),
        Err(e) => engine.log_degraded("list_conversations", &FsError::from(e)),
    }
    match engine.client.list_archived().await {
        Ok(bytes) => summaries.extend(parse_summaries(&bytes)),
        Err(e) => engine.log_degraded("list_archived", &FsError::from(e)),
    }
    for summary in summaries {
        if summary.id.is_empty() {
            continue;
        }
        if let Err(e) = engine.state.adopt(
            &summary.id,
            &summary.slug,
            &summary.created_at,
            &summary.updated_at,
            &summary.model,
            &summary.cwd,
        ) {
            engine.log_degraded("adopt", &e);
        }
    }
}

/// Lists `/conversation`: every persisted local id, after garbage-collecting
/// abandoned clones and adopting unknown backend conversations.
pub(crate) async fn readdir_root(engine: &Engine) -> Result<Vec<DirEntry>> {
    match engine.state.gc_stale_clones(engine.clone_timeout) {
        Ok(removed) if !removed.is_empty() => {
            debug!(count = removed.len(), "garbage-collected stale clones");
        }
        Ok(_) => {}
        Err(e) => engine.log_degraded("gc_stale_clones", &e),
    }
    adopt_from_listings(engine).await;
    Ok(engine.state.list().into_iter().map(DirEntry::dir).collect())
}

/// Lists one conversation directory. Presence files appear only in the
/// states that define them; the archived probe degrades to absent when the
/// backend is unreachable.
pub(crate) async fn readdir_conversation(
    engine: &Engine,
    record: &ConversationRecord,
) -> Result<Vec<DirEntry>> {
    let mut entries = Vec::new();
    if record.created {
        match engine.client.is_archived(&record.backend_id).await {
            Ok(true) => entries.push(DirEntry::file("archived")),
            Ok(false) => {}
            Err(e) => engine.log_degraded("is_archived", &FsError::from(e)),
        }
        entries.push(DirEntry::file("created"));
    }
    entries.push(DirEntry::file("ctl"));
    if !record.cwd.is_empty() {
        entries.push(DirEntry::symlink("cwd"));
    }
    entries.push(DirEntry::file("fuse_id"));
    if !record.backend_id.is_empty() {
        entries.push(DirEntry::file("id"));
    }
    entries.push(DirEntry::dir("messages"));
    entries.push(DirEntry::dir("meta"));
    if !record.model_display_name.is_empty() {
        entries.push(DirEntry::symlink("model"));
    }
    entries.push(DirEntry::file("send"));
    if !record.slug.is_empty() {
        entries.push(DirEntry::file("slug"));
    }
    Ok(entries)
}

/// The canonical `ctl` read form.
pub(crate) fn ctl_content(record: &ConversationRecord) -> String {
    format!(
        "model={} cwd={}\n",
        record.model_display_name, record.cwd
    )
}

/// Applies a `ctl` write: whitespace-separated `key=value` tokens. A model
/// token resolves as a display name first, then as an id; unknown names are
/// stored verbatim.
pub(crate) async fn ctl_write(engine: &Engine, local_id: &str, data: &[u8]) -> Result<()> {
    let record = engine.state.get(local_id).ok_or(FsError::NotFound)?;
    if record.created {
        return Err(FsError::AlreadyCreated);
    }
    let text = String::from_utf8_lossy(data);
    for token in text.split_whitespace() {
        let (key, value) = token
            .split_once('=')
            .ok_or_else(|| FsError::Invalid(format!("expected key=value, got {token}")))?;
        match key {
            "model" => {
                let catalog = engine.client.models().await?;
                let (display_name, api_id) = catalog.resolve(value);
                engine.state.set_model(local_id, &display_name, &api_id)?;
            }
            "cwd" => engine.state.set_ctl(local_id, "cwd", value)?,
            other => return Err(FsError::Invalid(format!("unknown ctl key: {other}"))),
        }
    }
    Ok(())
}

fn meta_fs(engine: &Engine) -> JsonFs {
    JsonFs::new(JsonFsConfig {
        stringify_fields: Vec::new(),
        cache_timeout: DYNAMIC_TTL,
        start_time: engine.start_time,
    })
}

/// The record fields as a JSON value; empty fields are omitted.
fn meta_value(record: &ConversationRecord) -> Value {
    let mut map = Map::new();
    map.insert("local_id".to_string(), record.local_id.clone().into());
    if !record.backend_id.is_empty() {
        map.insert(
            "conversation_id".to_string(),
            record.backend_id.clone().into(),
        );
    }
    if !record.slug.is_empty() {
        map.insert("slug".to_string(), record.slug.clone().into());
    }
    if !record.model_display_name.is_empty() {
        map.insert(
            "model".to_string(),
            record.model_display_name.clone().into(),
        );
    }
    if !record.cwd.is_empty() {
        map.insert("cwd".to_string(), record.cwd.clone().into());
    }
    map.insert("created".to_string(), record.created.into());
    map.insert(
        "local_created_at".to_string(),
        record.local_created_at.to_rfc3339().into(),
    );
    if !record.api_created_at.is_empty() {
        map.insert(
            "api_created_at".to_string(),
            record.api_created_at.clone().into(),
        );
    }
    if !record.api_updated_at.is_empty() {
        map.insert(
            "api_updated_at".to_string(),
            record.api_updated_at.clone().into(),
        );
    }
    Value::Object(map)
}

fn meta_node(engine: &Engine, record: &ConversationRecord, rest: &[String]) -> Result<JsonNode> {
    let path: Vec<&str> = rest.iter().map(String::as_str).collect();
    meta_fs(engine)
        .resolve(&meta_value(record), &path)
        .ok_or(FsError::NotFound)
}

pub(crate) fn meta_attr(
    engine: &Engine,
    record: &ConversationRecord,
    rest: &[String],
) -> Result<NodeAttr> {
    match meta_node(engine, record, rest)? {
        JsonNode::Dir(_) => Ok(NodeAttr::dir(DYNAMIC_TTL, engine.start_time)),
        JsonNode::File(content) => Ok(NodeAttr::file(
            content.len() as u64,
            0o444,
            DYNAMIC_TTL,
            engine.start_time,
        )),
    }
}

pub(crate) fn meta_readdir(
    engine: &Engine,
    record: &ConversationRecord,
    rest: &[String],
) -> Result<Vec<DirEntry>> {
    match meta_node(engine, record, rest)? {
        JsonNode::Dir(entries) => Ok(entries
            .into_iter()
            .map(|(name, kind)| match kind {
                JsonNodeKind::Dir => DirEntry::dir(name),
                JsonNodeKind::File => DirEntry::file(name),
            })
            .collect()),
        JsonNode::File(_) => Err(FsError::NotPermitted),
    }
}

pub(crate) fn meta_content(
    engine: &Engine,
    record: &ConversationRecord,
    rest: &[String],
) -> Result<Vec<u8>> {
    match meta_node(engine, record, rest)? {
        JsonNode::File(content) => Ok(content.into_bytes()),
        JsonNode::Dir(_) => Err(FsError::NotPermitted),
    }
}
