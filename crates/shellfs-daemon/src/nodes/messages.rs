//! The per-conversation `messages/` subtree: rendered views, one directory
//! per message, and the `last`/`since`/`from` filter trees.

use std::sync::Arc;

use serde_json::Value;
use tracing::warn;

use shellfs_common::message::{Message, MessageList};
use shellfs_common::{render_json, render_markdown};

use crate::error::{FsError, Result};
use crate::jsonfs::{JsonFs, JsonFsConfig, JsonNode, JsonNodeKind};
use crate::nodes::{DYNAMIC_TTL, DirEntry, Engine, NodeAttr, STATIC_TTL};
use crate::state::ConversationRecord;

/// A resolved node below `messages/`.
#[derive(Debug, Clone)]
pub(crate) enum MsgNode {
    Dir,
    AllJson,
    AllMd,
    Count,
    MessageDir(usize),
    Field { index: usize, field: Field },
    ContentMd(usize),
    Data { index: usize, kind: DataKind, rest: Vec<String> },
    LastDir,
    LastN(usize),
    LastEntry { index: usize },
    LastRender { n: usize, fmt: Fmt },
    SinceDir,
    SinceSlug(String),
    SinceN { slug: String, n: usize },
    SinceEntry { index: usize },
    SinceRender { slug: String, n: usize, fmt: Fmt },
    FromDir,
    FromSlug(String),
    FromLink { index: usize },
    FromRender { slug: String, n: usize },
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum Field {
    MessageId,
    ConversationId,
    SequenceId,
    Type,
    CreatedAt,
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum DataKind {
    Llm,
    User,
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum Fmt {
    Md,
    Json,
}

/// Fetches and parses the conversation's messages, short-circuiting to an
/// empty list before backend creation. Parsed lists are memoized against
/// the cache entry's pointer identity, so repeated reads within one cache
/// window parse once.
pub(crate) async fn message_list(
    engine: &Engine,
    record: &ConversationRecord,
) -> Result<Arc<MessageList>> {
    if !record.created || record.backend_id.is_empty() {
        return Ok(Arc::new(MessageList::default()));
    }
    let bytes = match engine.client.get_conversation(&record.backend_id).await {
        Ok(bytes) => bytes,
        Err(e) => {
            if e.is_not_found() {
                warn!(
                    local_id = %record.local_id,
                    backend_id = %record.backend_id,
                    "backend reports conversation gone, dropping record"
                );
                engine.state.force_delete(&record.local_id)?;
                return Err(FsError::NotFound);
            }
            return Err(e.into());
        }
    };

    let ptr = Arc::as_ptr(&bytes) as *const u8 as usize;
    if let Ok(memo) = engine.msg_memo.lock() {
        if let Some((cached_ptr, list)) = memo.get(&record.local_id) {
            if *cached_ptr == ptr {
                return Ok(Arc::clone(list));
            }
        }
    }

    let list = Arc::new(MessageList::parse(&bytes)?);
    if let Ok(mut memo) = engine.msg_memo.lock() {
        memo.insert(record.local_id.clone(), (ptr, Arc::clone(&list)));
    }
    Ok(list)
}

fn dir_name(list: &MessageList, index: usize) -> String {
    format!("{index}-{}", list.slug(index))
}

fn parse_dir_name(list: &MessageList, name: &str) -> Option<usize> {
    let (index_str, slug_part) = name.split_once('-')?;
    let index: usize = index_str.parse().ok()?;
    if index_str != index.to_string() {
        return None;
    }
    (index < list.len() && list.slug(index) == slug_part).then_some(index)
}

fn parse_rank(token: &str) -> Option<usize> {
    let n: usize = token.parse().ok()?;
    (n >= 1 && token == n.to_string()).then_some(n)
}

fn parse_rank_or_render(token: &str) -> Option<(usize, Option<Fmt>)> {
    if let Some(stem) = token.strip_suffix(".md") {
        return parse_rank(stem).map(|n| (n, Some(Fmt::Md)));
    }
    if let Some(stem) = token.strip_suffix(".json") {
        return parse_rank(stem).map(|n| (n, Some(Fmt::Json)));
    }
    parse_rank(token).map(|n| (n, None))
}

/// Resolves a path below `messages/`.
pub(crate) async fn resolve(
    engine: &Engine,
    record: &ConversationRecord,
    rest: &[&str],
) -> Result<MsgNode> {
    match rest {
        [] => Ok(MsgNode::Dir),
        ["all.json"] => Ok(MsgNode::AllJson),
        ["all.md"] => Ok(MsgNode::AllMd),
        ["count"] => Ok(MsgNode::Count),
        ["last", tail @ ..] => resolve_last(engine, record, tail).await,
        ["since", tail @ ..] => resolve_since(engine, record, tail).await,
        ["from", tail @ ..] => resolve_from(engine, record, tail).await,
        [name, tail @ ..] => {
            let list = message_list(engine, record).await?;
            let index = parse_dir_name(&list, name).ok_or(FsError::NotFound)?;
            resolve_message(&list, index, tail)
        }
    }
}

fn resolve_message(list: &MessageList, index: usize, tail: &[&str]) -> Result<MsgNode> {
    let message = &list.messages()[index];
    match tail {
        [] => Ok(MsgNode::MessageDir(index)),
        ["message_id"] => Ok(MsgNode::Field { index, field: Field::MessageId }),
        ["conversation_id"] => Ok(MsgNode::Field { index, field: Field::ConversationId }),
        ["sequence_id"] => Ok(MsgNode::Field { index, field: Field::SequenceId }),
        ["type"] => Ok(MsgNode::Field { index, field: Field::Type }),
        ["created_at"] => Ok(MsgNode::Field { index, field: Field::CreatedAt }),
        ["content.md"] => Ok(MsgNode::ContentMd(index)),
        ["llm_data", more @ ..] => {
            data_value(message, DataKind::Llm).ok_or(FsError::NotFound)?;
            Ok(MsgNode::Data {
                index,
                kind: DataKind::Llm,
                rest: more.iter().map(ToString::to_string).collect(),
            })
        }
        ["user_data", more @ ..] => {
            data_value(message, DataKind::User).ok_or(FsError::NotFound)?;
            Ok(MsgNode::Data {
                index,
                kind: DataKind::User,
                rest: more.iter().map(ToString::to_string).collect(),
            })
        }
        _ => Err(FsError::NotFound),
    }
}

async fn resolve_last(
    engine: &Engine,
    record: &ConversationRecord,
    tail: &[&str],
) -> Result<MsgNode> {
    match tail {
        [] => Ok(MsgNode::LastDir),
        [token] => match parse_rank_or_render(token).ok_or(FsError::NotFound)? {
            (n, None) => Ok(MsgNode::LastN(n)),
            (n, Some(fmt)) => Ok(MsgNode::LastRender { n, fmt }),
        },
        [token, name] => {
            let n = parse_rank(token).ok_or(FsError::NotFound)?;
            let list = message_list(engine, record).await?;
            let index = parse_dir_name(&list, name).ok_or(FsError::NotFound)?;
            if !list.last_range(n).contains(&index) {
                return Err(FsError::NotFound);
            }
            Ok(MsgNode::LastEntry { index })
        }
        _ => Err(FsError::NotFound),
    }
}

async fn resolve_since(
    engine: &Engine,
    record: &ConversationRecord,
    tail: &[&str],
) -> Result<MsgNode> {
    match tail {
        [] => Ok(MsgNode::SinceDir),
        [slug] => {
            let list = message_list(engine, record).await?;
            if list.match_count(slug) == 0 {
                return Err(FsError::NotFound);
            }
            Ok(MsgNode::SinceSlug((*slug).to_string()))
        }
        [slug, token] => {
            let list = message_list(engine, record).await?;
            let (n, fmt) = parse_rank_or_render(token).ok_or(FsError::NotFound)?;
            if list.since_range(slug, n).is_none() {
                return Err(FsError::NotFound);
            }
            match fmt {
                None => Ok(MsgNode::SinceN { slug: (*slug).to_string(), n }),
                Some(fmt) => Ok(MsgNode::SinceRender { slug: (*slug).to_string(), n, fmt }),
            }
        }
        [slug, token, name] => {
            let n = parse_rank(token).ok_or(FsError::NotFound)?;
            let list = message_list(engine, record).await?;
            let range = list.since_range(slug, n).ok_or(FsError::NotFound)?;
            let index = parse_dir_name(&list, name).ok_or(FsError::NotFound)?;
            if !range.contains(&index) {
                return Err(FsError::NotFound);
            }
            Ok(MsgNode::SinceEntry { index })
        }
        _ => Err(FsError::NotFound),
    }
}

async fn resolve_from(
    engine: &Engine,
    record: &ConversationRecord,
    tail: &[&str],
) -> Result<MsgNode> {
    match tail {
        [] => Ok(MsgNode::FromDir),
        [slug] => {
            let list = message_list(engine, record).await?;
            if list.match_count(slug) == 0 {
                return Err(FsError::NotFound);
            }
            Ok(MsgNode::FromSlug((*slug).to_string()))
        }
        [slug, token] => {
            let list = message_list(engine, record).await?;
            match parse_rank_or_render(token).ok_or(FsError::NotFound)? {
                (n, None) => {
                    let index = list.from_index(slug, n).ok_or(FsError::NotFound)?;
                    Ok(MsgNode::FromLink { index })
                }
                (n, Some(Fmt::Md)) => {
                    list.from_index(slug, n).ok_or(FsError::NotFound)?;
                    Ok(MsgNode::FromRender { slug: (*slug).to_string(), n })
                }
                (_, Some(Fmt::Json)) => Err(FsError::NotFound),
            }
        }
        _ => Err(FsError::NotFound),
    }
}

fn data_value(message: &Message, kind: DataKind) -> Option<Value> {
    let raw = match kind {
        DataKind::Llm => message.llm_data.as_deref(),
        DataKind::User => message.user_data.as_deref(),
    }?;
    let value: Value = serde_json::from_str(raw).ok()?;
    (value.is_object() || value.is_array()).then_some(value)
}

fn data_fs(engine: &Engine) -> JsonFs {
    // Message bodies never change once visible; let the kernel cache them.
    JsonFs::new(JsonFsConfig {
        stringify_fields: Vec::new(),
        cache_timeout: STATIC_TTL,
        start_time: engine.start_time,
    })
}

fn data_node(
    engine: &Engine,
    list: &MessageList,
    index: usize,
    kind: DataKind,
    rest: &[String],
) -> Result<JsonNode> {
    let value =
        data_value(&list.messages()[index], kind).ok_or(FsError::NotFound)?;
    let path: Vec<&str> = rest.iter().map(String::as_str).collect();
    data_fs(engine).resolve(&value, &path).ok_or(FsError::NotFound)
}

fn field_content(list: &MessageList, index: usize, field: Field) -> String {
    let message = &list.messages()[index];
    let text = match field {
        Field::MessageId => message.message_id.clone(),
        Field::ConversationId => message.conversation_id.clone(),
        Field::SequenceId => message.sequence_id.to_string(),
        Field::Type => message.message_type.clone(),
        Field::CreatedAt => message.created_at.clone(),
    };
    format!("{text}\n")
}

/// Attributes for a `messages/` node.
pub(crate) async fn attr(
    engine: &Engine,
    record: &ConversationRecord,
    node: &MsgNode,
) -> Result<NodeAttr> {
    let now = engine.start_time;
    match node {
        MsgNode::Dir
        | MsgNode::LastDir
        | MsgNode::LastN(_)
        | MsgNode::SinceDir
        | MsgNode::SinceSlug(_)
        | MsgNode::SinceN { .. }
        | MsgNode::FromDir
        | MsgNode::FromSlug(_) => Ok(NodeAttr::dir(DYNAMIC_TTL, now)),
        MsgNode::MessageDir(_) => Ok(NodeAttr::dir(STATIC_TTL, now)),
        MsgNode::AllJson
        | MsgNode::AllMd
        | MsgNode::Count
        | MsgNode::LastRender { .. }
        | MsgNode::SinceRender { .. }
        | MsgNode::FromRender { .. } => {
            let content = content(engine, record, node).await?;
            Ok(NodeAttr::file(content.len() as u64, 0o444, DYNAMIC_TTL, now))
        }
        MsgNode::Field { .. } | MsgNode::ContentMd(_) => {
            let content = content(engine, record, node).await?;
            Ok(NodeAttr::file(content.len() as u64, 0o444, STATIC_TTL, now))
        }
        MsgNode::Data { index, kind, rest } => {
            let list = message_list(engine, record).await?;
            match data_node(engine, &list, *index, *kind, rest)? {
                JsonNode::Dir(_) => Ok(NodeAttr::dir(STATIC_TTL, now)),
                JsonNode::File(content) => {
                    Ok(NodeAttr::file(content.len() as u64, 0o444, STATIC_TTL, now))
                }
            }
        }
        MsgNode::LastEntry { .. } | MsgNode::SinceEntry { .. } | MsgNode::FromLink { .. } => {
            let target = readlink(engine, record, node).await?;
            Ok(NodeAttr::symlink(target.len() as u64, DYNAMIC_TTL, now))
        }
    }
}

/// Content of a regular file below `messages/`.
pub(crate) async fn content(
    engine: &Engine,
    record: &ConversationRecord,
    node: &MsgNode,
) -> Result<Vec<u8>> {
    let list = message_list(engine, record).await?;
    match node {
        MsgNode::AllJson => Ok(render_json(&list, 0..list.len()).into_bytes()),
        MsgNode::AllMd => Ok(render_markdown(&list, 0..list.len()).into_bytes()),
        MsgNode::Count => Ok(format!("{}\n", list.len()).into_bytes()),
        MsgNode::LastRender { n, fmt } => {
            let range = list.last_range(*n);
            Ok(match fmt {
                Fmt::Md => render_markdown(&list, range),
                Fmt::Json => render_json(&list, range),
            }
            .into_bytes())
        }
        MsgNode::SinceRender { slug, n, fmt } => {
            let range = list.since_range(slug, *n).ok_or(FsError::NotFound)?;
            Ok(match fmt {
                Fmt::Md => render_markdown(&list, range),
                Fmt::Json => render_json(&list, range),
            }
            .into_bytes())
        }
        MsgNode::FromRender { slug, n } => {
            let index = list.from_index(slug, *n).ok_or(FsError::NotFound)?;
            Ok(render_markdown(&list, index..index + 1).into_bytes())
        }
        MsgNode::Field { index, field } => {
            Ok(field_content(&list, *index, *field).into_bytes())
        }
        MsgNode::ContentMd(index) => {
            Ok(render_markdown(&list, *index..index + 1).into_bytes())
        }
        MsgNode::Data { index, kind, rest } => {
            match data_node(engine, &list, *index, *kind, rest)? {
                JsonNode::File(content) => Ok(content.into_bytes()),
                JsonNode::Dir(_) => Err(FsError::NotPermitted),
            }
        }
        _ => Err(FsError::NotPermitted),
    }
}

/// Directory listing of a `messages/` node.
pub(crate) async fn readdir(
    engine: &Engine,
    record: &ConversationRecord,
    node: &MsgNode,
) -> Result<Vec<DirEntry>> {
    let list = message_list(engine, record).await?;
    match node {
        MsgNode::Dir => {
            let mut entries = vec![
                DirEntry::file("all.json"),
                DirEntry::file("all.md"),
                DirEntry::file("count"),
                DirEntry::dir("from"),
                DirEntry::dir("last"),
                DirEntry::dir("since"),
            ];
            for index in 0..list.len() {
                entries.push(DirEntry::dir(dir_name(&list, index)));
            }
            Ok(entries)
        }
        MsgNode::MessageDir(index) => {
            let message = &list.messages()[*index];
            let mut entries = vec![
                DirEntry::file("content.md"),
                DirEntry::file("conversation_id"),
                DirEntry::file("created_at"),
            ];
            if data_value(message, DataKind::Llm).is_some() {
                entries.push(DirEntry::dir("llm_data"));
            }
            entries.push(DirEntry::file("message_id"));
            entries.push(DirEntry::file("sequence_id"));
            entries.push(DirEntry::file("type"));
            if data_value(message, DataKind::User).is_some() {
                entries.push(DirEntry::dir("user_data"));
            }
            Ok(entries)
        }
        MsgNode::LastDir => {
            let mut entries = Vec::new();
            for n in 1..=list.len() {
                entries.push(DirEntry::dir(n.to_string()));
                entries.push(DirEntry::file(format!("{n}.json")));
                entries.push(DirEntry::file(format!("{n}.md")));
            }
            Ok(entries)
        }
        MsgNode::LastN(n) => Ok(list
            .last_range(*n)
            .map(|index| DirEntry::symlink(dir_name(&list, index)))
            .collect()),
        MsgNode::SinceDir | MsgNode::FromDir => Ok(list
            .distinct_slugs()
            .into_iter()
            .map(DirEntry::dir)
            .collect()),
        MsgNode::SinceSlug(slug) => {
            let mut entries = Vec::new();
            for n in 1..=list.match_count(slug) {
                entries.push(DirEntry::dir(n.to_string()));
                entries.push(DirEntry::file(format!("{n}.json")));
                entries.push(DirEntry::file(format!("{n}.md")));
            }
            Ok(entries)
        }
        MsgNode::SinceN { slug, n } => {
            let range = list.since_range(slug, *n).ok_or(FsError::NotFound)?;
            Ok(range
                .map(|index| DirEntry::symlink(dir_name(&list, index)))
                .collect())
        }
        MsgNode::FromSlug(slug) => {
            let mut entries = Vec::new();
            for n in 1..=list.match_count(slug) {
                entries.push(DirEntry::symlink(n.to_string()));
                entries.push(DirEntry::file(format!("{n}.md")));
            }
            Ok(entries)
        }
        MsgNode::Data { index, kind, rest } => {
            match data_node(engine, &list, *index, *kind, rest)? {
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
        _ => Err(FsError::NotPermitted),
    }
}

/// Symlink target of a filter entry.
pub(crate) async fn readlink(
    engine: &Engine,
    record: &ConversationRecord,
    node: &MsgNode,
) -> Result<String> {
    let list = message_list(engine, record).await?;
    match node {
        // last/<n>/<entry> → ../../<entry>
        MsgNode::LastEntry { index } => Ok(format!("../../{}", dir_name(&list, *index))),
        // since/<slug>/<n>/<entry> → ../../../<entry>
        MsgNode::SinceEntry { index } => {
            Ok(format!("../../../{}", dir_name(&list, *index)))
        }
        // from/<slug>/<n> → ../../<entry>
        MsgNode::FromLink { index } => Ok(format!("../../{}", dir_name(&list, *index))),
        _ => Err(FsError::Invalid("not a symlink".to_string())),
    }
}
