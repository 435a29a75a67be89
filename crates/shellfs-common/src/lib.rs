//! # shellfs-common
//!
//! Common types for the shellfs conversation filesystem:
//! - Parsing of the backend's message envelopes and their embedded content items
//! - Per-message slug derivation and the `last`/`since`/`from` filters
//! - JSON and Markdown renderers, including the tool-call/tool-result formatter
//! - Model catalog and conversation summary wire types

pub mod filter;
pub mod message;
pub mod model;
pub mod render;
pub mod summary;

pub use message::{ContentItem, Message, MessageList, ToolMap, ToolUse};
pub use model::{InitPayload, ModelCatalog, ModelRecord};
pub use render::{render_json, render_markdown};
pub use summary::ConversationSummary;
