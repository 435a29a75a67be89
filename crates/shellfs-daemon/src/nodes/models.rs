//! The `/models` subtree.

use shellfs_common::model::ModelRecord;

use crate::error::{FsError, Result};
use crate::nodes::{DirEntry, Engine, Node};

/// Resolves a path below `/models`.
pub(crate) async fn resolve(engine: &Engine, rest: &[&str]) -> Result<Node> {
    match rest {
        [] => Ok(Node::ModelsDir),
        ["default"] => {
            let catalog = engine.client.models().await?;
            if catalog.default_name().is_some() {
                Ok(Node::DefaultModelLink)
            } else {
                Err(FsError::NotFound)
            }
        }
        [name, tail @ ..] => {
            let catalog = engine.client.models().await?;
            let model = catalog.by_name(name).cloned().ok_or(FsError::NotFound)?;
            match tail {
                [] => Ok(Node::ModelDir(model)),
                ["id"] => Ok(Node::ModelIdFile(model)),
                ["ready"] => {
                    if model.ready {
                        Ok(Node::ModelReadyFile(model))
                    } else {
                        Err(FsError::NotFound)
                    }
                }
                _ => Err(FsError::NotFound),
            }
        }
    }
}

/// Lists `/models`: one directory per model under its display name, plus the
/// `default` symlink when the backend reports a default.
pub(crate) async fn readdir_models(engine: &Engine) -> Result<Vec<DirEntry>> {
    let catalog = engine.client.models().await?;
    let mut entries = Vec::new();
    if catalog.default_name().is_some() {
        entries.push(DirEntry::symlink("default"));
    }
    let mut seen = std::collections::HashSet::new();
    for model in &catalog.models {
        let name = model.name();
        if name.is_empty() || !seen.insert(name.to_string()) {
            continue;
        }
        entries.push(DirEntry::dir(name));
    }
    Ok(entries)
}

pub(crate) fn readdir_model(model: &ModelRecord) -> Vec<DirEntry> {
    let mut entries = vec![DirEntry::file("id")];
    if model.ready {
        entries.push(DirEntry::file("ready"));
    }
    entries
}
