//! The usage guide served at `/README.md` inside the mount.

pub const README_MD: &str = r#"# shellfs

This mount exposes a conversation backend as a filesystem. Ordinary shell
tools are the user interface; operations are reads and writes to well-named
files.

## Quick start

    id=$(cat new/clone)                      # reserve a conversation
    echo model=claude-opus-4.5 > conversation/$id/ctl
    echo cwd=/src/project     >> conversation/$id/ctl
    echo "explain this build failure" > conversation/$id/send
    cat conversation/$id/messages/all.md

The first write to `send` creates the conversation on the backend; every
later write sends a follow-up message.

## Layout

    models/                    one directory per model, by display name
    models/default             symlink to the default model
    models/<name>/id           the model's API id
    models/<name>/ready        present when the model is ready
    new/clone                  read it to reserve a fresh conversation id
    conversation/<id>/ctl      key=value settings (model, cwd); read-only
                               once the conversation is created
    conversation/<id>/send     write-only message sink
    conversation/<id>/id       backend conversation id
    conversation/<id>/slug     backend-assigned alias
    conversation/<id>/created  present once created
    conversation/<id>/archived present when archived; touch to archive,
                               rm to unarchive
    conversation/<id>/meta/    record fields as a file tree
    conversation/<id>/messages/
        all.md  all.json  count
        <n>-<slug>/            one directory per message
        last/<n>/              symlinks to the last n messages
        last/<n>.md            the same, rendered
        since/<slug>/<n>/      messages after the n-th-from-last <slug>
        from/<slug>/<n>        the n-th-from-last <slug> message itself

`conversation/` also resolves backend ids and slugs as symlinks to the
owning local id.

## Filters

Message slugs are `user`, `agent`, `<tool>-tool` for tool calls, and
`<tool>-result` for tool results, so

    cat conversation/$id/messages/since/user/1.md

prints everything the model did after your latest message.
"#;
