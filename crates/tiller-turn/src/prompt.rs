//! Assembles the prompt sent to the upstream for one turn.
//!
//! Layout, in order: enabled memory entries, the static base prompt, custom
//! instructions under a delimiter header, the user's message, attachment
//! descriptors, and the optional remote-machine descriptor.

use std::path::Path;

use tracing::warn;

use tiller_core::config::INLINE_FILE_CAP_BYTES;
use tiller_core::types::{Attachment, AttachmentKind};
use tiller_store::types::{Machine, MemoryEntry};

const BASE_PROMPT: &str = "You are a coding assistant operating on the user's \
workspace. Work step by step, use your tools when they help, and keep answers \
grounded in what you actually observed.";

pub struct PromptContext<'a> {
    pub content: &'a str,
    pub custom_instructions: &'a str,
    pub memory: &'a [MemoryEntry],
    pub attachments: &'a [Attachment],
    pub machine: Option<&'a Machine>,
    /// Path prefix under which the upstream sees uploaded files.
    pub workspace_path: &'a str,
}

pub fn build_prompt(ctx: &PromptContext) -> String {
    let mut out = String::new();

    if !ctx.memory.is_empty() {
        out.push_str("<user_memory>\n");
        for entry in ctx.memory {
            out.push_str(&format!("{}: {}\n", entry.title, entry.content));
        }
        out.push_str("</user_memory>\n\n");
    }

    out.push_str(BASE_PROMPT);

    if !ctx.custom_instructions.is_empty() {
        out.push_str("\n\n## Custom instructions\n");
        out.push_str(ctx.custom_instructions);
    }

    out.push_str("\n\n");
    out.push_str(ctx.content);

    for attachment in ctx.attachments {
        out.push_str(&describe_attachment(attachment, ctx.workspace_path));
    }

    if let Some(machine) = ctx.machine {
        out.push_str(&format!(
            "\n\n<remote_machine>\nRun commands on the user's selected machine \
             over SSH: {user}@{host}:{port} ({auth} auth).\n</remote_machine>",
            user = machine.username,
            host = machine.host,
            port = machine.port,
            auth = machine.auth_type.as_str(),
        ));
    }

    out
}

/// Render one attachment for the prompt.
///
/// Images go in by workspace path so the agent can open them itself. Text
/// files are inlined while under the size cap; larger ones go by path.
fn describe_attachment(attachment: &Attachment, workspace_path: &str) -> String {
    let visible = Path::new(workspace_path)
        .join(&attachment.filename)
        .to_string_lossy()
        .into_owned();

    match attachment.kind {
        AttachmentKind::Image => format!("\n\n[Attached image: {visible}]"),
        AttachmentKind::File => {
            let inline = std::fs::metadata(&attachment.path)
                .ok()
                .filter(|meta| meta.len() <= INLINE_FILE_CAP_BYTES)
                .and_then(|_| std::fs::read_to_string(&attachment.path).ok());

            match inline {
                Some(contents) => format!(
                    "\n\nAttached file {name}:\n```\n{contents}\n```",
                    name = attachment.filename
                ),
                None => {
                    warn!(path = %attachment.path, "attachment not inlined, passing by path");
                    format!("\n\n[Attached file: {visible}]")
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory(title: &str, content: &str) -> MemoryEntry {
        MemoryEntry {
            id: "m".into(),
            title: title.into(),
            content: content.into(),
            enabled: true,
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    fn bare_context<'a>(content: &'a str, memory: &'a [MemoryEntry]) -> PromptContext<'a> {
        PromptContext {
            content,
            custom_instructions: "",
            memory,
            attachments: &[],
            machine: None,
            workspace_path: "/workspace",
        }
    }

    #[test]
    fn memory_block_prepended_when_entries_exist() {
        let entries = vec![memory("timezone", "UTC+1")];
        let prompt = build_prompt(&bare_context("hello", &entries));
        assert!(prompt.starts_with("<user_memory>\ntimezone: UTC+1\n</user_memory>"));
        assert!(prompt.ends_with("hello"));
    }

    #[test]
    fn no_memory_block_without_entries() {
        let prompt = build_prompt(&bare_context("hello", &[]));
        assert!(!prompt.contains("<user_memory>"));
        assert!(prompt.starts_with(BASE_PROMPT));
    }

    #[test]
    fn custom_instructions_appended_under_header() {
        let mut ctx = bare_context("hello", &[]);
        ctx.custom_instructions = "always answer in French";
        let prompt = build_prompt(&ctx);
        let header = prompt.find("## Custom instructions").unwrap();
        let body = prompt.find("always answer in French").unwrap();
        assert!(header < body);
        assert!(body < prompt.find("hello").unwrap());
    }

    #[test]
    fn image_attachment_goes_in_by_workspace_path() {
        let attachments = vec![Attachment {
            id: "a1".into(),
            filename: "shot.png".into(),
            path: "/srv/uploads/shot.png".into(),
            kind: AttachmentKind::Image,
            mime_type: Some("image/png".into()),
        }];
        let mut ctx = bare_context("look at this", &[]);
        ctx.attachments = &attachments;
        let prompt = build_prompt(&ctx);
        assert!(prompt.contains("[Attached image: /workspace/shot.png]"));
    }

    #[test]
    fn small_text_file_is_inlined() {
        let dir = std::env::temp_dir().join("tiller-prompt-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("notes.txt");
        std::fs::write(&path, "remember the milk").unwrap();

        let attachments = vec![Attachment {
            id: "a1".into(),
            filename: "notes.txt".into(),
            path: path.to_string_lossy().into_owned(),
            kind: AttachmentKind::File,
            mime_type: Some("text/plain".into()),
        }];
        let mut ctx = bare_context("see attached", &[]);
        ctx.attachments = &attachments;
        let prompt = build_prompt(&ctx);
        assert!(prompt.contains("Attached file notes.txt"));
        assert!(prompt.contains("remember the milk"));
    }

    #[test]
    fn missing_file_falls_back_to_path_reference() {
        let attachments = vec![Attachment {
            id: "a1".into(),
            filename: "gone.txt".into(),
            path: "/nonexistent/gone.txt".into(),
            kind: AttachmentKind::File,
            mime_type: None,
        }];
        let mut ctx = bare_context("see attached", &[]);
        ctx.attachments = &attachments;
        let prompt = build_prompt(&ctx);
        assert!(prompt.contains("[Attached file: /workspace/gone.txt]"));
    }

    #[test]
    fn machine_descriptor_included_when_selected() {
        let machine = Machine {
            id: "m1".into(),
            name: "build box".into(),
            description: None,
            host: "10.0.0.5".into(),
            port: 2222,
            username: "ci".into(),
            auth_type: tiller_store::types::AuthType::Key,
            auth_value: String::new(),
            status: None,
            created_at: String::new(),
            updated_at: String::new(),
        };
        let mut ctx = bare_context("deploy it", &[]);
        ctx.machine = Some(&machine);
        let prompt = build_prompt(&ctx);
        assert!(prompt.contains("ci@10.0.0.5:2222"));
        assert!(prompt.contains("key auth"));
    }
}
