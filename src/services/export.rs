use crate::models::{Conversation, MessageKind};
use crate::services::view::project;

/// Render the visible branch of a conversation as a markdown document.
pub fn export_to_markdown(conversation: &Conversation) -> String {
    let mut output = format!("# {}\n\n", conversation.topic);
    output.push_str(&format!(
        "> Conversation: {} | Date: {}\n\n",
        conversation.id,
        conversation.timestamp.format("%Y-%m-%d %H:%M")
    ));
    output.push_str("---\n\n");

    if conversation.is_trimmed() {
        output.push_str("_Messages are not stored locally for this conversation._\n");
        return output;
    }

    for view in project(conversation) {
        let role_label = match view.kind {
            MessageKind::User => "You".to_string(),
            MessageKind::Ai => view.model.clone().unwrap_or_else(|| "Assistant".to_string()),
        };
        let version_note = if view.has_other_versions() {
            format!(" (version {} of {})", view.display_version, view.total_versions)
        } else {
            String::new()
        };
        output.push_str(&format!("### {}{}\n\n{}\n\n", role_label, version_note, view.text));

        for file in &view.files {
            output.push_str(&format!("- Attachment: {} ({})\n", file.filename, file.mime_type));
        }
        if !view.files.is_empty() {
            output.push('\n');
        }
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FileDescriptor, MessageRecord};
    use crate::services::branch::{append_user_message, attach_response, record_edit};

    #[test]
    fn test_export_visible_branch() {
        let mut conv = Conversation::new("c1", "Ownership");
        let file = FileDescriptor::inline("f1", "lib.rs", "text/x-rust", "pub fn a() {}".into());
        let user = append_user_message(&mut conv, "old question", vec![file]).unwrap();
        attach_response(
            &mut conv,
            MessageRecord::ai("c1", "old answer", Some("deepseek-r1".into())),
            &user.id,
            1,
        )
        .unwrap();
        record_edit(&mut conv, &user.id, "new question", Vec::new()).unwrap();

        let md = export_to_markdown(&conv);
        assert!(md.starts_with("# Ownership\n\n"));
        assert!(md.contains("### You (version 2 of 2)\n\nnew question"));
        assert!(!md.contains("old answer"));
        assert!(!md.contains("old question"));
    }

    #[test]
    fn test_export_trimmed_conversation() {
        let conv = Conversation::new("c1", "Archived");
        let md = export_to_markdown(&conv);
        assert!(md.contains("not stored locally"));
    }
}
