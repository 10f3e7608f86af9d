use super::branch::visibility;
use crate::models::{Conversation, MessageRecord, VersionKey};
use crate::remote::ContextMessage;

fn is_error_bubble(record: &MessageRecord) -> bool {
    record.is_error || record.text.trim_start().starts_with("Error:")
}

fn render_content(record: &MessageRecord) -> String {
    let mut content = record.text.clone();
    for file in &record.files {
        match &file.content {
            Some(inline) => content.push_str(&format!("\n\n[File: {}]\n{}", file.filename, inline)),
            None => content.push_str(&format!("\n\n[File: {}]", file.filename)),
        }
    }
    content
}

/// Model context for a request: the visible branch before `until` (the
/// message being answered), error bubbles removed, newest `limit` kept.
pub fn build_context(
    conversation: &Conversation,
    until: Option<&VersionKey>,
    limit: usize,
) -> Vec<ContextMessage> {
    let visible = visibility(conversation);
    let mut records = visible.records(conversation);
    if let Some(until) = until {
        if let Some(pos) = records.iter().position(|m| m.id == until.message_id) {
            records.truncate(pos);
        }
    }

    let messages: Vec<ContextMessage> = records
        .into_iter()
        .filter(|m| !is_error_bubble(m))
        .map(|m| ContextMessage {
            role: m.kind.role().to_string(),
            content: render_content(m),
        })
        .collect();

    let skip = messages.len().saturating_sub(limit);
    messages.into_iter().skip(skip).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FileDescriptor;
    use crate::services::branch::{append_user_message, attach_response};

    fn exchange(conv: &mut Conversation, question: &str, answer: &str) -> MessageRecord {
        let user = append_user_message(conv, question, Vec::new()).unwrap();
        let id = conv.id.clone();
        attach_response(conv, MessageRecord::ai(&id, answer, None), &user.id, user.version).unwrap();
        user
    }

    #[test]
    fn test_context_roles_and_limit() {
        let mut conv = Conversation::new("c1", "t");
        for i in 0..8 {
            exchange(&mut conv, &format!("q{}", i), &format!("a{}", i));
        }

        let context = build_context(&conv, None, 10);
        assert_eq!(context.len(), 10);
        assert_eq!(context[0].content, "q3");
        assert_eq!(context[0].role, "user");
        assert_eq!(context[9].content, "a7");
        assert_eq!(context[9].role, "assistant");
    }

    #[test]
    fn test_context_stops_before_current_message_and_drops_errors() {
        let mut conv = Conversation::new("c1", "t");
        exchange(&mut conv, "q0", "a0");

        exchange(&mut conv, "q1", "a1");
        let mut error = MessageRecord::ai("c1", "Please sign in to continue", None);
        error.is_error = true;
        conv.messages.push(error);

        let current = append_user_message(&mut conv, "q2", Vec::new()).unwrap();
        let context = build_context(&conv, Some(&current.key()), 10);
        let texts: Vec<&str> = context.iter().map(|c| c.content.as_str()).collect();
        assert_eq!(texts, vec!["q0", "a0", "q1", "a1"]);
    }

    #[test]
    fn test_inline_files_are_appended() {
        let mut conv = Conversation::new("c1", "t");
        let file = FileDescriptor::inline("f1", "main.rs", "text/x-rust", "fn main() {}".into());
        append_user_message(&mut conv, "review this", vec![file]).unwrap();

        let context = build_context(&conv, None, 10);
        assert_eq!(context[0].content, "review this\n\n[File: main.rs]\nfn main() {}");
    }

    #[test]
    fn test_offloaded_files_leave_a_marker() {
        let mut conv = Conversation::new("c1", "t");
        let mut file = FileDescriptor::inline("f1", "dump.log", "text/plain", "x".into());
        file.content = None;
        append_user_message(&mut conv, "see log", vec![file]).unwrap();

        let context = build_context(&conv, None, 10);
        assert_eq!(context[0].content, "see log\n\n[File: dump.log]");
    }
}
