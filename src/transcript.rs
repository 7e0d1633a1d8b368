use crate::message::Message;

/// Renders a session as `"<Sender>: <text>"` lines joined by `\n`, in session order.
pub fn render_transcript(messages: &[Message]) -> String {
    messages
        .iter()
        .map(|msg| format!("{}: {}", msg.sender.label(), msg.text))
        .collect::<Vec<_>>()
        .join("\n")
}
