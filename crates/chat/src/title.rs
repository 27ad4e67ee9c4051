use crate::message::ChatMessage;

/// Decides whether a conversation title refresh should run after a stream
/// completed.
///
/// Fires when the first exchange just finished (exactly one clean user
/// message and one fulfilled bot message), then again on every fifth
/// fulfilled bot message so long conversations amortize title calls.
pub fn should_update_title(messages: &[ChatMessage]) -> bool {
    let user_count = messages
        .iter()
        .filter(|message| message.is_clean_user())
        .count();
    let bot_count = messages
        .iter()
        .filter(|message| message.is_fulfilled_bot())
        .count();

    if user_count == 1 && bot_count == 1 {
        return true;
    }

    bot_count > 0 && bot_count % 5 == 0
}
