//! Posting collaborator: turns a new link into a channel post.
//!
//! Supports:
//! - Telegram channel posts with vote buttons
//! - Dry-run logging when no bot token is configured
//! - Long-poll loop that counts votes and keeps the buttons current
//! - Operator alerts to an admin chat

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::providers::SharedRng;
use crate::telegram::{
    escape_html, CallbackQuery, InlineKeyboardButton, InlineKeyboardMarkup, TelegramClient,
};
use crate::votes::{random_emoji_pair, Tally, Vote, VoteCallback, VoteLedger, VoteResult};

#[async_trait]
pub trait Announcer: Send + Sync {
    fn name(&self) -> &'static str;

    async fn announce(&self, link: &str) -> anyhow::Result<()>;
}

/// Logs the post instead of sending it.
pub struct LogAnnouncer;

#[async_trait]
impl Announcer for LogAnnouncer {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn announce(&self, link: &str) -> anyhow::Result<()> {
        info!("📣 [dry run] New link: {}", link);
        Ok(())
    }
}

/// Where operator alerts go.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn alert(&self, text: &str) -> anyhow::Result<()>;
}

/// Plain-text alerts to an admin chat.
pub struct TelegramAlerts {
    client: Arc<TelegramClient>,
    chat_id: String,
}

impl TelegramAlerts {
    pub fn new(client: Arc<TelegramClient>, chat_id: String) -> Self {
        Self { client, chat_id }
    }
}

#[async_trait]
impl AlertSink for TelegramAlerts {
    async fn alert(&self, text: &str) -> anyhow::Result<()> {
        self.client
            .send_message(&self.chat_id, &escape_html(text), None)
            .await?;
        Ok(())
    }
}

pub fn format_post(link: &str, good: &str) -> String {
    let link = escape_html(link);
    format!(
        "{good} <b>New Canva Pro Team Link:</b>\n\
         <a href=\"{link}\">{link}</a>\n\n\
         🔔 <i>Unmute for instant access!</i>\n\n\
         <code>React below to help others know if it works!</code>"
    )
}

pub fn vote_keyboard(tally: &Tally) -> InlineKeyboardMarkup {
    InlineKeyboardMarkup {
        inline_keyboard: vec![vec![
            InlineKeyboardButton::callback(
                format!("{} Working ({})", tally.good, tally.working),
                VoteCallback::encode(Vote::Working, &tally.good, &tally.bad),
            ),
            InlineKeyboardButton::callback(
                format!("{} Not Working ({})", tally.bad, tally.not_working),
                VoteCallback::encode(Vote::NotWorking, &tally.good, &tally.bad),
            ),
        ]],
    }
}

pub struct TelegramAnnouncer {
    client: Arc<TelegramClient>,
    chat_id: String,
    votes: Arc<Mutex<VoteLedger>>,
    rng: SharedRng,
}

impl TelegramAnnouncer {
    pub fn new(
        client: Arc<TelegramClient>,
        chat_id: String,
        votes: Arc<Mutex<VoteLedger>>,
        rng: SharedRng,
    ) -> Self {
        Self {
            client,
            chat_id,
            votes,
            rng,
        }
    }
}

#[async_trait]
impl Announcer for TelegramAnnouncer {
    fn name(&self) -> &'static str {
        "telegram"
    }

    async fn announce(&self, link: &str) -> anyhow::Result<()> {
        let (good, bad) = match self.rng.lock() {
            Ok(mut rng) => random_emoji_pair(&mut *rng),
            Err(_) => ("🟢", "🔴"),
        };
        let fresh = Tally {
            working: 0,
            not_working: 0,
            good: good.to_string(),
            bad: bad.to_string(),
        };

        let sent = self
            .client
            .send_message(&self.chat_id, &format_post(link, good), Some(&vote_keyboard(&fresh)))
            .await?;
        if let Ok(mut ledger) = self.votes.lock() {
            ledger.register(sent.message_id, good, bad);
        }
        info!("📣 Posted link to {} (message {})", self.chat_id, sent.message_id);
        Ok(())
    }
}

// ============================================================================
// Vote handling
// ============================================================================

/// What to send back for one button press.
#[derive(Debug, PartialEq)]
pub struct VoteReply {
    pub text: &'static str,
    pub show_alert: bool,
    /// New keyboard and the (chat, message) it belongs to.
    pub refresh: Option<(i64, i64, InlineKeyboardMarkup)>,
}

/// Apply a callback query to the ledger. `None` for callbacks that are not votes.
pub fn apply_vote(ledger: &Mutex<VoteLedger>, query: &CallbackQuery) -> Option<VoteReply> {
    let callback = VoteCallback::parse(query.data.as_deref()?)?;
    let message = query.message.as_ref()?;

    let result = {
        let mut ledger = ledger.lock().ok()?;
        ledger.vote(message.message_id, query.from.id, &callback)
    };

    let reply = match result {
        VoteResult::Counted(tally) => {
            let (text, show_alert) = match callback.vote {
                Vote::Working => ("Thanks for your feedback!", false),
                Vote::NotWorking => ("Thanks for reporting! A new link will be posted soon.", true),
            };
            VoteReply {
                text,
                show_alert,
                refresh: Some((message.chat.id, message.message_id, vote_keyboard(&tally))),
            }
        }
        VoteResult::AlreadyVoted => VoteReply {
            text: "You already voted on this link!",
            show_alert: true,
            refresh: None,
        },
        VoteResult::Expired => VoteReply {
            text: "Voting on this post has closed.",
            show_alert: false,
            refresh: None,
        },
    };
    Some(reply)
}

/// Long-poll `getUpdates` and handle vote presses until cancelled.
pub async fn run_vote_poller(
    client: Arc<TelegramClient>,
    votes: Arc<Mutex<VoteLedger>>,
    cancel: CancellationToken,
) {
    info!("🗳️ Vote poller started");
    let mut offset = 0i64;

    loop {
        let updates = tokio::select! {
            _ = cancel.cancelled() => break,
            res = client.get_updates(offset) => res,
        };

        let updates = match updates {
            Ok(updates) => updates,
            Err(e) => {
                warn!("⚠️ [Votes] getUpdates failed: {:#}", e);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_secs(5)) => continue,
                }
            }
        };

        for update in updates {
            offset = offset.max(update.update_id + 1);
            let Some(query) = update.callback_query else {
                continue;
            };
            let Some(reply) = apply_vote(&votes, &query) else {
                debug!("ignoring callback {:?}", query.data);
                continue;
            };

            // Stale queries are rejected by Telegram; nothing to do about it.
            if let Err(e) = client
                .answer_callback_query(&query.id, reply.text, reply.show_alert)
                .await
            {
                warn!("[Votes] answerCallbackQuery failed: {:#}", e);
            }
            if let Some((chat_id, message_id, markup)) = reply.refresh {
                if let Err(e) = client
                    .edit_message_reply_markup(chat_id, message_id, &markup)
                    .await
                {
                    error!("[Votes] Failed to refresh buttons on {}: {:#}", message_id, e);
                }
            }
        }
    }
    info!("🗳️ Vote poller stopped");
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::telegram::{Chat, Message, User};

    fn query(user: i64, data: &str) -> CallbackQuery {
        CallbackQuery {
            id: format!("q{}", user),
            from: User { id: user },
            message: Some(Message {
                message_id: 100,
                chat: Chat { id: -42 },
            }),
            data: Some(data.to_string()),
        }
    }

    #[test]
    fn test_post_escapes_link() {
        let post = format_post("https://www.canva.com/brand/join?token=a&b=c", "✅");
        assert!(post.starts_with("✅ <b>New Canva Pro Team Link:</b>"));
        assert!(post.contains("href=\"https://www.canva.com/brand/join?token=a&amp;b=c\""));
    }

    #[test]
    fn test_keyboard_shows_counts() {
        let tally = Tally {
            working: 3,
            not_working: 1,
            good: "🚀".to_string(),
            bad: "🛑".to_string(),
        };
        let markup = vote_keyboard(&tally);
        let row = &markup.inline_keyboard[0];
        assert_eq!(row[0].text, "🚀 Working (3)");
        assert_eq!(row[0].callback_data, "vote_working|🚀|🛑");
        assert_eq!(row[1].text, "🛑 Not Working (1)");
    }

    #[test]
    fn test_vote_flow() {
        let ledger = Mutex::new(VoteLedger::default());

        let first = apply_vote(&ledger, &query(1, "vote_working|✅|❌")).unwrap();
        assert!(!first.show_alert);
        let (chat, message, markup) = first.refresh.unwrap();
        assert_eq!((chat, message), (-42, 100));
        assert_eq!(markup.inline_keyboard[0][0].text, "✅ Working (1)");

        let again = apply_vote(&ledger, &query(1, "vote_not_working|✅|❌")).unwrap();
        assert_eq!(again.text, "You already voted on this link!");
        assert!(again.refresh.is_none());

        let other = apply_vote(&ledger, &query(2, "vote_not_working|✅|❌")).unwrap();
        assert!(other.show_alert);
        let (_, _, markup) = other.refresh.unwrap();
        assert_eq!(markup.inline_keyboard[0][1].text, "❌ Not Working (1)");
    }

    #[test]
    fn test_non_vote_callbacks_are_ignored() {
        let ledger = Mutex::new(VoteLedger::default());
        assert!(apply_vote(&ledger, &query(1, "help_admin")).is_none());
        assert!(ledger.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_log_announcer_never_fails() {
        assert!(LogAnnouncer.announce("https://x.example").await.is_ok());
    }
}
