//! In-memory "Working / Not Working" counters for announced posts.
//!
//! Best-effort only: counters are lost on restart and only the newest
//! posts are kept.

use std::collections::{BTreeMap, HashSet};

use rand::seq::SliceRandom;
use rand::Rng;

pub const MAX_TRACKED_POSTS: usize = 200;

/// (good, bad) button emoji; one pair is picked at random per post.
pub const EMOJI_PAIRS: &[(&str, &str)] = &[
    ("🟢", "🔴"),
    ("✅", "❌"),
    ("🔥", "😞"),
    ("💯", "😵"),
    ("😎", "😭"),
    ("🚀", "🛑"),
    ("🌟", "👎"),
    ("🥇", "🥀"),
    ("🍀", "🪦"),
    ("🎉", "😬"),
];

pub fn random_emoji_pair<R: Rng + ?Sized>(rng: &mut R) -> (&'static str, &'static str) {
    EMOJI_PAIRS.choose(rng).copied().unwrap_or(("🟢", "🔴"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vote {
    Working,
    NotWorking,
}

/// Parsed `vote_working|good|bad` / `vote_not_working|good|bad` callback data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoteCallback {
    pub vote: Vote,
    pub good: String,
    pub bad: String,
}

impl VoteCallback {
    pub fn parse(data: &str) -> Option<Self> {
        let mut parts = data.split('|');
        let vote = match parts.next()? {
            "vote_working" => Vote::Working,
            "vote_not_working" => Vote::NotWorking,
            _ => return None,
        };
        let good = parts.next().filter(|s| !s.is_empty()).unwrap_or("🟢");
        let bad = parts.next().filter(|s| !s.is_empty()).unwrap_or("🔴");
        Some(Self {
            vote,
            good: good.to_string(),
            bad: bad.to_string(),
        })
    }

    pub fn encode(vote: Vote, good: &str, bad: &str) -> String {
        let action = match vote {
            Vote::Working => "vote_working",
            Vote::NotWorking => "vote_not_working",
        };
        format!("{}|{}|{}", action, good, bad)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tally {
    pub working: u32,
    pub not_working: u32,
    pub good: String,
    pub bad: String,
}

#[derive(Debug, PartialEq, Eq)]
pub enum VoteResult {
    Counted(Tally),
    AlreadyVoted,
    /// Older than every tracked post.
    Expired,
}

struct PostVotes {
    tally: Tally,
    voters: HashSet<i64>,
}

/// Per-post counters keyed by message id. Higher ids are newer posts.
pub struct VoteLedger {
    posts: BTreeMap<i64, PostVotes>,
    capacity: usize,
}

impl Default for VoteLedger {
    fn default() -> Self {
        Self::with_capacity(MAX_TRACKED_POSTS)
    }
}

impl VoteLedger {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            posts: BTreeMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Start tracking a freshly sent post.
    pub fn register(&mut self, message_id: i64, good: &str, bad: &str) {
        self.posts.insert(
            message_id,
            PostVotes {
                tally: Tally {
                    working: 0,
                    not_working: 0,
                    good: good.to_string(),
                    bad: bad.to_string(),
                },
                voters: HashSet::new(),
            },
        );
        self.prune();
    }

    /// Count one vote. Posts not seen before (e.g. sent before a restart) are
    /// tracked from the emoji pair carried in the callback.
    pub fn vote(&mut self, message_id: i64, user_id: i64, callback: &VoteCallback) -> VoteResult {
        if !self.posts.contains_key(&message_id) {
            self.register(message_id, &callback.good, &callback.bad);
        }
        let Some(post) = self.posts.get_mut(&message_id) else {
            return VoteResult::Expired;
        };
        if !post.voters.insert(user_id) {
            return VoteResult::AlreadyVoted;
        }
        match callback.vote {
            Vote::Working => post.tally.working += 1,
            Vote::NotWorking => post.tally.not_working += 1,
        }
        VoteResult::Counted(post.tally.clone())
    }

    pub fn tally(&self, message_id: i64) -> Option<Tally> {
        self.posts.get(&message_id).map(|p| p.tally.clone())
    }

    pub fn len(&self) -> usize {
        self.posts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.posts.is_empty()
    }

    fn prune(&mut self) {
        while self.posts.len() > self.capacity {
            self.posts.pop_first();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn working() -> VoteCallback {
        VoteCallback::parse("vote_working|✅|❌").unwrap()
    }

    #[test]
    fn test_callback_parsing() {
        assert_eq!(
            working(),
            VoteCallback {
                vote: Vote::Working,
                good: "✅".to_string(),
                bad: "❌".to_string()
            }
        );
        let bare = VoteCallback::parse("vote_not_working").unwrap();
        assert_eq!(bare.vote, Vote::NotWorking);
        assert_eq!((bare.good.as_str(), bare.bad.as_str()), ("🟢", "🔴"));
        assert!(VoteCallback::parse("help_admin").is_none());
        assert_eq!(
            VoteCallback::encode(Vote::NotWorking, "🚀", "🛑"),
            "vote_not_working|🚀|🛑"
        );
    }

    #[test]
    fn test_one_vote_per_user_per_post() {
        let mut ledger = VoteLedger::default();
        ledger.register(10, "✅", "❌");

        assert!(matches!(ledger.vote(10, 1, &working()), VoteResult::Counted(_)));
        assert_eq!(ledger.vote(10, 1, &working()), VoteResult::AlreadyVoted);

        let not_working = VoteCallback::parse("vote_not_working|✅|❌").unwrap();
        let VoteResult::Counted(tally) = ledger.vote(10, 2, &not_working) else {
            panic!("second user should be counted");
        };
        assert_eq!((tally.working, tally.not_working), (1, 1));

        // Same user may vote on a different post.
        assert!(matches!(ledger.vote(11, 1, &working()), VoteResult::Counted(_)));
    }

    #[test]
    fn test_unknown_post_uses_callback_emoji() {
        let mut ledger = VoteLedger::default();
        let callback = VoteCallback::parse("vote_working|🚀|🛑").unwrap();
        ledger.vote(42, 7, &callback);
        let tally = ledger.tally(42).unwrap();
        assert_eq!(tally.good, "🚀");
        assert_eq!(tally.working, 1);
    }

    #[test]
    fn test_prunes_oldest_posts() {
        let mut ledger = VoteLedger::with_capacity(3);
        for id in 1..=5 {
            ledger.register(id, "✅", "❌");
        }
        assert_eq!(ledger.len(), 3);
        assert!(ledger.tally(1).is_none());
        assert!(ledger.tally(2).is_none());
        assert!(ledger.tally(5).is_some());
        assert_eq!(ledger.vote(1, 9, &working()), VoteResult::Expired);
        assert_eq!(ledger.len(), 3);
    }

    #[test]
    fn test_random_pair_comes_from_table() {
        let mut rng = rand::thread_rng();
        let pair = random_emoji_pair(&mut rng);
        assert!(EMOJI_PAIRS.contains(&pair));
    }
}
