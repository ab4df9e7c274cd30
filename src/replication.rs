//! Subscription handles for the three logical rows a session follows.
//!
//! At most one live feed per topic. Acquiring an already-live topic is a
//! no-op; attaching a second feed for it is refused. Releasing is
//! idempotent and every handle is released on drop.

use std::time::Duration;

use crate::error::{SyncError, SyncResult};
use crate::logging::{log_feed_status, Level};
use crate::store::{with_timeout, ChangeEvent, ChangeFeed, FeedScope, RemoteStore, Topic};

pub const TOPICS: [Topic; 3] = [Topic::Roster, Topic::Slots, Topic::Selection];

/// What the next poll of the subscriptions produced.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedSignal {
    Event(ChangeEvent),
    /// The feed for this topic ended; it has been released.
    Closed(Topic),
}

#[derive(Debug, Default)]
pub struct Subscriptions {
    roster: Option<ChangeFeed>,
    slots: Option<ChangeFeed>,
    selection: Option<ChangeFeed>,
}

impl Subscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot_for(&mut self, topic: Topic) -> &mut Option<ChangeFeed> {
        match topic {
            Topic::Roster => &mut self.roster,
            Topic::Slots => &mut self.slots,
            Topic::Selection => &mut self.selection,
        }
    }

    fn feed(&self, topic: Topic) -> Option<&ChangeFeed> {
        match topic {
            Topic::Roster => self.roster.as_ref(),
            Topic::Slots => self.slots.as_ref(),
            Topic::Selection => self.selection.as_ref(),
        }
    }

    pub fn is_subscribed(&self, topic: Topic) -> bool {
        self.feed(topic).map(ChangeFeed::is_live).unwrap_or(false)
    }

    pub fn live_count(&self) -> usize {
        TOPICS.iter().filter(|t| self.is_subscribed(**t)).count()
    }

    /// Subscribes to `topic` unless a live feed already exists. Returns
    /// whether a new subscription was opened.
    pub async fn ensure(
        &mut self,
        store: &dyn RemoteStore,
        topic: Topic,
        scope: &FeedScope,
        timeout: Duration,
    ) -> SyncResult<bool> {
        if self.is_subscribed(topic) {
            return Ok(false);
        }
        let feed = with_timeout(timeout, store.subscribe(topic, scope)).await?;
        self.attach(feed)?;
        log_feed_status(Level::Info, topic, "subscribed", &scope.session_id);
        Ok(true)
    }

    /// Installs a feed obtained elsewhere. A live feed for the same topic is
    /// never replaced.
    pub fn attach(&mut self, feed: ChangeFeed) -> SyncResult<()> {
        let topic = feed.topic();
        if self.is_subscribed(topic) {
            return Err(SyncError::DuplicateSubscription(topic.table().to_string()));
        }
        *self.slot_for(topic) = Some(feed);
        Ok(())
    }

    /// Releases one topic. Returns `true` only if a live feed was released.
    pub fn release(&mut self, topic: Topic) -> bool {
        match self.slot_for(topic).take() {
            Some(mut feed) => {
                let released = feed.release();
                if released {
                    log_feed_status(Level::Debug, topic, "released", "");
                }
                released
            }
            None => false,
        }
    }

    /// Releases everything; returns how many live feeds were released.
    pub fn release_all(&mut self) -> usize {
        TOPICS.iter().filter(|t| self.release(**t)).count()
    }

    /// Next buffered event on any topic without waiting.
    pub fn try_next(&mut self) -> Option<ChangeEvent> {
        for topic in TOPICS {
            if let Some(feed) = self.slot_for(topic).as_mut() {
                if let Some(ev) = feed.try_recv() {
                    return Some(ev);
                }
            }
        }
        None
    }

    /// Waits for the next event on any live feed. Returns `None` when no
    /// feed is held at all.
    pub async fn next(&mut self) -> Option<FeedSignal> {
        if self.roster.is_none() && self.slots.is_none() && self.selection.is_none() {
            return None;
        }
        let signal = tokio::select! {
            ev = recv_from(&mut self.roster) => ev.map(FeedSignal::Event).unwrap_or(FeedSignal::Closed(Topic::Roster)),
            ev = recv_from(&mut self.slots) => ev.map(FeedSignal::Event).unwrap_or(FeedSignal::Closed(Topic::Slots)),
            ev = recv_from(&mut self.selection) => ev.map(FeedSignal::Event).unwrap_or(FeedSignal::Closed(Topic::Selection)),
        };
        if let FeedSignal::Closed(topic) = signal {
            log_feed_status(Level::Warn, topic, "closed", "");
            self.release(topic);
        }
        Some(signal)
    }
}

/// Pending forever for an absent feed so `select!` only polls held ones.
async fn recv_from(feed: &mut Option<ChangeFeed>) -> Option<ChangeEvent> {
    match feed {
        Some(feed) => feed.recv().await,
        None => std::future::pending().await,
    }
}
