//! Propagation fanout: every way a client learns about a new counter value.
//!
//! Outbound, a committed value is pushed on the broadcast topic and written
//! to the device tab key. Inbound, each enabled [`Channel`] runs as its own
//! task and forwards what it sees into one [`Observation`] sink. The sink is
//! applied by overwrite, so enabling or disabling a channel changes latency,
//! never the value the client settles on.
//!
//! | Channel        | Latency            | Authoritative |
//! |----------------|--------------------|---------------|
//! | `TabSync`      | instant, same device | no          |
//! | `Broadcast`    | low, at-most-once  | no            |
//! | `ChangeFeed`   | store-dependent    | yes           |
//! | `Visibility`   | on hidden→visible  | yes           |
//! | `Poll`         | one poll interval  | yes           |

use crate::metrics::PropagationMetrics;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use ticket_sync_core::action::ActionRecord;
use ticket_sync_core::channel::{BroadcastBus, CountUpdated, TabSignal, parse_tab_value};
use ticket_sync_core::counter::{CounterId, CounterValue};
use ticket_sync_core::store::CounterStore;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Default reconciliation poll period.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Default broadcast topic.
pub const DEFAULT_TOPIC: &str = "counter-broadcast";

/// Default device tab key.
pub const DEFAULT_TAB_KEY: &str = "counter-value";

/// One way a value can reach a client.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Channel {
    /// Store-level change notifications
    ChangeFeed,
    /// Fire-and-forget topic message
    Broadcast,
    /// Same-device shared key
    TabSync,
    /// Periodic authoritative re-read
    Poll,
    /// Re-read when the client becomes visible
    Visibility,
}

impl Channel {
    /// Every channel, fastest first.
    pub const ALL: [Self; 5] = [
        Self::TabSync,
        Self::Broadcast,
        Self::ChangeFeed,
        Self::Visibility,
        Self::Poll,
    ];

    /// Position in the latency ranking, 0 = fastest.
    #[must_use]
    pub const fn rank(self) -> u8 {
        match self {
            Self::TabSync => 0,
            Self::Broadcast => 1,
            Self::ChangeFeed => 2,
            Self::Visibility => 3,
            Self::Poll => 4,
        }
    }

    /// Whether values on this channel come straight from the store.
    #[must_use]
    pub const fn is_authoritative(self) -> bool {
        matches!(self, Self::ChangeFeed | Self::Poll | Self::Visibility)
    }

    /// Stable name used in config and metric labels
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ChangeFeed => "change-feed",
            Self::Broadcast => "broadcast",
            Self::TabSync => "tab-sync",
            Self::Poll => "poll",
            Self::Visibility => "visibility",
        }
    }

    const fn bit(self) -> u8 {
        1 << self.rank()
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error parsing a channel name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown channel: {0}")]
pub struct UnknownChannel(pub String);

impl FromStr for Channel {
    type Err = UnknownChannel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == s.trim())
            .ok_or_else(|| UnknownChannel(s.to_string()))
    }
}

/// Which channels are switched on.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<Channel>", into = "Vec<Channel>")]
pub struct ChannelSet(u8);

impl ChannelSet {
    /// Every channel enabled
    #[must_use]
    pub const fn all() -> Self {
        Self(0b1_1111)
    }

    /// Every channel disabled
    #[must_use]
    pub const fn none() -> Self {
        Self(0)
    }

    /// Exactly the listed channels
    #[must_use]
    pub fn only(channels: &[Channel]) -> Self {
        channels.iter().fold(Self::none(), |set, c| set.enable(*c))
    }

    /// This set plus `channel`
    #[must_use]
    pub const fn enable(self, channel: Channel) -> Self {
        Self(self.0 | channel.bit())
    }

    /// This set minus `channel`
    #[must_use]
    pub const fn disable(self, channel: Channel) -> Self {
        Self(self.0 & !channel.bit())
    }

    /// Whether `channel` is on
    #[must_use]
    pub const fn is_enabled(self, channel: Channel) -> bool {
        self.0 & channel.bit() != 0
    }

    /// Enabled channels, fastest first
    pub fn iter(self) -> impl Iterator<Item = Channel> {
        Channel::ALL.into_iter().filter(move |c| self.is_enabled(*c))
    }
}

impl Default for ChannelSet {
    fn default() -> Self {
        Self::all()
    }
}

impl fmt::Debug for ChannelSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl From<Vec<Channel>> for ChannelSet {
    fn from(channels: Vec<Channel>) -> Self {
        Self::only(&channels)
    }
}

impl From<ChannelSet> for Vec<Channel> {
    fn from(set: ChannelSet) -> Self {
        set.iter().collect()
    }
}

impl FromStr for ChannelSet {
    type Err = UnknownChannel;

    /// Parses `all`, `none`, or a comma-separated list of channel names.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "all" => Ok(Self::all()),
            "none" | "" => Ok(Self::none()),
            list => list
                .split(',')
                .map(str::parse::<Channel>)
                .collect::<Result<Vec<_>, _>>()
                .map(Self::from),
        }
    }
}

/// What a channel delivered.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Observation {
    /// A counter value
    Value {
        /// The observed value
        value: CounterValue,
        /// Where it came from
        channel: Channel,
    },
    /// A newly committed action, from the store's insert feed
    ActionInserted(ActionRecord),
}

/// Whether the client is currently shown.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Visibility {
    /// In the foreground
    #[default]
    Visible,
    /// Suspended or in the background
    Hidden,
}

/// Current [`Visibility`] plus one resume event per hidden→visible edge.
///
/// Edges are detected at the sender and queued, so a quick hide/show pair is
/// never coalesced away before the visibility task runs.
#[derive(Debug)]
pub struct VisibilityTracker {
    current: watch::Sender<Visibility>,
    resumes: mpsc::UnboundedSender<()>,
}

/// Receiving side of [`VisibilityTracker`], consumed by [`Fanout::start`].
pub type Resumes = mpsc::UnboundedReceiver<()>;

impl VisibilityTracker {
    /// A visible tracker and its resume queue.
    #[must_use]
    pub fn new() -> (Self, Resumes) {
        let (resumes, rx) = mpsc::unbounded_channel();
        let (current, _) = watch::channel(Visibility::Visible);
        (Self { current, resumes }, rx)
    }

    /// Record a change. Returns `true` when this call resumed the client.
    pub fn set(&self, visibility: Visibility) -> bool {
        let previous = self.current.send_replace(visibility);
        let resumed = previous == Visibility::Hidden && visibility == Visibility::Visible;
        // Nobody listens when the visibility channel is off.
        if resumed && self.resumes.send(()).is_err() {
            tracing::trace!("Resume dropped, visibility channel not running");
        }
        resumed
    }

    /// Last reported visibility
    #[must_use]
    pub fn get(&self) -> Visibility {
        *self.current.borrow()
    }
}

/// Fanout settings.
///
/// Listening and announcing are configured separately: a client that only
/// polls still pushes its own commits to the others.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FanoutConfig {
    /// Inbound channels to listen on
    pub channels: ChannelSet,
    /// Outbound channels to announce on; only `Broadcast` and `TabSync` apply
    pub announce: ChannelSet,
    /// Reconciliation poll period
    pub poll_interval: Duration,
    /// Broadcast topic
    pub topic: String,
    /// Device tab key
    pub tab_key: String,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            channels: ChannelSet::all(),
            announce: ChannelSet::all(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            topic: DEFAULT_TOPIC.to_string(),
            tab_key: DEFAULT_TAB_KEY.to_string(),
        }
    }
}

/// Owns the transports for one client and wires them to its sink.
#[derive(Clone)]
pub struct Fanout {
    store: Arc<dyn CounterStore>,
    bus: Arc<dyn BroadcastBus>,
    tabs: Arc<dyn TabSignal>,
    config: FanoutConfig,
}

impl Fanout {
    /// Create a fanout over the given transports.
    #[must_use]
    pub fn new(
        store: Arc<dyn CounterStore>,
        bus: Arc<dyn BroadcastBus>,
        tabs: Arc<dyn TabSignal>,
        config: FanoutConfig,
    ) -> Self {
        Self {
            store,
            bus,
            tabs,
            config,
        }
    }

    /// Current settings
    #[must_use]
    pub const fn config(&self) -> &FanoutConfig {
        &self.config
    }

    /// Subscribe every enabled inbound channel and start forwarding into `sink`.
    ///
    /// Subscriptions are established before this returns. A channel that
    /// cannot subscribe is logged and skipped; the others still run.
    #[tracing::instrument(skip(self, sink, resumes), fields(channels = ?self.config.channels))]
    pub async fn start(
        &self,
        counter_id: CounterId,
        sink: mpsc::UnboundedSender<Observation>,
        resumes: Resumes,
    ) -> FanoutHandle {
        let channels = self.config.channels;
        let mut tasks = Vec::new();

        if channels.is_enabled(Channel::ChangeFeed) {
            match self.store.subscribe_counter_changes(counter_id).await {
                Ok(mut values) => {
                    let sink = sink.clone();
                    tasks.push(tokio::spawn(async move {
                        while let Some(value) = values.next().await {
                            if !forward(&sink, value, Channel::ChangeFeed) {
                                break;
                            }
                        }
                        tracing::debug!("Counter change feed ended");
                    }));
                },
                Err(error) => {
                    tracing::warn!(%error, "Counter change feed unavailable");
                },
            }

            match self.store.subscribe_action_inserts(counter_id).await {
                Ok(mut inserts) => {
                    let sink = sink.clone();
                    let store = Arc::clone(&self.store);
                    tasks.push(tokio::spawn(async move {
                        while let Some(record) = inserts.next().await {
                            if sink.send(Observation::ActionInserted(record)).is_err() {
                                break;
                            }
                            // An insert means the value moved too; fetch it.
                            if !reread(store.as_ref(), counter_id, Channel::ChangeFeed, &sink)
                                .await
                            {
                                break;
                            }
                        }
                        tracing::debug!("Action insert feed ended");
                    }));
                },
                Err(error) => {
                    tracing::warn!(%error, "Action insert feed unavailable");
                },
            }
        }

        if channels.is_enabled(Channel::Broadcast) {
            match self.bus.subscribe(&self.config.topic).await {
                Ok(mut messages) => {
                    let sink = sink.clone();
                    tasks.push(tokio::spawn(async move {
                        while let Some(payload) = messages.next().await {
                            match CountUpdated::decode(&payload) {
                                Ok(Some(message)) => {
                                    if !forward(&sink, message.value, Channel::Broadcast) {
                                        break;
                                    }
                                },
                                Ok(None) => {},
                                Err(error) => {
                                    PropagationMetrics::record_decode_error("broadcast");
                                    tracing::warn!(%error, "Dropping undecodable broadcast");
                                },
                            }
                        }
                        tracing::debug!("Broadcast subscription ended");
                    }));
                },
                Err(error) => {
                    tracing::warn!(%error, "Broadcast subscription unavailable");
                },
            }
        }

        if channels.is_enabled(Channel::TabSync) {
            let mut writes = self.tabs.watch(&self.config.tab_key);
            let sink = sink.clone();
            tasks.push(tokio::spawn(async move {
                while let Some(raw) = writes.next().await {
                    match parse_tab_value(&raw) {
                        Some(value) => {
                            if !forward(&sink, value, Channel::TabSync) {
                                break;
                            }
                        },
                        None => {
                            PropagationMetrics::record_decode_error("tab-sync");
                            tracing::debug!(raw, "Ignoring tab value out of range");
                        },
                    }
                }
            }));
        }

        if channels.is_enabled(Channel::Poll) {
            let store = Arc::clone(&self.store);
            let sink = sink.clone();
            let period = self.config.poll_interval;
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                // The first tick completes immediately; polling starts one period in.
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    if !reread(store.as_ref(), counter_id, Channel::Poll, &sink).await {
                        break;
                    }
                }
            }));
        }

        if channels.is_enabled(Channel::Visibility) {
            let store = Arc::clone(&self.store);
            let mut resumes = resumes;
            tasks.push(tokio::spawn(async move {
                while resumes.recv().await.is_some() {
                    if !reread(store.as_ref(), counter_id, Channel::Visibility, &sink).await {
                        break;
                    }
                }
            }));
        }

        tracing::debug!(tasks = tasks.len(), "Fanout started");
        FanoutHandle { tasks }
    }

    /// Announce a committed value on the broadcast topic.
    ///
    /// Failures are logged and counted, never returned.
    pub async fn publish(&self, value: CounterValue) {
        if !self.config.announce.is_enabled(Channel::Broadcast) {
            return;
        }

        let payload = match CountUpdated::new(value).encode() {
            Ok(payload) => payload,
            Err(error) => {
                PropagationMetrics::record_publish_error();
                tracing::warn!(%error, "Could not encode broadcast");
                return;
            },
        };

        let start = Instant::now();
        match self.bus.publish(&self.config.topic, payload).await {
            Ok(()) => {
                PropagationMetrics::record_publish(start.elapsed());
                tracing::trace!(%value, topic = %self.config.topic, "Broadcast published");
            },
            Err(error) => {
                PropagationMetrics::record_publish_error();
                tracing::warn!(%error, %value, "Broadcast publish failed");
            },
        }
    }

    /// Write a value to the device tab key so other tabs pick it up.
    pub fn signal_tabs(&self, value: CounterValue) {
        if !self.config.announce.is_enabled(Channel::TabSync) {
            return;
        }

        match self.tabs.write(&self.config.tab_key, &value.to_string()) {
            Ok(()) => PropagationMetrics::record_tab_signal(),
            Err(error) => {
                PropagationMetrics::record_tab_signal_error();
                tracing::warn!(%error, %value, "Tab signal failed");
            },
        }
    }
}

impl fmt::Debug for Fanout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fanout")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Returns `false` once the sink is gone.
fn forward(sink: &mpsc::UnboundedSender<Observation>, value: CounterValue, channel: Channel) -> bool {
    PropagationMetrics::record_observation(channel.as_str());
    sink.send(Observation::Value { value, channel }).is_ok()
}

/// Read the authoritative value and forward it. Read failures are logged and
/// skipped. Returns `false` once the sink is gone.
async fn reread(
    store: &dyn CounterStore,
    counter_id: CounterId,
    channel: Channel,
    sink: &mpsc::UnboundedSender<Observation>,
) -> bool {
    match store.read_counter(counter_id).await {
        Ok(value) => forward(sink, value, channel),
        Err(error) => {
            PropagationMetrics::record_poll_error();
            tracing::warn!(%error, %channel, "Authoritative re-read failed");
            !sink.is_closed()
        },
    }
}

/// Running inbound channel tasks. Dropping the handle stops them.
#[derive(Debug)]
pub struct FanoutHandle {
    tasks: Vec<JoinHandle<()>>,
}

impl FanoutHandle {
    /// Number of running channel tasks
    #[must_use]
    pub fn task_count(&self) -> usize {
        self.tasks.iter().filter(|t| !t.is_finished()).count()
    }

    /// Stop every channel task.
    pub fn close(mut self) {
        self.abort_all();
    }

    fn abort_all(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for FanoutHandle {
    fn drop(&mut self) {
        self.abort_all();
    }
}
