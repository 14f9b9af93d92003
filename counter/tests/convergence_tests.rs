//! Two sessions on one store: each propagation channel on its own must carry
//! a committed value from the writer to the observer.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;
use ticket_counter::{SessionEnvironment, SessionOptions, SyncSession};
use ticket_sync_core::counter::CounterValue;
use ticket_sync_core::environment::SystemClock;
use ticket_sync_runtime::propagation::{Channel, ChannelSet, Fanout, FanoutConfig, Visibility};
use ticket_sync_testing::memory::{InMemoryBroadcastBus, InMemoryCounterStore, InMemoryTabStorage, StoreOperation};
use ticket_sync_testing::{init_test_tracing, wait_until};

const ONE_POLL: Duration = Duration::from_millis(750);

// ========== Test Fixtures ==========

struct Rig {
    store: Arc<InMemoryCounterStore>,
    bus: Arc<InMemoryBroadcastBus>,
    device: InMemoryTabStorage,
}

impl Rig {
    fn new() -> Self {
        init_test_tracing();
        Self {
            store: Arc::new(InMemoryCounterStore::new()),
            bus: Arc::new(InMemoryBroadcastBus::new()),
            device: InMemoryTabStorage::new(),
        }
    }

    async fn session(&self, channels: ChannelSet) -> SyncSession {
        let fanout = Fanout::new(
            self.store.clone(),
            self.bus.clone(),
            Arc::new(self.device.open_tab()),
            FanoutConfig {
                channels,
                ..FanoutConfig::default()
            },
        );
        let env = SessionEnvironment::new(self.store.clone(), Arc::new(fanout), Arc::new(SystemClock));
        SyncSession::connect(env, SessionOptions::default())
            .await
            .expect("session connects")
    }

    /// A writer that publishes on every outbound channel, and an observer
    /// listening only on `channels`.
    async fn pair(&self, channels: ChannelSet) -> (SyncSession, SyncSession) {
        let writer = self.session(ChannelSet::all()).await;
        let observer = self.session(channels).await;
        (writer, observer)
    }
}

fn v(n: u32) -> CounterValue {
    CounterValue::new(n).unwrap()
}

async fn shows(session: &SyncSession, expected: CounterValue, within: Duration) -> bool {
    wait_until(within, move || async move { session.displayed_value().await == expected }).await
}

// ========== Single Channel ==========

#[tokio::test]
async fn set_to_reaches_poll_only_observer_within_one_interval() {
    let rig = Rig::new();
    let (writer, observer) = rig.pair(ChannelSet::only(&[Channel::Poll])).await;

    writer.set_to(550.0).await.unwrap();

    assert!(shows(&observer, v(550), ONE_POLL).await);
    assert_eq!(observer.confirmed_value().await, v(550));
}

#[tokio::test]
async fn change_feed_alone_converges() {
    let rig = Rig::new();
    let (writer, observer) = rig.pair(ChannelSet::only(&[Channel::ChangeFeed])).await;

    writer.increment().await.unwrap();

    assert!(shows(&observer, v(1), Duration::from_millis(200)).await);
    assert_eq!(observer.confirmed_value().await, v(1));
    let observer = &observer;
    assert!(
        wait_until(Duration::from_millis(200), move || async move {
            observer.actions().await.len() == 1
        })
        .await
    );
}

#[tokio::test]
async fn broadcast_alone_converges_without_confirming() {
    let rig = Rig::new();
    let (writer, observer) = rig.pair(ChannelSet::only(&[Channel::Broadcast])).await;

    writer.increment().await.unwrap();

    assert!(shows(&observer, v(1), Duration::from_millis(200)).await);
    assert_eq!(observer.confirmed_value().await, CounterValue::ZERO);
}

#[tokio::test]
async fn tab_sync_carries_optimistic_value_before_commit() {
    let rig = Rig::new();
    let (writer, observer) = rig.pair(ChannelSet::only(&[Channel::TabSync])).await;
    rig.store.set_failing(StoreOperation::Write, true);

    writer.increment().await.unwrap();

    // The tab signal goes out on acceptance, so it arrives even though the
    // commit failed.
    assert!(shows(&observer, v(1), Duration::from_millis(200)).await);
    assert_eq!(rig.store.value(), Some(CounterValue::ZERO));
}

#[tokio::test]
async fn push_channels_converge_with_poll_disabled() {
    let rig = Rig::new();
    let (writer, observer) = rig.pair(ChannelSet::all().disable(Channel::Poll)).await;

    writer.increment().await.unwrap();
    writer.increment().await.unwrap();

    assert!(shows(&observer, v(2), Duration::from_millis(200)).await);
}

#[tokio::test]
async fn nothing_arrives_with_every_channel_off() {
    let rig = Rig::new();
    let (writer, observer) = rig.pair(ChannelSet::none()).await;

    writer.increment().await.unwrap();

    assert!(!shows(&observer, v(1), ONE_POLL).await);
}

// ========== Visibility ==========

#[tokio::test]
async fn resuming_visibility_rereads_once() {
    let rig = Rig::new();
    // The writer must not poll, or its reads would be counted too.
    let writer = rig.session(ChannelSet::none()).await;
    let observer = rig.session(ChannelSet::only(&[Channel::Visibility])).await;

    writer.increment().await.unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(observer.displayed_value().await, CounterValue::ZERO);

    let reads_before = rig.store.operation_count(StoreOperation::Read);
    observer.set_visibility(Visibility::Hidden);
    tokio::time::sleep(Duration::from_millis(30)).await;
    observer.set_visibility(Visibility::Visible);

    assert!(shows(&observer, v(1), Duration::from_millis(200)).await);
    assert_eq!(observer.confirmed_value().await, v(1));
    assert_eq!(rig.store.operation_count(StoreOperation::Read), reads_before + 1);
}

#[tokio::test]
async fn instant_hide_and_show_still_rereads() {
    let rig = Rig::new();
    let writer = rig.session(ChannelSet::none()).await;
    let observer = rig.session(ChannelSet::only(&[Channel::Visibility])).await;

    writer.increment().await.unwrap();
    let reads_before = rig.store.operation_count(StoreOperation::Read);

    observer.set_visibility(Visibility::Hidden);
    observer.set_visibility(Visibility::Visible);

    assert!(shows(&observer, v(1), Duration::from_millis(200)).await);
    assert_eq!(rig.store.operation_count(StoreOperation::Read), reads_before + 1);
    assert_eq!(observer.visibility(), Visibility::Visible);
}

// ========== Last Write Wins ==========

#[tokio::test]
async fn observers_converge_on_latest_commit() {
    let rig = Rig::new();
    let (writer, observer) = rig.pair(ChannelSet::all()).await;

    writer.set_to(10.0).await.unwrap();
    writer.set_to(20.0).await.unwrap();
    writer.decrement().await.unwrap();

    assert!(shows(&observer, v(19), ONE_POLL).await);
    tokio::time::sleep(ONE_POLL).await;
    assert_eq!(observer.displayed_value().await, v(19));
    assert_eq!(observer.confirmed_value().await, v(19));
}
