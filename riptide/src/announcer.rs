use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::{sync::{mpsc, watch}, task::JoinHandle, time};
use tracing::Instrument;
use url::Url;
use crate::{
    tracker::{self, AnnounceParams, Event, Tracker, DEFAULT_ANNOUNCE_INTERVAL},
    ID,
};

pub type AnnouncerTx = mpsc::UnboundedSender<AnnouncerEvent>;
pub type AnnouncerRx = mpsc::UnboundedReceiver<AnnouncerEvent>;
pub type StopTx = mpsc::UnboundedSender<()>;
pub type StopRx = mpsc::UnboundedReceiver<()>;

// Peer addresses surfaced by a tracker.
#[derive(Debug)]
pub enum AnnouncerEvent {
    Peers(Vec<SocketAddr>),
}

// Transfer counters read by announcers at announce time. The controller
// keeps the current value in a watch channel; the completed flag flipping
// true triggers an immediate "completed" announce.
#[derive(Debug, Clone, Default)]
pub struct AnnounceStats {
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub completed: bool,
}

pub type StatsTx = watch::Sender<AnnounceStats>;
pub type StatsRx = watch::Receiver<AnnounceStats>;

// Supplied by the embedder; riptide only drives the announce schedule.
pub trait DhtAnnounce: Send + Sync {
    fn announce(&self, info_hash: ID, port: u16);
}

// The effective wait between announces: whatever the tracker asked for,
// bounded below by the configured minimum.
pub fn announce_interval(tracker_interval: Option<Duration>, config_min: Duration) -> Duration {
    tracker_interval.unwrap_or(DEFAULT_ANNOUNCE_INTERVAL).max(config_min)
}

pub struct PeriodicalAnnouncer {

    tracker: Box<dyn Tracker>,

    info_hash: ID,

    client_id: ID,

    port: u16,

    num_want: usize,

    min_interval: Duration,

    backoff_max: Duration,

    stats_rx: StatsRx,

    event_tx: AnnouncerTx,

    stop_rx: StopRx,

}

impl PeriodicalAnnouncer {

    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        tracker: Box<dyn Tracker>,
        info_hash: ID,
        client_id: ID,
        port: u16,
        num_want: usize,
        min_interval: Duration,
        backoff_max: Duration,
        stats_rx: StatsRx,
        event_tx: AnnouncerTx,
        stop_rx: StopRx,
    ) -> JoinHandle<()> {

        let url = tracker.url().to_string();
        let mut announcer = PeriodicalAnnouncer {
            tracker,
            info_hash,
            client_id,
            port,
            num_want,
            min_interval,
            backoff_max,
            stats_rx,
            event_tx,
            stop_rx,
        };
        tokio::spawn(async move {
            announcer.run().await;
        }.instrument(tracing::info_span!("announcer", url = %url)))
    }

    async fn run(&mut self) {

        // Keep announcing "started" until a tracker hears it.
        let mut pending_event = Some(Event::Started);
        let mut sent_completed = self.stats_rx.borrow().completed;
        let mut failures: u32 = 0;

        loop {
            let stats = self.stats_rx.borrow().clone();
            let params = AnnounceParams {
                info_hash: self.info_hash,
                client_id: self.client_id,
                port: self.port,
                uploaded: stats.uploaded,
                downloaded: stats.downloaded,
                left: stats.left,
                event: pending_event,
                num_want: if stats.completed { 0 } else { self.num_want },
            };

            let interval = match self.tracker.announce(params).await {
                Ok(resp) => {
                    failures = 0;
                    pending_event = None;
                    if !resp.peers.is_empty()
                        && self.event_tx.send(AnnouncerEvent::Peers(resp.peers)).is_err()
                    {
                        return;
                    }
                    announce_interval(resp.interval, self.min_interval)
                },
                Err(e) => {
                    failures += 1;
                    tracing::warn!("announce failed: {}", e);
                    // Exponential backoff, capped.
                    let backoff = self.min_interval
                        .saturating_mul(2u32.saturating_pow(failures.min(16)));
                    backoff.min(self.backoff_max)
                },
            };

            let deadline = time::Instant::now() + interval;
            loop { tokio::select! {

                _ = time::sleep_until(deadline) => break,

                // Closed stop channel means shutdown; the stopped event is
                // delivered by a detached announcer.
                _ = self.stop_rx.recv() => return,

                changed = self.stats_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    if self.stats_rx.borrow().completed && !sent_completed {
                        sent_completed = true;
                        pending_event = Some(Event::Completed);
                        break;
                    }
                }

            }}
        }
    }
}

pub struct DhtAnnouncer;

impl DhtAnnouncer {

    pub fn spawn(
        dht: Arc<dyn DhtAnnounce>,
        info_hash: ID,
        port: u16,
        interval: Duration,
        min_interval: Duration,
        mut stop_rx: StopRx,
    ) -> JoinHandle<()> {

        // The configured cadence never beats the protocol minimum.
        let interval = interval.max(min_interval);
        tokio::spawn(async move {
            loop {
                dht.announce(info_hash, port);
                tokio::select! {
                    _ = time::sleep(interval) => {},
                    _ = stop_rx.recv() => return,
                }
            }
        }.instrument(tracing::info_span!("dht-announcer")))
    }
}

// Fired on stop: tells every tracker the torrent stopped, best effort with
// a short deadline each, detached from the controller so teardown never
// blocks on slow trackers.
pub fn spawn_stopped_announcer(
    urls: Vec<Url>,
    info_hash: ID,
    client_id: ID,
    port: u16,
    stats: AnnounceStats,
    timeout: Duration,
) {
    for url in urls {
        let stats = stats.clone();
        tokio::spawn(async move {
            let mut tracker = match tracker::create(&url).await {
                Ok(tracker) => tracker,
                Err(_) => return,
            };
            let params = AnnounceParams {
                info_hash,
                client_id,
                port,
                uploaded: stats.uploaded,
                downloaded: stats.downloaded,
                left: stats.left,
                event: Some(Event::Stopped),
                num_want: 0,
            };
            if let Err(e) = time::timeout(timeout, tracker.announce(params)).await {
                tracing::debug!("stopped announce to {} timed out: {}", url, e);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interval_respects_config_min() {
        let min = Duration::from_secs(60);
        // Tracker asking for less than the floor is clamped up.
        assert_eq!(announce_interval(Some(Duration::from_secs(5)), min), min);
        assert_eq!(
            announce_interval(Some(Duration::from_secs(300)), min),
            Duration::from_secs(300),
        );
        assert_eq!(announce_interval(None, min), DEFAULT_ANNOUNCE_INTERVAL);
    }
}
