use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pricewatch_adapters::{
    ExtractionError, ExtractionRequest, PageExtractor, SiteCatalog, SiteResolver,
};
use pricewatch_core::{ExtractedProduct, SupportTier, TrackedItem};
use pricewatch_storage::{JsonFileStore, Store};
use pricewatch_sync::{
    CheckOrchestrator, RecordingNotificationSink, SweepError, SweepScheduler, SyncConfig,
};
use tokio::sync::{Mutex, Notify};

const WIDGET: &str = "https://www.newegg.com/p/N82E16824012345";
const GADGET: &str = "https://www.costco.com/electronics/gadget.product.100123456.html";

fn product(price: f64) -> ExtractedProduct {
    ExtractedProduct {
        title: Some("27in Monitor".to_string()),
        price: Some(price),
        currency: Some("USD".to_string()),
        image_url: Some("https://c1.neweggimages.com/monitor.jpg".to_string()),
        available: true,
        error: None,
    }
}

/// Returns whatever price is currently set, optionally parking until released.
struct PriceBoard {
    price: Mutex<f64>,
    gate: Option<(Notify, Notify)>,
    calls: AtomicUsize,
}

impl PriceBoard {
    fn fixed(price: f64) -> Self {
        Self {
            price: Mutex::new(price),
            gate: None,
            calls: AtomicUsize::new(0),
        }
    }

    fn gated(price: f64) -> Self {
        Self {
            gate: Some((Notify::new(), Notify::new())),
            ..Self::fixed(price)
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PageExtractor for PriceBoard {
    async fn fetch_document(&self, url: &str, _domain: &str) -> Result<String, ExtractionError> {
        Err(ExtractionError::NoPrice {
            url: url.to_string(),
        })
    }

    async fn extract(
        &self,
        _request: &ExtractionRequest<'_>,
    ) -> Result<ExtractedProduct, ExtractionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some((started, release)) = &self.gate {
            started.notify_one();
            release.notified().await;
        }
        Ok(product(*self.price.lock().await))
    }
}

fn scheduler(
    store: Arc<dyn Store>,
    extractor: Arc<PriceBoard>,
    sink: Arc<RecordingNotificationSink>,
) -> SweepScheduler {
    SweepScheduler::new(
        CheckOrchestrator::new(
            store,
            extractor,
            sink,
            Arc::new(SiteResolver::new(SiteCatalog::default())),
        )
        .with_inter_item_delay(Duration::ZERO),
    )
}

#[tokio::test]
async fn overlapping_trigger_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(JsonFileStore::new(dir.path()));
    let board = Arc::new(PriceBoard::fixed(10.0));
    let sched = scheduler(store.clone(), board, Arc::new(RecordingNotificationSink::default()));
    sched.track_item(WIDGET, None).await.unwrap();

    let gated = Arc::new(PriceBoard::gated(9.0));
    let sched = Arc::new(scheduler(
        store,
        gated.clone(),
        Arc::new(RecordingNotificationSink::default()),
    ));

    let running = {
        let sched = sched.clone();
        tokio::spawn(async move { sched.trigger_now().await })
    };
    let (started, release) = gated.gate.as_ref().unwrap();
    started.notified().await;

    assert!(matches!(
        sched.trigger_now().await,
        Err(SweepError::AlreadyRunning)
    ));

    release.notify_one();
    let summary = running.await.unwrap().unwrap();
    assert_eq!(summary.checked, 1);
    assert_eq!(summary.succeeded, 1);
}

#[tokio::test]
async fn tracked_item_survives_reload_and_records_drop() {
    let dir = tempfile::tempdir().unwrap();
    let board = Arc::new(PriceBoard::fixed(200.0));
    let sink = Arc::new(RecordingNotificationSink::default());
    let sched = scheduler(
        Arc::new(JsonFileStore::new(dir.path())),
        board.clone(),
        sink.clone(),
    );

    let item = sched.track_item(WIDGET, None).await.unwrap();
    assert_eq!(item.tier_at_creation, SupportTier::Whitelist);
    assert_eq!(item.title, "27in Monitor");
    assert_eq!(item.site_name.as_deref(), Some("newegg"));

    *board.price.lock().await = 170.0;
    let summary = sched.trigger_now().await.unwrap();
    assert_eq!((summary.checked, summary.succeeded), (1, 1));

    *board.price.lock().await = 169.0;
    sched.trigger_now().await.unwrap();

    let events = sink.events().await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].old_price, 200.0);
    assert_eq!(events[0].new_price, 170.0);
    assert_eq!(events[0].percent_drop, 15.0);

    let reopened = JsonFileStore::new(dir.path());
    let stored = reopened
        .get_item(TrackedItem::id_for_url(WIDGET))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.current_price, 169.0);
    assert_eq!(stored.initial_price, 200.0);
    let prices: Vec<f64> = stored.price_history.iter().map(|p| p.price).collect();
    assert_eq!(prices, vec![200.0, 170.0, 169.0]);
    assert!(reopened.last_sweep_at().await.unwrap().is_some());
}

async fn track_all(store: Arc<dyn Store>, urls: &[&str]) {
    let sched = scheduler(
        store,
        Arc::new(PriceBoard::fixed(10.0)),
        Arc::new(RecordingNotificationSink::default()),
    );
    for url in urls {
        sched.track_item(url, None).await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn periodic_tick_is_skipped_while_a_sweep_is_in_flight() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn Store> = Arc::new(JsonFileStore::new(dir.path()));
    track_all(store.clone(), &[WIDGET]).await;

    let gated = Arc::new(PriceBoard::gated(9.0));
    let sched = Arc::new(scheduler(
        store.clone(),
        gated.clone(),
        Arc::new(RecordingNotificationSink::default()),
    ));
    let mut jobs = sched.clone().start(Duration::from_millis(500)).await.unwrap();

    let (started, release) = gated.gate.as_ref().unwrap();
    tokio::time::timeout(Duration::from_secs(10), started.notified())
        .await
        .expect("scheduled sweep never started");

    // Several more ticks fire while the first scheduled sweep is parked.
    tokio::time::sleep(Duration::from_millis(1_600)).await;
    assert_eq!(gated.calls(), 1);
    assert!(matches!(
        sched.trigger_now().await,
        Err(SweepError::AlreadyRunning)
    ));

    release.notify_one();

    let item = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let item = store
                .get_item(TrackedItem::id_for_url(WIDGET))
                .await
                .unwrap()
                .unwrap();
            if item.current_price == 9.0 {
                return item;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("scheduled sweep never finished");
    assert_eq!(item.price_history.len(), 2);

    jobs.shutdown().await.unwrap();
}

#[tokio::test]
async fn cancel_stops_only_the_sweep_in_flight() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn Store> = Arc::new(JsonFileStore::new(dir.path()));
    track_all(store.clone(), &[WIDGET, GADGET]).await;

    // Nothing running yet: cancelling is a no-op for the next sweep.
    let idle = scheduler(
        store.clone(),
        Arc::new(PriceBoard::fixed(10.0)),
        Arc::new(RecordingNotificationSink::default()),
    );
    idle.cancel();
    let summary = idle.trigger_now().await.unwrap();
    assert!(!summary.cancelled);
    assert_eq!(summary.checked, 2);

    let gated = Arc::new(PriceBoard::gated(9.0));
    let sched = Arc::new(scheduler(
        store,
        gated.clone(),
        Arc::new(RecordingNotificationSink::default()),
    ));
    let running = {
        let sched = sched.clone();
        tokio::spawn(async move { sched.trigger_now().await })
    };
    let (started, release) = gated.gate.as_ref().unwrap();
    started.notified().await;
    sched.cancel();
    release.notify_one();

    let cancelled = running.await.unwrap().unwrap();
    assert!(cancelled.cancelled);
    assert_eq!(cancelled.checked, 1);
    assert_eq!(gated.calls(), 1);

    let (started, release) = gated.gate.as_ref().unwrap();
    let next = {
        let sched = sched.clone();
        tokio::spawn(async move { sched.trigger_now().await })
    };
    for _ in 0..2 {
        started.notified().await;
        release.notify_one();
    }
    let summary = next.await.unwrap().unwrap();
    assert!(!summary.cancelled);
    assert_eq!(summary.checked, 2);
}

#[tokio::test]
async fn disabled_scheduler_is_not_started() {
    let dir = tempfile::tempdir().unwrap();
    let sched = Arc::new(scheduler(
        Arc::new(JsonFileStore::new(dir.path())),
        Arc::new(PriceBoard::fixed(10.0)),
        Arc::new(RecordingNotificationSink::default()),
    ));
    let config = SyncConfig {
        data_dir: dir.path().to_path_buf(),
        sites_file: None,
        scheduler_enabled: false,
        user_agent: "pricewatch-test".to_string(),
        http_timeout_secs: 5,
        inter_item_delay_ms: 0,
    };
    assert!(sched.maybe_start(&config).await.unwrap().is_none());
}
