use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use manilink_client::{
    BoundedRequest, DeliveryOrchestrator, DeliverySettings, DeliveryState, DeliveryTarget,
    LinkEncoder, NotificationBoard,
    delivery::{BackendError, ClipboardApi, ContextOpener, CopySurface, CopySurfaceHost},
    orchestrator::BUSY_MESSAGE,
};
use manilink_core::{
    AddonEntry, ConfigBuilder, Configuration, DeliveryOutcome, NotificationPhase, Origin,
    Validation, decode_local,
};
use serde_json::json;
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{method, path},
};

const ENCRYPT_PATH: &str = "/encrypt-user-data";

#[derive(Default)]
struct RecordingClipboard {
    writes: Mutex<Vec<String>>,
    fail: bool,
}

impl ClipboardApi for RecordingClipboard {
    fn write_text(&self, text: &str) -> Result<(), BackendError> {
        if self.fail {
            return Err(BackendError::Failed("write rejected".to_owned()));
        }
        self.writes.lock().unwrap().push(text.to_owned());
        Ok(())
    }
}

#[derive(Default)]
struct RecordingOpener {
    opened: Mutex<Vec<String>>,
    blocked: AtomicBool,
}

impl ContextOpener for RecordingOpener {
    fn open(&self, url: &str) -> Result<(), BackendError> {
        if self.blocked.load(Ordering::SeqCst) {
            return Err(BackendError::Failed("popup blocked".to_owned()));
        }
        self.opened.lock().unwrap().push(url.to_owned());
        Ok(())
    }
}

/// Blocks the calling thread like a slow platform URL handler.
struct SlowOpener {
    delay: Duration,
}

impl ContextOpener for SlowOpener {
    fn open(&self, _url: &str) -> Result<(), BackendError> {
        std::thread::sleep(self.delay);
        Ok(())
    }
}

#[derive(Default)]
struct SurfaceCounters {
    created: AtomicUsize,
    removed: AtomicUsize,
    copied: Mutex<Vec<String>>,
}

struct CountingHost {
    counters: Arc<SurfaceCounters>,
    copy_succeeds: bool,
}

struct CountingSurface {
    counters: Arc<SurfaceCounters>,
    text: String,
    copy_succeeds: bool,
}

impl CopySurfaceHost for CountingHost {
    fn create(&self) -> Result<Box<dyn CopySurface>, BackendError> {
        self.counters.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(CountingSurface {
            counters: Arc::clone(&self.counters),
            text: String::new(),
            copy_succeeds: self.copy_succeeds,
        }))
    }
}

impl CopySurface for CountingSurface {
    fn populate(&mut self, text: &str) -> Result<(), BackendError> {
        self.text = text.to_owned();
        Ok(())
    }

    fn select(&mut self) -> Result<(), BackendError> {
        Ok(())
    }

    fn copy(&mut self) -> Result<bool, BackendError> {
        if self.copy_succeeds {
            self.counters.copied.lock().unwrap().push(self.text.clone());
        }
        Ok(self.copy_succeeds)
    }

    fn remove(&mut self) {
        self.counters.removed.fetch_add(1, Ordering::SeqCst);
    }
}

struct Harness {
    orchestrator: DeliveryOrchestrator,
    board: Arc<NotificationBoard>,
    clipboard: Arc<RecordingClipboard>,
    opener: Arc<RecordingOpener>,
    surfaces: Arc<SurfaceCounters>,
}

fn harness(origin: &str, endpoint: String, timeout: Duration) -> Harness {
    let board = Arc::new(NotificationBoard::default());
    let clipboard = Arc::new(RecordingClipboard::default());
    let opener = Arc::new(RecordingOpener::default());
    let surfaces = Arc::new(SurfaceCounters::default());

    let encoder = LinkEncoder::new(BoundedRequest::new(timeout), endpoint);
    let settings = DeliverySettings::new(Origin::parse(origin).expect("valid origin"));
    let orchestrator = DeliveryOrchestrator::new(encoder, settings)
        .with_notifier(board.clone())
        .with_clipboard(Some(clipboard.clone()))
        .with_opener(opener.clone())
        .with_surface_host(Arc::new(CountingHost {
            counters: Arc::clone(&surfaces),
            copy_succeeds: true,
        }));

    Harness {
        orchestrator,
        board,
        clipboard,
        opener,
        surfaces,
    }
}

async fn mock_harness(server: &MockServer) -> Harness {
    harness(
        &server.uri(),
        format!("{}{}", server.uri(), ENCRYPT_PATH),
        Duration::from_secs(2),
    )
}

fn sample_config() -> Configuration {
    let mut builder = ConfigBuilder::new();
    builder.edit(|p| {
        p.addons.push(AddonEntry {
            id: "torrentio".to_owned(),
            options: Default::default(),
        });
        p.excluded_languages = Some(Vec::new());
    });
    builder.assemble()
}

/// Segment between the origin and `/manifest.json`.
fn segment_of(manifest: &str) -> &str {
    let without_suffix = manifest
        .strip_suffix("/manifest.json")
        .expect("manifest suffix");
    without_suffix
        .rsplit('/')
        .next()
        .expect("segment present")
}

#[tokio::test]
async fn encrypted_token_becomes_manifest_segment() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(ENCRYPT_PATH))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"success": true, "data": "abc123"})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let h = mock_harness(&server).await;
    let outcome = h
        .orchestrator
        .deliver(DeliveryTarget::Clipboard, &sample_config())
        .await;

    let expected = format!("{}/abc123/manifest.json", server.uri());
    assert_eq!(outcome, DeliveryOutcome::delivered(expected.clone()));
    assert_eq!(*h.clipboard.writes.lock().unwrap(), vec![expected]);
    assert_eq!(h.orchestrator.manual_fallback(), None);

    let requests = server.received_requests().await.expect("recording enabled");
    let body: serde_json::Value = serde_json::from_slice(&requests[0].body).expect("json body");
    let data = body["data"].as_str().expect("data is a string");
    let sent: Configuration = serde_json::from_str(data).expect("data holds the config");
    assert_eq!(sent, sample_config());
}

#[tokio::test]
async fn timeout_falls_back_to_local_encoding() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(ENCRYPT_PATH))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"success": true, "data": "too-late"}))
                .set_delay(Duration::from_secs(3)),
        )
        .mount(&server)
        .await;

    let h = harness(
        &server.uri(),
        format!("{}{}", server.uri(), ENCRYPT_PATH),
        Duration::from_millis(200),
    );
    let config = sample_config();
    let outcome = h.orchestrator.deliver(DeliveryTarget::Clipboard, &config).await;

    assert!(outcome.success);
    let manifest = outcome.manifest.expect("manifest produced");
    assert!(manifest.ends_with("/manifest.json"));
    assert_eq!(decode_local(segment_of(&manifest)).unwrap(), config);

    let record = h
        .board
        .get(DeliveryTarget::Clipboard.notification_identity())
        .expect("notification visible");
    assert_eq!(record.phase, NotificationPhase::Success);
}

#[tokio::test]
async fn unreachable_service_falls_back_to_local_encoding() {
    let h = harness(
        "https://addon.example.com",
        "http://127.0.0.1:1/encrypt-user-data".to_owned(),
        Duration::from_secs(2),
    );
    let config = sample_config();
    let outcome = h.orchestrator.deliver(DeliveryTarget::Native, &config).await;

    assert!(outcome.success);
    let manifest = outcome.manifest.expect("manifest produced");
    assert!(manifest.starts_with("https://addon.example.com/"));
    assert_eq!(decode_local(segment_of(&manifest)).unwrap(), config);

    let opened = h.opener.opened.lock().unwrap();
    assert_eq!(opened.len(), 1);
    assert!(opened[0].starts_with("stremio://addon.example.com/"));
}

#[tokio::test]
async fn explicit_rejection_halts_the_pipeline() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(ENCRYPT_PATH))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"success": false, "error": "rate limited"})),
        )
        .mount(&server)
        .await;

    let h = mock_harness(&server).await;
    let outcome = h
        .orchestrator
        .deliver(DeliveryTarget::Clipboard, &sample_config())
        .await;

    assert_eq!(
        outcome,
        DeliveryOutcome {
            success: false,
            manifest: None,
            message: Some("rate limited".to_owned()),
        }
    );
    assert!(h.clipboard.writes.lock().unwrap().is_empty());
    assert_eq!(h.surfaces.created.load(Ordering::SeqCst), 0);
    assert_eq!(h.orchestrator.manual_fallback(), None);

    let record = h
        .board
        .get(DeliveryTarget::Clipboard.notification_identity())
        .expect("notification visible");
    assert_eq!(record.phase, NotificationPhase::Error);
    assert_eq!(record.message, "rate limited");
}

#[tokio::test]
async fn soft_failures_fall_back_to_local_encoding() {
    let responses = [
        ResponseTemplate::new(200)
            .set_body_json(json!({"success": false, "message": "key rotation in progress"})),
        ResponseTemplate::new(200).set_body_json(json!({"success": false, "error": ""})),
        ResponseTemplate::new(503).set_body_json(json!({"success": true, "data": "ignored"})),
        ResponseTemplate::new(200).set_body_string("<html>bad gateway</html>"),
        ResponseTemplate::new(200).set_body_json(json!({"success": true})),
    ];

    for response in responses {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(ENCRYPT_PATH))
            .respond_with(response)
            .mount(&server)
            .await;

        let h = mock_harness(&server).await;
        let config = sample_config();
        let outcome = h.orchestrator.deliver(DeliveryTarget::Clipboard, &config).await;
        assert!(outcome.success, "unexpected outcome {outcome:?}");
        let manifest = outcome.manifest.expect("manifest produced");
        assert_eq!(decode_local(segment_of(&manifest)).unwrap(), config);
    }
}

#[tokio::test]
async fn rejected_config_never_reaches_the_network() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success": true, "data": "x"})))
        .expect(0)
        .mount(&server)
        .await;

    let h = mock_harness(&server).await;
    let orchestrator = h.orchestrator.with_validator(Arc::new(|_: &Configuration| {
        Validation::rejected("noAddons", "Please add at least one addon")
    }));

    let outcome = orchestrator
        .deliver(DeliveryTarget::Native, &sample_config())
        .await;
    assert_eq!(outcome, DeliveryOutcome::failed("Please add at least one addon"));

    let requests = server.received_requests().await.expect("recording enabled");
    assert!(requests.is_empty());

    let visible = h.board.visible();
    assert_eq!(visible.len(), 1);
    assert_eq!(visible[0].identity, "noAddons");
    assert_eq!(visible[0].phase, NotificationPhase::Error);
}

#[tokio::test]
async fn standard_validator_blocks_empty_addon_list() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success": true, "data": "x"})))
        .expect(0)
        .mount(&server)
        .await;

    let h = mock_harness(&server).await;
    let outcome = h
        .orchestrator
        .deliver_from(DeliveryTarget::Clipboard, &ConfigBuilder::new())
        .await;
    assert!(!outcome.success);
    assert!(h.board.get("noAddons").is_some());
}

#[tokio::test]
async fn missing_clipboard_uses_legacy_copy_once() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success": true, "data": "tok"})))
        .mount(&server)
        .await;

    let h = mock_harness(&server).await;
    let orchestrator = h.orchestrator.with_clipboard(None);
    let outcome = orchestrator
        .deliver(DeliveryTarget::Clipboard, &sample_config())
        .await;

    assert!(outcome.success);
    assert_eq!(h.surfaces.created.load(Ordering::SeqCst), 1);
    assert_eq!(h.surfaces.removed.load(Ordering::SeqCst), 1);
    assert_eq!(
        *h.surfaces.copied.lock().unwrap(),
        vec![format!("{}/tok/manifest.json", server.uri())]
    );
}

#[tokio::test]
async fn rejected_clipboard_write_uses_legacy_copy() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success": true, "data": "tok"})))
        .mount(&server)
        .await;

    let h = mock_harness(&server).await;
    let orchestrator = h.orchestrator.with_clipboard(Some(Arc::new(RecordingClipboard {
        writes: Mutex::new(Vec::new()),
        fail: true,
    })));
    let outcome = orchestrator
        .deliver(DeliveryTarget::Clipboard, &sample_config())
        .await;

    assert!(outcome.success);
    assert_eq!(h.surfaces.created.load(Ordering::SeqCst), 1);
    assert_eq!(h.surfaces.removed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn failed_legacy_copy_leaves_manual_link() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success": true, "data": "tok"})))
        .mount(&server)
        .await;

    let h = mock_harness(&server).await;
    let counters = Arc::new(SurfaceCounters::default());
    let orchestrator = h
        .orchestrator
        .with_clipboard(None)
        .with_surface_host(Arc::new(CountingHost {
            counters: Arc::clone(&counters),
            copy_succeeds: false,
        }));
    let outcome = orchestrator
        .deliver(DeliveryTarget::Clipboard, &sample_config())
        .await;

    let manifest = format!("{}/tok/manifest.json", server.uri());
    assert!(!outcome.success);
    assert_eq!(outcome.manifest.as_deref(), Some(manifest.as_str()));
    assert_eq!(orchestrator.manual_fallback(), Some(manifest));
    assert_eq!(counters.created.load(Ordering::SeqCst), 1);
    assert_eq!(counters.removed.load(Ordering::SeqCst), 1);

    let record = h
        .board
        .get(DeliveryTarget::Clipboard.notification_identity())
        .expect("notification visible");
    assert_eq!(record.phase, NotificationPhase::Error);
}

#[tokio::test]
async fn web_handoff_failure_then_success_clears_manual_link() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success": true, "data": "tok"})))
        .mount(&server)
        .await;

    let h = mock_harness(&server).await;
    let manifest = format!("{}/tok/manifest.json", server.uri());
    let web_url = format!(
        "https://web.stremio.com/#/addons?addon={}",
        manifest
            .replace(':', "%3A")
            .replace('/', "%2F")
    );

    h.opener.blocked.store(true, Ordering::SeqCst);
    let failed = h.orchestrator.deliver(DeliveryTarget::Web, &sample_config()).await;
    assert!(!failed.success);
    assert_eq!(h.orchestrator.manual_fallback(), Some(web_url.clone()));
    assert_eq!(
        h.orchestrator.state(DeliveryTarget::Web),
        DeliveryState::Terminal { success: false }
    );

    h.opener.blocked.store(false, Ordering::SeqCst);
    let delivered = h.orchestrator.deliver(DeliveryTarget::Web, &sample_config()).await;
    assert_eq!(delivered, DeliveryOutcome::delivered(manifest));
    assert_eq!(h.orchestrator.manual_fallback(), None);
    assert_eq!(*h.opener.opened.lock().unwrap(), vec![web_url]);
    assert_eq!(
        h.orchestrator.state(DeliveryTarget::Web),
        DeliveryState::Terminal { success: true }
    );
}

#[tokio::test]
async fn overlapping_runs_of_one_intent_are_refused() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"success": true, "data": "slow"}))
                .set_delay(Duration::from_millis(300)),
        )
        .mount(&server)
        .await;

    let h = mock_harness(&server).await;
    let config = sample_config();
    let (first, second, other) = tokio::join!(
        h.orchestrator.deliver(DeliveryTarget::Clipboard, &config),
        h.orchestrator.deliver(DeliveryTarget::Clipboard, &config),
        h.orchestrator.deliver(DeliveryTarget::Native, &config),
    );

    assert!(first.success);
    assert_eq!(second, DeliveryOutcome::failed(BUSY_MESSAGE));
    assert!(other.success);
    assert_eq!(h.clipboard.writes.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn slow_handoff_does_not_stall_the_runtime() {
    let h = harness(
        "https://addon.example.com",
        "http://127.0.0.1:1/encrypt-user-data".to_owned(),
        Duration::from_secs(2),
    );
    let orchestrator = h.orchestrator.with_opener(Arc::new(SlowOpener {
        delay: Duration::from_millis(600),
    }));
    let config = sample_config();

    let ticker = async {
        let mut worst = Duration::ZERO;
        let mut last = Instant::now();
        for _ in 0..25 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let now = Instant::now();
            worst = worst.max(now - last);
            last = now;
        }
        worst
    };
    let (outcome, worst_tick) = tokio::join!(
        orchestrator.deliver(DeliveryTarget::Native, &config),
        ticker
    );

    assert!(outcome.success);
    assert!(
        worst_tick < Duration::from_millis(300),
        "timer starved for {worst_tick:?}"
    );
}
