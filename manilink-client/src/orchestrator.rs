use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, PoisonError},
};

use manilink_core::{
    ConfigBuilder, ConfigValidator, Configuration, DEFAULT_NATIVE_SCHEME, DEFAULT_WEB_APP_ENTRY,
    DeliveryOutcome, ManifestUrl, NotificationPhase, Origin, StandardValidator,
};
use tracing::{info, warn};

use crate::{
    delivery::{
        ArboardClipboard, BackendError, ClipboardApi, CommandSurfaceHost, ContextOpener,
        CopySurfaceHost, SystemOpener, copy_with_surface,
    },
    encoder::LinkEncoder,
    notify::{NotificationBoard, NotificationChannel},
};

pub const GENERATING_MESSAGE: &str = "Generating manifest URL...";
pub const INVALID_CONFIG_MESSAGE: &str = "Invalid config";
pub const INVALID_CONFIG_IDENTITY: &str = "error";
pub const BUSY_MESSAGE: &str = "A delivery for this target is already in progress";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryTarget {
    Native,
    Web,
    Clipboard,
}

impl DeliveryTarget {
    /// Notification slot shared by every run of this intent.
    pub fn notification_identity(self) -> &'static str {
        match self {
            DeliveryTarget::Native => "generatingManifestUrl",
            DeliveryTarget::Web => "generatingManifestUrl:web",
            DeliveryTarget::Clipboard => "generatingManifestUrl:clipboard",
        }
    }

    fn success_message(self) -> &'static str {
        match self {
            DeliveryTarget::Native => "Successfully generated manifest URL",
            DeliveryTarget::Web => "Successfully generated manifest URL and opened the web app",
            DeliveryTarget::Clipboard => "Manifest URL copied to clipboard",
        }
    }

    fn failure_message(self) -> &'static str {
        match self {
            DeliveryTarget::Native => {
                "Failed to open the app with the manifest URL. The link can be opened manually."
            }
            DeliveryTarget::Web => {
                "Failed to open the web app with the manifest URL. The link can be opened manually."
            }
            DeliveryTarget::Clipboard => {
                "Failed to copy manifest URL to clipboard. The link can be copied manually."
            }
        }
    }
}

impl fmt::Display for DeliveryTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            DeliveryTarget::Native => "native",
            DeliveryTarget::Web => "web",
            DeliveryTarget::Clipboard => "clipboard",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Idle,
    Encoding,
    Delivering,
    Terminal { success: bool },
}

impl DeliveryState {
    fn in_flight(self) -> bool {
        matches!(self, DeliveryState::Encoding | DeliveryState::Delivering)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliverySettings {
    pub origin: Origin,
    pub native_scheme: String,
    pub web_app_entry: String,
}

impl DeliverySettings {
    pub fn new(origin: Origin) -> Self {
        Self {
            origin,
            native_scheme: DEFAULT_NATIVE_SCHEME.to_owned(),
            web_app_entry: DEFAULT_WEB_APP_ENTRY.to_owned(),
        }
    }
}

/// Runs one delivery intent: validate, encode, hand off, report.
pub struct DeliveryOrchestrator {
    encoder: LinkEncoder,
    settings: DeliverySettings,
    validator: Arc<dyn ConfigValidator>,
    notifier: Arc<dyn NotificationChannel>,
    opener: Arc<dyn ContextOpener>,
    clipboard: Option<Arc<dyn ClipboardApi>>,
    surface_host: Arc<dyn CopySurfaceHost>,
    states: Mutex<HashMap<DeliveryTarget, DeliveryState>>,
    manual_fallback: Mutex<Option<String>>,
}

impl fmt::Debug for DeliveryOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliveryOrchestrator")
            .field("encoder", &self.encoder)
            .field("settings", &self.settings)
            .field("states", &self.states)
            .field("manual_fallback", &self.manual_fallback)
            .finish_non_exhaustive()
    }
}

impl DeliveryOrchestrator {
    pub fn new(encoder: LinkEncoder, settings: DeliverySettings) -> Self {
        Self {
            encoder,
            settings,
            validator: Arc::new(StandardValidator),
            notifier: Arc::new(NotificationBoard::default()),
            opener: Arc::new(SystemOpener),
            clipboard: Some(Arc::new(ArboardClipboard)),
            surface_host: Arc::new(CommandSurfaceHost::default()),
            states: Mutex::new(HashMap::new()),
            manual_fallback: Mutex::new(None),
        }
    }

    pub fn with_validator(mut self, validator: Arc<dyn ConfigValidator>) -> Self {
        self.validator = validator;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn NotificationChannel>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_opener(mut self, opener: Arc<dyn ContextOpener>) -> Self {
        self.opener = opener;
        self
    }

    /// `None` means no direct clipboard access; copies go straight to the
    /// legacy surface.
    pub fn with_clipboard(mut self, clipboard: Option<Arc<dyn ClipboardApi>>) -> Self {
        self.clipboard = clipboard;
        self
    }

    pub fn with_surface_host(mut self, host: Arc<dyn CopySurfaceHost>) -> Self {
        self.surface_host = host;
        self
    }

    pub fn state(&self, target: DeliveryTarget) -> DeliveryState {
        self.states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&target)
            .copied()
            .unwrap_or(DeliveryState::Idle)
    }

    /// Last-resort link to show when automated delivery failed.
    pub fn manual_fallback(&self) -> Option<String> {
        self.manual_fallback
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Assembles a fresh snapshot from `builder` and delivers it.
    pub async fn deliver_from(
        &self,
        target: DeliveryTarget,
        builder: &ConfigBuilder,
    ) -> DeliveryOutcome {
        let config = builder.assemble();
        self.deliver(target, &config).await
    }

    pub async fn deliver(&self, target: DeliveryTarget, config: &Configuration) -> DeliveryOutcome {
        let Some(mut run) = self.begin(target) else {
            warn!(intent = %target, "delivery already in flight, ignoring new intent");
            return DeliveryOutcome::failed(BUSY_MESSAGE);
        };

        let outcome = self.run(target, config).await;
        run.success = outcome.success;
        outcome
    }

    fn begin(&self, target: DeliveryTarget) -> Option<InFlight<'_>> {
        let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        let state = states.entry(target).or_insert(DeliveryState::Idle);
        if state.in_flight() {
            return None;
        }
        *state = DeliveryState::Encoding;
        Some(InFlight {
            orchestrator: self,
            target,
            success: false,
        })
    }

    fn set_state(&self, target: DeliveryTarget, state: DeliveryState) {
        self.states
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(target, state);
    }

    fn set_manual_fallback(&self, url: Option<String>) {
        *self
            .manual_fallback
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = url;
    }

    async fn run(&self, target: DeliveryTarget, config: &Configuration) -> DeliveryOutcome {
        let verdict = self.validator.validate(config);
        if !verdict.valid {
            let message = verdict
                .error_message
                .unwrap_or_else(|| INVALID_CONFIG_MESSAGE.to_owned());
            let identity = verdict
                .error_code
                .unwrap_or_else(|| INVALID_CONFIG_IDENTITY.to_owned());
            warn!(intent = %target, code = %identity, "config rejected: {}", message);
            self.notifier
                .open(&identity, NotificationPhase::Error, &message);
            return DeliveryOutcome::failed(message);
        }

        let identity = target.notification_identity();
        self.notifier
            .open(identity, NotificationPhase::Loading, GENERATING_MESSAGE);

        let manifest = match self.encoder.encode(config).await {
            Ok(segment) => ManifestUrl::build(&self.settings.origin, &segment),
            Err(err) => {
                let message = err.to_string();
                warn!(intent = %target, "manifest URL generation failed: {}", message);
                self.notifier
                    .update(identity, NotificationPhase::Error, &message);
                return DeliveryOutcome::failed(message);
            }
        };

        self.set_state(target, DeliveryState::Delivering);
        let handoff_url = match target {
            DeliveryTarget::Native => manifest.with_scheme(&self.settings.native_scheme),
            DeliveryTarget::Web => manifest.web_install_url(&self.settings.web_app_entry),
            DeliveryTarget::Clipboard => manifest.as_str().to_owned(),
        };
        let result = self.hand_off(target, handoff_url.clone()).await;

        match result {
            Ok(()) => {
                info!(intent = %target, manifest = %manifest, "manifest URL delivered");
                self.notifier
                    .update(identity, NotificationPhase::Success, target.success_message());
                self.set_manual_fallback(None);
                DeliveryOutcome::delivered(manifest)
            }
            Err(err) => {
                warn!(intent = %target, "delivery failed: {}", err);
                self.notifier
                    .update(identity, NotificationPhase::Error, target.failure_message());
                self.set_manual_fallback(Some(handoff_url));
                DeliveryOutcome::undelivered(manifest, target.failure_message())
            }
        }
    }

    /// Runs on the blocking pool; platform surfaces wait on helper processes.
    async fn hand_off(&self, target: DeliveryTarget, url: String) -> Result<(), BackendError> {
        let task = match target {
            DeliveryTarget::Native | DeliveryTarget::Web => {
                let opener = Arc::clone(&self.opener);
                tokio::task::spawn_blocking(move || opener.open(&url))
            }
            DeliveryTarget::Clipboard => {
                let clipboard = self.clipboard.clone();
                let host = Arc::clone(&self.surface_host);
                tokio::task::spawn_blocking(move || {
                    copy_link(clipboard.as_deref(), host.as_ref(), &url)
                })
            }
        };
        match task.await {
            Ok(result) => result,
            Err(err) => Err(BackendError::Failed(format!("delivery task failed: {err}"))),
        }
    }
}

fn copy_link(
    clipboard: Option<&dyn ClipboardApi>,
    host: &dyn CopySurfaceHost,
    text: &str,
) -> Result<(), BackendError> {
    if let Some(clipboard) = clipboard {
        match clipboard.write_text(text) {
            Ok(()) => return Ok(()),
            Err(err) => warn!("clipboard write failed, trying legacy copy: {}", err),
        }
    }
    copy_with_surface(host, text)
}

/// Moves the target out of its in-flight state however the run ends,
/// including when the future is dropped.
struct InFlight<'a> {
    orchestrator: &'a DeliveryOrchestrator,
    target: DeliveryTarget,
    success: bool,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.orchestrator.set_state(
            self.target,
            DeliveryState::Terminal {
                success: self.success,
            },
        );
    }
}
