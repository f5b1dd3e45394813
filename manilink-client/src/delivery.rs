//! Platform surfaces a manifest link can be handed to.
//!
//! Each surface is a trait so the orchestrator can be driven against
//! in-memory doubles; the shipped implementations talk to the desktop.

use std::{
    io::Write,
    process::{Child, Command, Stdio},
};

use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("capability unavailable: {0}")]
    Unavailable(String),
    #[error("{0}")]
    Failed(String),
}

/// Opens a URL in a new browsing context (browser tab or registered app).
pub trait ContextOpener: Send + Sync {
    fn open(&self, url: &str) -> Result<(), BackendError>;
}

/// Direct clipboard write.
pub trait ClipboardApi: Send + Sync {
    fn write_text(&self, text: &str) -> Result<(), BackendError>;
}

/// A transient element used by the legacy copy technique.
pub trait CopySurface {
    fn populate(&mut self, text: &str) -> Result<(), BackendError>;
    fn select(&mut self) -> Result<(), BackendError>;
    /// `Ok(false)` when the copy ran but reported failure.
    fn copy(&mut self) -> Result<bool, BackendError>;
    fn remove(&mut self);
}

pub trait CopySurfaceHost: Send + Sync {
    fn create(&self) -> Result<Box<dyn CopySurface>, BackendError>;
}

struct SurfaceGuard(Box<dyn CopySurface>);

impl Drop for SurfaceGuard {
    fn drop(&mut self) {
        self.0.remove();
    }
}

/// Create, populate, select, copy; the surface is removed on every path.
pub fn copy_with_surface(host: &dyn CopySurfaceHost, text: &str) -> Result<(), BackendError> {
    let mut surface = SurfaceGuard(host.create()?);
    surface.0.populate(text)?;
    surface.0.select()?;
    if surface.0.copy()? {
        Ok(())
    } else {
        Err(BackendError::Failed("copy command reported failure".to_owned()))
    }
}

/// Hands URLs to the desktop's URL handler.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemOpener;

impl ContextOpener for SystemOpener {
    fn open(&self, url: &str) -> Result<(), BackendError> {
        #[cfg(target_os = "macos")]
        let status = Command::new("open").arg(url).status();
        #[cfg(target_os = "windows")]
        let status = Command::new("cmd")
            .arg("/C")
            .arg("start")
            .arg("")
            .arg(url)
            .status();
        #[cfg(all(unix, not(target_os = "macos")))]
        let status = Command::new("xdg-open").arg(url).status();

        let status = status.map_err(|err| BackendError::Unavailable(err.to_string()))?;
        if !status.success() {
            return Err(BackendError::Failed(format!(
                "URL handler exited with code {}",
                status.code().unwrap_or(-1)
            )));
        }
        debug!(url, "opened browsing context");
        Ok(())
    }
}

/// System clipboard through `arboard`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ArboardClipboard;

impl ClipboardApi for ArboardClipboard {
    fn write_text(&self, text: &str) -> Result<(), BackendError> {
        let mut clipboard =
            arboard::Clipboard::new().map_err(|err| BackendError::Unavailable(err.to_string()))?;
        clipboard
            .set_text(text.to_owned())
            .map_err(|err| BackendError::Failed(err.to_string()))
    }
}

/// Legacy copy through a short-lived platform copy process fed on stdin.
#[derive(Debug, Clone)]
pub struct CommandSurfaceHost {
    candidates: Vec<(String, Vec<String>)>,
}

impl Default for CommandSurfaceHost {
    fn default() -> Self {
        #[cfg(target_os = "macos")]
        let candidates: &[(&str, &[&str])] = &[("pbcopy", &[])];
        #[cfg(target_os = "windows")]
        let candidates: &[(&str, &[&str])] = &[("clip", &[])];
        #[cfg(all(unix, not(target_os = "macos")))]
        let candidates: &[(&str, &[&str])] = &[
            ("wl-copy", &[]),
            ("xclip", &["-selection", "clipboard"]),
            ("xsel", &["--clipboard", "--input"]),
        ];

        Self::new(
            candidates
                .iter()
                .map(|(program, args)| {
                    (
                        (*program).to_owned(),
                        args.iter().map(|a| (*a).to_owned()).collect(),
                    )
                })
                .collect(),
        )
    }
}

impl CommandSurfaceHost {
    /// `candidates` are tried in order until one can be spawned.
    pub fn new(candidates: Vec<(String, Vec<String>)>) -> Self {
        Self { candidates }
    }
}

impl CopySurfaceHost for CommandSurfaceHost {
    fn create(&self) -> Result<Box<dyn CopySurface>, BackendError> {
        for (program, args) in &self.candidates {
            let spawned = Command::new(program)
                .args(args)
                .stdin(Stdio::piped())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .spawn();
            match spawned {
                Ok(child) => {
                    debug!(program, "spawned copy process");
                    return Ok(Box::new(CommandSurface { child }));
                }
                Err(err) => debug!(program, "copy command unavailable: {}", err),
            }
        }
        Err(BackendError::Unavailable(
            "no clipboard copy command found".to_owned(),
        ))
    }
}

struct CommandSurface {
    child: Child,
}

impl CopySurface for CommandSurface {
    fn populate(&mut self, text: &str) -> Result<(), BackendError> {
        let stdin = self
            .child
            .stdin
            .as_mut()
            .ok_or_else(|| BackendError::Failed("copy process has no stdin".to_owned()))?;
        stdin
            .write_all(text.as_bytes())
            .map_err(|err| BackendError::Failed(err.to_string()))
    }

    fn select(&mut self) -> Result<(), BackendError> {
        // Closing stdin marks the end of the selection.
        drop(self.child.stdin.take());
        Ok(())
    }

    fn copy(&mut self) -> Result<bool, BackendError> {
        let status = self
            .child
            .wait()
            .map_err(|err| BackendError::Failed(err.to_string()))?;
        Ok(status.success())
    }

    fn remove(&mut self) {
        drop(self.child.stdin.take());
        match self.child.try_wait() {
            Ok(Some(_)) => {}
            _ => {
                if let Err(err) = self.child.kill() {
                    warn!("failed to kill copy process: {}", err);
                }
                let _ = self.child.wait();
            }
        }
    }
}
