//! Screen capture: grab the screen as PNG bytes by running a platform screenshot tool.
//!
//! No shell is used; the command is an argument list and must write the PNG to stdout.

use async_trait::async_trait;
use std::process::Command;

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("no screenshot command configured for this platform (set capture.command)")]
    Unconfigured,
    #[error("screenshot command failed to start: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("screenshot command {status}: {stderr}")]
    Failed { status: String, stderr: String },
    #[error("screenshot command produced no image data")]
    Empty,
    #[error("screenshot task panicked")]
    Join,
}

/// Source of screenshots. Synchronous and single-shot from the caller's point of view.
#[async_trait]
pub trait ScreenCapture: Send + Sync {
    /// Capture the full screen as PNG bytes.
    async fn capture_png(&self) -> Result<Vec<u8>, CaptureError>;
}

/// PowerShell that grabs the primary screen with System.Drawing and writes the PNG to stdout.
/// GDI+ cannot encode PNG into a non-seekable stream, so it goes through a MemoryStream first.
const WINDOWS_CAPTURE_SCRIPT: &str = "Add-Type -AssemblyName System.Windows.Forms,System.Drawing; \
$b = [System.Windows.Forms.Screen]::PrimaryScreen.Bounds; \
$bmp = New-Object System.Drawing.Bitmap $b.Width, $b.Height; \
$g = [System.Drawing.Graphics]::FromImage($bmp); \
$g.CopyFromScreen($b.Location, [System.Drawing.Point]::Empty, $b.Size); \
$ms = New-Object System.IO.MemoryStream; \
$bmp.Save($ms, [System.Drawing.Imaging.ImageFormat]::Png); \
$out = [Console]::OpenStandardOutput(); \
$out.Write($ms.ToArray(), 0, [int]$ms.Length); \
$out.Flush()";

/// Default command for this platform. See [`default_capture_command_for`].
pub fn default_capture_command() -> Option<Vec<String>> {
    default_capture_command_for(std::env::consts::OS)
}

/// Default command for `os` (a `std::env::consts::OS` value): `screencapture` on macOS,
/// `grim` (wlroots) on Linux, PowerShell + System.Drawing on Windows. Other systems need
/// `capture.command`.
pub fn default_capture_command_for(os: &str) -> Option<Vec<String>> {
    let argv: &[&str] = match os {
        "macos" => &["screencapture", "-x", "-t", "png", "/dev/stdout"],
        "linux" => &["grim", "-"],
        "windows" => &[
            "powershell",
            "-NoProfile",
            "-NonInteractive",
            "-Command",
            WINDOWS_CAPTURE_SCRIPT,
        ],
        _ => return None,
    };
    Some(argv.iter().map(|s| s.to_string()).collect())
}

/// Runs an external program and reads the PNG from its stdout.
#[derive(Debug, Clone)]
pub struct CommandCapture {
    argv: Option<Vec<String>>,
}

impl CommandCapture {
    /// `argv` of `None` (or empty) falls back to [`default_capture_command`].
    pub fn new(argv: Option<Vec<String>>) -> Self {
        let argv = argv
            .filter(|a| !a.is_empty())
            .or_else(default_capture_command);
        Self { argv }
    }

    /// Blocking run; called on the blocking pool.
    fn run(argv: &[String]) -> Result<Vec<u8>, CaptureError> {
        let (program, args) = argv.split_first().ok_or(CaptureError::Unconfigured)?;
        let output = Command::new(program).args(args).output()?;
        if !output.status.success() {
            return Err(CaptureError::Failed {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        if output.stdout.is_empty() {
            return Err(CaptureError::Empty);
        }
        Ok(output.stdout)
    }
}

#[async_trait]
impl ScreenCapture for CommandCapture {
    async fn capture_png(&self) -> Result<Vec<u8>, CaptureError> {
        let argv = self.argv.clone().ok_or(CaptureError::Unconfigured)?;
        tokio::task::spawn_blocking(move || Self::run(&argv))
            .await
            .map_err(|_| CaptureError::Join)?
    }
}
