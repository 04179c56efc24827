use log::debug;
use std::process::{Command, Stdio};

/// Fire-and-forget desktop notifications.
pub trait DesktopNotifier: Send {
    fn notify(&self, title: &str, message: &str);
}

/// Uses `notify-send` on Linux and `osascript` on macOS. Failures are only
/// logged.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemNotifier;

impl SystemNotifier {
    #[cfg(target_os = "macos")]
    fn command(title: &str, message: &str) -> Command {
        let quote = |s: &str| s.replace('\\', "\\\\").replace('"', "\\\"");
        let mut command = Command::new("osascript");
        command.arg("-e").arg(format!(
            "display notification \"{}\" with title \"{}\"",
            quote(message),
            quote(title)
        ));
        command
    }

    #[cfg(not(target_os = "macos"))]
    fn command(title: &str, message: &str) -> Command {
        let mut command = Command::new("notify-send");
        command.arg(title).arg(message);
        command
    }
}

impl DesktopNotifier for SystemNotifier {
    fn notify(&self, title: &str, message: &str) {
        let spawned = Self::command(title, message)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();
        if let Err(e) = spawned {
            debug!("Desktop notification failed: {e}");
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

impl DesktopNotifier for NoopNotifier {
    fn notify(&self, _title: &str, _message: &str) {}
}
