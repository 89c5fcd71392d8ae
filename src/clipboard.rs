use anyhow::{Result, anyhow};

#[cfg(not(target_os = "linux"))]
use copypasta::{ClipboardContext, ClipboardProvider};

/// Linux: системные утилиты wl-copy (Wayland) и xclip (X11), смотря
/// какая сессия доступна. Пробуем по очереди, к первой удаче.
#[cfg(target_os = "linux")]
pub fn copy_to_clipboard(value: &str) -> Result<()> {
    let candidates = clipboard_candidates();

    // Ни X11, ни Wayland: скорее всего чистый tty
    if candidates.is_empty() {
        return Err(anyhow!(
            "No GUI clipboard detected (no DISPLAY or WAYLAND_DISPLAY). \
             You might be in a tty. Use:\n  tm show <label> --code-only | xclip -selection clipboard"
        ));
    }

    for (cmd, args) in &candidates {
        if pipe_to(cmd, args, value).is_ok() {
            return Ok(());
        }
    }

    Err(anyhow!(
        "Failed to copy to clipboard: wl-copy/xclip not available or failed.\n\
         Try installing `wl-clipboard` or `xclip`, or use:\n\
         tm show <label> --code-only | xclip -selection clipboard"
    ))
}

#[cfg(target_os = "linux")]
fn clipboard_candidates() -> Vec<(&'static str, &'static [&'static str])> {
    let mut out: Vec<(&'static str, &'static [&'static str])> = Vec::new();
    if std::env::var("WAYLAND_DISPLAY").is_ok() {
        out.push(("wl-copy", &[]));
    }
    if std::env::var("DISPLAY").is_ok() {
        out.push(("xclip", &["-selection", "clipboard"]));
    }
    out
}

#[cfg(target_os = "linux")]
fn pipe_to(cmd: &str, args: &[&str], value: &str) -> Result<()> {
    use std::io::Write;
    use std::process::{Command, Stdio};

    let mut child = Command::new(cmd)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null()) // глушим болтовню утилиты
        .spawn()
        .map_err(|e| anyhow!("failed to spawn {cmd}: {e}"))?;

    if let Some(stdin) = child.stdin.as_mut() {
        stdin.write_all(value.as_bytes())?;
    }

    let status = child.wait()?;
    if !status.success() {
        return Err(anyhow!("{cmd} exited with status {status}"));
    }

    Ok(())
}

/// Не-Linux (Windows/macOS и прочие): используем copypasta.
#[cfg(not(target_os = "linux"))]
pub fn copy_to_clipboard(value: &str) -> Result<()> {
    let mut ctx =
        ClipboardContext::new().map_err(|e| anyhow!("Failed to initialize clipboard: {e}"))?;

    ctx.set_contents(value.to_string())
        .map_err(|e| anyhow!("Failed to copy to clipboard: {e}"))?;

    Ok(())
}
