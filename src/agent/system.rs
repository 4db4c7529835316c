//! OS capabilities behind a trait seam: input blocking and network
//! adapter control. The dispatcher only cares about ok/error strings, so
//! tests swap in a mock and count invocations.

use anyhow::{bail, Context, Result};
use std::process::Command;

pub trait SystemOps: Send + Sync {
    /// Block or unblock local keyboard/mouse input.
    fn block_input(&self, blocked: bool) -> Result<()>;

    /// Names of the network adapters to toggle. Implementations fall back
    /// to a static guess when enumeration fails.
    fn list_adapters(&self) -> Vec<String>;

    /// Administratively enable/disable one adapter.
    fn set_adapter(&self, name: &str, enabled: bool) -> Result<()>;
}

/// Real implementation backed by the platform tools.
pub struct NativeSystem;

#[cfg(windows)]
mod win {
    #[link(name = "user32")]
    extern "system" {
        pub fn BlockInput(block: i32) -> i32;
    }
}

impl SystemOps for NativeSystem {
    #[cfg(windows)]
    fn block_input(&self, blocked: bool) -> Result<()> {
        let ok = unsafe { win::BlockInput(blocked as i32) };
        if ok == 0 {
            bail!("BlockInput failed: {}", std::io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(not(windows))]
    fn block_input(&self, _blocked: bool) -> Result<()> {
        bail!("input blocking is not available on this platform");
    }

    #[cfg(windows)]
    fn list_adapters(&self) -> Vec<String> {
        // `netsh interface show interface`: names are the 4th column,
        // after a 3-line header.
        let output = Command::new("netsh")
            .args(["interface", "show", "interface"])
            .output();
        let adapters: Vec<String> = match output {
            Ok(out) => String::from_utf8_lossy(&out.stdout)
                .lines()
                .skip(3)
                .filter_map(|line| {
                    // Admin state / State / Type, then a name that may
                    // itself contain spaces.
                    let mut cols = line.trim().split_whitespace();
                    let _admin = cols.next()?;
                    let _state = cols.next()?;
                    let _kind = cols.next()?;
                    let name = cols.collect::<Vec<_>>().join(" ");
                    (!name.is_empty()).then_some(name)
                })
                .collect(),
            Err(_) => Vec::new(),
        };
        if adapters.is_empty() {
            vec!["Ethernet".into(), "Wi-Fi".into()]
        } else {
            adapters
        }
    }

    #[cfg(not(windows))]
    fn list_adapters(&self) -> Vec<String> {
        let entries = std::fs::read_dir("/sys/class/net");
        let adapters: Vec<String> = match entries {
            Ok(entries) => entries
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .filter(|name| name != "lo")
                .collect(),
            Err(_) => Vec::new(),
        };
        if adapters.is_empty() {
            vec!["eth0".into(), "wlan0".into()]
        } else {
            adapters
        }
    }

    #[cfg(windows)]
    fn set_adapter(&self, name: &str, enabled: bool) -> Result<()> {
        let state = if enabled { "enable" } else { "disable" };
        let output = Command::new("netsh")
            .args(["interface", "set", "interface", name, &format!("admin={state}")])
            .output()
            .context("failed to run netsh")?;
        if !output.status.success() {
            bail!("netsh: {}", String::from_utf8_lossy(&output.stderr).trim());
        }
        Ok(())
    }

    #[cfg(not(windows))]
    fn set_adapter(&self, name: &str, enabled: bool) -> Result<()> {
        let state = if enabled { "up" } else { "down" };
        let output = Command::new("ip")
            .args(["link", "set", "dev", name, state])
            .output()
            .context("failed to run ip")?;
        if !output.status.success() {
            bail!("ip link: {}", String::from_utf8_lossy(&output.stderr).trim());
        }
        Ok(())
    }
}
