//! Host probes that sysinfo does not cover
//!
//! All of these block and are meant to run on the blocking pool. Every probe
//! degrades to a neutral value instead of failing.

use std::net::{IpAddr, UdpSocket};
use std::path::Path;
use std::process::Command;

use nex_core::stats::{BatteryState, WifiState};

use crate::media::{capture, DesktopUser};

/// CPU temperature in °C from the kernel thermal zones
pub fn cpu_temp() -> f64 {
    let Ok(zones) = std::fs::read_dir("/sys/class/thermal") else {
        return 0.0;
    };

    let mut fallback = None;
    for zone in zones.filter_map(Result::ok) {
        let path = zone.path();
        let Some(temp) = read_trimmed(&path.join("temp")).and_then(|t| parse_millidegrees(&t)) else {
            continue;
        };
        let kind = read_trimmed(&path.join("type")).unwrap_or_default();
        if matches!(kind.as_str(), "x86_pkg_temp" | "cpu-thermal" | "cpu_thermal" | "k10temp" | "coretemp") {
            return temp;
        }
        fallback.get_or_insert(temp);
    }
    fallback.unwrap_or(0.0)
}

fn parse_millidegrees(raw: &str) -> Option<f64> {
    raw.trim().parse::<i64>().ok().map(|m| m as f64 / 1000.0)
}

/// Primary IPv4 address, chosen the way the kernel would route outbound
pub fn local_ip() -> String {
    let probe = || -> std::io::Result<IpAddr> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        // No packet is sent; connect only selects a route
        socket.connect("192.0.2.1:80")?;
        Ok(socket.local_addr()?.ip())
    };

    match probe() {
        Ok(ip) if !ip.is_loopback() && !ip.is_unspecified() => ip.to_string(),
        _ => String::new(),
    }
}

/// First battery under /sys/class/power_supply, or mains power
pub fn battery_state() -> BatteryState {
    let Ok(supplies) = std::fs::read_dir("/sys/class/power_supply") else {
        return BatteryState::default();
    };

    supplies
        .filter_map(Result::ok)
        .map(|supply| supply.path())
        .find(|path| read_trimmed(&path.join("type")).as_deref() == Some("Battery"))
        .and_then(|path| {
            let capacity = read_trimmed(&path.join("capacity"))?;
            let status = read_trimmed(&path.join("status")).unwrap_or_default();
            Some(parse_battery(&capacity, &status))
        })
        .unwrap_or_default()
}

fn parse_battery(capacity: &str, status: &str) -> BatteryState {
    BatteryState {
        percentage: capacity.trim().parse().unwrap_or(0),
        plugged_in: matches!(status.trim(), "Charging" | "Full" | "Not charging"),
    }
}

/// Connected SSID via iwgetid, falling back to nmcli
pub fn wifi_state() -> WifiState {
    let ssid = capture(command("iwgetid", &["-r"]))
        .filter(|ssid| !ssid.is_empty())
        .or_else(|| {
            capture(command("nmcli", &["-t", "-f", "active,ssid", "dev", "wifi"]))
                .and_then(|out| parse_nmcli_active(&out))
        })
        .unwrap_or_default();

    WifiState {
        connected: !ssid.is_empty(),
        ssid,
    }
}

fn parse_nmcli_active(output: &str) -> Option<String> {
    output
        .lines()
        .find_map(|line| line.strip_prefix("yes:"))
        .map(str::to_string)
}

/// Default sink volume in percent via wpctl, falling back to pactl
pub fn volume(user: &DesktopUser) -> i32 {
    let mut wpctl = user.command("wpctl");
    wpctl.args(["get-volume", "@DEFAULT_AUDIO_SINK@"]);
    if let Some(volume) = capture(wpctl).and_then(|out| parse_wpctl_volume(&out)) {
        return volume;
    }

    let mut pactl = user.command("pactl");
    pactl.args(["get-sink-volume", "@DEFAULT_SINK@"]);
    capture(pactl)
        .and_then(|out| parse_pactl_volume(&out))
        .unwrap_or(0)
}

/// `Volume: 0.45` or `Volume: 0.45 [MUTED]`
fn parse_wpctl_volume(output: &str) -> Option<i32> {
    let value = output.trim().strip_prefix("Volume:")?.split_whitespace().next()?;
    let level: f64 = value.parse().ok()?;
    Some((level * 100.0).round() as i32)
}

/// `Volume: front-left: 32768 /  50% / -18.06 dB,   front-right: ...`
fn parse_pactl_volume(output: &str) -> Option<i32> {
    output.split('/').nth(1)?.trim().trim_end_matches('%').parse().ok()
}

/// Backlight brightness in percent; 100 when there is no backlight
pub fn backlight() -> i32 {
    let device = std::fs::read_dir("/sys/class/backlight")
        .ok()
        .and_then(|mut entries| entries.find_map(Result::ok))
        .map(|entry| entry.path());

    let Some(device) = device else {
        return 100;
    };

    let max = read_trimmed(&device.join("max_brightness")).and_then(|v| v.parse::<i64>().ok());
    let actual = read_trimmed(&device.join("brightness")).and_then(|v| v.parse::<i64>().ok());

    match (max, actual) {
        (Some(max), Some(actual)) if max > 0 => ((actual as f64 / max as f64) * 100.0) as i32,
        _ => 100,
    }
}

fn command(program: &str, args: &[&str]) -> Command {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(std::process::Stdio::null())
        .stderr(std::process::Stdio::null());
    cmd
}

fn read_trimmed(path: &Path) -> Option<String> {
    std::fs::read_to_string(path).ok().map(|s| s.trim().to_string())
}
