//! Live system network devices.
//!
//! [`SystemDevices`] is the reconciler's view of the kernel: a snapshot of
//! the devices that are up, and a primitive to kill one. [`IpLinkDevices`]
//! implements it on Linux with `ip -s -o link list` and the pid file pppd
//! writes for each interface.

use crate::GatesyncError;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// One device from a system snapshot.
///
/// Counter fields are `None` when the value could not be parsed; the
/// reconciler then leaves the corresponding persisted counter untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SystemDevice {
    /// Kernel device name.
    pub name: String,
    /// Received bytes, as sampled.
    pub rx_bytes: Option<u64>,
    /// Received packets, as sampled.
    pub rx_packets: Option<u64>,
    /// Transmitted bytes, as sampled.
    pub tx_bytes: Option<u64>,
    /// Transmitted packets, as sampled.
    pub tx_packets: Option<u64>,
    /// Device MTU.
    pub mtu: Option<u32>,
    /// Hardware address.
    pub mac: Option<String>,
    /// Link type (`ether`, `ppp`, ...).
    pub link_type: Option<String>,
}

/// Access to the live device set.
#[async_trait]
pub trait SystemDevices: Send + Sync {
    /// Devices that are currently up.
    async fn snapshot(&self) -> Result<Vec<SystemDevice>, GatesyncError>;

    /// Tear down a session device and its owning process.
    async fn kill_device(&self, name: &str) -> Result<(), GatesyncError>;
}

/// Whether `name` is a session device: `<prefix><N>-<N>`.
pub fn is_session_device(name: &str, prefix: &str) -> bool {
    let Some(rest) = name.strip_prefix(prefix) else {
        return false;
    };
    let Some((left, right)) = rest.split_once('-') else {
        return false;
    };
    let all_digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    all_digits(left) && all_digits(right)
}

/// Parse the output of `ip -s -o link list`.
///
/// One device per line, with the sections separated by backslashes:
/// header, link info, RX header, RX counters, TX header, TX counters.
/// Devices without an `UP` flag are skipped when `require_up` is set
/// (pppd creates the device before the link is configured). A device
/// without a parsable name or MTU is skipped entirely; unparsable
/// counters are reported as `None`.
pub fn parse_ip_link_output(output: &str, require_up: bool) -> Vec<SystemDevice> {
    output
        .lines()
        .filter_map(|line| parse_ip_link_line(line, require_up))
        .collect()
}

fn parse_ip_link_line(line: &str, require_up: bool) -> Option<SystemDevice> {
    let sections: Vec<&str> = line.split('\\').map(str::trim).collect();
    let header = *sections.first()?;
    if header.is_empty() {
        return None;
    }

    // 1. "3: eth0: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500 qdisc ..."
    let (_index, rest) = header.split_once(':')?;
    let (name, flags_and_attrs) = rest.trim_start().split_once(':')?;
    let name = name.split('@').next()?.trim();
    if name.is_empty() {
        return None;
    }

    let is_up = flags_and_attrs
        .split_once('<')
        .and_then(|(_, flags)| flags.split_once('>'))
        .map(|(flags, _)| flags.split(',').any(|flag| flag == "UP"))
        .unwrap_or(false);
    if require_up && !is_up {
        return None;
    }

    // 2. MTU is mandatory
    let mtu = value_after(flags_and_attrs, "mtu")?.parse::<u32>().ok()?;

    // 3. "link/ether 52:54:00:12:34:56 brd ff:ff:ff:ff:ff:ff"
    let info = sections.iter().skip(1).find(|s| s.starts_with("link/"))?;
    let mut info_tokens = info.split_whitespace();
    let link_type = info_tokens
        .next()
        .and_then(|t| t.strip_prefix("link/"))
        .map(str::to_string);
    let mac = info_tokens.next().map(str::to_string);

    // 4. Counter lines follow their headers
    let (rx_bytes, rx_packets) = counters_after(&sections, "RX:");
    let (tx_bytes, tx_packets) = counters_after(&sections, "TX:");

    Some(SystemDevice {
        name: name.to_string(),
        rx_bytes,
        rx_packets,
        tx_bytes,
        tx_packets,
        mtu: Some(mtu),
        mac,
        link_type,
    })
}

fn value_after<'a>(text: &'a str, key: &str) -> Option<&'a str> {
    let mut tokens = text.split_whitespace();
    tokens.find(|t| *t == key)?;
    tokens.next()
}

fn counters_after(sections: &[&str], header: &str) -> (Option<u64>, Option<u64>) {
    let Some(pos) = sections.iter().position(|s| s.starts_with(header)) else {
        return (None, None);
    };
    let Some(counters) = sections.get(pos + 1) else {
        return (None, None);
    };
    let mut values = counters.split_whitespace().map(|v| v.parse::<u64>().ok());
    let bytes = values.next().flatten();
    let packets = values.next().flatten();
    (bytes, packets)
}

/// Linux implementation backed by iproute2.
#[derive(Debug, Clone)]
pub struct IpLinkDevices {
    ip_command: PathBuf,
    kill_command: PathBuf,
    pid_dir: PathBuf,
    require_up: bool,
}

impl Default for IpLinkDevices {
    fn default() -> Self {
        Self {
            ip_command: PathBuf::from("/sbin/ip"),
            kill_command: PathBuf::from("/bin/kill"),
            pid_dir: PathBuf::from("/var/run"),
            require_up: true,
        }
    }
}

impl IpLinkDevices {
    /// Use the default command paths.
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the `ip` binary.
    pub fn with_ip_command(mut self, path: impl Into<PathBuf>) -> Self {
        self.ip_command = path.into();
        self
    }

    /// Override the directory holding `<device>.pid` files.
    pub fn with_pid_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.pid_dir = path.into();
        self
    }

    async fn run(&self, program: &Path, args: &[&str]) -> Result<String, GatesyncError> {
        let output = Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|e| GatesyncError::Io(format!("Failed to run {}: {}", program.display(), e)))?;
        if !output.status.success() {
            return Err(GatesyncError::Io(format!(
                "{} {} exited with {}: {}",
                program.display(),
                args.join(" "),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn read_pid(&self, name: &str) -> Option<u32> {
        let path = self.pid_dir.join(format!("{}.pid", name));
        match tokio::fs::read_to_string(&path).await {
            Ok(text) => text.lines().next().and_then(|l| l.trim().parse().ok()),
            Err(e) => {
                debug!(device = %name, path = %path.display(), error = %e, "no pid file");
                None
            }
        }
    }
}

#[async_trait]
impl SystemDevices for IpLinkDevices {
    async fn snapshot(&self) -> Result<Vec<SystemDevice>, GatesyncError> {
        let output = self
            .run(&self.ip_command, &["-s", "-o", "link", "list"])
            .await?;
        Ok(parse_ip_link_output(&output, self.require_up))
    }

    async fn kill_device(&self, name: &str) -> Result<(), GatesyncError> {
        // 1. Link down, so no more traffic is accounted
        if let Err(e) = self
            .run(&self.ip_command, &["link", "set", "dev", name, "down"])
            .await
        {
            warn!(device = %name, error = %e, "setting device down failed");
        }

        // 2. Soft kill the owning pppd
        let Some(pid) = self.read_pid(name).await else {
            return Err(GatesyncError::Io(format!(
                "no owning process found for {}",
                name
            )));
        };
        let pid = pid.to_string();
        self.run(&self.kill_command, &["-TERM", &pid]).await?;
        info!(device = %name, pid = %pid, "device owner terminated");
        Ok(())
    }
}
