// src/appliance.rs

//! Guest filesystem appliance
//!
//! The appliance is the isolated mini-VM the pipeline uses as a
//! filesystem agent: overlays (or, in place, the source disks) are
//! attached to it, the guest OS is inspected through it, and the
//! conversion module mutates the mounted guest through it. The
//! `Appliance` trait is the contract the pipeline drives; the
//! default implementation talks to a `guestfish --listen` server
//! over its remote protocol, one subprocess invocation per call.
//!
//! All calls are serialised through the handle; the pipeline never
//! issues concurrent appliance operations.

use crate::error::{Error, Result};
use crate::inspect::{FsStats, GuestFirmware, Inspect, MountedFs};
use std::collections::BTreeMap;
use std::io::Write as _;
use std::process::{Command, Stdio};
use std::time::Duration;
use tracing::{debug, warn};
use wait_timeout::ChildExt;

/// How long to wait for the appliance to shut down before giving up
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(60);

/// Options for attaching a disk to the appliance.
///
/// Overlays are attached as qcow2 with an unsafe cache (they are
/// throwaway files), best-effort discard (so fstrim punches holes)
/// and copy-on-read (so repeated reads of the backing file are
/// served locally).
#[derive(Debug, Clone)]
pub struct DriveOptions {
    pub format: Option<String>,
    pub cachemode: &'static str,
    pub discard: &'static str,
    pub copyonread: bool,
}

impl DriveOptions {
    /// Attachment options for a qcow2 overlay
    pub fn overlay() -> Self {
        Self {
            format: Some("qcow2".to_string()),
            cachemode: "unsafe",
            discard: "besteffort",
            copyonread: true,
        }
    }

    /// Attachment options for a source disk converted in place
    pub fn in_place(format: Option<&str>) -> Self {
        Self {
            format: format.map(str::to_string),
            cachemode: "unsafe",
            discard: "besteffort",
            copyonread: false,
        }
    }
}

/// Contract between the pipeline and the guest filesystem appliance
pub trait Appliance {
    /// Attach a disk; must be called before `launch`
    fn add_drive(&mut self, location: &str, opts: &DriveOptions) -> Result<()>;

    /// Boot the appliance with all attached disks
    fn launch(&mut self) -> Result<()>;

    /// Open an encrypted volume with the given passphrase
    fn unlock_device(&mut self, device: &str, passphrase: &str) -> Result<()>;

    /// Inspect the guest OS and mount its filesystems
    fn inspect(&mut self) -> Result<Inspect>;

    /// Currently mounted filesystems with their types
    fn mounted_filesystems(&mut self) -> Result<Vec<MountedFs>>;

    /// statvfs of a mounted filesystem
    fn statvfs(&mut self, mountpoint: &str) -> Result<FsStats>;

    /// Remount a filesystem with the `discard` option
    fn remount_with_discard(&mut self, fs: &MountedFs) -> Result<()>;

    /// Trim unused blocks of a mounted filesystem
    fn fstrim(&mut self, mountpoint: &str) -> Result<()>;

    /// Sync and shut the appliance down cleanly
    fn shutdown(&mut self) -> Result<()>;
}

/// Appliance driven through `guestfish --listen`
pub struct GuestfishAppliance {
    pid: u32,
    alive: bool,
}

impl GuestfishAppliance {
    /// Start a guestfish server and return a handle to it
    pub fn new() -> Result<Self> {
        let output = Command::new("guestfish")
            .arg("--listen")
            .output()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => Error::MissingTool("guestfish".to_string()),
                _ => Error::Io(e),
            })?;
        if !output.status.success() {
            return Err(Error::subprocess("guestfish --listen", &output.stderr));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let pid = stdout
            .lines()
            .find_map(|line| line.strip_prefix("GUESTFISH_PID="))
            .and_then(|rest| rest.split(';').next())
            .and_then(|pid| pid.trim().parse::<u32>().ok())
            .ok_or_else(|| {
                Error::Appliance(format!("cannot parse guestfish --listen output: {}", stdout))
            })?;
        debug!("guestfish server started, pid {}", pid);
        Ok(Self { pid, alive: true })
    }

    fn remote(&self, args: &[&str]) -> Result<String> {
        let remote = format!("--remote={}", self.pid);
        debug!("guestfish {}", args.join(" "));
        let output = Command::new("guestfish")
            .arg(&remote)
            .arg("--")
            .args(args)
            .output()?;
        if !output.status.success() {
            return Err(Error::Appliance(format!(
                "guestfish {}: {}",
                args.first().unwrap_or(&""),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Like `remote`, but feeds the passphrase on stdin
    fn remote_with_key(&self, args: &[&str], key: &str) -> Result<()> {
        let remote = format!("--remote={}", self.pid);
        let mut child = Command::new("guestfish")
            .arg(&remote)
            .arg("--keys-from-stdin")
            .arg("--")
            .args(args)
            .stdin(Stdio::piped())
            .stderr(Stdio::piped())
            .stdout(Stdio::null())
            .spawn()?;
        if let Some(stdin) = child.stdin.as_mut() {
            stdin.write_all(key.as_bytes())?;
            stdin.write_all(b"\n")?;
        }
        let output = child.wait_with_output()?;
        if !output.status.success() {
            return Err(Error::Appliance(format!(
                "guestfish {}: {}",
                args.first().unwrap_or(&""),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    fn inspect_root(&self) -> Result<String> {
        let roots = self.remote(&["inspect-os"])?;
        let mut roots = roots.lines().filter(|l| !l.is_empty());
        let root = roots
            .next()
            .ok_or_else(|| Error::Inspection("no operating system found on the disks".into()))?
            .to_string();
        if roots.next().is_some() {
            return Err(Error::Inspection(
                "multi-boot guests cannot be converted".into(),
            ));
        }
        Ok(root)
    }

    fn mountpoints_of(&self, root: &str) -> Result<BTreeMap<String, String>> {
        let raw = self.remote(&["inspect-get-mountpoints", root])?;
        let mut map = BTreeMap::new();
        for line in raw.lines().filter(|l| !l.is_empty()) {
            if let Some((mp, dev)) = line.split_once(": ") {
                map.insert(mp.to_string(), dev.to_string());
            }
        }
        Ok(map)
    }

    /// Determine the guest firmware by looking for an EFI system
    /// partition on a GPT-partitioned disk.
    fn detect_firmware(&self) -> Result<GuestFirmware> {
        const ESP_GUID: &str = "C12A7328-F81F-11D2-BA4B-00A0C93EC93B";

        let devices = self.remote(&["list-devices"])?;
        let mut esp_devices = Vec::new();
        for device in devices.lines().filter(|l| !l.is_empty()) {
            let parttype = match self.remote(&["part-get-parttype", device]) {
                Ok(t) => t.trim().to_string(),
                // Unpartitioned disk
                Err(_) => continue,
            };
            if parttype != "gpt" {
                continue;
            }
            let partitions = self.remote(&["part-list", device])?;
            for line in partitions.lines() {
                let line = line.trim();
                if let Some(num) = line.strip_prefix("part_num:") {
                    let num = num.trim().trim_end_matches(',');
                    let gpt_type = self.remote(&["part-get-gpt-type", device, num])?;
                    if gpt_type.trim().eq_ignore_ascii_case(ESP_GUID) {
                        esp_devices.push(format!("{}{}", device, num));
                    }
                }
            }
        }
        if esp_devices.is_empty() {
            Ok(GuestFirmware::Bios)
        } else {
            Ok(GuestFirmware::Uefi { esp_devices })
        }
    }

    fn inspect_str(&self, cmd: &str, root: &str) -> Result<String> {
        Ok(self.remote(&[cmd, root])?.trim().to_string())
    }
}

impl Appliance for GuestfishAppliance {
    fn add_drive(&mut self, location: &str, opts: &DriveOptions) -> Result<()> {
        let mut args = vec!["add-drive".to_string(), location.to_string()];
        if let Some(fmt) = &opts.format {
            args.push(format!("format:{}", fmt));
        }
        args.push(format!("cachemode:{}", opts.cachemode));
        args.push(format!("discard:{}", opts.discard));
        if opts.copyonread {
            args.push("copyonread:true".to_string());
        }
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.remote(&args)?;
        Ok(())
    }

    fn launch(&mut self) -> Result<()> {
        self.remote(&["run"])?;
        Ok(())
    }

    fn unlock_device(&mut self, device: &str, passphrase: &str) -> Result<()> {
        // The mapper name only has to be unique within the appliance.
        let suffix: String = device
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect();
        let mapname = format!("luks{}", suffix);
        self.remote_with_key(&["luks-open", device, &mapname], passphrase)
    }

    fn inspect(&mut self) -> Result<Inspect> {
        let root = self.inspect_root()?;
        let os_type = self.inspect_str("inspect-get-type", &root)?;
        let distro = self.inspect_str("inspect-get-distro", &root)?;
        let product_name = self.inspect_str("inspect-get-product-name", &root)?;
        let arch = self.inspect_str("inspect-get-arch", &root)?;
        let major_version = self
            .inspect_str("inspect-get-major-version", &root)?
            .parse()
            .unwrap_or(0);
        let minor_version = self
            .inspect_str("inspect-get-minor-version", &root)?
            .parse()
            .unwrap_or(0);
        let package_format = self.inspect_str("inspect-get-package-format", &root)?;
        let package_management = self.inspect_str("inspect-get-package-management", &root)?;
        let firmware = self.detect_firmware()?;

        let mountpoints = self.mountpoints_of(&root)?;
        // Mount shallow paths first so nested mountpoints land inside
        // their parents.
        let mut ordered: Vec<(&String, &String)> = mountpoints.iter().collect();
        ordered.sort_by_key(|(mp, _)| mp.len());
        for (mp, dev) in &ordered {
            if let Err(e) = self.remote(&["mount", dev.as_str(), mp.as_str()]) {
                warn!("cannot mount {} on {}: {}", dev, mp, e);
            }
        }

        Ok(Inspect {
            root,
            os_type,
            distro,
            product_name,
            arch,
            major_version,
            minor_version,
            package_format,
            package_management,
            firmware,
            mountpoints: ordered
                .into_iter()
                .map(|(mp, dev)| (mp.clone(), dev.clone()))
                .collect(),
        })
    }

    fn mounted_filesystems(&mut self) -> Result<Vec<MountedFs>> {
        let raw = self.remote(&["mountpoints"])?;
        let mut filesystems = Vec::new();
        for line in raw.lines().filter(|l| !l.is_empty()) {
            if let Some((dev, mp)) = line.split_once(": ") {
                let fs_type = self
                    .remote(&["vfs-type", dev])
                    .map(|t| t.trim().to_string())
                    .unwrap_or_else(|_| "unknown".to_string());
                filesystems.push(MountedFs {
                    device: dev.to_string(),
                    mountpoint: mp.to_string(),
                    fs_type,
                });
            }
        }
        Ok(filesystems)
    }

    fn statvfs(&mut self, mountpoint: &str) -> Result<FsStats> {
        let raw = self.remote(&["statvfs", mountpoint])?;
        let mut fields: BTreeMap<&str, u64> = BTreeMap::new();
        for line in raw.lines() {
            if let Some((key, value)) = line.split_once(':') {
                if let Ok(value) = value.trim().parse::<u64>() {
                    fields.insert(key.trim(), value);
                }
            }
        }
        let get = |key: &str| -> Result<u64> {
            fields
                .get(key)
                .copied()
                .ok_or_else(|| Error::Appliance(format!("statvfs output is missing '{}'", key)))
        };
        Ok(FsStats {
            bsize: get("bsize")?,
            blocks: get("blocks")?,
            bfree: get("bfree")?,
            bavail: get("bavail")?,
            files: get("files")?,
            ffree: get("ffree")?,
        })
    }

    fn remount_with_discard(&mut self, fs: &MountedFs) -> Result<()> {
        self.remote(&["umount", &fs.mountpoint])?;
        self.remote(&["mount-options", "discard", &fs.device, &fs.mountpoint])?;
        Ok(())
    }

    fn fstrim(&mut self, mountpoint: &str) -> Result<()> {
        self.remote(&["fstrim", mountpoint])?;
        Ok(())
    }

    fn shutdown(&mut self) -> Result<()> {
        self.remote(&["sync"])?;
        self.remote(&["shutdown"])?;
        self.exit_server()
    }
}

impl GuestfishAppliance {
    fn exit_server(&mut self) -> Result<()> {
        if !self.alive {
            return Ok(());
        }
        self.alive = false;
        let remote = format!("--remote={}", self.pid);
        let mut child = Command::new("guestfish")
            .arg(&remote)
            .arg("--")
            .arg("exit")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;
        match child.wait_timeout(SHUTDOWN_TIMEOUT)? {
            Some(status) if status.success() => Ok(()),
            Some(status) => Err(Error::Appliance(format!(
                "guestfish exit returned {}",
                status
            ))),
            None => {
                child.kill().ok();
                child.wait().ok();
                Err(Error::Appliance("timed out shutting down the appliance".into()))
            }
        }
    }
}

impl Drop for GuestfishAppliance {
    fn drop(&mut self) {
        if self.alive {
            // Last-ditch shutdown; errors are deliberately ignored so
            // the user sees the original failure, not the cleanup's.
            if let Err(e) = self.exit_server() {
                warn!("appliance cleanup failed: {}", e);
            }
        }
    }
}
