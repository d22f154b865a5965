// src/redirect/mod.rs
//! Kernel redirection control plane
//!
//! Loads the compiled eBPF object and attaches its three cgroup programs:
//!
//! - **`cg_connect4`** (cgroup/connect4): rewrites outbound IPv4 connects to
//!   the proxy's loopback port, remembering the original destination
//! - **`cg_sock_ops`** (sockops): links the proxy-side socket to that
//!   remembered destination once the connection is established
//! - **`cg_sock_opt`** (cgroup/getsockopt): answers `SO_ORIGINAL_DST` for
//!   the proxy from the remembered destination
//!
//! The programs learn the proxy's port and pid from a [`RedirectRecord`] at
//! key 0 of the `map_config` map; the pid keeps the proxy's own outbound
//! connections from being redirected back to itself.
//!
//! The programs stay attached while the [`ControlPlane`] is alive.

use crate::utils::config::RedirectSettings;
use crate::utils::errors::{ProxyError, Result};
use tracing::{info, warn};

/// Name of the kernel map holding the [`RedirectRecord`]
pub const CONFIG_MAP: &str = "map_config";

/// Programs attached to the cgroup, in attach order
pub const PROGRAMS: [&str; 3] = ["cg_connect4", "cg_sock_ops", "cg_sock_opt"];

/// Proxy identity published to the kernel programs
///
/// Layout matches the C struct the programs read: a 16-bit port, six bytes
/// of padding, then a 64-bit pid.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RedirectRecord {
    pub proxy_port: u16,
    _pad: [u8; 6],
    pub proxy_pid: u64,
}

impl RedirectRecord {
    pub fn new(proxy_port: u16, proxy_pid: u64) -> Self {
        Self {
            proxy_port,
            _pad: [0; 6],
            proxy_pid,
        }
    }

    /// Record for this process listening on `proxy_port`
    pub fn current(proxy_port: u16) -> Self {
        let pid = nix::unistd::getpid().as_raw();
        Self::new(proxy_port, u64::try_from(pid).unwrap_or_default())
    }
}

// SAFETY: plain-old-data, `repr(C)`, padding spelled out as a field
#[cfg(target_os = "linux")]
unsafe impl aya::Pod for RedirectRecord {}

/// Lift the locked-memory limit so maps can be created on kernels < 5.11
///
/// Failure is logged and ignored; newer kernels account eBPF memory to the
/// cgroup instead.
pub fn raise_memlock() {
    use nix::sys::resource::{setrlimit, Resource};

    match setrlimit(
        Resource::RLIMIT_MEMLOCK,
        libc::RLIM_INFINITY,
        libc::RLIM_INFINITY,
    ) {
        Ok(()) => info!("RLIMIT_MEMLOCK raised to infinity"),
        Err(e) => warn!("Failed to raise RLIMIT_MEMLOCK: {}", e),
    }
}

/// Loaded and attached redirection programs
pub struct ControlPlane {
    #[cfg(target_os = "linux")]
    _ebpf: aya::Ebpf,
    record: RedirectRecord,
    attached: Vec<&'static str>,
}

impl ControlPlane {
    /// Load the object, publish the record and attach the programs
    ///
    /// Load and map failures are fatal. Attach failures are logged and
    /// skipped unless `strict_attach` is set.
    #[cfg(target_os = "linux")]
    pub fn establish(settings: &RedirectSettings, proxy_port: u16) -> Result<Self> {
        use aya::maps::{Array, HashMap, Map};
        use aya::Ebpf;

        raise_memlock();

        let mut ebpf = Ebpf::load_file(&settings.object_path).map_err(|e| {
            ProxyError::RedirectSetup(format!("loading {}: {}", settings.object_path, e))
        })?;

        let record = RedirectRecord::current(proxy_port);
        let map = ebpf
            .map_mut(CONFIG_MAP)
            .ok_or_else(|| ProxyError::RedirectSetup(format!("map {} not found", CONFIG_MAP)))?;
        let published = if matches!(map, Map::Array(_)) {
            Array::<_, RedirectRecord>::try_from(map)
                .and_then(|mut array| array.set(0, record, 0))
        } else {
            HashMap::<_, u32, RedirectRecord>::try_from(map)
                .and_then(|mut hash| hash.insert(0u32, record, 0))
        };
        published.map_err(|e| {
            ProxyError::RedirectSetup(format!("updating {}: {}", CONFIG_MAP, e))
        })?;
        info!(
            port = record.proxy_port,
            pid = record.proxy_pid,
            "Published proxy identity to {}",
            CONFIG_MAP
        );

        let attached = attach_all(&mut ebpf, settings)?;

        Ok(Self {
            _ebpf: ebpf,
            record,
            attached,
        })
    }

    #[cfg(not(target_os = "linux"))]
    pub fn establish(settings: &RedirectSettings, _proxy_port: u16) -> Result<Self> {
        Err(ProxyError::RedirectSetup(format!(
            "cannot load {}: eBPF redirection requires Linux",
            settings.object_path
        )))
    }

    /// Identity published to the kernel
    pub fn record(&self) -> RedirectRecord {
        self.record
    }

    /// Programs that are currently attached
    pub fn attached(&self) -> &[&'static str] {
        &self.attached
    }
}

/// Attach every program to the configured cgroup
///
/// A failure, including an unusable cgroup, skips the affected programs
/// unless `strict_attach` is set.
#[cfg(target_os = "linux")]
fn attach_all(ebpf: &mut aya::Ebpf, settings: &RedirectSettings) -> Result<Vec<&'static str>> {
    let mut attached = Vec::with_capacity(PROGRAMS.len());

    let opened = tolerate_attach(open_cgroup(&settings.cgroup_path), settings.strict_attach)?;
    let Some(cgroup) = opened else {
        return Ok(attached);
    };

    for name in PROGRAMS {
        if tolerate_attach(attach(ebpf, name, &cgroup), settings.strict_attach)?.is_some() {
            info!("Attached {} to {}", name, settings.cgroup_path);
            attached.push(name);
        }
    }
    Ok(attached)
}

/// Apply the attach failure policy: fatal when `strict`, otherwise logged
#[cfg(target_os = "linux")]
fn tolerate_attach<T>(result: Result<T>, strict: bool) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if strict => Err(e),
        Err(e) => {
            warn!(step = e.step(), "{}; continuing without it", e);
            Ok(None)
        }
    }
}

#[cfg(target_os = "linux")]
fn open_cgroup(path: &str) -> Result<std::fs::File> {
    std::fs::File::open(path)
        .map_err(|e| ProxyError::RedirectAttach(format!("opening {}: {}", path, e)))
}

#[cfg(target_os = "linux")]
fn attach(ebpf: &mut aya::Ebpf, name: &str, cgroup: &std::fs::File) -> Result<()> {
    use aya::programs::{CgroupAttachMode, CgroupSockAddr, CgroupSockopt, SockOps};

    let program = ebpf
        .program_mut(name)
        .ok_or_else(|| ProxyError::RedirectAttach(format!("{}: program not found", name)))?;

    match name {
        "cg_connect4" => {
            let program: &mut CgroupSockAddr =
                program.try_into().map_err(|e| attach_failed(name, e))?;
            program.load().map_err(|e| attach_failed(name, e))?;
            program
                .attach(cgroup, CgroupAttachMode::Single)
                .map_err(|e| attach_failed(name, e))?;
        }
        "cg_sock_ops" => {
            let program: &mut SockOps =
                program.try_into().map_err(|e| attach_failed(name, e))?;
            program.load().map_err(|e| attach_failed(name, e))?;
            program
                .attach(cgroup, CgroupAttachMode::Single)
                .map_err(|e| attach_failed(name, e))?;
        }
        _ => {
            let program: &mut CgroupSockopt =
                program.try_into().map_err(|e| attach_failed(name, e))?;
            program.load().map_err(|e| attach_failed(name, e))?;
            program
                .attach(cgroup, CgroupAttachMode::Single)
                .map_err(|e| attach_failed(name, e))?;
        }
    }

    Ok(())
}

#[cfg(target_os = "linux")]
fn attach_failed(name: &str, e: impl std::fmt::Display) -> ProxyError {
    ProxyError::RedirectAttach(format!("{}: {}", name, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::{align_of, offset_of, size_of};

    #[test]
    fn test_record_layout() {
        assert_eq!(size_of::<RedirectRecord>(), 16);
        assert_eq!(align_of::<RedirectRecord>(), 8);
        assert_eq!(offset_of!(RedirectRecord, proxy_port), 0);
        assert_eq!(offset_of!(RedirectRecord, proxy_pid), 8);
    }

    #[test]
    fn test_current_record_carries_own_pid() {
        let record = RedirectRecord::current(18000);
        assert_eq!(record.proxy_port, 18000);
        assert_eq!(record.proxy_pid, u64::from(std::process::id()));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_missing_cgroup_is_tolerated_unless_strict() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("no-such-cgroup").display().to_string();

        let lenient = tolerate_attach(open_cgroup(&missing), false).unwrap();
        assert!(lenient.is_none());

        let err = tolerate_attach(open_cgroup(&missing), true).unwrap_err();
        assert!(matches!(err, ProxyError::RedirectAttach(_)));

        let present = tolerate_attach(open_cgroup(&dir.path().display().to_string()), true);
        assert!(present.unwrap().is_some());
    }

    #[test]
    fn test_missing_object_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let settings = RedirectSettings {
            object_path: dir.path().join("missing.bpf.o").display().to_string(),
            ..RedirectSettings::default()
        };

        let err = match ControlPlane::establish(&settings, 18000) {
            Ok(_) => panic!("loaded a missing object"),
            Err(e) => e,
        };
        assert!(matches!(err, ProxyError::RedirectSetup(_)));
    }
}
