//! Container launch specification.
//!
//! When a container runtime is configured, the worker runs inside a
//! locked-down `docker run` instead of a bare process. The production
//! hardening gate refuses to start unless the lockdown flags below
//! are all enabled.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Network posture for a worker container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ContainerNetwork {
    /// `--network=none`; the worker has no network at all.
    #[default]
    Disabled,
    /// Worker traffic must leave through the named egress proxy.
    EgressProxy(String),
    /// Runtime default network (refused under production hardening).
    Default,
}

/// Declarative container launch spec.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerSpec {
    /// Worker image.
    pub image: String,
    /// Mount the root filesystem read-only.
    pub readonly_rootfs: bool,
    /// Drop every Linux capability.
    pub drop_all_caps: bool,
    /// Set `no-new-privileges`.
    pub no_new_privileges: bool,
    /// Seccomp profile path or name.
    pub seccomp_profile: Option<String>,
    /// `AppArmor` profile name.
    pub apparmor_profile: Option<String>,
    /// Cap on the container's process count.
    pub pids_limit: Option<u32>,
    /// Raw `--ulimit` values (`nofile=256:256`).
    pub ulimits: Vec<String>,
    /// Raw `--storage-opt` value (`size=512m`).
    pub storage_opt: Option<String>,
    /// Writable tmpfs mount (`/tmp:rw,size=64m`).
    pub tmpfs: Option<String>,
    /// Network posture.
    pub network: ContainerNetwork,
    /// Memory ceiling in megabytes.
    pub memory_mb: u64,
}

impl ContainerSpec {
    /// A locked-down default spec around `image`.
    #[must_use]
    pub fn hardened(image: impl Into<String>, memory_mb: u64) -> Self {
        Self {
            image: image.into(),
            readonly_rootfs: true,
            drop_all_caps: true,
            no_new_privileges: true,
            seccomp_profile: Some("default".to_string()),
            apparmor_profile: None,
            pids_limit: Some(128),
            ulimits: vec!["nofile=256:256".to_string()],
            storage_opt: Some("size=512m".to_string()),
            tmpfs: Some("/tmp:rw,size=64m".to_string()),
            network: ContainerNetwork::Disabled,
            memory_mb,
        }
    }

    /// Whether the lockdown flags required under production hardening
    /// are all enabled. Returns the names of missing flags.
    #[must_use]
    pub fn missing_hardening(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if !self.readonly_rootfs {
            missing.push("readonly_rootfs");
        }
        if !self.drop_all_caps {
            missing.push("drop_all_caps");
        }
        if !self.no_new_privileges {
            missing.push("no_new_privileges");
        }
        if self.seccomp_profile.is_none() {
            missing.push("seccomp_profile");
        }
        if self.pids_limit.is_none() {
            missing.push("pids_limit");
        }
        if self.ulimits.is_empty() {
            missing.push("ulimits");
        }
        if self.storage_opt.is_none() {
            missing.push("storage_opt");
        }
        if self.network == ContainerNetwork::Default {
            missing.push("network");
        }
        missing
    }

    /// Build the `docker run` argv for `entry_point` with `env` and the
    /// workdir mounted at `/workspace`.
    #[must_use]
    pub fn to_args(
        &self,
        entry_point: &[String],
        env: &HashMap<String, String>,
        workdir: &PathBuf,
    ) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "--interactive".to_string(),
        ];

        if self.readonly_rootfs {
            args.push("--read-only".to_string());
        }
        if self.drop_all_caps {
            args.push("--cap-drop=ALL".to_string());
        }
        if self.no_new_privileges {
            args.push("--security-opt".to_string());
            args.push("no-new-privileges".to_string());
        }
        if let Some(seccomp) = &self.seccomp_profile {
            if seccomp != "default" {
                args.push("--security-opt".to_string());
                args.push(format!("seccomp={seccomp}"));
            }
        }
        if let Some(apparmor) = &self.apparmor_profile {
            args.push("--security-opt".to_string());
            args.push(format!("apparmor={apparmor}"));
        }
        if let Some(pids) = self.pids_limit {
            args.push(format!("--pids-limit={pids}"));
        }
        for ulimit in &self.ulimits {
            args.push("--ulimit".to_string());
            args.push(ulimit.clone());
        }
        if let Some(storage) = &self.storage_opt {
            args.push("--storage-opt".to_string());
            args.push(storage.clone());
        }
        if let Some(tmpfs) = &self.tmpfs {
            args.push("--tmpfs".to_string());
            args.push(tmpfs.clone());
        }
        match &self.network {
            ContainerNetwork::Disabled => args.push("--network=none".to_string()),
            ContainerNetwork::EgressProxy(proxy) => {
                args.push("--env".to_string());
                args.push(format!("HTTPS_PROXY={proxy}"));
                args.push("--env".to_string());
                args.push(format!("HTTP_PROXY={proxy}"));
            },
            ContainerNetwork::Default => {},
        }
        args.push(format!("--memory={}m", self.memory_mb));

        let mut keys: Vec<&String> = env.keys().collect();
        keys.sort();
        for key in keys {
            args.push("--env".to_string());
            args.push(format!("{key}={}", env[key]));
        }

        args.push("--volume".to_string());
        args.push(format!("{}:/workspace", workdir.display()));
        args.push("--workdir".to_string());
        args.push("/workspace".to_string());

        args.push(self.image.clone());
        args.extend(entry_point.iter().cloned());
        args
    }
}
