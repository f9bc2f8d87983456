//! 主机配置
//!
//! 网络参数、驱动、应用列表与磁盘列表；负责渲染 `guest/run.sh`。

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::app::Application;
use super::disk::DiskImage;

/// 客户机内加载的网卡驱动
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NicDriver {
    #[default]
    None,
    I40e,
    E1000,
    Corundum,
}

impl NicDriver {
    fn load_cmds(self) -> Vec<String> {
        match self {
            NicDriver::None => Vec::new(),
            NicDriver::I40e => vec!["modprobe i40e".to_string()],
            NicDriver::E1000 => vec!["modprobe e1000".to_string()],
            NicDriver::Corundum => vec!["insmod mqnic.ko".to_string()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostConfig {
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default = "default_prefix")]
    pub prefix: u8,
    #[serde(default = "default_ifname")]
    pub ifname: String,
    #[serde(default)]
    pub nic_driver: NicDriver,
    #[serde(default)]
    pub kcmd_append: String,
    #[serde(default)]
    pub applications: Vec<Application>,
    #[serde(default = "default_disks")]
    pub disks: Vec<DiskImage>,
    #[serde(default)]
    pub extra_files: BTreeMap<String, String>,
}

fn default_prefix() -> u8 {
    24
}

fn default_ifname() -> String {
    "eth0".to_string()
}

fn default_disks() -> Vec<DiskImage> {
    vec![
        DiskImage::Distro {
            name: "base".to_string(),
        },
        DiskImage::LinuxConfig,
    ]
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            ip: None,
            prefix: default_prefix(),
            ifname: default_ifname(),
            nic_driver: NicDriver::None,
            kcmd_append: String::new(),
            applications: Vec::new(),
            disks: default_disks(),
            extra_files: BTreeMap::new(),
        }
    }
}

impl HostConfig {
    pub fn with_ip(ip: impl Into<String>) -> Self {
        Self {
            ip: Some(ip.into()),
            ..Self::default()
        }
    }

    pub fn app(mut self, app: Application) -> Self {
        self.applications.push(app);
        self
    }

    /// 是否有应用被标记为测量负载
    pub fn wait(&self) -> bool {
        self.applications.iter().any(|a| a.wait)
    }

    pub fn prepare_pre_cp(&self) -> Vec<String> {
        let mut cmds = vec![
            "set -x".to_string(),
            "export HOME=/root".to_string(),
            "export LANG=en_US".to_string(),
            "export PATH=\"/home/ubuntu/bin:$PATH\"".to_string(),
        ];
        for app in &self.applications {
            cmds.extend(app.prepare_pre_cp());
        }
        cmds
    }

    pub fn prepare_post_cp(&self) -> Vec<String> {
        let mut cmds = self.nic_driver.load_cmds();
        if let Some(ip) = &self.ip {
            cmds.push(format!("ip link set dev {} up", self.ifname));
            cmds.push(format!("ip addr add {}/{} dev {}", ip, self.prefix, self.ifname));
        }
        for app in &self.applications {
            cmds.extend(app.prepare_post_cp());
        }
        cmds
    }

    pub fn run_cmds(&self) -> Vec<String> {
        self.applications.iter().flat_map(|a| a.run_cmds()).collect()
    }

    pub fn cleanup_cmds(&self) -> Vec<String> {
        self.applications.iter().flat_map(|a| a.cleanup_cmds()).collect()
    }

    pub fn config_files(&self) -> BTreeMap<String, String> {
        let mut files = self.extra_files.clone();
        for app in &self.applications {
            files.extend(app.config_files());
        }
        files
    }

    /// 渲染 `guest/run.sh`
    ///
    /// 顺序：pre_cp、检查点命令（若启用）、post_cp、应用命令、清理命令、退出命令。
    pub fn run_script(&self, checkpoint_cmd: Option<&str>, exit_cmd: &str) -> String {
        let mut lines = vec!["#!/bin/bash".to_string()];
        lines.extend(self.prepare_pre_cp());
        if let Some(cp) = checkpoint_cmd {
            lines.push(cp.to_string());
        }
        lines.extend(self.prepare_post_cp());
        lines.extend(self.run_cmds());
        lines.extend(self.cleanup_cmds());
        lines.push(exit_cmd.to_string());
        let mut script = lines.join("\n");
        script.push('\n');
        script
    }
}
