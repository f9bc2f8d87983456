//! 磁盘镜像描述
//!
//! 预构建镜像、动态生成的配置 tar，以及按需构建（不支持，快速失败）。

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{OrchError, Result};
use crate::instantiation::Environment;

/// 镜像格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiskFormat {
    Raw,
    Qcow2,
}

impl std::fmt::Display for DiskFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            DiskFormat::Raw => "raw",
            DiskFormat::Qcow2 => "qcow2",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "image", rename_all = "snake_case")]
pub enum DiskImage {
    /// `<repo>/images/output-<name>/` 下的预构建发行版镜像
    Distro { name: String },
    /// 由主机配置生成的 `cfg.<sim>.tar`
    LinuxConfig,
    Custom { path: PathBuf, format: DiskFormat },
    /// 按需用 packer 构建
    Packer { name: String },
}

/// 执行器需要完成的镜像准备动作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiskPrep {
    /// 已存在，直接使用
    Ready(PathBuf),
    /// 生成主机配置 tar
    ConfigTar(PathBuf),
    /// 在 `base` 之上创建 qcow2 写时复制副本
    CowOverlay { base: PathBuf, overlay: PathBuf },
}

impl DiskPrep {
    /// 仿真器命令行里使用的路径
    pub fn path(&self) -> &PathBuf {
        match self {
            DiskPrep::Ready(p) | DiskPrep::ConfigTar(p) => p,
            DiskPrep::CowOverlay { overlay, .. } => overlay,
        }
    }
}

impl DiskImage {
    pub fn name(&self) -> String {
        match self {
            DiskImage::Distro { name } | DiskImage::Packer { name } => name.clone(),
            DiskImage::LinuxConfig => "linux-config".to_string(),
            DiskImage::Custom { path, .. } => path.display().to_string(),
        }
    }

    pub fn formats(&self) -> Vec<DiskFormat> {
        match self {
            DiskImage::Distro { .. } => vec![DiskFormat::Qcow2, DiskFormat::Raw],
            DiskImage::LinuxConfig => vec![DiskFormat::Raw],
            DiskImage::Custom { format, .. } => vec![*format],
            DiskImage::Packer { .. } => Vec::new(),
        }
    }

    /// 是否每次 Run 动态生成
    pub fn is_dynamic(&self) -> bool {
        matches!(self, DiskImage::LinuxConfig)
    }

    /// 选出仿真器支持的第一个格式，并给出准备动作（纯计算，无副作用）
    pub fn prepare(
        &self,
        env: &Environment,
        sim_name: &str,
        supported: &[DiskFormat],
        cow_overlay: bool,
    ) -> Result<(DiskFormat, DiskPrep)> {
        let offered = self.formats();
        let format = supported
            .iter()
            .copied()
            .find(|f| offered.contains(f))
            .ok_or_else(|| OrchError::ImageFormatUnsupported {
                image: self.name(),
                sim: sim_name.to_string(),
            })?;

        let prep = match self {
            DiskImage::Distro { name } => {
                let dir = env.repo_path(&format!("images/output-{name}"));
                let base = match format {
                    DiskFormat::Qcow2 => dir.join(name),
                    DiskFormat::Raw => dir.join(format!("{name}.raw")),
                };
                if cow_overlay && format == DiskFormat::Qcow2 {
                    DiskPrep::CowOverlay {
                        base,
                        overlay: env.hdcopy_path(sim_name),
                    }
                } else {
                    DiskPrep::Ready(base)
                }
            }
            DiskImage::LinuxConfig => DiskPrep::ConfigTar(env.cfgtar_path(sim_name)),
            DiskImage::Custom { path, .. } => DiskPrep::Ready(path.clone()),
            DiskImage::Packer { .. } => {
                return Err(OrchError::ImageFormatUnsupported {
                    image: self.name(),
                    sim: sim_name.to_string(),
                });
            }
        };
        Ok((format, prep))
    }
}
