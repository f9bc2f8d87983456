//! 运行环境：目录布局与所有派生路径

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// 一次 Run 看到的文件系统布局
///
/// 运行目录为 `work_base/<run_id>/`，共享内存目录为 `shm_base/<run_id>/`，
/// 检查点目录为 `cp_base/<cp_key>/`。检查点 Run 与随后的测量 Run 共用 `cp_key`。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Environment {
    pub repo_dir: PathBuf,
    pub work_base: PathBuf,
    pub cp_base: PathBuf,
    pub shm_base: PathBuf,
    #[serde(default = "default_run_id")]
    pub run_id: String,
    #[serde(default = "default_run_id")]
    pub cp_key: String,
    #[serde(default)]
    pub create_cp: bool,
    #[serde(default)]
    pub restore_cp: bool,
    #[serde(default)]
    pub keep_workdir: bool,
}

fn default_run_id() -> String {
    "run".to_string()
}

impl Environment {
    /// 共享内存默认与运行目录同处，检查点放在 `work_base/checkpoints`
    pub fn new(repo_dir: impl Into<PathBuf>, work_base: impl Into<PathBuf>) -> Self {
        let work_base = work_base.into();
        Self {
            repo_dir: repo_dir.into(),
            cp_base: work_base.join("checkpoints"),
            shm_base: work_base.clone(),
            work_base,
            run_id: default_run_id(),
            cp_key: default_run_id(),
            create_cp: false,
            restore_cp: false,
            keep_workdir: false,
        }
    }

    pub fn with_cp_base(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cp_base = dir.into();
        self
    }

    pub fn with_shm_base(mut self, dir: impl Into<PathBuf>) -> Self {
        self.shm_base = dir.into();
        self
    }

    /// 派生出某次 Run 专用的环境
    pub fn for_run(&self, run_id: &str, cp_key: &str, create_cp: bool, restore_cp: bool) -> Self {
        Self {
            run_id: run_id.to_string(),
            cp_key: cp_key.to_string(),
            create_cp,
            restore_cp,
            ..self.clone()
        }
    }

    pub fn repo_path(&self, rel: impl AsRef<Path>) -> PathBuf {
        self.repo_dir.join(rel)
    }

    pub fn run_dir(&self) -> PathBuf {
        self.work_base.join(&self.run_id)
    }

    pub fn shm_dir(&self) -> PathBuf {
        self.shm_base.join(&self.run_id)
    }

    pub fn cp_dir(&self) -> PathBuf {
        self.cp_base.join(&self.cp_key)
    }

    pub fn socket_path(&self, name: &str) -> PathBuf {
        self.run_dir().join(name)
    }

    pub fn cfgtar_path(&self, sim: &str) -> PathBuf {
        self.run_dir().join(format!("cfg.{sim}.tar"))
    }

    /// 打包前的暂存目录，内含 `guest/`
    pub fn cfg_stage_dir(&self, sim: &str) -> PathBuf {
        self.run_dir().join(format!("cfg.{sim}"))
    }

    pub fn hdcopy_path(&self, sim: &str) -> PathBuf {
        self.run_dir().join(format!("hdcopy.{sim}"))
    }

    pub fn dev_shm_path(&self, sim: &str) -> PathBuf {
        self.shm_dir().join(format!("dev.shm.{sim}"))
    }

    pub fn n2h_shm_path(&self, net: &str, host: &str) -> PathBuf {
        self.shm_dir().join(format!("n2h.shm.{net}.{host}"))
    }

    pub fn proxy_shm_path(&self, proxy: &str) -> PathBuf {
        self.shm_dir().join(format!("proxy.shm.{proxy}"))
    }

    pub fn gem5_outdir(&self, sim: &str) -> PathBuf {
        self.run_dir().join(format!("gem5-out.{sim}"))
    }

    pub fn gem5_cpdir(&self, sim: &str) -> PathBuf {
        self.cp_dir().join(format!("gem5-cp.{sim}"))
    }

    pub fn simics_cpfile(&self, sim: &str) -> PathBuf {
        self.cp_dir().join(format!("simics-cp.{sim}"))
    }
}
