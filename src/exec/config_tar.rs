//! 主机配置包 `cfg.<sim>.tar`
//!
//! 在运行目录里暂存 `cfg.<sim>/guest/`，写入 `run.sh` 与附加文件，再用主机的 `tar` 打包。

use std::path::PathBuf;

use tracing::debug;

use super::command::Executor;
use crate::error::Result;
use crate::instantiation::Environment;
use crate::system::HostConfig;

/// 生成配置包并返回其路径
#[tracing::instrument(skip(exec, env, host, checkpoint_cmd, exit_cmd))]
pub async fn build_config_tar(
    exec: &Executor,
    env: &Environment,
    sim: &str,
    host: &HostConfig,
    checkpoint_cmd: Option<&str>,
    exit_cmd: &str,
) -> Result<PathBuf> {
    let stage = env.cfg_stage_dir(sim);
    let guest = stage.join("guest");
    exec.rmtree(&stage).await?;
    exec.mkdir(&guest).await?;

    let run_sh = guest.join("run.sh");
    let script = host.run_script(checkpoint_cmd, exit_cmd);
    exec.write_file(&run_sh, script.as_bytes()).await?;
    exec.run_to_completion(&["chmod".to_string(), "+x".to_string(), run_sh.display().to_string()])
        .await?;
    for (name, contents) in host.config_files() {
        exec.write_file(&guest.join(&name), contents.as_bytes()).await?;
    }

    let tar = env.cfgtar_path(sim);
    exec.run_to_completion(&[
        "tar".to_string(),
        "-C".to_string(),
        stage.display().to_string(),
        "-cf".to_string(),
        tar.display().to_string(),
        "guest".to_string(),
    ])
    .await?;
    debug!(path = %tar.display(), lines = script.lines().count(), "配置包已生成");
    Ok(tar)
}
