//! 跨分片代理
//!
//! 每个代理位于一个分片内，按序列出它在本分片一侧代表的接口；
//! 对端分片里的伙伴代理按同样顺序列出同一批通道的另一端。

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::instantiation::Instantiation;
use super::socket::{Socket, SocketType};
use crate::error::{OrchError, Result};
use crate::simulation::CmdBuilder;
use crate::system::{FragmentId, InterfaceId, ProxyId};
use crate::util::Keyed;

/// 承载链路类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyType {
    Tcp,
    Rdma,
    Dummy,
}

impl ProxyType {
    fn binary(self) -> &'static str {
        match self {
            ProxyType::Tcp => "dist/sockets/net_sockets",
            ProxyType::Rdma => "dist/rdma/net_rdma",
            ProxyType::Dummy => "dist/dummy/net_dummy",
        }
    }
}

impl fmt::Display for ProxyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ProxyType::Tcp => "tcp",
            ProxyType::Rdma => "rdma",
            ProxyType::Dummy => "dummy",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proxy {
    pub id: ProxyId,
    pub name: String,
    pub proxy_type: ProxyType,
    /// 承载链路上的角色：LISTEN 一侧等待伙伴连入
    pub mode: SocketType,
    pub fragment: FragmentId,
    pub partner: ProxyId,
    /// 本分片一侧的通道端点，顺序与伙伴一致
    pub interfaces: Vec<InterfaceId>,
    /// 监听方地址
    pub ip: String,
    pub port: u16,
}

impl Proxy {
    pub fn carries(&self, iface: InterfaceId) -> bool {
        self.interfaces.contains(&iface)
    }

    /// 代理在每个接口上持有的 socket（与本地仿真器一侧角色相反），按接口顺序
    pub fn sockets(&self, inst: &Instantiation) -> Result<Vec<Socket>> {
        self.interfaces
            .iter()
            .map(|i| {
                inst.socket(*i).map(Socket::flipped).ok_or_else(|| {
                    OrchError::InvalidGraph(format!(
                        "proxy `{}`: interface {i} has not been resolved",
                        self.name
                    ))
                })
            })
            .collect()
    }

    /// 代理自己监听的 socket，启动后需等待出现
    pub fn listen_sockets(&self, inst: &Instantiation) -> Result<Vec<PathBuf>> {
        Ok(self
            .sockets(inst)?
            .into_iter()
            .filter(|s| s.role == SocketType::Listen)
            .map(|s| s.path)
            .collect())
    }

    pub fn shm_path(&self, inst: &Instantiation) -> PathBuf {
        inst.env.proxy_shm_path(&self.name)
    }

    /// `<bin> [-l] -s <shm> (-L sock)* (-C sock)* <ip> <port>`
    pub fn run_cmd(&self, inst: &Instantiation) -> Result<Vec<String>> {
        let sockets = self.sockets(inst)?;
        let mut cmd = CmdBuilder::new(inst.env.repo_path(self.proxy_type.binary()));
        cmd.arg_if(self.mode == SocketType::Listen, "-l")
            .opt("-s", self.shm_path(inst).display());
        for s in sockets.iter().filter(|s| s.role == SocketType::Listen) {
            cmd.opt("-L", s.path.display());
        }
        for s in sockets.iter().filter(|s| s.role == SocketType::Connect) {
            cmd.opt("-C", s.path.display());
        }
        cmd.arg(&self.ip).arg(self.port);
        Ok(cmd.build())
    }
}

impl Keyed for Proxy {
    type Key = ProxyId;
    fn key(&self) -> ProxyId {
        self.id
    }
}
