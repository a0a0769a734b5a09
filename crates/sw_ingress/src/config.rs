//! 入口服务配置

use std::net::{Ipv4Addr, SocketAddr};

/// 默认请求体上限 (4 MiB)
pub const DEFAULT_BODY_LIMIT: usize = 4 * 1024 * 1024;

/// HTTP 入口配置
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// 监听地址
    pub addr: SocketAddr,
    /// 请求体上限 (字节)
    pub body_limit: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 3000)),
            body_limit: DEFAULT_BODY_LIMIT,
        }
    }
}
