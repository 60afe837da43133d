// 该文件是 Dapur Vision 项目的一部分。
// src/auth.rs - 请求校验策略
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use std::{fmt, net::IpAddr, str::FromStr};

use thiserror::Error;

use crate::engine::Credential;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
  #[error("Missing authorization header")]
  MissingAuthHeader,
  #[error("Invalid authorization format, expected 'Bearer <token>'")]
  InvalidAuthFormat,
  #[error("Invalid credentials")]
  InvalidCredentials,
  #[error("Peer address unknown")]
  UnknownPeer,
  #[error("Address {0} is not allowed")]
  PeerNotAllowed(IpAddr),
  #[error("Bearer token must not be empty")]
  EmptyToken,
  #[error("Invalid network '{0}'")]
  InvalidNetwork(String),
}

/// 地址段，支持 `10.0.0.0/8` 或单个地址
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpNet {
  addr: IpAddr,
  prefix: u8,
}

impl IpNet {
  pub fn contains(&self, ip: IpAddr) -> bool {
    match (self.addr, ip.to_canonical()) {
      (IpAddr::V4(net), IpAddr::V4(ip)) => {
        let mask = mask_u32(self.prefix);
        u32::from(net) & mask == u32::from(ip) & mask
      }
      (IpAddr::V6(net), IpAddr::V6(ip)) => {
        let mask = mask_u128(self.prefix);
        u128::from(net) & mask == u128::from(ip) & mask
      }
      _ => false,
    }
  }
}

fn mask_u32(prefix: u8) -> u32 {
  match prefix {
    0 => 0,
    p => u32::MAX << (32 - u32::from(p)),
  }
}

fn mask_u128(prefix: u8) -> u128 {
  match prefix {
    0 => 0,
    p => u128::MAX << (128 - u32::from(p)),
  }
}

impl FromStr for IpNet {
  type Err = AuthError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let invalid = || AuthError::InvalidNetwork(s.to_string());
    let (addr, prefix) = match s.trim().split_once('/') {
      Some((addr, prefix)) => (addr, Some(prefix)),
      None => (s.trim(), None),
    };

    let addr: IpAddr = addr.parse().map_err(|_| invalid())?;
    let addr = addr.to_canonical();
    let max = if addr.is_ipv4() { 32 } else { 128 };
    let prefix = match prefix {
      Some(prefix) => prefix.parse::<u8>().map_err(|_| invalid())?,
      None => max,
    };
    if prefix > max {
      return Err(invalid());
    }

    Ok(IpNet { addr, prefix })
  }
}

impl fmt::Display for IpNet {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}/{}", self.addr, self.prefix)
  }
}

/// 解析逗号分隔的地址段列表
pub fn parse_networks(list: &str) -> Result<Vec<IpNet>, AuthError> {
  list
    .split(',')
    .map(str::trim)
    .filter(|item| !item.is_empty())
    .map(IpNet::from_str)
    .collect()
}

/// `/detect` 的访问校验
#[derive(Debug, Clone)]
pub enum AuthPolicy {
  AlwaysAllow,
  BearerToken(Credential),
  NetworkAcl(Vec<IpNet>),
}

impl AuthPolicy {
  pub fn bearer(token: Credential) -> Result<Self, AuthError> {
    if token.is_empty() {
      return Err(AuthError::EmptyToken);
    }
    Ok(AuthPolicy::BearerToken(token))
  }

  pub fn name(&self) -> &'static str {
    match self {
      AuthPolicy::AlwaysAllow => "always-allow",
      AuthPolicy::BearerToken(_) => "bearer-token",
      AuthPolicy::NetworkAcl(_) => "network-acl",
    }
  }

  pub fn verify(&self, authorization: Option<&str>, peer: Option<IpAddr>) -> Result<(), AuthError> {
    match self {
      AuthPolicy::AlwaysAllow => Ok(()),
      AuthPolicy::BearerToken(expected) => {
        let provided = parse_bearer_token(authorization.ok_or(AuthError::MissingAuthHeader)?)?;
        if constant_time_compare(expected.expose(), provided) {
          Ok(())
        } else {
          Err(AuthError::InvalidCredentials)
        }
      }
      AuthPolicy::NetworkAcl(networks) => {
        let peer = peer.ok_or(AuthError::UnknownPeer)?;
        if networks.iter().any(|net| net.contains(peer)) {
          Ok(())
        } else {
          Err(AuthError::PeerNotAllowed(peer))
        }
      }
    }
  }
}

pub fn parse_bearer_token(value: &str) -> Result<&str, AuthError> {
  let mut parts = value.split_whitespace();
  match (parts.next(), parts.next(), parts.next()) {
    (Some(scheme), Some(token), None) if scheme.eq_ignore_ascii_case("bearer") => Ok(token),
    _ => Err(AuthError::InvalidAuthFormat),
  }
}

fn constant_time_compare(a: &str, b: &str) -> bool {
  if a.len() != b.len() {
    return false;
  }

  a.as_bytes()
    .iter()
    .zip(b.as_bytes())
    .fold(0u8, |acc, (a, b)| acc | (a ^ b))
    == 0
}
