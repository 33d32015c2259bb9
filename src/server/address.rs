// src/server/address.rs

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use rand::Rng;
use rand::distr::Alphanumeric;

use crate::errors::QaError;

/// Length of one-time registration tokens.
pub const TOKEN_LEN: usize = 16;

/// Random alphanumeric token. Not a security boundary: the server only binds
/// loopback addresses.
pub fn random_token(len: usize) -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// `token@host:port`, handed to a worker so it can dial back in.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerAddress {
    pub token: String,
    pub addr: SocketAddr,
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.token, self.addr)
    }
}

impl FromStr for ServerAddress {
    type Err = QaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (token, addr) = s
            .split_once('@')
            .ok_or_else(|| QaError::Transport(format!("address '{s}' is missing a token")))?;
        if token.is_empty() {
            return Err(QaError::Transport(format!("address '{s}' has an empty token")));
        }
        let addr = addr
            .parse()
            .map_err(|e| QaError::Transport(format!("invalid socket address in '{s}': {e}")))?;
        Ok(Self {
            token: token.to_string(),
            addr,
        })
    }
}
