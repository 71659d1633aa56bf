//! Authentication Models

use serde::{Deserialize, Serialize};

/// Caller roles
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Role {
    #[serde(rename = "admin")]
    Admin, // Contest, withdrawal and leaderboard administration
    #[serde(rename = "player")]
    Player,
}

impl Role {
    pub fn as_str(&self) -> &str {
        match self {
            Role::Admin => "admin",
            Role::Player => "player",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "admin" => Some(Role::Admin),
            "player" | "user" => Some(Role::Player),
            _ => None,
        }
    }
}

/// JWT Claims payload. `sub` is the user id the ledger keys wallets by.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub role: Role,
    pub exp: usize, // expiration timestamp
}

impl Claims {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}
