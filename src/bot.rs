//! Boundary to the rest of the bot process.
//!
//! Endpoints never talk to the chat platform directly; they go through the
//! [`Bot`] trait. The gateway, messaging, verification, and cache layers
//! implement it in the full bot. [`LoggingBot`] is the stand-in used when
//! the control server runs on its own.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;
use tracing::info;

/// Kind of platform object a lookup failed to find.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Missing {
    Channel,
    Member,
    User,
}

impl fmt::Display for Missing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Missing::Channel => "Channel",
            Missing::Member => "Member",
            Missing::User => "User",
        })
    }
}

/// Errors reported by bot collaborators.
#[derive(Debug, Error)]
#[allow(dead_code)]
pub enum BotError {
    #[error("{0} not found.")]
    NotFound(Missing),
    #[error("bot is not connected")]
    Unavailable,
    #[error("{0}")]
    Other(String),
}

/// Caches that can be reloaded on request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Signal {
    Settings,
    ReactionRoles,
    Blacklist,
}

/// Presence summary for one guild member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemberActivity {
    pub activity: Option<String>,
    pub top_role: Option<String>,
}

/// Operations the control endpoints need from the bot.
#[async_trait]
pub trait Bot: Send + Sync {
    /// Whether the upstream gateway session is open.
    fn is_connected(&self) -> bool;

    async fn send_to_channel(&self, channel_id: u64, message: &str) -> Result<(), BotError>;

    async fn send_to_user(&self, user_id: u64, message: &str) -> Result<(), BotError>;

    /// `Ok(None)` when the member is not in the guild.
    async fn member_activity(&self, member_id: u64) -> Result<Option<MemberActivity>, BotError>;

    /// Grant the verified role to a member.
    async fn verify_member(&self, member_id: u64) -> Result<(), BotError>;

    /// Post a contact-form submission to the staff logging channel.
    async fn log_contact(&self, payload: &Value) -> Result<(), BotError>;

    async fn refresh(&self, signal: Signal) -> Result<(), BotError>;
}

/// A [`Bot`] that records every call through `tracing` and does nothing
/// else. It knows no members, and snowflake 0 is never a valid destination.
#[derive(Debug, Default)]
pub struct LoggingBot;

#[async_trait]
impl Bot for LoggingBot {
    fn is_connected(&self) -> bool {
        true
    }

    async fn send_to_channel(&self, channel_id: u64, message: &str) -> Result<(), BotError> {
        if channel_id == 0 {
            return Err(BotError::NotFound(Missing::Channel));
        }
        info!(channel_id, message, "Send to channel");
        Ok(())
    }

    async fn send_to_user(&self, user_id: u64, message: &str) -> Result<(), BotError> {
        if user_id == 0 {
            return Err(BotError::NotFound(Missing::User));
        }
        info!(user_id, message, "Send to user");
        Ok(())
    }

    async fn member_activity(&self, member_id: u64) -> Result<Option<MemberActivity>, BotError> {
        info!(member_id, "Member activity lookup");
        Ok(None)
    }

    async fn verify_member(&self, member_id: u64) -> Result<(), BotError> {
        info!(member_id, "Verify member");
        Err(BotError::NotFound(Missing::Member))
    }

    async fn log_contact(&self, payload: &Value) -> Result<(), BotError> {
        info!(%payload, "Contact submission");
        Ok(())
    }

    async fn refresh(&self, signal: Signal) -> Result<(), BotError> {
        info!(?signal, "Cache refresh");
        Ok(())
    }
}
