//! Endpoints exposed to the control client.
//!
//! Each endpoint validates its payload and forwards to the [`Bot`]. They
//! hold no state of their own.

use crate::auth::EXEMPT_ENDPOINT;
use crate::bot::{Bot, Signal};
use crate::error::EndpointError;
use crate::registry::{Handler, HandlerResult, Registry, RegistryError};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::future::Future;
use std::sync::Arc;

/// Register every endpoint on `registry`.
pub fn register_all(registry: &mut Registry, bot: Arc<dyn Bot>) -> Result<(), RegistryError> {
    let ping_bot = Arc::clone(&bot);
    registry.register(
        EXEMPT_ENDPOINT,
        Handler::nullary(move || ping(Arc::clone(&ping_bot))),
    )?;
    registry.register("send", with_bot(&bot, send))?;
    registry.register("member_activities", with_bot(&bot, member_activities))?;
    registry.register("verify", with_bot(&bot, verify))?;
    registry.register("contact", with_bot(&bot, contact))?;
    registry.register("signal_update", with_bot(&bot, signal_update))?;
    Ok(())
}

fn with_bot<F, Fut>(bot: &Arc<dyn Bot>, f: F) -> Handler
where
    F: Fn(Arc<dyn Bot>, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    let bot = Arc::clone(bot);
    Handler::unary(move |data| f(Arc::clone(&bot), data))
}

/// A platform snowflake id. Clients may send it as a string or a number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawId")]
struct Snowflake(u64);

#[derive(Deserialize)]
#[serde(untagged)]
enum RawId {
    Number(u64),
    Text(String),
}

impl TryFrom<RawId> for Snowflake {
    type Error = String;

    fn try_from(raw: RawId) -> Result<Self, Self::Error> {
        match raw {
            RawId::Number(id) => Ok(Snowflake(id)),
            RawId::Text(text) => text
                .parse()
                .map(Snowflake)
                .map_err(|_| format!("invalid id '{text}'")),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SendPayload {
    #[serde(default)]
    channel_id: Option<Snowflake>,
    #[serde(default)]
    user_id: Option<Snowflake>,
    message: String,
}

fn payload<T: DeserializeOwned>(data: Value) -> Result<T, EndpointError> {
    serde_json::from_value(data).map_err(EndpointError::bad_arguments)
}

/// Liveness check. Fails with 503 while the gateway session is down.
async fn ping(bot: Arc<dyn Bot>) -> HandlerResult {
    if bot.is_connected() {
        Ok(None)
    } else {
        Err(EndpointError::Unavailable)
    }
}

/// Deliver a message to a channel, or as a DM when only `user_id` is set.
async fn send(bot: Arc<dyn Bot>, data: Value) -> HandlerResult {
    let SendPayload {
        channel_id,
        user_id,
        message,
    } = payload(data)?;

    match (channel_id, user_id) {
        (Some(channel), _) => bot.send_to_channel(channel.0, &message).await?,
        (None, Some(user)) => bot.send_to_user(user.0, &message).await?,
        (None, None) => {
            return Err(EndpointError::bad_arguments(
                "one of channel_id or user_id is required",
            ))
        }
    }
    Ok(None)
}

async fn member_activities(bot: Arc<dyn Bot>, data: Value) -> HandlerResult {
    let ids: Vec<Snowflake> = payload(data)?;

    let mut activities = Map::with_capacity(ids.len());
    for Snowflake(id) in ids {
        let entry = match bot.member_activity(id).await? {
            Some(activity) => serde_json::to_value(activity)
                .map_err(|e| EndpointError::Internal(e.to_string()))?,
            None => Value::Null,
        };
        activities.insert(id.to_string(), entry);
    }
    Ok(Some(Value::Object(activities)))
}

async fn verify(bot: Arc<dyn Bot>, data: Value) -> HandlerResult {
    let Snowflake(member_id) = payload(data)?;
    bot.verify_member(member_id).await?;
    Ok(None)
}

async fn contact(bot: Arc<dyn Bot>, data: Value) -> HandlerResult {
    bot.log_contact(&data).await?;
    Ok(None)
}

async fn signal_update(bot: Arc<dyn Bot>, data: Value) -> HandlerResult {
    let signal: Signal = payload(data)?;
    bot.refresh(signal).await?;
    Ok(None)
}
