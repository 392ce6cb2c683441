use crate::{Data, Error};
use thiserror::Error as ThisError;
use tracing::{error, warn};

/// Typed failures raised inside command handlers and services. Handlers
/// return these through the crate-wide boxed `Error`; the single translation
/// point is [`on_error`], installed as the poise error hook.
#[derive(Debug, ThisError)]
pub enum BotError {
    /// Recoverable, caused by invalid user input or state. Rendered to the
    /// initiator as an ephemeral "Error: <message>".
    #[error("{0}")]
    User(String),

    /// A cooldown bucket denied the invocation.
    #[error("command is on cooldown, retry in {retry_after_secs}s")]
    Cooldown { retry_after_secs: u64 },

    /// Specifier presence did not match the key descriptor.
    #[error("{0}")]
    ConfigKeyUsage(String),

    /// Transient upstream failure; retried by the owning periodic task's
    /// natural cadence, never surfaced to users.
    #[error("upstream request failed: {0}")]
    ExternalTransient(#[from] reqwest::Error),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("discord api error: {0}")]
    Discord(#[from] serenity::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl BotError {
    pub fn user(message: impl Into<String>) -> Self {
        BotError::User(message.into())
    }
}

/// The message shown when a cooldown bucket denies an invocation.
pub fn cooldown_message(retry_after_secs: u64) -> String {
    format!(
        "This command is on cooldown. You can use this command again in {} seconds here, \
         or you can use it in the bot spam channel if there is one.",
        retry_after_secs
    )
}

/// Walk a boxed handler error and its direct cause looking for a `BotError`
/// that should be shown to the initiating user. Returns the ephemeral text,
/// or None when the failure is internal.
pub fn user_facing_message(err: &(dyn std::error::Error + 'static)) -> Option<String> {
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = current {
        if let Some(bot_err) = e.downcast_ref::<BotError>() {
            match bot_err {
                BotError::User(msg) | BotError::ConfigKeyUsage(msg) => {
                    return Some(format!("Error: {}", msg));
                }
                BotError::Cooldown { retry_after_secs } => {
                    return Some(cooldown_message(*retry_after_secs));
                }
                _ => return None,
            }
        }
        current = e.source();
    }
    None
}

/// Poise error hook. Command failures are either surfaced ephemerally (user
/// errors) or logged and suppressed; nothing escapes the event loop.
pub async fn on_error(framework_error: poise::FrameworkError<'_, Data, Error>) {
    match framework_error {
        poise::FrameworkError::Command { error, ctx, .. } => {
            let command = &ctx.command().qualified_name;
            match user_facing_message(error.as_ref()) {
                Some(message) => {
                    warn!("Command /{} rejected: {}", command, error);
                    let reply = poise::CreateReply::default()
                        .content(message)
                        .ephemeral(true);
                    if let Err(e) = ctx.send(reply).await {
                        error!("Failed to send error reply for /{}: {}", command, e);
                    }
                }
                None => {
                    error!("Command /{} failed: {}", command, error);
                }
            }
        }
        poise::FrameworkError::CommandCheckFailed {
            error: Some(error),
            ctx,
            ..
        } => {
            let command = &ctx.command().qualified_name;
            match user_facing_message(error.as_ref()) {
                Some(message) => {
                    let reply = poise::CreateReply::default()
                        .content(message)
                        .ephemeral(true);
                    if let Err(e) = ctx.send(reply).await {
                        error!("Failed to send check reply for /{}: {}", command, e);
                    }
                }
                None => error!("Check for /{} failed: {}", command, error),
            }
        }
        poise::FrameworkError::ArgumentParse { error, ctx, .. } => {
            let reply = poise::CreateReply::default()
                .content(format!("Error: {}", error))
                .ephemeral(true);
            if let Err(e) = ctx.send(reply).await {
                error!("Failed to send argument error reply: {}", e);
            }
        }
        other => {
            if let Err(e) = poise::builtins::on_error(other).await {
                error!("Error handler itself failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_error_surfaces() {
        let err = BotError::user("quote not found");
        assert_eq!(
            user_facing_message(&err),
            Some("Error: quote not found".to_string())
        );
    }

    #[test]
    fn test_cooldown_error_uses_template() {
        let err = BotError::Cooldown {
            retry_after_secs: 42,
        };
        let message = user_facing_message(&err).unwrap();
        assert!(message.contains("in 42 seconds"));
        assert!(message.contains("bot spam channel"));
    }

    #[test]
    fn test_internal_errors_are_suppressed() {
        let err = BotError::Database(rusqlite::Error::InvalidQuery);
        assert_eq!(user_facing_message(&err), None);
    }

    #[test]
    fn test_direct_cause_is_inspected() {
        // A BotError one level down the source chain still surfaces.
        #[derive(Debug, thiserror::Error)]
        #[error("wrapper")]
        struct Wrapper(#[source] BotError);

        let err = Wrapper(BotError::user("bad input"));
        assert_eq!(
            user_facing_message(&err),
            Some("Error: bad input".to_string())
        );
    }
}
