use crate::feeds::{discover_subscriptions, FirstSeen, Observation};
use crate::settings::SettingsStore;
use crate::template;
use serde::Deserialize;
use serenity::all::ChannelId;
use serenity::http::Http;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::time::{interval, Duration};
use tracing::{debug, error, info, warn};

pub const POLL_INTERVAL: Duration = Duration::from_secs(10 * 60);

const AUTHOR_FEED: &str = "https://public.api.bsky.app/xrpc/app.bsky.feed.getAuthorFeed";

#[derive(Debug, Deserialize)]
struct AuthorFeed {
    feed: Vec<FeedItem>,
}

#[derive(Debug, Deserialize)]
struct FeedItem {
    post: Post,
}

#[derive(Debug, Deserialize)]
struct Post {
    uri: String,
    record: PostRecord,
}

#[derive(Debug, Deserialize)]
struct PostRecord {
    #[serde(rename = "createdAt")]
    created_at: String,
}

/// `at://did:plc:xxx/app.bsky.feed.post/<rkey>` -> public web URL.
fn post_url(handle: &str, uri: &str) -> Option<String> {
    let rkey = uri.rsplit('/').next()?;
    if rkey.is_empty() {
        return None;
    }
    Some(format!("https://bsky.app/profile/{}/post/{}", handle, rkey))
}

/// Microblog poller: newest post timestamp per handle, first-seen
/// suppression, per-guild fan-out.
pub struct BskyPoller {
    settings: Arc<SettingsStore>,
    discord: Arc<Http>,
    enabled_guilds: Vec<u64>,
    http: reqwest::Client,
    state: FirstSeen,
}

impl BskyPoller {
    pub fn new(settings: Arc<SettingsStore>, discord: Arc<Http>, enabled_guilds: Vec<u64>) -> Self {
        Self {
            settings,
            discord,
            enabled_guilds,
            http: reqwest::Client::new(),
            state: FirstSeen::new(),
        }
    }

    pub async fn run(self) {
        let mut ticker = interval(POLL_INTERVAL);
        loop {
            ticker.tick().await;
            if let Err(e) = self.cycle().await {
                error!("Bluesky poll cycle failed: {}", e);
            }
        }
    }

    pub async fn cycle(&self) -> anyhow::Result<()> {
        let subscriptions = discover_subscriptions(
            &self.settings,
            &self.enabled_guilds,
            "bsky.post_notif.enabled",
            "bsky.post_notif.handles",
        )?;

        for (handle, guilds) in &subscriptions {
            let post = match self.fetch_latest(handle).await {
                Ok(post) => post,
                Err(e) => {
                    warn!("Bluesky poller: fetch for `{}` failed: {}", handle, e);
                    continue;
                }
            };
            match post {
                Some(post) => {
                    if self.state.observe(handle, &post.record.created_at) == Observation::Changed {
                        info!("Bluesky poller: new post from {}", handle);
                        self.fan_out(handle, &post, guilds).await;
                    }
                }
                None => self.state.mark_offline(handle),
            }
        }
        Ok(())
    }

    async fn fetch_latest(&self, handle: &str) -> anyhow::Result<Option<Post>> {
        let feed: AuthorFeed = self
            .http
            .get(AUTHOR_FEED)
            .query(&[("actor", handle), ("limit", "1")])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(feed.feed.into_iter().next().map(|item| item.post))
    }

    async fn fan_out(&self, handle: &str, post: &Post, guilds: &BTreeSet<u64>) {
        let url = post_url(handle, &post.uri).unwrap_or_default();
        for &guild_id in guilds {
            if let Err(e) = self.notify_guild(guild_id, handle, &url).await {
                warn!(
                    "Bluesky poller: notification for `{}` to guild {} failed: {}",
                    handle, guild_id, e
                );
            }
        }
    }

    async fn notify_guild(&self, guild_id: u64, handle: &str, url: &str) -> anyhow::Result<()> {
        let Some(channel_id) = self
            .settings
            .get_u64(guild_id, "bsky.post_notif.channel_id")?
        else {
            debug!(
                "Bluesky poller: guild {} has no notification channel configured",
                guild_id
            );
            return Ok(());
        };
        let template = self
            .settings
            .get_str(guild_id, "bsky.post_notif.title_template")?
            .unwrap_or_default();
        let content = template::render(&template, &[("handle", handle), ("url", url)]);
        ChannelId::new(channel_id)
            .say(&self.discord, content)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_post_url_from_at_uri() {
        assert_eq!(
            post_url(
                "someone.bsky.social",
                "at://did:plc:abc123/app.bsky.feed.post/3kwx7"
            ),
            Some("https://bsky.app/profile/someone.bsky.social/post/3kwx7".to_string())
        );
        assert_eq!(post_url("someone.bsky.social", ""), None);
    }

    #[test]
    fn test_author_feed_parses() {
        let json = r#"{
            "feed": [{
                "post": {
                    "uri": "at://did:plc:abc/app.bsky.feed.post/3kwx7",
                    "record": {"createdAt": "2026-08-27T12:00:00.000Z", "text": "hi"}
                }
            }]
        }"#;
        let parsed: AuthorFeed = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.feed[0].post.record.created_at, "2026-08-27T12:00:00.000Z");
    }

    #[test]
    fn test_empty_feed() {
        let parsed: AuthorFeed = serde_json::from_str(r#"{"feed": []}"#).unwrap();
        assert!(parsed.feed.is_empty());
    }
}
