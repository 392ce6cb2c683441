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

const SEARCH: &str = "https://www.googleapis.com/youtube/v3/search";

#[derive(Debug, Deserialize)]
struct SearchResponse {
    items: Vec<SearchItem>,
}

#[derive(Debug, Deserialize)]
struct SearchItem {
    id: VideoId,
    snippet: Snippet,
}

#[derive(Debug, Deserialize)]
struct VideoId {
    #[serde(rename = "videoId")]
    video_id: String,
}

#[derive(Debug, Deserialize)]
struct Snippet {
    #[serde(rename = "publishedAt")]
    published_at: String,
    title: String,
    #[serde(rename = "channelTitle")]
    channel_title: String,
}

fn video_url(video_id: &str) -> String {
    format!("https://www.youtube.com/watch?v={}", video_id)
}

/// Video-platform poller: newest upload timestamp per channel id, first-seen
/// suppression, per-guild fan-out.
pub struct YoutubePoller {
    settings: Arc<SettingsStore>,
    discord: Arc<Http>,
    enabled_guilds: Vec<u64>,
    http: reqwest::Client,
    state: FirstSeen,
}

impl YoutubePoller {
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
                error!("YouTube poll cycle failed: {}", e);
            }
        }
    }

    pub async fn cycle(&self) -> anyhow::Result<()> {
        let subscriptions = discover_subscriptions(
            &self.settings,
            &self.enabled_guilds,
            "youtube.notif.enabled",
            "youtube.notif.channels",
        )?;
        if subscriptions.is_empty() {
            return Ok(());
        }

        let keys = self.settings.get_secret_all("secret.youtube.api_key")?;
        let Some(api_key) = keys.values().next().cloned() else {
            debug!("YouTube poller: no API key configured");
            return Ok(());
        };

        for (channel, guilds) in &subscriptions {
            let latest = match self.fetch_latest(&api_key, channel).await {
                Ok(latest) => latest,
                Err(e) => {
                    warn!("YouTube poller: fetch for `{}` failed: {}", channel, e);
                    continue;
                }
            };
            match latest {
                Some(item) => {
                    if self.state.observe(channel, &item.snippet.published_at)
                        == Observation::Changed
                    {
                        info!("YouTube poller: new video on {}", channel);
                        self.fan_out(&item, guilds).await;
                    }
                }
                None => self.state.mark_offline(channel),
            }
        }
        Ok(())
    }

    async fn fetch_latest(&self, api_key: &str, channel: &str) -> anyhow::Result<Option<SearchItem>> {
        let response: SearchResponse = self
            .http
            .get(SEARCH)
            .query(&[
                ("part", "snippet"),
                ("channelId", channel),
                ("order", "date"),
                ("maxResults", "1"),
                ("type", "video"),
                ("key", api_key),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(response.items.into_iter().next())
    }

    async fn fan_out(&self, item: &SearchItem, guilds: &BTreeSet<u64>) {
        let url = video_url(&item.id.video_id);
        for &guild_id in guilds {
            if let Err(e) = self.notify_guild(guild_id, item, &url).await {
                warn!(
                    "YouTube poller: notification for `{}` to guild {} failed: {}",
                    item.snippet.channel_title, guild_id, e
                );
            }
        }
    }

    async fn notify_guild(&self, guild_id: u64, item: &SearchItem, url: &str) -> anyhow::Result<()> {
        let Some(channel_id) = self.settings.get_u64(guild_id, "youtube.notif.channel_id")? else {
            debug!(
                "YouTube poller: guild {} has no notification channel configured",
                guild_id
            );
            return Ok(());
        };
        let template = self
            .settings
            .get_str(guild_id, "youtube.notif.title_template")?
            .unwrap_or_default();
        let content = template::render(
            &template,
            &[
                ("channel", item.snippet.channel_title.as_str()),
                ("title", item.snippet.title.as_str()),
                ("url", url),
            ],
        );
        ChannelId::new(channel_id)
            .say(&self.discord, content)
            .await?;
        Ok(())
    }
}
