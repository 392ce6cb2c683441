use crate::feeds::{discover_subscriptions, FirstSeen, Observation};
use crate::settings::SettingsStore;
use crate::template;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serenity::all::{ChannelId, CreateEmbed, CreateMessage};
use serenity::http::Http;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use tokio::time::{interval, sleep, Duration};
use tracing::{debug, error, info, warn};

pub const POLL_INTERVAL: Duration = Duration::from_secs(5 * 60);

const STREAMS_PER_QUERY: usize = 100;
const THUMBNAIL_ATTEMPTS: u32 = 20;
const THUMBNAIL_RETRY_DELAY: Duration = Duration::from_secs(30);

const HELIX_STREAMS: &str = "https://api.twitch.tv/helix/streams";
const HELIX_TEAMS: &str = "https://api.twitch.tv/helix/teams";
const OAUTH_TOKEN: &str = "https://id.twitch.tv/oauth2/token";

#[derive(Debug, Deserialize)]
struct Helix<T> {
    data: Vec<T>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HelixStream {
    pub id: String,
    pub user_login: String,
    pub user_name: String,
    #[serde(default)]
    pub game_name: String,
    pub thumbnail_url: String,
    pub started_at: String,
}

#[derive(Debug, Deserialize)]
struct HelixTeam {
    users: Vec<HelixTeamMember>,
}

#[derive(Debug, Deserialize)]
struct HelixTeamMember {
    user_login: String,
}

#[derive(Debug, Deserialize)]
struct OauthToken {
    access_token: String,
}

/// `secret.twitch.client_id_secret` is stored as `<client_id>:<client_secret>`.
fn parse_client_creds(raw: &str) -> Option<(String, String)> {
    let (id, secret) = raw.split_once(':')?;
    if id.is_empty() || secret.is_empty() {
        return None;
    }
    Some((id.to_string(), secret.to_string()))
}

/// Pick the credentials for this client's poll cycle: the first usable pair
/// configured by one of its own guilds, falling back to any guild's pair.
/// The poller authenticates as a single application per cycle; guilds of one
/// client sharing different applications is not supported, and a mix is
/// logged once per cycle.
fn select_creds(
    creds: &BTreeMap<u64, String>,
    enabled_guilds: &[u64],
) -> Option<(String, String)> {
    let own: Vec<&String> = creds
        .iter()
        .filter(|(guild, _)| enabled_guilds.contains(guild))
        .map(|(_, raw)| raw)
        .collect();
    if own.windows(2).any(|pair| pair[0] != pair[1]) {
        warn!("Twitch poller: multiple distinct credentials among served guilds, using the first");
    }
    own.first()
        .copied()
        .or_else(|| creds.values().next())
        .and_then(|raw| parse_client_creds(raw))
}

fn chunk_logins(logins: &[String], size: usize) -> Vec<Vec<String>> {
    logins.chunks(size).map(|c| c.to_vec()).collect()
}

/// Thumbnail URLs come templated with `{width}`/`{height}`.
fn sized_thumbnail(url: &str) -> String {
    url.replace("{width}", "640").replace("{height}", "360")
}

/// Streaming-platform poller: chunked live-stream queries, first-seen
/// suppression keyed by stream id, per-guild fan-out with template-rendered
/// titles and a thumbnail freshness workaround for the CDN.
pub struct TwitchPoller {
    settings: Arc<SettingsStore>,
    discord: Arc<Http>,
    enabled_guilds: Vec<u64>,
    http: reqwest::Client,
    /// Redirects disabled: the freshness probe inspects the CDN response
    /// itself, not whatever it forwards to.
    probe: reqwest::Client,
    state: FirstSeen,
    app_token: Mutex<Option<String>>,
}

impl TwitchPoller {
    pub fn new(settings: Arc<SettingsStore>, discord: Arc<Http>, enabled_guilds: Vec<u64>) -> Self {
        Self {
            settings,
            discord,
            enabled_guilds,
            http: reqwest::Client::new(),
            probe: reqwest::Client::builder()
                .redirect(reqwest::redirect::Policy::none())
                .build()
                .unwrap_or_default(),
            state: FirstSeen::new(),
            app_token: Mutex::new(None),
        }
    }

    pub async fn run(self) {
        let mut ticker = interval(POLL_INTERVAL);
        loop {
            ticker.tick().await;
            if let Err(e) = self.cycle().await {
                error!("Twitch poll cycle failed: {}", e);
            }
        }
    }

    pub async fn cycle(&self) -> anyhow::Result<()> {
        let mut subscriptions = discover_subscriptions(
            &self.settings,
            &self.enabled_guilds,
            "twitch.online_notif.enabled",
            "twitch.online_notif.logins",
        )?;

        let creds = self
            .settings
            .get_secret_all("secret.twitch.client_id_secret")?;
        let Some((client_id, client_secret)) = select_creds(&creds, &self.enabled_guilds) else {
            if !subscriptions.is_empty() {
                debug!("Twitch poller: no usable credentials configured");
            }
            return Ok(());
        };

        self.expand_teams(&client_id, &client_secret, &mut subscriptions)
            .await;

        if subscriptions.is_empty() {
            return Ok(());
        }

        let logins: Vec<String> = subscriptions.keys().cloned().collect();
        let mut live: BTreeMap<String, HelixStream> = BTreeMap::new();
        for chunk in chunk_logins(&logins, STREAMS_PER_QUERY) {
            match self
                .fetch_streams(&client_id, &client_secret, &chunk)
                .await
            {
                Ok(streams) => {
                    for stream in streams {
                        live.insert(stream.user_login.to_lowercase(), stream);
                    }
                }
                Err(e) => warn!("Twitch poller: stream query failed: {}", e),
            }
        }

        for (login, guilds) in &subscriptions {
            match live.get(login) {
                Some(stream) => {
                    if self.state.observe(login, &stream.id) == Observation::Changed {
                        info!("Twitch poller: {} went live (stream {})", login, stream.id);
                        self.fan_out(stream, guilds).await;
                    }
                }
                None => self.state.mark_offline(login),
            }
        }
        Ok(())
    }

    /// A configured `twitch.online_notif.team` contributes its member logins
    /// to the guild's resource set.
    async fn expand_teams(
        &self,
        client_id: &str,
        client_secret: &str,
        subscriptions: &mut BTreeMap<String, BTreeSet<u64>>,
    ) {
        for &guild_id in &self.enabled_guilds {
            let team = match (
                self.settings.get_bool(guild_id, "twitch.online_notif.enabled"),
                self.settings.get_str(guild_id, "twitch.online_notif.team"),
            ) {
                (Ok(true), Ok(Some(team))) if !team.is_empty() => team,
                _ => continue,
            };
            match self.fetch_team_logins(client_id, client_secret, &team).await {
                Ok(logins) => {
                    for login in logins {
                        subscriptions
                            .entry(login.to_lowercase())
                            .or_default()
                            .insert(guild_id);
                    }
                }
                Err(e) => warn!(
                    "Twitch poller: team `{}` lookup failed for guild {}: {}",
                    team, guild_id, e
                ),
            }
        }
    }

    async fn app_token(&self, client_id: &str, client_secret: &str) -> anyhow::Result<String> {
        if let Some(token) = self.app_token.lock().unwrap().clone() {
            return Ok(token);
        }
        let response: OauthToken = self
            .http
            .post(OAUTH_TOKEN)
            .form(&[
                ("client_id", client_id),
                ("client_secret", client_secret),
                ("grant_type", "client_credentials"),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        *self.app_token.lock().unwrap() = Some(response.access_token.clone());
        Ok(response.access_token)
    }

    async fn helix_get<T: serde::de::DeserializeOwned>(
        &self,
        client_id: &str,
        client_secret: &str,
        url: &str,
        query: &[(&str, &str)],
    ) -> anyhow::Result<Helix<T>> {
        let token = self.app_token(client_id, client_secret).await?;
        let response = self
            .http
            .get(url)
            .query(query)
            .header("Client-Id", client_id)
            .bearer_auth(&token)
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            // Token expired; drop it so the next cycle re-authenticates.
            *self.app_token.lock().unwrap() = None;
            anyhow::bail!("helix rejected app token");
        }
        Ok(response.error_for_status()?.json().await?)
    }

    async fn fetch_streams(
        &self,
        client_id: &str,
        client_secret: &str,
        logins: &[String],
    ) -> anyhow::Result<Vec<HelixStream>> {
        let query: Vec<(&str, &str)> = logins
            .iter()
            .map(|login| ("user_login", login.as_str()))
            .collect();
        let response: Helix<HelixStream> = self
            .helix_get(client_id, client_secret, HELIX_STREAMS, &query)
            .await?;
        Ok(response.data)
    }

    async fn fetch_team_logins(
        &self,
        client_id: &str,
        client_secret: &str,
        team: &str,
    ) -> anyhow::Result<Vec<String>> {
        let response: Helix<HelixTeam> = self
            .helix_get(client_id, client_secret, HELIX_TEAMS, &[("name", team)])
            .await?;
        Ok(response
            .data
            .into_iter()
            .flat_map(|team| team.users)
            .map(|member| member.user_login)
            .collect())
    }

    async fn fan_out(&self, stream: &HelixStream, guilds: &BTreeSet<u64>) {
        let started_at = DateTime::parse_from_rfc3339(&stream.started_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now());

        for &guild_id in guilds {
            if let Err(e) = self.notify_guild(guild_id, stream, started_at).await {
                warn!(
                    "Twitch poller: notification for `{}` to guild {} failed: {}",
                    stream.user_login, guild_id, e
                );
            }
        }
    }

    async fn notify_guild(
        &self,
        guild_id: u64,
        stream: &HelixStream,
        started_at: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let Some(channel_id) = self
            .settings
            .get_u64(guild_id, "twitch.online_notif.channel_id")?
        else {
            debug!(
                "Twitch poller: guild {} has no notification channel configured",
                guild_id
            );
            return Ok(());
        };

        let template = self
            .settings
            .get_str(guild_id, "twitch.online_notif.title_template")?
            .unwrap_or_default();
        let title = template::render(
            &template,
            &[
                ("channel", stream.user_name.as_str()),
                ("game", stream.game_name.as_str()),
            ],
        );

        // A configured image URL wins over the probed thumbnail.
        let image = match self.settings.get_str(guild_id, "twitch.online_notif.image_url")? {
            Some(url) if !url.is_empty() => Some(url),
            _ => {
                self.fresh_thumbnail(&sized_thumbnail(&stream.thumbnail_url), started_at)
                    .await
            }
        };

        let mut embed = CreateEmbed::new()
            .title(title)
            .url(format!("https://twitch.tv/{}", stream.user_login));
        if let Some(image) = image {
            embed = embed.image(image);
        }

        ChannelId::new(channel_id)
            .send_message(&self.discord, CreateMessage::new().embed(embed))
            .await?;
        Ok(())
    }

    /// The CDN may serve a cached thumbnail from before the stream started.
    /// Probe (redirects disabled) and compare the response `Date` header to
    /// the stream start; retry up to 20 times 30s apart, and give up by
    /// sending the notification without an image.
    async fn fresh_thumbnail(&self, url: &str, started_at: DateTime<Utc>) -> Option<String> {
        for attempt in 1..=THUMBNAIL_ATTEMPTS {
            match self.probe.get(url).send().await {
                Ok(response) => {
                    let served_at = response
                        .headers()
                        .get(reqwest::header::DATE)
                        .and_then(|v| v.to_str().ok())
                        .and_then(|s| DateTime::parse_from_rfc2822(s).ok())
                        .map(|dt| dt.with_timezone(&Utc));
                    match served_at {
                        Some(served_at) if served_at >= started_at => return Some(url.to_string()),
                        _ => debug!(
                            "Twitch poller: stale thumbnail (attempt {}/{})",
                            attempt, THUMBNAIL_ATTEMPTS
                        ),
                    }
                }
                Err(e) => debug!("Twitch poller: thumbnail probe failed: {}", e),
            }
            if attempt < THUMBNAIL_ATTEMPTS {
                sleep(THUMBNAIL_RETRY_DELAY).await;
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunking_at_query_limit() {
        let logins: Vec<String> = (0..250).map(|i| format!("streamer{}", i)).collect();
        let chunks = chunk_logins(&logins, STREAMS_PER_QUERY);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 100);
        assert_eq!(chunks[1].len(), 100);
        assert_eq!(chunks[2].len(), 50);
    }

    #[test]
    fn test_creds_prefer_a_served_guild() {
        let mut creds = BTreeMap::new();
        creds.insert(1, "other:app".to_string());
        creds.insert(5, "own:app".to_string());

        // Guild 5 is served by this client; its application wins over the
        // lower-id tenant of another client.
        assert_eq!(
            select_creds(&creds, &[5]),
            Some(("own".to_string(), "app".to_string()))
        );
        // No served guild configured anything: any pair beats none.
        assert_eq!(
            select_creds(&creds, &[9]),
            Some(("other".to_string(), "app".to_string()))
        );
        assert_eq!(select_creds(&BTreeMap::new(), &[5]), None);
    }

    #[test]
    fn test_creds_format() {
        assert_eq!(
            parse_client_creds("abc:xyz"),
            Some(("abc".to_string(), "xyz".to_string()))
        );
        assert_eq!(parse_client_creds("no-separator"), None);
        assert_eq!(parse_client_creds(":missing-id"), None);
    }

    #[test]
    fn test_thumbnail_sizing() {
        assert_eq!(
            sized_thumbnail("https://cdn.example/preview-{width}x{height}.jpg"),
            "https://cdn.example/preview-640x360.jpg"
        );
    }

    #[test]
    fn test_stream_payload_parses() {
        let json = r#"{
            "data": [{
                "id": "40952121085",
                "user_login": "somestreamer",
                "user_name": "SomeStreamer",
                "game_name": "Tetris",
                "thumbnail_url": "https://cdn.example/live-{width}x{height}.jpg",
                "started_at": "2026-08-27T18:00:00Z"
            }]
        }"#;
        let parsed: Helix<HelixStream> = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.data.len(), 1);
        assert_eq!(parsed.data[0].id, "40952121085");
        assert_eq!(parsed.data[0].game_name, "Tetris");
    }

    #[test]
    fn test_stream_payload_without_game() {
        let json = r#"{
            "data": [{
                "id": "1",
                "user_login": "x",
                "user_name": "X",
                "thumbnail_url": "u",
                "started_at": "2026-08-27T18:00:00Z"
            }]
        }"#;
        let parsed: Helix<HelixStream> = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.data[0].game_name, "");
    }
}
