//! # Notifications
//! Webhook sinks consuming fully-scored listings: a Discord embed notifier,
//! a compact Slack notifier, and a fan-out mux that throttles sends and
//! reports which channels succeeded. Operator alerts (zero-yield streaks,
//! crash loops, start/stop) go through a separate out-of-band webhook.

pub mod decider;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::time::{Duration, Instant};

use crate::model::{AlertLevel, Annonce};
use decider::NotifyDecision;

/// Minimum gap between outbound sends, so a burst of urgent listings does
/// not flood the webhook.
const DEFAULT_SEND_GAP: Duration = Duration::from_secs(2);

/// Embed colours per alert tier.
fn embed_color(level: AlertLevel) -> u32 {
    match level {
        AlertLevel::Urgent => 0xFF0000,
        AlertLevel::Interessant => 0xFF8C00,
        AlertLevel::Surveiller => 0xFFD700,
        AlertLevel::Archive => 0x808080,
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, annonce: &Annonce, decision: &NotifyDecision) -> Result<()>;
    fn channel(&self) -> &'static str;
}

/// Discord webhook notifier with a rich embed.
pub struct DiscordNotifier {
    webhook_url: Option<String>,
    client: reqwest::Client,
}

impl DiscordNotifier {
    pub fn from_env() -> Self {
        Self {
            webhook_url: std::env::var("DISCORD_WEBHOOK_URL").ok(),
            client: http_client(),
        }
    }

    pub fn new(url: String) -> Self {
        Self {
            webhook_url: Some(url),
            client: http_client(),
        }
    }

    fn build_embed(annonce: &Annonce, decision: &NotifyDecision) -> serde_json::Value {
        let title = if decision.is_update {
            let delta = decision
                .price_drop_pct(annonce)
                .map(|pct| format!(" (−{pct:.0}%)"))
                .or_else(|| {
                    decision
                        .score_delta(annonce)
                        .map(|d| format!(" (+{d} pts)"))
                })
                .unwrap_or_default();
            format!(
                "MAJ {} {} {}{delta}",
                annonce.make, annonce.model, annonce.version
            )
        } else {
            format!("{} {} {}", annonce.make, annonce.model, annonce.version)
        };

        let mut fields = vec![
            serde_json::json!({"name": "Prix", "value": annonce.format_price(), "inline": true}),
            serde_json::json!({"name": "Km", "value": annonce.format_km(), "inline": true}),
            serde_json::json!({
                "name": "Score",
                "value": format!("{}/100 ({})", annonce.score_total, annonce.alert_level.as_str()),
                "inline": true
            }),
        ];
        if let Some(year) = annonce.year {
            fields.push(serde_json::json!({"name": "Année", "value": year.to_string(), "inline": true}));
        }
        if !annonce.city.is_empty() || !annonce.department.is_empty() {
            let mut loc = annonce.city.clone();
            if !annonce.department.is_empty() {
                if loc.is_empty() {
                    loc = annonce.department.clone();
                } else {
                    loc = format!("{loc} ({})", annonce.department);
                }
            }
            fields.push(serde_json::json!({"name": "Localisation", "value": loc, "inline": true}));
        }
        if annonce.margin_min > 0 || annonce.margin_max > 0 {
            fields.push(serde_json::json!({
                "name": "Marge estimée",
                "value": format!("{} - {} €", annonce.margin_min, annonce.margin_max),
                "inline": true
            }));
        }
        if !annonce.opportunities.is_empty() {
            fields.push(serde_json::json!({
                "name": "Opportunités",
                "value": annonce.opportunities.iter().take(3).cloned().collect::<Vec<_>>().join(", "),
                "inline": false
            }));
        }
        if !annonce.risks.is_empty() {
            fields.push(serde_json::json!({
                "name": "Risques",
                "value": annonce.risks.iter().take(3).cloned().collect::<Vec<_>>().join(", "),
                "inline": false
            }));
        }

        let mut embed = serde_json::json!({
            "title": title.trim(),
            "url": annonce.url,
            "color": embed_color(annonce.alert_level),
            "description": format!("reason={} source={}", decision.reason.as_str(), annonce.source),
            "fields": fields,
        });
        if let Some(thumb) = annonce.image_urls.first() {
            embed["thumbnail"] = serde_json::json!({"url": thumb});
        }
        embed
    }
}

#[async_trait]
impl Notifier for DiscordNotifier {
    async fn send(&self, annonce: &Annonce, decision: &NotifyDecision) -> Result<()> {
        let Some(url) = &self.webhook_url else {
            tracing::debug!("Discord disabled (no DISCORD_WEBHOOK_URL)");
            return Ok(());
        };
        let body = serde_json::json!({ "embeds": [Self::build_embed(annonce, decision)] });
        self.client
            .post(url)
            .json(&body)
            .send()
            .await
            .context("discord post")?
            .error_for_status()
            .context("discord non-2xx")?;
        Ok(())
    }

    fn channel(&self) -> &'static str {
        "discord"
    }
}

/// Slack webhook notifier (compact text).
pub struct SlackNotifier {
    webhook_url: Option<String>,
    client: reqwest::Client,
}

impl SlackNotifier {
    pub fn from_env() -> Self {
        Self {
            webhook_url: std::env::var("SLACK_WEBHOOK_URL").ok(),
            client: http_client(),
        }
    }

    pub fn new(url: String) -> Self {
        Self {
            webhook_url: Some(url),
            client: http_client(),
        }
    }
}

#[async_trait]
impl Notifier for SlackNotifier {
    async fn send(&self, annonce: &Annonce, decision: &NotifyDecision) -> Result<()> {
        let Some(url) = &self.webhook_url else {
            tracing::debug!("Slack disabled (no SLACK_WEBHOOK_URL)");
            return Ok(());
        };
        let text = format!(
            "*{} {} {}* — {} / {} — score {}/100 ({})\nreason={}\n{}",
            annonce.make,
            annonce.model,
            annonce.version,
            annonce.format_price(),
            annonce.format_km(),
            annonce.score_total,
            annonce.alert_level.as_str(),
            decision.reason.as_str(),
            annonce.url
        );
        let body = serde_json::json!({ "text": text });
        self.client
            .post(url)
            .json(&body)
            .send()
            .await
            .context("slack post")?
            .error_for_status()
            .context("slack non-2xx")?;
        Ok(())
    }

    fn channel(&self) -> &'static str {
        "slack"
    }
}

/// Fan-out multiplexer. Returns the channels that accepted the message;
/// enforces a minimum gap between consecutive sends.
pub struct NotifierMux {
    notifiers: Vec<Box<dyn Notifier>>,
    send_gap: Duration,
    last_send: tokio::sync::Mutex<Option<Instant>>,
}

impl NotifierMux {
    pub fn from_env() -> Self {
        Self::new(vec![
            Box::new(DiscordNotifier::from_env()),
            Box::new(SlackNotifier::from_env()),
        ])
    }

    pub fn new(notifiers: Vec<Box<dyn Notifier>>) -> Self {
        Self {
            notifiers,
            send_gap: DEFAULT_SEND_GAP,
            last_send: tokio::sync::Mutex::new(None),
        }
    }

    pub fn with_send_gap(mut self, gap: Duration) -> Self {
        self.send_gap = gap;
        self
    }

    /// Send to all channels; returns those that succeeded.
    pub async fn notify(&self, annonce: &Annonce, decision: &NotifyDecision) -> Vec<String> {
        {
            let mut last = self.last_send.lock().await;
            if let Some(prev) = *last {
                let elapsed = Instant::now().saturating_duration_since(prev);
                if elapsed < self.send_gap {
                    tokio::time::sleep(self.send_gap - elapsed).await;
                }
            }
            *last = Some(Instant::now());
        }

        let mut delivered = Vec::new();
        for notifier in &self.notifiers {
            match notifier.send(annonce, decision).await {
                Ok(()) => delivered.push(notifier.channel().to_string()),
                Err(e) => {
                    tracing::warn!(channel = notifier.channel(), error = %format!("{e:#}"), "notify failed");
                }
            }
        }
        delivered
    }
}

/// Out-of-band operator alert (blocked sources, zero-yield streaks,
/// crash loops, start/stop). Separate webhook so it cannot be drowned out
/// by listing notifications; falls back to the Discord webhook.
pub async fn send_operator_alert(message: &str) {
    let url = std::env::var("OPS_WEBHOOK_URL")
        .or_else(|_| std::env::var("DISCORD_WEBHOOK_URL"))
        .ok();
    let Some(url) = url else {
        tracing::warn!(message = message, "operator alert (no webhook configured)");
        return;
    };
    let body = serde_json::json!({ "content": format!("**ALERTE RADAR**\n{message}") });
    match http_client().post(&url).json(&body).send().await {
        Ok(resp) => {
            if let Err(e) = resp.error_for_status() {
                tracing::warn!(error = %e, "operator alert rejected");
            }
        }
        Err(e) => tracing::warn!(error = %e, "operator alert failed"),
    }
}

fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .unwrap_or_default()
}
