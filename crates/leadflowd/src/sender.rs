//! Outreach queueing and SMTP delivery.
//!
//! Queueing computes a globally increasing `scheduled_for` inside the
//! daily send window with jittered spacing. Delivery re-validates the
//! recipient, applies the opt-out registry, picks the SMTP channel by
//! MX classification and handles the yandex→gmail spam fallback.

use crate::config::SmtpChannelSettings;
use crate::emailgen::EmailTemplate;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::transport::smtp::client::{Tls, TlsParameters};
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use mx_router::{MxClass, MxRouter};
use normalize::{clean_email, is_valid_email};
use rand::Rng;
use serde_json::{json, Value};
use sqlx::PgConnection;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

pub const MIN_SEND_DELAY_SECS: i64 = 540;
pub const MAX_SEND_DELAY_SECS: i64 = 960;

const SPAM_SIGNATURES: &[&str] = &["5.7.1", "5.7.0", "suspected spam", "message rejected"];

fn send_window_start() -> NaiveTime {
    NaiveTime::from_hms_opt(9, 10, 0).expect("valid time")
}

fn send_window_end() -> NaiveTime {
    NaiveTime::from_hms_opt(19, 45, 0).expect("valid time")
}

fn local_datetime(tz: Tz, date: NaiveDate, time: NaiveTime) -> DateTime<Tz> {
    let naive = date.and_time(time);
    tz.from_local_datetime(&naive)
        .earliest()
        .unwrap_or_else(|| tz.from_utc_datetime(&naive))
}

/// `ab***@domain` form for log lines; never log a full address.
pub fn mask_email(email: &str) -> String {
    match email.split_once('@') {
        Some((local, domain)) => {
            let head: String = local.chars().take(2).collect();
            format!("{head}***@{domain}")
        }
        None => "***".to_string(),
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SmtpError {
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("rejected: {0}")]
    Rejected(String),
    #[error("transport: {0}")]
    Transport(String),
}

impl SmtpError {
    pub fn is_spam_rejection(&self) -> bool {
        match self {
            SmtpError::Rejected(message) => {
                let lowered = message.to_lowercase();
                SPAM_SIGNATURES.iter().any(|sig| lowered.contains(sig))
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OutboundEmail {
    pub to: String,
    pub subject: String,
    pub body: String,
    pub from_header: String,
    pub reply_to: Option<String>,
    pub message_id: String,
}

/// Delivery seam: one call sends one message through one channel.
#[async_trait]
pub trait SmtpTransport: Send + Sync {
    async fn send(
        &self,
        channel: &SmtpChannelSettings,
        message: &OutboundEmail,
    ) -> Result<(), SmtpError>;
}

/// Real SMTP delivery over lettre. SSL vs STARTTLS is per channel;
/// credentials are applied only when both parts are present.
pub struct LettreSmtpTransport {
    timeout: Duration,
}

impl LettreSmtpTransport {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn build_message(message: &OutboundEmail) -> Result<Message, SmtpError> {
        let from: Mailbox = message
            .from_header
            .parse()
            .map_err(|err| SmtpError::Transport(format!("bad From header: {err}")))?;
        let to: Mailbox = message
            .to
            .parse()
            .map_err(|err| SmtpError::Transport(format!("bad To address: {err}")))?;

        let mut builder = Message::builder()
            .from(from)
            .to(to)
            .subject(message.subject.clone())
            .message_id(Some(message.message_id.clone()));
        if let Some(reply_to) = &message.reply_to {
            let mailbox: Mailbox = reply_to
                .parse()
                .map_err(|err| SmtpError::Transport(format!("bad Reply-To header: {err}")))?;
            builder = builder.reply_to(mailbox);
        }

        builder
            .header(ContentType::TEXT_PLAIN)
            .body(message.body.clone())
            .map_err(|err| SmtpError::Transport(format!("building message: {err}")))
    }

    fn classify_error(err: lettre::transport::smtp::Error) -> SmtpError {
        let text = format!("{err}");
        let lowered = text.to_lowercase();
        if lowered.contains("535") || lowered.contains("auth") {
            SmtpError::Auth(text)
        } else if err.is_permanent() {
            SmtpError::Rejected(text)
        } else {
            SmtpError::Transport(text)
        }
    }
}

#[async_trait]
impl SmtpTransport for LettreSmtpTransport {
    async fn send(
        &self,
        channel: &SmtpChannelSettings,
        message: &OutboundEmail,
    ) -> Result<(), SmtpError> {
        let email = Self::build_message(message)?;

        let tls = TlsParameters::new(channel.host.clone())
            .map_err(|err| SmtpError::Transport(format!("TLS setup: {err}")))?;
        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(channel.host.as_str())
            .port(channel.port)
            .timeout(Some(self.timeout));
        builder = if channel.use_ssl {
            builder.tls(Tls::Wrapper(tls))
        } else if channel.use_starttls {
            builder.tls(Tls::Required(tls))
        } else {
            builder.tls(Tls::None)
        };
        if !channel.username.is_empty() && !channel.password.is_empty() {
            builder = builder.credentials(Credentials::new(
                channel.username.clone(),
                channel.password.clone(),
            ));
        }

        let transport = builder.build();
        transport
            .send(email)
            .await
            .map(|_| ())
            .map_err(Self::classify_error)
    }
}

/// Slot selection: anchor on max(last scheduled, now), clamp into the
/// `[09:10, 19:45]` local window, add a jittered delay, roll to the
/// next morning when the delay would spill past the window end.
pub fn compute_scheduled_for<R: Rng>(
    last_scheduled: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    tz: Tz,
    rng: &mut R,
) -> DateTime<Utc> {
    let local_now = now.with_timezone(&tz);
    let anchor = match last_scheduled {
        Some(last) => {
            let last_local = last.with_timezone(&tz);
            if last_local > local_now {
                last_local
            } else {
                local_now
            }
        }
        None => local_now,
    };

    let delay = rng.gen_range(MIN_SEND_DELAY_SECS..=MAX_SEND_DELAY_SECS);
    pick_time_within_window(anchor, delay, tz, rng).with_timezone(&Utc)
}

fn pick_time_within_window<R: Rng>(
    anchor_local: DateTime<Tz>,
    delay_seconds: i64,
    tz: Tz,
    rng: &mut R,
) -> DateTime<Tz> {
    let window_start = local_datetime(tz, anchor_local.date_naive(), send_window_start());
    let mut window_end = local_datetime(tz, anchor_local.date_naive(), send_window_end());

    let base = if anchor_local < window_start {
        window_start
    } else if anchor_local > window_end {
        let next_day = anchor_local.date_naive() + ChronoDuration::days(1);
        window_end = local_datetime(tz, next_day, send_window_end());
        local_datetime(tz, next_day, send_window_start())
    } else {
        anchor_local
    };

    let candidate = base + ChronoDuration::seconds(delay_seconds);
    if candidate > window_end {
        let next_day = base.date_naive() + ChronoDuration::days(1);
        let base = local_datetime(tz, next_day, send_window_start());
        return base
            + ChronoDuration::seconds(rng.gen_range(MIN_SEND_DELAY_SECS..=MAX_SEND_DELAY_SECS));
    }
    candidate
}

#[derive(Debug, Clone)]
pub struct OutreachItem {
    pub id: Uuid,
    pub company_id: Uuid,
    pub contact_id: Option<Uuid>,
    pub to_email: String,
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliverOutcome {
    /// sending globally disabled, row untouched
    Disabled,
    /// outside the send window, row stays `scheduled`
    Deferred,
    Skipped,
    Sent,
    Failed,
}

pub(crate) struct RoutedSendResult {
    pub sent: bool,
    pub metadata: Value,
    pub error: Option<String>,
}

pub struct EmailSender {
    tz: Tz,
    sending_enabled: bool,
    gmail: SmtpChannelSettings,
    yandex: SmtpChannelSettings,
    router: Arc<MxRouter>,
    transport: Arc<dyn SmtpTransport>,
}

impl EmailSender {
    pub fn new(
        tz: Tz,
        sending_enabled: bool,
        gmail: SmtpChannelSettings,
        yandex: SmtpChannelSettings,
        router: Arc<MxRouter>,
        transport: Arc<dyn SmtpTransport>,
    ) -> Self {
        Self {
            tz,
            sending_enabled,
            gmail,
            yandex,
            router,
            transport,
        }
    }

    pub fn is_within_send_window(&self, now: DateTime<Utc>) -> bool {
        let local = now.with_timezone(&self.tz);
        let start = local_datetime(self.tz, local.date_naive(), send_window_start());
        let end = local_datetime(self.tz, local.date_naive(), send_window_end());
        start <= local && local <= end
    }

    /// Persist an outreach row. Invalid recipients are recorded as
    /// `skipped` immediately; everything else lands as `scheduled`
    /// with a slot after every previously scheduled message.
    pub async fn queue(
        &self,
        conn: &mut PgConnection,
        company_id: Uuid,
        contact_id: Option<Uuid>,
        to_email: &str,
        template: &EmailTemplate,
        request_payload: Option<&Value>,
    ) -> anyhow::Result<Uuid> {
        let cleaned = clean_email(to_email);
        if !is_valid_email(&cleaned) {
            tracing::info!("recipient {} failed validation", mask_email(to_email));
            return self
                .insert_message(
                    conn,
                    company_id,
                    contact_id,
                    template,
                    "skipped",
                    None,
                    Some("invalid_email"),
                    json!({ "to_email": to_email }),
                )
                .await;
        }

        let last_scheduled: Option<(DateTime<Utc>,)> = sqlx::query_as(
            r#"
            SELECT scheduled_for
            FROM outreach_messages
            WHERE channel = 'email' AND scheduled_for IS NOT NULL
            ORDER BY scheduled_for DESC
            LIMIT 1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .fetch_optional(&mut *conn)
        .await?;

        let scheduled_for = compute_scheduled_for(
            last_scheduled.map(|(ts,)| ts),
            Utc::now(),
            self.tz,
            &mut rand::thread_rng(),
        );

        let mut metadata = json!({ "to_email": cleaned });
        if let Some(payload) = request_payload {
            metadata["llm_request"] = payload.clone();
        }

        self.insert_message(
            conn,
            company_id,
            contact_id,
            template,
            "scheduled",
            Some(scheduled_for),
            None,
            metadata,
        )
        .await
    }

    /// Deliver a previously queued message and record the outcome.
    /// Terminal rows are never revisited; a `Deferred`/`Disabled`
    /// outcome leaves the row exactly as it was.
    pub async fn deliver(
        &self,
        conn: &mut PgConnection,
        item: &OutreachItem,
    ) -> anyhow::Result<DeliverOutcome> {
        if !self.sending_enabled {
            tracing::debug!("sending disabled, message {} stays queued", item.id);
            return Ok(DeliverOutcome::Disabled);
        }
        if !self.is_within_send_window(Utc::now()) {
            tracing::debug!("outside the send window, message {} stays scheduled", item.id);
            return Ok(DeliverOutcome::Deferred);
        }

        let cleaned = clean_email(&item.to_email);
        if !is_valid_email(&cleaned) {
            self.mark_status(
                conn,
                item.id,
                "skipped",
                None,
                Some("invalid_email"),
                json!({ "reason": "invalid_email" }),
            )
            .await?;
            return Ok(DeliverOutcome::Skipped);
        }

        if self.is_opt_out(conn, &cleaned).await? {
            tracing::info!("contact {} is opted out", mask_email(&cleaned));
            self.mark_status(
                conn,
                item.id,
                "skipped",
                None,
                Some("opt_out"),
                json!({ "reason": "opt_out" }),
            )
            .await?;
            return Ok(DeliverOutcome::Skipped);
        }

        let result = self.send_routed(&cleaned, &item.subject, &item.body).await;
        if result.sent {
            self.mark_status(conn, item.id, "sent", Some(Utc::now()), None, result.metadata)
                .await?;
            tracing::info!("message {} sent to {}", item.id, mask_email(&cleaned));
            Ok(DeliverOutcome::Sent)
        } else {
            self.mark_status(
                conn,
                item.id,
                "failed",
                None,
                result.error.as_deref(),
                result.metadata,
            )
            .await?;
            Ok(DeliverOutcome::Failed)
        }
    }

    /// Route by MX class and push the message out, falling back to the
    /// gmail channel on a yandex spam rejection.
    pub(crate) async fn send_routed(
        &self,
        to_email: &str,
        subject: &str,
        body: &str,
    ) -> RoutedSendResult {
        let domain = to_email.rsplit('@').next().unwrap_or("");
        let mx = self.router.classify(domain).await;
        let mx_meta = json!({
            "class": mx.classification,
            "records": mx.records,
            "ttl_hit": mx.ttl_hit,
        });

        let (provider, channel, reply_to, fallback) = match mx.classification {
            MxClass::Ru if self.yandex.is_configured() => (
                "yandex",
                &self.yandex,
                Some(self.gmail.sender_header()).filter(|h| !h.is_empty()),
                false,
            ),
            MxClass::Ru => ("gmail", &self.gmail, None, true),
            MxClass::Other | MxClass::Unknown => ("gmail", &self.gmail, None, false),
        };

        let message = self.build_outbound(channel, to_email, subject, body, reply_to);
        match self.transport.send(channel, &message).await {
            Ok(()) => RoutedSendResult {
                sent: true,
                metadata: json!({
                    "message_id": message.message_id,
                    "mx": mx_meta,
                    "route": { "provider": provider, "fallback": fallback },
                }),
                error: None,
            },
            Err(err) if provider == "yandex" && err.is_spam_rejection() => {
                tracing::warn!(
                    "yandex rejected {} as spam, retrying via gmail: {err}",
                    mask_email(to_email)
                );
                let retry = self.build_outbound(&self.gmail, to_email, subject, body, None);
                match self.transport.send(&self.gmail, &retry).await {
                    Ok(()) => RoutedSendResult {
                        sent: true,
                        metadata: json!({
                            "message_id": retry.message_id,
                            "mx": mx_meta,
                            "route": {
                                "provider": "gmail",
                                "fallback": true,
                                "original_error": err.to_string(),
                            },
                        }),
                        error: None,
                    },
                    Err(retry_err) => RoutedSendResult {
                        sent: false,
                        metadata: json!({
                            "message_id": retry.message_id,
                            "mx": mx_meta,
                            "route": {
                                "provider": "gmail",
                                "fallback": true,
                                "error": retry_err.to_string(),
                                "original_error": err.to_string(),
                            },
                        }),
                        error: Some(format!("{err}; fallback: {retry_err}")),
                    },
                }
            }
            Err(err) => {
                if matches!(err, SmtpError::Auth(_)) {
                    tracing::error!("SMTP authentication failed on {provider}: {err}");
                }
                RoutedSendResult {
                    sent: false,
                    metadata: json!({
                        "message_id": message.message_id,
                        "mx": mx_meta,
                        "route": {
                            "provider": provider,
                            "fallback": fallback,
                            "error": err.to_string(),
                        },
                    }),
                    error: Some(err.to_string()),
                }
            }
        }
    }

    fn build_outbound(
        &self,
        channel: &SmtpChannelSettings,
        to_email: &str,
        subject: &str,
        body: &str,
        reply_to: Option<String>,
    ) -> OutboundEmail {
        let host = channel.host.split(':').next().unwrap_or("localhost");
        OutboundEmail {
            to: to_email.to_string(),
            subject: subject.to_string(),
            body: body.to_string(),
            from_header: channel.sender_header(),
            reply_to,
            message_id: format!("<{}@{}>", Uuid::new_v4(), host),
        }
    }

    async fn is_opt_out(&self, conn: &mut PgConnection, email: &str) -> anyhow::Result<bool> {
        let row: Option<(i32,)> = sqlx::query_as(
            "SELECT 1 FROM opt_out_registry WHERE LOWER(contact_value) = LOWER($1) LIMIT 1",
        )
        .bind(email)
        .fetch_optional(&mut *conn)
        .await?;
        Ok(row.is_some())
    }

    #[allow(clippy::too_many_arguments)]
    async fn insert_message(
        &self,
        conn: &mut PgConnection,
        company_id: Uuid,
        contact_id: Option<Uuid>,
        template: &EmailTemplate,
        status: &str,
        scheduled_for: Option<DateTime<Utc>>,
        last_error: Option<&str>,
        metadata: Value,
    ) -> anyhow::Result<Uuid> {
        let (id,): (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO outreach_messages (
                company_id, contact_id, channel, subject, body,
                status, scheduled_for, sent_at, last_error, metadata
            )
            VALUES ($1, $2, 'email', $3, $4, $5, $6, NULL, $7, $8)
            RETURNING id
            "#,
        )
        .bind(company_id)
        .bind(contact_id)
        .bind(&template.subject)
        .bind(&template.body)
        .bind(status)
        .bind(scheduled_for)
        .bind(last_error)
        .bind(&metadata)
        .fetch_one(&mut *conn)
        .await?;
        Ok(id)
    }

    /// Generic status setter for terminal bookkeeping.
    pub async fn mark_status(
        &self,
        conn: &mut PgConnection,
        outreach_id: Uuid,
        status: &str,
        sent_at: Option<DateTime<Utc>>,
        last_error: Option<&str>,
        metadata: Value,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            UPDATE outreach_messages
            SET status = $2,
                sent_at = $3,
                last_error = $4,
                metadata = metadata || $5,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(outreach_id)
        .bind(status)
        .bind(sent_at)
        .bind(last_error)
        .bind(&metadata)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use mx_router::{RoutingConfig, TestMxResolver};
    use parking_lot::Mutex;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    struct MockTransport {
        results: Mutex<Vec<Result<(), SmtpError>>>,
        sent: Mutex<Vec<(String, OutboundEmail)>>,
    }

    impl MockTransport {
        fn new(results: Vec<Result<(), SmtpError>>) -> Self {
            Self {
                results: Mutex::new(results),
                sent: Mutex::new(vec![]),
            }
        }

        fn deliveries(&self) -> Vec<(String, OutboundEmail)> {
            self.sent.lock().clone()
        }
    }

    #[async_trait]
    impl SmtpTransport for MockTransport {
        async fn send(
            &self,
            channel: &SmtpChannelSettings,
            message: &OutboundEmail,
        ) -> Result<(), SmtpError> {
            self.sent
                .lock()
                .push((channel.host.clone(), message.clone()));
            let mut results = self.results.lock();
            if results.is_empty() {
                Ok(())
            } else {
                results.remove(0)
            }
        }
    }

    fn gmail_channel() -> SmtpChannelSettings {
        SmtpChannelSettings {
            host: "smtp.gmail.com".to_string(),
            port: 587,
            use_starttls: true,
            from_header: "Gmail Sender <leadgen@example.com>".to_string(),
            ..Default::default()
        }
    }

    fn yandex_channel() -> SmtpChannelSettings {
        SmtpChannelSettings {
            host: "smtp.yandex.test".to_string(),
            port: 465,
            use_ssl: true,
            from_header: "Yandex Sender <sender@yandex.ru>".to_string(),
            ..Default::default()
        }
    }

    fn router_with_mx(records: Vec<String>) -> Arc<MxRouter> {
        let resolver = Arc::new(TestMxResolver::new(vec![Ok(records)]));
        Arc::new(MxRouter::with_resolvers(
            &RoutingConfig {
                ru_mx_patterns: vec!["yandex.net".to_string()],
                ru_mx_tlds: vec![".ru".to_string()],
                ..RoutingConfig::default()
            },
            vec![resolver],
        ))
    }

    fn router_unknown() -> Arc<MxRouter> {
        let resolver = Arc::new(TestMxResolver::new(vec![
            Err(mx_router::DnsError::ResolveFailed("t".to_string())),
            Err(mx_router::DnsError::ResolveFailed("t".to_string())),
        ]));
        Arc::new(MxRouter::with_resolvers(
            &RoutingConfig::default(),
            vec![resolver],
        ))
    }

    fn sender(
        yandex: SmtpChannelSettings,
        router: Arc<MxRouter>,
        transport: Arc<MockTransport>,
    ) -> EmailSender {
        EmailSender::new(
            chrono_tz::Europe::Moscow,
            true,
            gmail_channel(),
            yandex,
            router,
            transport,
        )
    }

    #[tokio::test]
    async fn ru_classification_routes_to_yandex_with_reply_to() {
        let transport = Arc::new(MockTransport::new(vec![Ok(())]));
        let sender = sender(
            yandex_channel(),
            router_with_mx(vec!["mx.yandex.net".to_string()]),
            transport.clone(),
        );

        let result = sender
            .send_routed("lead@yandex.ru", "Тема", "Текст")
            .await;

        assert!(result.sent);
        let deliveries = transport.deliveries();
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].0, "smtp.yandex.test");
        assert_eq!(
            deliveries[0].1.reply_to.as_deref(),
            Some("Gmail Sender <leadgen@example.com>")
        );
        assert_eq!(result.metadata["route"]["provider"], "yandex");
        assert_eq!(result.metadata["route"]["fallback"], false);
        assert_eq!(result.metadata["mx"]["class"], "RU");
    }

    #[tokio::test]
    async fn other_classification_routes_to_gmail() {
        let transport = Arc::new(MockTransport::new(vec![Ok(())]));
        let sender = sender(
            yandex_channel(),
            router_with_mx(vec!["aspmx.l.google.com".to_string()]),
            transport.clone(),
        );

        let result = sender
            .send_routed("hello@gmail.com", "Subject", "Body")
            .await;

        assert!(result.sent);
        let deliveries = transport.deliveries();
        assert_eq!(deliveries[0].0, "smtp.gmail.com");
        assert!(deliveries[0].1.reply_to.is_none());
        assert_eq!(result.metadata["route"]["provider"], "gmail");
        assert_eq!(result.metadata["route"]["fallback"], false);
    }

    #[tokio::test]
    async fn unknown_classification_defaults_to_gmail() {
        let transport = Arc::new(MockTransport::new(vec![Ok(())]));
        let sender = sender(yandex_channel(), router_unknown(), transport.clone());

        let result = sender
            .send_routed("timeout@example.com", "Subject", "Body")
            .await;

        assert!(result.sent);
        assert_eq!(result.metadata["mx"]["class"], "UNKNOWN");
        assert_eq!(result.metadata["route"]["provider"], "gmail");
    }

    #[tokio::test]
    async fn unconfigured_yandex_falls_back_to_gmail() {
        let transport = Arc::new(MockTransport::new(vec![Ok(())]));
        let sender = sender(
            SmtpChannelSettings::default(),
            router_with_mx(vec!["mx.yandex.net".to_string()]),
            transport.clone(),
        );

        let result = sender.send_routed("lead@yandex.ru", "S", "B").await;

        assert!(result.sent);
        assert_eq!(transport.deliveries()[0].0, "smtp.gmail.com");
        assert_eq!(result.metadata["route"]["provider"], "gmail");
        assert_eq!(result.metadata["route"]["fallback"], true);
    }

    #[tokio::test]
    async fn spam_rejection_retries_via_gmail() {
        let transport = Arc::new(MockTransport::new(vec![
            Err(SmtpError::Rejected(
                "550 5.7.1 Message rejected under suspicion of spam".to_string(),
            )),
            Ok(()),
        ]));
        let sender = sender(
            yandex_channel(),
            router_with_mx(vec!["mx.yandex.net".to_string()]),
            transport.clone(),
        );

        let result = sender.send_routed("lead@yandex.ru", "S", "B").await;

        assert!(result.sent);
        let deliveries = transport.deliveries();
        assert_eq!(deliveries.len(), 2);
        assert_eq!(deliveries[0].0, "smtp.yandex.test");
        assert_eq!(deliveries[1].0, "smtp.gmail.com");
        // headers rebuilt for the fallback channel
        assert_ne!(deliveries[0].1.message_id, deliveries[1].1.message_id);
        assert!(deliveries[1].1.message_id.contains("@smtp.gmail.com"));
        assert!(deliveries[1].1.reply_to.is_none());
        assert_eq!(result.metadata["route"]["provider"], "gmail");
        assert_eq!(result.metadata["route"]["fallback"], true);
        assert!(result.metadata["route"]["original_error"]
            .as_str()
            .unwrap()
            .contains("5.7.1"));
    }

    #[tokio::test]
    async fn spam_rejection_with_failing_fallback_chains_errors() {
        let transport = Arc::new(MockTransport::new(vec![
            Err(SmtpError::Rejected("554 5.7.0 suspected spam".to_string())),
            Err(SmtpError::Transport("connection reset".to_string())),
        ]));
        let sender = sender(
            yandex_channel(),
            router_with_mx(vec!["mx.yandex.net".to_string()]),
            transport.clone(),
        );

        let result = sender.send_routed("lead@yandex.ru", "S", "B").await;

        assert!(!result.sent);
        let error = result.error.unwrap();
        assert!(error.contains("5.7.0"));
        assert!(error.contains("connection reset"));
    }

    #[tokio::test]
    async fn auth_failure_does_not_fall_back() {
        let transport = Arc::new(MockTransport::new(vec![Err(SmtpError::Auth(
            "535 Auth failed".to_string(),
        ))]));
        let sender = sender(
            yandex_channel(),
            router_with_mx(vec!["mx.yandex.net".to_string()]),
            transport.clone(),
        );

        let result = sender.send_routed("lead@yandex.ru", "S", "B").await;

        assert!(!result.sent);
        assert_eq!(transport.deliveries().len(), 1);
        assert_eq!(result.metadata["route"]["provider"], "yandex");
        assert_eq!(result.metadata["route"]["fallback"], false);
        assert!(result.error.unwrap().contains("Auth failed"));
    }

    #[test]
    fn spam_signatures_are_detected() {
        for text in [
            "550 5.7.1 Message rejected under suspicion of spam",
            "suspected spam",
            "Message rejected",
        ] {
            assert!(SmtpError::Rejected(text.to_string()).is_spam_rejection());
        }
        assert!(!SmtpError::Rejected("452 mailbox full".to_string()).is_spam_rejection());
        assert!(!SmtpError::Auth("535 5.7.1 bad credentials".to_string()).is_spam_rejection());
    }

    #[test]
    fn email_masking() {
        assert_eq!(mask_email("lead@yandex.ru"), "le***@yandex.ru");
        assert_eq!(mask_email("a@b.c"), "a***@b.c");
        assert_eq!(mask_email("oops"), "***");
    }

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    #[test]
    fn schedule_lands_inside_the_window() {
        let mut rng = StdRng::seed_from_u64(7);
        let tz = chrono_tz::Europe::Moscow;

        // noon local, inside the window
        let scheduled = compute_scheduled_for(None, utc(2025, 3, 3, 9, 0), tz, &mut rng);
        let local = scheduled.with_timezone(&tz);
        assert!(local.time() >= send_window_start());
        assert!(local.time() <= send_window_end());
        // delay from the anchor stays within the configured band
        let delta = scheduled - utc(2025, 3, 3, 9, 0);
        assert!(delta >= ChronoDuration::seconds(MIN_SEND_DELAY_SECS));
        assert!(delta <= ChronoDuration::seconds(MAX_SEND_DELAY_SECS));
    }

    #[test]
    fn schedule_is_monotonic_across_queue_calls() {
        let mut rng = StdRng::seed_from_u64(13);
        let tz = chrono_tz::Europe::Moscow;
        let now = utc(2025, 3, 3, 9, 0);

        let mut last: Option<DateTime<Utc>> = None;
        for _ in 0..50 {
            let scheduled = compute_scheduled_for(last, now, tz, &mut rng);
            if let Some(previous) = last {
                assert!(scheduled > previous);
            }
            let local = scheduled.with_timezone(&tz);
            assert!(local.time() >= send_window_start());
            assert!(local.time() <= send_window_end());
            last = Some(scheduled);
        }
    }

    #[test]
    fn early_anchor_snaps_to_window_start() {
        let mut rng = StdRng::seed_from_u64(3);
        let tz = chrono_tz::Europe::Moscow;

        // 04:00 UTC = 07:00 local, before the window opens
        let scheduled = compute_scheduled_for(None, utc(2025, 3, 3, 4, 0), tz, &mut rng);
        let local = scheduled.with_timezone(&tz);
        assert_eq!(local.date_naive(), utc(2025, 3, 3, 4, 0).with_timezone(&tz).date_naive());
        assert!(local.time() >= send_window_start());
        let earliest = send_window_start();
        let latest_secs = earliest.signed_duration_since(NaiveTime::from_hms_opt(0, 0, 0).unwrap())
            + ChronoDuration::seconds(MAX_SEND_DELAY_SECS);
        assert!(local.time().signed_duration_since(NaiveTime::from_hms_opt(0, 0, 0).unwrap()) <= latest_secs);
    }

    #[test]
    fn late_anchor_rolls_to_next_morning() {
        let mut rng = StdRng::seed_from_u64(5);
        let tz = chrono_tz::Europe::Moscow;

        // 20:00 UTC = 23:00 local, past the window end
        let scheduled = compute_scheduled_for(None, utc(2025, 3, 3, 20, 0), tz, &mut rng);
        let local = scheduled.with_timezone(&tz);
        assert_eq!(
            local.date_naive(),
            utc(2025, 3, 4, 0, 0).with_timezone(&tz).date_naive()
        );
        assert!(local.time() >= send_window_start());
        assert!(local.time() <= send_window_end());
    }
}
