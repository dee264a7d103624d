//! The pipeline loop: one tick advances every stage in order, with
//! per-row failure containment so one bad entity never stalls the
//! batch.

use crate::config::Settings;
use crate::emailgen::{CompanyBrief, EmailGenerator, OfferBrief};
use crate::enrich::ContactEnricher;
use crate::ingest;
use crate::querygen::{QueryGenerator, QueryGeneratorConfig};
use crate::sender::{DeliverOutcome, EmailSender, LettreSmtpTransport, OutreachItem};
use crate::dedupe;
use crate::sheets::{GoogleSheetAdapter, SheetSyncService};
use anyhow::Context;
use chrono::Utc;
use mx_router::MxRouter;
use serde_json::json;
use sqlx::PgPool;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;
use yandex_search::{
    load_service_account_key_from_file, load_service_account_key_from_str, DeferredQueryParams,
    IamTokenProvider, SearchError, StaticTokenProvider, TokenProvider, YandexDeferredClient,
    YandexSearchConfig,
};

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub batch_size: i64,
    pub poll_interval: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            batch_size: 5,
            poll_interval: Duration::from_secs(60),
        }
    }
}

/// Yandex Cloud auth is the only piece of configuration the
/// orchestrator insists on at startup: an explicit IAM token wins,
/// then a service-account key (file or inline JSON).
pub fn build_token_provider(settings: &Settings) -> anyhow::Result<Arc<dyn TokenProvider>> {
    if let Some(token) = &settings.yandex.iam_token {
        return Ok(Arc::new(StaticTokenProvider::new(token.clone())));
    }
    if let Some(path) = &settings.yandex.sa_key_path {
        let key = load_service_account_key_from_file(Path::new(path))
            .with_context(|| format!("loading yandex service account key from {path}"))?;
        return Ok(Arc::new(IamTokenProvider::new(key)));
    }
    if let Some(raw) = &settings.yandex.sa_key_json {
        let key = load_service_account_key_from_str(raw)
            .context("parsing YANDEX_CLOUD_SA_KEY_JSON")?;
        return Ok(Arc::new(IamTokenProvider::new(key)));
    }
    anyhow::bail!(
        "yandex cloud auth is not configured: set YANDEX_CLOUD_IAM_TOKEN or a \
         service account key via YANDEX_CLOUD_SA_KEY_FILE / YANDEX_CLOUD_SA_KEY_JSON"
    )
}

fn log_stage(name: &str, outcome: anyhow::Result<usize>) -> usize {
    match outcome {
        Ok(count) => count,
        Err(err) => {
            tracing::error!("stage {name} failed: {err:#}");
            0
        }
    }
}

pub struct PipelineOrchestrator {
    pool: PgPool,
    config: OrchestratorConfig,
    deferred: YandexDeferredClient,
    enricher: ContactEnricher,
    generator: EmailGenerator,
    sender: EmailSender,
    offer: OfferBrief,
    sheet_service: Option<SheetSyncService>,
    sheet_batch_tag: Option<String>,
    sheet_interval: Duration,
    last_sheet_sync: Option<Instant>,
}

impl PipelineOrchestrator {
    pub fn new(
        settings: &Settings,
        pool: PgPool,
        config: OrchestratorConfig,
    ) -> anyhow::Result<Self> {
        let token_provider = build_token_provider(settings)?;
        let deferred = YandexDeferredClient::new(
            YandexSearchConfig {
                folder_id: settings.yandex.folder_id.clone(),
                timezone: settings.timezone,
                enforce_night_window: settings.yandex.enforce_night_window,
                ..Default::default()
            },
            token_provider,
        );

        let router = Arc::new(MxRouter::new(&settings.routing)?);
        let sender = EmailSender::new(
            settings.timezone,
            settings.email_sending_enabled,
            settings.gmail.clone(),
            settings.yandex_smtp.clone(),
            router,
            Arc::new(LettreSmtpTransport::new(Duration::from_secs(30))),
        );

        let sheet_service = if settings.sheet_sync.enabled {
            match GoogleSheetAdapter::from_settings(&settings.sheets) {
                Ok(adapter) => {
                    tracing::info!(
                        "sheet auto-sync enabled (every {:?}, batch_tag={:?})",
                        settings.sheet_sync.interval,
                        settings.sheet_sync.batch_tag
                    );
                    Some(SheetSyncService::new(
                        Box::new(adapter),
                        QueryGenerator::new(QueryGeneratorConfig::default()),
                    ))
                }
                Err(err) => {
                    tracing::error!("could not initialize sheet sync: {err:#}");
                    None
                }
            }
        } else {
            None
        };

        Ok(Self {
            pool,
            config,
            deferred,
            enricher: ContactEnricher::new(Duration::from_secs(10)),
            generator: EmailGenerator::new(settings.openai.clone()),
            sender,
            offer: OfferBrief {
                pains: vec![
                    "Расширение воронки B2B".to_string(),
                    "Высокая стоимость лида".to_string(),
                ],
                value_proposition:
                    "Автоматизируем поиск релевантных компаний и персонализируем письма в течение суток."
                        .to_string(),
                call_to_action: "Готовы обсудить 15-минутный пилот на этой неделе?".to_string(),
            },
            sheet_service,
            sheet_batch_tag: settings.sheet_sync.batch_tag.clone(),
            sheet_interval: settings.sheet_sync.interval,
            last_sheet_sync: None,
        })
    }

    pub async fn run_once(&mut self) {
        self.maybe_sync_sheet().await;
        tracing::info!("running one orchestration tick");

        let scheduled = log_stage("schedule", self.schedule_deferred_queries().await);
        let processed = log_stage("poll", self.poll_operations().await);
        if processed > 0 {
            if let Err(err) = self.run_dedupe().await {
                tracing::error!("deduplication failed: {err:#}");
            }
        }
        let enriched = log_stage("enrich", self.enrich_missing_contacts().await);
        let queued = log_stage("queue", self.generate_and_queue_emails().await);
        let delivered = log_stage("deliver", self.deliver_due_messages().await);

        tracing::info!(
            "tick complete: scheduled={scheduled}, processed={processed}, \
             enriched={enriched}, queued={queued}, delivered={delivered}"
        );
    }

    pub async fn run_forever(&mut self) {
        tracing::info!(
            "orchestrator loop started (interval {:?})",
            self.config.poll_interval
        );
        loop {
            self.run_once().await;
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    async fn maybe_sync_sheet(&mut self) {
        let Some(service) = self.sheet_service.as_mut() else {
            return;
        };
        if let Some(last) = self.last_sheet_sync {
            if last.elapsed() < self.sheet_interval {
                return;
            }
        }

        match service
            .sync(&self.pool, self.sheet_batch_tag.as_deref())
            .await
        {
            Ok(summary) => tracing::info!(
                "sheet sync: processed={}, inserted={}, duplicates={}, errors={}",
                summary.processed_rows,
                summary.inserted_queries,
                summary.duplicate_queries,
                summary.errors
            ),
            Err(err) => tracing::error!("sheet sync failed: {err:#}"),
        }
        self.last_sheet_sync = Some(Instant::now());
    }

    async fn run_dedupe(&self) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;
        let stats = dedupe::run(&mut tx).await?;
        tx.commit().await?;
        tracing::info!(
            "dedupe: {} hash updates, {} duplicates across {} groups",
            stats.hash_updates,
            stats.duplicates_marked,
            stats.primary_companies
        );
        Ok(())
    }

    /// Stage 2: submit deferred operations for due pending queries.
    /// A quiet-window violation is a soft stop, not an error.
    pub async fn schedule_deferred_queries(&self) -> anyhow::Result<usize> {
        let mut tx = self.pool.begin().await?;
        let rows: Vec<(Uuid, String, i64)> = sqlx::query_as(
            r#"
            SELECT id, query_text, region_code
            FROM serp_queries
            WHERE status = 'pending' AND scheduled_for <= NOW()
            ORDER BY scheduled_for ASC
            LIMIT $1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(self.config.batch_size)
        .fetch_all(&mut *tx)
        .await?;

        let mut scheduled = 0;
        for (query_id, query_text, region_code) in rows {
            let mut params = DeferredQueryParams::new(query_text);
            params.region = region_code;

            let operation = match self.deferred.create_deferred_search(&params).await {
                Ok(operation) => operation,
                Err(SearchError::NightWindowViolation) => {
                    tracing::info!("outside the quiet window, deferring query submission");
                    break;
                }
                Err(err) => {
                    tracing::error!("could not create deferred search for {query_id}: {err}");
                    continue;
                }
            };

            sqlx::query(
                r#"
                INSERT INTO serp_operations (query_id, operation_id, status, requested_at, metadata)
                VALUES ($1, $2, 'created', NOW(), $3)
                ON CONFLICT (operation_id) DO NOTHING
                "#,
            )
            .bind(query_id)
            .bind(&operation.id)
            .bind(json!({ "created_at": Utc::now() }))
            .execute(&mut *tx)
            .await?;

            sqlx::query("UPDATE serp_queries SET status = 'in_progress', updated_at = NOW() WHERE id = $1")
                .bind(query_id)
                .execute(&mut *tx)
                .await?;
            scheduled += 1;
        }

        tx.commit().await?;
        Ok(scheduled)
    }

    /// Stage 3: poll open operations; ingest completed payloads.
    pub async fn poll_operations(&self) -> anyhow::Result<usize> {
        let mut tx = self.pool.begin().await?;
        let rows: Vec<(Uuid, Uuid, String)> = sqlx::query_as(
            r#"
            SELECT id, query_id, operation_id
            FROM serp_operations
            WHERE status IN ('created', 'running')
            ORDER BY requested_at
            LIMIT $1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(self.config.batch_size)
        .fetch_all(&mut *tx)
        .await?;

        let mut processed = 0;
        for (row_id, query_id, operation_id) in rows {
            match self.deferred.get_operation(&operation_id).await {
                Ok(operation) if operation.done => {
                    let ingested = match operation.decode_raw_data() {
                        Ok(payload) => ingest::ingest_serp(&mut tx, &operation_id, &payload)
                            .await
                            .map(|_| ()),
                        Err(err) => Err(anyhow::anyhow!(err)),
                    };

                    match ingested {
                        Ok(()) => {
                            sqlx::query(
                                "UPDATE serp_queries SET status = 'completed', updated_at = NOW() WHERE id = $1",
                            )
                            .bind(query_id)
                            .execute(&mut *tx)
                            .await?;
                            self.finish_operation(&mut tx, row_id, "done", None).await?;
                            processed += 1;
                        }
                        Err(err) => {
                            tracing::error!("operation {operation_id} payload failed: {err:#}");
                            self.finish_operation(
                                &mut tx,
                                row_id,
                                "failed",
                                Some(format!("{err:#}")),
                            )
                            .await?;
                        }
                    }
                }
                Ok(_) => {
                    sqlx::query(
                        r#"
                        UPDATE serp_operations
                        SET status = 'running',
                            metadata = metadata || $2,
                            updated_at = NOW()
                        WHERE id = $1
                        "#,
                    )
                    .bind(row_id)
                    .bind(json!({ "last_checked": Utc::now() }))
                    .execute(&mut *tx)
                    .await?;
                }
                Err(err) => {
                    tracing::error!("polling operation {operation_id} failed: {err}");
                    self.finish_operation(&mut tx, row_id, "failed", Some(err.to_string()))
                        .await?;
                }
            }
        }

        tx.commit().await?;
        Ok(processed)
    }

    async fn finish_operation(
        &self,
        conn: &mut sqlx::PgConnection,
        row_id: Uuid,
        status: &str,
        error: Option<String>,
    ) -> anyhow::Result<()> {
        let increment: i32 = if status == "failed" { 1 } else { 0 };
        sqlx::query(
            r#"
            UPDATE serp_operations
            SET status = $2,
                completed_at = NOW(),
                retry_count = retry_count + $3,
                error_payload = $4,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(row_id)
        .bind(status)
        .bind(increment)
        .bind(error.map(|reason| json!({ "reason": reason })))
        .execute(conn)
        .await?;
        Ok(())
    }

    /// Stage 5: crawl contacts for companies that have none yet.
    pub async fn enrich_missing_contacts(&self) -> anyhow::Result<usize> {
        let mut tx = self.pool.begin().await?;
        let rows: Vec<(Uuid, String)> = sqlx::query_as(
            r#"
            SELECT c.id, COALESCE(c.website_url, 'https://' || c.canonical_domain) AS website_url
            FROM companies c
            LEFT JOIN contacts ct ON ct.company_id = c.id
            WHERE ct.id IS NULL
              AND c.status NOT IN ('duplicate', 'contacts_not_found')
              AND COALESCE(c.website_url, c.canonical_domain) IS NOT NULL
            ORDER BY c.created_at
            LIMIT $1
            FOR UPDATE OF c SKIP LOCKED
            "#,
        )
        .bind(self.config.batch_size)
        .fetch_all(&mut *tx)
        .await?;

        let mut enriched = 0;
        for (company_id, website_url) in rows {
            match self
                .enricher
                .enrich_company(&mut tx, company_id, &website_url)
                .await
            {
                Ok(contacts) if !contacts.is_empty() => enriched += 1,
                Ok(_) => {}
                Err(err) => {
                    tracing::error!("enriching company {company_id} failed: {err:#}");
                    return Err(err);
                }
            }
        }

        tx.commit().await?;
        Ok(enriched)
    }

    /// Stage 6a: generate letters and queue outreach for contacts with
    /// no active message.
    pub async fn generate_and_queue_emails(&self) -> anyhow::Result<usize> {
        let mut tx = self.pool.begin().await?;
        let rows: Vec<(
            Uuid,
            Uuid,
            String,
            String,
            Option<String>,
            Option<String>,
            Option<String>,
        )> = sqlx::query_as(
            r#"
            SELECT ct.id AS contact_id,
                   ct.company_id,
                   ct.value,
                   c.name,
                   c.canonical_domain,
                   c.industry,
                   c.attributes->>'homepage_excerpt' AS homepage_excerpt
            FROM contacts ct
            JOIN companies c ON c.id = ct.company_id
            LEFT JOIN outreach_messages om
                   ON om.contact_id = ct.id AND om.status IN ('sent', 'scheduled')
            LEFT JOIN opt_out_registry o ON LOWER(o.contact_value) = LOWER(ct.value)
            WHERE ct.contact_type = 'email'
              AND om.id IS NULL
              AND o.id IS NULL
              AND c.opt_out = FALSE
            ORDER BY ct.first_seen_at
            LIMIT $1
            "#,
        )
        .bind(self.config.batch_size)
        .fetch_all(&mut *tx)
        .await?;

        let mut queued = 0;
        for (contact_id, company_id, value, name, canonical_domain, industry, excerpt) in rows {
            let domain = canonical_domain
                .filter(|d| !d.is_empty())
                .unwrap_or_else(|| value.rsplit('@').next().unwrap_or("").to_string());
            let company = CompanyBrief {
                name,
                domain,
                industry,
                highlights: excerpt.into_iter().collect(),
            };

            let email = self.generator.generate(&company, &self.offer, None).await;
            self.sender
                .queue(
                    &mut tx,
                    company_id,
                    Some(contact_id),
                    &value,
                    &email.template,
                    email.request_payload.as_ref(),
                )
                .await?;
            queued += 1;
        }

        tx.commit().await?;
        Ok(queued)
    }

    /// Stage 6b: deliver scheduled outreach whose time has arrived.
    pub async fn deliver_due_messages(&self) -> anyhow::Result<usize> {
        let mut tx = self.pool.begin().await?;
        let rows: Vec<(Uuid, Uuid, Option<Uuid>, String, String, Option<String>)> = sqlx::query_as(
            r#"
            SELECT om.id,
                   om.company_id,
                   om.contact_id,
                   om.subject,
                   om.body,
                   COALESCE(om.metadata->>'to_email', ct.value) AS to_email
            FROM outreach_messages om
            LEFT JOIN contacts ct ON ct.id = om.contact_id
            WHERE om.status = 'scheduled' AND om.scheduled_for <= NOW()
            ORDER BY om.scheduled_for
            LIMIT $1
            FOR UPDATE OF om SKIP LOCKED
            "#,
        )
        .bind(self.config.batch_size)
        .fetch_all(&mut *tx)
        .await?;

        let mut delivered = 0;
        for (id, company_id, contact_id, subject, body, to_email) in rows {
            let Some(to_email) = to_email else {
                tracing::warn!("outreach {id} has no recipient, skipping");
                self.sender
                    .mark_status(
                        &mut tx,
                        id,
                        "skipped",
                        None,
                        Some("missing_recipient"),
                        json!({ "reason": "missing_recipient" }),
                    )
                    .await?;
                continue;
            };

            let item = OutreachItem {
                id,
                company_id,
                contact_id,
                to_email,
                subject,
                body,
            };
            match self.sender.deliver(&mut tx, &item).await? {
                DeliverOutcome::Sent => delivered += 1,
                DeliverOutcome::Disabled | DeliverOutcome::Deferred => break,
                DeliverOutcome::Skipped | DeliverOutcome::Failed => {}
            }
        }

        tx.commit().await?;
        Ok(delivered)
    }
}
