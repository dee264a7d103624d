//! Persistence of parsed SERP documents: one upsert per document into
//! `serp_results`, plus an idempotent `companies` upsert keyed by the
//! dedupe hash.

use crate::serp_xml::{parse_serp_xml, SerpDocument};
use anyhow::Context;
use normalize::build_company_dedupe_key;
use serde_json::json;
use sqlx::PgConnection;
use uuid::Uuid;

const INSERT_SERP_RESULT_SQL: &str = r#"
INSERT INTO serp_results (operation_id, url, domain, title, snippet, position, language, metadata)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
ON CONFLICT (operation_id, url)
DO UPDATE SET
    title = EXCLUDED.title,
    snippet = EXCLUDED.snippet,
    position = EXCLUDED.position,
    language = EXCLUDED.language,
    metadata = serp_results.metadata || EXCLUDED.metadata
RETURNING id
"#;

const UPSERT_COMPANY_SQL: &str = r#"
INSERT INTO companies (
    name,
    canonical_domain,
    website_url,
    status,
    dedupe_hash,
    attributes,
    source,
    first_seen_at,
    last_seen_at
)
VALUES ($1, $2, $3, 'new', $4, $5, 'yandex_search_api', NOW(), NOW())
ON CONFLICT (dedupe_hash)
DO UPDATE SET
    website_url = COALESCE(companies.website_url, EXCLUDED.website_url),
    attributes = companies.attributes || EXCLUDED.attributes,
    last_seen_at = NOW(),
    updated_at = NOW()
RETURNING id
"#;

/// Parse the XML payload of a completed operation and persist every
/// kept document. Returns the ids of the upserted `serp_results` rows.
/// Re-ingesting the same payload yields the same rows.
pub async fn ingest_serp(
    conn: &mut PgConnection,
    operation_id: &str,
    payload: &[u8],
) -> anyhow::Result<Vec<Uuid>> {
    let documents = parse_serp_xml(payload).context("parsing SERP payload")?;
    if documents.is_empty() {
        tracing::info!("operation {operation_id} produced no documents to persist");
        return Ok(vec![]);
    }

    let mut inserted = vec![];
    for document in &documents {
        let id = upsert_result(conn, operation_id, document).await?;
        inserted.push(id);
        ensure_company(conn, document).await?;
    }
    Ok(inserted)
}

async fn upsert_result(
    conn: &mut PgConnection,
    operation_id: &str,
    document: &SerpDocument,
) -> anyhow::Result<Uuid> {
    let metadata = json!({
        "language": document.language,
        "source": "yandex",
    });
    let (id,): (Uuid,) = sqlx::query_as(INSERT_SERP_RESULT_SQL)
        .bind(operation_id)
        .bind(&document.url)
        .bind(&document.domain)
        .bind(&document.title)
        .bind(&document.snippet)
        .bind(document.position)
        .bind(&document.language)
        .bind(&metadata)
        .fetch_one(&mut *conn)
        .await
        .with_context(|| format!("upserting serp result {}", document.url))?;
    Ok(id)
}

async fn ensure_company(conn: &mut PgConnection, document: &SerpDocument) -> anyhow::Result<()> {
    let dedupe_hash = build_company_dedupe_key(&document.title, &document.domain);
    let name = if document.title.is_empty() {
        &document.domain
    } else {
        &document.title
    };
    let domain = (!document.domain.is_empty()).then_some(document.domain.as_str());
    let attributes = json!({
        "source": "yandex_serp",
        "last_snippet": document.snippet,
    });

    sqlx::query(UPSERT_COMPANY_SQL)
        .bind(name)
        .bind(domain)
        .bind(&document.url)
        .bind(&dedupe_hash)
        .bind(&attributes)
        .execute(&mut *conn)
        .await
        .with_context(|| format!("upserting company for {}", document.domain))?;
    Ok(())
}
