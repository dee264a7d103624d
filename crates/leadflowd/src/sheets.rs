//! Niche sheet synchronization: read rows from the spreadsheet,
//! generate and enqueue their search queries idempotently, and write
//! per-row status back.

use crate::config::SheetSettings;
use crate::querygen::{GeneratedQuery, NicheRow, QueryGenerator};
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::{PgConnection, PgPool};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

pub const STATUS_COLUMNS: &[&str] = &[
    "status",
    "generated_count",
    "db_inserted_count",
    "db_duplicate_count",
    "db_first_scheduled_for",
    "db_last_scheduled_for",
    "last_error",
];

const SHEETS_SCOPE: &str = "https://www.googleapis.com/auth/spreadsheets";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

#[derive(Debug, Clone, Default)]
pub struct SheetRowData {
    pub row_index: usize,
    pub values: HashMap<String, String>,
}

impl SheetRowData {
    pub fn get(&self, key: &str) -> String {
        self.values
            .get(&key.to_lowercase())
            .map(|v| v.trim().to_string())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone)]
pub struct SheetStatusUpdate {
    pub row_index: usize,
    pub status: String,
    pub generated_count: usize,
    pub inserted_count: usize,
    pub duplicate_count: usize,
    pub first_scheduled: Option<DateTime<Utc>>,
    pub last_scheduled: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Access seam for the spreadsheet; the daemon talks to the Google
/// REST API, tests plug in a canned adapter.
#[async_trait]
pub trait SheetAdapter: Send + Sync {
    async fn fetch_rows(&mut self) -> anyhow::Result<Vec<SheetRowData>>;
    async fn update_rows(&mut self, updates: &[SheetStatusUpdate]) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Deserialize)]
pub struct GoogleServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

#[derive(Serialize)]
struct GoogleClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Deserialize)]
struct GoogleTokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: i64,
}

#[derive(Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<String>>,
}

/// Turn the raw value grid into a header map (lowercased header →
/// 1-based column) and per-row dictionaries. Sheet row numbering
/// starts at 1, so data rows start at index 2.
fn rows_from_values(raw: Vec<Vec<String>>) -> (HashMap<String, usize>, Vec<SheetRowData>) {
    let Some((headers, data)) = raw.split_first() else {
        return (HashMap::new(), vec![]);
    };

    let header_map: HashMap<String, usize> = headers
        .iter()
        .enumerate()
        .map(|(idx, header)| (header.trim().to_lowercase(), idx + 1))
        .collect();

    let rows = data
        .iter()
        .enumerate()
        .map(|(offset, values)| SheetRowData {
            row_index: offset + 2,
            values: headers
                .iter()
                .enumerate()
                .map(|(col, header)| {
                    (
                        header.trim().to_lowercase(),
                        values.get(col).map(|v| v.trim().to_string()).unwrap_or_default(),
                    )
                })
                .collect(),
        })
        .collect();

    (header_map, rows)
}

/// 1-based column index → A1 letter ("A", "Z", "AA", ...).
fn column_letter(mut index: usize) -> String {
    let mut result = String::new();
    while index > 0 {
        let remainder = (index - 1) % 26;
        result.insert(0, (b'A' + remainder as u8) as char);
        index = (index - 1) / 26;
    }
    result
}

pub struct GoogleSheetAdapter {
    sheet_id: String,
    tab_name: String,
    key: GoogleServiceAccountKey,
    http: reqwest::Client,
    token: Option<(String, DateTime<Utc>)>,
    header_map: Option<HashMap<String, usize>>,
}

impl GoogleSheetAdapter {
    pub fn from_settings(settings: &SheetSettings) -> anyhow::Result<Self> {
        let key = if let Some(path) = &settings.sa_key_path {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading google service account key {path}"))?;
            serde_json::from_str(&raw)?
        } else if let Some(raw) = &settings.sa_key_json {
            serde_json::from_str(raw)?
        } else {
            anyhow::bail!("neither GOOGLE_SA_KEY_FILE nor GOOGLE_SA_KEY_JSON is configured");
        };

        Ok(Self {
            sheet_id: settings.sheet_id.clone(),
            tab_name: settings.tab_name.clone(),
            key,
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(15))
                .build()
                .expect("reqwest client"),
            token: None,
            header_map: None,
        })
    }

    async fn access_token(&mut self) -> anyhow::Result<String> {
        let now = Utc::now();
        if let Some((token, expires_at)) = &self.token {
            if now + Duration::from_secs(60) < *expires_at {
                return Ok(token.clone());
            }
        }

        let claims = GoogleClaims {
            iss: &self.key.client_email,
            scope: SHEETS_SCOPE,
            aud: &self.key.token_uri,
            iat: now.timestamp(),
            exp: now.timestamp() + 3600,
        };
        let encoding_key = EncodingKey::from_rsa_pem(self.key.private_key.as_bytes())
            .context("google service account private key is not valid RSA PEM")?;
        let assertion = jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &encoding_key)?;

        let response = self
            .http
            .post(&self.key.token_uri)
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", assertion.as_str()),
            ])
            .send()
            .await?
            .error_for_status()
            .context("google token exchange failed")?;

        let payload: GoogleTokenResponse = response.json().await?;
        let expires_at = now + Duration::from_secs(payload.expires_in.max(60) as u64);
        self.token = Some((payload.access_token.clone(), expires_at));
        Ok(payload.access_token)
    }
}

#[async_trait]
impl SheetAdapter for GoogleSheetAdapter {
    async fn fetch_rows(&mut self) -> anyhow::Result<Vec<SheetRowData>> {
        let token = self.access_token().await?;
        let url = format!(
            "https://sheets.googleapis.com/v4/spreadsheets/{}/values/{}",
            self.sheet_id, self.tab_name
        );
        let range: ValueRange = self
            .http
            .get(&url)
            .bearer_auth(token)
            .send()
            .await?
            .error_for_status()
            .context("fetching sheet values")?
            .json()
            .await?;

        let (header_map, rows) = rows_from_values(range.values);
        self.header_map = Some(header_map);
        Ok(rows)
    }

    async fn update_rows(&mut self, updates: &[SheetStatusUpdate]) -> anyhow::Result<()> {
        if updates.is_empty() {
            return Ok(());
        }
        let header_map = self
            .header_map
            .as_ref()
            .context("sheet headers unknown; fetch_rows must run before update_rows")?
            .clone();

        let missing: Vec<&str> = STATUS_COLUMNS
            .iter()
            .filter(|col| !header_map.contains_key(**col))
            .copied()
            .collect();
        if !missing.is_empty() {
            anyhow::bail!("sheet is missing required columns: {}", missing.join(", "));
        }

        let start_col = header_map[STATUS_COLUMNS[0]];
        let end_col = header_map[*STATUS_COLUMNS.last().expect("non-empty")];
        let data: Vec<_> = updates
            .iter()
            .map(|update| {
                let values = vec![
                    update.status.clone(),
                    update.generated_count.to_string(),
                    update.inserted_count.to_string(),
                    update.duplicate_count.to_string(),
                    update
                        .first_scheduled
                        .map(|ts| ts.to_rfc3339())
                        .unwrap_or_default(),
                    update
                        .last_scheduled
                        .map(|ts| ts.to_rfc3339())
                        .unwrap_or_default(),
                    update.last_error.clone().unwrap_or_default(),
                ];
                json!({
                    "range": format!(
                        "{}!{}{}:{}{}",
                        self.tab_name,
                        column_letter(start_col),
                        update.row_index,
                        column_letter(end_col),
                        update.row_index
                    ),
                    "values": [values],
                })
            })
            .collect();

        let token = self.access_token().await?;
        let url = format!(
            "https://sheets.googleapis.com/v4/spreadsheets/{}/values:batchUpdate",
            self.sheet_id
        );
        self.http
            .post(&url)
            .bearer_auth(token)
            .json(&json!({ "valueInputOption": "RAW", "data": data }))
            .send()
            .await?
            .error_for_status()
            .context("writing sheet status back")?;
        Ok(())
    }
}

/// Canned adapter for tests and dry runs.
#[derive(Default)]
pub struct FakeSheetAdapter {
    pub rows: Vec<SheetRowData>,
    pub updates: Vec<SheetStatusUpdate>,
}

#[async_trait]
impl SheetAdapter for FakeSheetAdapter {
    async fn fetch_rows(&mut self) -> anyhow::Result<Vec<SheetRowData>> {
        Ok(self.rows.clone())
    }

    async fn update_rows(&mut self, updates: &[SheetStatusUpdate]) -> anyhow::Result<()> {
        self.updates.extend_from_slice(updates);
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncSummary {
    pub total_rows: usize,
    pub processed_rows: usize,
    pub inserted_queries: usize,
    pub duplicate_queries: usize,
    pub errors: usize,
}

#[derive(Debug, Clone, Default)]
pub struct QueryInsertResult {
    pub attempted: usize,
    pub inserted: usize,
    pub duplicates: usize,
    pub first_scheduled: Option<DateTime<Utc>>,
    pub last_scheduled: Option<DateTime<Utc>>,
}

/// Decide whether a sheet row is actionable: it needs a niche, must
/// match the batch tag filter when one is set, and must not already be
/// marked done.
fn select_row(row: &SheetRowData, batch_tag: Option<&str>) -> Option<NicheRow> {
    let niche = row.get("niche");
    if niche.is_empty() {
        return None;
    }
    if let Some(tag) = batch_tag {
        if row.get("batch_tag") != tag {
            return None;
        }
    }
    if row.get("status").to_lowercase() == "done" {
        return None;
    }

    let optional = |key: &str| {
        let value = row.get(key);
        (!value.is_empty()).then_some(value)
    };
    Some(NicheRow {
        row_index: row.row_index,
        niche,
        city: optional("city"),
        country: optional("country"),
        batch_tag: optional("batch_tag"),
    })
}

async fn insert_queries(
    conn: &mut PgConnection,
    queries: &[GeneratedQuery],
) -> anyhow::Result<QueryInsertResult> {
    let mut result = QueryInsertResult {
        attempted: queries.len(),
        ..Default::default()
    };

    for query in queries {
        let inserted: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO serp_queries (query_text, query_hash, region_code, is_night_window, status, scheduled_for, metadata)
            VALUES ($1, $2, $3, TRUE, 'pending', $4, $5)
            ON CONFLICT (query_hash) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(&query.query_text)
        .bind(&query.query_hash)
        .bind(query.region_code)
        .bind(query.scheduled_for)
        .bind(&query.metadata)
        .fetch_optional(&mut *conn)
        .await?;

        if inserted.is_some() {
            result.inserted += 1;
            result.first_scheduled = Some(
                result
                    .first_scheduled
                    .map_or(query.scheduled_for, |ts| ts.min(query.scheduled_for)),
            );
            result.last_scheduled = Some(
                result
                    .last_scheduled
                    .map_or(query.scheduled_for, |ts| ts.max(query.scheduled_for)),
            );
        } else {
            result.duplicates += 1;
        }
    }
    Ok(result)
}

async fn log_batch(
    conn: &mut PgConnection,
    row: &NicheRow,
    result: &QueryInsertResult,
    status: &str,
    error: Option<&str>,
) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO search_batch_logs (
            niche, city, country, batch_tag,
            attempted_queries, inserted_queries, duplicate_queries,
            scheduled_start, scheduled_end,
            status, error
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        "#,
    )
    .bind(row.niche.trim())
    .bind(row.city.as_deref().map(str::trim))
    .bind(row.country.as_deref().map(str::trim))
    .bind(row.batch_tag.as_deref().map(str::trim))
    .bind(result.attempted as i32)
    .bind(result.inserted as i32)
    .bind(result.duplicates as i32)
    .bind(result.first_scheduled)
    .bind(result.last_scheduled)
    .bind(status)
    .bind(error.map(|e| e.chars().take(500).collect::<String>()))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub struct SheetSyncService {
    adapter: Box<dyn SheetAdapter>,
    generator: QueryGenerator,
}

impl SheetSyncService {
    pub fn new(adapter: Box<dyn SheetAdapter>, generator: QueryGenerator) -> Self {
        Self { adapter, generator }
    }

    /// One full pass over the sheet. Failures are contained per row:
    /// a broken row is reported back to the sheet as `error` and the
    /// rest of the batch continues.
    pub async fn sync(&mut self, pool: &PgPool, batch_tag: Option<&str>) -> anyhow::Result<SyncSummary> {
        let rows = self.adapter.fetch_rows().await?;
        let mut summary = SyncSummary {
            total_rows: rows.len(),
            ..Default::default()
        };
        let mut updates = vec![];

        for row_data in &rows {
            let Some(row) = select_row(row_data, batch_tag) else {
                continue;
            };
            summary.processed_rows += 1;

            let queries = self.generator.generate(&row);
            let outcome = self.persist_row(pool, &row, &queries).await;
            let update = match outcome {
                Ok(result) => {
                    summary.inserted_queries += result.inserted;
                    summary.duplicate_queries += result.duplicates;
                    let status = if result.attempted == 0 { "skipped" } else { "done" };
                    SheetStatusUpdate {
                        row_index: row.row_index,
                        status: status.to_string(),
                        generated_count: queries.len(),
                        inserted_count: result.inserted,
                        duplicate_count: result.duplicates,
                        first_scheduled: result.first_scheduled,
                        last_scheduled: result.last_scheduled,
                        last_error: None,
                    }
                }
                Err(err) => {
                    summary.errors += 1;
                    let message = format!("{err:#}");
                    tracing::error!("sheet row {} failed: {message}", row.row_index);
                    self.log_failure(pool, &row, &queries, &message).await;
                    SheetStatusUpdate {
                        row_index: row.row_index,
                        status: "error".to_string(),
                        generated_count: queries.len(),
                        inserted_count: 0,
                        duplicate_count: queries.len(),
                        first_scheduled: None,
                        last_scheduled: None,
                        last_error: Some(message.chars().take(500).collect()),
                    }
                }
            };
            updates.push(update);
        }

        if !updates.is_empty() {
            self.adapter.update_rows(&updates).await?;
        }
        Ok(summary)
    }

    async fn persist_row(
        &self,
        pool: &PgPool,
        row: &NicheRow,
        queries: &[GeneratedQuery],
    ) -> anyhow::Result<QueryInsertResult> {
        let mut tx = pool.begin().await?;
        let result = insert_queries(&mut tx, queries).await?;
        let status = if result.attempted == 0 { "skipped" } else { "done" };
        log_batch(&mut tx, row, &result, status, None).await?;
        tx.commit().await?;
        Ok(result)
    }

    async fn log_failure(
        &self,
        pool: &PgPool,
        row: &NicheRow,
        queries: &[GeneratedQuery],
        message: &str,
    ) {
        let result = QueryInsertResult {
            attempted: queries.len(),
            duplicates: queries.len(),
            ..Default::default()
        };
        let logged = async {
            let mut tx = pool.begin().await?;
            log_batch(&mut tx, row, &result, "error", Some(message)).await?;
            tx.commit().await?;
            anyhow::Ok(())
        }
        .await;
        if let Err(err) = logged {
            tracing::error!("could not record batch failure for row {}: {err:#}", row.row_index);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn row(values: &[(&str, &str)]) -> SheetRowData {
        SheetRowData {
            row_index: 2,
            values: values
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn rows_and_headers_from_value_grid() {
        let raw = vec![
            vec!["Niche".to_string(), "City".to_string(), "Status".to_string()],
            vec!["стоматология".to_string(), "Москва".to_string()],
            vec!["".to_string(), "Казань".to_string(), "done".to_string()],
        ];
        let (headers, rows) = rows_from_values(raw);

        assert_eq!(headers["niche"], 1);
        assert_eq!(headers["status"], 3);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].row_index, 2);
        assert_eq!(rows[0].get("niche"), "стоматология");
        assert_eq!(rows[0].get("status"), "");
        assert_eq!(rows[1].row_index, 3);
        assert_eq!(rows[1].get("status"), "done");
    }

    #[test]
    fn column_letters() {
        assert_eq!(column_letter(1), "A");
        assert_eq!(column_letter(7), "G");
        assert_eq!(column_letter(26), "Z");
        assert_eq!(column_letter(27), "AA");
        assert_eq!(column_letter(53), "BA");
    }

    #[test]
    fn row_selection_rules() {
        assert!(select_row(&row(&[("niche", "")]), None).is_none());
        assert!(select_row(&row(&[("niche", "x"), ("status", "Done")]), None).is_none());
        assert!(select_row(&row(&[("niche", "x"), ("batch_tag", "b2")]), Some("b1")).is_none());

        let selected = select_row(
            &row(&[
                ("niche", "стоматология"),
                ("city", "Москва"),
                ("batch_tag", "b1"),
            ]),
            Some("b1"),
        )
        .unwrap();
        assert_eq!(selected.niche, "стоматология");
        assert_eq!(selected.city.as_deref(), Some("Москва"));
        assert_eq!(selected.country, None);
    }

    #[tokio::test]
    async fn fake_adapter_round_trip() {
        let mut adapter = FakeSheetAdapter {
            rows: vec![row(&[("niche", "x")])],
            ..Default::default()
        };
        let rows = adapter.fetch_rows().await.unwrap();
        assert_eq!(rows.len(), 1);

        adapter
            .update_rows(&[SheetStatusUpdate {
                row_index: 2,
                status: "done".to_string(),
                generated_count: 6,
                inserted_count: 6,
                duplicate_count: 0,
                first_scheduled: None,
                last_scheduled: None,
                last_error: None,
            }])
            .await
            .unwrap();
        assert_eq!(adapter.updates.len(), 1);
        assert_eq!(adapter.updates[0].status, "done");
    }
}
