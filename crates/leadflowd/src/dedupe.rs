//! Company deduplication: refresh the dedupe hashes, then resolve each
//! hash group down to a single primary row.

use chrono::{DateTime, Utc};
use normalize::{build_company_dedupe_key, normalize_domain};
use sqlx::PgConnection;
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DedupeStats {
    pub hash_updates: usize,
    pub duplicates_marked: usize,
    pub primary_companies: usize,
    pub updated_records: usize,
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct HashSourceRow {
    id: Uuid,
    name: String,
    canonical_domain: Option<String>,
    website_url: Option<String>,
    dedupe_hash: Option<String>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct GroupRow {
    pub id: Uuid,
    pub dedupe_hash: String,
    pub created_at: DateTime<Utc>,
}

/// Run both phases inside the caller's transaction.
pub async fn run(conn: &mut PgConnection) -> anyhow::Result<DedupeStats> {
    let mut stats = DedupeStats::default();
    stats.hash_updates = refresh_dedupe_hashes(conn).await?;

    let rows: Vec<GroupRow> = sqlx::query_as(
        r#"
        SELECT id, dedupe_hash, created_at
        FROM companies
        WHERE dedupe_hash IS NOT NULL AND dedupe_hash <> ''
        "#,
    )
    .fetch_all(&mut *conn)
    .await?;

    let (primary_ids, duplicate_ids) = resolve_groups(rows);
    stats.primary_companies = primary_ids.len();
    stats.duplicates_marked = duplicate_ids.len();

    for duplicate_id in &duplicate_ids {
        let result = sqlx::query(
            r#"
            UPDATE companies
            SET status = 'duplicate',
                opt_out = TRUE,
                updated_at = NOW()
            WHERE id = $1 AND status <> 'duplicate'
            "#,
        )
        .bind(duplicate_id)
        .execute(&mut *conn)
        .await?;
        stats.updated_records += result.rows_affected() as usize;
    }

    // primaries demoted in an earlier pass come back as fresh rows
    for primary_id in &primary_ids {
        sqlx::query(
            r#"
            UPDATE companies
            SET status = CASE WHEN status = 'duplicate' THEN 'new' ELSE status END,
                opt_out = FALSE,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(primary_id)
        .execute(&mut *conn)
        .await?;
    }

    if stats.duplicates_marked > 0 {
        tracing::info!(
            "deduplication marked {} duplicates across {} groups",
            stats.duplicates_marked,
            stats.primary_companies
        );
    }
    Ok(stats)
}

async fn refresh_dedupe_hashes(conn: &mut PgConnection) -> anyhow::Result<usize> {
    let rows: Vec<HashSourceRow> = sqlx::query_as(
        r#"
        SELECT id, name, canonical_domain, website_url, dedupe_hash
        FROM companies
        "#,
    )
    .fetch_all(&mut *conn)
    .await?;

    let mut updates = 0;
    for row in rows {
        let domain_source = row
            .canonical_domain
            .as_deref()
            .filter(|v| !v.is_empty())
            .or(row.website_url.as_deref().filter(|v| !v.is_empty()))
            .unwrap_or(&row.name);
        let dedupe_hash = build_company_dedupe_key(&row.name, domain_source);
        if dedupe_hash != row.dedupe_hash.unwrap_or_default() {
            sqlx::query(
                r#"
                UPDATE companies
                SET dedupe_hash = $2,
                    canonical_domain = $3,
                    updated_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(row.id)
            .bind(&dedupe_hash)
            .bind(normalize_domain(domain_source))
            .execute(&mut *conn)
            .await?;
            updates += 1;
        }
    }

    if updates > 0 {
        tracing::info!("refreshed {updates} dedupe hashes");
    }
    Ok(updates)
}

/// Pick the primary of every hash group: oldest row wins, id as the
/// tie breaker. Everything else in the group is a duplicate.
pub(crate) fn resolve_groups(rows: Vec<GroupRow>) -> (Vec<Uuid>, Vec<Uuid>) {
    let mut groups: HashMap<String, Vec<GroupRow>> = HashMap::new();
    for row in rows {
        let hash = row.dedupe_hash.trim().to_string();
        if hash.is_empty() {
            continue;
        }
        groups.entry(hash).or_default().push(row);
    }

    let mut primary_ids = vec![];
    let mut duplicate_ids = vec![];
    for (_, mut members) in groups {
        members.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
        let mut members = members.into_iter();
        if let Some(primary) = members.next() {
            primary_ids.push(primary.id);
        }
        duplicate_ids.extend(members.map(|row| row.id));
    }

    (primary_ids, duplicate_ids)
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::TimeZone;

    fn group_row(id: u128, hash: &str, minute: u32) -> GroupRow {
        GroupRow {
            id: Uuid::from_u128(id),
            dedupe_hash: hash.to_string(),
            created_at: Utc.with_ymd_and_hms(2025, 1, 1, 10, minute, 0).unwrap(),
        }
    }

    #[test]
    fn oldest_row_becomes_primary() {
        let rows = vec![
            group_row(2, "h1", 5),
            group_row(1, "h1", 1),
            group_row(3, "h1", 9),
        ];
        let (primaries, duplicates) = resolve_groups(rows);
        assert_eq!(primaries, vec![Uuid::from_u128(1)]);
        assert_eq!(duplicates, vec![Uuid::from_u128(2), Uuid::from_u128(3)]);
    }

    #[test]
    fn id_breaks_created_at_ties() {
        let rows = vec![group_row(9, "h1", 0), group_row(4, "h1", 0)];
        let (primaries, duplicates) = resolve_groups(rows);
        assert_eq!(primaries, vec![Uuid::from_u128(4)]);
        assert_eq!(duplicates, vec![Uuid::from_u128(9)]);
    }

    #[test]
    fn singleton_groups_have_no_duplicates() {
        let rows = vec![group_row(1, "h1", 0), group_row(2, "h2", 0)];
        let (primaries, duplicates) = resolve_groups(rows);
        assert_eq!(primaries.len(), 2);
        assert!(duplicates.is_empty());
    }

    #[test]
    fn blank_hashes_are_ignored() {
        let rows = vec![group_row(1, "  ", 0)];
        let (primaries, duplicates) = resolve_groups(rows);
        assert!(primaries.is_empty());
        assert!(duplicates.is_empty());
    }
}
