//! Contact enrichment: crawl a company's likely contact pages, pull
//! out the first usable email (plus any phones along the way) and
//! stash a homepage text excerpt for the email generator.

use anyhow::Context;
use normalize::{clean_email, clean_snippet, is_valid_email, normalize_url};
use regex::Regex;
use scraper::{Html, Selector};
use serde_json::json;
use sqlx::PgConnection;
use std::collections::HashSet;
use std::sync::LazyLock;
use std::time::Duration;
use url::Url;
use uuid::Uuid;

pub const HOMEPAGE_EXCERPT_LIMIT: usize = 40_000;

const USER_AGENT: &str = "LeadFlowBot/1.0 (+https://example.com/bot-info)";

const CANDIDATE_SUFFIXES: &[&str] = &["/", "/contact", "/contacts", "/about", "/about-us", "/kontakty"];

static EMAIL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)[A-Z0-9._%+-]+@[A-Z0-9.-]+\.[A-Z]{2,}").unwrap());

static PHONE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\+?\d[\d\s().-]{7,}").unwrap());

static ANCHOR_SELECTOR: LazyLock<Selector> = LazyLock::new(|| Selector::parse("a").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContactType {
    Email,
    Phone,
}

impl ContactType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContactType::Email => "email",
            ContactType::Phone => "phone",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ContactRecord {
    pub contact_type: ContactType,
    pub value: String,
    pub source_url: String,
    pub quality_score: f64,
    pub label: Option<String>,
}

impl ContactRecord {
    /// Key used to collapse the same contact discovered through
    /// different channels (anchor vs. body text).
    fn normalized_key(&self) -> String {
        match self.contact_type {
            ContactType::Email => format!("email:{}", self.value.to_lowercase()),
            ContactType::Phone => {
                let digits: String = self
                    .value
                    .chars()
                    .filter(|c| c.is_ascii_digit() || *c == '+')
                    .collect();
                format!("phone:{digits}")
            }
        }
    }
}

/// Candidate pages in fetch order, deduplicated: the site root first,
/// then the usual contact/about paths.
pub fn candidate_urls(base_url: &str) -> Vec<String> {
    let Ok(base) = Url::parse(base_url) else {
        return vec![];
    };

    let mut seen = HashSet::new();
    let mut candidates = vec![];
    for suffix in CANDIDATE_SUFFIXES {
        if let Ok(joined) = base.join(suffix) {
            let url = joined.to_string();
            if seen.insert(url.clone()) {
                candidates.push(url);
            }
        }
    }
    candidates
}

/// Pull contacts from one page. `mailto:`/`tel:` anchors rank above
/// plain text matches; invalid emails are dropped here so the caller
/// never has to look at them.
pub fn extract_contacts(html: &str, source_url: &str) -> Vec<ContactRecord> {
    let document = Html::parse_document(html);
    let mut seen = HashSet::new();
    let mut found = vec![];

    let mut push = |record: ContactRecord, seen: &mut HashSet<String>| {
        if seen.insert(record.normalized_key()) {
            found.push(record);
        }
    };

    for anchor in document.select(&ANCHOR_SELECTOR) {
        let href = anchor.value().attr("href").unwrap_or("").trim();
        let label = clean_snippet(&anchor.text().collect::<Vec<_>>().join(" "));
        let lowered = href.to_lowercase();

        if lowered.starts_with("mailto:") {
            let email = clean_email(href);
            if is_valid_email(&email) {
                push(
                    ContactRecord {
                        contact_type: ContactType::Email,
                        value: email,
                        source_url: source_url.to_string(),
                        quality_score: 1.0,
                        label: Some(if label.is_empty() { "mailto".to_string() } else { label }),
                    },
                    &mut seen,
                );
            }
        } else if lowered.starts_with("tel:") {
            let phone = href
                .splitn(2, ':')
                .nth(1)
                .unwrap_or("")
                .split('?')
                .next()
                .unwrap_or("")
                .trim()
                .to_string();
            if !phone.is_empty() {
                push(
                    ContactRecord {
                        contact_type: ContactType::Phone,
                        value: phone,
                        source_url: source_url.to_string(),
                        quality_score: 0.9,
                        label: Some(if label.is_empty() { "tel".to_string() } else { label }),
                    },
                    &mut seen,
                );
            }
        }
    }

    let text_blob = page_text(&document);
    for capture in EMAIL_RE.find_iter(&text_blob) {
        let email = clean_email(capture.as_str());
        if is_valid_email(&email) {
            push(
                ContactRecord {
                    contact_type: ContactType::Email,
                    value: email,
                    source_url: source_url.to_string(),
                    quality_score: 0.8,
                    label: Some("text".to_string()),
                },
                &mut seen,
            );
        }
    }
    for capture in PHONE_RE.find_iter(&text_blob) {
        push(
            ContactRecord {
                contact_type: ContactType::Phone,
                value: capture.as_str().trim().to_string(),
                source_url: source_url.to_string(),
                quality_score: 0.6,
                label: Some("text".to_string()),
            },
            &mut seen,
        );
    }

    found
}

/// Full-page text with ASCII control characters removed, capped at
/// [`HOMEPAGE_EXCERPT_LIMIT`] characters.
pub fn homepage_excerpt(html: &str) -> String {
    let document = Html::parse_document(html);
    let text = page_text(&document);
    text.chars()
        .filter(|c| !c.is_ascii_control())
        .take(HOMEPAGE_EXCERPT_LIMIT)
        .collect()
}

fn page_text(document: &Html) -> String {
    clean_snippet(&document.root_element().text().collect::<Vec<_>>().join(" "))
}

const UPSERT_CONTACT_SQL: &str = r#"
INSERT INTO contacts (company_id, contact_type, value, source_url, is_primary, quality_score, metadata)
VALUES ($1, $2, $3, $4, $5, $6, $7)
ON CONFLICT (contact_type, value)
DO UPDATE SET
    company_id = EXCLUDED.company_id,
    source_url = COALESCE(EXCLUDED.source_url, contacts.source_url),
    quality_score = GREATEST(contacts.quality_score, EXCLUDED.quality_score),
    last_seen_at = NOW(),
    metadata = contacts.metadata || EXCLUDED.metadata
RETURNING id
"#;

pub struct ContactEnricher {
    http: reqwest::Client,
}

impl ContactEnricher {
    pub fn new(timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .expect("reqwest client");
        Self { http }
    }

    /// Walk the candidate pages, persist what was found and move the
    /// company to `contacts_ready` / `contacts_not_found`. Returns the
    /// contact row ids.
    pub async fn enrich_company(
        &self,
        conn: &mut PgConnection,
        company_id: Uuid,
        website_url: &str,
    ) -> anyhow::Result<Vec<Uuid>> {
        if website_url.trim().is_empty() {
            tracing::warn!("company {company_id} has no URL to enrich");
            return Ok(vec![]);
        }

        let base = normalize_url(website_url);
        let candidates = candidate_urls(&base);

        let mut collected: Vec<ContactRecord> = vec![];
        let mut keys = HashSet::new();
        let mut excerpt: Option<String> = None;

        for (index, candidate) in candidates.iter().enumerate() {
            let Some(html) = self.fetch_html(candidate).await else {
                continue;
            };

            if index == 0 {
                excerpt = Some(homepage_excerpt(&html));
            }

            for record in extract_contacts(&html, candidate) {
                if keys.insert(record.normalized_key()) {
                    collected.push(record);
                }
            }

            if collected
                .iter()
                .any(|r| r.contact_type == ContactType::Email)
            {
                break;
            }
        }

        if let Some(excerpt) = excerpt.filter(|e| !e.is_empty()) {
            sqlx::query(
                r#"
                UPDATE companies
                SET attributes = attributes || $2,
                    updated_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(company_id)
            .bind(json!({ "homepage_excerpt": excerpt }))
            .execute(&mut *conn)
            .await
            .context("storing homepage excerpt")?;
        }

        let has_email = collected
            .iter()
            .any(|r| r.contact_type == ContactType::Email);

        let mut inserted = vec![];
        let mut primary_assigned: HashSet<ContactType> = HashSet::new();
        for record in &collected {
            let is_primary = primary_assigned.insert(record.contact_type);
            let value = clean_snippet(&record.value.replace('\u{a0}', " "));
            let metadata = json!({
                "label": record.label,
                "source_type": record.contact_type.as_str(),
            });

            let (id,): (Uuid,) = sqlx::query_as(UPSERT_CONTACT_SQL)
                .bind(company_id)
                .bind(record.contact_type.as_str())
                .bind(&value)
                .bind(&record.source_url)
                .bind(is_primary)
                .bind(record.quality_score)
                .bind(&metadata)
                .fetch_one(&mut *conn)
                .await
                .with_context(|| format!("upserting contact for company {company_id}"))?;
            inserted.push(id);
        }

        let status = if has_email {
            "contacts_ready"
        } else {
            tracing::info!("no contacts found for company {company_id}");
            "contacts_not_found"
        };
        sqlx::query("UPDATE companies SET status = $2, updated_at = NOW() WHERE id = $1")
            .bind(company_id)
            .bind(status)
            .execute(&mut *conn)
            .await?;

        Ok(inserted)
    }

    async fn fetch_html(&self, url: &str) -> Option<String> {
        match self.http.get(url).send().await {
            Ok(response) => {
                let status = response.status();
                if status.as_u16() >= 400 {
                    tracing::debug!("page {url} answered {status}");
                    return None;
                }
                response.text().await.ok()
            }
            Err(err) => {
                tracing::debug!("failed to fetch {url}: {err}");
                None
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn candidates_keep_order_and_dedupe() {
        let candidates = candidate_urls("https://example.com/");
        assert_eq!(
            candidates,
            vec![
                "https://example.com/",
                "https://example.com/contact",
                "https://example.com/contacts",
                "https://example.com/about",
                "https://example.com/about-us",
                "https://example.com/kontakty",
            ]
        );
    }

    #[test]
    fn anchors_outrank_text_matches() {
        let html = r#"
            <html><body>
              <a href="mailto:Sales@Example.com?subject=hi">Написать нам</a>
              <a href="tel:+7 (495) 123-45-67">Позвонить</a>
              <p>Пишите на sales@example.com или info@example.com</p>
            </body></html>
        "#;
        let contacts = extract_contacts(html, "https://example.com/contact");

        let sales: Vec<_> = contacts
            .iter()
            .filter(|c| c.value == "sales@example.com")
            .collect();
        assert_eq!(sales.len(), 1);
        assert_eq!(sales[0].quality_score, 1.0);
        assert_eq!(sales[0].label.as_deref(), Some("Написать нам"));

        let info = contacts
            .iter()
            .find(|c| c.value == "info@example.com")
            .unwrap();
        assert_eq!(info.quality_score, 0.8);

        let phone = contacts
            .iter()
            .find(|c| c.contact_type == ContactType::Phone)
            .unwrap();
        assert_eq!(phone.quality_score, 0.9);
        assert_eq!(phone.value, "+7 (495) 123-45-67");
    }

    #[test]
    fn invalid_emails_never_surface() {
        let html = r#"<a href="mailto:not-an-email">x</a><p>also@nothing</p>"#;
        let contacts = extract_contacts(html, "https://example.com/");
        assert!(contacts
            .iter()
            .all(|c| c.contact_type != ContactType::Email));
    }

    #[test]
    fn excerpt_strips_controls_and_truncates() {
        let mut body = String::from("<html><body><p>Добрый\x07 день</p>");
        body.push_str(&"<p>слово </p>".repeat(20_000));
        body.push_str("</body></html>");

        let excerpt = homepage_excerpt(&body);
        assert!(excerpt.starts_with("Добрый день"));
        assert!(!excerpt.contains('\x07'));
        assert!(excerpt.chars().count() <= HOMEPAGE_EXCERPT_LIMIT);
    }
}
