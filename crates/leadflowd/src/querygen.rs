//! Expansion of a niche row into scheduled search queries.
//!
//! One base query plus trigger-phrase variants, each hashed for
//! idempotent insertion and scheduled inside the nightly quiet window
//! with fixed spacing.

use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde_json::json;
use sha1::{Digest, Sha1};
use std::collections::HashMap;
use std::sync::LazyLock;

/// city/country (lowercased) → Yandex `lr` region code
static REGIONS_LR: LazyLock<HashMap<&'static str, i64>> = LazyLock::new(|| {
    HashMap::from([
        ("россия", 225),
        ("москва и московская область", 1),
        ("москва", 213),
        ("санкт‑петербург", 2),
        ("saint petersburg", 2),
        ("архангельск", 20),
        ("nazran", 1092),
        ("назрань", 1092),
        ("астрахань", 37),
        ("nalchik", 30),
        ("нальчик", 30),
        ("barnaul", 197),
        ("барнаул", 197),
        ("нижний новгород", 47),
        ("belgorod", 4),
        ("белгород", 4),
        ("новосибирск", 65),
        ("blagoveshchensk", 77),
        ("благовещенск", 77),
        ("омск", 66),
        ("bryansk", 191),
        ("брянск", 191),
        ("орёл", 10),
        ("орел", 10),
        ("veliky novgorod", 24),
        ("великий новгород", 24),
        ("оренбург", 48),
        ("владивосток", 75),
        ("penza", 49),
        ("пенза", 49),
        ("владикавказ", 33),
        ("perm", 50),
        ("пермь", 50),
        ("vladimir", 192),
        ("владимир", 192),
        ("псков", 25),
        ("волгоград", 38),
        ("rostov-on-don", 39),
        ("ростов-на-дону", 39),
        ("вологда", 21),
        ("ryazan", 11),
        ("рязань", 11),
        ("voronezh", 193),
        ("воронеж", 193),
        ("samara", 51),
        ("самара", 51),
        ("grozny", 1106),
        ("грозный", 1106),
        ("yekaterinburg", 54),
        ("екатеринбург", 54),
        ("saransk", 42),
        ("саранск", 42),
        ("ivanovo", 5),
        ("иваново", 5),
        ("smolensk", 12),
        ("смоленск", 12),
        ("irkutsk", 63),
        ("irkutsk oblast", 63),
        ("irkutskaya oblast", 63),
        ("иркутск", 63),
        ("сочи", 239),
        ("yoshkar-ola", 41),
        ("йошкар-ола", 41),
        ("stavropol", 36),
        ("ставрополь", 36),
        ("kazan", 43),
        ("казань", 43),
        ("surgut", 973),
        ("сургут", 973),
        ("kaliningrad", 22),
        ("калининград", 22),
        ("tambov", 13),
        ("тамбов", 13),
        ("kemerovo", 64),
        ("кемерово", 64),
        ("tver", 14),
        ("тверь", 14),
        ("kostroma", 7),
        ("кострома", 7),
        ("tomsk", 67),
        ("томск", 67),
        ("krasnodar", 35),
        ("краснодар", 35),
        ("tula", 15),
        ("тула", 15),
        ("krasnoyarsk", 62),
        ("красноярск", 62),
        ("ulyanovsk", 195),
        ("ульяновск", 195),
        ("kurgan", 53),
        ("курган", 53),
        ("ufa", 172),
        ("уфа", 172),
        ("kursk", 8),
        ("курск", 8),
        ("khabarovsk", 76),
        ("хабаровск", 76),
        ("lipetsk", 9),
        ("липецк", 9),
        ("cheboksary", 45),
        ("чебоксары", 45),
        ("makhachkala", 28),
        ("махачкала", 28),
        ("chelyabinsk", 56),
        ("челябинск", 56),
        ("cherkessk", 1104),
        ("черкесск", 1104),
        ("yaroslavl", 16),
        ("ярославль", 16),
        ("murmansk", 23),
        ("мурманск", 23),
    ])
});

const DEFAULT_TRIGGERS: &[&str] = &[
    "\"оставить заявку\"",
    "\"онлайн запись\"",
    "\"рассчитать стоимость\"",
    "\"коммерческое предложение\"",
    "\"бриф\"",
];

const DEFAULT_NEG_SITES: &[&str] = &[
    "domain:avito.ru",
    "yandex.ru",
    "2gis.ru",
    "hh.ru",
    "flamp.ru",
    "otzovik.com",
    "irecommend.ru",
    "youtube.com",
    "profi.ru",
    "yell.ru",
    "workspace.ru",
    "vuzopedia.ru",
    "orgpage.ru",
    "rating-gamedev.ru",
    "ru.wadline.com",
    "vk.com",
    "reddit.com",
    "pikabu.ru",
];

#[derive(Debug, Clone)]
pub struct NightWindow {
    pub start_local: NaiveTime,
    pub end_local: NaiveTime,
    pub timezone: Tz,
}

impl Default for NightWindow {
    fn default() -> Self {
        Self {
            start_local: NaiveTime::from_hms_opt(0, 0, 0).expect("valid time"),
            end_local: NaiveTime::from_hms_opt(7, 59, 0).expect("valid time"),
            timezone: chrono_tz::Europe::Moscow,
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueryGeneratorConfig {
    pub language: String,
    pub night_window: NightWindow,
    pub spacing_seconds: i64,
    pub region_fallback_lr: i64,
    pub max_queries_per_niche: usize,
    pub triggers: Vec<String>,
    pub neg_sites: Vec<String>,
}

impl Default for QueryGeneratorConfig {
    fn default() -> Self {
        Self {
            language: "ru".to_string(),
            night_window: NightWindow::default(),
            spacing_seconds: 45,
            region_fallback_lr: 225,
            max_queries_per_niche: 6,
            triggers: DEFAULT_TRIGGERS.iter().map(|s| s.to_string()).collect(),
            neg_sites: DEFAULT_NEG_SITES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// One input row from the niches sheet.
#[derive(Debug, Clone)]
pub struct NicheRow {
    pub row_index: usize,
    pub niche: String,
    pub city: Option<String>,
    pub country: Option<String>,
    pub batch_tag: Option<String>,
}

#[derive(Debug, Clone)]
pub struct GeneratedQuery {
    pub query_text: String,
    pub query_hash: String,
    pub region_code: i64,
    pub scheduled_for: DateTime<Utc>,
    pub trigger: Option<String>,
    pub metadata: serde_json::Value,
}

pub struct QueryGenerator {
    config: QueryGeneratorConfig,
}

impl QueryGenerator {
    pub fn new(config: QueryGeneratorConfig) -> Self {
        Self { config }
    }

    pub fn generate(&self, row: &NicheRow) -> Vec<GeneratedQuery> {
        self.generate_at(row, Utc::now())
    }

    /// Stable hash over the whitespace-normalized query text and the
    /// region, so the same logical query never enqueues twice.
    pub fn query_hash(query_text: &str, region_code: i64) -> String {
        let mut hasher = Sha1::new();
        hasher.update(format!("{query_text}|{region_code}").as_bytes());
        hasher
            .finalize()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect()
    }

    pub fn generate_at(&self, row: &NicheRow, now: DateTime<Utc>) -> Vec<GeneratedQuery> {
        let texts = self.build_query_texts(row);
        let (window_start, window_end) = self.next_window(now);

        let region_code = self.resolve_region(row.city.as_deref(), row.country.as_deref());
        let metadata_base = json!({
            "niche": row.niche.trim(),
            "city": row.city.as_deref().map(str::trim),
            "country": row.country.as_deref().map(str::trim),
            "batch_tag": row.batch_tag.as_deref().map(str::trim),
            "language": self.config.language,
            "selection": "balanced",
        });

        let mut result = vec![];
        for (index, (query_text, trigger)) in texts.into_iter().enumerate() {
            let scheduled =
                window_start + ChronoDuration::seconds(self.config.spacing_seconds * index as i64);
            if scheduled > window_end {
                break;
            }

            let cleaned = query_text.split_whitespace().collect::<Vec<_>>().join(" ");
            let query_hash = Self::query_hash(&cleaned, region_code);
            let mut metadata = metadata_base.clone();
            metadata["trigger"] = json!(trigger);

            result.push(GeneratedQuery {
                query_text: cleaned,
                query_hash,
                region_code,
                scheduled_for: scheduled,
                trigger,
                metadata,
            });
        }
        result
    }

    fn resolve_region(&self, city: Option<&str>, country: Option<&str>) -> i64 {
        for key in [city, country].into_iter().flatten() {
            let normalized = key.trim().to_lowercase();
            if normalized.is_empty() {
                continue;
            }
            if let Some(&code) = REGIONS_LR.get(normalized.as_str()) {
                return code;
            }
        }
        self.config.region_fallback_lr
    }

    fn negatives(&self) -> String {
        let mut tokens = vec![];
        for entry in &self.config.neg_sites {
            let raw = entry.trim();
            if raw.is_empty() {
                continue;
            }
            if let Some((prefix, value)) = raw.split_once(':') {
                let prefix = prefix.trim().to_lowercase();
                let value = value.trim();
                if matches!(prefix.as_str(), "site" | "domain" | "host") && !value.is_empty() {
                    tokens.push(format!("-{prefix}:{value}"));
                    continue;
                }
            }
            tokens.push(format!("-site:{raw}"));
        }
        tokens.join(" ")
    }

    fn build_query_texts(&self, row: &NicheRow) -> Vec<(String, Option<String>)> {
        let mut base_tokens = vec![format!("lang:{}", self.config.language), row.niche.trim().to_string()];
        let place = row
            .city
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .or_else(|| row.country.as_deref().map(str::trim).filter(|v| !v.is_empty()));
        if let Some(place) = place {
            base_tokens.push(place.to_string());
        }

        let negatives = self.negatives();
        let render = |tokens: &[String]| {
            let mut text = tokens.join(" ");
            if !negatives.is_empty() {
                text.push(' ');
                text.push_str(&negatives);
            }
            text
        };

        let mut queries = vec![(render(&base_tokens), None)];
        let available = self
            .config
            .triggers
            .iter()
            .take(self.config.max_queries_per_niche.saturating_sub(1));
        for trigger in available {
            let mut tokens = base_tokens.clone();
            tokens.push(trigger.clone());
            queries.push((render(&tokens), Some(trigger.clone())));
            if queries.len() >= self.config.max_queries_per_niche {
                break;
            }
        }
        queries
    }

    fn window_bounds(&self, date: NaiveDate) -> (DateTime<Utc>, ChronoDuration) {
        let window = &self.config.night_window;
        let start_naive = date.and_time(window.start_local);
        let mut end_naive = date.and_time(window.end_local);
        if window.end_local <= window.start_local {
            end_naive += ChronoDuration::days(1);
        }
        let start_local = local_datetime(window.timezone, start_naive);
        let end_local = local_datetime(window.timezone, end_naive);
        (start_local.with_timezone(&Utc), end_local - start_local)
    }

    /// First admissible start inside the nightly window: now when the
    /// window is currently open, otherwise the next window opening.
    fn next_window(&self, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        let window = &self.config.night_window;
        let today = now.with_timezone(&window.timezone).date_naive();
        let (start_today, duration) = self.window_bounds(today);

        // A window spanning midnight may have opened yesterday.
        if window.end_local <= window.start_local && now < start_today {
            let start_prev = start_today - ChronoDuration::days(1);
            let end_prev = start_prev + duration;
            if start_prev <= now && now <= end_prev {
                return (now, end_prev);
            }
        }

        let end_today = start_today + duration;
        if start_today <= now && now <= end_today {
            return (now, end_today);
        }
        if now < start_today {
            return (start_today, end_today);
        }

        let start_next = start_today + ChronoDuration::days(1);
        (start_next, start_next + duration)
    }
}

fn local_datetime(tz: Tz, naive: chrono::NaiveDateTime) -> DateTime<Tz> {
    tz.from_local_datetime(&naive)
        .earliest()
        .unwrap_or_else(|| tz.from_utc_datetime(&naive))
}

#[cfg(test)]
mod test {
    use super::*;

    fn row(niche: &str, city: Option<&str>, country: Option<&str>) -> NicheRow {
        NicheRow {
            row_index: 2,
            niche: niche.to_string(),
            city: city.map(str::to_string),
            country: country.map(str::to_string),
            batch_tag: Some("batch-1".to_string()),
        }
    }

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    #[test]
    fn builds_base_query_plus_triggers() {
        let generator = QueryGenerator::new(QueryGeneratorConfig::default());
        let queries = generator.generate_at(
            &row("стоматология", Some("Москва"), Some("Россия")),
            utc(2025, 1, 1, 12, 0),
        );

        assert_eq!(queries.len(), 6);

        let first = &queries[0];
        assert!(first.query_text.starts_with("lang:ru стоматология Москва"));
        assert!(first.query_text.contains("-domain:avito.ru"));
        assert!(first.query_text.contains("-site:yandex.ru"));
        assert!(first.trigger.is_none());
        assert_eq!(first.region_code, 213);
        assert_eq!(first.metadata["trigger"], serde_json::Value::Null);
        // noon UTC is past the Moscow window; first slot is the next
        // midnight in Moscow, i.e. 21:00 UTC
        assert_eq!(first.scheduled_for, utc(2025, 1, 1, 21, 0));

        let second = &queries[1];
        assert!(second.query_text.contains("\"оставить заявку\""));
        assert_eq!(second.trigger.as_deref(), Some("\"оставить заявку\""));
        assert_eq!(second.scheduled_for, utc(2025, 1, 1, 21, 0) + ChronoDuration::seconds(45));
    }

    #[test]
    fn unknown_city_falls_back_to_country_then_default() {
        let generator = QueryGenerator::new(QueryGeneratorConfig::default());

        let queries = generator.generate_at(
            &row("грузоперевозки", Some("Неизвестный город"), Some("Россия")),
            utc(2025, 1, 2, 3, 0),
        );
        assert_eq!(queries[0].region_code, 225);

        let queries = generator.generate_at(
            &row("грузоперевозки", Some("Неизвестный город"), Some("Казахстан")),
            utc(2025, 1, 2, 3, 0),
        );
        assert_eq!(queries[0].region_code, 225);
    }

    #[test]
    fn inside_window_starts_immediately() {
        let generator = QueryGenerator::new(QueryGeneratorConfig::default());
        // 03:00 UTC = 06:00 Moscow, inside [00:00, 07:59]
        let now = utc(2025, 1, 2, 3, 0);
        let queries = generator.generate_at(&row("стоматология", Some("Москва"), None), now);
        assert_eq!(queries[0].scheduled_for, now);
    }

    #[test]
    fn schedule_truncates_at_window_end() {
        let mut config = QueryGeneratorConfig::default();
        config.night_window.timezone = chrono_tz::UTC;
        config.spacing_seconds = 3600;
        let generator = QueryGenerator::new(config);

        // window ends 07:59; starting 06:30 only 06:30 and 07:30 fit
        let queries =
            generator.generate_at(&row("стоматология", Some("Москва"), None), utc(2025, 1, 2, 6, 30));
        assert_eq!(queries.len(), 2);
        for query in &queries {
            assert!(query.scheduled_for <= utc(2025, 1, 2, 7, 59));
        }
    }

    #[test]
    fn respects_max_queries_per_niche() {
        let mut config = QueryGeneratorConfig::default();
        config.max_queries_per_niche = 3;
        let generator = QueryGenerator::new(config);

        let queries = generator.generate_at(
            &row("стоматология", Some("Москва"), None),
            utc(2025, 1, 2, 3, 0),
        );
        assert_eq!(queries.len(), 3);
        // base + two triggers
        assert!(queries[0].trigger.is_none());
        assert!(queries[1].trigger.is_some());
        assert!(queries[2].trigger.is_some());
    }

    #[test]
    fn query_hash_is_stable_per_text_and_region() {
        let hash1 = QueryGenerator::query_hash("lang:ru стоматология Москва", 213);
        let hash2 = QueryGenerator::query_hash("lang:ru стоматология Москва", 213);
        let hash3 = QueryGenerator::query_hash("lang:ru стоматология Москва", 225);
        assert_eq!(hash1, hash2);
        assert_ne!(hash1, hash3);
    }

    #[test]
    fn window_spanning_midnight_is_still_open_before_midnight() {
        let mut config = QueryGeneratorConfig::default();
        config.night_window = NightWindow {
            start_local: NaiveTime::from_hms_opt(22, 0, 0).unwrap(),
            end_local: NaiveTime::from_hms_opt(6, 0, 0).unwrap(),
            timezone: chrono_tz::UTC,
        };
        let generator = QueryGenerator::new(config);

        // 23:00 is inside yesterday-opened [22:00, 06:00+1d)
        let now = utc(2025, 1, 2, 23, 0);
        let queries = generator.generate_at(&row("стоматология", None, Some("Россия")), now);
        assert_eq!(queries[0].scheduled_for, now);

        // 02:00 falls into the window that opened the previous evening
        let now = utc(2025, 1, 3, 2, 0);
        let queries = generator.generate_at(&row("стоматология", None, Some("Россия")), now);
        assert_eq!(queries[0].scheduled_for, now);
    }
}
