//! Personalized outreach generation: one LLM call with a pinned
//! persona and a `{subject, body}` JSON schema, falling back to a
//! deterministic template on any failure so the pipeline never stalls
//! on the model.

use crate::config::OpenAiSettings;
use serde_json::{json, Value};
use std::time::Duration;

pub const OPENAI_CHAT_COMPLETIONS_URL: &str = "https://api.openai.com/v1/chat/completions";

const SYSTEM_PROMPT: &str = "Ты Марк Аборчи, специалист по AI-автоматизации. Твоя задача — писать \
персонализированные, человеческие письма на русском языке для компаний, \
которым можно помочь автоматизацией процессов с помощью нейросетей, Python, make.com или n8n. \
Избегай рекламного тона и превосходных степеней. Делай акцент на пользе: экономия времени, \
сокращение затрат, устранение рутины, повышение эффективности. Всегда используй JSON-ответ с полями subject и body. \
Структура письма фиксирована: тема передаёт идею оптимизации процессов компании (например, 'Идея по оптимизации процессов вашей компании') и тело состоит из блоков:\n\
1) Приветствие 'Добрый день!'.\n\
2) Короткое представление Марка и его подхода (нейросети, Python).\n\
3) Упоминание, чем занимается компания (используй предоставленный текст, не упоминай название). Добавь короткое наблюдение (1 предложение) о чём-то, что выделяет компанию: что тебя впечатлило, что показалось интересным.\n\
4) Описание конкретного процесса, который можно упростить с помощью AI, и ожидаемого эффекта (сократить задержки, уменьшить затраты и т.п.).\n\
5) Приглашение обсудить примеры.\n\
6) Завершение: 'С уважением,' + имя и должность.\n\
Структуру сохраняй, но формулировки темы и тела варьируй, чтобы письма не совпадали дословно.";

#[derive(Debug, Clone, Default)]
pub struct CompanyBrief {
    pub name: String,
    pub domain: String,
    pub industry: Option<String>,
    pub highlights: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ContactBrief {
    pub name: Option<String>,
    pub role: Option<String>,
    pub emails: Vec<String>,
    pub phones: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct OfferBrief {
    pub pains: Vec<String>,
    pub value_proposition: String,
    pub call_to_action: String,
}

impl Default for OfferBrief {
    fn default() -> Self {
        Self {
            pains: vec![],
            value_proposition: String::new(),
            call_to_action: "Давайте обсудим возможности сотрудничества на коротком созвоне."
                .to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EmailTemplate {
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Clone)]
pub struct GeneratedEmail {
    pub template: EmailTemplate,
    pub request_payload: Option<Value>,
    pub used_fallback: bool,
}

pub struct EmailGenerator {
    settings: OpenAiSettings,
    language: String,
    http: reqwest::Client,
    chat_url: String,
}

impl EmailGenerator {
    pub fn new(settings: OpenAiSettings) -> Self {
        Self::with_endpoint(settings, OPENAI_CHAT_COMPLETIONS_URL)
    }

    pub fn with_endpoint<S: Into<String>>(settings: OpenAiSettings, chat_url: S) -> Self {
        Self {
            settings,
            language: "ru".to_string(),
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(15))
                .build()
                .expect("reqwest client"),
            chat_url: chat_url.into(),
        }
    }

    /// Produce the outreach letter. Any failure on the LLM path flips
    /// to the deterministic template with `used_fallback` set and the
    /// attempted payload retained for auditing.
    pub async fn generate(
        &self,
        company: &CompanyBrief,
        offer: &OfferBrief,
        contact: Option<&ContactBrief>,
    ) -> GeneratedEmail {
        let _ = contact;
        if self.settings.api_key.is_empty() {
            tracing::warn!("OPENAI_API_KEY is not set, using the fallback template");
            return GeneratedEmail {
                template: fallback_template(company, offer),
                request_payload: None,
                used_fallback: true,
            };
        }

        let payload = self.build_payload(company);
        match self.request_completion(&payload).await {
            Ok(response) => match parse_completion(&response) {
                Some(template) => GeneratedEmail {
                    template,
                    request_payload: Some(payload),
                    used_fallback: false,
                },
                None => {
                    tracing::error!("could not interpret the LLM response: {response}");
                    GeneratedEmail {
                        template: fallback_template(company, offer),
                        request_payload: Some(payload),
                        used_fallback: true,
                    }
                }
            },
            Err(err) => {
                tracing::error!("LLM request failed: {err:#}");
                GeneratedEmail {
                    template: fallback_template(company, offer),
                    request_payload: Some(payload),
                    used_fallback: true,
                }
            }
        }
    }

    fn build_payload(&self, company: &CompanyBrief) -> Value {
        let homepage_excerpt = if company.highlights.is_empty() {
            Value::Null
        } else {
            Value::String(company.highlights.join(" "))
        };

        json!({
            "model": self.settings.model,
            "temperature": self.settings.temperature,
            "response_format": {
                "type": "json_schema",
                "json_schema": {
                    "name": "EmailTemplate",
                    "schema": {
                        "type": "object",
                        "properties": {
                            "subject": {"type": "string"},
                            "body": {"type": "string"},
                        },
                        "required": ["subject", "body"],
                    },
                },
            },
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {
                    "role": "user",
                    "content": json!({
                        "company": {"homepage_excerpt": homepage_excerpt},
                        "guidelines": {"language": self.language, "avoid_marketing": true},
                    }).to_string(),
                },
            ],
        })
    }

    async fn request_completion(&self, payload: &Value) -> anyhow::Result<Value> {
        let response = self
            .http
            .post(&self.chat_url)
            .bearer_auth(&self.settings.api_key)
            .json(payload)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }
}

fn parse_completion(response: &Value) -> Option<EmailTemplate> {
    let content = response
        .get("choices")?
        .get(0)?
        .get("message")?
        .get("content")?
        .as_str()?;
    let parsed: Value = serde_json::from_str(content).ok()?;
    Some(EmailTemplate {
        subject: parsed.get("subject")?.as_str()?.to_string(),
        body: parsed.get("body")?.as_str()?.to_string(),
    })
}

/// The deterministic letter used when the LLM is unavailable. Keeps
/// the exact structure the persona prompt pins down.
fn fallback_template(company: &CompanyBrief, offer: &OfferBrief) -> EmailTemplate {
    let subject = "Идея по оптимизации процессов вашей компании".to_string();
    let industry_fragment = company
        .industry
        .as_deref()
        .filter(|v| !v.is_empty())
        .unwrap_or("вашей сфере");

    let process_hint = if !offer.value_proposition.is_empty() {
        format!(
            "например, {}, чтобы команда меньше тратила времени на рутину",
            offer.value_proposition.to_lowercase()
        )
    } else if let Some(pain) = offer.pains.first() {
        format!(
            "например, автоматизировать части процесса вокруг {}, чтобы команда меньше тратила времени на рутину",
            pain.to_lowercase()
        )
    } else {
        "например, автоматизировать обработку заявок или подготовку отчётов, чтобы команда меньше тратила времени на рутину"
            .to_string()
    };

    let observation = if offer.pains.is_empty() {
        "Обратил внимание, как вы последовательно развиваете проекты — глаз зацепился за кейсы на главной."
    } else {
        "Понравилось, что вы так системно подходите к своим задачам — это редко встретишь."
    };

    let body_lines = [
        "Добрый день!",
        "Меня зовут Марк, я занимаюсь автоматизацией бизнес-процессов с помощью нейросетей и Python.",
        &format!(
            "Посмотрел ваш сайт — по описанию видно, что вы работаете в сфере {industry_fragment}."
        ),
        observation,
        &format!("Мне кажется, здесь можно упростить процессы, {process_hint}."),
        "",
        "Если интересно, могу показать на конкретных примерах, как это работает.",
        "",
        "С уважением,",
        "Марк Аборчи",
        "AI-Automation Specialist",
    ];

    EmailTemplate {
        subject,
        body: body_lines.join("\n"),
    }
}
