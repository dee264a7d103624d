//! Parsing of the XML payload returned by a completed deferred search.

use normalize::{clean_snippet, normalize_domain, normalize_url};
use quick_xml::events::Event;
use quick_xml::Reader;
use std::collections::HashSet;
use std::sync::LazyLock;
use thiserror::Error;

/// Marketplaces, review aggregators and social networks: never worth a
/// company row of their own.
pub static EXCLUDED_DOMAINS: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    HashSet::from([
        "avito.ru",
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
    ])
});

#[derive(Debug, Error)]
#[error("malformed SERP XML: {0}")]
pub struct SerpParseError(String);

/// One document of the search results page, already canonicalized.
#[derive(Debug, Clone, PartialEq)]
pub struct SerpDocument {
    pub url: String,
    pub domain: String,
    pub title: String,
    pub snippet: String,
    pub position: i32,
    pub language: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Capture {
    Url,
    Lurl,
    Domain,
    Title,
    Name,
    Passage,
    LangProperty,
}

impl Capture {
    fn tag(&self) -> &'static [u8] {
        match self {
            Capture::Url => b"url",
            Capture::Lurl => b"lurl",
            Capture::Domain => b"domain",
            Capture::Title => b"title",
            Capture::Name => b"name",
            Capture::Passage => b"passage",
            Capture::LangProperty => b"property",
        }
    }
}

#[derive(Default)]
struct DocFields {
    url: String,
    lurl: String,
    domain: String,
    title: String,
    name: String,
    passages: Vec<String>,
    language: Option<String>,
}

impl DocFields {
    fn into_document(self, position: i32) -> Option<SerpDocument> {
        let url_text = if self.url.trim().is_empty() {
            self.lurl.trim()
        } else {
            self.url.trim()
        };
        let url = normalize_url(url_text);
        if url.is_empty() {
            tracing::debug!("skipping document without a usable URL: {url_text:?}");
            return None;
        }

        let domain_source = if self.domain.trim().is_empty() {
            url.as_str()
        } else {
            self.domain.trim()
        };
        let domain = normalize_domain(domain_source);
        if EXCLUDED_DOMAINS.contains(domain.as_str()) {
            tracing::debug!("skipping excluded domain {domain}");
            return None;
        }

        let title = [self.title.trim(), self.name.trim(), domain.as_str()]
            .into_iter()
            .find(|v| !v.is_empty())
            .unwrap_or_default()
            .to_string();

        let snippet = clean_snippet(&self.passages.join(" "));

        Some(SerpDocument {
            url,
            domain,
            title,
            snippet,
            position,
            language: self.language.map(|l| l.trim().to_string()).filter(|l| !l.is_empty()),
        })
    }
}

/// Walk `doc` elements of the payload in document order. Documents
/// without a canonicalizable URL and documents on excluded domains are
/// dropped, but still consume a position.
pub fn parse_serp_xml(payload: &[u8]) -> Result<Vec<SerpDocument>, SerpParseError> {
    if payload.is_empty() {
        return Ok(vec![]);
    }

    // No text trimming here: titles interleave text with <hlword>
    // markup and trimming would glue the fragments together. Field
    // values are trimmed when the document is finalized.
    let mut reader = Reader::from_reader(payload);

    let mut documents = vec![];
    let mut buf = Vec::new();
    let mut position = 0i32;
    let mut in_doc = false;
    let mut fields = DocFields::default();
    let mut capture: Option<Capture> = None;
    let mut text = String::new();

    loop {
        match reader
            .read_event_into(&mut buf)
            .map_err(|err| SerpParseError(err.to_string()))?
        {
            Event::Start(start) => {
                let tag = start.name();
                if tag.as_ref() == b"doc" {
                    in_doc = true;
                    position += 1;
                    fields = DocFields::default();
                    capture = None;
                } else if in_doc && capture.is_none() {
                    capture = match tag.as_ref() {
                        b"url" => Some(Capture::Url),
                        b"lurl" => Some(Capture::Lurl),
                        b"domain" => Some(Capture::Domain),
                        b"title" => Some(Capture::Title),
                        b"name" => Some(Capture::Name),
                        b"passage" => Some(Capture::Passage),
                        b"property" => {
                            let is_lang = start
                                .try_get_attribute("name")
                                .map_err(|err| SerpParseError(err.to_string()))?
                                .map(|attr| attr.value.as_ref() == b"lang")
                                .unwrap_or(false);
                            is_lang.then_some(Capture::LangProperty)
                        }
                        _ => None,
                    };
                    text.clear();
                }
            }
            Event::Text(event) => {
                if capture.is_some() {
                    let chunk = event
                        .unescape()
                        .map_err(|err| SerpParseError(err.to_string()))?;
                    text.push_str(&chunk);
                }
            }
            Event::End(end) => {
                let tag = end.name();
                if tag.as_ref() == b"doc" {
                    if in_doc {
                        if let Some(document) = std::mem::take(&mut fields).into_document(position)
                        {
                            documents.push(document);
                        }
                    }
                    in_doc = false;
                    capture = None;
                } else if let Some(active) = capture {
                    if tag.as_ref() == active.tag() {
                        let value = std::mem::take(&mut text);
                        match active {
                            Capture::Url => fields.url = value,
                            Capture::Lurl => fields.lurl = value,
                            Capture::Domain => fields.domain = value,
                            Capture::Title => fields.title.push_str(&value),
                            Capture::Name => fields.name = value,
                            Capture::Passage => fields.passages.push(value),
                            Capture::LangProperty => fields.language = Some(value),
                        }
                        capture = None;
                    }
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    Ok(documents)
}
