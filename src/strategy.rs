//! How a retriever turns a task into requests.
//!
//! Services differ only in how identifiers travel (query string, form field,
//! JSON body, SOAP envelope) so each gets a small [`FetchStrategy`] instead of
//! its own client type. Strategies are picked from the run file.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::Value;
use url::form_urlencoded;

use crate::batch::partition;
use crate::domain::RetrievalTask;
use crate::error::XrefError;
use crate::transport::{HttpRequest, RequestBody};

pub const IDS_PLACEHOLDER: &str = "{ids}";
pub const ID_PLACEHOLDER: &str = "{id}";

pub trait FetchStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    /// Requests whose bodies, concatenated in order, form the task's artifact.
    fn build_requests(&self, task: &RetrievalTask) -> Result<Vec<HttpRequest>, XrefError>;
}

fn pages(task: &RetrievalTask, per_request: Option<usize>) -> Result<Vec<Vec<String>>, XrefError> {
    if task.identifiers.is_empty() {
        return Err(XrefError::Configuration(format!(
            "retriever {} needs identifiers for {}",
            task.retriever, task.context
        )));
    }
    let size = per_request.unwrap_or(task.identifiers.len());
    partition(&task.identifiers, size)
}

/// GET of the locator; `{ids}` in the locator is filled one page at a time.
#[derive(Debug, Clone)]
pub struct HttpGet {
    pub ids_per_request: Option<usize>,
    pub separator: String,
}

impl FetchStrategy for HttpGet {
    fn name(&self) -> &'static str {
        "get"
    }

    fn build_requests(&self, task: &RetrievalTask) -> Result<Vec<HttpRequest>, XrefError> {
        if !task.source_locator.contains(IDS_PLACEHOLDER) {
            return Ok(vec![HttpRequest::get(task.source_locator.clone())]);
        }
        Ok(pages(task, self.ids_per_request)?
            .iter()
            .map(|page| {
                let joined = page
                    .iter()
                    .map(|id| form_urlencoded::byte_serialize(id.as_bytes()).collect::<String>())
                    .collect::<Vec<_>>()
                    .join(&self.separator);
                HttpRequest::get(task.source_locator.replace(IDS_PLACEHOLDER, &joined))
            })
            .collect())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormEncoding {
    UrlEncoded,
    Multipart,
}

/// POST of a form whose `ids_field` holds one page of identifiers.
#[derive(Debug, Clone)]
pub struct HttpPostForm {
    pub encoding: FormEncoding,
    pub ids_field: String,
    pub fields: BTreeMap<String, String>,
    pub ids_per_request: Option<usize>,
    pub separator: String,
}

impl FetchStrategy for HttpPostForm {
    fn name(&self) -> &'static str {
        match self.encoding {
            FormEncoding::UrlEncoded => "post_form",
            FormEncoding::Multipart => "post_multipart",
        }
    }

    fn build_requests(&self, task: &RetrievalTask) -> Result<Vec<HttpRequest>, XrefError> {
        Ok(pages(task, self.ids_per_request)?
            .into_iter()
            .map(|page| {
                let mut fields = self
                    .fields
                    .iter()
                    .map(|(key, value)| (key.clone(), value.clone()))
                    .collect::<Vec<_>>();
                fields.push((self.ids_field.clone(), page.join(&self.separator)));
                let body = match self.encoding {
                    FormEncoding::UrlEncoded => RequestBody::Form(fields),
                    FormEncoding::Multipart => RequestBody::Multipart(fields),
                };
                HttpRequest::post(task.source_locator.clone(), body)
            })
            .collect())
    }
}

/// POST of a JSON document; any string equal to `{ids}` becomes the page array.
#[derive(Debug, Clone)]
pub struct HttpPostJson {
    pub body: Value,
    pub ids_per_request: Option<usize>,
}

impl FetchStrategy for HttpPostJson {
    fn name(&self) -> &'static str {
        "post_json"
    }

    fn build_requests(&self, task: &RetrievalTask) -> Result<Vec<HttpRequest>, XrefError> {
        Ok(pages(task, self.ids_per_request)?
            .into_iter()
            .map(|page| {
                let body = fill_ids(&self.body, &page);
                HttpRequest::post(task.source_locator.clone(), RequestBody::Json(body))
                    .with_header("Accept", "application/json")
            })
            .collect())
    }
}

fn fill_ids(template: &Value, ids: &[String]) -> Value {
    match template {
        Value::String(text) if text == IDS_PLACEHOLDER => {
            Value::Array(ids.iter().cloned().map(Value::String).collect())
        }
        Value::Array(items) => Value::Array(items.iter().map(|item| fill_ids(item, ids)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, value)| (key.clone(), fill_ids(value, ids)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Whole-file FTP download of the locator.
#[derive(Debug, Clone, Default)]
pub struct FtpGet;

impl FetchStrategy for FtpGet {
    fn name(&self) -> &'static str {
        "ftp"
    }

    fn build_requests(&self, task: &RetrievalTask) -> Result<Vec<HttpRequest>, XrefError> {
        if !task.source_locator.starts_with("ftp://") {
            return Err(XrefError::Configuration(format!(
                "retriever {} uses ftp but its locator is {}",
                task.retriever, task.source_locator
            )));
        }
        Ok(vec![HttpRequest::get(task.source_locator.clone())])
    }
}

/// One SOAP call per identifier, `{id}` substituted into the envelope.
#[derive(Debug, Clone)]
pub struct SoapCall {
    pub action: String,
    pub envelope: String,
}

impl FetchStrategy for SoapCall {
    fn name(&self) -> &'static str {
        "soap"
    }

    fn build_requests(&self, task: &RetrievalTask) -> Result<Vec<HttpRequest>, XrefError> {
        if !self.envelope.contains(ID_PLACEHOLDER) {
            return Ok(vec![self.call(task, self.envelope.clone())]);
        }
        Ok(pages(task, Some(1))?
            .into_iter()
            .flatten()
            .map(|id| self.call(task, self.envelope.replace(ID_PLACEHOLDER, &xml_escape(&id))))
            .collect())
    }
}

impl SoapCall {
    fn call(&self, task: &RetrievalTask, envelope: String) -> HttpRequest {
        HttpRequest::post(task.source_locator.clone(), RequestBody::Xml(envelope))
            .with_header("SOAPAction", self.action.clone())
    }
}

fn xml_escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

fn default_separator() -> String {
    ",".to_string()
}

/// Strategy selection as written in the run file.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StrategyConfig {
    Get {
        #[serde(default)]
        ids_per_request: Option<usize>,
        #[serde(default = "default_separator")]
        separator: String,
    },
    PostForm {
        ids_field: String,
        #[serde(default)]
        fields: BTreeMap<String, String>,
        #[serde(default)]
        ids_per_request: Option<usize>,
        #[serde(default = "default_separator")]
        separator: String,
    },
    PostMultipart {
        ids_field: String,
        #[serde(default)]
        fields: BTreeMap<String, String>,
        #[serde(default)]
        ids_per_request: Option<usize>,
        #[serde(default = "default_separator")]
        separator: String,
    },
    PostJson {
        body: Value,
        #[serde(default)]
        ids_per_request: Option<usize>,
    },
    Ftp,
    Soap {
        action: String,
        envelope: String,
    },
}

impl Default for StrategyConfig {
    fn default() -> Self {
        StrategyConfig::Get {
            ids_per_request: None,
            separator: default_separator(),
        }
    }
}

impl StrategyConfig {
    pub fn build(&self) -> Result<Box<dyn FetchStrategy>, XrefError> {
        let check_page = |size: &Option<usize>| {
            if *size == Some(0) {
                return Err(XrefError::Configuration(
                    "ids_per_request must be greater than zero".to_string(),
                ));
            }
            Ok(())
        };
        let strategy: Box<dyn FetchStrategy> = match self {
            StrategyConfig::Get {
                ids_per_request,
                separator,
            } => {
                check_page(ids_per_request)?;
                Box::new(HttpGet {
                    ids_per_request: *ids_per_request,
                    separator: separator.clone(),
                })
            }
            StrategyConfig::PostForm {
                ids_field,
                fields,
                ids_per_request,
                separator,
            }
            | StrategyConfig::PostMultipart {
                ids_field,
                fields,
                ids_per_request,
                separator,
            } => {
                check_page(ids_per_request)?;
                let encoding = if matches!(self, StrategyConfig::PostMultipart { .. }) {
                    FormEncoding::Multipart
                } else {
                    FormEncoding::UrlEncoded
                };
                Box::new(HttpPostForm {
                    encoding,
                    ids_field: ids_field.clone(),
                    fields: fields.clone(),
                    ids_per_request: *ids_per_request,
                    separator: separator.clone(),
                })
            }
            StrategyConfig::PostJson {
                body,
                ids_per_request,
            } => {
                check_page(ids_per_request)?;
                Box::new(HttpPostJson {
                    body: body.clone(),
                    ids_per_request: *ids_per_request,
                })
            }
            StrategyConfig::Ftp => Box::new(FtpGet),
            StrategyConfig::Soap { action, envelope } => Box::new(SoapCall {
                action: action.clone(),
                envelope: envelope.clone(),
            }),
        };
        Ok(strategy)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use assert_matches::assert_matches;
    use camino::Utf8PathBuf;
    use serde_json::json;

    use super::*;
    use crate::domain::SpeciesContext;

    fn task(locator: &str, ids: &[&str]) -> RetrievalTask {
        RetrievalTask {
            retriever: "test".to_string(),
            source_locator: locator.to_string(),
            destination: Utf8PathBuf::from("out/test.txt"),
            max_age: Duration::ZERO,
            identifiers: ids.iter().map(|id| id.to_string()).collect(),
            context: SpeciesContext::default(),
            retry_budget: 1,
        }
    }

    #[test]
    fn get_pages_identifiers_into_url() {
        let strategy = HttpGet {
            ids_per_request: Some(2),
            separator: "+".to_string(),
        };
        let requests = strategy
            .build_requests(&task("https://rest.kegg.jp/conv/ncbi-geneid/{ids}", &["hsa:1", "hsa:2", "hsa:3"]))
            .unwrap();
        assert_eq!(requests.len(), 2);
        assert_eq!(
            requests[0].url,
            "https://rest.kegg.jp/conv/ncbi-geneid/hsa%3A1+hsa%3A2"
        );
        assert_eq!(requests[1].url, "https://rest.kegg.jp/conv/ncbi-geneid/hsa%3A3");
    }

    #[test]
    fn plain_get_ignores_identifiers() {
        let strategy = HttpGet {
            ids_per_request: None,
            separator: ",".to_string(),
        };
        let requests = strategy
            .build_requests(&task("https://zinc.docking.org/genes.txt", &[]))
            .unwrap();
        assert_eq!(requests, vec![HttpRequest::get("https://zinc.docking.org/genes.txt")]);
    }

    #[test]
    fn form_post_carries_static_fields() {
        let mut fields = BTreeMap::new();
        fields.insert("from".to_string(), "UniProtKB_AC-ID".to_string());
        fields.insert("to".to_string(), "KEGG".to_string());
        let strategy = HttpPostForm {
            encoding: FormEncoding::Multipart,
            ids_field: "ids".to_string(),
            fields,
            ids_per_request: None,
            separator: ",".to_string(),
        };
        let requests = strategy
            .build_requests(&task("https://rest.uniprot.org/idmapping/run", &["P1", "P2"]))
            .unwrap();
        assert_eq!(strategy.name(), "post_multipart");
        assert_eq!(
            requests[0].body,
            RequestBody::Multipart(vec![
                ("from".to_string(), "UniProtKB_AC-ID".to_string()),
                ("to".to_string(), "KEGG".to_string()),
                ("ids".to_string(), "P1,P2".to_string()),
            ])
        );
    }

    #[test]
    fn json_template_receives_id_array() {
        let strategy = HttpPostJson {
            body: json!({"query": "q", "variables": {"ids": "{ids}"}}),
            ids_per_request: Some(1),
        };
        let requests = strategy
            .build_requests(&task("https://pharos-api.ncats.io/graphql", &["T1", "T2"]))
            .unwrap();
        assert_eq!(requests.len(), 2);
        assert_eq!(
            requests[1].body,
            RequestBody::Json(json!({"query": "q", "variables": {"ids": ["T2"]}}))
        );
    }

    #[test]
    fn soap_call_per_identifier_is_escaped() {
        let strategy = SoapCall {
            action: "getEcNumber".to_string(),
            envelope: "<Envelope><id>{id}</id></Envelope>".to_string(),
        };
        let requests = strategy
            .build_requests(&task("https://www.brenda-enzymes.org/soap/brenda_server.php", &["1.1.1.1", "a<b"]))
            .unwrap();
        assert_eq!(requests.len(), 2);
        assert_eq!(
            requests[1].body,
            RequestBody::Xml("<Envelope><id>a&lt;b</id></Envelope>".to_string())
        );
        assert!(
            requests[0]
                .headers
                .contains(&("SOAPAction".to_string(), "getEcNumber".to_string()))
        );
    }

    #[test]
    fn ftp_requires_ftp_locator() {
        let err = FtpGet.build_requests(&task("https://example.org/x", &[])).unwrap_err();
        assert_matches!(err, XrefError::Configuration(_));
    }

    #[test]
    fn config_selects_strategy() {
        let config: StrategyConfig =
            serde_json::from_str(r#"{"kind": "post_form", "ids_field": "ids"}"#).unwrap();
        assert_eq!(config.build().unwrap().name(), "post_form");
        let config: StrategyConfig = serde_json::from_str(r#"{"kind": "ftp"}"#).unwrap();
        assert_eq!(config.build().unwrap().name(), "ftp");
        let config: StrategyConfig =
            serde_json::from_str(r#"{"kind": "get", "ids_per_request": 0}"#).unwrap();
        assert!(matches!(
            config.build(),
            Err(XrefError::Configuration(_))
        ));
    }
}
