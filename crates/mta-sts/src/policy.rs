use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyMode {
    Enforce,
    Testing,
    None,
}

impl fmt::Display for PolicyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Enforce => "enforce",
            Self::Testing => "testing",
            Self::None => "none",
        })
    }
}

/// The verdict for one MX host name checked against a policy.
/// `valid=false` with `testing=false` is the only combination the
/// connection layer must refuse.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyMatch {
    pub valid: bool,
    pub mode: PolicyMode,
    pub testing: bool,
}

#[derive(Debug, PartialEq, Eq)]
pub struct MtaStsPolicy {
    pub mode: PolicyMode,
    pub mx: Vec<String>,
    pub max_age: u64,
    pub fields: BTreeMap<String, Vec<String>>,
}

impl MtaStsPolicy {
    pub fn parse(data: &str) -> anyhow::Result<Self> {
        let mut fields: BTreeMap<String, Vec<String>> = BTreeMap::new();

        for line in data.lines() {
            if line.is_empty() {
                continue;
            }
            let (key, value) = line
                .split_once(':')
                .ok_or_else(|| anyhow::anyhow!("invalid STS policy {data}"))?;
            let key = key.trim();
            let value = value.trim();

            fields
                .entry(key.to_string())
                .or_default()
                .push(value.to_string());
        }

        let version = fields
            .remove("version")
            .ok_or_else(|| anyhow::anyhow!("STS policy {data} is missing a version"))?;
        if version.len() != 1 || version[0] != "STSv1" {
            anyhow::bail!("STS policy {data} has incompatible STS version");
        }

        let mode = match fields.remove("mode") {
            None => anyhow::bail!("STS policy {data} is missing required mode"),
            Some(mode) if mode.len() == 1 => match mode[0].as_str() {
                "enforce" => PolicyMode::Enforce,
                "testing" => PolicyMode::Testing,
                "none" => PolicyMode::None,
                _ => anyhow::bail!("STS policy {data} has invalid mode"),
            },
            _ => anyhow::bail!("STS policy {data} has invalid mode"),
        };

        let mut mx = match fields.remove("mx") {
            None if mode == PolicyMode::None => vec![],
            None => anyhow::bail!("STS policy {data} is missing required mx"),
            Some(v) => v,
        };

        // Ensure that the mx entries are lowercased to aid
        // the mx_name_matches method
        mx.iter_mut()
            .for_each(|entry| *entry = entry.to_lowercase());

        let max_age: u64 = match fields.remove("max_age") {
            None => anyhow::bail!("STS policy {data} is missing required max_age"),
            Some(v) if v.len() == 1 => {
                let max_age = &v[0];
                max_age.parse().map_err(|err| anyhow::anyhow!("STS policy {data} has max_age {max_age} that is not a valid integer: {err:#}"))?
            }
            _ => anyhow::bail!("STS policy {data} has invalid max_age"),
        };

        Ok(Self {
            fields,
            mode,
            mx,
            max_age,
        })
    }

    /// Returns true if `name` matches any of the allowed mx
    /// host name patterns.
    /// `name` must be lowercase.
    pub fn mx_name_matches(&self, name: &str) -> bool {
        for pattern in &self.mx {
            if name_match(name, pattern) {
                return true;
            }
        }
        false
    }

    /// Compute the verdict for one MX host. A `none`-mode policy marks
    /// every host valid; otherwise validity is the name match and
    /// `testing` reflects the policy mode.
    pub fn evaluate_host(&self, name: &str) -> PolicyMatch {
        let valid = match self.mode {
            PolicyMode::None => true,
            PolicyMode::Enforce | PolicyMode::Testing => {
                self.mx_name_matches(&name.to_lowercase())
            }
        };
        PolicyMatch {
            valid,
            mode: self.mode,
            testing: self.mode == PolicyMode::Testing,
        }
    }
}

fn name_match(name: &str, pattern: &str) -> bool {
    // Canonicalized names can include a trailing period.
    // Remove that from the name when matching against a pattern.
    let name = name.trim_end_matches('.');

    if pattern.starts_with("*.") {
        let suffix = &pattern[1..];
        if let Some(lhs) = name.strip_suffix(suffix) {
            // Wildcards only match the first component
            return lhs.find('.').is_none();
        }
        false
    } else {
        name == pattern
    }
}

pub trait Get: Sync + Send {
    fn http_get<'a>(&'a self, url: &'a str) -> BoxFuture<'a, anyhow::Result<String>>;
}

/// The standard policy document fetcher.
pub struct HttpsGetter;

impl Get for HttpsGetter {
    fn http_get<'a>(&'a self, url: &'a str) -> BoxFuture<'a, anyhow::Result<String>> {
        Box::pin(async move {
            let response = reqwest::Client::builder()
                // <https://datatracker.ietf.org/doc/html/rfc8461#section-3.3>
                // HTTP 3xx redirects MUST NOT be followed
                .redirect(reqwest::redirect::Policy::none())
                .timeout(std::time::Duration::from_secs(20))
                .build()?
                .request(reqwest::Method::GET, url)
                .send()
                .await?;

            // <https://datatracker.ietf.org/doc/html/rfc8461#section-3.3>
            // Policies fetched via HTTPS are only valid if the HTTP
            // response code is 200 (OK)
            let status = response.status();
            if status != reqwest::StatusCode::OK {
                anyhow::bail!("failed to GET {url}: {status}");
            }

            // <https://datatracker.ietf.org/doc/html/rfc8461#section-3.2>
            // senders SHOULD validate that the media type is "text/plain"
            // to guard against cases where web servers allow untrusted users
            // to host non-text content.
            // We need to do some manual grubbing about for this, as reqwest's
            // Response::text() method doesn't verify that the type is textual,
            // just whether it decodes as text, which is precisely what we're
            // trying to guard against.

            let content_type = response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .ok_or_else(|| anyhow::anyhow!("missing required Content-Type header"))?;

            let content_type = content_type.to_str()?;

            let ct = if let Some((ct, _)) = content_type.split_once(';') {
                ct.trim()
            } else {
                content_type.trim()
            };
            if ct != "text/plain" {
                anyhow::bail!("Content-Type must be text/plain, got {content_type}");
            }

            Ok(response.text().await?)
        })
    }
}

pub async fn load_policy_for_domain(
    policy_domain: &str,
    getter: &dyn Get,
) -> anyhow::Result<MtaStsPolicy> {
    let url = format!("https://mta-sts.{policy_domain}/.well-known/mta-sts.txt");
    let policy = getter.http_get(&url).await?;
    MtaStsPolicy::parse(&policy)
}
