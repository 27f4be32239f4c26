use dns_resolver::Resolver;
use std::collections::BTreeMap;

// <https://datatracker.ietf.org/doc/html/rfc8461>

#[derive(Debug)]
pub struct MtaStsDnsRecord {
    pub id: String,
    pub fields: BTreeMap<String, String>,
}

/// Look up the `_mta-sts.<domain>` TXT record. `Ok(None)` means the
/// domain publishes no STSv1 record; a resolver failure or a malformed
/// STSv1 record is an error.
pub async fn resolve_dns_record(
    policy_domain: &str,
    resolver: &dyn Resolver,
) -> anyhow::Result<Option<MtaStsDnsRecord>> {
    let dns_name = format!("_mta-sts.{policy_domain}");
    let res = resolver.resolve_txt(&dns_name).await?.as_txt();

    // A domain may publish unrelated TXT records at this name; only an
    // STSv1 record counts
    let Some(txt) = res.into_iter().find(|txt| {
        txt.split(';')
            .next()
            .map(|field| field.trim() == "v=STSv1")
            .unwrap_or(false)
    }) else {
        return Ok(None);
    };

    let mut fields = BTreeMap::new();

    for pair in txt.split(';') {
        if pair.trim().is_empty() {
            continue;
        }
        let (key, value) = pair.split_once('=').ok_or_else(|| {
            anyhow::anyhow!("invalid element in STS text record: {pair}. Full record: {txt}")
        })?;

        let key = key.trim();
        let value = value.trim();

        fields.insert(key.to_string(), value.to_string());
    }

    let id = fields
        .get("id")
        .ok_or_else(|| anyhow::anyhow!("STSv1 TXT record is missing id parameter. {txt}"))?
        .to_string();

    Ok(Some(MtaStsDnsRecord { id, fields }))
}
