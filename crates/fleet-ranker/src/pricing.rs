use std::collections::HashMap;

use async_trait::async_trait;
use tracing::{debug, warn};

/// Public JSONP endpoint AWS itself serves for the spot pricing history
/// page; wrapped as `callback({...})`.
const SPOT_PRICE_URL: &str = "https://website.spot.ec2.aws.a2z.com/spot.js";

/// Public JSON feed backing the Spot Instance Advisor.
const SPOT_INTERRUPTION_URL: &str = "https://spot-bid-advisor.s3.amazonaws.com/spot-advisor-data.json";

/// Fetches the two public datasets the ranker scores against. Both fetchers
/// are infallible from the caller's perspective: a fetch or parse failure
/// is logged and an empty map is returned, so one sweep's pricing hiccup
/// never aborts the sweep (spec: "a single failure to fetch does not fail
/// the sweep").
#[async_trait]
pub trait PricingClient: Send + Sync {
    async fn fetch_spot_prices(&self, region: &str) -> HashMap<String, f64>;
    async fn fetch_interruption_rates(&self, region: &str) -> HashMap<String, u8>;
}

pub struct HttpPricingClient {
    http: reqwest::Client,
}

impl HttpPricingClient {
    pub fn new() -> Self {
        HttpPricingClient {
            http: reqwest::Client::new(),
        }
    }
}

impl Default for HttpPricingClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Strips a `callback({...})`-style JSONP wrapper down to the bare JSON
/// payload, if present.
fn strip_jsonp(body: &str) -> &str {
    let trimmed = body.trim();
    match (trimmed.find('('), trimmed.rfind(')')) {
        (Some(open), Some(close)) if open < close => &trimmed[open + 1..close],
        _ => trimmed,
    }
}

#[async_trait]
impl PricingClient for HttpPricingClient {
    async fn fetch_spot_prices(&self, region: &str) -> HashMap<String, f64> {
        debug!(region, url = SPOT_PRICE_URL, "fetching spot prices");
        let body = match self.http.get(SPOT_PRICE_URL).send().await {
            Ok(resp) => match resp.text().await {
                Ok(text) => text,
                Err(e) => {
                    warn!(region, error = %e, "spot price response body unreadable");
                    return HashMap::new();
                }
            },
            Err(e) => {
                warn!(region, error = %e, "spot price request failed");
                return HashMap::new();
            }
        };

        let json_str = strip_jsonp(&body);
        let parsed: serde_json::Value = match serde_json::from_str(json_str) {
            Ok(v) => v,
            Err(e) => {
                warn!(region, error = %e, "spot price payload parse failed");
                return HashMap::new();
            }
        };

        extract_region_prices(&parsed, region)
    }

    async fn fetch_interruption_rates(&self, region: &str) -> HashMap<String, u8> {
        debug!(region, url = SPOT_INTERRUPTION_URL, "fetching interruption rates");
        let resp = match self.http.get(SPOT_INTERRUPTION_URL).send().await {
            Ok(r) => r,
            Err(e) => {
                warn!(region, error = %e, "interruption rate request failed");
                return HashMap::new();
            }
        };
        let parsed: serde_json::Value = match resp.json().await {
            Ok(v) => v,
            Err(e) => {
                warn!(region, error = %e, "interruption rate payload parse failed");
                return HashMap::new();
            }
        };

        extract_region_interruption_rates(&parsed, region)
    }
}

fn extract_region_prices(payload: &serde_json::Value, region: &str) -> HashMap<String, f64> {
    let mut out = HashMap::new();
    let Some(regions) = payload
        .get("config")
        .and_then(|c| c.get("regions"))
        .and_then(|r| r.as_array())
    else {
        return out;
    };
    let Some(region_entry) = regions
        .iter()
        .find(|r| r.get("region").and_then(|v| v.as_str()) == Some(region))
    else {
        return out;
    };
    let Some(instance_types) = region_entry
        .get("instanceTypes")
        .and_then(|v| v.as_array())
    else {
        return out;
    };
    for family in instance_types {
        let Some(sizes) = family.get("sizes").and_then(|v| v.as_array()) else {
            continue;
        };
        for size in sizes {
            let Some(name) = size.get("size").and_then(|v| v.as_str()) else {
                continue;
            };
            let price = size
                .get("valueColumns")
                .and_then(|v| v.as_array())
                .and_then(|cols| cols.first())
                .and_then(|col| col.get("prices"))
                .and_then(|p| p.get("USD"))
                .and_then(|v| v.as_str())
                .and_then(|s| s.parse::<f64>().ok());
            if let Some(price) = price {
                out.insert(name.to_string(), price);
            }
        }
    }
    out
}

fn extract_region_interruption_rates(payload: &serde_json::Value, region: &str) -> HashMap<String, u8> {
    let mut out = HashMap::new();
    let Some(entries) = payload
        .get("spot_advisor")
        .and_then(|v| v.get(region))
        .and_then(|v| v.get("Linux"))
        .and_then(|v| v.as_object())
    else {
        return out;
    };
    for (instance_type, stats) in entries {
        if let Some(rank) = stats.get("r").and_then(|v| v.as_u64()) {
            out.insert(instance_type.clone(), rank as u8);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_jsonp_extracts_inner_payload() {
        assert_eq!(strip_jsonp("callback({\"a\":1})"), "{\"a\":1}");
        assert_eq!(strip_jsonp("{\"a\":1}"), "{\"a\":1}");
    }

    #[test]
    fn extract_region_prices_reads_nested_shape() {
        let payload = serde_json::json!({
            "config": {
                "regions": [{
                    "region": "us-east-1",
                    "instanceTypes": [{
                        "sizes": [{
                            "size": "m5.large",
                            "valueColumns": [{"prices": {"USD": "0.0416"}}]
                        }]
                    }]
                }]
            }
        });
        let prices = extract_region_prices(&payload, "us-east-1");
        assert_eq!(prices.get("m5.large"), Some(&0.0416));
        assert!(extract_region_prices(&payload, "eu-west-1").is_empty());
    }

    #[test]
    fn extract_region_interruption_rates_reads_nested_shape() {
        let payload = serde_json::json!({
            "spot_advisor": {
                "us-east-1": {
                    "Linux": {
                        "m5.large": {"r": 2, "s": 95}
                    }
                }
            }
        });
        let rates = extract_region_interruption_rates(&payload, "us-east-1");
        assert_eq!(rates.get("m5.large"), Some(&2u8));
    }
}
