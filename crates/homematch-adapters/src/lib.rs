//! Listing source contracts, the Rentcast adapter and listing URL enrichment.

use std::sync::LazyLock;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use homematch_core::{Listing, PlatformPreference, SearchCriteria};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT};
use reqwest::Url;
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use tracing::{debug, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "homematch-adapters";

/// Listings requested per provider call.
pub const PROVIDER_PAGE_SIZE: usize = 50;

pub const RENTCAST_BASE_URL: &str = "https://api.rentcast.io/v1";

static ZILLOW_HOMES_URL: LazyLock<Url> =
    LazyLock::new(|| static_url("https://www.zillow.com/homes/"));
static REDFIN_SEARCH_URL: LazyLock<Url> =
    LazyLock::new(|| static_url("https://www.redfin.com/search"));
static REALTOR_SEARCH_URL: LazyLock<Url> =
    LazyLock::new(|| static_url("https://www.realtor.com/realestateandhomes-search/search"));

fn static_url(raw: &'static str) -> Url {
    Url::parse(raw).expect("static search url is valid")
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("invalid provider url: {0}")]
    InvalidUrl(String),
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("unexpected provider payload: {0}")]
    Decode(String),
}

#[async_trait]
pub trait ListingSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    async fn search_listings(&self, criteria: &SearchCriteria)
        -> Result<Vec<Listing>, ProviderError>;
}

#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub base_url: String,
    pub api_key: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl ProviderConfig {
    pub fn rentcast(api_key: impl Into<String>) -> Self {
        Self {
            base_url: RENTCAST_BASE_URL.to_string(),
            api_key: api_key.into(),
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

/// Provider query parameters for `criteria`, in a stable order.
///
/// Only the first zip code is sent; the provider accepts a single one.
pub fn criteria_query_pairs(criteria: &SearchCriteria) -> Vec<(&'static str, String)> {
    let mut pairs = Vec::new();
    if let Some(city) = non_blank(criteria.city.as_deref()) {
        pairs.push(("city", city.to_string()));
    }
    if let Some(state) = non_blank(criteria.state.as_deref()) {
        pairs.push(("state", state.to_string()));
    }
    if let Some(zip) = criteria
        .zip_codes
        .iter()
        .find_map(|z| non_blank(Some(z.as_str())))
    {
        pairs.push(("zipCode", zip.to_string()));
    }
    if let Some(bedrooms) = criteria.bedrooms {
        pairs.push(("bedrooms", bedrooms.to_string()));
    }
    if let Some(bathrooms) = criteria.bathrooms {
        pairs.push(("bathrooms", bathrooms.to_string()));
    }
    if let Some(min) = criteria.min_price {
        pairs.push(("priceMin", min.to_string()));
    }
    if let Some(max) = criteria.max_price {
        pairs.push(("priceMax", max.to_string()));
    }
    if let Some(kind) = non_blank(criteria.property_type.as_deref()) {
        pairs.push(("propertyType", kind.to_string()));
    }
    pairs.push(("limit", PROVIDER_PAGE_SIZE.to_string()));
    pairs.push(("status", "Active".to_string()));
    pairs
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

#[derive(Debug)]
pub struct RentcastSource {
    client: reqwest::Client,
    base_url: String,
}

impl RentcastSource {
    pub fn new(config: ProviderConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        let mut api_key =
            HeaderValue::from_str(&config.api_key).context("rentcast api key is not a valid header")?;
        api_key.set_sensitive(true);
        headers.insert("x-api-key", api_key);
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .default_headers(headers);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn listings_url(&self, criteria: &SearchCriteria) -> Result<Url, ProviderError> {
        let raw = format!("{}/listings/sale", self.base_url);
        let mut url = Url::parse(&raw).map_err(|e| ProviderError::InvalidUrl(format!("{raw}: {e}")))?;
        url.query_pairs_mut()
            .extend_pairs(criteria_query_pairs(criteria));
        Ok(url)
    }
}

#[async_trait]
impl ListingSource for RentcastSource {
    fn source_id(&self) -> &'static str {
        "rentcast"
    }

    async fn search_listings(
        &self,
        criteria: &SearchCriteria,
    ) -> Result<Vec<Listing>, ProviderError> {
        let url = self.listings_url(criteria)?;
        let span = info_span!("provider_search", source = self.source_id(), url = %url);

        async move {
            let resp = self.client.get(url.clone()).send().await?;
            let status = resp.status();
            if !status.is_success() {
                return Err(ProviderError::HttpStatus {
                    status: status.as_u16(),
                    url: resp.url().to_string(),
                });
            }

            let body = resp.bytes().await?;
            let payload: JsonValue = serde_json::from_slice(&body)
                .map_err(|e| ProviderError::Decode(format!("invalid json: {e}")))?;
            let listings = normalize_listings(payload)?;
            debug!(count = listings.len(), "provider listings normalized");
            Ok(listings)
        }
        .instrument(span)
        .await
    }
}

/// Validate and normalize a provider response. Malformed records are dropped.
pub fn normalize_listings(payload: JsonValue) -> Result<Vec<Listing>, ProviderError> {
    let JsonValue::Array(items) = payload else {
        return Err(ProviderError::Decode(format!(
            "expected an array of listings, got {}",
            json_kind(&payload)
        )));
    };

    let mut listings = Vec::with_capacity(items.len());
    for (index, item) in items.into_iter().enumerate() {
        match normalize_property(item) {
            Ok(listing) => listings.push(listing),
            Err(reason) => warn!(index, %reason, "dropping malformed provider listing"),
        }
    }
    Ok(listings)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RejectReason {
    #[error("record is not an object")]
    NotAnObject,
    #[error("missing string id")]
    MissingId,
    #[error("missing formatted address")]
    MissingAddress,
}

pub fn normalize_property(item: JsonValue) -> Result<Listing, RejectReason> {
    let JsonValue::Object(fields) = &item else {
        return Err(RejectReason::NotAnObject);
    };
    let listing_id = string_field(fields, "id").ok_or(RejectReason::MissingId)?;
    let address = string_field(fields, "formattedAddress").ok_or(RejectReason::MissingAddress)?;

    let agent = fields.get("listingAgent").and_then(JsonValue::as_object);
    let agent_name = agent.and_then(|a| string_field(a, "name"));
    let agent_email = agent.and_then(|a| string_field(a, "email"));

    Ok(Listing {
        listing_id,
        address,
        price: whole_number_field(fields, "price"),
        bedrooms: number_field(fields, "bedrooms"),
        bathrooms: number_field(fields, "bathrooms"),
        sqft: whole_number_field(fields, "squareFootage"),
        agent_name,
        agent_email,
        latitude: number_field(fields, "latitude"),
        longitude: number_field(fields, "longitude"),
        listing_url: None,
        raw_data: item,
    })
}

fn string_field(fields: &Map<String, JsonValue>, key: &str) -> Option<String> {
    fields
        .get(key)
        .and_then(JsonValue::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn number_field(fields: &Map<String, JsonValue>, key: &str) -> Option<f64> {
    fields
        .get(key)
        .and_then(JsonValue::as_f64)
        .filter(|n| n.is_finite())
}

fn whole_number_field(fields: &Map<String, JsonValue>, key: &str) -> Option<u64> {
    let value = fields.get(key)?;
    value.as_u64().or_else(|| {
        value
            .as_f64()
            .filter(|n| n.is_finite() && *n >= 0.0)
            .map(|n| n.round() as u64)
    })
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "a boolean",
        JsonValue::Number(_) => "a number",
        JsonValue::String(_) => "a string",
        JsonValue::Array(_) => "an array",
        JsonValue::Object(_) => "an object",
    }
}

/// Outward-facing search URL for `address` on the user's preferred platform.
///
/// Unset and unrecognized preferences use Zillow.
pub fn build_listing_url(address: &str, preference: Option<PlatformPreference>) -> String {
    match preference {
        Some(PlatformPreference::Redfin) => query_url(&REDFIN_SEARCH_URL, "location", address),
        Some(PlatformPreference::Realtor) => query_url(&REALTOR_SEARCH_URL, "query", address),
        _ => zillow_url(address),
    }
}

fn query_url(base: &Url, key: &str, address: &str) -> String {
    let mut url = base.clone();
    url.query_pairs_mut().append_pair(key, address);
    url.into()
}

fn zillow_url(address: &str) -> String {
    let slug = format!("{}_rb", address.trim().replace(' ', "-"));
    let mut url = ZILLOW_HOMES_URL.clone();
    if let Ok(mut segments) = url.path_segments_mut() {
        segments.pop_if_empty().push(&slug).push("");
    }
    url.into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn criteria_map_to_provider_params() {
        let criteria = SearchCriteria {
            min_price: Some(200_000),
            max_price: Some(500_000),
            bedrooms: Some(3),
            bathrooms: Some(2.5),
            property_type: Some("Single Family".into()),
            city: Some("Austin".into()),
            state: Some("TX".into()),
            zip_codes: vec!["78701".into(), "78702".into()],
        };
        let pairs = criteria_query_pairs(&criteria);
        let expected: Vec<(&str, String)> = vec![
            ("city", "Austin".into()),
            ("state", "TX".into()),
            ("zipCode", "78701".into()),
            ("bedrooms", "3".into()),
            ("bathrooms", "2.5".into()),
            ("priceMin", "200000".into()),
            ("priceMax", "500000".into()),
            ("propertyType", "Single Family".into()),
            ("limit", "50".into()),
            ("status", "Active".into()),
        ];
        assert_eq!(pairs, expected);
    }

    #[test]
    fn empty_criteria_still_cap_and_filter_active() {
        let pairs = criteria_query_pairs(&SearchCriteria {
            city: Some("  ".into()),
            ..Default::default()
        });
        assert_eq!(
            pairs,
            vec![("limit", "50".to_string()), ("status", "Active".to_string())]
        );
    }

    #[test]
    fn listings_url_encodes_criteria() {
        let source = RentcastSource::new(ProviderConfig {
            base_url: "https://api.example.test/v1/".into(),
            ..ProviderConfig::rentcast("key")
        })
        .unwrap();
        let url = source
            .listings_url(&SearchCriteria {
                city: Some("San Antonio".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://api.example.test/v1/listings/sale?city=San+Antonio&limit=50&status=Active"
        );
    }

    #[test]
    fn absent_provider_fields_stay_absent() {
        let listing = normalize_property(json!({
            "id": "L1",
            "formattedAddress": "1 Congress Ave, Austin, TX 78701",
            "price": 450000,
            "latitude": "30.26",
        }))
        .unwrap();
        assert_eq!(listing.listing_id, "L1");
        assert_eq!(listing.price, Some(450_000));
        assert_eq!(listing.bedrooms, None);
        assert_eq!(listing.bathrooms, None);
        assert_eq!(listing.sqft, None);
        assert_eq!(listing.latitude, None);
        assert_eq!(listing.agent_email, None);
        assert_eq!(listing.raw_data["latitude"], "30.26");
    }

    #[test]
    fn listing_agent_contact_is_picked_up() {
        let listing = normalize_property(json!({
            "id": "L2",
            "formattedAddress": "2 Lamar Blvd",
            "bedrooms": 3,
            "bathrooms": 2.5,
            "squareFootage": 1820.4,
            "latitude": 30.1,
            "longitude": -97.7,
            "listingAgent": {"name": "Dana Cruz", "email": "dana@agency.test", "phone": null},
        }))
        .unwrap();
        assert_eq!(listing.bedrooms, Some(3.0));
        assert_eq!(listing.bathrooms, Some(2.5));
        assert_eq!(listing.sqft, Some(1820));
        assert_eq!(listing.longitude, Some(-97.7));
        assert_eq!(listing.agent_name.as_deref(), Some("Dana Cruz"));
        assert_eq!(listing.agent_email.as_deref(), Some("dana@agency.test"));
    }

    #[test]
    fn malformed_records_are_dropped() {
        let listings = normalize_listings(json!([
            {"id": "ok", "formattedAddress": "3 Main St"},
            {"id": 17, "formattedAddress": "4 Main St"},
            {"id": "no-address"},
            "not an object",
        ]))
        .unwrap();
        assert_eq!(listings.len(), 1);
        assert_eq!(listings[0].listing_id, "ok");

        assert_eq!(
            normalize_property(json!({"formattedAddress": "x"})).unwrap_err(),
            RejectReason::MissingId
        );
        assert!(matches!(
            normalize_listings(json!({"error": "quota"})),
            Err(ProviderError::Decode(_))
        ));
    }

    #[test]
    fn listing_urls_follow_platform_preference() {
        let address = "123 Main St, Austin, TX 78701";
        assert_eq!(
            build_listing_url(address, Some(PlatformPreference::Redfin)),
            "https://www.redfin.com/search?location=123+Main+St%2C+Austin%2C+TX+78701"
        );
        assert_eq!(
            build_listing_url(address, Some(PlatformPreference::Realtor)),
            "https://www.realtor.com/realestateandhomes-search/search?query=123+Main+St%2C+Austin%2C+TX+78701"
        );
        let zillow = "https://www.zillow.com/homes/123-Main-St,-Austin,-TX-78701_rb/";
        assert_eq!(build_listing_url(address, Some(PlatformPreference::Zillow)), zillow);
        assert_eq!(build_listing_url(address, None), zillow);
        assert_eq!(
            build_listing_url(address, Some(PlatformPreference::Unrecognized)),
            zillow
        );
    }

    #[test]
    fn building_urls_leaves_the_shared_bases_untouched() {
        for preference in [
            None,
            Some(PlatformPreference::Redfin),
            Some(PlatformPreference::Realtor),
        ] {
            build_listing_url("1 Congress Ave", preference);
            build_listing_url("2 Lamar Blvd", preference);
        }
        assert_eq!(ZILLOW_HOMES_URL.as_str(), "https://www.zillow.com/homes/");
        assert_eq!(REDFIN_SEARCH_URL.as_str(), "https://www.redfin.com/search");
        assert_eq!(REDFIN_SEARCH_URL.query(), None);
        assert_eq!(
            REALTOR_SEARCH_URL.as_str(),
            "https://www.realtor.com/realestateandhomes-search/search"
        );
        assert_eq!(
            build_listing_url("2 Lamar Blvd", Some(PlatformPreference::Redfin)),
            "https://www.redfin.com/search?location=2+Lamar+Blvd"
        );
    }

    #[test]
    fn listing_urls_are_encoded_and_deterministic_for_awkward_addresses() {
        let addresses = [
            "12 Elm St #4B, Austin, TX",
            "7/9 Rue de l'Été, Montréal",
            "100 Main St?ref=1&x=%20",
            "  padded  address ",
            "",
        ];
        let preferences = [
            None,
            Some(PlatformPreference::Zillow),
            Some(PlatformPreference::Redfin),
            Some(PlatformPreference::Realtor),
            Some(PlatformPreference::Unrecognized),
        ];
        for address in addresses {
            for preference in preferences {
                let built = build_listing_url(address, preference);
                assert_eq!(built, build_listing_url(address, preference));
                assert!(!built.contains(' '), "{built}");

                let parsed = Url::parse(&built).unwrap();
                assert_eq!(parsed.fragment(), None, "{built}");
                match preference {
                    Some(PlatformPreference::Redfin) | Some(PlatformPreference::Realtor) => {
                        let decoded: Vec<_> = parsed.query_pairs().collect();
                        assert_eq!(decoded.len(), 1);
                        assert_eq!(decoded[0].1, address);
                    }
                    _ => {
                        assert_eq!(parsed.query(), None, "{built}");
                        assert_eq!(parsed.path_segments().unwrap().count(), 3, "{built}");
                    }
                }
            }
        }
    }

    async fn serve_once(response: String) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}/v1", listener.local_addr().unwrap());
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
            }
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
            String::from_utf8_lossy(&request).to_string()
        });
        (base, handle)
    }

    fn http_response(status_line: &str, body: &str) -> String {
        format!(
            "HTTP/1.1 {status_line}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
            body.len()
        )
    }

    #[tokio::test]
    async fn search_sends_key_and_normalizes_response() {
        let body = json!([
            {"id": "L1", "formattedAddress": "1 Congress Ave", "price": 450000},
            {"formattedAddress": "no id"},
        ])
        .to_string();
        let (base, server) = serve_once(http_response("200 OK", &body)).await;
        let source = RentcastSource::new(ProviderConfig {
            base_url: base,
            ..ProviderConfig::rentcast("secret-key")
        })
        .unwrap();

        let listings = source
            .search_listings(&SearchCriteria {
                city: Some("Austin".into()),
                state: Some("TX".into()),
                max_price: Some(500_000),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(listings.len(), 1);
        assert_eq!(listings[0].listing_id, "L1");

        let request = server.await.unwrap().to_ascii_lowercase();
        assert!(request.starts_with(
            "get /v1/listings/sale?city=austin&state=tx&pricemax=500000&limit=50&status=active "
        ));
        assert!(request.contains("x-api-key: secret-key"));
    }

    #[tokio::test]
    async fn provider_http_failure_is_typed() {
        let (base, server) =
            serve_once(http_response("503 Service Unavailable", "{}")).await;
        let source = RentcastSource::new(ProviderConfig {
            base_url: base,
            ..ProviderConfig::rentcast("k")
        })
        .unwrap();

        let err = source
            .search_listings(&SearchCriteria::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::HttpStatus { status: 503, .. }));
        server.await.unwrap();
    }
}
