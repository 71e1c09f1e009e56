//! Best-effort IP region lookup over HTTP.
//!
//! Resolves a server's country code via ip-api.com and maps it to a continent
//! with a static table. The lookup is a collaborator of the poll loop, never
//! a dependency: any failure yields `None` and the server simply keeps empty
//! region fields.

use log::debug;
use serde::Deserialize;
use std::time::Duration;

const LOOKUP_URL: &str = "http://ip-api.com/json/";
const LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

const CONTINENTS: &[(&str, &[&str])] = &[
    (
        "EU",
        &[
            "AD", "AL", "AT", "AX", "BA", "BE", "BG", "BY", "CH", "CY", "CZ", "DE", "DK", "EE",
            "ES", "FI", "FO", "FR", "GB", "GG", "GI", "GR", "HR", "HU", "IE", "IM", "IS", "IT",
            "JE", "LI", "LT", "LU", "LV", "MC", "MD", "ME", "MK", "MT", "NL", "NO", "PL", "PT",
            "RO", "RS", "RU", "SE", "SI", "SJ", "SK", "SM", "UA", "VA", "XK",
        ],
    ),
    (
        "AS",
        &[
            "AE", "AF", "AM", "AZ", "BD", "BH", "BN", "BT", "CC", "CN", "CX", "GE", "HK", "ID",
            "IL", "IN", "IO", "IQ", "IR", "JO", "JP", "KG", "KH", "KP", "KR", "KW", "KZ", "LA",
            "LB", "LK", "MM", "MN", "MO", "MV", "MY", "NP", "OM", "PH", "PK", "PS", "QA", "SA",
            "SG", "SY", "TH", "TJ", "TM", "TR", "TW", "UZ", "VN", "YE",
        ],
    ),
    (
        "NA",
        &[
            "AG", "AI", "AW", "BB", "BL", "BM", "BQ", "BS", "BZ", "CA", "CR", "CU", "CW", "DM",
            "DO", "GD", "GL", "GP", "GT", "HN", "HT", "JM", "KN", "KY", "LC", "MF", "MQ", "MS",
            "MX", "NI", "PA", "PM", "PR", "SV", "SX", "TC", "TT", "US", "VC", "VG", "VI",
        ],
    ),
    (
        "AF",
        &[
            "AO", "BF", "BI", "BJ", "BW", "CD", "CF", "CG", "CI", "CM", "CV", "DJ", "DZ", "EG",
            "EH", "ER", "ET", "GA", "GH", "GM", "GN", "GQ", "GW", "KE", "KM", "LR", "LS", "LY",
            "MA", "MG", "ML", "MR", "MU", "MW", "MZ", "NA", "NE", "NG", "RE", "RW", "SC", "SD",
            "SH", "SL", "SN", "SO", "SS", "ST", "SZ", "TD", "TG", "TN", "TZ", "UG", "YT", "ZA",
            "ZM", "ZW",
        ],
    ),
    ("AN", &["AQ", "BV", "GS", "HM", "TF"]),
    (
        "SA",
        &[
            "AR", "BO", "BR", "CL", "CO", "EC", "FK", "GF", "GY", "PE", "PY", "SR", "UY", "VE",
        ],
    ),
    (
        "OC",
        &[
            "AS", "AU", "CK", "FJ", "FM", "GU", "KI", "MH", "MP", "NC", "NF", "NR", "NU", "NZ",
            "PF", "PG", "PN", "PW", "SB", "TK", "TL", "TO", "TV", "UM", "VU", "WF", "WS",
        ],
    ),
];

#[derive(Debug, Deserialize)]
struct LookupResponse {
    status: String,
    #[serde(rename = "countryCode", default)]
    country_code: Option<String>,
}

/// Region lookup client. Built disabled for tests and for deployments that
/// do not want the outbound HTTP dependency.
#[derive(Debug, Clone, Default)]
pub struct GeoClient {
    client: Option<reqwest::Client>,
}

impl GeoClient {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(LOOKUP_TIMEOUT)
            .build()
            .ok();
        Self { client }
    }

    /// A client that answers every lookup with `None`.
    pub fn disabled() -> Self {
        Self { client: None }
    }

    /// Resolves `(country code, continent code)` for an address. Any failure
    /// (disabled client, transport error, unknown country) yields `None`.
    pub async fn lookup(&self, ip: &str) -> Option<(String, String)> {
        let client = self.client.as_ref()?;
        let response: LookupResponse = client
            .get(format!("{}{}", LOOKUP_URL, ip))
            .send()
            .await
            .ok()?
            .json()
            .await
            .ok()?;

        if response.status != "success" {
            debug!("region lookup for {} failed: {}", ip, response.status);
            return None;
        }
        let country = response.country_code?;
        let continent = continent_of(&country).unwrap_or_default().to_string();
        Some((country, continent))
    }
}

fn continent_of(country: &str) -> Option<&'static str> {
    CONTINENTS
        .iter()
        .find(|(_, countries)| countries.contains(&country))
        .map(|(continent, _)| *continent)
}
