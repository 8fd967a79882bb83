//! Electricity consumption client (SER customer portal)
//!
//! Authenticates with an OAuth authorization-code flow protected by PKCE,
//! then reads the per-tariff consumption history of the customer's service
//! point. The portal publishes yesterday's totals some time after the early
//! morning cutoff, so responses follow a [`PublicationCutoff`].

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Datelike, Duration, Months, NaiveDate, SecondsFormat, Utc};
use chrono_tz::Tz;
use rand::RngCore;
use reqwest::header::{AUTHORIZATION, COOKIE};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::http::{HttpClient, UpstreamError};
use super::source::{FetchError, Source};
use super::Response;
use crate::clock::SharedClock;
use crate::freshness::{local_day_start, FreshnessPolicy, PublicationCutoff};

/// Retry interval while yesterday's totals are missing
const RETRY_TTL_MINUTES: i64 = 60;

/// Tokens are renewed when fewer than this many minutes remain
const TOKEN_MARGIN_MINUTES: i64 = 5;

/// Number of daily totals kept
const MAX_DAYS: usize = 14;

/// Number of monthly totals kept
const MAX_MONTHS: usize = 2;

/// Tariff periods reported to clients
const TARIFFS: [&str; 8] = ["HC", "HP", "BCHC", "BCHP", "BUHC", "BUHP", "RHC", "RHP"];

/// Session cookie set by the login form
const SESSION_COOKIE: &str = "cookieOauth";

/// Consumption of one day or month, in kWh per tariff period
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Consumption {
    /// `YYYY-MM-DD` for days, `YYYY-MM` for months
    pub date: String,
    /// Rounded totals keyed by tariff; zero totals are left out
    #[serde(flatten)]
    pub values: BTreeMap<String, i64>,
}

/// Recent daily and monthly consumption
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ElectricityData {
    /// Last days, oldest first
    pub days: Vec<Consumption>,
    /// Last months, oldest first
    pub months: Vec<Consumption>,
}

/// Settings for the electricity source
#[derive(Debug, Clone)]
pub struct ElectricityConfig {
    /// Portal base URL
    pub api_url: Option<String>,
    /// OAuth client identifier, also part of the history endpoint path
    pub client_id: Option<String>,
    /// Portal account
    pub username: Option<String>,
    /// Portal password
    pub password: Option<String>,
    /// Local hour from which yesterday's totals may be published
    pub cutoff_hour: u32,
    /// Timezone of the portal's calendar days
    pub timezone: Tz,
}

/// Account credentials, only complete settings make it this far
#[derive(Debug, Clone)]
struct Credentials {
    api_url: String,
    client_id: String,
    username: String,
    password: String,
}

/// Authenticated state reused between fetches
#[derive(Debug, Default)]
struct Session {
    /// `Authorization` header value, token type included
    access_token: Option<String>,
    token_expiry: Option<DateTime<Utc>>,
    service_point: Option<String>,
}

/// Source for the customer's electricity consumption
pub struct ElectricitySource {
    http: HttpClient,
    clock: SharedClock,
    credentials: Option<Credentials>,
    timezone: Tz,
    freshness: PublicationCutoff<ElectricityData>,
    /// Serializes the handshake so concurrent fetches never log in twice
    session: Mutex<Session>,
}

/// Whether the latest daily total covers yesterday
fn yesterday_published(data: &ElectricityData, today: NaiveDate) -> bool {
    let Some(yesterday) = today.pred_opt() else {
        return false;
    };
    let yesterday = yesterday.format("%Y-%m-%d").to_string();
    data.days
        .last()
        .is_some_and(|day| day.date.as_str() >= yesterday.as_str())
}

impl ElectricitySource {
    /// Creates the source from its settings
    ///
    /// Returns `None` if the cutoff hour is outside `0..24`.
    pub fn new(config: ElectricityConfig, http: HttpClient, clock: SharedClock) -> Option<Self> {
        let freshness = PublicationCutoff::at_hours(
            config.timezone,
            config.cutoff_hour,
            None,
            Duration::minutes(RETRY_TTL_MINUTES),
            yesterday_published,
        )?;
        let credentials = match (
            config.api_url,
            config.client_id,
            config.username,
            config.password,
        ) {
            (Some(api_url), Some(client_id), Some(username), Some(password)) => Some(Credentials {
                api_url,
                client_id,
                username,
                password,
            }),
            _ => None,
        };
        Some(Self {
            http,
            clock,
            credentials,
            timezone: config.timezone,
            freshness,
            session: Mutex::new(Session::default()),
        })
    }

    /// Makes sure the session holds a usable token and service point
    ///
    /// # Returns
    /// * `Ok((token, service_point))` ready for the history request
    /// * `Err(FetchError::Auth)` naming the handshake step that failed
    async fn ensure_session(&self, creds: &Credentials) -> Result<(String, String), FetchError> {
        let mut session = self.session.lock().await;
        let now = self.clock.now();

        let token_valid = session
            .token_expiry
            .is_some_and(|expiry| now + Duration::minutes(TOKEN_MARGIN_MINUTES) < expiry);
        let cached = session.access_token.clone().filter(|_| token_valid);
        let token = match cached {
            Some(token) => token,
            None => {
                info!(source = "electricity", "authenticating");
                let (verifier, challenge) = generate_pkce();

                let cookie = self.login(creds).await.map_err(auth("login"))?;
                let code = self
                    .authorize(creds, &cookie, &challenge)
                    .await
                    .map_err(auth("authorize"))?;
                let (token, expires_in) = self
                    .exchange_token(creds, &code, &verifier)
                    .await
                    .map_err(auth("token"))?;

                info!(
                    source = "electricity",
                    expires_in_minutes = expires_in / 60,
                    "authenticated"
                );
                session.access_token = Some(token.clone());
                session.token_expiry = Some(now + Duration::seconds(expires_in.max(0)));
                token
            }
        };

        let service_point = match session.service_point.clone() {
            Some(id) => id,
            None => {
                let id = self
                    .fetch_service_point(creds, &token)
                    .await
                    .map_err(auth("service point"))?;
                session.service_point = Some(id.clone());
                id
            }
        };

        Ok((token, service_point))
    }

    /// Submits the login form and returns the session cookie
    async fn login(&self, creds: &Credentials) -> Result<String, UpstreamError> {
        #[derive(Deserialize)]
        struct LoginResponse {
            #[serde(default)]
            code: String,
            #[serde(default)]
            libelle: String,
        }

        let request = self
            .http
            .post(&format!("{}/auth/externe/authentification", creds.api_url))
            .form(&[
                ("username", creds.username.as_str()),
                ("password", creds.password.as_str()),
                ("client_id", creds.client_id.as_str()),
            ]);
        let reply = self.http.execute(request, None).await?;
        let body: LoginResponse = reply.json()?;
        if body.code != "0" {
            return Err(UpstreamError::Api(body.libelle));
        }

        reply
            .cookie(SESSION_COOKIE)
            .ok_or_else(|| UpstreamError::Api("no session cookie".to_string()))
    }

    /// Requests an authorization code, read from the redirect target
    async fn authorize(
        &self,
        creds: &Credentials,
        cookie: &str,
        challenge: &str,
    ) -> Result<String, UpstreamError> {
        let endpoint = format!("{}/auth/authorize-internet", creds.api_url);
        let request = self
            .http
            .get_no_redirect(&endpoint)
            .query(&[
                ("response_type", "code"),
                ("code_challenge", challenge),
                ("code_challenge_method", "S256"),
                ("client_id", creds.client_id.as_str()),
            ])
            .header(COOKIE, format!("{}={}", SESSION_COOKIE, cookie));
        let location = self.http.redirect_location(request).await?;

        let target = Url::parse(&endpoint)
            .and_then(|base| base.join(&location))
            .map_err(|e| UpstreamError::Api(format!("parse redirect: {}", e)))?;
        target
            .query_pairs()
            .find(|(key, _)| key == "code")
            .map(|(_, code)| code.into_owned())
            .filter(|code| !code.is_empty())
            .ok_or_else(|| UpstreamError::Api("no authorization code".to_string()))
    }

    /// Exchanges the code for an access token and its lifetime in seconds
    async fn exchange_token(
        &self,
        creds: &Credentials,
        code: &str,
        verifier: &str,
    ) -> Result<(String, i64), UpstreamError> {
        #[derive(Deserialize)]
        struct TokenResponse {
            #[serde(default)]
            access_token: String,
            #[serde(default)]
            token_type: String,
            #[serde(default)]
            expires_in: i64,
            #[serde(default)]
            error: String,
        }

        let request = self
            .http
            .post(&format!("{}/auth/tokenUtilisateurInternet", creds.api_url))
            .form(&[
                ("client_id", creds.client_id.as_str()),
                ("code", code),
                ("grant_type", "authorization_code"),
                ("code_verifier", verifier),
            ]);
        let body: TokenResponse = self.http.execute_json(request, None).await?;
        if !body.error.is_empty() {
            return Err(UpstreamError::Api(body.error));
        }
        if body.access_token.is_empty() {
            return Err(UpstreamError::Api("no access token".to_string()));
        }

        Ok((
            format!("{} {}", body.token_type, body.access_token),
            body.expires_in,
        ))
    }

    /// Looks up the id of the customer's first service point
    async fn fetch_service_point(
        &self,
        creds: &Credentials,
        token: &str,
    ) -> Result<String, UpstreamError> {
        #[derive(Deserialize)]
        struct ServicePoint {
            id: String,
            #[serde(rename = "pointDeService", default)]
            point_de_service: Option<PointDeService>,
        }

        #[derive(Deserialize)]
        struct PointDeService {
            #[serde(default)]
            reference: String,
        }

        let request = self
            .http
            .get(&format!(
                "{}/rest/produits/pointsAccesServicesClient",
                creds.api_url
            ))
            .query(&[("expand", "pointDeService")])
            .header(AUTHORIZATION, token);
        let points: Vec<ServicePoint> = self.http.execute_json(request, None).await?;

        let first = points
            .into_iter()
            .next()
            .ok_or_else(|| UpstreamError::Api("no service point found".to_string()))?;
        info!(
            source = "electricity",
            reference = first
                .point_de_service
                .as_ref()
                .map(|p| p.reference.as_str())
                .unwrap_or_default(),
            "service point found"
        );
        Ok(first.id)
    }

    /// Fetches the consumption history and reduces it to recent totals
    async fn fetch_consumption(&self, creds: &Credentials) -> Result<ElectricityData, FetchError> {
        let (token, service_point) = self.ensure_session(creds).await?;

        let today = self.clock.now().with_timezone(&self.timezone).date_naive();
        let (start, end) = history_window(today);
        let payload = serde_json::json!({
            "typeObjet": "DonneesHistoriqueMesureRepresentation",
            "dateDebut": local_day_start(self.timezone, start).to_rfc3339_opts(SecondsFormat::Secs, true),
            "dateFin": local_day_start(self.timezone, end).to_rfc3339_opts(SecondsFormat::Secs, true),
            "pointAccesServicesClient": {
                "typeObjet": "produit.PointAccesServicesClient",
                "id": service_point,
            },
            "groupesDeGrandeurs": [
                {"typeObjet": "produit.GroupeGrandeur", "codeGroupeGrandeur": {"code": "3"}}
            ],
        });

        let request = self
            .http
            .post(&format!(
                "{}/rest/interfaces/{}/historiqueDeMesure",
                creds.api_url,
                creds.client_id.to_lowercase()
            ))
            .header(AUTHORIZATION, token)
            .json(&payload);
        let history: History = self
            .http
            .execute_json(request, Some(ser_error))
            .await?;

        if history.periodes_activite.is_empty() {
            return Err(FetchError::NoData("no contract data".to_string()));
        }
        Ok(summarize(&history.periodes_activite))
    }
}

/// Wraps a handshake failure with the step it happened in
fn auth(step: &'static str) -> impl Fn(UpstreamError) -> FetchError {
    move |source| FetchError::Auth { step, source }
}

/// Creates a PKCE verifier and its S256 challenge
fn generate_pkce() -> (String, String) {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    let verifier = URL_SAFE_NO_PAD.encode(bytes);
    let challenge = URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()));
    (verifier, challenge)
}

/// First and last (exclusive) day of the history request
///
/// Starts on the last day of the month three months back, so both full
/// monthly totals are covered, and ends tomorrow so today is included.
fn history_window(today: NaiveDate) -> (NaiveDate, NaiveDate) {
    let start = today
        .with_day(1)
        .and_then(|first| first.checked_sub_months(Months::new(2)))
        .and_then(|first| first.pred_opt())
        .unwrap_or(today);
    let end = today.succ_opt().unwrap_or(today);
    (start, end)
}

/// Extracts `messagesInformatifs` from a portal response body
fn ser_error(body: &[u8]) -> Option<String> {
    #[derive(Deserialize)]
    struct Messages {
        #[serde(rename = "messagesInformatifs", default)]
        messages: Vec<String>,
    }

    let body: Messages = serde_json::from_slice(body).ok()?;
    (!body.messages.is_empty()).then(|| body.messages.join("; "))
}

/// Consumption history response
#[derive(Debug, Deserialize)]
struct History {
    #[serde(rename = "periodesActivite", default)]
    periodes_activite: Vec<Period>,
}

#[derive(Debug, Deserialize)]
struct Period {
    #[serde(rename = "blocFournisseur", default)]
    bloc_fournisseur: SupplierBlock,
}

#[derive(Debug, Default, Deserialize)]
struct SupplierBlock {
    #[serde(rename = "postesHorosaisonnier", default)]
    postes: Vec<TariffPeriod>,
}

#[derive(Debug, Deserialize)]
struct TariffPeriod {
    #[serde(default)]
    etiquette: Label,
    #[serde(rename = "consommationsJournalieres", default)]
    daily: Vec<DailyValue>,
    #[serde(rename = "consommationsMensuelles", default)]
    monthly: Vec<MonthlyValue>,
}

#[derive(Debug, Default, Deserialize)]
struct Label {
    #[serde(default)]
    mnemo: String,
}

#[derive(Debug, Deserialize)]
struct DailyValue {
    /// `dd/mm/yyyy`
    date: String,
    consommation: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct MonthlyValue {
    annee: i32,
    mois: u32,
    #[serde(default)]
    consommation: f64,
}

/// Groups raw values by date and tariff, keeping the most recent entries
fn summarize(periods: &[Period]) -> ElectricityData {
    let mut daily: BTreeMap<String, BTreeMap<String, f64>> = BTreeMap::new();
    let mut monthly: BTreeMap<String, BTreeMap<String, f64>> = BTreeMap::new();

    for poste in periods.iter().flat_map(|p| &p.bloc_fournisseur.postes) {
        let tariff = &poste.etiquette.mnemo;
        if tariff.is_empty() {
            continue;
        }

        for value in &poste.daily {
            let (Some(kwh), Some(date)) = (value.consommation, iso_date(&value.date)) else {
                continue;
            };
            daily.entry(date).or_default().insert(tariff.clone(), kwh);
        }

        for value in &poste.monthly {
            let month = format!("{}-{:02}", value.annee, value.mois);
            monthly
                .entry(month)
                .or_default()
                .insert(tariff.clone(), value.consommation);
        }
    }

    ElectricityData {
        days: latest(daily, MAX_DAYS),
        months: latest(monthly, MAX_MONTHS),
    }
}

/// Converts `dd/mm/yyyy` to `yyyy-mm-dd`
fn iso_date(date: &str) -> Option<String> {
    let mut parts = date.split('/');
    let (Some(day), Some(month), Some(year), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return None;
    };
    Some(format!("{}-{}-{}", year, month, day))
}

/// Keeps the `limit` most recent dates, rounding values and dropping zeros
fn latest(by_date: BTreeMap<String, BTreeMap<String, f64>>, limit: usize) -> Vec<Consumption> {
    let skip = by_date.len().saturating_sub(limit);
    by_date
        .into_iter()
        .skip(skip)
        .map(|(date, tariffs)| Consumption {
            date,
            values: tariffs
                .into_iter()
                .filter(|(tariff, _)| TARIFFS.contains(&tariff.as_str()))
                .map(|(tariff, kwh)| (tariff, (kwh + 0.5) as i64))
                .filter(|(_, kwh)| *kwh != 0)
                .collect(),
        })
        .collect()
}

#[async_trait]
impl Source for ElectricitySource {
    fn name(&self) -> &str {
        "electricity"
    }

    fn degraded_ttl(&self) -> Duration {
        Duration::hours(48)
    }

    async fn fetch(&self) -> Response {
        let Some(creds) = self.credentials.as_ref() else {
            return FetchError::not_configured(self.name()).into_response(self.clock.now());
        };

        match self.fetch_consumption(creds).await {
            Ok(data) => {
                let now = self.clock.now();
                let today = now.with_timezone(&self.timezone).date_naive();
                if yesterday_published(&data, today) {
                    info!(source = "electricity", "yesterday's totals available");
                }
                let expires_at = self.freshness.expires_at(now, &data);
                Response::success_until(data, now, expires_at)
            }
            Err(e) => {
                warn!(source = "electricity", error = %e, "fetch failed");
                e.into_response(self.clock.now())
            }
        }
    }
}
