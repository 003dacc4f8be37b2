use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::Client;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::scan_types::{Centre, PlanningItem, SessionCredentials, WatchError};

const CENTRES_ENDPOINT: &str = "/api/v2/auto-ecole/centres/recherche";
const PLANNING_ENDPOINT: &str = "/api/v2/auto-ecole/planning/recherche";

/// Authenticated access to the portal's booking API.
#[async_trait]
pub trait BookingApi: Send + Sync {
    /// List open exam centres for one (permis, département) filter cell.
    async fn list_centres(
        &self,
        session: &SessionCredentials,
        permis: &str,
        departement: &str,
    ) -> Result<Vec<Centre>, WatchError>;

    /// List schedule slots for a centre from the given date.
    async fn list_planning(
        &self,
        session: &SessionCredentials,
        permis: &str,
        centre_id: &str,
        date: NaiveDate,
    ) -> Result<Vec<PlanningItem>, WatchError>;
}

/// reqwest-backed client for the booking API.
pub struct BookingClient {
    client: Client,
    base_url: String,
}

impl BookingClient {
    /// Create a client against the production portal.
    pub fn new() -> Result<Self, WatchError> {
        Self::with_base_url("https://pro.permisdeconduire.gouv.fr".to_string())
    }

    /// Create a client against an arbitrary base URL.
    pub fn with_base_url(base_url: String) -> Result<Self, WatchError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| WatchError::Api(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { client, base_url })
    }

    /// POST a filter body with session cookies and the browser-mimicking
    /// header set the portal expects from its own frontend.
    async fn post_api(
        &self,
        session: &SessionCredentials,
        endpoint: &str,
        body: Value,
    ) -> Result<Value, WatchError> {
        let url = format!("{}{}", self.base_url, endpoint);

        let response = self
            .client
            .post(&url)
            .header("accept", "application/json, text/plain, */*")
            .header("accept-language", "fr-FR,fr;q=0.9,en-US;q=0.8,en;q=0.7")
            .header("cookie", session.cookie_header())
            .header("origin", &self.base_url)
            .header("referer", format!("{}/reserver-examen", self.base_url))
            .header(
                "sec-ch-ua",
                "\"Chromium\";v=\"142\", \"Google Chrome\";v=\"142\", \"Not_A Brand\";v=\"99\"",
            )
            .header("sec-ch-ua-mobile", "?0")
            .header("sec-ch-ua-platform", "\"Windows\"")
            .header("sec-fetch-dest", "empty")
            .header("sec-fetch-mode", "cors")
            .header("sec-fetch-site", "same-origin")
            .header(
                "user-agent",
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                 (KHTML, like Gecko) Chrome/142.0.0.0 Safari/537.36",
            )
            .json(&body)
            .send()
            .await
            .map_err(|e| WatchError::Api(format!("Request to {} failed: {}", endpoint, e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let preview: String = body.chars().take(200).collect();

            return match status.as_u16() {
                code @ (400 | 401 | 403) => {
                    warn!(
                        "HTTP {} on {} - session cookies look invalid: {}",
                        code, endpoint, preview
                    );
                    Err(WatchError::SessionRejected(code))
                }
                code => {
                    warn!("HTTP {} on {}: {}", code, endpoint, preview);
                    Err(WatchError::Api(format!("HTTP {} on {}", code, endpoint)))
                }
            };
        }

        response
            .json()
            .await
            .map_err(|e| WatchError::Api(format!("Failed to parse {} response: {}", endpoint, e)))
    }
}

/// Deserialize a centre-search response, dropping closed centres. Anything
/// that is not a JSON array yields an empty list.
fn parse_centres(value: Value) -> Vec<Centre> {
    if !value.is_array() {
        warn!("Centre search returned a non-array payload");
        return Vec::new();
    }

    match serde_json::from_value::<Vec<Centre>>(value) {
        Ok(centres) => centres.into_iter().filter(|c| !c.est_ferme).collect(),
        Err(e) => {
            warn!("Centre list did not match the expected shape: {}", e);
            Vec::new()
        }
    }
}

/// Deserialize a planning-search response; non-array payloads yield an empty
/// list.
fn parse_planning(value: Value) -> Vec<PlanningItem> {
    if !value.is_array() {
        warn!("Planning search returned a non-array payload");
        return Vec::new();
    }

    match serde_json::from_value::<Vec<PlanningItem>>(value) {
        Ok(items) => items,
        Err(e) => {
            warn!("Planning list did not match the expected shape: {}", e);
            Vec::new()
        }
    }
}

#[async_trait]
impl BookingApi for BookingClient {
    async fn list_centres(
        &self,
        session: &SessionCredentials,
        permis: &str,
        departement: &str,
    ) -> Result<Vec<Centre>, WatchError> {
        debug!("Fetching centres for permis {} dept {}", permis, departement);

        let body = json!({
            "filtre": {
                "codeDepartement": departement,
                "groupePermis": permis,
            }
        });

        let value = self.post_api(session, CENTRES_ENDPOINT, body).await?;
        Ok(parse_centres(value))
    }

    async fn list_planning(
        &self,
        session: &SessionCredentials,
        permis: &str,
        centre_id: &str,
        date: NaiveDate,
    ) -> Result<Vec<PlanningItem>, WatchError> {
        debug!("Fetching planning for centre {} from {}", centre_id, date);

        let body = json!({
            "filtre": {
                "date": date.format("%Y-%m-%d").to_string(),
                "groupePermis": permis,
                "centreId": centre_id,
            }
        });

        let value = self.post_api(session, PLANNING_ENDPOINT, body).await?;
        Ok(parse_planning(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_centres_are_dropped_on_parse() {
        let value = json!([
            {
                "id": "c1", "nom": "Centre Nord", "codeDepartement": "075",
                "adresse": "1 rue A", "codePostal": "75001", "ville": "Paris",
                "estFerme": false
            },
            {
                "id": "c2", "nom": "Centre Sud", "codeDepartement": "075",
                "adresse": "2 rue B", "codePostal": "75013", "ville": "Paris",
                "estFerme": true
            }
        ]);

        let centres = parse_centres(value);
        assert_eq!(centres.len(), 1);
        assert_eq!(centres[0].id, "c1");
    }

    #[test]
    fn non_array_payloads_become_empty_lists() {
        assert!(parse_centres(json!({"message": "maintenance"})).is_empty());
        assert!(parse_planning(json!("oops")).is_empty());
        assert!(parse_planning(json!(null)).is_empty());
    }

    #[test]
    fn planning_items_tolerate_missing_slot_payloads() {
        let value = json!([
            { "creneauDuPlanning": null },
            {
                "creneauDuPlanning": {
                    "dateHeureDebut": "2026-09-01T08:30:00",
                    "dateHeureFin": "2026-09-01T09:00:00",
                    "statutDeReservation": "DISPONIBLE",
                    "centre": { "id": "c1", "nom": "Centre Nord" }
                }
            }
        ]);

        let items = parse_planning(value);
        assert_eq!(items.len(), 2);
        assert!(items[0].creneau_du_planning.is_none());
        let creneau = items[1].creneau_du_planning.as_ref().unwrap();
        assert_eq!(creneau.statut_de_reservation.as_deref(), Some("DISPONIBLE"));
    }
}
