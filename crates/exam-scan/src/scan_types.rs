use std::collections::HashMap;

use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Cookie names that must be present for a session to be usable.
pub const MANDATORY_COOKIES: [&str; 3] = ["cf_clearance", "mod_auth_openidc_session", "__cf_bm"];

/// How long a persisted session stays usable before a fresh login is required.
pub const SESSION_TTL_MS: i64 = 2 * 60 * 60 * 1000;

/// Exam groups offered by the portal.
pub const ALL_PERMIS_TYPES: [&str; 2] = ["A", "B"];

/// Raw cookie jar contents as captured from the browser after login.
pub type CookieMap = HashMap<String, String>;

/// Custom error type for watcher operations
#[derive(thiserror::Error, Debug)]
pub enum WatchError {
    /// Configuration error (missing credential or key)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Browser automation error
    #[error("Browser error: {0}")]
    Browser(String),

    /// Captcha solving service error
    #[error("Captcha solver error: {0}")]
    Solver(String),

    /// Booking API error
    #[error("API error: {0}")]
    Api(String),

    /// The booking API rejected the session cookies
    #[error("Session rejected with HTTP {0}")]
    SessionRejected(u16),

    /// Data format error
    #[error("Data format error: {0}")]
    DataFormat(String),

    /// File I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Session cookies captured after a successful portal login.
///
/// The three mandatory cookies authenticate API calls; the rest are carried
/// along verbatim. A record is never mutated in place, only replaced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionCredentials {
    /// Cloudflare clearance cookie
    pub cf_clearance: String,

    /// Keycloak OIDC session cookie
    pub mod_auth_openidc_session: String,

    /// Cloudflare bot-management cookie
    #[serde(rename = "__cf_bm")]
    pub cf_bm: String,

    /// Portal tracking cookie, not always issued
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etuix: Option<String>,

    /// Analytics cookie, not always issued
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eulerian: Option<i64>,

    /// Analytics cookie, not always issued
    #[serde(rename = "TCPID", skip_serializing_if = "Option::is_none")]
    pub tcpid: Option<i64>,

    /// Capture time in Unix milliseconds
    pub timestamp: i64,
}

impl SessionCredentials {
    /// Build a record from raw browser cookies, stamped with the current time.
    ///
    /// Returns `None` when any mandatory cookie is missing; an incomplete set
    /// must never be persisted or used to authenticate.
    pub fn from_cookie_map(cookies: &CookieMap) -> Option<Self> {
        Some(Self {
            cf_clearance: cookies.get("cf_clearance")?.clone(),
            mod_auth_openidc_session: cookies.get("mod_auth_openidc_session")?.clone(),
            cf_bm: cookies.get("__cf_bm")?.clone(),
            etuix: cookies.get("etuix").cloned(),
            eulerian: cookies.get("eulerian").and_then(|v| v.parse().ok()),
            tcpid: cookies.get("TCPID").and_then(|v| v.parse().ok()),
            timestamp: Utc::now().timestamp_millis(),
        })
    }

    /// Age of the record in milliseconds.
    pub fn age_ms(&self) -> i64 {
        Utc::now().timestamp_millis() - self.timestamp
    }

    /// Whether the record is still within the freshness TTL.
    pub fn is_fresh(&self) -> bool {
        self.age_ms() < SESSION_TTL_MS
    }

    /// Cookie header value for authenticated API calls.
    pub fn cookie_header(&self) -> String {
        let mut parts = vec![
            format!("cf_clearance={}", self.cf_clearance),
            format!("mod_auth_openidc_session={}", self.mod_auth_openidc_session),
            format!("__cf_bm={}", self.cf_bm),
        ];

        if let Some(ref etuix) = self.etuix {
            parts.push(format!("etuix={}", etuix));
        }

        parts.join("; ")
    }
}

/// An exam centre as returned by the centre-search endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Centre {
    /// Centre identifier
    pub id: String,
    /// Display name
    pub nom: String,
    /// Administrative code of the département
    #[serde(default)]
    pub code_departement: String,
    /// Street address
    #[serde(default)]
    pub adresse: String,
    /// Postal code
    #[serde(default)]
    pub code_postal: String,
    /// City name
    #[serde(default)]
    pub ville: String,
    /// Whether the centre is closed; closed centres are never scanned
    #[serde(default)]
    pub est_ferme: bool,
}

/// One item of the planning-search response.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanningItem {
    /// Nested slot payload; items without it are skipped during normalization
    pub creneau_du_planning: Option<Creneau>,
}

/// Raw schedule slot inside a planning item.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Creneau {
    /// Slot start, ISO timestamp
    pub date_heure_debut: String,
    /// Slot end, ISO timestamp
    pub date_heure_fin: String,
    /// Reservation status; absent means available
    pub statut_de_reservation: Option<String>,
    /// Centre the slot belongs to
    pub centre: Option<CreneauCentre>,
    /// Exam group of the slot
    pub groupe_permis: Option<String>,
    /// Practical exam sub-type
    pub type_epreuve_pratique: Option<String>,
    /// Examiner id
    pub numero_inspecteur: Option<String>,
}

/// Centre reference embedded in a schedule slot.
#[derive(Debug, Clone, Deserialize)]
pub struct CreneauCentre {
    /// Centre identifier
    pub id: Option<String>,
    /// Centre display name
    pub nom: Option<String>,
}

/// A normalized, available exam slot.
///
/// Serialized with the portal's French field names so the snapshot file
/// matches what downstream consumers already expect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExamSlot {
    /// Calendar day of the slot
    pub date: NaiveDate,
    /// Time range, "HH:MM-HH:MM"
    pub horaire: String,
    /// Département code the slot was found under
    pub departement: String,
    /// Centre display name
    pub centre: String,
    /// Centre identifier
    pub centre_id: String,
    /// City, when known from the centre lookup
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ville: Option<String>,
    /// Exam group
    pub permis_type: String,
    /// Practical exam sub-type
    pub type_epreuve: String,
    /// Examiner id, may be empty
    pub numero_inspecteur: String,
    /// Always true for normalized slots
    pub disponible: bool,
    /// Raw reservation status as reported by the API
    pub statut_reservation: String,
}

/// Result of one full scan over the filter grid.
///
/// `AuthFailure` is a sentinel distinct from "zero results": it means the
/// session was rejected mid-scan and the caller must re-authenticate.
#[derive(Debug, Clone, PartialEq)]
pub enum ScanOutcome {
    /// Scan completed; available slots found (possibly none)
    Slots(Vec<ExamSlot>),
    /// The session was rejected during the scan; partial results discarded
    AuthFailure,
}

/// Whether a raw reservation status counts as available.
///
/// Absent status, "DISPONIBLE" and "NON_RÉSERVÉ" are the only markers kept;
/// everything else is dropped during normalization.
pub fn is_available_status(status: Option<&str>) -> bool {
    match status {
        None => true,
        Some(s) => s == "DISPONIBLE" || s == "NON_RÉSERVÉ",
    }
}

/// All metropolitan département codes plus the overseas territories.
pub fn all_departements() -> Vec<String> {
    let mut codes: Vec<String> = (1..=95).map(|n| format!("{:03}", n)).collect();
    for overseas in ["971", "972", "973", "974", "976"] {
        codes.push(overseas.to_string());
    }
    codes
}

/// The configured scan grid: permis types × départements.
#[derive(Debug, Clone)]
pub struct ScanFilters {
    /// Exam groups to scan
    pub permis_types: Vec<String>,
    /// Département codes to scan
    pub departements: Vec<String>,
    /// Scan every centre in a cell instead of only the first open one
    pub scan_par_centre: bool,
}

impl Default for ScanFilters {
    fn default() -> Self {
        Self {
            permis_types: ALL_PERMIS_TYPES.iter().map(|s| s.to_string()).collect(),
            departements: vec!["075".to_string()],
            scan_par_centre: false,
        }
    }
}

impl ScanFilters {
    /// Enumerate the full filter grid in fixed order.
    pub fn cells(&self) -> impl Iterator<Item = (&str, &str)> {
        self.permis_types.iter().flat_map(move |permis| {
            self.departements
                .iter()
                .map(move |dept| (permis.as_str(), dept.as_str()))
        })
    }
}
