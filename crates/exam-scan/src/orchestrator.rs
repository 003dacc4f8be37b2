use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::booking_client::BookingApi;
use crate::scan_types::{
    Centre, ExamSlot, PlanningItem, ScanFilters, ScanOutcome, SessionCredentials, WatchError,
    is_available_status,
};

/// Delays between booking API requests; trades latency for staying under the
/// portal's rate-limiting heuristics.
#[derive(Debug, Clone)]
pub struct ScanPacing {
    /// Pause between per-centre planning requests (default: 300 ms)
    pub centre_delay: Duration,
    /// Pause between filter cells (default: 500 ms)
    pub cell_delay: Duration,
}

impl Default for ScanPacing {
    fn default() -> Self {
        Self {
            centre_delay: Duration::from_millis(300),
            cell_delay: Duration::from_millis(500),
        }
    }
}

/// Runs one full pass over the configured filter grid.
#[async_trait]
pub trait ScanRunner: Send + Sync {
    /// Scan every filter cell with the given session.
    async fn scan(&self, session: &SessionCredentials) -> Result<ScanOutcome, WatchError>;
}

/// Enumerates the (permis × département) grid, queries the booking API per
/// cell, and accumulates normalized available slots.
pub struct ScanOrchestrator {
    api: Arc<dyn BookingApi>,
    filters: ScanFilters,
    pacing: ScanPacing,
}

impl ScanOrchestrator {
    /// Create an orchestrator over the given API and filter grid.
    pub fn new(api: Arc<dyn BookingApi>, filters: ScanFilters, pacing: ScanPacing) -> Self {
        Self {
            api,
            filters,
            pacing,
        }
    }
}

#[async_trait]
impl ScanRunner for ScanOrchestrator {
    async fn scan(&self, session: &SessionCredentials) -> Result<ScanOutcome, WatchError> {
        info!(
            "Scanning {} permis type(s) x {} departement(s), mode: {}",
            self.filters.permis_types.len(),
            self.filters.departements.len(),
            if self.filters.scan_par_centre {
                "per centre"
            } else {
                "per departement"
            }
        );

        let today = Utc::now().date_naive();
        let mut all_slots = Vec::new();

        for (permis, dept) in self.filters.cells() {
            debug!("Cell: permis {} dept {}", permis, dept);

            let centres = match self.api.list_centres(session, permis, dept).await {
                Ok(centres) => centres,
                Err(e) => {
                    warn!("Centre fetch failed for {}/{}: {} - aborting scan", permis, dept, e);
                    return Ok(ScanOutcome::AuthFailure);
                }
            };

            let open_centres: Vec<&Centre> = centres.iter().filter(|c| !c.est_ferme).collect();
            if open_centres.is_empty() {
                debug!("No open centre for {}/{}", permis, dept);
                continue;
            }

            let lookup: HashMap<&str, &Centre> =
                open_centres.iter().map(|c| (c.id.as_str(), *c)).collect();

            // Per-centre mode scans every open centre; the default mode uses
            // the first open centre as a sample for the whole departement.
            let targets: &[&Centre] = if self.filters.scan_par_centre {
                &open_centres
            } else {
                &open_centres[..1]
            };

            for (i, centre) in targets.iter().enumerate() {
                if i > 0 {
                    sleep(self.pacing.centre_delay).await;
                }

                let items = match self
                    .api
                    .list_planning(session, permis, &centre.id, today)
                    .await
                {
                    Ok(items) => items,
                    Err(e) => {
                        warn!(
                            "Planning fetch failed for centre {}: {} - aborting scan",
                            centre.id, e
                        );
                        return Ok(ScanOutcome::AuthFailure);
                    }
                };

                let slots = normalize_planning(&items, permis, dept, &lookup);
                if !slots.is_empty() {
                    info!("{} available slot(s) at {}", slots.len(), centre.nom);
                }
                all_slots.extend(slots);
            }

            sleep(self.pacing.cell_delay).await;
        }

        info!("Scan complete: {} available slot(s)", all_slots.len());
        Ok(ScanOutcome::Slots(all_slots))
    }
}

/// Parse a portal timestamp, with or without an explicit offset.
fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.naive_local());
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S").ok()
}

/// Normalize raw planning items into available exam slots.
///
/// Items without the nested slot payload or with unparseable timestamps are
/// skipped individually; slots whose status is not an availability marker are
/// dropped. Centre display fields are enriched from the cell's lookup.
pub fn normalize_planning(
    items: &[PlanningItem],
    permis: &str,
    departement: &str,
    centres: &HashMap<&str, &Centre>,
) -> Vec<ExamSlot> {
    let mut slots = Vec::new();

    for item in items {
        let Some(creneau) = &item.creneau_du_planning else {
            continue;
        };

        if !is_available_status(creneau.statut_de_reservation.as_deref()) {
            continue;
        }

        let (Some(start), Some(end)) = (
            parse_timestamp(&creneau.date_heure_debut),
            parse_timestamp(&creneau.date_heure_fin),
        ) else {
            warn!(
                "Skipping slot with unparseable timestamps: {} / {}",
                creneau.date_heure_debut, creneau.date_heure_fin
            );
            continue;
        };

        let centre_id = creneau
            .centre
            .as_ref()
            .and_then(|c| c.id.clone())
            .unwrap_or_default();
        let centre_nom = creneau
            .centre
            .as_ref()
            .and_then(|c| c.nom.clone())
            .unwrap_or_else(|| "Centre inconnu".to_string());
        let ville = centres
            .get(centre_id.as_str())
            .map(|c| c.ville.clone())
            .filter(|v| !v.is_empty());

        slots.push(ExamSlot {
            date: start.date(),
            horaire: format!("{}-{}", start.format("%H:%M"), end.format("%H:%M")),
            departement: departement.to_string(),
            centre: centre_nom,
            centre_id,
            ville,
            permis_type: creneau
                .groupe_permis
                .clone()
                .unwrap_or_else(|| permis.to_string()),
            type_epreuve: creneau
                .type_epreuve_pratique
                .clone()
                .unwrap_or_else(|| "CIRCULATION".to_string()),
            numero_inspecteur: creneau.numero_inspecteur.clone().unwrap_or_default(),
            disponible: true,
            statut_reservation: creneau
                .statut_de_reservation
                .clone()
                .unwrap_or_else(|| "DISPONIBLE".to_string()),
        });
    }

    slots
}
