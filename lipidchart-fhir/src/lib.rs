//! FHIR record store and clinical extraction for the lipid chart engine.
//!
//! The store loads a bundle-of-bundles JSON collection once into a typed,
//! immutable resource model; every query afterwards is a pure read.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use lipidchart_core::{
    AssayCategory, Band, ChartError, Disorder, MeasurementPoint, MeasurementTable,
    MedicationEvent, MedicationTable, ReferenceBands, NO_INSTRUCTIONS,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One clinical record unit, tagged by `resourceType`. Unknown kinds are
/// retained as [`Resource::Other`] and stay inert.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "resourceType")]
pub enum Resource {
    Patient(Patient),
    Condition(Condition),
    Observation(Observation),
    MedicationOrder(MedicationOrder),
    MedicationDispense(MedicationDispense),
    MedicationAdministration(MedicationAdministration),
    #[serde(other)]
    Other,
}

/// Demographic resource; conventionally the first entry of a bundle.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Patient {
    pub id: Option<String>,
    pub birth_date: Option<String>,
    #[serde(default)]
    pub name: Vec<HumanName>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HumanName {
    #[serde(default)]
    pub given: Vec<String>,
    #[serde(default)]
    pub family: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CodeableConcept {
    pub text: Option<String>,
    #[serde(default)]
    pub coding: Vec<Coding>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Coding {
    pub code: Option<String>,
    pub display: Option<String>,
}

impl CodeableConcept {
    /// Display identity: free text preferred, else the first non-empty
    /// coding display.
    fn label(&self) -> Option<String> {
        if let Some(text) = self.text.as_deref() {
            if !text.trim().is_empty() {
                return Some(text.trim().to_string());
            }
        }
        self.coding.iter().find_map(|coding| {
            coding
                .display
                .as_deref()
                .map(str::trim)
                .filter(|display| !display.is_empty())
                .map(str::to_string)
        })
    }

    /// First coding that carries a code.
    fn first_code(&self) -> Option<&str> {
        self.coding.iter().find_map(|coding| coding.code.as_deref())
    }

    fn has_code_in(&self, codes: &[&str]) -> bool {
        self.coding
            .iter()
            .filter_map(|coding| coding.code.as_deref())
            .any(|code| codes.contains(&code))
    }

    /// Case-insensitive substring match over free text and every coding
    /// display.
    fn mentions(&self, needle: &str) -> bool {
        let matches = |text: &str| text.to_lowercase().contains(needle);
        self.text.as_deref().is_some_and(matches)
            || self
                .coding
                .iter()
                .filter_map(|coding| coding.display.as_deref())
                .any(matches)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Reference {
    pub reference: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(alias = "patient")]
    pub subject: Option<Reference>,
    pub code: Option<CodeableConcept>,
    pub onset_date_time: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Observation {
    #[serde(alias = "patient")]
    pub subject: Option<Reference>,
    pub code: Option<CodeableConcept>,
    pub effective_date_time: Option<String>,
    pub value_quantity: Option<Quantity>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Quantity {
    pub value: Option<f64>,
    pub unit: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MedicationOrder {
    #[serde(alias = "subject")]
    pub patient: Option<Reference>,
    pub status: Option<String>,
    pub date_written: Option<String>,
    #[serde(rename = "medicationCodeableConcept")]
    pub medication: Option<CodeableConcept>,
    #[serde(default)]
    pub dosage_instruction: Vec<DosageInstruction>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DosageInstruction {
    pub text: Option<String>,
    pub timing: Option<Timing>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Timing {
    pub repeat: Option<Repeat>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Repeat {
    pub bounds_period: Option<Period>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Period {
    pub start: Option<String>,
    pub end: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MedicationDispense {
    #[serde(rename = "medicationCodeableConcept")]
    pub medication: Option<CodeableConcept>,
    pub when_handed_over: Option<String>,
    #[serde(default)]
    pub dosage_instruction: Vec<DosageInstruction>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MedicationAdministration {
    #[serde(rename = "medicationCodeableConcept")]
    pub medication: Option<CodeableConcept>,
    pub effective_time_date_time: Option<String>,
}

/// All resources belonging to one patient.
#[derive(Debug)]
pub struct PatientBundle {
    id: String,
    patient: Patient,
    resources: Vec<Resource>,
}

impl PatientBundle {
    fn conditions(&self) -> impl Iterator<Item = &Condition> {
        self.resources.iter().filter_map(|resource| match resource {
            Resource::Condition(condition) => Some(condition),
            _ => None,
        })
    }

    fn observations(&self) -> impl Iterator<Item = &Observation> {
        self.resources.iter().filter_map(|resource| match resource {
            Resource::Observation(observation) => Some(observation),
            _ => None,
        })
    }

    fn medication_orders(&self) -> impl Iterator<Item = &MedicationOrder> {
        self.resources.iter().filter_map(|resource| match resource {
            Resource::MedicationOrder(order) => Some(order),
            _ => None,
        })
    }

    fn dispenses(&self) -> impl Iterator<Item = &MedicationDispense> {
        self.resources.iter().filter_map(|resource| match resource {
            Resource::MedicationDispense(dispense) => Some(dispense),
            _ => None,
        })
    }

    fn administrations(&self) -> impl Iterator<Item = &MedicationAdministration> {
        self.resources.iter().filter_map(|resource| match resource {
            Resource::MedicationAdministration(administration) => Some(administration),
            _ => None,
        })
    }
}

/// Outcome of checking one patient for one disorder.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Diagnosis {
    pub present: bool,
    pub onset: Option<DateTime<Utc>>,
}

/// One row of the cohort listing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CohortMember {
    pub id: String,
    pub name: String,
    pub onset: Option<DateTime<Utc>>,
}

/// Flat per-patient view for the JSON API: lab rows in bundle order
/// (undated rows retained with a null date) and statin dispense events.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PatientReport {
    pub patient_id: String,
    pub cholesterol_measurements: Vec<LabRecord>,
    pub glucose_measurements: Vec<LabRecord>,
    pub medication_dispenses: Vec<MedicationEvent>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LabRecord {
    pub date: Option<DateTime<Utc>>,
    pub code: String,
    pub value: f64,
    pub unit: String,
}

/// The record collection, loaded once and read-only afterwards.
#[derive(Debug, Default)]
pub struct RecordStore {
    bundles: Vec<PatientBundle>,
    index: HashMap<String, usize>,
}

impl RecordStore {
    /// Load the store from a JSON string.
    pub fn load_str(data: &str) -> Result<Self, ChartError> {
        let value: Value =
            serde_json::from_str(data).map_err(|err| ChartError::Parse(err.to_string()))?;
        Self::load_value(&value)
    }

    /// Load the store from an already-parsed JSON value: a top-level array
    /// of per-patient bundles, each an array of `{fullUrl, resource}`
    /// entries whose first resource is the Patient demographics.
    ///
    /// Malformed entries and bundles are skipped with a warning; they never
    /// abort the load.
    pub fn load_value(value: &Value) -> Result<Self, ChartError> {
        let bundles_json = value.as_array().ok_or_else(|| {
            ChartError::Parse("expected a top-level array of patient bundles".to_string())
        })?;

        let mut store = Self::default();
        for (position, bundle_json) in bundles_json.iter().enumerate() {
            let Some(entries) = bundle_json.as_array() else {
                tracing::warn!(position, "skipping non-array bundle");
                continue;
            };

            let mut resources = Vec::with_capacity(entries.len());
            for entry in entries {
                let Some(resource_json) = entry.get("resource") else {
                    tracing::debug!(position, "entry without a resource");
                    continue;
                };
                match serde_json::from_value::<Resource>(resource_json.clone()) {
                    Ok(resource) => resources.push(resource),
                    Err(err) => tracing::warn!(position, %err, "skipping malformed resource"),
                }
            }

            let Some(Resource::Patient(patient)) = resources.first().cloned() else {
                tracing::warn!(position, "bundle does not start with a Patient resource");
                continue;
            };
            let Some(id) = patient.id.clone() else {
                tracing::warn!(position, "patient resource without an id");
                continue;
            };
            if store.index.contains_key(&id) {
                tracing::warn!(patient = %id, "duplicate patient bundle ignored");
                continue;
            }

            store.index.insert(id.clone(), store.bundles.len());
            store.bundles.push(PatientBundle {
                id,
                patient,
                resources,
            });
        }

        Ok(store)
    }

    pub fn len(&self) -> usize {
        self.bundles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bundles.is_empty()
    }

    pub fn contains_patient(&self, patient_id: &str) -> bool {
        self.index.contains_key(patient_id)
    }

    pub fn patient_ids(&self) -> impl Iterator<Item = &str> {
        self.bundles.iter().map(|bundle| bundle.id.as_str())
    }

    fn bundle(&self, patient_id: &str) -> Result<&PatientBundle, ChartError> {
        self.index
            .get(patient_id)
            .map(|&position| &self.bundles[position])
            .ok_or_else(|| ChartError::PatientNotFound(patient_id.to_string()))
    }

    /// Given and family name parts joined, `"Unknown"` when absent.
    pub fn display_name(&self, patient_id: &str) -> Option<String> {
        let bundle = self.bundle(patient_id).ok()?;
        Some(display_name(&bundle.patient))
    }

    /// Whether a disorder is diagnosed, and the onset of the first
    /// qualifying Condition. A Condition qualifies when any coding code is
    /// in the disorder's code set, or its free text or any coding display
    /// mentions the disorder. Unknown patients read as not diagnosed.
    pub fn diagnosis(&self, patient_id: &str, disorder: Disorder) -> Diagnosis {
        let Ok(bundle) = self.bundle(patient_id) else {
            return Diagnosis {
                present: false,
                onset: None,
            };
        };

        for condition in bundle.conditions() {
            let Some(code) = condition.code.as_ref() else {
                continue;
            };
            if code.has_code_in(disorder.condition_codes()) || code.mentions(disorder.text_needle())
            {
                let onset = condition
                    .onset_date_time
                    .as_deref()
                    .and_then(|raw| parse_instant_logged(patient_id, "onsetDateTime", raw));
                return Diagnosis {
                    present: true,
                    onset,
                };
            }
        }

        Diagnosis {
            present: false,
            onset: None,
        }
    }

    /// Every known patient diagnosed with the disorder.
    pub fn cohort(&self, disorder: Disorder) -> HashSet<String> {
        self.patient_ids()
            .filter(|id| self.diagnosis(id, disorder).present)
            .map(str::to_string)
            .collect()
    }

    /// Cohort with display names and onset dates, sorted by patient id.
    pub fn cohort_roster(&self, disorder: Disorder) -> Vec<CohortMember> {
        let mut roster: Vec<CohortMember> = self
            .bundles
            .iter()
            .filter_map(|bundle| {
                let diagnosis = self.diagnosis(&bundle.id, disorder);
                diagnosis.present.then(|| CohortMember {
                    id: bundle.id.clone(),
                    name: display_name(&bundle.patient),
                    onset: diagnosis.onset,
                })
            })
            .collect();
        roster.sort_by(|a, b| a.id.cmp(&b.id));
        roster
    }

    /// All of a patient's observations in one assay category, grouped by
    /// code and exact timestamp. Every code of the category is present as a
    /// key even when it collected nothing; repeat readings at the same
    /// instant accumulate.
    pub fn measurements(
        &self,
        patient_id: &str,
        category: AssayCategory,
    ) -> Result<MeasurementTable, ChartError> {
        let bundle = self.bundle(patient_id)?;

        let mut table: MeasurementTable = category
            .codes()
            .iter()
            .map(|code| (code.to_string(), BTreeMap::new()))
            .collect();

        for observation in bundle.observations() {
            let Some(label) = observation.code.as_ref().and_then(CodeableConcept::label) else {
                continue;
            };
            let Some(readings) = table.get_mut(&label) else {
                continue;
            };

            let Some(raw) = observation.effective_date_time.as_deref() else {
                tracing::debug!(patient = patient_id, code = %label, "observation without a date");
                continue;
            };
            let Some(at) = parse_instant_logged(patient_id, "effectiveDateTime", raw) else {
                continue;
            };
            let Some(value) = observation.value_quantity.as_ref().and_then(|q| q.value) else {
                continue;
            };
            let unit = observation
                .value_quantity
                .as_ref()
                .and_then(|q| q.unit.clone())
                .unwrap_or_default();

            readings
                .entry(at)
                .or_default()
                .push(MeasurementPoint { value, unit });
        }

        Ok(table)
    }

    /// Medication orders matching the disorder's fixed code set, keyed by
    /// code (every code present, defaulting to empty). The event date is
    /// the dosage instruction's bounds-period start when one parses.
    pub fn medications(
        &self,
        patient_id: &str,
        disorder: Disorder,
    ) -> Result<MedicationTable, ChartError> {
        let bundle = self.bundle(patient_id)?;

        let mut table: MedicationTable = disorder
            .medication_codes()
            .iter()
            .map(|code| (code.to_string(), Vec::new()))
            .collect();

        for order in bundle.medication_orders() {
            let Some(medication) = order.medication.as_ref() else {
                continue;
            };
            let Some(code) = medication.first_code() else {
                continue;
            };
            let Some(events) = table.get_mut(code) else {
                continue;
            };

            let date = order
                .dosage_instruction
                .first()
                .and_then(|dosage| dosage.timing.as_ref())
                .and_then(|timing| timing.repeat.as_ref())
                .and_then(|repeat| repeat.bounds_period.as_ref())
                .and_then(|period| period.start.as_deref())
                .and_then(|raw| parse_instant_logged(patient_id, "boundsPeriod.start", raw));
            let dosage = order
                .dosage_instruction
                .first()
                .and_then(|dosage| dosage.text.clone())
                .unwrap_or_else(|| NO_INSTRUCTIONS.to_string());
            let name = medication.label().unwrap_or_else(|| code.to_string());

            events.push(MedicationEvent { date, name, dosage });
        }

        Ok(table)
    }

    /// The alternate extraction mode over dispense and administration
    /// resources: medication text mentioning "statin", dated by the
    /// handed-over or administration time, undated events first. Kept
    /// deliberately separate from [`RecordStore::medications`].
    pub fn statin_dispenses(&self, patient_id: &str) -> Result<Vec<MedicationEvent>, ChartError> {
        let bundle = self.bundle(patient_id)?;
        let mut events = Vec::new();

        for dispense in bundle.dispenses() {
            let Some(name) = dispense.medication.as_ref().and_then(CodeableConcept::label) else {
                continue;
            };
            if !name.to_lowercase().contains("statin") {
                continue;
            }
            let date = dispense
                .when_handed_over
                .as_deref()
                .and_then(|raw| parse_instant_logged(patient_id, "whenHandedOver", raw));
            let dosage = dispense
                .dosage_instruction
                .first()
                .and_then(|dosage| dosage.text.clone())
                .unwrap_or_else(|| NO_INSTRUCTIONS.to_string());
            events.push(MedicationEvent { date, name, dosage });
        }

        for administration in bundle.administrations() {
            let Some(name) = administration
                .medication
                .as_ref()
                .and_then(CodeableConcept::label)
            else {
                continue;
            };
            if !name.to_lowercase().contains("statin") {
                continue;
            }
            let date = administration
                .effective_time_date_time
                .as_deref()
                .and_then(|raw| parse_instant_logged(patient_id, "effectiveTimeDateTime", raw));
            events.push(MedicationEvent {
                date,
                name,
                dosage: NO_INSTRUCTIONS.to_string(),
            });
        }

        events.sort_by_key(|event| (event.date.is_some(), event.date));
        Ok(events)
    }

    /// Age-adjusted threshold pairs for shading a chart: desirable total
    /// cholesterol below age 20, the adult range after. Sampled at the
    /// birth date, the age-20 boundary, every cholesterol measurement
    /// date, and now; ascending and de-duplicated. `Ok(None)` for
    /// disorders without defined bands.
    pub fn reference_bands(
        &self,
        patient_id: &str,
        disorder: Disorder,
    ) -> Result<Option<ReferenceBands>, ChartError> {
        if disorder != Disorder::Hyperlipidemia {
            return Ok(None);
        }

        let bundle = self.bundle(patient_id)?;
        let birth = bundle
            .patient
            .birth_date
            .as_deref()
            .and_then(|raw| parse_day(raw).ok())
            .ok_or_else(|| ChartError::BirthDateUnavailable(patient_id.to_string()))?;
        let birth = Utc.from_utc_datetime(&birth.and_time(NaiveTime::MIN));

        let mut samples = vec![
            birth,
            birth + Duration::days(ADULT_AGE_YEARS * 365),
            Utc::now(),
        ];
        let cholesterol = self.measurements(patient_id, AssayCategory::Cholesterol)?;
        samples.extend(
            cholesterol
                .values()
                .flat_map(|readings| readings.keys().copied()),
        );

        let bands: ReferenceBands = samples
            .into_iter()
            .map(|date| (date, band_at(birth, date)))
            .collect();
        Ok(Some(bands))
    }

    /// Flat lab and medication view of one hyperlipidemia cohort member.
    /// Undated lab rows are retained with a null date rather than dropped.
    pub fn patient_report(&self, patient_id: &str) -> Result<PatientReport, ChartError> {
        let bundle = self.bundle(patient_id)?;
        if !self.diagnosis(patient_id, Disorder::Hyperlipidemia).present {
            return Err(ChartError::NotInCohort(patient_id.to_string()));
        }

        let mut cholesterol = Vec::new();
        let mut glucose = Vec::new();
        for observation in bundle.observations() {
            let Some(label) = observation.code.as_ref().and_then(CodeableConcept::label) else {
                continue;
            };
            let target = if AssayCategory::Cholesterol.codes().contains(&label.as_str()) {
                &mut cholesterol
            } else if AssayCategory::Glucose.codes().contains(&label.as_str()) {
                &mut glucose
            } else {
                continue;
            };

            let Some(value) = observation.value_quantity.as_ref().and_then(|q| q.value) else {
                continue;
            };
            let date = observation
                .effective_date_time
                .as_deref()
                .and_then(|raw| parse_instant(raw).ok());
            target.push(LabRecord {
                date,
                code: label,
                value,
                unit: observation
                    .value_quantity
                    .as_ref()
                    .and_then(|q| q.unit.clone())
                    .unwrap_or_default(),
            });
        }

        Ok(PatientReport {
            patient_id: patient_id.to_string(),
            cholesterol_measurements: cholesterol,
            glucose_measurements: glucose,
            medication_dispenses: self.statin_dispenses(patient_id)?,
        })
    }
}

/// Age in 365-day years at which the adult cholesterol band applies.
const ADULT_AGE_YEARS: i64 = 20;

fn band_at(birth: DateTime<Utc>, date: DateTime<Utc>) -> Band {
    let age_years = date.signed_duration_since(birth).num_days() as f64 / 365.0;
    if age_years < ADULT_AGE_YEARS as f64 {
        Band {
            lower: 170.0,
            upper: 199.0,
        }
    } else {
        Band {
            lower: 199.0,
            upper: 239.0,
        }
    }
}

fn display_name(patient: &Patient) -> String {
    let Some(name) = patient.name.first() else {
        return "Unknown".to_string();
    };
    let full = format!("{} {}", name.given.join(" "), name.family.join(" "))
        .trim()
        .to_string();
    if full.is_empty() {
        "Unknown".to_string()
    } else {
        full
    }
}

/// Marker for a date field that did not parse. The owning resource keeps
/// its other fields but stays out of every date-indexed structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MalformedDate;

/// Parse a FHIR instant: RFC 3339 first, then a naive datetime, then a
/// bare date taken as UTC midnight.
pub fn parse_instant(raw: &str) -> Result<DateTime<Utc>, MalformedDate> {
    if let Ok(at) = DateTime::parse_from_rfc3339(raw) {
        return Ok(at.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S") {
        return Ok(Utc.from_utc_datetime(&naive));
    }
    parse_day(raw).map(|day| Utc.from_utc_datetime(&day.and_time(NaiveTime::MIN)))
}

/// Parse a bare `YYYY-MM-DD` calendar date.
pub fn parse_day(raw: &str) -> Result<NaiveDate, MalformedDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|_| MalformedDate)
}

fn parse_instant_logged(patient_id: &str, field: &str, raw: &str) -> Option<DateTime<Utc>> {
    match parse_instant(raw) {
        Ok(at) => Some(at),
        Err(MalformedDate) => {
            tracing::warn!(
                patient = patient_id,
                field,
                raw,
                "unparseable date, excluded from date-indexed output"
            );
            None
        }
    }
}
