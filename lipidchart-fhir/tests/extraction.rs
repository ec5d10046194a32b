use std::collections::HashSet;
use std::fs;

use chrono::{DateTime, Duration, Utc};
use lipidchart_core::{compose, AssayCategory, ChartConfig, ChartError, Disorder, NO_INSTRUCTIONS};
use lipidchart_fhir::{parse_instant, RecordStore};

fn fixture_path(name: &str) -> String {
    format!("{}/tests/data/{name}", env!("CARGO_MANIFEST_DIR"))
}

fn load_store() -> RecordStore {
    let data = fs::read_to_string(fixture_path("records.json")).expect("fixture readable");
    RecordStore::load_str(&data).expect("fixture parses")
}

fn at(raw: &str) -> DateTime<Utc> {
    parse_instant(raw).expect("valid test date")
}

#[test]
fn loader_skips_bundles_without_a_leading_patient() {
    let store = load_store();
    assert_eq!(store.len(), 4);
    for id in ["1001", "1002", "1003", "1004"] {
        assert!(store.contains_patient(id));
    }
    assert!(!store.contains_patient("9999"));
}

#[test]
fn cohort_is_a_duplicate_free_subset_of_known_patients() {
    let store = load_store();
    let known: HashSet<String> = store.patient_ids().map(str::to_string).collect();

    let cohort = store.cohort(Disorder::Hyperlipidemia);
    assert!(cohort.is_subset(&known));
    assert_eq!(
        cohort,
        HashSet::from(["1001".to_string(), "1003".to_string(), "1004".to_string()])
    );

    assert_eq!(
        store.cohort(Disorder::Diabetes),
        HashSet::from(["1002".to_string()])
    );
}

#[test]
fn diagnosis_matches_free_text_and_returns_onset() {
    let store = load_store();
    let diagnosis = store.diagnosis("1001", Disorder::Hyperlipidemia);
    assert!(diagnosis.present);
    assert_eq!(diagnosis.onset, Some(at("2009-11-02T00:00:00-05:00")));
}

#[test]
fn diagnosis_matches_on_code_alone() {
    // Patient 1003's Condition display text never mentions the disorder;
    // only the SNOMED code qualifies it.
    let store = load_store();
    let diagnosis = store.diagnosis("1003", Disorder::Hyperlipidemia);
    assert!(diagnosis.present);
    assert_eq!(diagnosis.onset, None);
}

#[test]
fn unknown_patients_read_as_absent_without_raising() {
    let store = load_store();

    let diagnosis = store.diagnosis("9999", Disorder::Hyperlipidemia);
    assert!(!diagnosis.present);
    assert_eq!(diagnosis.onset, None);

    assert!(matches!(
        store.measurements("9999", AssayCategory::Cholesterol),
        Err(ChartError::PatientNotFound(_))
    ));
    assert_eq!(store.display_name("9999"), None);
}

#[test]
fn every_category_code_is_keyed_even_when_empty() {
    let store = load_store();

    let cholesterol = store
        .measurements("1003", AssayCategory::Cholesterol)
        .expect("known patient");
    let keys: Vec<&str> = cholesterol.keys().map(String::as_str).collect();
    assert_eq!(keys, AssayCategory::Cholesterol.codes());
    assert!(cholesterol.values().all(|readings| readings.is_empty()));

    let glucose = store
        .measurements("1001", AssayCategory::Glucose)
        .expect("known patient");
    assert_eq!(glucose.len(), AssayCategory::Glucose.codes().len());
}

#[test]
fn same_instant_readings_accumulate_instead_of_overwriting() {
    let store = load_store();
    let cholesterol = store
        .measurements("1001", AssayCategory::Cholesterol)
        .expect("known patient");

    let readings = &cholesterol["Cholest SerPl-mCnc"][&at("2010-03-15T08:30:00Z")];
    let values: Vec<f64> = readings.iter().map(|point| point.value).collect();
    assert_eq!(values, vec![210.0, 214.0]);
}

#[test]
fn malformed_dates_stay_out_of_the_table_but_not_the_report() {
    let store = load_store();

    let cholesterol = store
        .measurements("1001", AssayCategory::Cholesterol)
        .expect("known patient");
    // The 999 reading with an unparseable date never enters the table.
    let dates: Vec<&DateTime<Utc>> = cholesterol["Cholest SerPl-mCnc"].keys().collect();
    assert_eq!(dates, vec![&at("2010-03-15T08:30:00Z"), &at("2011-06-20")]);

    let report = store.patient_report("1001").expect("cohort member");
    assert_eq!(report.cholesterol_measurements.len(), 5);
    let undated: Vec<_> = report
        .cholesterol_measurements
        .iter()
        .filter(|record| record.date.is_none())
        .collect();
    assert_eq!(undated.len(), 1);
    assert_eq!(undated[0].value, 999.0);
}

#[test]
fn medication_orders_match_the_fixed_code_set() {
    let store = load_store();
    let medications = store
        .medications("1001", Disorder::Hyperlipidemia)
        .expect("known patient");

    let keys: Vec<&str> = medications.keys().map(String::as_str).collect();
    assert_eq!(keys, Disorder::Hyperlipidemia.medication_codes());

    let simvastatin = &medications["312961"];
    assert_eq!(simvastatin.len(), 1);
    assert_eq!(simvastatin[0].date, Some(at("2010-02-01")));
    assert_eq!(simvastatin[0].name, "Simvastatin 40 MG Oral Tablet");
    assert_eq!(simvastatin[0].dosage, "Take one tablet daily");

    // An order without dosage instructions keeps a slot with the sentinel.
    let atorvastatin = &medications["198211"];
    assert_eq!(atorvastatin.len(), 1);
    assert_eq!(atorvastatin[0].date, None);
    assert_eq!(atorvastatin[0].dosage, NO_INSTRUCTIONS);

    // The amlodipine order is outside the code set entirely.
    let total: usize = medications.values().map(Vec::len).sum();
    assert_eq!(total, 2);
}

#[test]
fn statin_text_mode_sorts_undated_events_first() {
    let store = load_store();
    let events = store.statin_dispenses("1001").expect("known patient");

    assert_eq!(events.len(), 3);
    assert_eq!(events[0].date, None);
    assert_eq!(events[0].name, "Rosuvastatin 10 MG Oral Tablet");
    assert_eq!(events[1].date, Some(at("2010-02-03T00:00:00Z")));
    assert_eq!(events[1].dosage, "One tablet by mouth");
    assert_eq!(events[2].date, Some(at("2011-01-05T09:00:00Z")));
    assert_eq!(events[2].dosage, NO_INSTRUCTIONS);
}

#[test]
fn reference_bands_carry_sentinels_and_measurement_dates() {
    let store = load_store();
    let bands = store
        .reference_bands("1001", Disorder::Hyperlipidemia)
        .expect("known patient")
        .expect("defined for hyperlipidemia");

    let birth = at("1975-04-02");
    let age_20 = birth + Duration::days(20 * 365);
    // Birth, age-20 boundary, two measurement dates, and "now".
    assert_eq!(bands.len(), 5);
    assert_eq!(bands.keys().next(), Some(&birth));
    assert!(bands.contains_key(&age_20));
    assert!(bands.contains_key(&at("2010-03-15T08:30:00Z")));
    assert!(bands.contains_key(&at("2011-06-20")));

    assert_eq!(bands[&birth].lower, 170.0);
    assert_eq!(bands[&birth].upper, 199.0);
    // Exactly 20 years old already reads as adult.
    assert_eq!(bands[&age_20].lower, 199.0);
    assert_eq!(bands[&age_20].upper, 239.0);
}

#[test]
fn reference_bands_without_measurements_keep_birth_and_now() {
    let store = load_store();
    let bands = store
        .reference_bands("1004", Disorder::Hyperlipidemia)
        .expect("known patient")
        .expect("defined for hyperlipidemia");

    let birth = at("2010-01-20");
    assert_eq!(bands.len(), 3);
    assert_eq!(bands.keys().next(), Some(&birth));
    // The trailing sentinel is the evaluation instant; the patient is
    // still under 20 there.
    let (last, band) = bands.iter().next_back().expect("non-empty");
    assert!(*last > at("2024-01-01"));
    assert_eq!(band.lower, 170.0);
}

#[test]
fn reference_bands_need_a_birth_date() {
    let store = load_store();
    assert!(matches!(
        store.reference_bands("1003", Disorder::Hyperlipidemia),
        Err(ChartError::BirthDateUnavailable(_))
    ));
}

#[test]
fn reference_bands_are_undefined_for_other_disorders() {
    let store = load_store();
    let bands = store
        .reference_bands("1002", Disorder::Diabetes)
        .expect("known patient");
    assert!(bands.is_none());
}

#[test]
fn patient_report_gates_on_the_cohort() {
    let store = load_store();

    assert!(matches!(
        store.patient_report("1002"),
        Err(ChartError::NotInCohort(_))
    ));
    assert!(matches!(
        store.patient_report("9999"),
        Err(ChartError::PatientNotFound(_))
    ));

    let report = store.patient_report("1001").expect("cohort member");
    assert_eq!(report.patient_id, "1001");
    assert_eq!(report.medication_dispenses.len(), 3);
    assert_eq!(report.glucose_measurements.len(), 1);
}

#[test]
fn roster_is_sorted_by_id_with_display_names() {
    let store = load_store();
    let roster = store.cohort_roster(Disorder::Hyperlipidemia);

    let ids: Vec<&str> = roster.iter().map(|member| member.id.as_str()).collect();
    assert_eq!(ids, vec!["1001", "1003", "1004"]);
    let names: Vec<&str> = roster.iter().map(|member| member.name.as_str()).collect();
    assert_eq!(names, vec!["Ana Sommer", "Cleo Marsh", "Dag Olsen"]);
    assert_eq!(roster[0].onset, Some(at("2009-11-02T00:00:00-05:00")));
}

#[test]
fn extraction_feeds_composition_end_to_end() {
    let store = load_store();

    let mut measurements = store
        .measurements("1001", AssayCategory::Glucose)
        .expect("known patient");
    measurements.extend(
        store
            .measurements("1001", AssayCategory::Cholesterol)
            .expect("known patient"),
    );
    let medications = store
        .medications("1001", Disorder::Hyperlipidemia)
        .expect("known patient");
    let bands = store
        .reference_bands("1001", Disorder::Hyperlipidemia)
        .expect("known patient");

    let view = compose(
        &measurements,
        &medications,
        bands.as_ref(),
        &ChartConfig::default(),
    )
    .expect("plottable data");

    // Three series carry data; the earliest date is the simvastatin order.
    assert_eq!(view.series.len(), 3);
    assert_eq!(view.markers.len(), 1);
    assert_eq!(view.markers[0].name, "Simvastatin 40 MG Oral Tablet");
    assert_eq!(
        view.window,
        (
            at("2010-02-01") - Duration::days(8),
            at("2011-06-20") + Duration::days(8)
        )
    );
    assert!(view.bands.is_some());
}
