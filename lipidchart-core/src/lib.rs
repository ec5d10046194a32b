//! Domain types and series composition for the lipid chart engine.

mod chart;

pub use chart::compose;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Dosage text recorded when a medication order carries no instructions.
pub const NO_INSTRUCTIONS: &str = "no instructions provided";

/// A disorder the resolver and extractors know how to look for.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Disorder {
    Hyperlipidemia,
    Diabetes,
}

impl Disorder {
    /// Diagnostic identifiers that qualify a Condition for this disorder.
    pub fn condition_codes(self) -> &'static [&'static str] {
        match self {
            Disorder::Hyperlipidemia => &["55822004", "E78.5", "272.4"],
            Disorder::Diabetes => &["73211009", "44054006", "46635009"],
        }
    }

    /// Stem matched case-insensitively against diagnosis free text and
    /// coding display text.
    pub fn text_needle(self) -> &'static str {
        match self {
            Disorder::Hyperlipidemia => "hyperlip",
            Disorder::Diabetes => "diabetes",
        }
    }

    /// RxNorm codes of the medications prescribed against this disorder.
    pub fn medication_codes(self) -> &'static [&'static str] {
        match self {
            Disorder::Hyperlipidemia => {
                &["198211", "262095", "312961", "543354", "617318", "859749"]
            }
            Disorder::Diabetes => &[],
        }
    }
}

/// A lab-assay category with a fixed set of recognized test codes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AssayCategory {
    Cholesterol,
    Glucose,
}

impl AssayCategory {
    /// Test codes recognized for this category.
    pub fn codes(self) -> &'static [&'static str] {
        match self {
            AssayCategory::Cholesterol => &["Cholest SerPl-mCnc", "Trigl SerPl-mCnc"],
            AssayCategory::Glucose => &[
                "Glucose SerPl-mCnc",
                "Glucose Bld-mCnc",
                "Glucose Ur Strip-mCnc",
                "Glucose CSF-mCnc",
                "Glucose p fast SerPl-mCnc",
            ],
        }
    }
}

/// One reading of a lab assay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementPoint {
    pub value: f64,
    pub unit: String,
}

/// Readings per code, keyed by the exact timestamp of the draw. Repeat
/// readings at the same instant accumulate in the same list.
pub type MeasurementTable = BTreeMap<String, BTreeMap<DateTime<Utc>, Vec<MeasurementPoint>>>;

/// A medication order, dispense, or administration event. The date is
/// absent when the source resource carried none that parsed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MedicationEvent {
    pub date: Option<DateTime<Utc>>,
    pub name: String,
    pub dosage: String,
}

/// Medication events per medication code.
pub type MedicationTable = BTreeMap<String, Vec<MedicationEvent>>;

/// An age-dependent clinical threshold pair for a lab value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Band {
    pub lower: f64,
    pub upper: f64,
}

/// Threshold pairs sampled at discrete dates, ascending and de-duplicated.
pub type ReferenceBands = BTreeMap<DateTime<Utc>, Band>;

/// Display toggles and the optional explicit date window for composition.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ChartConfig {
    /// Resample each series through a quadratic spline before plotting.
    pub smooth: bool,
    /// Attach unit text to each plotted point.
    pub show_units: bool,
    /// Explicit x-axis bounds; computed from the data when absent.
    pub window: Option<(DateTime<Utc>, DateTime<Utc>)>,
}

/// Which of the two value axes a series rides on.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AxisKind {
    Cholesterol,
    Glucose,
}

/// Marker glyph the renderer should draw for a series' points.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MarkerShape {
    Triangle,
    Circle,
}

/// An RGB color picked from the fixed chart palette.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

/// One plotted point; `unit` is set when unit labels were requested.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlotPoint {
    pub at: DateTime<Utc>,
    pub value: f64,
    pub unit: Option<String>,
}

/// One measurement series ready to draw.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartSeries {
    pub code: String,
    pub axis: AxisKind,
    pub marker: MarkerShape,
    pub color: Color,
    pub points: Vec<PlotPoint>,
    /// Spline-resampled polyline, present only when smoothing was applied.
    pub smoothed: Option<Vec<PlotPoint>>,
}

/// Vertical marker for one dated medication event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MedicationMarker {
    pub at: DateTime<Utc>,
    pub code: String,
    pub name: String,
    pub dosage: String,
    pub color: Color,
}

/// Inclusive numeric range of one value axis.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AxisRange {
    pub min: f64,
    pub max: f64,
}

/// The composed, date-bounded view handed to an external renderer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartView {
    pub window: (DateTime<Utc>, DateTime<Utc>),
    pub cholesterol_axis: AxisRange,
    pub glucose_axis: AxisRange,
    pub series: Vec<ChartSeries>,
    pub markers: Vec<MedicationMarker>,
    pub bands: Option<ReferenceBands>,
}

impl ChartView {
    /// Series assigned to one axis.
    pub fn series_on(&self, axis: AxisKind) -> impl Iterator<Item = &ChartSeries> {
        self.series.iter().filter(move |series| series.axis == axis)
    }
}

/// Errors surfaced by store access, extraction, and composition.
#[derive(Debug, thiserror::Error)]
pub enum ChartError {
    #[error("failed to parse record store: {0}")]
    Parse(String),
    #[error("patient {0} not found")]
    PatientNotFound(String),
    #[error("patient {0} is not in the hyperlipidemia cohort")]
    NotInCohort(String),
    #[error("patient {0} has no usable birth date")]
    BirthDateUnavailable(String),
    #[error("no dated measurements or medication events to plot")]
    NoPlottableData,
}
