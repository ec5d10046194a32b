//! Series composition: merges measurements, medication events, and
//! reference bands into one date-bounded, axis-scaled chart view.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};

use crate::{
    AxisKind, AxisRange, ChartConfig, ChartError, ChartSeries, ChartView, Color, MarkerShape,
    MeasurementPoint, MeasurementTable, MedicationMarker, MedicationTable, PlotPoint,
    ReferenceBands,
};

/// Days of padding added on each side of a computed date window.
const WINDOW_PAD_DAYS: i64 = 8;

/// Positions sampled when a series is smoothed.
const SMOOTH_SAMPLES: usize = 300;

// Dual-axis coupling pinned so cholesterol 199 aligns with glucose 100 and
// cholesterol 239 with glucose 125.
const COUPLE_SLOPE: f64 = (125.0 - 100.0) / (239.0 - 199.0);
const COUPLE_INTERCEPT: f64 = 125.0 - COUPLE_SLOPE * 239.0;

/// Chart palette, sampled evenly across for the number of codes in play.
const PALETTE: [Color; 20] = [
    Color { r: 0x31, g: 0x82, b: 0xbd },
    Color { r: 0x6b, g: 0xae, b: 0xd6 },
    Color { r: 0x9e, g: 0xca, b: 0xe1 },
    Color { r: 0xc6, g: 0xdb, b: 0xef },
    Color { r: 0xe6, g: 0x55, b: 0x0d },
    Color { r: 0xfd, g: 0x8d, b: 0x3c },
    Color { r: 0xfd, g: 0xae, b: 0x6b },
    Color { r: 0xfd, g: 0xd0, b: 0xa2 },
    Color { r: 0x31, g: 0xa3, b: 0x54 },
    Color { r: 0x74, g: 0xc4, b: 0x76 },
    Color { r: 0xa1, g: 0xd9, b: 0x9b },
    Color { r: 0xc7, g: 0xe9, b: 0xc0 },
    Color { r: 0x75, g: 0x6b, b: 0xb1 },
    Color { r: 0x9e, g: 0x9a, b: 0xc8 },
    Color { r: 0xbc, g: 0xbd, b: 0xdc },
    Color { r: 0xda, g: 0xda, b: 0xeb },
    Color { r: 0x63, g: 0x63, b: 0x63 },
    Color { r: 0x96, g: 0x96, b: 0x96 },
    Color { r: 0xbd, g: 0xbd, b: 0xbd },
    Color { r: 0xd9, g: 0xd9, b: 0xd9 },
];

/// Merge extracted measurements, medication events, and optional reference
/// bands into a renderable view.
///
/// Fails with [`ChartError::NoPlottableData`] when both tables are empty,
/// or when nothing carries a date and no explicit window was configured —
/// the caller renders a "no data" state instead of an empty chart.
pub fn compose(
    measurements: &MeasurementTable,
    medications: &MedicationTable,
    bands: Option<&ReferenceBands>,
    config: &ChartConfig,
) -> Result<ChartView, ChartError> {
    let has_measurements = measurements.values().any(|readings| !readings.is_empty());
    let has_medications = medications.values().any(|events| !events.is_empty());
    if !has_measurements && !has_medications {
        return Err(ChartError::NoPlottableData);
    }

    let window = match config.window {
        Some(window) => window,
        None => data_window(measurements, medications).ok_or(ChartError::NoPlottableData)?,
    };

    let colors = assign_colors(measurements, medications);

    let mut series = Vec::new();
    let mut cholesterol_values = Vec::new();
    let mut glucose_values = Vec::new();
    for (code, readings) in measurements {
        if readings.is_empty() {
            continue;
        }

        let axis = axis_for(code);
        let points: Vec<PlotPoint> = readings
            .iter()
            .filter(|(_, entries)| !entries.is_empty())
            .map(|(at, entries)| PlotPoint {
                at: *at,
                value: mean_value(entries),
                unit: if config.show_units {
                    entries.first().map(|entry| entry.unit.clone())
                } else {
                    None
                },
            })
            .collect();

        match axis {
            AxisKind::Cholesterol => {
                cholesterol_values.extend(points.iter().map(|point| point.value))
            }
            AxisKind::Glucose => glucose_values.extend(points.iter().map(|point| point.value)),
        }

        let smoothed = if config.smooth && points.len() > 2 {
            Some(resample_spline(&points))
        } else {
            None
        };

        series.push(ChartSeries {
            code: code.clone(),
            axis,
            marker: match axis {
                AxisKind::Cholesterol => MarkerShape::Triangle,
                AxisKind::Glucose => MarkerShape::Circle,
            },
            color: colors[code.as_str()],
            points,
            smoothed,
        });
    }

    let (cholesterol_axis, glucose_axis) = scale_axes(
        value_extent(&cholesterol_values),
        value_extent(&glucose_values),
        bands.is_some(),
    );

    Ok(ChartView {
        window,
        cholesterol_axis,
        glucose_axis,
        series,
        markers: medication_markers(medications, &colors),
        bands: bands.cloned(),
    })
}

/// Overall date window: min/max over every measurement date and every dated
/// medication event, padded by eight days on each side. `None` when nothing
/// carries a date.
fn data_window(
    measurements: &MeasurementTable,
    medications: &MedicationTable,
) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let mut dates: Vec<DateTime<Utc>> = measurements
        .values()
        .flat_map(|readings| readings.keys().copied())
        .collect();
    dates.extend(
        medications
            .values()
            .flatten()
            .filter_map(|event| event.date),
    );

    let first = dates.iter().min().copied()?;
    let last = dates.iter().max().copied()?;
    let pad = Duration::days(WINDOW_PAD_DAYS);
    Some((first - pad, last + pad))
}

/// One distinct palette color per code, measurement codes first, medication
/// codes after, stable for a given input.
fn assign_colors(
    measurements: &MeasurementTable,
    medications: &MedicationTable,
) -> HashMap<String, Color> {
    let codes: Vec<&String> = measurements.keys().chain(medications.keys()).collect();
    let count = codes.len();
    codes
        .into_iter()
        .enumerate()
        .map(|(index, code)| (code.clone(), palette_color(index, count)))
        .collect()
}

fn palette_color(index: usize, count: usize) -> Color {
    if count <= 1 {
        return PALETTE[0];
    }
    let slot = index * (PALETTE.len() - 1) / (count - 1);
    PALETTE[slot.min(PALETTE.len() - 1)]
}

fn axis_for(code: &str) -> AxisKind {
    if code.to_uppercase().contains("CHOLEST") {
        AxisKind::Cholesterol
    } else {
        AxisKind::Glucose
    }
}

/// Same-instant repeat readings are averaged into one plotted value.
fn mean_value(entries: &[MeasurementPoint]) -> f64 {
    entries.iter().map(|entry| entry.value).sum::<f64>() / entries.len() as f64
}

fn value_extent(values: &[f64]) -> Option<(f64, f64)> {
    let first = values.first()?;
    Some(values.iter().fold((*first, *first), |(lo, hi), value| {
        (lo.min(*value), hi.max(*value))
    }))
}

/// Axis ranges: each axis spans its own values with a 10% margin, falling
/// back to a fixed range when empty. With reference bands present the
/// cholesterol range is widened (never shrunk) until its linear image
/// contains the glucose range, and the glucose axis becomes exactly that
/// image.
fn scale_axes(
    cholesterol: Option<(f64, f64)>,
    glucose: Option<(f64, f64)>,
    coupled: bool,
) -> (AxisRange, AxisRange) {
    let primary = match cholesterol {
        Some((lo, hi)) => (lo * 0.9, hi * 1.1),
        None => (0.0, 300.0),
    };
    let secondary = match glucose {
        Some((lo, hi)) => (lo * 0.9, hi * 1.1),
        None => (0.0, 200.0),
    };

    if coupled {
        couple_axes(primary, secondary)
    } else {
        (
            AxisRange {
                min: primary.0,
                max: primary.1,
            },
            AxisRange {
                min: secondary.0,
                max: secondary.1,
            },
        )
    }
}

fn couple_axes(mut primary: (f64, f64), secondary: (f64, f64)) -> (AxisRange, AxisRange) {
    if secondary.0 < COUPLE_SLOPE * primary.0 + COUPLE_INTERCEPT {
        primary.0 = (secondary.0 - COUPLE_INTERCEPT) / COUPLE_SLOPE;
    }
    if secondary.1 > COUPLE_SLOPE * primary.1 + COUPLE_INTERCEPT {
        primary.1 = (secondary.1 - COUPLE_INTERCEPT) / COUPLE_SLOPE;
    }

    (
        AxisRange {
            min: primary.0,
            max: primary.1,
        },
        AxisRange {
            min: COUPLE_SLOPE * primary.0 + COUPLE_INTERCEPT,
            max: COUPLE_SLOPE * primary.1 + COUPLE_INTERCEPT,
        },
    )
}

/// One vertical marker per dated medication event, de-duplicated on
/// (date, name), chronological.
fn medication_markers(
    medications: &MedicationTable,
    colors: &HashMap<String, Color>,
) -> Vec<MedicationMarker> {
    let mut seen = HashSet::new();
    let mut markers = Vec::new();
    for (code, events) in medications {
        for event in events {
            let Some(at) = event.date else {
                continue;
            };
            if seen.insert((at, event.name.clone())) {
                markers.push(MedicationMarker {
                    at,
                    code: code.clone(),
                    name: event.name.clone(),
                    dosage: event.dosage.clone(),
                    color: colors[code.as_str()],
                });
            }
        }
    }
    markers.sort_by_key(|marker| marker.at);
    markers
}

/// Resample a series through a quadratic interpolating spline with a
/// continuous first derivative, at evenly spaced positions over the
/// series' own date extent. Expects at least 3 strictly ascending points.
fn resample_spline(points: &[PlotPoint]) -> Vec<PlotPoint> {
    let xs: Vec<f64> = points
        .iter()
        .map(|point| point.at.timestamp() as f64)
        .collect();
    let ys: Vec<f64> = points.iter().map(|point| point.value).collect();
    let n = xs.len();

    // Knot slopes: z_0 follows the first secant, then z_{i+1} = 2 s_i - z_i
    // keeps the derivative continuous across segments.
    let mut z = vec![0.0; n];
    z[0] = (ys[1] - ys[0]) / (xs[1] - xs[0]);
    for i in 0..n - 1 {
        let secant = (ys[i + 1] - ys[i]) / (xs[i + 1] - xs[i]);
        z[i + 1] = 2.0 * secant - z[i];
    }

    let step = (xs[n - 1] - xs[0]) / (SMOOTH_SAMPLES - 1) as f64;
    let mut segment = 0;
    let mut resampled = Vec::with_capacity(SMOOTH_SAMPLES);
    for sample in 0..SMOOTH_SAMPLES {
        let x = xs[0] + step * sample as f64;
        while segment + 2 < n && x > xs[segment + 1] {
            segment += 1;
        }
        let width = xs[segment + 1] - xs[segment];
        let offset = x - xs[segment];
        let curvature = (z[segment + 1] - z[segment]) / (2.0 * width);
        let value = ys[segment] + z[segment] * offset + curvature * offset * offset;
        let at = DateTime::from_timestamp(x as i64, 0).unwrap_or(points[n - 1].at);
        resampled.push(PlotPoint {
            at,
            value,
            unit: None,
        });
    }
    resampled
}
